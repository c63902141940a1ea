//! Gradient synchronisation across data-parallel processes.
//!
//! Every optimizer step first hands its gradients to a [`GradientSync`]. The
//! process bootstrap that supplies a real all-reduce lives outside this crate;
//! a single process uses [`SingleProcess`].

use crate::model::tacotron2::Tacotron2;
use anyhow::Result;
use burn::{optim::GradientsParams, tensor::backend::AutodiffBackend};

/// All-reduce hook run before gradient clipping and the optimizer step.
pub trait GradientSync<B: AutodiffBackend> {
    /// Return gradients averaged over all participating processes.
    fn all_reduce(&self, grads: GradientsParams, model: &Tacotron2<B>) -> Result<GradientsParams>;

    /// Number of participating processes.
    fn world_size(&self) -> usize;
}

/// Identity synchronisation for a single process.
#[derive(Debug, Default, Clone, Copy)]
pub struct SingleProcess;

impl<B: AutodiffBackend> GradientSync<B> for SingleProcess {
    fn all_reduce(&self, grads: GradientsParams, _model: &Tacotron2<B>) -> Result<GradientsParams> {
        Ok(grads)
    }

    fn world_size(&self) -> usize {
        1
    }
}
