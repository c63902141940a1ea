//! Gradient clipping by global L2 norm per named parameter group.

use crate::model::tacotron2::Tacotron2;
use burn::{
    module::{Module, ModuleVisitor, Param},
    optim::GradientsParams,
    tensor::{backend::AutodiffBackend, ElementConversion, Tensor},
};

/// Parameter groups clipped independently, in logging order.
pub const PARAMETER_GROUPS: [&str; 6] = [
    "embedding",
    "encoder",
    "decoder",
    "postnet",
    "speaker",
    "style",
];

/// Accumulates the squared L2 norm of gradients present for visited parameters.
struct SquaredNorm<'a> {
    grads: &'a GradientsParams,
    total: f64,
    seen: usize,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for SquaredNorm<'_> {
    fn visit_float<const D: usize>(&mut self, param: &Param<Tensor<B, D>>) {
        if let Some(grad) = self.grads.get::<B::InnerBackend, D>(param.id) {
            self.total += grad.powf_scalar(2.0).sum().into_scalar().elem::<f64>();
            self.seen += 1;
        }
    }
}

/// Multiplies gradients of visited parameters by a constant.
struct ScaleGrads<'a> {
    grads: &'a mut GradientsParams,
    factor: f32,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for ScaleGrads<'_> {
    fn visit_float<const D: usize>(&mut self, param: &Param<Tensor<B, D>>) {
        if let Some(grad) = self.grads.remove::<B::InnerBackend, D>(param.id) {
            self.grads
                .register::<B::InnerBackend, D>(param.id, grad.mul_scalar(self.factor));
        }
    }
}

/// Visit the parameters of one group; returns false when the model lacks it.
fn visit_group<B, V>(model: &Tacotron2<B>, group: &str, visitor: &mut V) -> bool
where
    B: AutodiffBackend,
    V: ModuleVisitor<B>,
{
    match group {
        "embedding" => model.embedding.visit(visitor),
        "encoder" => model.encoder.visit(visitor),
        "decoder" => model.decoder.visit(visitor),
        "postnet" => model.postnet.visit(visitor),
        "speaker" => match &model.speaker {
            Some(speaker) => speaker.visit(visitor),
            None => return false,
        },
        "style" => match &model.style {
            Some(style) => style.visit(visitor),
            None => return false,
        },
        _ => return false,
    }
    true
}

/// L2 norm of one group's gradients, or `None` if the group is absent or has
/// no gradients.
pub fn group_grad_norm<B: AutodiffBackend>(
    model: &Tacotron2<B>,
    grads: &GradientsParams,
    group: &str,
) -> Option<f32> {
    let mut norm = SquaredNorm {
        grads,
        total: 0.0,
        seen: 0,
    };
    if !visit_group(model, group, &mut norm) || norm.seen == 0 {
        return None;
    }
    Some(norm.total.sqrt() as f32)
}

/// Clip each group's gradients to `max_norm` and return the pre-clip norms.
pub fn clip_grad_norm_per_group<B: AutodiffBackend>(
    model: &Tacotron2<B>,
    grads: &mut GradientsParams,
    max_norm: f32,
) -> Vec<(&'static str, f32)> {
    let mut norms = Vec::with_capacity(PARAMETER_GROUPS.len());
    for group in PARAMETER_GROUPS {
        let Some(norm) = group_grad_norm(model, grads, group) else {
            continue;
        };
        let coefficient = max_norm / (norm + 1e-6);
        if coefficient < 1.0 {
            let mut scale = ScaleGrads {
                grads: &mut *grads,
                factor: coefficient,
            };
            visit_group(model, group, &mut scale);
        }
        norms.push((group, norm));
    }
    norms
}
