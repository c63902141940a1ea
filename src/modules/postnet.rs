//! Postnet: a convolution stack predicting a residual over the decoder mel.

use crate::modules::{
    dropout::dropout,
    layers::{ConvNorm, ConvNormConfig, InitGain},
};
use burn::{
    module::Module,
    tensor::{activation::tanh, backend::Backend, Tensor},
};
use rand::Rng;

/// Dropout applied after every postnet block while training.
pub const POSTNET_DROPOUT: f64 = 0.5;

/// Configuration for [`Postnet`].
#[derive(Debug, Clone)]
pub struct PostnetConfig {
    pub n_mel_channels: usize,
    pub embedding_dim: usize,
    pub kernel_size: usize,
    /// Total block count, including the first and last (at least 2).
    pub n_convolutions: usize,
}

impl PostnetConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Postnet<B> {
        let mut convolutions = Vec::with_capacity(self.n_convolutions);
        convolutions.push(
            ConvNormConfig::new(
                self.n_mel_channels,
                self.embedding_dim,
                self.kernel_size,
                InitGain::Tanh,
            )
            .init(device),
        );
        for _ in 1..self.n_convolutions.saturating_sub(1) {
            convolutions.push(
                ConvNormConfig::new(
                    self.embedding_dim,
                    self.embedding_dim,
                    self.kernel_size,
                    InitGain::Tanh,
                )
                .init(device),
            );
        }
        convolutions.push(
            ConvNormConfig::new(
                self.embedding_dim,
                self.n_mel_channels,
                self.kernel_size,
                InitGain::Linear,
            )
            .init(device),
        );
        Postnet { convolutions }
    }
}

#[derive(Module, Debug)]
pub struct Postnet<B: Backend> {
    pub convolutions: Vec<ConvNorm<B>>,
}

impl<B: Backend> Postnet<B> {
    /// Map `[batch, n_mel, frames]` to a residual of the same shape.
    pub fn forward<R: Rng + ?Sized>(&self, mel: Tensor<B, 3>, rng: &mut R) -> Tensor<B, 3> {
        let last = self.convolutions.len().saturating_sub(1);
        let prob = if B::ad_enabled() { POSTNET_DROPOUT } else { 0.0 };
        self.convolutions
            .iter()
            .enumerate()
            .fold(mel, |x, (idx, conv)| {
                let x = conv.forward(x);
                let x = if idx < last { tanh(x) } else { x };
                dropout(x, prob, rng)
            })
    }
}
