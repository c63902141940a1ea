//! Decoder pre-net: a small bottleneck MLP applied to the previous frame.
//!
//! Dropout stays active at inference time; it is the source of output
//! variation when the decoder runs on its own predictions.

use crate::modules::{
    dropout::dropout,
    layers::{xavier_linear, InitGain},
};
use burn::{
    module::Module,
    tensor::{activation::relu, backend::Backend, Tensor},
};
use burn_nn::Linear;
use rand::Rng;

/// Dropout probability applied after every pre-net layer.
pub const PRENET_DROPOUT: f64 = 0.5;

/// Configuration for [`Prenet`].
#[derive(Debug, Clone)]
pub struct PrenetConfig {
    /// Input width (mel channels times frames per step).
    pub d_input: usize,
    /// Width of each hidden layer.
    pub sizes: Vec<usize>,
}

impl PrenetConfig {
    pub fn new(d_input: usize, sizes: Vec<usize>) -> Self {
        Self { d_input, sizes }
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> Prenet<B> {
        let mut layers = Vec::with_capacity(self.sizes.len());
        let mut d_in = self.d_input;
        for &size in &self.sizes {
            layers.push(xavier_linear(d_in, size, false, InitGain::Linear, device));
            d_in = size;
        }
        Prenet { layers }
    }
}

/// Stack of bias-free linear layers with ReLU and always-on dropout.
#[derive(Module, Debug)]
pub struct Prenet<B: Backend> {
    pub layers: Vec<Linear<B>>,
}

impl<B: Backend> Prenet<B> {
    /// Apply to any `[..., d_input]` tensor.
    pub fn forward<const D: usize, R: Rng + ?Sized>(
        &self,
        input: Tensor<B, D>,
        rng: &mut R,
    ) -> Tensor<B, D> {
        self.layers.iter().fold(input, |x, layer| {
            dropout(relu(layer.forward(x)), PRENET_DROPOUT, rng)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::mask::tensor_to_vec;
    use burn_ndarray::{NdArray, NdArrayDevice};
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    type TestBackend = NdArray<f32>;

    #[test]
    fn prenet_output_is_nonnegative_and_sized() {
        let device = NdArrayDevice::default();
        let prenet = PrenetConfig::new(6, vec![8, 4]).init::<TestBackend>(&device);
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let input = Tensor::<TestBackend, 3>::ones([2, 3, 6], &device);
        let output = prenet.forward(input, &mut rng);
        assert_eq!(output.dims(), [2, 3, 4]);
        assert!(tensor_to_vec(output)
            .expect("values")
            .iter()
            .all(|&v| v >= 0.0));
    }

    #[test]
    fn prenet_dropout_is_seeded() {
        let device = NdArrayDevice::default();
        let prenet = PrenetConfig::new(4, vec![16, 16]).init::<TestBackend>(&device);
        let input = Tensor::<TestBackend, 2>::ones([1, 4], &device);
        let a = prenet.forward(input.clone(), &mut ChaCha8Rng::seed_from_u64(5));
        let b = prenet.forward(input, &mut ChaCha8Rng::seed_from_u64(5));
        assert_eq!(tensor_to_vec(a).expect("a"), tensor_to_vec(b).expect("b"));
    }
}
