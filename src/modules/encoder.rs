//! Text encoder: convolution stack followed by a length-aware bidirectional LSTM.

use crate::modules::{
    dropout::dropout,
    layers::{ConvNorm, ConvNormConfig, InitGain},
    mask::{reverse_within_length_indices, valid_mask},
};
use crate::perf::{self, Metric};
use anyhow::{bail, Result};
use burn::{
    module::Module,
    tensor::{activation::relu, backend::Backend, Tensor},
};
use burn_nn::lstm::{Lstm, LstmConfig};
use rand::Rng;

/// Dropout applied after every encoder convolution while training.
pub const ENCODER_DROPOUT: f64 = 0.5;

/// Configuration for [`Encoder`].
#[derive(Debug, Clone)]
pub struct EncoderConfig {
    pub n_convolutions: usize,
    /// Channel count of the input embedding and of the encoder output.
    pub embedding_dim: usize,
    pub kernel_size: usize,
}

impl EncoderConfig {
    pub fn new(n_convolutions: usize, embedding_dim: usize, kernel_size: usize) -> Self {
        Self {
            n_convolutions,
            embedding_dim,
            kernel_size,
        }
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> Encoder<B> {
        let convolutions = (0..self.n_convolutions)
            .map(|_| {
                ConvNormConfig::new(
                    self.embedding_dim,
                    self.embedding_dim,
                    self.kernel_size,
                    InitGain::Relu,
                )
                .init(device)
            })
            .collect();
        let hidden = self.embedding_dim / 2;
        Encoder {
            convolutions,
            forward_lstm: LstmConfig::new(self.embedding_dim, hidden, true).init(device),
            backward_lstm: LstmConfig::new(self.embedding_dim, hidden, true).init(device),
        }
    }
}

/// Encoder producing per-symbol memory `[batch, t_in, embedding_dim]`.
#[derive(Module, Debug)]
pub struct Encoder<B: Backend> {
    pub convolutions: Vec<ConvNorm<B>>,
    pub forward_lstm: Lstm<B>,
    pub backward_lstm: Lstm<B>,
}

impl<B: Backend> Encoder<B> {
    /// Encode embedded symbols `[batch, E, t_in]`.
    ///
    /// With more than one example each valid prefix is convolved on its own so
    /// padding never leaks into batch-norm statistics or kernel windows.
    /// Dropout is drawn from `rng` when the backend records gradients.
    pub fn forward<R: Rng + ?Sized>(
        &self,
        embedded: Tensor<B, 3>,
        lengths: &[usize],
        rng: &mut R,
    ) -> Result<Tensor<B, 3>> {
        let _span = perf::span(Metric::EncoderForward);
        let [batch, channels, t_in] = embedded.dims();
        check_lengths(lengths, batch, t_in)?;
        let convolved = if batch > 1 {
            let device = embedded.device();
            let rows = lengths
                .iter()
                .enumerate()
                .map(|(b, &len)| {
                    let example = embedded.clone().slice([b..b + 1, 0..channels, 0..len]);
                    let example = self.convolve(example, rng);
                    if len < t_in {
                        let padding = Tensor::zeros([1, channels, t_in - len], &device);
                        Tensor::cat(vec![example, padding], 2)
                    } else {
                        example
                    }
                })
                .collect();
            Tensor::cat(rows, 0)
        } else {
            self.convolve(embedded, rng)
        };
        Ok(self.recurrence(convolved.swap_dims(1, 2), lengths))
    }

    /// Encode embedded symbols, convolving the whole batch jointly.
    ///
    /// Padding enters the kernel windows of shorter examples, so callers batch
    /// only sequences of equal length here.
    pub fn inference<R: Rng + ?Sized>(
        &self,
        embedded: Tensor<B, 3>,
        lengths: &[usize],
        rng: &mut R,
    ) -> Result<Tensor<B, 3>> {
        let _span = perf::span(Metric::EncoderForward);
        let [batch, _, t_in] = embedded.dims();
        check_lengths(lengths, batch, t_in)?;
        let convolved = self.convolve(embedded, rng);
        Ok(self.recurrence(convolved.swap_dims(1, 2), lengths))
    }

    fn convolve<R: Rng + ?Sized>(&self, input: Tensor<B, 3>, rng: &mut R) -> Tensor<B, 3> {
        self.convolutions.iter().fold(input, |x, conv| {
            let x = relu(conv.forward(x));
            if B::ad_enabled() {
                dropout(x, ENCODER_DROPOUT, rng)
            } else {
                x
            }
        })
    }

    /// Bidirectional recurrence over `[batch, t_in, E]` honouring each length.
    ///
    /// The backward direction reads every sequence reversed within its own
    /// length, so it starts at the last real symbol; padded outputs are zeroed.
    fn recurrence(&self, input: Tensor<B, 3>, lengths: &[usize]) -> Tensor<B, 3> {
        let [batch, t_in, channels] = input.dims();
        let device = input.device();
        let (forward, _) = self.forward_lstm.forward(input.clone(), None);

        let indices =
            reverse_within_length_indices::<B>(lengths, t_in, &device).unsqueeze_dim::<3>(2);
        let reversed = input.gather(1, indices.clone().repeat_dim(2, channels));
        let (backward, _) = self.backward_lstm.forward(reversed, None);
        let hidden = backward.dims()[2];
        let backward = backward.gather(1, indices.repeat_dim(2, hidden));

        let mask = valid_mask::<B>(lengths, t_in, &device).reshape([batch, t_in, 1]);
        Tensor::cat(vec![forward, backward], 2).mul(mask)
    }
}

fn check_lengths(lengths: &[usize], batch: usize, t_in: usize) -> Result<()> {
    if lengths.len() != batch {
        bail!("Expected {batch} input lengths, got {}", lengths.len());
    }
    if let Some(&len) = lengths.iter().find(|&&len| len == 0 || len > t_in) {
        bail!("Input length {len} is outside 1..={t_in}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::mask::tensor_to_vec;
    use burn::tensor::Distribution;
    use burn_ndarray::{NdArray, NdArrayDevice};
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    type TestBackend = NdArray<f32>;

    #[test]
    fn padded_positions_are_zero() {
        let device = NdArrayDevice::default();
        let encoder = EncoderConfig::new(2, 6, 3).init::<TestBackend>(&device);
        let embedded =
            Tensor::<TestBackend, 3>::random([2, 6, 5], Distribution::Normal(0.0, 1.0), &device);
        let output = encoder
            .forward(embedded, &[5, 3], &mut ChaCha8Rng::seed_from_u64(0))
            .expect("encode");
        assert_eq!(output.dims(), [2, 5, 6]);
        let values = tensor_to_vec(output).expect("values");
        // second example, positions 3 and 4
        assert!(values[30 + 18..].iter().all(|&v| v == 0.0));
    }

    #[test]
    fn padding_does_not_change_valid_outputs() {
        let device = NdArrayDevice::default();
        let encoder = EncoderConfig::new(1, 4, 3).init::<TestBackend>(&device);
        let short =
            Tensor::<TestBackend, 3>::random([1, 4, 3], Distribution::Normal(0.0, 1.0), &device);
        let padded = Tensor::cat(vec![short.clone(), Tensor::ones([1, 4, 2], &device)], 2);
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let alone = encoder.inference(short, &[3], &mut rng).expect("short");
        let alone = tensor_to_vec(alone).expect("alone");

        let batched = Tensor::cat(vec![padded.clone(), padded], 0);
        let both = encoder.forward(batched, &[3, 5], &mut rng).expect("batched");
        let first = tensor_to_vec(both.slice([0..1, 0..3, 0..4])).expect("first");
        for (a, b) in alone.iter().zip(first.iter()) {
            assert!((a - b).abs() < 1e-5, "{a} vs {b}");
        }
    }

    #[test]
    fn length_mismatch_is_an_error() {
        let device = NdArrayDevice::default();
        let encoder = EncoderConfig::new(1, 4, 3).init::<TestBackend>(&device);
        let embedded = Tensor::<TestBackend, 3>::zeros([2, 4, 3], &device);
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        assert!(encoder.forward(embedded.clone(), &[3], &mut rng).is_err());
        assert!(encoder.forward(embedded, &[3, 4], &mut rng).is_err());
    }
}
