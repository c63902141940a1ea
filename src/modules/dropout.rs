//! Dropout driven by a caller-supplied RNG.
//!
//! The decoder draws every random decision from one seeded generator so a run
//! is reproducible end to end. Masks are built on the host and uploaded as a
//! float tensor scaled by `1 / (1 - p)`.

use burn::tensor::{backend::Backend, Tensor, TensorData};
use rand::Rng;

/// Build an inverted-dropout mask of the given shape.
pub fn dropout_mask<B: Backend, const D: usize, R: Rng + ?Sized>(
    shape: [usize; D],
    prob: f64,
    rng: &mut R,
    device: &B::Device,
) -> Tensor<B, D> {
    let numel: usize = shape.iter().product();
    let keep_scale = if prob < 1.0 {
        (1.0 / (1.0 - prob)) as f32
    } else {
        0.0
    };
    let values: Vec<f32> = (0..numel)
        .map(|_| {
            if rng.random::<f64>() < prob {
                0.0
            } else {
                keep_scale
            }
        })
        .collect();
    Tensor::from_data(TensorData::new(values, shape), device)
}

/// Apply dropout with probability `prob`; a zero probability is the identity
/// and consumes no randomness.
pub fn dropout<B: Backend, const D: usize, R: Rng + ?Sized>(
    input: Tensor<B, D>,
    prob: f64,
    rng: &mut R,
) -> Tensor<B, D> {
    if prob <= 0.0 {
        return input;
    }
    let mask = dropout_mask::<B, D, R>(input.dims(), prob, rng, &input.device());
    input.mul(mask)
}
