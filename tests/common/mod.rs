//! Shared test utilities: a tiny model configuration and tensor helpers.
#![allow(dead_code)]

use burn::backend::Autodiff;
use burn::module::Param;
use burn::tensor::{Tensor, TensorData};
use burn_ndarray::{NdArray, NdArrayDevice};
use tacotron::config::HParams;
use tacotron::data::TextMelItem;
use tacotron::model::tacotron2::Tacotron2;

pub type TestBackend = NdArray<f32>;
pub type TrainBackend = Autodiff<NdArray<f32>>;

pub const N_MEL: usize = 3;

/// Hyperparameters small enough for CPU tests.
pub fn tiny_hparams() -> HParams {
    HParams {
        n_symbols: 20,
        symbols_embedding_dim: 4,
        encoder_embedding_dim: 4,
        encoder_n_convolutions: 1,
        encoder_kernel_size: 3,
        n_mel_channels: N_MEL,
        attention_rnn_dim: 6,
        decoder_rnn_dim: 6,
        prenet_dim: 5,
        attention_dim: 4,
        attention_location_n_filters: 2,
        attention_location_kernel_size: 3,
        postnet_embedding_dim: 4,
        postnet_kernel_size: 3,
        postnet_n_convolutions: 2,
        max_decoder_steps: 8,
        batch_size: 2,
        epochs: 1,
        ..HParams::default()
    }
}

/// Force every stop-gate logit to `logit`, independent of the decoder state.
pub fn force_gate<B: burn::tensor::backend::Backend>(
    model: &mut Tacotron2<B>,
    hparams: &HParams,
    logit: f32,
    device: &B::Device,
) {
    let fan_in = hparams.decoder_rnn_dim + hparams.encoder_embedding_dim;
    model.decoder.gate_layer.weight = Param::from_tensor(Tensor::zeros([fan_in, 1], device));
    model.decoder.gate_layer.bias = Some(Param::from_tensor(Tensor::from_floats([logit], device)));
}

/// A training item whose mel is a deterministic ramp.
pub fn ramp_item(symbols: Vec<i64>, frames: usize) -> TextMelItem {
    let mel = (0..N_MEL * frames)
        .map(|i| (i % 7) as f32 / 7.0 - 0.5)
        .collect();
    TextMelItem::new(symbols, mel, N_MEL).expect("item")
}

/// Assert two tensor data slices are element-wise close within tolerance.
pub fn assert_close(a: &TensorData, b: &TensorData, tol: f32) {
    let a_slice = a.as_slice::<f32>().expect("a slice");
    let b_slice = b.as_slice::<f32>().expect("b slice");
    assert_eq!(
        a_slice.len(),
        b_slice.len(),
        "tensor length mismatch: {} vs {}",
        a_slice.len(),
        b_slice.len()
    );
    for (idx, (x, y)) in a_slice.iter().zip(b_slice.iter()).enumerate() {
        if (x - y).abs() > tol {
            panic!(
                "mismatch at {idx}: {x} vs {y} (diff: {}, tol: {tol})",
                (x - y).abs()
            );
        }
    }
}

/// Flatten a tensor into host values.
pub fn values<const D: usize>(tensor: Tensor<TestBackend, D>) -> Vec<f32> {
    tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .expect("tensor values")
}

/// Create a 3D tensor from nested Vecs.
pub fn tensor3(data: Vec<Vec<Vec<f32>>>, device: &NdArrayDevice) -> Tensor<TestBackend, 3> {
    let d0 = data.len();
    let d1 = data.first().map(|v| v.len()).unwrap_or(0);
    let d2 = data
        .first()
        .and_then(|v| v.first())
        .map(|v| v.len())
        .unwrap_or(0);
    let flat: Vec<f32> = data.into_iter().flatten().flatten().collect();
    Tensor::from_data(TensorData::new(flat, [d0, d1, d2]), device)
}
