//! Masked Tacotron 2 training loss.
//!
//! Mel reconstruction (decoder and postnet outputs) uses mean squared error and
//! the stop gate uses binary cross-entropy on logits. Both are averaged over
//! valid frames only, so padding never contributes.

use crate::model::tacotron2::ModelOutput;
use crate::modules::mask::valid_mask;
use anyhow::{bail, Result};
use burn::tensor::{activation::relu, backend::Backend, Tensor};

/// Scalar losses for one batch.
#[derive(Debug, Clone)]
pub struct LossOutput<B: Backend> {
    /// `mel_loss + gate_loss`.
    pub loss: Tensor<B, 1>,
    pub mel_loss: Tensor<B, 1>,
    pub gate_loss: Tensor<B, 1>,
}

/// Loss over a [`ModelOutput`] and its padded targets.
#[derive(Debug, Clone, Copy, Default)]
pub struct Tacotron2Loss {
    /// Weight of positive ("stop") gate targets.
    pub pos_weight: Option<f32>,
}

impl Tacotron2Loss {
    pub fn new(pos_weight: Option<f32>) -> Self {
        Self { pos_weight }
    }

    /// Compute the loss; `lengths` gives the valid frames per example.
    pub fn forward<B: Backend>(
        &self,
        output: &ModelOutput<B>,
        mel_target: Tensor<B, 3>,
        gate_target: Tensor<B, 2>,
        lengths: &[usize],
    ) -> Result<LossOutput<B>> {
        let [batch, channels, frames] = mel_target.dims();
        if output.mel_outputs.dims() != [batch, channels, frames] {
            bail!(
                "Mel output {:?} does not match target {:?}",
                output.mel_outputs.dims(),
                mel_target.dims()
            );
        }
        if gate_target.dims() != [batch, frames] || lengths.len() != batch {
            bail!(
                "Gate target {:?} and {} lengths do not match a batch of {batch} x {frames} frames",
                gate_target.dims(),
                lengths.len()
            );
        }
        let valid: usize = lengths.iter().map(|&len| len.min(frames)).sum();
        if valid == 0 {
            bail!("Batch has no valid frames");
        }
        let device = mel_target.device();
        let mask = valid_mask::<B>(lengths, frames, &device);
        let mel_mask = mask.clone().reshape([batch, 1, frames]);

        let mel_error = (output.mel_outputs.clone() - mel_target.clone())
            .powf_scalar(2.0)
            .mul(mel_mask.clone())
            .sum();
        let postnet_error = (output.mel_outputs_postnet.clone() - mel_target)
            .powf_scalar(2.0)
            .mul(mel_mask)
            .sum();
        let mel_loss = (mel_error + postnet_error).div_scalar((valid * channels) as f32);

        let gate_loss = self
            .gate_bce(output.gate_predicted.clone(), gate_target)
            .mul(mask)
            .sum()
            .div_scalar(valid as f32);

        Ok(LossOutput {
            loss: mel_loss.clone() + gate_loss.clone(),
            mel_loss,
            gate_loss,
        })
    }

    /// Element-wise BCE with logits, stable for large magnitudes.
    fn gate_bce<B: Backend>(&self, logits: Tensor<B, 2>, target: Tensor<B, 2>) -> Tensor<B, 2> {
        let softplus_neg = logits.clone().abs().neg().exp().log1p() + relu(logits.clone().neg());
        let weight = match self.pos_weight {
            Some(pos_weight) => target.clone().mul_scalar(pos_weight - 1.0).add_scalar(1.0),
            None => target.ones_like(),
        };
        target.neg().add_scalar(1.0).mul(logits) + weight.mul(softplus_neg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::mask::{tensor_to_scalar, tensor_to_vec};
    use burn_ndarray::{NdArray, NdArrayDevice};

    type TestBackend = NdArray<f32>;

    fn output(
        mel: Tensor<TestBackend, 3>,
        gate: Tensor<TestBackend, 2>,
    ) -> ModelOutput<TestBackend> {
        let [batch, _, frames] = mel.dims();
        ModelOutput {
            mel_outputs: mel.clone(),
            mel_outputs_postnet: mel,
            gate_predicted: gate,
            alignments: Tensor::zeros([batch, frames, 1], &NdArrayDevice::default()),
            output_lengths: vec![frames; batch],
        }
    }

    #[test]
    fn bce_matches_closed_form() {
        let device = NdArrayDevice::default();
        let loss = Tacotron2Loss::new(None);
        let logits = Tensor::<TestBackend, 2>::from_floats([[0.0, 2.0]], &device);
        let target = Tensor::<TestBackend, 2>::from_floats([[1.0, 0.0]], &device);
        let values = tensor_to_vec(loss.gate_bce(logits, target)).expect("bce");
        assert!((values[0] - 2f32.ln()).abs() < 1e-5);
        assert!((values[1] - (1.0 + 2f32.exp()).ln()).abs() < 1e-5);
    }

    #[test]
    fn pos_weight_scales_positive_targets() {
        let device = NdArrayDevice::default();
        let logits = Tensor::<TestBackend, 2>::from_floats([[0.0]], &device);
        let target = Tensor::<TestBackend, 2>::from_floats([[1.0]], &device);
        let plain =
            tensor_to_scalar(Tacotron2Loss::new(None).gate_bce(logits.clone(), target.clone()))
                .expect("plain");
        let weighted = tensor_to_scalar(Tacotron2Loss::new(Some(3.0)).gate_bce(logits, target))
            .expect("weighted");
        assert!((weighted - 3.0 * plain).abs() < 1e-5);
    }

    #[test]
    fn padding_is_excluded() {
        let device = NdArrayDevice::default();
        let target = Tensor::<TestBackend, 3>::zeros([1, 2, 4], &device);
        let mel = Tensor::<TestBackend, 3>::from_floats(
            [[[1.0, 1.0, 50.0, 50.0], [1.0, 1.0, -50.0, 50.0]]],
            &device,
        );
        let gate = Tensor::<TestBackend, 2>::from_floats([[-30.0, 30.0, 7.0, -7.0]], &device);
        let gate_target = Tensor::<TestBackend, 2>::from_floats([[0.0, 1.0, 1.0, 1.0]], &device);
        let losses = Tacotron2Loss::default()
            .forward(&output(mel, gate), target, gate_target, &[2])
            .expect("loss");
        // two postnet copies of four unit errors over four valid elements
        assert!((tensor_to_scalar(losses.mel_loss).expect("mel") - 2.0).abs() < 1e-5);
        assert!(tensor_to_scalar(losses.gate_loss).expect("gate") < 1e-6);
    }

    #[test]
    fn mismatched_shapes_are_rejected() {
        let device = NdArrayDevice::default();
        let out = output(
            Tensor::zeros([1, 2, 4], &device),
            Tensor::zeros([1, 4], &device),
        );
        let err = Tacotron2Loss::default()
            .forward(
                &out,
                Tensor::zeros([1, 2, 6], &device),
                Tensor::zeros([1, 6], &device),
                &[4],
            )
            .unwrap_err();
        assert!(err.to_string().contains("does not match"));
    }
}
