//! High-level runtime wrapper for synthesis.
//!
//! Owns a validated [`HParams`], a model loaded from a checkpoint and the
//! random generator driving pre-net dropout, and turns symbol sequences into
//! per-example mel spectrograms and alignments. Intended to keep the CLI thin.

use crate::config::{load_config, HParams};
use crate::data::Batch;
use crate::model::tacotron2::Tacotron2;
use crate::modules::mask::tensor_to_vec;
use crate::perf::{self, Metric};
use crate::train::trainer::load_checkpoint;
use anyhow::{bail, Result};
use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor, TensorData};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::path::Path;

/// Synthesis parameters that override the configuration.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeParams {
    /// Seed for pre-net dropout.
    pub seed: u64,
    /// Stop-gate threshold override.
    pub gate_threshold: Option<f64>,
    /// Decoder step cap override.
    pub max_decoder_steps: Option<usize>,
}

impl RuntimeParams {
    pub fn new(seed: u64, gate_threshold: Option<f64>, max_decoder_steps: Option<usize>) -> Self {
        Self {
            seed,
            gate_threshold,
            max_decoder_steps,
        }
    }
}

impl Default for RuntimeParams {
    fn default() -> Self {
        Self {
            seed: 1234,
            gate_threshold: None,
            max_decoder_steps: None,
        }
    }
}

/// One synthesized utterance.
#[derive(Debug, Clone)]
pub struct Synthesis {
    /// Post-net mel, channel-major `[n_mel_channels, frames]`.
    pub mel: Vec<f32>,
    pub frames: usize,
    /// Row-major `[frames, input_length]` attention weights.
    pub alignment: Vec<f32>,
    pub input_length: usize,
}

/// Synthesis runtime owning the model and configuration.
#[derive(Debug)]
pub struct TacotronRuntime<B: Backend> {
    hparams: HParams,
    model: Tacotron2<B>,
    rng: ChaCha8Rng,
    device: B::Device,
}

impl<B: Backend> TacotronRuntime<B> {
    /// Create a runtime from a config path and optional checkpoint.
    pub fn from_config_path(
        path: impl AsRef<Path>,
        checkpoint: Option<&Path>,
        params: RuntimeParams,
        device: &B::Device,
    ) -> Result<Self> {
        let hparams = load_config(path)?;
        Self::from_config(&hparams, checkpoint, params, device)
    }

    /// Create a runtime from already-loaded hyperparameters.
    ///
    /// Without a checkpoint the model keeps its random initialisation.
    pub fn from_config(
        hparams: &HParams,
        checkpoint: Option<&Path>,
        params: RuntimeParams,
        device: &B::Device,
    ) -> Result<Self> {
        let _span = perf::span(Metric::RuntimeFromConfig);
        let mut hparams = hparams.clone();
        if let Some(threshold) = params.gate_threshold {
            hparams.gate_threshold = threshold;
        }
        if let Some(steps) = params.max_decoder_steps {
            hparams.max_decoder_steps = steps;
        }
        hparams.validate()?;
        let model = match checkpoint {
            Some(path) => load_checkpoint(&hparams, path, device)?,
            None => {
                log::warn!("No checkpoint given; synthesizing with untrained weights");
                Tacotron2::from_hparams(&hparams, device)?
            }
        };
        Ok(Self {
            hparams,
            model,
            rng: ChaCha8Rng::seed_from_u64(params.seed),
            device: device.clone(),
        })
    }

    pub fn hparams(&self) -> &HParams {
        &self.hparams
    }

    /// Access the underlying model (advanced usage).
    pub fn model(&self) -> &Tacotron2<B> {
        &self.model
    }

    /// Free-running synthesis of a batch of symbol sequences.
    ///
    /// `speaker_ids` and `style` hold one entry per sequence when given.
    pub fn synthesize(
        &mut self,
        sequences: &[Vec<i64>],
        speaker_ids: Option<&[i64]>,
        style: Option<&[Vec<f32>]>,
    ) -> Result<Vec<Synthesis>> {
        let _span = perf::span(Metric::SynthesizeBatch);
        let batch = Batch::<B>::from_symbols(sequences, &self.device)?;
        let batch_size = batch.batch_size();
        let speakers = match speaker_ids {
            Some(ids) if ids.len() != batch_size => {
                bail!("{} speaker ids for {batch_size} sequences", ids.len())
            }
            Some(ids) => Some(Tensor::<B, 1, Int>::from_data(
                TensorData::new(ids.to_vec(), [batch_size]),
                &self.device,
            )),
            None => None,
        };
        let style = match style {
            Some(rows) => Some(self.style_tensor(rows, batch_size)?),
            None => None,
        };

        let output = self.model.inference(
            batch.text,
            &batch.input_lengths,
            speakers,
            style,
            &mut self.rng,
        )?;
        let [_, channels, _] = output.mel_outputs_postnet.dims();
        let mut results = Vec::with_capacity(batch_size);
        for (index, (&frames, &input_length)) in output
            .output_lengths
            .iter()
            .zip(&batch.input_lengths)
            .enumerate()
        {
            let mel = output
                .mel_outputs_postnet
                .clone()
                .narrow(0, index, 1)
                .narrow(2, 0, frames);
            let alignment = output
                .alignments
                .clone()
                .narrow(0, index, 1)
                .narrow(1, 0, frames)
                .narrow(2, 0, input_length);
            let mel = tensor_to_vec(mel)?;
            debug_assert_eq!(mel.len(), channels * frames);
            results.push(Synthesis {
                mel,
                frames,
                alignment: tensor_to_vec(alignment)?,
                input_length,
            });
        }
        let total: usize = results.iter().map(|r| r.frames).sum();
        perf::add_count(Metric::SynthesizedFrames, total as u64);
        Ok(results)
    }

    fn style_tensor(&self, rows: &[Vec<f32>], batch_size: usize) -> Result<Tensor<B, 2>> {
        let Some(dim) = self.hparams.gst_dim.filter(|_| self.hparams.uses_style()) else {
            bail!("Style vectors given but the model has no style conditioning");
        };
        if rows.len() != batch_size || rows.iter().any(|row| row.len() != dim) {
            bail!("Expected {batch_size} style vectors of width {dim}");
        }
        let flat: Vec<f32> = rows.iter().flatten().copied().collect();
        Ok(Tensor::from_data(
            TensorData::new(flat, [batch_size, dim]),
            &self.device,
        ))
    }
}
