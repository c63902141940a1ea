//! Epoch loop for Tacotron 2.
//!
//! Each iteration collates a shard-local batch at the scheduled frames per
//! step, runs the teacher-forced forward pass, back-propagates the masked loss,
//! synchronises gradients, clips them per parameter group and steps Adam.
//! After every epoch the validation loss is logged; sample matrices and
//! checkpoints follow `log_interval` and `save_every`.
//!
//! A failing epoch is logged, the model is saved as
//! `<checkpoint_name>_failed_<epoch>` when `checkpoint_on_failure` is set, and
//! the original error is returned. Interruption is checked between iterations
//! and treated as a failure.

use crate::config::HParams;
use crate::data::{load_manifest, TextMelCollate, TextMelItem};
use crate::model::tacotron2::Tacotron2;
use crate::modules::mask::{tensor_to_scalar, tensor_to_vec};
use crate::perf::{self, Metric};
use crate::train::{
    grad::clip_grad_norm_per_group,
    loss::Tacotron2Loss,
    summary::SummaryWriter,
    sync::{GradientSync, SingleProcess},
};
use anyhow::{anyhow, bail, Result};
use burn::{
    module::{AutodiffModule, Module},
    optim::{decay::WeightDecayConfig, AdamConfig, GradientsParams, Optimizer},
    record::CompactRecorder,
    tensor::backend::{AutodiffBackend, Backend},
};
use rand::{seq::SliceRandom, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Keys that must be present for training.
pub const REQUIRED_HPARAMS: [&str; 3] = [
    "training_audiopaths_and_text",
    "val_audiopaths_and_text",
    "checkpoint_name",
];

/// Hyperparameters plus the resolved training-only settings.
#[derive(Debug, Clone)]
pub struct TrainerConfig {
    pub hparams: HParams,
    pub training_manifest: PathBuf,
    pub validation_manifest: PathBuf,
    pub checkpoint_name: String,
}

impl TrainerConfig {
    /// Check that every required training key is set.
    pub fn from_hparams(hparams: HParams) -> Result<Self> {
        hparams.validate()?;
        for key in REQUIRED_HPARAMS {
            let present = match key {
                "training_audiopaths_and_text" => hparams.training_audiopaths_and_text.is_some(),
                "val_audiopaths_and_text" => hparams.val_audiopaths_and_text.is_some(),
                _ => hparams
                    .checkpoint_name
                    .as_deref()
                    .is_some_and(|name| !name.is_empty()),
            };
            if !present {
                bail!("Tacotron2Trainer missing a required param: {key}");
            }
        }
        let (Some(training_manifest), Some(validation_manifest), Some(checkpoint_name)) = (
            hparams.training_audiopaths_and_text.clone(),
            hparams.val_audiopaths_and_text.clone(),
            hparams.checkpoint_name.clone(),
        ) else {
            bail!("Tacotron2Trainer missing a required param");
        };
        Ok(Self {
            hparams,
            training_manifest,
            validation_manifest,
            checkpoint_name,
        })
    }

    /// Checkpoint path for a suffix such as an epoch number.
    pub fn checkpoint_path(&self, suffix: &str) -> PathBuf {
        self.hparams
            .log_dir
            .join(format!("{}_{suffix}", self.checkpoint_name))
    }
}

/// A failed epoch, carrying the model as it was when the error occurred.
struct EpochFailure<B: AutodiffBackend> {
    model: Tacotron2<B>,
    error: anyhow::Error,
}

/// Drives training of a [`Tacotron2`] model.
pub struct Tacotron2Trainer<B: AutodiffBackend> {
    pub config: TrainerConfig,
    device: B::Device,
    loss: Tacotron2Loss,
    interrupt: Arc<AtomicBool>,
    sync: Box<dyn GradientSync<B>>,
}

impl<B: AutodiffBackend> Tacotron2Trainer<B> {
    pub fn new(config: TrainerConfig, device: B::Device) -> Self {
        let loss = Tacotron2Loss::new(config.hparams.pos_weight);
        Self {
            config,
            device,
            loss,
            interrupt: Arc::new(AtomicBool::new(false)),
            sync: Box::new(SingleProcess),
        }
    }

    /// Share an interrupt flag; setting it stops training before the next iteration.
    pub fn with_interrupt(mut self, interrupt: Arc<AtomicBool>) -> Self {
        self.interrupt = interrupt;
        self
    }

    /// Replace the single-process gradient synchronisation.
    pub fn with_gradient_sync(mut self, sync: Box<dyn GradientSync<B>>) -> Self {
        self.sync = sync;
        self
    }

    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupt)
    }

    /// Build the model, warm starting from `checkpoint` when set.
    pub fn init_model(&self) -> Result<Tacotron2<B>> {
        let hparams = &self.config.hparams;
        match &hparams.checkpoint {
            Some(path) => load_checkpoint(hparams, path, &self.device),
            None => Tacotron2::from_hparams(hparams, &self.device),
        }
    }

    /// Load both manifests and train from scratch or the warm-start checkpoint.
    pub fn train(&self, writer: &mut dyn SummaryWriter) -> Result<Tacotron2<B>> {
        let n_mel = self.config.hparams.n_mel_channels;
        let train_items = load_manifest(&self.config.training_manifest, n_mel)?;
        let val_items = load_manifest(&self.config.validation_manifest, n_mel)?;
        log::info!(
            "Loaded {} training and {} validation items",
            train_items.len(),
            val_items.len()
        );
        let model = self.init_model()?;
        self.train_on(model, &train_items, &val_items, writer)
    }

    /// Train `model` on in-memory items.
    pub fn train_on(
        &self,
        mut model: Tacotron2<B>,
        train_items: &[TextMelItem],
        val_items: &[TextMelItem],
        writer: &mut dyn SummaryWriter,
    ) -> Result<Tacotron2<B>> {
        let hparams = &self.config.hparams;
        if train_items.is_empty() {
            bail!("Training set is empty");
        }
        if val_items.is_empty() {
            bail!("Validation set is empty");
        }
        if self.sync.world_size() != hparams.world_size {
            bail!(
                "Gradient sync spans {} processes but world_size is {}",
                self.sync.world_size(),
                hparams.world_size
            );
        }
        let mut optim = AdamConfig::new()
            .with_weight_decay(Some(WeightDecayConfig::new(hparams.weight_decay)))
            .init::<B, Tacotron2<B>>();
        let mut rng = ChaCha8Rng::seed_from_u64(hparams.seed);
        let mut iteration = 0usize;

        for epoch in 0..hparams.epochs {
            model = match self.run_epoch(
                model,
                &mut optim,
                train_items,
                &mut iteration,
                &mut rng,
                writer,
            ) {
                Ok(model) => model,
                Err(EpochFailure { model, error }) => {
                    return Err(self.handle_failure(&model, epoch, error));
                }
            };
            if let Err(error) =
                self.finish_epoch(&model, val_items, epoch, iteration, &mut rng, writer)
            {
                return Err(self.handle_failure(&model, epoch, error));
            }
        }
        Ok(model)
    }

    /// Save the model under `<log_dir>/<checkpoint_name>_<suffix>`.
    pub fn save_checkpoint(&self, model: &Tacotron2<B>, suffix: &str) -> Result<PathBuf> {
        let _span = perf::span(Metric::CheckpointSave);
        fs::create_dir_all(&self.config.hparams.log_dir)?;
        let path = self.config.checkpoint_path(suffix);
        model
            .clone()
            .save_file(path.clone(), &CompactRecorder::new())
            .map_err(|e| anyhow!("failed to save checkpoint {}: {e:?}", path.display()))?;
        Ok(path)
    }

    fn run_epoch<O: Optimizer<Tacotron2<B>, B>>(
        &self,
        mut model: Tacotron2<B>,
        optim: &mut O,
        items: &[TextMelItem],
        iteration: &mut usize,
        rng: &mut ChaCha8Rng,
        writer: &mut dyn SummaryWriter,
    ) -> Result<Tacotron2<B>, EpochFailure<B>> {
        let hparams = &self.config.hparams;
        let mut order: Vec<usize> = (0..items.len()).collect();
        order.shuffle(rng);
        let shard: Vec<usize> = order
            .into_iter()
            .skip(hparams.rank)
            .step_by(hparams.world_size)
            .collect();

        for chunk in shard.chunks(hparams.batch_size) {
            if self.interrupt.load(Ordering::Relaxed) {
                let error = anyhow!("Training interrupted at iteration {iteration}");
                return Err(EpochFailure { model, error });
            }
            let frames_per_step = hparams.frames_per_step_at(*iteration);
            if let Err(error) = model.set_frames_per_step(frames_per_step) {
                return Err(EpochFailure { model, error });
            }
            let batch_items: Vec<TextMelItem> = chunk.iter().map(|&i| items[i].clone()).collect();
            let grads = match self.compute_gradients(&model, &batch_items, *iteration, rng, writer)
            {
                Ok(grads) => grads,
                Err(error) => return Err(EpochFailure { model, error }),
            };
            model = {
                let _span = perf::span(Metric::TrainOptimizerStep);
                optim.step(hparams.learning_rate, model, grads)
            };
            *iteration += 1;
        }
        Ok(model)
    }

    fn compute_gradients(
        &self,
        model: &Tacotron2<B>,
        items: &[TextMelItem],
        iteration: usize,
        rng: &mut ChaCha8Rng,
        writer: &mut dyn SummaryWriter,
    ) -> Result<GradientsParams> {
        let _span = perf::span(Metric::TrainIteration);
        let hparams = &self.config.hparams;
        let frames_per_step = model.frames_per_step();
        let batch = TextMelCollate::new(hparams.n_mel_channels, frames_per_step)
            .collate::<B>(items, &self.device)?;
        let output = model.forward(&batch, rng)?;
        let (Some(mel), Some(gate), Some(lengths)) = (batch.mel, batch.gate, batch.output_lengths)
        else {
            bail!("Collated batch is missing training targets");
        };
        let losses = self.loss.forward(&output, mel, gate, &lengths)?;
        let loss = tensor_to_scalar(losses.loss.clone())?;
        if !loss.is_finite() {
            bail!("Loss is not finite at iteration {iteration}: {loss}");
        }

        let grads = {
            let _span = perf::span(Metric::TrainBackward);
            losses.loss.backward()
        };
        let grads = GradientsParams::from_grads(grads, model);
        let mut grads = self.sync.all_reduce(grads, model)?;
        let norms = clip_grad_norm_per_group(model, &mut grads, hparams.grad_clip_thresh);

        writer.scalar("training/loss", iteration, loss)?;
        writer.scalar("training/mel_loss", iteration, tensor_to_scalar(losses.mel_loss)?)?;
        writer.scalar("training/gate_loss", iteration, tensor_to_scalar(losses.gate_loss)?)?;
        for (group, norm) in norms {
            writer.scalar(&format!("training/{group}_grad_norm"), iteration, norm)?;
        }
        writer.scalar("training/frames_per_step", iteration, frames_per_step as f32)?;
        perf::add_count(Metric::TrainExamples, items.len() as u64);
        Ok(grads)
    }

    fn finish_epoch(
        &self,
        model: &Tacotron2<B>,
        val_items: &[TextMelItem],
        epoch: usize,
        iteration: usize,
        rng: &mut ChaCha8Rng,
        writer: &mut dyn SummaryWriter,
    ) -> Result<()> {
        let hparams = &self.config.hparams;
        let validation_loss = self.validate(model, val_items, rng)?;
        writer.scalar("validation/loss", iteration, validation_loss)?;
        log::info!("Epoch {epoch}: validation loss {validation_loss:.5}");

        if epoch % hparams.log_interval == 0 {
            self.render_samples(model, val_items, iteration, rng, writer)?;
        }
        if epoch % hparams.save_every == 0 {
            let path = self.save_checkpoint(model, &epoch.to_string())?;
            log::info!("Saved checkpoint {}", path.display());
        }
        Ok(())
    }

    /// Mean loss over validation batches, without gradients.
    fn validate(
        &self,
        model: &Tacotron2<B>,
        items: &[TextMelItem],
        rng: &mut ChaCha8Rng,
    ) -> Result<f32> {
        let _span = perf::span(Metric::TrainValidation);
        let model = model.valid();
        let collate =
            TextMelCollate::new(self.config.hparams.n_mel_channels, model.frames_per_step());
        let mut total = 0.0f32;
        let mut batches = 0usize;
        for chunk in items.chunks(self.config.hparams.batch_size) {
            let batch = collate.collate::<B::InnerBackend>(chunk, &self.device)?;
            let output = model.forward(&batch, rng)?;
            let (Some(mel), Some(gate), Some(lengths)) =
                (batch.mel, batch.gate, batch.output_lengths)
            else {
                bail!("Collated batch is missing validation targets");
            };
            total += tensor_to_scalar(self.loss.forward(&output, mel, gate, &lengths)?.loss)?;
            batches += 1;
        }
        Ok(total / batches.max(1) as f32)
    }

    /// Teacher-forced and free-running renders of the first validation item.
    fn render_samples(
        &self,
        model: &Tacotron2<B>,
        items: &[TextMelItem],
        iteration: usize,
        rng: &mut ChaCha8Rng,
        writer: &mut dyn SummaryWriter,
    ) -> Result<()> {
        let _span = perf::span(Metric::TrainSamples);
        let Some(first) = items.first() else {
            return Ok(());
        };
        let model = model.valid();
        let batch = TextMelCollate::new(self.config.hparams.n_mel_channels, model.frames_per_step())
            .collate::<B::InnerBackend>(std::slice::from_ref(first), &self.device)?;

        let output = model.forward(&batch, rng)?;
        let [_, channels, frames] = output.mel_outputs.dims();
        let t_in = output.alignments.dims()[2];
        writer.matrix(
            "samples/mel",
            iteration,
            channels,
            frames,
            &tensor_to_vec(output.mel_outputs)?,
        )?;
        writer.matrix(
            "samples/mel_postnet",
            iteration,
            channels,
            frames,
            &tensor_to_vec(output.mel_outputs_postnet)?,
        )?;
        writer.matrix(
            "samples/gate",
            iteration,
            1,
            frames,
            &tensor_to_vec(output.gate_predicted)?,
        )?;
        writer.matrix(
            "samples/alignment",
            iteration,
            frames,
            t_in,
            &tensor_to_vec(output.alignments)?,
        )?;

        let inferred = model.inference(
            batch.text,
            &batch.input_lengths,
            batch.speaker_ids,
            batch.style,
            rng,
        )?;
        let [_, channels, frames] = inferred.mel_outputs_postnet.dims();
        writer.matrix(
            "samples/inference_mel",
            iteration,
            channels,
            frames,
            &tensor_to_vec(inferred.mel_outputs_postnet)?,
        )?;
        writer.matrix(
            "samples/inference_alignment",
            iteration,
            frames,
            t_in,
            &tensor_to_vec(inferred.alignments)?,
        )?;
        Ok(())
    }

    fn handle_failure(
        &self,
        model: &Tacotron2<B>,
        epoch: usize,
        error: anyhow::Error,
    ) -> anyhow::Error {
        log::error!("Exception raised while training: {error:#}");
        if self.config.hparams.checkpoint_on_failure {
            match self.save_checkpoint(model, &format!("failed_{epoch}")) {
                Ok(path) => log::info!("Saved failure checkpoint {}", path.display()),
                Err(save_error) => {
                    log::error!("Could not save failure checkpoint: {save_error:#}")
                }
            }
        }
        error
    }
}

/// Build a model from `hparams` and load weights from a checkpoint file.
pub fn load_checkpoint<B: Backend>(
    hparams: &HParams,
    path: &Path,
    device: &B::Device,
) -> Result<Tacotron2<B>> {
    let _span = perf::span(Metric::CheckpointLoad);
    Tacotron2::from_hparams(hparams, device)?
        .load_file(path.to_path_buf(), &CompactRecorder::new(), device)
        .map_err(|e| anyhow!("failed to load checkpoint {}: {e:?}", path.display()))
}
