//! Hyperparameters for the Tacotron 2 model and its trainer.
//!
//! The configuration is a single flat mapping, loaded from YAML (JSON is valid
//! YAML) with [`load_config`]. Every key has a named default; the file only
//! overrides what it mentions, and unknown keys are rejected. The merged result
//! is validated once and treated as immutable afterwards.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Style-conditioning variant accepted for `gst_type`.
pub const GST_TORCHMOJI: &str = "torchmoji";

/// One stage of the frames-per-step curriculum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FramesPerStepStage {
    /// Stage applies while the iteration counter is below this value.
    /// `None` keeps the stage active for the rest of training.
    pub until_iteration: Option<usize>,
    /// Physical frames emitted per decoder step during this stage.
    pub frames_per_step: usize,
}

/// Flat hyperparameter set shared by the model and the trainer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HParams {
    /// Size of the input symbol vocabulary.
    pub n_symbols: usize,
    /// Symbol embedding width; must match `encoder_embedding_dim`.
    pub symbols_embedding_dim: usize,
    /// Use the finite half-precision minimum as the attention mask value.
    pub fp16_run: bool,
    /// Zero outputs beyond each example's length.
    pub mask_padding: bool,
    /// Mel channels per frame.
    pub n_mel_channels: usize,

    /// Encoder convolution kernel width (odd).
    pub encoder_kernel_size: usize,
    /// Number of encoder convolution blocks.
    pub encoder_n_convolutions: usize,
    /// Encoder output width (even; split across both LSTM directions).
    pub encoder_embedding_dim: usize,

    /// Decoder LSTM width.
    pub decoder_rnn_dim: usize,
    /// Pre-net layer width.
    pub prenet_dim: usize,
    /// Hard cap on decoder steps during free-running inference.
    pub max_decoder_steps: usize,
    /// Stop-gate probability above which an example is finished.
    pub gate_threshold: f64,
    /// Dropout on the attention LSTM state (training only).
    pub p_attention_dropout: f64,
    /// Dropout on the decoder LSTM state (training only).
    pub p_decoder_dropout: f64,
    /// Probability of feeding the ground-truth frame during training.
    pub p_teacher_forcing: f64,
    /// Positive-class weight for the gate loss.
    pub pos_weight: Option<f32>,

    /// Attention LSTM width.
    pub attention_rnn_dim: usize,
    /// Attention projection width.
    pub attention_dim: usize,
    /// Filters in the location convolution.
    pub attention_location_n_filters: usize,
    /// Location convolution kernel width (odd).
    pub attention_location_kernel_size: usize,

    /// Postnet hidden channel count.
    pub postnet_embedding_dim: usize,
    /// Postnet kernel width (odd).
    pub postnet_kernel_size: usize,
    /// Number of postnet convolution blocks (at least 2).
    pub postnet_n_convolutions: usize,

    /// Number of speakers in the training data.
    pub n_speakers: usize,
    /// Speaker embedding width.
    pub speaker_embedding_dim: usize,
    /// Build a speaker embedding; required when `n_speakers > 1`.
    pub has_speaker_embedding: bool,
    /// Style conditioning variant (`"torchmoji"` or unset).
    pub gst_type: Option<String>,
    /// Width of the external style vector.
    pub gst_dim: Option<usize>,

    /// Frames per decoder step at model construction.
    pub n_frames_per_step_initial: usize,
    /// Curriculum for reducing frames per step during training.
    pub frames_per_step_schedule: Vec<FramesPerStepStage>,

    /// Seed for shuffling, teacher forcing draws and dropout masks.
    pub seed: u64,
    /// Number of training epochs.
    pub epochs: usize,
    /// Examples per batch.
    pub batch_size: usize,
    /// Adam learning rate.
    pub learning_rate: f64,
    /// Adam weight decay.
    pub weight_decay: f32,
    /// Maximum L2 norm per parameter group.
    pub grad_clip_thresh: f32,
    /// Directory for checkpoints and summaries.
    pub log_dir: PathBuf,
    /// Checkpoint file stem; required for training.
    pub checkpoint_name: Option<String>,
    /// Checkpoint to warm start from.
    pub checkpoint: Option<PathBuf>,
    /// Save a checkpoint every N epochs.
    pub save_every: usize,
    /// Render sample matrices every N epochs.
    pub log_interval: usize,
    /// Persist the model when an epoch fails.
    pub checkpoint_on_failure: bool,
    /// Training manifest; required for training.
    pub training_audiopaths_and_text: Option<PathBuf>,
    /// Validation manifest; required for training.
    pub val_audiopaths_and_text: Option<PathBuf>,
    /// Train as one of several data-parallel processes.
    pub distributed_run: bool,
    /// This process's rank.
    pub rank: usize,
    /// Number of data-parallel processes.
    pub world_size: usize,
}

impl Default for HParams {
    fn default() -> Self {
        Self {
            n_symbols: 148,
            symbols_embedding_dim: 512,
            fp16_run: false,
            mask_padding: true,
            n_mel_channels: 80,
            encoder_kernel_size: 5,
            encoder_n_convolutions: 3,
            encoder_embedding_dim: 512,
            decoder_rnn_dim: 1024,
            prenet_dim: 256,
            max_decoder_steps: 1000,
            gate_threshold: 0.5,
            p_attention_dropout: 0.1,
            p_decoder_dropout: 0.1,
            p_teacher_forcing: 1.0,
            pos_weight: None,
            attention_rnn_dim: 1024,
            attention_dim: 128,
            attention_location_n_filters: 32,
            attention_location_kernel_size: 31,
            postnet_embedding_dim: 512,
            postnet_kernel_size: 5,
            postnet_n_convolutions: 5,
            n_speakers: 1,
            speaker_embedding_dim: 128,
            has_speaker_embedding: false,
            gst_type: None,
            gst_dim: None,
            n_frames_per_step_initial: 1,
            frames_per_step_schedule: Vec::new(),
            seed: 1234,
            epochs: 10,
            batch_size: 16,
            learning_rate: 1e-3,
            weight_decay: 1e-6,
            grad_clip_thresh: 1.0,
            log_dir: PathBuf::from("output"),
            checkpoint_name: None,
            checkpoint: None,
            save_every: 1,
            log_interval: 1,
            checkpoint_on_failure: true,
            training_audiopaths_and_text: None,
            val_audiopaths_and_text: None,
            distributed_run: false,
            rank: 0,
            world_size: 1,
        }
    }
}

impl HParams {
    /// Parse a YAML document, merge it over the defaults and validate.
    pub fn from_yaml_str(data: &str) -> Result<Self> {
        let value: serde_yaml::Value = serde_yaml::from_str(data)?;
        let hparams = match value {
            serde_yaml::Value::Null => Self::default(),
            value @ serde_yaml::Value::Mapping(_) => serde_yaml::from_value(value)?,
            _ => bail!("Hyperparameters must be a mapping of option names to values"),
        };
        hparams.validate()?;
        Ok(hparams)
    }

    /// Check cross-field invariants the model and trainer rely on.
    pub fn validate(&self) -> Result<()> {
        if self.n_symbols == 0 {
            bail!("n_symbols must be > 0");
        }
        if self.symbols_embedding_dim != self.encoder_embedding_dim {
            bail!(
                "symbols_embedding_dim ({}) must equal encoder_embedding_dim ({})",
                self.symbols_embedding_dim,
                self.encoder_embedding_dim
            );
        }
        if self.encoder_embedding_dim == 0 || self.encoder_embedding_dim % 2 != 0 {
            bail!(
                "encoder_embedding_dim must be a positive even number, got {}",
                self.encoder_embedding_dim
            );
        }
        for (key, size) in [
            ("encoder_kernel_size", self.encoder_kernel_size),
            ("postnet_kernel_size", self.postnet_kernel_size),
            (
                "attention_location_kernel_size",
                self.attention_location_kernel_size,
            ),
        ] {
            if size % 2 == 0 {
                bail!("{key} must be odd to preserve sequence length, got {size}");
            }
        }
        if self.postnet_n_convolutions < 2 {
            bail!(
                "postnet_n_convolutions must be at least 2, got {}",
                self.postnet_n_convolutions
            );
        }
        if self.n_mel_channels == 0 {
            bail!("n_mel_channels must be > 0");
        }
        if self.max_decoder_steps == 0 {
            bail!("max_decoder_steps must be > 0");
        }
        if !(self.gate_threshold > 0.0 && self.gate_threshold < 1.0) {
            bail!(
                "gate_threshold must be in (0, 1), got {}",
                self.gate_threshold
            );
        }
        for (key, p) in [
            ("p_attention_dropout", self.p_attention_dropout),
            ("p_decoder_dropout", self.p_decoder_dropout),
            ("p_teacher_forcing", self.p_teacher_forcing),
        ] {
            if !(0.0..=1.0).contains(&p) {
                bail!("{key} must be in [0, 1], got {p}");
            }
        }
        if self.n_frames_per_step_initial == 0 {
            bail!("n_frames_per_step_initial must be > 0");
        }
        for stage in &self.frames_per_step_schedule {
            if stage.frames_per_step == 0 || stage.frames_per_step > self.n_frames_per_step_initial
            {
                bail!(
                    "frames_per_step_schedule entry {} must be in 1..={}",
                    stage.frames_per_step,
                    self.n_frames_per_step_initial
                );
            }
        }
        if self.n_speakers == 0 {
            bail!("n_speakers must be > 0");
        }
        if self.n_speakers > 1 && !self.has_speaker_embedding {
            bail!("Speaker embedding is required if n_speakers > 1");
        }
        match self.gst_type.as_deref() {
            None => {}
            Some(GST_TORCHMOJI) => {
                if self.gst_dim.unwrap_or(0) == 0 {
                    bail!("gst_dim must be set when gst_type is {GST_TORCHMOJI}");
                }
            }
            Some(other) => bail!("Unknown gst_type {other:?}; expected {GST_TORCHMOJI:?}"),
        }
        if self.batch_size == 0 {
            bail!("batch_size must be > 0");
        }
        if self.save_every == 0 || self.log_interval == 0 {
            bail!("save_every and log_interval must be > 0");
        }
        if self.world_size == 0 || self.rank >= self.world_size {
            bail!(
                "rank {} is out of range for world_size {}",
                self.rank,
                self.world_size
            );
        }
        Ok(())
    }

    /// Frames per decoder step to use at a given training iteration.
    pub fn frames_per_step_at(&self, iteration: usize) -> usize {
        self.frames_per_step_schedule
            .iter()
            .find(|stage| stage.until_iteration.map_or(true, |until| iteration < until))
            .map(|stage| stage.frames_per_step)
            .unwrap_or(self.n_frames_per_step_initial)
    }

    /// Pre-softmax score assigned to padded encoder positions.
    pub fn score_mask_value(&self) -> f32 {
        if self.fp16_run {
            -65504.0
        } else {
            f32::NEG_INFINITY
        }
    }

    /// True when the model is built with a style projection.
    pub fn uses_style(&self) -> bool {
        self.gst_type.is_some()
    }
}

/// Load hyperparameters from a YAML (or JSON) file.
///
/// # Errors
///
/// Returns an error if the file is missing, contains unknown keys or fails
/// validation.
pub fn load_config(path: impl AsRef<Path>) -> Result<HParams> {
    let path = path.as_ref();
    if !path.exists() {
        bail!("Config file not found: {}", path.display());
    }
    let data = fs::read_to_string(path)?;
    HParams::from_yaml_str(&data).with_context(|| format!("invalid config {}", path.display()))
}

/// Resolve a possibly relative path against a file's directory.
pub fn resolve_relative_path(base_file: &Path, maybe_relative: &Path) -> PathBuf {
    if maybe_relative.is_absolute() {
        return maybe_relative.to_path_buf();
    }
    base_file
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(maybe_relative)
}
