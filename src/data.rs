//! Padded batches of symbol sequences and mel targets.
//!
//! [`TextMelCollate`] turns host-side [`TextMelItem`]s into a device [`Batch`]:
//! symbols are zero-padded, mel frames are zero-padded to the longest example
//! rounded up to a whole number of decoder steps, and the stop-gate target is 1
//! from each example's last frame onwards. Items come from a JSON-lines
//! manifest whose mel files are safetensors holding an F32 tensor `mel` of
//! shape `[n_mel, frames]`.

use crate::config::resolve_relative_path;
use anyhow::{bail, Context, Result};
use burn::tensor::{backend::Backend, Int, Tensor, TensorData};
use safetensors::{Dtype, SafeTensors};
use serde::Deserialize;
use std::fs;
use std::path::Path;

/// Name of the tensor holding the mel spectrogram in a manifest mel file.
pub const MEL_TENSOR_NAME: &str = "mel";

/// Name of the tensor holding a style vector for style-conditioned synthesis.
pub const STYLE_TENSOR_NAME: &str = "style";

/// A padded batch on device.
#[derive(Debug, Clone)]
pub struct Batch<B: Backend> {
    /// Symbol ids `[batch, t_in]`, zero-padded.
    pub text: Tensor<B, 2, Int>,
    /// Valid symbols per example.
    pub input_lengths: Vec<usize>,
    /// Target mel `[batch, n_mel, t_out]`, zero-padded.
    pub mel: Option<Tensor<B, 3>>,
    /// Stop-gate target `[batch, t_out]`.
    pub gate: Option<Tensor<B, 2>>,
    /// Valid frames per example.
    pub output_lengths: Option<Vec<usize>>,
    /// Speaker ids `[batch]`.
    pub speaker_ids: Option<Tensor<B, 1, Int>>,
    /// Style vectors `[batch, gst_dim]`.
    pub style: Option<Tensor<B, 2>>,
}

impl<B: Backend> Batch<B> {
    pub fn batch_size(&self) -> usize {
        self.input_lengths.len()
    }

    /// Inference-only batch of symbol sequences.
    pub fn from_symbols(sequences: &[Vec<i64>], device: &B::Device) -> Result<Self> {
        let (text, input_lengths) = pad_symbols::<B>(sequences, device)?;
        Ok(Self {
            text,
            input_lengths,
            mel: None,
            gate: None,
            output_lengths: None,
            speaker_ids: None,
            style: None,
        })
    }
}

/// One training example on the host.
#[derive(Debug, Clone, PartialEq)]
pub struct TextMelItem {
    pub symbols: Vec<i64>,
    /// Channel-major mel values `[n_mel, frames]`.
    pub mel: Vec<f32>,
    pub n_mel_channels: usize,
    pub speaker_id: Option<i64>,
    pub style: Option<Vec<f32>>,
}

impl TextMelItem {
    /// Create an item, checking the mel buffer against the channel count.
    pub fn new(symbols: Vec<i64>, mel: Vec<f32>, n_mel_channels: usize) -> Result<Self> {
        if symbols.is_empty() {
            bail!("Item has no symbols");
        }
        if n_mel_channels == 0 || mel.is_empty() || mel.len() % n_mel_channels != 0 {
            bail!(
                "Mel buffer of {} values is not a non-empty [{n_mel_channels}, frames] matrix",
                mel.len()
            );
        }
        Ok(Self {
            symbols,
            mel,
            n_mel_channels,
            speaker_id: None,
            style: None,
        })
    }

    pub fn with_speaker(mut self, speaker_id: i64) -> Self {
        self.speaker_id = Some(speaker_id);
        self
    }

    pub fn with_style(mut self, style: Vec<f32>) -> Self {
        self.style = Some(style);
        self
    }

    /// Number of mel frames.
    pub fn frames(&self) -> usize {
        self.mel.len() / self.n_mel_channels
    }
}

/// Collates items into padded batches for a given frames-per-step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextMelCollate {
    pub n_mel_channels: usize,
    pub n_frames_per_step: usize,
}

impl TextMelCollate {
    pub fn new(n_mel_channels: usize, n_frames_per_step: usize) -> Self {
        Self {
            n_mel_channels,
            n_frames_per_step,
        }
    }

    /// Build a padded batch on `device`.
    pub fn collate<B: Backend>(
        &self,
        items: &[TextMelItem],
        device: &B::Device,
    ) -> Result<Batch<B>> {
        if items.is_empty() {
            bail!("Cannot collate an empty batch");
        }
        if self.n_frames_per_step == 0 {
            bail!("n_frames_per_step must be > 0");
        }
        let batch = items.len();
        let channels = self.n_mel_channels;
        for item in items {
            if item.n_mel_channels != channels {
                bail!(
                    "Item has {} mel channels, expected {channels}",
                    item.n_mel_channels
                );
            }
        }

        let sequences: Vec<Vec<i64>> = items.iter().map(|item| item.symbols.clone()).collect();
        let (text, input_lengths) = pad_symbols::<B>(&sequences, device)?;

        let output_lengths: Vec<usize> = items.iter().map(TextMelItem::frames).collect();
        let max_frames = output_lengths.iter().copied().max().unwrap_or(0);
        let t_out = max_frames.div_ceil(self.n_frames_per_step) * self.n_frames_per_step;

        let mut mel = vec![0.0f32; batch * channels * t_out];
        let mut gate = vec![0.0f32; batch * t_out];
        for (b, item) in items.iter().enumerate() {
            let frames = item.frames();
            for c in 0..channels {
                let src = &item.mel[c * frames..(c + 1) * frames];
                let dst = (b * channels + c) * t_out;
                mel[dst..dst + frames].copy_from_slice(src);
            }
            for value in &mut gate[b * t_out + frames - 1..(b + 1) * t_out] {
                *value = 1.0;
            }
        }

        let speaker_ids = match collect_optional(items, |item| item.speaker_id, "speaker id")? {
            Some(ids) => Some(Tensor::from_data(TensorData::new(ids, [batch]), device)),
            None => None,
        };
        let style = match collect_optional(items, |item| item.style.clone(), "style vector")? {
            Some(vectors) => {
                let dim = vectors[0].len();
                if dim == 0 || vectors.iter().any(|v| v.len() != dim) {
                    bail!("Style vectors must share one non-zero width");
                }
                let flat: Vec<f32> = vectors.into_iter().flatten().collect();
                Some(Tensor::from_data(TensorData::new(flat, [batch, dim]), device))
            }
            None => None,
        };

        Ok(Batch {
            text,
            input_lengths,
            mel: Some(Tensor::from_data(
                TensorData::new(mel, [batch, channels, t_out]),
                device,
            )),
            gate: Some(Tensor::from_data(TensorData::new(gate, [batch, t_out]), device)),
            output_lengths: Some(output_lengths),
            speaker_ids,
            style,
        })
    }
}

fn pad_symbols<B: Backend>(
    sequences: &[Vec<i64>],
    device: &B::Device,
) -> Result<(Tensor<B, 2, Int>, Vec<usize>)> {
    if sequences.is_empty() {
        bail!("Cannot pad an empty batch");
    }
    let lengths: Vec<usize> = sequences.iter().map(Vec::len).collect();
    if lengths.contains(&0) {
        bail!("Symbol sequences must be non-empty");
    }
    let max_len = lengths.iter().copied().max().unwrap_or(0);
    let mut padded = vec![0i64; sequences.len() * max_len];
    for (b, sequence) in sequences.iter().enumerate() {
        padded[b * max_len..b * max_len + sequence.len()].copy_from_slice(sequence);
    }
    let text = Tensor::from_data(TensorData::new(padded, [sequences.len(), max_len]), device);
    Ok((text, lengths))
}

/// All-or-nothing collection of an optional per-item field.
fn collect_optional<T>(
    items: &[TextMelItem],
    field: impl Fn(&TextMelItem) -> Option<T>,
    name: &str,
) -> Result<Option<Vec<T>>> {
    let values: Vec<Option<T>> = items.iter().map(field).collect();
    let present = values.iter().filter(|v| v.is_some()).count();
    if present == 0 {
        return Ok(None);
    }
    if present != values.len() {
        bail!("Either every item or none must carry a {name}");
    }
    Ok(Some(values.into_iter().flatten().collect()))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ManifestEntry {
    symbols: Vec<i64>,
    mel: String,
    #[serde(default)]
    speaker_id: Option<i64>,
    #[serde(default)]
    style: Option<Vec<f32>>,
}

/// Load every item listed in a JSON-lines manifest.
///
/// Blank lines are skipped; relative mel paths resolve against the manifest's
/// directory.
pub fn load_manifest(path: impl AsRef<Path>, n_mel_channels: usize) -> Result<Vec<TextMelItem>> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read manifest {}", path.display()))?;
    let mut items = Vec::new();
    for (line_no, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let entry: ManifestEntry = serde_json::from_str(line).with_context(|| {
            format!("{}:{}: invalid manifest entry", path.display(), line_no + 1)
        })?;
        let mel_path = resolve_relative_path(path, Path::new(&entry.mel));
        let mel = load_mel(&mel_path, n_mel_channels)?;
        let mut item = TextMelItem::new(entry.symbols, mel, n_mel_channels)
            .with_context(|| format!("{}:{}", path.display(), line_no + 1))?;
        item.speaker_id = entry.speaker_id;
        item.style = entry.style;
        items.push(item);
    }
    if items.is_empty() {
        bail!("Manifest {} lists no items", path.display());
    }
    Ok(items)
}

/// Read the `mel` tensor `[n_mel, frames]` from a safetensors file.
pub fn load_mel(path: &Path, n_mel_channels: usize) -> Result<Vec<f32>> {
    let (shape, values) = read_f32_tensor(path, MEL_TENSOR_NAME)?;
    match shape.as_slice() {
        [channels, _] if *channels == n_mel_channels => Ok(values),
        shape => bail!(
            "{}: expected mel shape [{n_mel_channels}, frames], found {shape:?}",
            path.display()
        ),
    }
}

/// Read a `style` vector of shape `[gst_dim]` or `[1, gst_dim]`.
pub fn load_style(path: &Path, gst_dim: usize) -> Result<Vec<f32>> {
    let (shape, values) = read_f32_tensor(path, STYLE_TENSOR_NAME)?;
    match shape.as_slice() {
        [dim] | [1, dim] if *dim == gst_dim => Ok(values),
        shape => bail!(
            "{}: expected style shape [{gst_dim}], found {shape:?}",
            path.display()
        ),
    }
}

fn read_f32_tensor(path: &Path, name: &str) -> Result<(Vec<usize>, Vec<f32>)> {
    let bytes =
        fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let tensors = SafeTensors::deserialize(&bytes)?;
    let view = tensors
        .tensor(name)
        .with_context(|| format!("{} has no '{name}' tensor", path.display()))?;
    if view.dtype() != Dtype::F32 {
        bail!("{}: expected F32 {name}, found {:?}", path.display(), view.dtype());
    }
    let values = view
        .data()
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();
    Ok((view.shape().to_vec(), values))
}

/// Write a `[n_mel, frames]` mel matrix as a safetensors file.
pub fn save_mel(path: &Path, mel: &[f32], n_mel_channels: usize) -> Result<()> {
    if n_mel_channels == 0 || mel.len() % n_mel_channels != 0 {
        bail!("Mel buffer does not divide into {n_mel_channels} channels");
    }
    crate::train::summary::write_matrix(
        path,
        MEL_TENSOR_NAME,
        n_mel_channels,
        mel.len() / n_mel_channels,
        mel,
    )
}
