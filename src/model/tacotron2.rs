//! Top-level Tacotron 2 model: symbol embedding, encoder, optional speaker and
//! style conditioning, decoder, postnet and output masking.

use crate::config::{HParams, GST_TORCHMOJI};
use crate::data::Batch;
use crate::modules::{
    decoder::{Decoder, DecoderConfig},
    encoder::{Encoder, EncoderConfig},
    mask::padding_mask,
    postnet::{Postnet, PostnetConfig},
};
use crate::state::DecoderOutput;
use anyhow::{anyhow, bail, Result};
use burn::{
    module::Module,
    tensor::{backend::Backend, Int, Tensor},
};
use burn_nn::{Embedding, EmbeddingConfig, Initializer, Linear, LinearConfig};
use rand::Rng;

/// Gate logit written beyond each example's length ("stopped").
pub const MASKED_GATE_VALUE: f32 = 1e3;

/// Speaker embedding projected into encoder space.
#[derive(Module, Debug)]
pub struct SpeakerConditioning<B: Backend> {
    pub embedding: Embedding<B>,
    pub projection: Linear<B>,
}

impl<B: Backend> SpeakerConditioning<B> {
    /// Map speaker ids `[batch]` to an additive term `[batch, 1, E]`.
    pub fn forward(&self, speaker_ids: Tensor<B, 1, Int>) -> Tensor<B, 3> {
        let [batch] = speaker_ids.dims();
        self.projection
            .forward(self.embedding.forward(speaker_ids.reshape([batch, 1])))
    }
}

/// Projection of an externally computed style vector into encoder space.
#[derive(Module, Debug)]
pub struct StyleConditioning<B: Backend> {
    pub projection: Linear<B>,
}

impl<B: Backend> StyleConditioning<B> {
    /// Map style vectors `[batch, gst_dim]` to an additive term `[batch, 1, E]`.
    pub fn forward(&self, style: Tensor<B, 2>) -> Tensor<B, 3> {
        self.projection.forward(style).unsqueeze_dim::<3>(1)
    }
}

/// Output bundle of every model entry point.
#[derive(Debug, Clone)]
pub struct ModelOutput<B: Backend> {
    /// Decoder mel `[batch, n_mel, frames]`.
    pub mel_outputs: Tensor<B, 3>,
    /// Decoder mel plus postnet residual `[batch, n_mel, frames]`.
    pub mel_outputs_postnet: Tensor<B, 3>,
    /// Stop-gate logits `[batch, frames]`.
    pub gate_predicted: Tensor<B, 2>,
    /// Alignments `[batch, frames, t_in]`.
    pub alignments: Tensor<B, 3>,
    /// Valid frames per example.
    pub output_lengths: Vec<usize>,
}

/// Tacotron 2 spectrogram model.
#[derive(Module, Debug)]
pub struct Tacotron2<B: Backend> {
    pub embedding: Embedding<B>,
    pub encoder: Encoder<B>,
    pub decoder: Decoder<B>,
    pub postnet: Postnet<B>,
    pub speaker: Option<SpeakerConditioning<B>>,
    pub style: Option<StyleConditioning<B>>,
    pub mask_padding: bool,
    pub n_mel_channels: usize,
}

impl<B: Backend> Tacotron2<B> {
    /// Build a freshly initialised model.
    ///
    /// Fails on inconsistent hyperparameters, e.g. several speakers without a
    /// speaker embedding or an unknown `gst_type`.
    pub fn from_hparams(hparams: &HParams, device: &B::Device) -> Result<Self> {
        hparams.validate()?;
        let n_symbols = hparams.n_symbols;
        let dim = hparams.symbols_embedding_dim;
        let bound = 3f64.sqrt() * (2.0 / (n_symbols + dim) as f64).sqrt();
        let embedding = EmbeddingConfig::new(n_symbols, dim)
            .with_initializer(Initializer::Uniform {
                min: -bound,
                max: bound,
            })
            .init(device);

        let speaker = if hparams.n_speakers > 1 {
            Some(SpeakerConditioning {
                embedding: EmbeddingConfig::new(hparams.n_speakers, hparams.speaker_embedding_dim)
                    .init(device),
                projection: LinearConfig::new(
                    hparams.speaker_embedding_dim,
                    hparams.encoder_embedding_dim,
                )
                .init(device),
            })
        } else {
            None
        };
        let style = match (hparams.gst_type.as_deref(), hparams.gst_dim) {
            (None, _) => None,
            (Some(GST_TORCHMOJI), Some(gst_dim)) => {
                log::info!("Initialized {GST_TORCHMOJI} style conditioning");
                Some(StyleConditioning {
                    projection: LinearConfig::new(gst_dim, hparams.encoder_embedding_dim)
                        .init(device),
                })
            }
            (Some(GST_TORCHMOJI), None) => bail!("gst_dim must be set"),
            (Some(other), _) => bail!("Unknown gst_type {other:?}"),
        };

        Ok(Self {
            embedding,
            encoder: EncoderConfig::new(
                hparams.encoder_n_convolutions,
                hparams.encoder_embedding_dim,
                hparams.encoder_kernel_size,
            )
            .init(device),
            decoder: DecoderConfig::from_hparams(hparams).init(device),
            postnet: PostnetConfig {
                n_mel_channels: hparams.n_mel_channels,
                embedding_dim: hparams.postnet_embedding_dim,
                kernel_size: hparams.postnet_kernel_size,
                n_convolutions: hparams.postnet_n_convolutions,
            }
            .init(device),
            speaker,
            style,
            mask_padding: hparams.mask_padding,
            n_mel_channels: hparams.n_mel_channels,
        })
    }

    /// Frames the decoder currently emits per step.
    pub fn frames_per_step(&self) -> usize {
        self.decoder.frames_per_step()
    }

    /// Change frames per step; must be in `1..=n_frames_per_step_initial`.
    pub fn set_frames_per_step(&mut self, frames: usize) -> Result<()> {
        self.decoder.set_frames_per_step(frames)
    }

    /// Teacher-forced forward pass used for training.
    pub fn forward<R: Rng + ?Sized>(
        &self,
        batch: &Batch<B>,
        rng: &mut R,
    ) -> Result<ModelOutput<B>> {
        let target = batch
            .mel
            .clone()
            .ok_or_else(|| anyhow!("Teacher-forced forward requires target mel"))?;
        let output_lengths = batch
            .output_lengths
            .clone()
            .ok_or_else(|| anyhow!("Teacher-forced forward requires output lengths"))?;
        let memory = self.encode(
            batch.text.clone(),
            &batch.input_lengths,
            batch.speaker_ids.clone(),
            batch.style.clone(),
            rng,
        )?;
        let decoded = self
            .decoder
            .forward(memory, target, &batch.input_lengths, rng)?;
        Ok(self.finish(decoded, output_lengths, true, rng))
    }

    /// Free-running synthesis. Output lengths come from the stop gate.
    pub fn inference<R: Rng + ?Sized>(
        &self,
        text: Tensor<B, 2, Int>,
        input_lengths: &[usize],
        speaker_ids: Option<Tensor<B, 1, Int>>,
        style: Option<Tensor<B, 2>>,
        rng: &mut R,
    ) -> Result<ModelOutput<B>> {
        let memory = self.encode(text, input_lengths, speaker_ids, style, rng)?;
        let (decoded, lengths) = self.decoder.inference(memory, input_lengths, rng)?;
        Ok(self.finish(decoded, lengths, true, rng))
    }

    /// Synthesis driven by supplied alignments `[batch, steps, t_in]`.
    ///
    /// Every example gets the full `steps * frames_per_step` frames; no
    /// length mask is applied.
    pub fn inference_noattention<R: Rng + ?Sized>(
        &self,
        text: Tensor<B, 2, Int>,
        input_lengths: &[usize],
        speaker_ids: Option<Tensor<B, 1, Int>>,
        style: Option<Tensor<B, 2>>,
        alignments: Tensor<B, 3>,
        rng: &mut R,
    ) -> Result<ModelOutput<B>> {
        let memory = self.encode(text, input_lengths, speaker_ids, style, rng)?;
        let (decoded, lengths) = self.decoder.inference_noattention(memory, alignments, rng)?;
        Ok(self.finish(decoded, lengths, false, rng))
    }

    /// Synthesis teacher-forced from `tf_mel` `[batch, n_mel, frames]` for the
    /// first `tf_until_idx` decoder steps, free-running afterwards.
    #[allow(clippy::too_many_arguments)]
    pub fn inference_partial_tf<R: Rng + ?Sized>(
        &self,
        text: Tensor<B, 2, Int>,
        input_lengths: &[usize],
        speaker_ids: Option<Tensor<B, 1, Int>>,
        style: Option<Tensor<B, 2>>,
        tf_mel: Tensor<B, 3>,
        tf_until_idx: usize,
        rng: &mut R,
    ) -> Result<ModelOutput<B>> {
        let memory = self.encode(text, input_lengths, speaker_ids, style, rng)?;
        let (decoded, lengths) = self.decoder.inference_partial_tf(
            memory,
            input_lengths,
            tf_mel,
            tf_until_idx,
            rng,
        )?;
        Ok(self.finish(decoded, lengths, true, rng))
    }

    /// Teacher-forced alignments `[batch, frames, t_in]` for diagnostics.
    pub fn alignments<R: Rng + ?Sized>(
        &self,
        batch: &Batch<B>,
        rng: &mut R,
    ) -> Result<Tensor<B, 3>> {
        let target = batch
            .mel
            .clone()
            .ok_or_else(|| anyhow!("Alignment extraction requires target mel"))?;
        let memory = self.encode(
            batch.text.clone(),
            &batch.input_lengths,
            batch.speaker_ids.clone(),
            batch.style.clone(),
            rng,
        )?;
        let decoded = self
            .decoder
            .forward(memory, target, &batch.input_lengths, rng)?;
        Ok(decoded.alignments)
    }

    /// Embed, encode and condition symbol ids `[batch, t_in]`.
    ///
    /// Outside training a batch without padding is convolved jointly; any
    /// padded batch takes the per-example path so padding never reaches a
    /// shorter example's kernel windows.
    pub fn encode<R: Rng + ?Sized>(
        &self,
        text: Tensor<B, 2, Int>,
        input_lengths: &[usize],
        speaker_ids: Option<Tensor<B, 1, Int>>,
        style: Option<Tensor<B, 2>>,
        rng: &mut R,
    ) -> Result<Tensor<B, 3>> {
        let embedded = self.embedding.forward(text).swap_dims(1, 2);
        let unpadded = input_lengths.windows(2).all(|pair| pair[0] == pair[1]);
        let mut memory = if unpadded && !B::ad_enabled() {
            self.encoder.inference(embedded, input_lengths, rng)?
        } else {
            self.encoder.forward(embedded, input_lengths, rng)?
        };
        if let Some(speaker) = &self.speaker {
            let ids = speaker_ids.ok_or_else(|| {
                anyhow!("Speaker ids are required: the model has a speaker embedding")
            })?;
            memory = memory + speaker.forward(ids);
        }
        if let Some(conditioning) = &self.style {
            let style = style.ok_or_else(|| {
                anyhow!("Style vectors are required: gst_type was set to {GST_TORCHMOJI}")
            })?;
            memory = memory + conditioning.forward(style);
        }
        Ok(memory)
    }

    fn finish<R: Rng + ?Sized>(
        &self,
        decoded: DecoderOutput<B>,
        lengths: Vec<usize>,
        mask: bool,
        rng: &mut R,
    ) -> ModelOutput<B> {
        let residual = self.postnet.forward(decoded.mel.clone(), rng);
        let mel_outputs_postnet = decoded.mel.clone() + residual;
        let output = ModelOutput {
            mel_outputs: decoded.mel,
            mel_outputs_postnet,
            gate_predicted: decoded.gate,
            alignments: decoded.alignments,
            output_lengths: lengths,
        };
        if mask {
            self.mask_output(output)
        } else {
            output
        }
    }

    /// Zero mel values and alignment rows at `t >= length` and mark the gate
    /// as stopped there. A no-op when `mask_padding` is off.
    pub fn mask_output(&self, output: ModelOutput<B>) -> ModelOutput<B> {
        if !self.mask_padding {
            return output;
        }
        let [batch, channels, frames] = output.mel_outputs.dims();
        let t_in = output.alignments.dims()[2];
        let device = output.mel_outputs.device();
        let mask = padding_mask::<B>(&output.output_lengths, frames, &device);
        let mel_mask = mask
            .clone()
            .reshape([batch, 1, frames])
            .repeat_dim(1, channels);
        let alignment_mask = mask.clone().reshape([batch, frames, 1]).repeat_dim(2, t_in);
        ModelOutput {
            mel_outputs: output.mel_outputs.mask_fill(mel_mask.clone(), 0.0),
            mel_outputs_postnet: output.mel_outputs_postnet.mask_fill(mel_mask, 0.0),
            gate_predicted: output.gate_predicted.mask_fill(mask, MASKED_GATE_VALUE),
            alignments: output.alignments.mask_fill(alignment_mask, 0.0),
            output_lengths: output.output_lengths,
        }
    }
}
