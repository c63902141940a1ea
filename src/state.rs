//! Per-call decoder state and step accumulation.
//!
//! A [`DecoderState`] is created fresh at the start of every decoder call and
//! dropped when the call returns. Each step yields a [`StepRecord`]; records are
//! pushed into a pre-sized [`StepBuffer`] and assembled into batch-major
//! tensors once, by [`StepBuffer::finish`].

use crate::perf::{self, Metric};
use anyhow::{bail, Result};
use burn::tensor::{backend::Backend, Bool, Tensor};

/// Recurrent and attention state threaded through decoder steps.
#[derive(Debug, Clone)]
pub struct DecoderState<B: Backend> {
    /// Attention LSTM hidden state `[batch, attention_rnn_dim]`.
    pub attention_hidden: Tensor<B, 2>,
    /// Attention LSTM cell state `[batch, attention_rnn_dim]`.
    pub attention_cell: Tensor<B, 2>,
    /// Decoder LSTM hidden state `[batch, decoder_rnn_dim]`.
    pub decoder_hidden: Tensor<B, 2>,
    /// Decoder LSTM cell state `[batch, decoder_rnn_dim]`.
    pub decoder_cell: Tensor<B, 2>,
    /// Alignment from the previous step `[batch, t_in]`.
    pub attention_weights: Tensor<B, 2>,
    /// Running sum of all alignments so far `[batch, t_in]`.
    pub attention_weights_cum: Tensor<B, 2>,
    /// Attention context from the previous step `[batch, E]`.
    pub attention_context: Tensor<B, 2>,
    /// Encoder memory `[batch, t_in, E]`.
    pub memory: Tensor<B, 3>,
    /// Memory projected into attention space `[batch, t_in, attention_dim]`.
    pub processed_memory: Tensor<B, 3>,
    /// `true` at padded encoder positions.
    pub mask: Option<Tensor<B, 2, Bool>>,
}

impl<B: Backend> DecoderState<B> {
    /// Batch size of the call this state belongs to.
    pub fn batch_size(&self) -> usize {
        self.memory.dims()[0]
    }

    /// Stack the previous and cumulative alignment as `[batch, 2, t_in]`.
    pub fn weights_cat(&self) -> Tensor<B, 3> {
        Tensor::stack(
            vec![
                self.attention_weights.clone(),
                self.attention_weights_cum.clone(),
            ],
            1,
        )
    }
}

/// Output of one decoder step.
#[derive(Debug, Clone)]
pub struct StepRecord<B: Backend> {
    /// Frame group `[batch, n_mel * frames_per_step]`.
    pub mel: Tensor<B, 2>,
    /// Stop-gate logit `[batch, 1]`.
    pub gate: Tensor<B, 2>,
    /// Alignment `[batch, t_in]`.
    pub alignment: Tensor<B, 2>,
}

/// Batch-major output of a decoder call.
#[derive(Debug, Clone)]
pub struct DecoderOutput<B: Backend> {
    /// Mel frames `[batch, n_mel, steps * frames_per_step]`.
    pub mel: Tensor<B, 3>,
    /// Gate logits `[batch, steps * frames_per_step]`.
    pub gate: Tensor<B, 2>,
    /// Alignments `[batch, steps * frames_per_step, t_in]`.
    pub alignments: Tensor<B, 3>,
}

/// Collects step records for a single decoder call.
#[derive(Debug)]
pub struct StepBuffer<B: Backend> {
    records: Vec<StepRecord<B>>,
    n_mel_channels: usize,
    frames_per_step: usize,
}

impl<B: Backend> StepBuffer<B> {
    /// Reserve room for `capacity` steps.
    pub fn with_capacity(capacity: usize, n_mel_channels: usize, frames_per_step: usize) -> Self {
        Self {
            records: Vec::with_capacity(capacity),
            n_mel_channels,
            frames_per_step,
        }
    }

    pub fn push(&mut self, record: StepRecord<B>) {
        self.records.push(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Last emitted frame group, if any.
    pub fn last_mel(&self) -> Option<&Tensor<B, 2>> {
        self.records.last().map(|record| &record.mel)
    }

    /// Assemble all records, replicating gate and alignment per physical frame.
    pub fn finish(self) -> Result<DecoderOutput<B>> {
        let Some(first) = self.records.first() else {
            bail!("Decoder produced no steps");
        };
        let [batch, group] = first.mel.dims();
        if group != self.n_mel_channels * self.frames_per_step {
            bail!(
                "Step output width {group} does not match {} mel channels x {} frames",
                self.n_mel_channels,
                self.frames_per_step
            );
        }
        let t_in = first.alignment.dims()[1];
        let steps = self.records.len();
        let frames = steps * self.frames_per_step;
        let r = self.frames_per_step;
        perf::add_count(Metric::DecoderSteps, steps as u64);

        let mut mels = Vec::with_capacity(steps);
        let mut gates = Vec::with_capacity(steps);
        let mut alignments = Vec::with_capacity(steps);
        for record in self.records {
            mels.push(record.mel);
            gates.push(record.gate);
            alignments.push(record.alignment);
        }

        let mel = Tensor::stack::<3>(mels, 1)
            .reshape([batch, frames, self.n_mel_channels])
            .swap_dims(1, 2);
        let gate = Tensor::cat(gates, 1)
            .unsqueeze_dim::<3>(2)
            .repeat_dim(2, r)
            .reshape([batch, frames]);
        let alignments = Tensor::stack::<3>(alignments, 1)
            .unsqueeze_dim::<4>(2)
            .repeat_dim(2, r)
            .reshape([batch, frames, t_in]);
        Ok(DecoderOutput {
            mel,
            gate,
            alignments,
        })
    }
}
