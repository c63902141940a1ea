//! Autoregressive mel decoder with location-sensitive attention.
//!
//! One decoder call moves through three phases: [`Decoder::init_state`] builds
//! a fresh [`DecoderState`], [`Decoder::step`] advances it one frame group at a
//! time, and [`StepBuffer::finish`] turns the collected records into
//! batch-major tensors. The public entry points differ only in how the next
//! decoder input is chosen and when the loop stops.
//!
//! Every random decision (pre-net dropout, recurrent dropout, teacher-forcing
//! draws) comes from the caller's RNG. Recurrent dropout is applied only when
//! the backend records gradients.

use crate::config::HParams;
use crate::modules::{
    attention::{AttentionConfig, LocationSensitiveAttention},
    dropout::dropout,
    layers::{xavier_linear, InitGain},
    mask::{padding_mask, tensor_to_vec},
    prenet::{Prenet, PrenetConfig},
};
use crate::state::{DecoderOutput, DecoderState, StepBuffer, StepRecord};
use anyhow::{bail, Result};
use burn::{
    module::Module,
    tensor::{activation::sigmoid, backend::Backend, Bool, Int, Tensor, TensorData},
};
use burn_nn::{
    lstm::{Lstm, LstmConfig, LstmState},
    Linear,
};
use rand::Rng;

/// Configuration for [`Decoder`].
#[derive(Debug, Clone)]
pub struct DecoderConfig {
    pub n_mel_channels: usize,
    pub frames_per_step_initial: usize,
    pub encoder_embedding_dim: usize,
    pub attention_rnn_dim: usize,
    pub decoder_rnn_dim: usize,
    pub prenet_dim: usize,
    pub max_decoder_steps: usize,
    pub gate_threshold: f64,
    pub p_attention_dropout: f64,
    pub p_decoder_dropout: f64,
    pub p_teacher_forcing: f64,
    pub attention: AttentionConfig,
}

impl DecoderConfig {
    pub fn from_hparams(hparams: &HParams) -> Self {
        Self {
            n_mel_channels: hparams.n_mel_channels,
            frames_per_step_initial: hparams.n_frames_per_step_initial,
            encoder_embedding_dim: hparams.encoder_embedding_dim,
            attention_rnn_dim: hparams.attention_rnn_dim,
            decoder_rnn_dim: hparams.decoder_rnn_dim,
            prenet_dim: hparams.prenet_dim,
            max_decoder_steps: hparams.max_decoder_steps,
            gate_threshold: hparams.gate_threshold,
            p_attention_dropout: hparams.p_attention_dropout,
            p_decoder_dropout: hparams.p_decoder_dropout,
            p_teacher_forcing: hparams.p_teacher_forcing,
            attention: AttentionConfig {
                attention_rnn_dim: hparams.attention_rnn_dim,
                embedding_dim: hparams.encoder_embedding_dim,
                attention_dim: hparams.attention_dim,
                location_n_filters: hparams.attention_location_n_filters,
                location_kernel_size: hparams.attention_location_kernel_size,
                score_mask_value: hparams.score_mask_value(),
            },
        }
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> Decoder<B> {
        let context_dim = self.encoder_embedding_dim;
        Decoder {
            prenet: PrenetConfig::new(self.n_mel_channels, vec![self.prenet_dim, self.prenet_dim])
                .init(device),
            attention_rnn: LstmConfig::new(
                self.prenet_dim + context_dim,
                self.attention_rnn_dim,
                true,
            )
            .init(device),
            attention_layer: self.attention.init(device),
            decoder_rnn: LstmConfig::new(
                self.attention_rnn_dim + context_dim,
                self.decoder_rnn_dim,
                true,
            )
            .init(device),
            linear_projection: xavier_linear(
                self.decoder_rnn_dim + context_dim,
                self.n_mel_channels * self.frames_per_step_initial,
                true,
                InitGain::Linear,
                device,
            ),
            gate_layer: xavier_linear(
                self.decoder_rnn_dim + context_dim,
                1,
                true,
                InitGain::Sigmoid,
                device,
            ),
            n_mel_channels: self.n_mel_channels,
            frames_per_step_initial: self.frames_per_step_initial,
            frames_per_step_current: self.frames_per_step_initial,
            encoder_embedding_dim: self.encoder_embedding_dim,
            attention_rnn_dim: self.attention_rnn_dim,
            decoder_rnn_dim: self.decoder_rnn_dim,
            max_decoder_steps: self.max_decoder_steps,
            gate_threshold: self.gate_threshold,
            p_attention_dropout: self.p_attention_dropout,
            p_decoder_dropout: self.p_decoder_dropout,
            p_teacher_forcing: self.p_teacher_forcing,
        }
    }
}

/// Tacotron 2 decoder.
#[derive(Module, Debug)]
pub struct Decoder<B: Backend> {
    pub prenet: Prenet<B>,
    pub attention_rnn: Lstm<B>,
    pub attention_layer: LocationSensitiveAttention<B>,
    pub decoder_rnn: Lstm<B>,
    /// Projects `[decoder hidden, context]` to `n_mel * frames_per_step_initial`.
    pub linear_projection: Linear<B>,
    pub gate_layer: Linear<B>,
    pub n_mel_channels: usize,
    pub frames_per_step_initial: usize,
    pub frames_per_step_current: usize,
    pub encoder_embedding_dim: usize,
    pub attention_rnn_dim: usize,
    pub decoder_rnn_dim: usize,
    pub max_decoder_steps: usize,
    pub gate_threshold: f64,
    pub p_attention_dropout: f64,
    pub p_decoder_dropout: f64,
    pub p_teacher_forcing: f64,
}

impl<B: Backend> Decoder<B> {
    /// Frames emitted per decoder step.
    pub fn frames_per_step(&self) -> usize {
        self.frames_per_step_current
    }

    /// Change the number of frames emitted per step.
    pub fn set_frames_per_step(&mut self, frames: usize) -> Result<()> {
        if frames == 0 || frames > self.frames_per_step_initial {
            bail!(
                "frames per step must be in 1..={}, got {frames}",
                self.frames_per_step_initial
            );
        }
        self.frames_per_step_current = frames;
        Ok(())
    }

    /// All-zero frame fed as the first decoder input.
    pub fn go_frame(&self, batch: usize, device: &B::Device) -> Tensor<B, 2> {
        Tensor::zeros([batch, self.n_mel_channels], device)
    }

    /// Build a zeroed state over `memory` `[batch, t_in, E]`.
    pub fn init_state(
        &self,
        memory: Tensor<B, 3>,
        mask: Option<Tensor<B, 2, Bool>>,
    ) -> DecoderState<B> {
        let [batch, t_in, _] = memory.dims();
        let device = memory.device();
        let processed_memory = self.attention_layer.process_memory(memory.clone());
        DecoderState {
            attention_hidden: Tensor::zeros([batch, self.attention_rnn_dim], &device),
            attention_cell: Tensor::zeros([batch, self.attention_rnn_dim], &device),
            decoder_hidden: Tensor::zeros([batch, self.decoder_rnn_dim], &device),
            decoder_cell: Tensor::zeros([batch, self.decoder_rnn_dim], &device),
            attention_weights: Tensor::zeros([batch, t_in], &device),
            attention_weights_cum: Tensor::zeros([batch, t_in], &device),
            attention_context: Tensor::zeros([batch, self.encoder_embedding_dim], &device),
            memory,
            processed_memory,
            mask,
        }
    }

    /// Advance the state by one step given a pre-net output `[batch, prenet_dim]`.
    ///
    /// `supplied` replaces the learned alignment for this step.
    pub fn step<R: Rng + ?Sized>(
        &self,
        state: &mut DecoderState<B>,
        prenet_output: Tensor<B, 2>,
        supplied: Option<Tensor<B, 2>>,
        rng: &mut R,
    ) -> StepRecord<B> {
        let training = B::ad_enabled();
        let batch = state.batch_size();

        let cell_input = Tensor::cat(vec![prenet_output, state.attention_context.clone()], 1);
        let (hidden, cell) = lstm_cell(
            &self.attention_rnn,
            cell_input,
            state.attention_hidden.clone(),
            state.attention_cell.clone(),
        );
        let (hidden, cell) = if training {
            (
                dropout(hidden, self.p_attention_dropout, rng),
                dropout(cell, self.p_attention_dropout, rng),
            )
        } else {
            (hidden, cell)
        };
        state.attention_hidden = hidden;
        state.attention_cell = cell;

        let (context, weights) = self.attention_layer.forward(
            state.attention_hidden.clone(),
            state.memory.clone(),
            state.processed_memory.clone(),
            state.weights_cat(),
            state.mask.clone(),
            supplied,
        );
        state.attention_weights_cum = state.attention_weights_cum.clone() + weights.clone();
        state.attention_weights = weights.clone();
        state.attention_context = context;

        let cell_input = Tensor::cat(
            vec![
                state.attention_hidden.clone(),
                state.attention_context.clone(),
            ],
            1,
        );
        let (hidden, cell) = lstm_cell(
            &self.decoder_rnn,
            cell_input,
            state.decoder_hidden.clone(),
            state.decoder_cell.clone(),
        );
        let (hidden, cell) = if training {
            (
                dropout(hidden, self.p_decoder_dropout, rng),
                dropout(cell, self.p_decoder_dropout, rng),
            )
        } else {
            (hidden, cell)
        };
        state.decoder_hidden = hidden;
        state.decoder_cell = cell;

        let projection_input = Tensor::cat(
            vec![
                state.decoder_hidden.clone(),
                state.attention_context.clone(),
            ],
            1,
        );
        let width = self.n_mel_channels * self.frames_per_step_current;
        let mel = self
            .linear_projection
            .forward(projection_input.clone())
            .narrow(1, 0, width);
        let gate = self.gate_layer.forward(projection_input).reshape([batch, 1]);
        StepRecord {
            mel,
            gate,
            alignment: weights,
        }
    }

    /// Teacher-forced decoding over `target` `[batch, n_mel, t_out]`.
    ///
    /// Runs `t_out / frames_per_step` steps. Step 0 reads the go frame and step
    /// `i` reads the last ground-truth frame of group `i - 1`, or with
    /// probability `1 - p_teacher_forcing` the model's own last frame.
    pub fn forward<R: Rng + ?Sized>(
        &self,
        memory: Tensor<B, 3>,
        target: Tensor<B, 3>,
        memory_lengths: &[usize],
        rng: &mut R,
    ) -> Result<DecoderOutput<B>> {
        let [batch, t_in, _] = memory.dims();
        self.check_target(&target, batch)?;
        let steps = self.teacher_steps(target.dims()[2])?;
        let device = memory.device();

        let inputs = self.teacher_inputs(target, steps, rng);
        let mask = padding_mask::<B>(memory_lengths, t_in, &device);
        let mut state = self.init_state(memory, Some(mask));
        let mut buffer =
            StepBuffer::with_capacity(steps, self.n_mel_channels, self.frames_per_step_current);
        let p = self.p_teacher_forcing;

        for i in 0..steps {
            let use_teacher = i == 0 || p >= 1.0 || rng.random::<f64>() < p;
            let prenet_output = match buffer.last_mel() {
                Some(mel) if !use_teacher => {
                    let frame = self.last_frame(mel.clone());
                    self.prenet.forward(frame, rng)
                }
                _ => self.teacher_input(&inputs, i),
            };
            let record = self.step(&mut state, prenet_output, None, rng);
            buffer.push(record);
        }
        buffer.finish()
    }

    /// Free-running decoding until every example's stop gate fires or the
    /// step cap is reached. Returns lengths in frames.
    pub fn inference<R: Rng + ?Sized>(
        &self,
        memory: Tensor<B, 3>,
        memory_lengths: &[usize],
        rng: &mut R,
    ) -> Result<(DecoderOutput<B>, Vec<usize>)> {
        let [batch, t_in, _] = memory.dims();
        check_memory_lengths(memory_lengths, batch)?;
        let mask = padding_mask::<B>(memory_lengths, t_in, &memory.device());
        let state = self.init_state(memory, Some(mask));
        self.run_until_stop(state, None, rng)
    }

    /// Decode with supplied alignments `[batch, steps, t_in]` in place of the
    /// learned attention. Runs exactly `steps` steps.
    pub fn inference_noattention<R: Rng + ?Sized>(
        &self,
        memory: Tensor<B, 3>,
        alignments: Tensor<B, 3>,
        rng: &mut R,
    ) -> Result<(DecoderOutput<B>, Vec<usize>)> {
        let [batch, t_in, _] = memory.dims();
        let [align_batch, steps, align_t_in] = alignments.dims();
        if align_batch != batch || align_t_in != t_in {
            bail!(
                "Alignments {:?} do not match memory batch {batch} and length {t_in}",
                alignments.dims()
            );
        }
        if steps == 0 {
            bail!("Alignments must cover at least one decoder step");
        }
        let device = memory.device();
        let mut state = self.init_state(memory, None);
        let mut buffer =
            StepBuffer::with_capacity(steps, self.n_mel_channels, self.frames_per_step_current);
        let mut frame = self.go_frame(batch, &device);
        for i in 0..steps {
            let supplied = alignments.clone().narrow(1, i, 1).reshape([batch, t_in]);
            let prenet_output = self.prenet.forward(frame, rng);
            let record = self.step(&mut state, prenet_output, Some(supplied), rng);
            frame = self.last_frame(record.mel.clone());
            buffer.push(record);
        }
        let lengths = vec![steps * self.frames_per_step_current; batch];
        Ok((buffer.finish()?, lengths))
    }

    /// Teacher-force the first `tf_until_idx` steps from `tf_mel`
    /// `[batch, n_mel, frames]`, then decode freely.
    pub fn inference_partial_tf<R: Rng + ?Sized>(
        &self,
        memory: Tensor<B, 3>,
        memory_lengths: &[usize],
        tf_mel: Tensor<B, 3>,
        tf_until_idx: usize,
        rng: &mut R,
    ) -> Result<(DecoderOutput<B>, Vec<usize>)> {
        let [batch, t_in, _] = memory.dims();
        check_memory_lengths(memory_lengths, batch)?;
        self.check_target(&tf_mel, batch)?;
        let frames = tf_mel.dims()[2];
        let r = self.frames_per_step_current;
        if tf_until_idx * r > frames {
            bail!(
                "tf_until_idx {tf_until_idx} needs {} teacher frames but only {frames} were supplied",
                tf_until_idx * r
            );
        }
        let mask = padding_mask::<B>(memory_lengths, t_in, &memory.device());
        let state = self.init_state(memory, Some(mask));
        let teacher = if tf_until_idx > 0 {
            Some((self.teacher_inputs(tf_mel, tf_until_idx, rng), tf_until_idx))
        } else {
            None
        };
        self.run_until_stop(state, teacher, rng)
    }

    /// Shared free-running loop; `teacher` holds pre-net outputs for the
    /// first `n` steps.
    fn run_until_stop<R: Rng + ?Sized>(
        &self,
        mut state: DecoderState<B>,
        teacher: Option<(Tensor<B, 3>, usize)>,
        rng: &mut R,
    ) -> Result<(DecoderOutput<B>, Vec<usize>)> {
        let batch = state.batch_size();
        let device = state.memory.device();
        let r = self.frames_per_step_current;
        let mut buffer =
            StepBuffer::with_capacity(self.max_decoder_steps, self.n_mel_channels, r);
        let mut lengths = vec![0usize; batch];
        let mut active = vec![true; batch];
        let mut frame = self.go_frame(batch, &device);

        loop {
            let step = buffer.len();
            let prenet_output = match &teacher {
                Some((inputs, until)) if step < *until => self.teacher_input(inputs, step),
                _ => self.prenet.forward(frame, rng),
            };
            let record = self.step(&mut state, prenet_output, None, rng);
            let stop_probs = tensor_to_vec(sigmoid(record.gate.clone()))?;
            frame = self.last_frame(record.mel.clone());
            buffer.push(record);

            for (b, prob) in stop_probs.iter().enumerate() {
                if active[b] {
                    lengths[b] += r;
                    if f64::from(*prob) > self.gate_threshold {
                        active[b] = false;
                    }
                }
            }
            if !active.iter().any(|&a| a) {
                break;
            }
            if buffer.len() >= self.max_decoder_steps {
                log::warn!(
                    "Reached max decoder steps ({}); returning truncated output",
                    self.max_decoder_steps
                );
                break;
            }
        }
        Ok((buffer.finish()?, lengths))
    }

    fn check_target(&self, target: &Tensor<B, 3>, batch: usize) -> Result<()> {
        let [target_batch, channels, _] = target.dims();
        if target_batch != batch {
            bail!("Target mel batch {target_batch} does not match memory batch {batch}");
        }
        if channels != self.n_mel_channels {
            bail!(
                "Target mel has {channels} channels, expected {}",
                self.n_mel_channels
            );
        }
        Ok(())
    }

    fn teacher_steps(&self, t_out: usize) -> Result<usize> {
        let r = self.frames_per_step_current;
        if t_out == 0 {
            bail!("Target mel has no frames");
        }
        if t_out % r != 0 {
            bail!("Target mel length {t_out} is not a multiple of {r} frames per step");
        }
        Ok(t_out / r)
    }

    /// Pre-net outputs `[batch, steps, prenet_dim]` for teacher-forced steps.
    fn teacher_inputs<R: Rng + ?Sized>(
        &self,
        target: Tensor<B, 3>,
        steps: usize,
        rng: &mut R,
    ) -> Tensor<B, 3> {
        let [batch, channels, _] = target.dims();
        let device = target.device();
        let r = self.frames_per_step_current;
        let go = self.go_frame(batch, &device).reshape([batch, 1, channels]);
        let inputs = if steps > 1 {
            let indices: Vec<i64> = (1..steps).map(|i| (i * r - 1) as i64).collect();
            let indices =
                Tensor::<B, 1, Int>::from_data(TensorData::new(indices, [steps - 1]), &device);
            let previous = target.swap_dims(1, 2).select(1, indices);
            Tensor::cat(vec![go, previous], 1)
        } else {
            go
        };
        self.prenet.forward(inputs, rng)
    }

    fn teacher_input(&self, inputs: &Tensor<B, 3>, step: usize) -> Tensor<B, 2> {
        let [batch, _, width] = inputs.dims();
        inputs.clone().narrow(1, step, 1).reshape([batch, width])
    }

    /// Last physical frame `[batch, n_mel]` of a frame group.
    fn last_frame(&self, mel: Tensor<B, 2>) -> Tensor<B, 2> {
        let start = self.n_mel_channels * (self.frames_per_step_current - 1);
        mel.narrow(1, start, self.n_mel_channels)
    }
}

/// One step of an LSTM layer used as a cell: `[batch, d_in]` in, new `(hidden, cell)` out.
fn lstm_cell<B: Backend>(
    lstm: &Lstm<B>,
    input: Tensor<B, 2>,
    hidden: Tensor<B, 2>,
    cell: Tensor<B, 2>,
) -> (Tensor<B, 2>, Tensor<B, 2>) {
    let (_, state) = lstm.forward(
        input.unsqueeze_dim::<3>(1),
        Some(LstmState::new(cell, hidden)),
    );
    (state.hidden, state.cell)
}

fn check_memory_lengths(lengths: &[usize], batch: usize) -> Result<()> {
    if lengths.len() != batch {
        bail!("Expected {batch} memory lengths, got {}", lengths.len());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::module::Param;
    use burn::tensor::Distribution;
    use burn_ndarray::{NdArray, NdArrayDevice};
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    type TestBackend = NdArray<f32>;

    fn small_hparams() -> HParams {
        HParams {
            n_mel_channels: 3,
            encoder_embedding_dim: 4,
            symbols_embedding_dim: 4,
            attention_rnn_dim: 6,
            decoder_rnn_dim: 6,
            prenet_dim: 5,
            attention_dim: 4,
            attention_location_n_filters: 2,
            attention_location_kernel_size: 3,
            max_decoder_steps: 7,
            n_frames_per_step_initial: 2,
            ..HParams::default()
        }
    }

    fn decoder(device: &NdArrayDevice) -> Decoder<TestBackend> {
        DecoderConfig::from_hparams(&small_hparams()).init(device)
    }

    fn memory(batch: usize, t_in: usize, device: &NdArrayDevice) -> Tensor<TestBackend, 3> {
        Tensor::random([batch, t_in, 4], Distribution::Normal(0.0, 1.0), device)
    }

    fn force_gate(decoder: &mut Decoder<TestBackend>, logit: f32, device: &NdArrayDevice) {
        decoder.gate_layer.weight = Param::from_tensor(Tensor::zeros([10, 1], device));
        decoder.gate_layer.bias = Some(Param::from_tensor(Tensor::from_floats([logit], device)));
    }

    fn gate_on_context(decoder: &mut Decoder<TestBackend>, device: &NdArrayDevice) {
        let weights: Vec<f32> = (0..10).map(|i| if i < 6 { 0.0 } else { 1.0 }).collect();
        decoder.gate_layer.weight =
            Param::from_tensor(Tensor::from_data(TensorData::new(weights, [10, 1]), device));
        decoder.gate_layer.bias = Some(Param::from_tensor(Tensor::zeros([1], device)));
    }

    #[test]
    fn own_predictions_feed_back_without_teacher_forcing() {
        let device = NdArrayDevice::default();
        let teacher = decoder(&device);
        let mut free = teacher.clone();
        free.p_teacher_forcing = 0.0;
        let memory = memory(2, 5, &device);
        let target = Tensor::<TestBackend, 3>::ones([2, 3, 8], &device);

        let forced = teacher
            .forward(
                memory.clone(),
                target.clone(),
                &[5, 3],
                &mut ChaCha8Rng::seed_from_u64(6),
            )
            .expect("teacher forced");
        let own = free
            .forward(memory, target, &[5, 3], &mut ChaCha8Rng::seed_from_u64(6))
            .expect("own predictions");
        assert_eq!(own.mel.dims(), [2, 3, 8]);
        assert_eq!(own.gate.dims(), [2, 8]);
        assert_eq!(own.alignments.dims(), [2, 8, 5]);

        let forced = tensor_to_vec(forced.mel).expect("forced");
        let own = tensor_to_vec(own.mel).expect("own");
        let diff = forced
            .iter()
            .zip(own.iter())
            .map(|(a, b)| (a - b).abs())
            .fold(0.0f32, f32::max);
        assert!(diff > 1e-6, "feeding back own frames changed nothing");
    }

    #[test]
    fn examples_stop_on_their_own_steps() {
        let device = NdArrayDevice::default();
        let mut decoder = decoder(&device);
        gate_on_context(&mut decoder, &device);
        // Context averages memory, so the first example's gate is +20 and
        // the second's is -20 on every step.
        let memory = Tensor::cat(
            vec![
                Tensor::<TestBackend, 3>::ones([1, 3, 4], &device).mul_scalar(5.0),
                Tensor::<TestBackend, 3>::ones([1, 3, 4], &device).mul_scalar(-5.0),
            ],
            0,
        );
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let (output, lengths) = decoder
            .inference(memory, &[3, 2], &mut rng)
            .expect("inference");
        assert_eq!(lengths, vec![2, 14]);
        assert_eq!(output.mel.dims(), [2, 3, 14]);

        let gate = tensor_to_vec(output.gate).expect("gate");
        assert!(gate[..14].iter().all(|&g| g > 10.0));
        assert!(gate[14..].iter().all(|&g| g < -10.0));
    }

    #[test]
    fn teacher_forced_shapes_follow_target() {
        let device = NdArrayDevice::default();
        let decoder = decoder(&device);
        let target = Tensor::<TestBackend, 3>::ones([2, 3, 6], &device);
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let output = decoder
            .forward(memory(2, 5, &device), target, &[5, 3], &mut rng)
            .expect("forward");
        assert_eq!(output.mel.dims(), [2, 3, 6]);
        assert_eq!(output.gate.dims(), [2, 6]);
        assert_eq!(output.alignments.dims(), [2, 6, 5]);
    }

    #[test]
    fn target_length_must_divide_by_frames_per_step() {
        let device = NdArrayDevice::default();
        let decoder = decoder(&device);
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let target = Tensor::<TestBackend, 3>::ones([1, 3, 5], &device);
        assert!(decoder
            .forward(memory(1, 4, &device), target, &[4], &mut rng)
            .is_err());
        let wrong_channels = Tensor::<TestBackend, 3>::ones([1, 2, 4], &device);
        assert!(decoder
            .forward(memory(1, 4, &device), wrong_channels, &[4], &mut rng)
            .is_err());
    }

    #[test]
    fn frames_per_step_is_bounded_by_projection() {
        let device = NdArrayDevice::default();
        let mut decoder = decoder(&device);
        assert!(decoder.set_frames_per_step(3).is_err());
        assert!(decoder.set_frames_per_step(0).is_err());
        decoder.set_frames_per_step(1).expect("one frame");
        assert_eq!(decoder.frames_per_step(), 1);
    }

    #[test]
    fn free_running_stops_at_cap() {
        let device = NdArrayDevice::default();
        let mut decoder = decoder(&device);
        force_gate(&mut decoder, -20.0, &device);
        let mut rng = ChaCha8Rng::seed_from_u64(9);
        let (output, lengths) = decoder
            .inference(memory(2, 4, &device), &[4, 2], &mut rng)
            .expect("inference");
        assert_eq!(output.mel.dims(), [2, 3, 14]);
        assert_eq!(lengths, vec![14, 14]);
    }

    #[test]
    fn free_running_counts_firing_step() {
        let device = NdArrayDevice::default();
        let mut decoder = decoder(&device);
        force_gate(&mut decoder, 20.0, &device);
        let mut rng = ChaCha8Rng::seed_from_u64(9);
        let (output, lengths) = decoder
            .inference(memory(1, 4, &device), &[4], &mut rng)
            .expect("inference");
        assert_eq!(output.mel.dims(), [1, 3, 2]);
        assert_eq!(lengths, vec![2]);
    }

    #[test]
    fn supplied_alignments_set_step_count() {
        let device = NdArrayDevice::default();
        let decoder = decoder(&device);
        let alignments = Tensor::<TestBackend, 3>::ones([1, 3, 4], &device).div_scalar(4.0);
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        let (output, lengths) = decoder
            .inference_noattention(memory(1, 4, &device), alignments, &mut rng)
            .expect("noattention");
        assert_eq!(output.alignments.dims(), [1, 6, 4]);
        assert_eq!(lengths, vec![6]);
    }

    #[test]
    fn partial_teacher_forcing_rejects_short_mel() {
        let device = NdArrayDevice::default();
        let decoder = decoder(&device);
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        let tf_mel = Tensor::<TestBackend, 3>::ones([1, 3, 4], &device);
        assert!(decoder
            .inference_partial_tf(memory(1, 4, &device), &[4], tf_mel.clone(), 3, &mut rng)
            .is_err());
        let (output, lengths) = decoder
            .inference_partial_tf(memory(1, 4, &device), &[4], tf_mel, 2, &mut rng)
            .expect("partial");
        assert_eq!(output.mel.dims()[2], lengths[0]);
        assert!(lengths[0] >= 2 && lengths[0] <= 14);
    }
}
