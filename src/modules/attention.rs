//! Location-sensitive attention.
//!
//! Alignment energies combine the attention query, a projection of the encoder
//! memory and convolutional features of the previous and cumulative alignment.
//! The location term is what pushes the alignment to advance monotonically.

use crate::modules::layers::{xavier_conv1d, xavier_linear, InitGain};
use burn::{
    module::Module,
    tensor::{
        activation::{softmax, tanh},
        backend::Backend,
        Bool, Tensor,
    },
};
use burn_nn::{conv::Conv1d, Linear};

/// Configuration for [`LocationSensitiveAttention`].
#[derive(Debug, Clone)]
pub struct AttentionConfig {
    /// Width of the attention LSTM hidden state (the query).
    pub attention_rnn_dim: usize,
    /// Width of the encoder memory.
    pub embedding_dim: usize,
    /// Shared projection width.
    pub attention_dim: usize,
    /// Filters in the location convolution.
    pub location_n_filters: usize,
    /// Location convolution kernel width (odd).
    pub location_kernel_size: usize,
    /// Score written to padded encoder positions before the softmax.
    pub score_mask_value: f32,
}

impl AttentionConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> LocationSensitiveAttention<B> {
        LocationSensitiveAttention {
            query_layer: xavier_linear(
                self.attention_rnn_dim,
                self.attention_dim,
                false,
                InitGain::Tanh,
                device,
            ),
            memory_layer: xavier_linear(
                self.embedding_dim,
                self.attention_dim,
                false,
                InitGain::Tanh,
                device,
            ),
            v: xavier_linear(self.attention_dim, 1, false, InitGain::Linear, device),
            location_layer: LocationLayer {
                location_conv: xavier_conv1d(
                    2,
                    self.location_n_filters,
                    self.location_kernel_size,
                    false,
                    InitGain::Linear,
                    device,
                ),
                location_dense: xavier_linear(
                    self.location_n_filters,
                    self.attention_dim,
                    false,
                    InitGain::Tanh,
                    device,
                ),
            },
            score_mask_value: self.score_mask_value,
        }
    }
}

/// Convolutional features of the stacked (previous, cumulative) alignment.
#[derive(Module, Debug)]
pub struct LocationLayer<B: Backend> {
    pub location_conv: Conv1d<B>,
    pub location_dense: Linear<B>,
}

impl<B: Backend> LocationLayer<B> {
    /// Map `[batch, 2, t_in]` alignment history to `[batch, t_in, attention_dim]`.
    pub fn forward(&self, weights_cat: Tensor<B, 3>) -> Tensor<B, 3> {
        let features = self.location_conv.forward(weights_cat).swap_dims(1, 2);
        self.location_dense.forward(features)
    }
}

/// Additive attention with a location term.
#[derive(Module, Debug)]
pub struct LocationSensitiveAttention<B: Backend> {
    pub query_layer: Linear<B>,
    pub memory_layer: Linear<B>,
    pub v: Linear<B>,
    pub location_layer: LocationLayer<B>,
    pub score_mask_value: f32,
}

impl<B: Backend> LocationSensitiveAttention<B> {
    /// Project encoder memory `[batch, t_in, E]` once per decoder call.
    pub fn process_memory(&self, memory: Tensor<B, 3>) -> Tensor<B, 3> {
        self.memory_layer.forward(memory)
    }

    /// Unnormalised alignment energies `[batch, t_in]`.
    pub fn alignment_energies(
        &self,
        query: Tensor<B, 2>,
        processed_memory: Tensor<B, 3>,
        weights_cat: Tensor<B, 3>,
    ) -> Tensor<B, 2> {
        let [batch, t_in, _] = processed_memory.dims();
        let processed_query = self.query_layer.forward(query.unsqueeze_dim::<3>(1));
        let processed_location = self.location_layer.forward(weights_cat);
        let energies = self
            .v
            .forward(tanh(processed_query + processed_location + processed_memory));
        energies.reshape([batch, t_in])
    }

    /// Attend over `memory`.
    ///
    /// Returns the context `[batch, E]` and the alignment `[batch, t_in]`.
    /// When `supplied` is given the learned alignment is skipped and the
    /// supplied weights are applied directly.
    pub fn forward(
        &self,
        query: Tensor<B, 2>,
        memory: Tensor<B, 3>,
        processed_memory: Tensor<B, 3>,
        weights_cat: Tensor<B, 3>,
        mask: Option<Tensor<B, 2, Bool>>,
        supplied: Option<Tensor<B, 2>>,
    ) -> (Tensor<B, 2>, Tensor<B, 2>) {
        let weights = match supplied {
            Some(weights) => weights,
            None => {
                let mut energies = self.alignment_energies(query, processed_memory, weights_cat);
                if let Some(mask) = mask {
                    energies = energies.mask_fill(mask, self.score_mask_value);
                }
                softmax(energies, 1)
            }
        };
        let [batch, _, embedding_dim] = memory.dims();
        let context = weights
            .clone()
            .unsqueeze_dim::<3>(1)
            .matmul(memory)
            .reshape([batch, embedding_dim]);
        (context, weights)
    }
}
