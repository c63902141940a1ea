//! Xavier-initialised linear and convolution blocks shared by every stage.

use burn::{
    module::Module,
    tensor::{backend::Backend, Tensor},
};
use burn_nn::{
    conv::{Conv1d, Conv1dConfig},
    BatchNorm, BatchNormConfig, Initializer, Linear, LinearConfig, PaddingConfig1d,
};

/// Nonlinearity that follows a layer, used to scale Xavier initialisation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitGain {
    Linear,
    Sigmoid,
    Tanh,
    Relu,
}

impl InitGain {
    /// Recommended Xavier gain for this nonlinearity.
    pub fn value(self) -> f64 {
        match self {
            InitGain::Linear | InitGain::Sigmoid => 1.0,
            InitGain::Tanh => 5.0 / 3.0,
            InitGain::Relu => std::f64::consts::SQRT_2,
        }
    }

    fn initializer(self) -> Initializer {
        Initializer::XavierUniform { gain: self.value() }
    }
}

/// Dense layer with Xavier-uniform weights.
pub fn xavier_linear<B: Backend>(
    d_input: usize,
    d_output: usize,
    bias: bool,
    gain: InitGain,
    device: &B::Device,
) -> Linear<B> {
    LinearConfig::new(d_input, d_output)
        .with_bias(bias)
        .with_initializer(gain.initializer())
        .init(device)
}

/// Length-preserving 1D convolution with Xavier-uniform weights.
///
/// `kernel_size` must be odd; padding is `(kernel_size - 1) / 2` on both sides.
pub fn xavier_conv1d<B: Backend>(
    channels_in: usize,
    channels_out: usize,
    kernel_size: usize,
    bias: bool,
    gain: InitGain,
    device: &B::Device,
) -> Conv1d<B> {
    let mut conv = Conv1dConfig::new(channels_in, channels_out, kernel_size)
        .with_padding(PaddingConfig1d::Explicit((kernel_size - 1) / 2))
        .with_bias(bias)
        .init(device);
    // Conv1dConfig passes no fan_out to its initializer, which Xavier needs.
    conv.weight = gain.initializer().init_with(
        [channels_out, channels_in, kernel_size],
        Some(channels_in * kernel_size),
        Some(channels_out * kernel_size),
        device,
    );
    conv
}

/// Configuration for a [`ConvNorm`] block.
#[derive(Debug, Clone)]
pub struct ConvNormConfig {
    pub channels_in: usize,
    pub channels_out: usize,
    pub kernel_size: usize,
    pub gain: InitGain,
}

impl ConvNormConfig {
    pub fn new(channels_in: usize, channels_out: usize, kernel_size: usize, gain: InitGain) -> Self {
        Self {
            channels_in,
            channels_out,
            kernel_size,
            gain,
        }
    }

    /// Initialize the block on the given device.
    pub fn init<B: Backend>(&self, device: &B::Device) -> ConvNorm<B> {
        ConvNorm {
            conv: xavier_conv1d(
                self.channels_in,
                self.channels_out,
                self.kernel_size,
                true,
                self.gain,
                device,
            ),
            norm: BatchNormConfig::new(self.channels_out).init(device),
        }
    }
}

/// Convolution followed by batch normalisation over channels.
#[derive(Module, Debug)]
pub struct ConvNorm<B: Backend> {
    pub conv: Conv1d<B>,
    pub norm: BatchNorm<B>,
}

impl<B: Backend> ConvNorm<B> {
    /// Apply to `[batch, channels_in, time]`, returning `[batch, channels_out, time]`.
    pub fn forward(&self, input: Tensor<B, 3>) -> Tensor<B, 3> {
        self.norm.forward(self.conv.forward(input))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::{NdArray, NdArrayDevice};

    type TestBackend = NdArray<f32>;

    #[test]
    fn conv_norm_preserves_time_axis() {
        let device = NdArrayDevice::default();
        let block = ConvNormConfig::new(4, 6, 5, InitGain::Relu).init::<TestBackend>(&device);
        let input = Tensor::<TestBackend, 3>::ones([2, 4, 9], &device);
        assert_eq!(block.forward(input).dims(), [2, 6, 9]);
    }

    #[test]
    fn xavier_conv_runs_and_respects_the_bound() {
        let device = NdArrayDevice::default();
        let conv = xavier_conv1d::<TestBackend>(2, 3, 5, false, InitGain::Tanh, &device);
        let input = Tensor::<TestBackend, 3>::ones([1, 2, 7], &device);
        assert_eq!(conv.forward(input).dims(), [1, 3, 7]);

        let bound = (InitGain::Tanh.value() * (6.0 / (2.0 * 5.0 + 3.0 * 5.0) as f64).sqrt()) as f32;
        let weights = conv.weight.val().into_data().to_vec::<f32>().expect("weights");
        assert_eq!(weights.len(), 3 * 2 * 5);
        assert!(weights.iter().all(|w| w.abs() <= bound + 1e-6));
    }

    #[test]
    fn gains_match_nonlinearities() {
        assert_eq!(InitGain::Linear.value(), 1.0);
        assert!((InitGain::Tanh.value() - 5.0 / 3.0).abs() < 1e-12);
        assert!((InitGain::Relu.value() - 2f64.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn bias_free_linear_has_no_bias() {
        let device = NdArrayDevice::default();
        let layer = xavier_linear::<TestBackend>(3, 2, false, InitGain::Tanh, &device);
        assert!(layer.bias.is_none());
    }
}
