use candle_core::{Module, Tensor};
use candle_nn::VarBuilder;
use snafu::{ResultExt, Snafu};

use crate::layers::activation::Activation;
use crate::layers::conv::{Conv2d, Conv2dConfig, Conv2dError};
use crate::layers::init::KernelInitializer;
use crate::layers::make_divisible::make_divisible;
use crate::layers::regularizer::Regularizer;

/// Squeeze-and-excitation configuration.
#[derive(Clone, Debug)]
pub struct SqueezeExcitationConfig {
    activation: Activation,
    bias_regularizer: Option<Regularizer>,
    divisible_by: usize,
    gating_activation: Activation,
    in_channels: usize,
    kernel_initializer: KernelInitializer,
    kernel_regularizer: Option<Regularizer>,
    out_channels: usize,
    round_down_protect: bool,
    se_ratio: f64,
}

impl SqueezeExcitationConfig {
    /// Activation after the squeeze convolution.
    ///
    /// Default: `Activation::Relu`
    pub fn activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }

    /// Bias regularizer of both convolutions.
    ///
    /// Default: `None`
    pub fn bias_regularizer(mut self, bias_regularizer: Option<Regularizer>) -> Self {
        self.bias_regularizer = bias_regularizer;
        self
    }

    /// The number of squeezed channels is made divisible by this number.
    ///
    /// Default: `1`
    pub fn divisible_by(mut self, divisible_by: usize) -> Self {
        self.divisible_by = divisible_by;
        self
    }

    /// Activation that computes the channel gates.
    ///
    /// Default: `Activation::Sigmoid`
    pub fn gating_activation(mut self, gating_activation: Activation) -> Self {
        self.gating_activation = gating_activation;
        self
    }

    /// Number of channels used to compute the squeezed width.
    ///
    /// Default: `1`
    pub fn in_channels(mut self, in_channels: usize) -> Self {
        self.in_channels = in_channels;
        self
    }

    /// Kernel initializer of both convolutions.
    ///
    /// Default: `KernelInitializer::VarianceScaling`
    pub fn kernel_initializer(mut self, kernel_initializer: KernelInitializer) -> Self {
        self.kernel_initializer = kernel_initializer;
        self
    }

    /// Kernel regularizer of both convolutions.
    ///
    /// Default: `None`
    pub fn kernel_regularizer(mut self, kernel_regularizer: Option<Regularizer>) -> Self {
        self.kernel_regularizer = kernel_regularizer;
        self
    }

    /// Number of channels of the feature map that is gated.
    ///
    /// Default: `1`
    pub fn out_channels(mut self, out_channels: usize) -> Self {
        self.out_channels = out_channels;
        self
    }

    /// Do not round the squeezed width down by more than 10%.
    ///
    /// Default: `true`
    pub fn round_down_protect(mut self, round_down_protect: bool) -> Self {
        self.round_down_protect = round_down_protect;
        self
    }

    /// Ratio of the squeezed width to the input channels.
    ///
    /// Default: `0.25`
    pub fn se_ratio(mut self, se_ratio: f64) -> Self {
        self.se_ratio = se_ratio;
        self
    }

    /// Number of channels after squeezing.
    pub fn squeezed_channels(&self) -> usize {
        let squeezed = ((self.in_channels as f64 * self.se_ratio) as usize).max(1);
        make_divisible(
            squeezed as f64,
            self.divisible_by,
            None,
            self.round_down_protect,
        )
    }

    /// Build the squeeze-and-excitation layer.
    pub fn build(&self, vb: VarBuilder) -> Result<SqueezeExcitation, SqueezeExcitationError> {
        let squeezed_channels = self.squeezed_channels();
        let conv = Conv2dConfig::default()
            .bias_regularizer(self.bias_regularizer)
            .kernel_initializer(self.kernel_initializer)
            .kernel_regularizer(self.kernel_regularizer)
            .use_bias(true);

        Ok(SqueezeExcitation {
            activation: self.activation,
            expand: conv
                .clone()
                .in_channels(squeezed_channels)
                .out_channels(self.out_channels)
                .build(vb.push_prefix("expand"))
                .context(BuildConvSnafu)?,
            gating_activation: self.gating_activation,
            reduce: conv
                .in_channels(self.out_channels)
                .out_channels(squeezed_channels)
                .build(vb.push_prefix("reduce"))
                .context(BuildConvSnafu)?,
        })
    }
}

impl Default for SqueezeExcitationConfig {
    fn default() -> Self {
        Self {
            activation: Activation::Relu,
            bias_regularizer: None,
            divisible_by: 1,
            gating_activation: Activation::Sigmoid,
            in_channels: 1,
            kernel_initializer: KernelInitializer::default(),
            kernel_regularizer: None,
            out_channels: 1,
            round_down_protect: true,
            se_ratio: 0.25,
        }
    }
}

/// Squeeze-and-excitation errors.
#[derive(Debug, Snafu)]
pub enum SqueezeExcitationError {
    #[snafu(display("Cannot build squeeze-and-excitation convolution"))]
    BuildConv { source: Conv2dError },
}

/// Squeeze-and-excitation layer.
///
/// See [Hu et al., 2017](https://arxiv.org/abs/1709.01507).
///
/// Reweights the channels of a feature map with gates that are computed
/// from the spatially pooled feature map.
pub struct SqueezeExcitation {
    activation: Activation,
    expand: Conv2d,
    gating_activation: Activation,
    reduce: Conv2d,
}

impl SqueezeExcitation {
    /// Trainable variables of the squeeze and expand convolutions.
    pub fn trainable_variables(&self) -> Vec<Tensor> {
        let mut variables = self.reduce.trainable_variables();
        variables.extend(self.expand.trainable_variables());
        variables
    }

    /// Weight penalties of the squeeze and expand convolutions.
    pub fn penalties(&self) -> candle_core::Result<Vec<Tensor>> {
        let mut penalties = self.reduce.penalties()?;
        penalties.extend(self.expand.penalties()?);
        Ok(penalties)
    }
}

impl Module for SqueezeExcitation {
    /// Gate the channels of a feature map.
    ///
    /// * `xs` - Feature map.
    ///   *Shape:* `(batch_size, channels, height, width)`
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let gates = xs.mean_keepdim((2, 3))?;
        let gates = self
            .activation
            .forward(&self.reduce.forward(&gates)?)?;
        let gates = self
            .gating_activation
            .forward(&self.expand.forward(&gates)?)?;
        xs.broadcast_mul(&gates)
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device, Module, Tensor};
    use candle_nn::{VarBuilder, VarMap};
    use snafu::{report, ResultExt, Whatever};

    use super::SqueezeExcitationConfig;
    use crate::layers::init::KernelInitializer;
    use crate::util::tests::{assert_tensor_eq, PseudoRandom};

    #[test]
    fn squeezed_channels_are_divisible() {
        let config = SqueezeExcitationConfig::default()
            .in_channels(96)
            .out_channels(96)
            .se_ratio(0.25)
            .divisible_by(8);
        assert_eq!(config.squeezed_channels(), 24);

        let config = SqueezeExcitationConfig::default()
            .in_channels(2)
            .se_ratio(0.1);
        assert_eq!(config.squeezed_channels(), 1);
    }

    #[test]
    #[report]
    fn zero_kernels_gate_with_one_half() -> Result<(), Whatever> {
        let device = Device::Cpu;
        let vb = VarBuilder::from_varmap(&VarMap::new(), DType::F32, &device);
        let squeeze_excitation = SqueezeExcitationConfig::default()
            .in_channels(8)
            .out_channels(8)
            .kernel_initializer(KernelInitializer::Zeros)
            .build(vb)
            .whatever_context("Cannot build squeeze-and-excitation")?;
        assert_eq!(squeeze_excitation.trainable_variables().len(), 4);

        let xs = Tensor::pseudo_random((2, 8, 3, 3), 1, DType::F32, &device)
            .whatever_context("Cannot create input")?;
        let ys = squeeze_excitation
            .forward(&xs)
            .whatever_context("Cannot apply squeeze-and-excitation")?;
        assert_tensor_eq!(
            ys,
            (&xs * 0.5).whatever_context("Cannot scale input")?,
            epsilon = 1e-6f32
        );
        Ok(())
    }
}
