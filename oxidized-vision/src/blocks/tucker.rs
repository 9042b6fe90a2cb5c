use candle_core::{ModuleT, Tensor, Var};
use candle_nn::VarBuilder;
use serde::{Deserialize, Serialize};
use snafu::{ensure, ResultExt, Snafu};

use crate::blocks::{
    Block, BlockConfig, BlockShapeError, BuildBlock, ConvNorm, FeatureMapShape, NormOptions,
};
use crate::error::BoxedError;
use crate::layers::activation::Activation;
use crate::layers::batch_norm::BatchNormError;
use crate::layers::build_module::BuildModule;
use crate::layers::conv::{Conv2dConfig, Conv2dError};
use crate::layers::data_format::DataFormat;
use crate::layers::init::KernelInitializer;
use crate::layers::make_divisible::make_divisible;
use crate::layers::regularizer::{sum_penalties, Regularizer};
use crate::layers::stochastic_depth::StochasticDepthConfig;

/// Tucker convolution block configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TuckerConvBlockConfig {
    activation: Activation,
    bias_regularizer: Option<Regularizer>,
    divisible_by: usize,
    in_filters: usize,
    input_compression_ratio: f64,
    kernel_initializer: KernelInitializer,
    kernel_regularizer: Option<Regularizer>,
    kernel_size: usize,
    norm_epsilon: f64,
    norm_momentum: f64,
    out_filters: usize,
    output_compression_ratio: f64,
    stochastic_depth_drop_rate: Option<f64>,
    strides: usize,
    use_residual: bool,
    use_sync_bn: bool,
}

impl TuckerConvBlockConfig {
    /// Activation after the compression and the spatial convolution.
    ///
    /// Default: `Activation::Relu`
    pub fn activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }

    /// Bias regularizer of the convolutions.
    ///
    /// Default: `None`
    pub fn bias_regularizer(mut self, bias_regularizer: Option<Regularizer>) -> Self {
        self.bias_regularizer = bias_regularizer;
        self
    }

    /// Inner channel counts are made divisible by this number.
    ///
    /// Default: `1`
    pub fn divisible_by(mut self, divisible_by: usize) -> Self {
        self.divisible_by = divisible_by;
        self
    }

    /// Number of input channels.
    ///
    /// Default: `16`
    pub fn in_filters(mut self, in_filters: usize) -> Self {
        self.in_filters = in_filters;
        self
    }

    /// Ratio of compressed to input channels.
    ///
    /// Default: `0.25`
    pub fn input_compression_ratio(mut self, input_compression_ratio: f64) -> Self {
        self.input_compression_ratio = input_compression_ratio;
        self
    }

    /// Kernel initializer of the convolutions.
    ///
    /// Default: `KernelInitializer::VarianceScaling`
    pub fn kernel_initializer(mut self, kernel_initializer: KernelInitializer) -> Self {
        self.kernel_initializer = kernel_initializer;
        self
    }

    /// Kernel regularizer of the convolutions.
    ///
    /// Default: `None`
    pub fn kernel_regularizer(mut self, kernel_regularizer: Option<Regularizer>) -> Self {
        self.kernel_regularizer = kernel_regularizer;
        self
    }

    /// Kernel size of the spatial convolution.
    ///
    /// Default: `3`
    pub fn kernel_size(mut self, kernel_size: usize) -> Self {
        self.kernel_size = kernel_size;
        self
    }

    /// Epsilon of the batch normalization layers.
    ///
    /// Default: `0.001`
    pub fn norm_epsilon(mut self, norm_epsilon: f64) -> Self {
        self.norm_epsilon = norm_epsilon;
        self
    }

    /// Momentum of the batch normalization moving statistics.
    ///
    /// Default: `0.99`
    pub fn norm_momentum(mut self, norm_momentum: f64) -> Self {
        self.norm_momentum = norm_momentum;
        self
    }

    /// Number of output channels.
    ///
    /// Default: `16`
    pub fn out_filters(mut self, out_filters: usize) -> Self {
        self.out_filters = out_filters;
        self
    }

    /// Ratio of the spatial convolution channels to output channels.
    ///
    /// Default: `0.25`
    pub fn output_compression_ratio(mut self, output_compression_ratio: f64) -> Self {
        self.output_compression_ratio = output_compression_ratio;
        self
    }

    /// Stochastic depth drop rate of the residual branch.
    ///
    /// Default: `None`
    pub fn stochastic_depth_drop_rate(mut self, stochastic_depth_drop_rate: Option<f64>) -> Self {
        self.stochastic_depth_drop_rate = stochastic_depth_drop_rate;
        self
    }

    /// Stride of the spatial convolution.
    ///
    /// Default: `1`
    pub fn strides(mut self, strides: usize) -> Self {
        self.strides = strides;
        self
    }

    /// Add the input to the output when the input and output shapes match.
    ///
    /// Default: `true`
    pub fn use_residual(mut self, use_residual: bool) -> Self {
        self.use_residual = use_residual;
        self
    }

    /// Use synchronized batch normalization.
    ///
    /// Default: `false`
    pub fn use_sync_bn(mut self, use_sync_bn: bool) -> Self {
        self.use_sync_bn = use_sync_bn;
        self
    }

    /// Channels after the input compression and after the spatial
    /// convolution.
    pub fn compressed_filters(&self) -> (usize, usize) {
        (
            make_divisible(
                self.in_filters as f64 * self.input_compression_ratio,
                self.divisible_by,
                None,
                false,
            ),
            make_divisible(
                self.out_filters as f64 * self.output_compression_ratio,
                self.divisible_by,
                None,
                false,
            ),
        )
    }
}

impl Default for TuckerConvBlockConfig {
    fn default() -> Self {
        Self {
            activation: Activation::Relu,
            bias_regularizer: None,
            divisible_by: 1,
            in_filters: 16,
            input_compression_ratio: 0.25,
            kernel_initializer: KernelInitializer::default(),
            kernel_regularizer: None,
            kernel_size: 3,
            norm_epsilon: 0.001,
            norm_momentum: 0.99,
            out_filters: 16,
            output_compression_ratio: 0.25,
            stochastic_depth_drop_rate: None,
            strides: 1,
            use_residual: true,
            use_sync_bn: false,
        }
    }
}

impl BlockConfig for TuckerConvBlockConfig {}

impl BuildBlock for TuckerConvBlockConfig {
    type Block = TuckerConvBlock;

    fn build(&self, vb: VarBuilder, input_shape: &[usize]) -> Result<TuckerConvBlock, BoxedError> {
        let shape = FeatureMapShape::new("TuckerConvBlock", input_shape, DataFormat::current())
            .context(InputShapeSnafu)?;
        ensure!(
            shape.channels() == self.in_filters,
            InFiltersSnafu {
                in_filters: self.in_filters,
                in_channels: shape.channels()
            }
        );

        let norm = NormOptions {
            epsilon: self.norm_epsilon,
            momentum: self.norm_momentum,
            synchronized: self.use_sync_bn,
            trainable: true,
        };
        let conv = Conv2dConfig::default()
            .bias_regularizer(self.bias_regularizer)
            .kernel_initializer(self.kernel_initializer)
            .kernel_regularizer(self.kernel_regularizer);
        let (input_compressed, output_compressed) = self.compressed_filters();

        let stages = [
            (self.in_filters, input_compressed, 1, 1, Some(self.activation)),
            (
                input_compressed,
                output_compressed,
                self.kernel_size,
                self.strides,
                Some(self.activation),
            ),
            (output_compressed, self.out_filters, 1, 1, None),
        ];
        let mut conv_norms = Vec::with_capacity(stages.len());
        for (idx, (in_channels, out_channels, kernel_size, strides, activation)) in
            stages.into_iter().enumerate()
        {
            conv_norms.push(ConvNorm {
                activation,
                conv: conv
                    .clone()
                    .in_channels(in_channels)
                    .out_channels(out_channels)
                    .kernel_size(kernel_size)
                    .strides(strides)
                    .build(vb.push_prefix(format!("conv{idx}")))
                    .context(BuildConvSnafu)?,
                norm: norm
                    .build(vb.push_prefix(format!("norm{idx}")), out_channels)
                    .context(BuildNormSnafu)?,
            });
        }

        let stochastic_depth = StochasticDepthConfig::default()
            .drop_rate(self.stochastic_depth_drop_rate)
            .build(vb.push_prefix("stochastic_depth"))
            .context(BuildStochasticDepthSnafu)?;

        Ok(TuckerConvBlock {
            conv_norms,
            residual: self.use_residual
                && self.in_filters == self.out_filters
                && self.strides == 1,
            shape,
            stochastic_depth,
        })
    }
}

/// Tucker convolution block errors.
#[derive(Debug, Snafu)]
pub enum TuckerConvBlockError {
    #[snafu(display("Cannot build convolution"))]
    BuildConv { source: Conv2dError },

    #[snafu(display("Cannot build batch normalization"))]
    BuildNorm { source: BatchNormError },

    #[snafu(display("Cannot build stochastic depth"))]
    BuildStochasticDepth { source: BoxedError },

    #[snafu(display("Cannot apply Tucker convolution block"))]
    Forward { source: candle_core::Error },

    #[snafu(display("Block was configured for {in_filters} input channels, got {in_channels}"))]
    InFilters {
        in_filters: usize,
        in_channels: usize,
    },

    #[snafu(display("Invalid Tucker convolution block input"))]
    InputShape { source: BlockShapeError },

    #[snafu(display("Cannot compute regularization loss"))]
    RegularizationLoss { source: candle_core::Error },
}

/// Tucker convolution block (_Tucker, 1966_).
///
/// A generalized bottleneck: a 1x1 convolution compresses the input
/// channels, a spatial convolution maps between the compressed input and
/// output channels and a final 1x1 convolution restores the output
/// channels.
///
/// * _Tucker, 1966_: https://doi.org/10.1007/BF02289464
pub struct TuckerConvBlock {
    conv_norms: Vec<ConvNorm>,
    residual: bool,
    shape: FeatureMapShape,
    stochastic_depth: Box<dyn ModuleT>,
}

impl TuckerConvBlock {
    fn forward_channels_first(&self, xs: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        let mut hidden = xs.clone();
        for conv_norm in &self.conv_norms {
            hidden = conv_norm.forward_t(&hidden, train)?;
        }

        if self.residual {
            hidden = (self.stochastic_depth.forward_t(&hidden, train)? + xs)?;
        }
        Ok(hidden)
    }
}

impl Block for TuckerConvBlock {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor, BoxedError> {
        self.shape.check(xs).context(InputShapeSnafu)?;
        let data_format = self.shape.data_format();
        let ys = data_format
            .to_channels_first(xs)
            .and_then(|xs| self.forward_channels_first(&xs, train))
            .and_then(|ys| data_format.from_channels_first(&ys))
            .context(ForwardSnafu)?;
        Ok(ys)
    }

    fn trainable_variables(&self) -> Vec<Tensor> {
        self.conv_norms
            .iter()
            .flat_map(ConvNorm::trainable_variables)
            .collect()
    }

    fn non_trainable_variables(&self) -> Vec<Var> {
        self.conv_norms
            .iter()
            .flat_map(ConvNorm::non_trainable_variables)
            .collect()
    }

    fn regularization_loss(&self) -> Result<Option<Tensor>, BoxedError> {
        let mut penalties = Vec::new();
        for conv_norm in &self.conv_norms {
            penalties.extend(conv_norm.penalties().context(RegularizationLossSnafu)?);
        }
        Ok(sum_penalties(penalties).context(RegularizationLossSnafu)?)
    }
}
