use candle_core::{Module, ModuleT, Tensor, Var};
use candle_nn::VarBuilder;
use serde::{Deserialize, Serialize};
use snafu::{ensure, ResultExt, Snafu};

use crate::blocks::{
    use_squeeze_excitation, Block, BlockConfig, BlockShapeError, BuildBlock, ConvNorm,
    FeatureMapShape, NormOptions,
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
use crate::layers::squeeze_excitation::{
    SqueezeExcitation, SqueezeExcitationConfig, SqueezeExcitationError,
};
use crate::layers::stochastic_depth::StochasticDepthConfig;

/// Inverted bottleneck block configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InvertedBottleneckBlockConfig {
    activation: Activation,
    bias_regularizer: Option<Regularizer>,
    depthwise_activation: Option<Activation>,
    dilation_rate: usize,
    divisible_by: usize,
    expand_ratio: f64,
    expand_se_in_filters: bool,
    in_filters: usize,
    kernel_initializer: KernelInitializer,
    kernel_regularizer: Option<Regularizer>,
    kernel_size: usize,
    norm_epsilon: f64,
    norm_momentum: f64,
    out_filters: usize,
    output_intermediate_endpoints: bool,
    regularize_depthwise: bool,
    se_gating_activation: Activation,
    se_inner_activation: Activation,
    se_ratio: Option<f64>,
    se_round_down_protect: bool,
    stochastic_depth_drop_rate: Option<f64>,
    strides: usize,
    use_depthwise: bool,
    use_residual: bool,
    use_sync_bn: bool,
}

impl InvertedBottleneckBlockConfig {
    /// Activation after the expansion.
    ///
    /// Default: `Activation::Relu`
    pub fn activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }

    /// Bias regularizer of the squeeze-and-excitation convolutions.
    ///
    /// Default: `None`
    pub fn bias_regularizer(mut self, bias_regularizer: Option<Regularizer>) -> Self {
        self.bias_regularizer = bias_regularizer;
        self
    }

    /// Activation after the depthwise convolution. When `None`, the
    /// block activation is used.
    ///
    /// Default: `None`
    pub fn depthwise_activation(mut self, depthwise_activation: Option<Activation>) -> Self {
        self.depthwise_activation = depthwise_activation;
        self
    }

    /// Dilation rate of the depthwise convolution.
    ///
    /// Default: `1`
    pub fn dilation_rate(mut self, dilation_rate: usize) -> Self {
        self.dilation_rate = dilation_rate;
        self
    }

    /// Inner channel counts are made divisible by this number.
    ///
    /// Default: `1`
    pub fn divisible_by(mut self, divisible_by: usize) -> Self {
        self.divisible_by = divisible_by;
        self
    }

    /// Ratio of expanded channels to input channels. There is no
    /// expansion stage for ratios up to `1`.
    ///
    /// Default: `6.0`
    pub fn expand_ratio(mut self, expand_ratio: f64) -> Self {
        self.expand_ratio = expand_ratio;
        self
    }

    /// Squeeze relative to the expanded rather than the input channels.
    ///
    /// Default: `false`
    pub fn expand_se_in_filters(mut self, expand_se_in_filters: bool) -> Self {
        self.expand_se_in_filters = expand_se_in_filters;
        self
    }

    /// Number of input channels.
    ///
    /// Default: `16`
    pub fn in_filters(mut self, in_filters: usize) -> Self {
        self.in_filters = in_filters;
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

    /// Kernel size of the depthwise (or fused expansion) convolution.
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

    /// Return the depthwise activations as the `depthwise` endpoint.
    ///
    /// Default: `false`
    pub fn output_intermediate_endpoints(mut self, output_intermediate_endpoints: bool) -> Self {
        self.output_intermediate_endpoints = output_intermediate_endpoints;
        self
    }

    /// Apply the kernel regularizer to the depthwise kernel.
    ///
    /// Default: `false`
    pub fn regularize_depthwise(mut self, regularize_depthwise: bool) -> Self {
        self.regularize_depthwise = regularize_depthwise;
        self
    }

    /// Gating activation of squeeze-and-excitation.
    ///
    /// Default: `Activation::Sigmoid`
    pub fn se_gating_activation(mut self, se_gating_activation: Activation) -> Self {
        self.se_gating_activation = se_gating_activation;
        self
    }

    /// Inner activation of squeeze-and-excitation.
    ///
    /// Default: `Activation::Relu`
    pub fn se_inner_activation(mut self, se_inner_activation: Activation) -> Self {
        self.se_inner_activation = se_inner_activation;
        self
    }

    /// Squeeze-and-excitation ratio, used when in `(0, 1]`.
    ///
    /// Default: `None`
    pub fn se_ratio(mut self, se_ratio: Option<f64>) -> Self {
        self.se_ratio = se_ratio;
        self
    }

    /// Do not round the squeezed channels down by more than 10%.
    ///
    /// Default: `true`
    pub fn se_round_down_protect(mut self, se_round_down_protect: bool) -> Self {
        self.se_round_down_protect = se_round_down_protect;
        self
    }

    /// Stochastic depth drop rate of the residual branch.
    ///
    /// Default: `None`
    pub fn stochastic_depth_drop_rate(mut self, stochastic_depth_drop_rate: Option<f64>) -> Self {
        self.stochastic_depth_drop_rate = stochastic_depth_drop_rate;
        self
    }

    /// Stride of the depthwise (or fused expansion) convolution.
    ///
    /// Default: `1`
    pub fn strides(mut self, strides: usize) -> Self {
        self.strides = strides;
        self
    }

    /// Use a depthwise convolution. When `false`, the expansion is a
    /// fused `kernel_size` convolution that applies the stride.
    ///
    /// Default: `true`
    pub fn use_depthwise(mut self, use_depthwise: bool) -> Self {
        self.use_depthwise = use_depthwise;
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

    /// Number of channels after expansion.
    pub fn expand_filters(&self) -> usize {
        if self.expand_ratio > 1. {
            make_divisible(
                self.in_filters as f64 * self.expand_ratio,
                self.divisible_by,
                None,
                true,
            )
        } else {
            self.in_filters
        }
    }

    fn has_residual(&self) -> bool {
        self.use_residual && self.in_filters == self.out_filters && self.strides == 1
    }
}

impl Default for InvertedBottleneckBlockConfig {
    fn default() -> Self {
        Self {
            activation: Activation::Relu,
            bias_regularizer: None,
            depthwise_activation: None,
            dilation_rate: 1,
            divisible_by: 1,
            expand_ratio: 6.,
            expand_se_in_filters: false,
            in_filters: 16,
            kernel_initializer: KernelInitializer::default(),
            kernel_regularizer: None,
            kernel_size: 3,
            norm_epsilon: 0.001,
            norm_momentum: 0.99,
            out_filters: 16,
            output_intermediate_endpoints: false,
            regularize_depthwise: false,
            se_gating_activation: Activation::Sigmoid,
            se_inner_activation: Activation::Relu,
            se_ratio: None,
            se_round_down_protect: true,
            stochastic_depth_drop_rate: None,
            strides: 1,
            use_depthwise: true,
            use_residual: true,
            use_sync_bn: false,
        }
    }
}

impl BlockConfig for InvertedBottleneckBlockConfig {}

impl BuildBlock for InvertedBottleneckBlockConfig {
    type Block = InvertedBottleneckBlock;

    fn build(
        &self,
        vb: VarBuilder,
        input_shape: &[usize],
    ) -> Result<InvertedBottleneckBlock, BoxedError> {
        let shape =
            FeatureMapShape::new("InvertedBottleneckBlock", input_shape, DataFormat::current())
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
            .kernel_initializer(self.kernel_initializer)
            .kernel_regularizer(self.kernel_regularizer);
        let expand_filters = self.expand_filters();

        let expand = if self.expand_ratio > 1. {
            let (kernel_size, strides) = if self.use_depthwise {
                (1, 1)
            } else {
                (self.kernel_size, self.strides)
            };
            Some(ConvNorm {
                activation: Some(self.activation),
                conv: conv
                    .clone()
                    .in_channels(self.in_filters)
                    .out_channels(expand_filters)
                    .kernel_size(kernel_size)
                    .strides(strides)
                    .build(vb.push_prefix("conv0"))
                    .context(BuildConvSnafu)?,
                norm: norm
                    .build(vb.push_prefix("norm0"), expand_filters)
                    .context(BuildNormSnafu)?,
            })
        } else {
            None
        };

        let depthwise = if self.use_depthwise {
            let depthwise_regularizer = if self.regularize_depthwise {
                self.kernel_regularizer
            } else {
                None
            };
            Some(ConvNorm {
                activation: Some(self.depthwise_activation.unwrap_or(self.activation)),
                conv: conv
                    .clone()
                    .depthwise(true)
                    .dilation_rate(self.dilation_rate)
                    .in_channels(expand_filters)
                    .kernel_regularizer(depthwise_regularizer)
                    .kernel_size(self.kernel_size)
                    .out_channels(expand_filters)
                    .strides(self.strides)
                    .build(vb.push_prefix("conv1"))
                    .context(BuildConvSnafu)?,
                norm: norm
                    .build(vb.push_prefix("norm1"), expand_filters)
                    .context(BuildNormSnafu)?,
            })
        } else {
            None
        };

        let squeeze_excitation = match self.se_ratio {
            Some(se_ratio) if use_squeeze_excitation(self.se_ratio) => {
                tracing::debug!("using squeeze-and-excitation with ratio {se_ratio}");
                let se_in_filters = if self.expand_se_in_filters {
                    expand_filters
                } else {
                    self.in_filters
                };
                Some(
                    SqueezeExcitationConfig::default()
                        .activation(self.se_inner_activation)
                        .bias_regularizer(self.bias_regularizer)
                        .divisible_by(self.divisible_by)
                        .gating_activation(self.se_gating_activation)
                        .in_channels(se_in_filters)
                        .kernel_initializer(self.kernel_initializer)
                        .kernel_regularizer(self.kernel_regularizer)
                        .out_channels(expand_filters)
                        .round_down_protect(self.se_round_down_protect)
                        .se_ratio(se_ratio)
                        .build(vb.push_prefix("squeeze_excitation"))
                        .context(BuildSqueezeExcitationSnafu)?,
                )
            }
            _ => None,
        };

        let project = ConvNorm {
            activation: None,
            conv: conv
                .in_channels(expand_filters)
                .out_channels(self.out_filters)
                .build(vb.push_prefix("conv2"))
                .context(BuildConvSnafu)?,
            norm: norm
                .build(vb.push_prefix("norm2"), self.out_filters)
                .context(BuildNormSnafu)?,
        };

        let stochastic_depth = StochasticDepthConfig::default()
            .drop_rate(self.stochastic_depth_drop_rate)
            .build(vb.push_prefix("stochastic_depth"))
            .context(BuildStochasticDepthSnafu)?;

        Ok(InvertedBottleneckBlock {
            depthwise,
            expand,
            output_intermediate_endpoints: self.output_intermediate_endpoints,
            project,
            residual: self.has_residual(),
            shape,
            squeeze_excitation,
            stochastic_depth,
        })
    }
}

/// Inverted bottleneck block errors.
#[derive(Debug, Snafu)]
pub enum InvertedBottleneckBlockError {
    #[snafu(display("Cannot build convolution"))]
    BuildConv { source: Conv2dError },

    #[snafu(display("Cannot build batch normalization"))]
    BuildNorm { source: BatchNormError },

    #[snafu(display("Cannot build squeeze-and-excitation"))]
    BuildSqueezeExcitation { source: SqueezeExcitationError },

    #[snafu(display("Cannot build stochastic depth"))]
    BuildStochasticDepth { source: BoxedError },

    #[snafu(display("Cannot apply inverted bottleneck block"))]
    Forward { source: candle_core::Error },

    #[snafu(display("Block was configured for {in_filters} input channels, got {in_channels}"))]
    InFilters {
        in_filters: usize,
        in_channels: usize,
    },

    #[snafu(display("Invalid inverted bottleneck block input"))]
    InputShape { source: BlockShapeError },

    #[snafu(display("Cannot compute regularization loss"))]
    RegularizationLoss { source: candle_core::Error },
}

/// Output of an inverted bottleneck block with intermediate endpoints.
pub struct InvertedBottleneckOutput {
    /// Block output.
    pub output: Tensor,

    /// Activations after the depthwise convolution.
    ///
    /// Only available when the block uses a depthwise convolution and
    /// intermediate endpoints are enabled.
    pub depthwise: Option<Tensor>,
}

/// Inverted bottleneck block (_Sandler et al., 2018_).
///
/// The input is expanded with a 1x1 convolution, filtered with a
/// depthwise convolution and projected back with a linear 1x1
/// convolution. The residual connection is between the narrow input and
/// output feature maps.
///
/// * _Sandler et al., 2018_: https://arxiv.org/abs/1801.04381
pub struct InvertedBottleneckBlock {
    depthwise: Option<ConvNorm>,
    expand: Option<ConvNorm>,
    output_intermediate_endpoints: bool,
    project: ConvNorm,
    residual: bool,
    shape: FeatureMapShape,
    squeeze_excitation: Option<SqueezeExcitation>,
    stochastic_depth: Box<dyn ModuleT>,
}

impl InvertedBottleneckBlock {
    /// Apply the block and return the intermediate endpoints.
    ///
    /// * `xs` - Feature map in the data format the block was built with.
    /// * `train` - Whether to train the block.
    pub fn forward_with_endpoints(
        &self,
        xs: &Tensor,
        train: bool,
    ) -> Result<InvertedBottleneckOutput, BoxedError> {
        self.shape.check(xs).context(InputShapeSnafu)?;
        let data_format = self.shape.data_format();

        let (output, depthwise) = data_format
            .to_channels_first(xs)
            .and_then(|xs| self.forward_channels_first(&xs, train))
            .context(ForwardSnafu)?;

        let output = data_format
            .from_channels_first(&output)
            .context(ForwardSnafu)?;
        let depthwise = depthwise
            .filter(|_| self.output_intermediate_endpoints)
            .map(|depthwise| data_format.from_channels_first(&depthwise))
            .transpose()
            .context(ForwardSnafu)?;

        Ok(InvertedBottleneckOutput { output, depthwise })
    }

    fn forward_channels_first(
        &self,
        xs: &Tensor,
        train: bool,
    ) -> candle_core::Result<(Tensor, Option<Tensor>)> {
        let mut hidden = match &self.expand {
            Some(expand) => expand.forward_t(xs, train)?,
            None => xs.clone(),
        };

        let depthwise = match &self.depthwise {
            Some(depthwise) => {
                hidden = depthwise.forward_t(&hidden, train)?;
                Some(hidden.clone())
            }
            None => None,
        };

        if let Some(squeeze_excitation) = &self.squeeze_excitation {
            hidden = squeeze_excitation.forward(&hidden)?;
        }

        let mut output = self.project.forward_t(&hidden, train)?;
        if self.residual {
            output = (self.stochastic_depth.forward_t(&output, train)? + xs)?;
        }

        Ok((output, depthwise))
    }

    fn conv_norms(&self) -> impl Iterator<Item = &ConvNorm> {
        self.expand
            .iter()
            .chain(self.depthwise.iter())
            .chain(Some(&self.project))
    }
}

impl Block for InvertedBottleneckBlock {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor, BoxedError> {
        Ok(self.forward_with_endpoints(xs, train)?.output)
    }

    fn trainable_variables(&self) -> Vec<Tensor> {
        let mut variables = Vec::new();
        if let Some(expand) = &self.expand {
            variables.extend(expand.trainable_variables());
        }
        if let Some(depthwise) = &self.depthwise {
            variables.extend(depthwise.trainable_variables());
        }
        if let Some(squeeze_excitation) = &self.squeeze_excitation {
            variables.extend(squeeze_excitation.trainable_variables());
        }
        variables.extend(self.project.trainable_variables());
        variables
    }

    fn non_trainable_variables(&self) -> Vec<Var> {
        self.conv_norms()
            .flat_map(ConvNorm::non_trainable_variables)
            .collect()
    }

    fn regularization_loss(&self) -> Result<Option<Tensor>, BoxedError> {
        let mut penalties = Vec::new();
        for conv_norm in self.conv_norms() {
            penalties.extend(conv_norm.penalties().context(RegularizationLossSnafu)?);
        }
        if let Some(squeeze_excitation) = &self.squeeze_excitation {
            penalties.extend(
                squeeze_excitation
                    .penalties()
                    .context(RegularizationLossSnafu)?,
            );
        }
        Ok(sum_penalties(penalties).context(RegularizationLossSnafu)?)
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device, Tensor};
    use candle_nn::{VarBuilder, VarMap};
    use serde_json::json;
    use snafu::{report, ResultExt, Whatever};

    use super::InvertedBottleneckBlockConfig;
    use crate::blocks::{Block, BlockConfig, BuildBlock};
    use crate::layers::activation::Activation;
    use crate::layers::init::KernelInitializer;
    use crate::layers::regularizer::Regularizer;
    use crate::util::tests::{assert_tensor_eq, IntoLocalErr, PseudoRandom};

    #[test]
    fn expansion_is_divisible() {
        let config = InvertedBottleneckBlockConfig::default()
            .in_filters(20)
            .expand_ratio(3.)
            .divisible_by(8);
        assert_eq!(config.expand_filters(), 64);
        assert_eq!(config.expand_ratio(1.).expand_filters(), 20);
    }

    #[test]
    #[report]
    fn inverted_bottleneck_returns_depthwise_endpoint() -> Result<(), Whatever> {
        let device = Device::Cpu;
        let vb = VarBuilder::from_varmap(&VarMap::new(), DType::F32, &device);
        let block = InvertedBottleneckBlockConfig::default()
            .in_filters(16)
            .out_filters(24)
            .strides(2)
            .se_ratio(Some(0.25))
            .output_intermediate_endpoints(true)
            .build(vb, &[2, 8, 8, 16])
            .into_local_err().whatever_context("Cannot build block")?;
        let xs = Tensor::pseudo_random((2, 8, 8, 16), 5, DType::F32, &device)
            .whatever_context("Cannot create input")?;

        let output = block
            .forward_with_endpoints(&xs, true)
            .into_local_err().whatever_context("Cannot apply block")?;
        assert_eq!(output.output.dims(), &[2, 4, 4, 24]);
        assert_eq!(
            output.depthwise.map(|depthwise| depthwise.dims().to_vec()),
            Some(vec![2, 4, 4, 96])
        );

        Ok(())
    }

    #[test]
    fn fused_expansion_applies_stride() {
        let device = Device::Cpu;
        let vb = VarBuilder::from_varmap(&VarMap::new(), DType::F32, &device);
        let block = InvertedBottleneckBlockConfig::default()
            .in_filters(8)
            .out_filters(8)
            .expand_ratio(4.)
            .strides(2)
            .use_depthwise(false)
            .output_intermediate_endpoints(true)
            .build(vb, &[1, 6, 6, 8])
            .unwrap();
        let xs = Tensor::pseudo_random((1, 6, 6, 8), 6, DType::F32, &device).unwrap();
        let output = block.forward_with_endpoints(&xs, false).unwrap();
        assert_eq!(output.output.dims(), &[1, 3, 3, 8]);
        assert!(output.depthwise.is_none());
        // Expansion and projection, each with a kernel, scale and offset.
        assert_eq!(block.trainable_variables().len(), 6);
    }

    #[test]
    #[report]
    fn residual_depends_on_shape_and_flag() -> Result<(), Whatever> {
        let device = Device::Cpu;
        let xs = Tensor::pseudo_random((2, 4, 4, 8), 7, DType::F32, &device)
            .whatever_context("Cannot create input")?;
        let zeros = xs.zeros_like().whatever_context("Cannot create zeros")?;

        for (use_residual, expected) in [(true, &xs), (false, &zeros)] {
            let vb = VarBuilder::from_varmap(&VarMap::new(), DType::F32, &device);
            let block = InvertedBottleneckBlockConfig::default()
                .in_filters(8)
                .out_filters(8)
                .kernel_initializer(KernelInitializer::Zeros)
                .stochastic_depth_drop_rate(Some(0.5))
                .use_residual(use_residual)
                .build(vb, &[2, 4, 4, 8])
                .into_local_err().whatever_context("Cannot build block")?;
            let ys = block
                .forward_t(&xs, false)
                .into_local_err().whatever_context("Cannot apply block")?;
            assert_tensor_eq!(ys, expected, epsilon = 1e-6f32);
        }

        Ok(())
    }

    #[test]
    fn input_channels_must_match_in_filters() {
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let err = InvertedBottleneckBlockConfig::default()
            .in_filters(16)
            .build(vb, &[1, 4, 4, 8])
            .err()
            .unwrap();
        assert_eq!(
            err.to_string(),
            "Block was configured for 16 input channels, got 8"
        );
    }

    #[test]
    #[report]
    fn depthwise_kernel_is_regularized_on_request() -> Result<(), Whatever> {
        let device = Device::Cpu;
        let regularizer = Some(Regularizer::L1 { l1: 1. });
        let mut losses = Vec::new();
        for regularize_depthwise in [false, true] {
            let vb = VarBuilder::from_varmap(&VarMap::new(), DType::F32, &device);
            let block = InvertedBottleneckBlockConfig::default()
                .in_filters(4)
                .out_filters(4)
                .expand_ratio(1.)
                .kernel_initializer(KernelInitializer::Ones)
                .kernel_regularizer(regularizer)
                .regularize_depthwise(regularize_depthwise)
                .build(vb, &[1, 4, 4, 4])
                .into_local_err().whatever_context("Cannot build block")?;
            let loss = block
                .regularization_loss()
                .into_local_err().whatever_context("Cannot compute loss")?
                .map(|loss| loss.to_scalar::<f32>())
                .transpose()
                .whatever_context("Cannot convert loss")?;
            losses.push(loss);
        }

        // Projection kernel: 4 * 4 ones, depthwise kernel: 4 * 3 * 3 ones.
        assert_eq!(losses, vec![Some(16.), Some(52.)]);
        Ok(())
    }

    #[test]
    fn inverted_bottleneck_config_roundtrips() {
        let config = InvertedBottleneckBlockConfig::default()
            .in_filters(24)
            .out_filters(40)
            .expand_ratio(4.)
            .se_ratio(Some(0.25))
            .se_gating_activation(Activation::HardSigmoid)
            .depthwise_activation(Some(Activation::HardSwish));
        let exported = config.to_config().unwrap();
        assert_eq!(exported["se_gating_activation"], "hard_sigmoid");
        assert_eq!(
            InvertedBottleneckBlockConfig::from_config(exported).unwrap(),
            config
        );

        let mut exported = config.to_config().unwrap();
        exported.insert("activation".to_string(), json!("no_such_activation"));
        assert!(InvertedBottleneckBlockConfig::from_config(exported).is_err());
    }
}
