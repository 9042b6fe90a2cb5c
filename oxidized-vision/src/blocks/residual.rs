use candle_core::{Module, ModuleT, Tensor, Var};
use candle_nn::VarBuilder;
use serde::{Deserialize, Serialize};
use snafu::{ensure, ResultExt, Snafu};

use crate::blocks::{
    use_squeeze_excitation, Block, BlockConfig, BlockShapeError, BuildBlock, FeatureMapShape,
    NormOptions,
};
use crate::error::BoxedError;
use crate::layers::activation::Activation;
use crate::layers::batch_norm::{BatchNorm, BatchNormError};
use crate::layers::build_module::BuildModule;
use crate::layers::conv::{Conv2d, Conv2dConfig, Conv2dError, Padding};
use crate::layers::data_format::DataFormat;
use crate::layers::init::KernelInitializer;
use crate::layers::regularizer::{sum_penalties, Regularizer};
use crate::layers::squeeze_excitation::{
    SqueezeExcitation, SqueezeExcitationConfig, SqueezeExcitationError,
};
use crate::layers::stochastic_depth::StochasticDepthConfig;

/// Residual block configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResidualBlockConfig {
    activation: Activation,
    bias_regularizer: Option<Regularizer>,
    bn_trainable: bool,
    filters: usize,
    kernel_initializer: KernelInitializer,
    kernel_regularizer: Option<Regularizer>,
    norm_epsilon: f64,
    norm_momentum: f64,
    resnetd_shortcut: bool,
    se_ratio: Option<f64>,
    stochastic_depth_drop_rate: Option<f64>,
    strides: usize,
    use_explicit_padding: bool,
    use_projection: bool,
    use_sync_bn: bool,
}

impl ResidualBlockConfig {
    /// Activation function.
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

    /// Whether the batch normalization layers are trainable.
    ///
    /// Default: `true`
    pub fn bn_trainable(mut self, bn_trainable: bool) -> Self {
        self.bn_trainable = bn_trainable;
        self
    }

    /// Number of output channels of both convolutions.
    ///
    /// Default: `64`
    pub fn filters(mut self, filters: usize) -> Self {
        self.filters = filters;
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

    /// ResNet-D style shortcut.
    ///
    /// Residual blocks accept this option for compatibility with
    /// bottleneck blocks, but do not change their shortcut.
    ///
    /// Default: `false`
    pub fn resnetd_shortcut(mut self, resnetd_shortcut: bool) -> Self {
        self.resnetd_shortcut = resnetd_shortcut;
        self
    }

    /// Squeeze-and-excitation ratio, used when in `(0, 1]`.
    ///
    /// Default: `None`
    pub fn se_ratio(mut self, se_ratio: Option<f64>) -> Self {
        self.se_ratio = se_ratio;
        self
    }

    /// Stochastic depth drop rate of the residual branch.
    ///
    /// Default: `None`
    pub fn stochastic_depth_drop_rate(mut self, stochastic_depth_drop_rate: Option<f64>) -> Self {
        self.stochastic_depth_drop_rate = stochastic_depth_drop_rate;
        self
    }

    /// Stride of the first convolution and the projection shortcut.
    ///
    /// Default: `1`
    pub fn strides(mut self, strides: usize) -> Self {
        self.strides = strides;
        self
    }

    /// Pad the input with one row/column of zeros on each side and use
    /// `valid` padding in the first convolution.
    ///
    /// Default: `false`
    pub fn use_explicit_padding(mut self, use_explicit_padding: bool) -> Self {
        self.use_explicit_padding = use_explicit_padding;
        self
    }

    /// Use a projection shortcut instead of the identity.
    ///
    /// Default: `false`
    pub fn use_projection(mut self, use_projection: bool) -> Self {
        self.use_projection = use_projection;
        self
    }

    /// Use synchronized batch normalization.
    ///
    /// Default: `false`
    pub fn use_sync_bn(mut self, use_sync_bn: bool) -> Self {
        self.use_sync_bn = use_sync_bn;
        self
    }

    fn norm_options(&self) -> NormOptions {
        NormOptions {
            epsilon: self.norm_epsilon,
            momentum: self.norm_momentum,
            synchronized: self.use_sync_bn,
            trainable: self.bn_trainable,
        }
    }

    fn conv_config(&self) -> Conv2dConfig {
        Conv2dConfig::default()
            .bias_regularizer(self.bias_regularizer)
            .kernel_initializer(self.kernel_initializer)
            .kernel_regularizer(self.kernel_regularizer)
    }
}

impl Default for ResidualBlockConfig {
    fn default() -> Self {
        Self {
            activation: Activation::Relu,
            bias_regularizer: None,
            bn_trainable: true,
            filters: 64,
            kernel_initializer: KernelInitializer::default(),
            kernel_regularizer: None,
            norm_epsilon: 0.001,
            norm_momentum: 0.99,
            resnetd_shortcut: false,
            se_ratio: None,
            stochastic_depth_drop_rate: None,
            strides: 1,
            use_explicit_padding: false,
            use_projection: false,
            use_sync_bn: false,
        }
    }
}

impl BlockConfig for ResidualBlockConfig {}

impl BuildBlock for ResidualBlockConfig {
    type Block = ResidualBlock;

    fn build(&self, vb: VarBuilder, input_shape: &[usize]) -> Result<ResidualBlock, BoxedError> {
        let shape = FeatureMapShape::new("ResidualBlock", input_shape, DataFormat::current())
            .context(InputShapeSnafu)?;
        ensure!(
            self.use_projection || (shape.channels() == self.filters && self.strides == 1),
            ShortcutShapeSnafu {
                filters: self.filters,
                in_channels: shape.channels(),
                strides: self.strides
            }
        );

        let norm = self.norm_options();

        let shortcut = if self.use_projection {
            let conv = self
                .conv_config()
                .in_channels(shape.channels())
                .out_channels(self.filters)
                .strides(self.strides)
                .build(vb.push_prefix("shortcut"))
                .context(BuildConvSnafu)?;
            let norm = norm
                .build(vb.push_prefix("norm0"), self.filters)
                .context(BuildNormSnafu)?;
            Some(Projection { conv, norm })
        } else {
            None
        };

        let conv1 = self
            .conv_config()
            .in_channels(shape.channels())
            .out_channels(self.filters)
            .kernel_size(3)
            .strides(self.strides)
            .padding(if self.use_explicit_padding {
                Padding::Valid
            } else {
                Padding::Same
            })
            .build(vb.push_prefix("conv1"))
            .context(BuildConvSnafu)?;
        let norm1 = norm
            .build(vb.push_prefix("norm1"), self.filters)
            .context(BuildNormSnafu)?;

        let conv2 = self
            .conv_config()
            .in_channels(self.filters)
            .out_channels(self.filters)
            .kernel_size(3)
            .build(vb.push_prefix("conv2"))
            .context(BuildConvSnafu)?;
        let norm2 = norm
            .build(vb.push_prefix("norm2"), self.filters)
            .context(BuildNormSnafu)?;

        let squeeze_excitation = match self.se_ratio {
            Some(se_ratio) if use_squeeze_excitation(self.se_ratio) => Some(
                SqueezeExcitationConfig::default()
                    .bias_regularizer(self.bias_regularizer)
                    .in_channels(self.filters)
                    .kernel_initializer(self.kernel_initializer)
                    .kernel_regularizer(self.kernel_regularizer)
                    .out_channels(self.filters)
                    .se_ratio(se_ratio)
                    .build(vb.push_prefix("squeeze_excitation"))
                    .context(BuildSqueezeExcitationSnafu)?,
            ),
            _ => None,
        };

        let stochastic_depth = StochasticDepthConfig::default()
            .drop_rate(self.stochastic_depth_drop_rate)
            .build(vb.push_prefix("stochastic_depth"))
            .context(BuildStochasticDepthSnafu)?;

        Ok(ResidualBlock {
            activation: self.activation,
            conv1,
            conv2,
            explicit_padding: self.use_explicit_padding,
            norm1,
            norm2,
            shape,
            shortcut,
            squeeze_excitation,
            stochastic_depth,
        })
    }
}

/// Residual block errors.
#[derive(Debug, Snafu)]
pub enum ResidualBlockError {
    #[snafu(display("Cannot build convolution"))]
    BuildConv { source: Conv2dError },

    #[snafu(display("Cannot build batch normalization"))]
    BuildNorm { source: BatchNormError },

    #[snafu(display("Cannot build squeeze-and-excitation"))]
    BuildSqueezeExcitation { source: SqueezeExcitationError },

    #[snafu(display("Cannot build stochastic depth"))]
    BuildStochasticDepth { source: BoxedError },

    #[snafu(display("Cannot apply residual block"))]
    Forward { source: candle_core::Error },

    #[snafu(display("Invalid residual block input"))]
    InputShape { source: BlockShapeError },

    #[snafu(display("Cannot compute regularization loss"))]
    RegularizationLoss { source: candle_core::Error },

    #[snafu(display(
        "Identity shortcut requires {filters} input channels and stride 1, got {in_channels} channels and stride {strides}"
    ))]
    ShortcutShape {
        filters: usize,
        in_channels: usize,
        strides: usize,
    },
}

/// 1x1 projection shortcut followed by batch normalization.
pub(crate) struct Projection {
    pub(crate) conv: Conv2d,
    pub(crate) norm: BatchNorm,
}

/// Residual block (_He et al., 2015_).
///
/// Two 3x3 convolutions with batch normalization, an optional
/// squeeze-and-excitation layer and stochastic depth on the residual
/// branch. The shortcut is the identity or a 1x1 projection.
///
/// * _He et al., 2015_: https://arxiv.org/abs/1512.03385
pub struct ResidualBlock {
    activation: Activation,
    conv1: Conv2d,
    conv2: Conv2d,
    explicit_padding: bool,
    norm1: BatchNorm,
    norm2: BatchNorm,
    shape: FeatureMapShape,
    shortcut: Option<Projection>,
    squeeze_excitation: Option<SqueezeExcitation>,
    stochastic_depth: Box<dyn ModuleT>,
}

impl ResidualBlock {
    fn forward_channels_first(&self, xs: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        let shortcut = match &self.shortcut {
            Some(projection) => projection
                .norm
                .forward_t(&projection.conv.forward(xs)?, train)?,
            None => xs.clone(),
        };

        let padded = if self.explicit_padding {
            xs.pad_with_zeros(2, 1, 1)?.pad_with_zeros(3, 1, 1)?
        } else {
            xs.clone()
        };
        let hidden = self.conv1.forward(&padded)?;
        let hidden = self
            .activation
            .forward(&self.norm1.forward_t(&hidden, train)?)?;
        let mut hidden = self.norm2.forward_t(&self.conv2.forward(&hidden)?, train)?;

        if let Some(squeeze_excitation) = &self.squeeze_excitation {
            hidden = squeeze_excitation.forward(&hidden)?;
        }
        let hidden = self.stochastic_depth.forward_t(&hidden, train)?;

        self.activation.forward(&(hidden + shortcut)?)
    }
}

impl Block for ResidualBlock {
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
        let mut variables = Vec::new();
        if let Some(projection) = &self.shortcut {
            variables.extend(projection.conv.trainable_variables());
            variables.extend(projection.norm.trainable_variables());
        }
        variables.extend(self.conv1.trainable_variables());
        variables.extend(self.norm1.trainable_variables());
        variables.extend(self.conv2.trainable_variables());
        variables.extend(self.norm2.trainable_variables());
        if let Some(squeeze_excitation) = &self.squeeze_excitation {
            variables.extend(squeeze_excitation.trainable_variables());
        }
        variables
    }

    fn non_trainable_variables(&self) -> Vec<Var> {
        let mut variables = Vec::new();
        if let Some(projection) = &self.shortcut {
            variables.extend(projection.norm.non_trainable_variables());
        }
        variables.extend(self.norm1.non_trainable_variables());
        variables.extend(self.norm2.non_trainable_variables());
        variables
    }

    fn regularization_loss(&self) -> Result<Option<Tensor>, BoxedError> {
        let mut penalties = Vec::new();
        if let Some(projection) = &self.shortcut {
            penalties.extend(projection.conv.penalties().context(RegularizationLossSnafu)?);
        }
        penalties.extend(self.conv1.penalties().context(RegularizationLossSnafu)?);
        penalties.extend(self.conv2.penalties().context(RegularizationLossSnafu)?);
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
