use candle_core::{Module, ModuleT, Tensor, Var};
use candle_nn::VarBuilder;
use serde::{Deserialize, Serialize};
use snafu::{ensure, ResultExt, Snafu};

use crate::blocks::residual::Projection;
use crate::blocks::{
    use_squeeze_excitation, Block, BlockConfig, BlockShapeError, BuildBlock, FeatureMapShape,
    NormOptions,
};
use crate::error::BoxedError;
use crate::layers::activation::Activation;
use crate::layers::batch_norm::{BatchNorm, BatchNormError};
use crate::layers::build_module::BuildModule;
use crate::layers::conv::{Conv2d, Conv2dConfig, Conv2dError};
use crate::layers::data_format::DataFormat;
use crate::layers::init::KernelInitializer;
use crate::layers::pooling::{avg_pool_same, PoolingError};
use crate::layers::regularizer::{sum_penalties, Regularizer};
use crate::layers::squeeze_excitation::{
    SqueezeExcitation, SqueezeExcitationConfig, SqueezeExcitationError,
};
use crate::layers::stochastic_depth::StochasticDepthConfig;

/// Bottleneck block configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BottleneckBlockConfig {
    activation: Activation,
    bias_regularizer: Option<Regularizer>,
    bn_trainable: bool,
    dilation_rate: usize,
    filters: usize,
    kernel_initializer: KernelInitializer,
    kernel_regularizer: Option<Regularizer>,
    norm_epsilon: f64,
    norm_momentum: f64,
    resnetd_shortcut: bool,
    se_ratio: Option<f64>,
    stochastic_depth_drop_rate: Option<f64>,
    strides: usize,
    use_projection: bool,
    use_sync_bn: bool,
}

impl BottleneckBlockConfig {
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

    /// Dilation rate of the 3x3 convolution.
    ///
    /// Default: `1`
    pub fn dilation_rate(mut self, dilation_rate: usize) -> Self {
        self.dilation_rate = dilation_rate;
        self
    }

    /// Number of output channels of the first two convolutions. The last
    /// convolution has `4 * filters` output channels.
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

    /// ResNet-D style projection shortcut: downsample with average
    /// pooling before an unstrided 1x1 convolution.
    ///
    /// See [He et al., 2018](https://arxiv.org/abs/1812.01187).
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

    /// Stride of the 3x3 convolution and the projection shortcut.
    ///
    /// Default: `1`
    pub fn strides(mut self, strides: usize) -> Self {
        self.strides = strides;
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

    fn conv_config(&self) -> Conv2dConfig {
        Conv2dConfig::default()
            .bias_regularizer(self.bias_regularizer)
            .kernel_initializer(self.kernel_initializer)
            .kernel_regularizer(self.kernel_regularizer)
    }
}

impl Default for BottleneckBlockConfig {
    fn default() -> Self {
        Self {
            activation: Activation::Relu,
            bias_regularizer: None,
            bn_trainable: true,
            dilation_rate: 1,
            filters: 64,
            kernel_initializer: KernelInitializer::default(),
            kernel_regularizer: None,
            norm_epsilon: 0.001,
            norm_momentum: 0.99,
            resnetd_shortcut: false,
            se_ratio: None,
            stochastic_depth_drop_rate: None,
            strides: 1,
            use_projection: false,
            use_sync_bn: false,
        }
    }
}

impl BlockConfig for BottleneckBlockConfig {}

impl BuildBlock for BottleneckBlockConfig {
    type Block = BottleneckBlock;

    fn build(&self, vb: VarBuilder, input_shape: &[usize]) -> Result<BottleneckBlock, BoxedError> {
        let shape = FeatureMapShape::new("BottleneckBlock", input_shape, DataFormat::current())
            .context(InputShapeSnafu)?;
        let out_channels = 4 * self.filters;
        ensure!(
            self.use_projection || (shape.channels() == out_channels && self.strides == 1),
            ShortcutShapeSnafu {
                in_channels: shape.channels(),
                out_channels,
                strides: self.strides
            }
        );

        let norm = NormOptions {
            epsilon: self.norm_epsilon,
            momentum: self.norm_momentum,
            synchronized: self.use_sync_bn,
            trainable: self.bn_trainable,
        };

        let shortcut = if self.use_projection {
            // The ResNet-D shortcut downsamples by pooling, so its
            // convolution is unstrided.
            let conv_strides = if self.resnetd_shortcut { 1 } else { self.strides };
            let conv = self
                .conv_config()
                .in_channels(shape.channels())
                .out_channels(out_channels)
                .strides(conv_strides)
                .build(vb.push_prefix("shortcut"))
                .context(BuildConvSnafu)?;
            let norm = norm
                .build(vb.push_prefix("norm0"), out_channels)
                .context(BuildNormSnafu)?;
            Some(Projection { conv, norm })
        } else {
            None
        };

        let conv1 = self
            .conv_config()
            .in_channels(shape.channels())
            .out_channels(self.filters)
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
            .strides(self.strides)
            .dilation_rate(self.dilation_rate)
            .build(vb.push_prefix("conv2"))
            .context(BuildConvSnafu)?;
        let norm2 = norm
            .build(vb.push_prefix("norm2"), self.filters)
            .context(BuildNormSnafu)?;

        let conv3 = self
            .conv_config()
            .in_channels(self.filters)
            .out_channels(out_channels)
            .build(vb.push_prefix("conv3"))
            .context(BuildConvSnafu)?;
        let norm3 = norm
            .build(vb.push_prefix("norm3"), out_channels)
            .context(BuildNormSnafu)?;

        let squeeze_excitation = match self.se_ratio {
            Some(se_ratio) if use_squeeze_excitation(self.se_ratio) => Some(
                SqueezeExcitationConfig::default()
                    .bias_regularizer(self.bias_regularizer)
                    .in_channels(out_channels)
                    .kernel_initializer(self.kernel_initializer)
                    .kernel_regularizer(self.kernel_regularizer)
                    .out_channels(out_channels)
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

        Ok(BottleneckBlock {
            activation: self.activation,
            convs: [conv1, conv2, conv3],
            norms: [norm1, norm2, norm3],
            resnetd_pool_strides: (self.use_projection && self.resnetd_shortcut)
                .then_some(self.strides),
            shape,
            shortcut,
            squeeze_excitation,
            stochastic_depth,
        })
    }
}

/// Bottleneck block errors.
#[derive(Debug, Snafu)]
pub enum BottleneckBlockError {
    #[snafu(display("Cannot build convolution"))]
    BuildConv { source: Conv2dError },

    #[snafu(display("Cannot build batch normalization"))]
    BuildNorm { source: BatchNormError },

    #[snafu(display("Cannot build squeeze-and-excitation"))]
    BuildSqueezeExcitation { source: SqueezeExcitationError },

    #[snafu(display("Cannot build stochastic depth"))]
    BuildStochasticDepth { source: BoxedError },

    #[snafu(display("Cannot apply bottleneck block"))]
    Forward { source: candle_core::Error },

    #[snafu(display("Invalid bottleneck block input"))]
    InputShape { source: BlockShapeError },

    #[snafu(display("Cannot downsample shortcut"))]
    PoolShortcut { source: PoolingError },

    #[snafu(display("Cannot compute regularization loss"))]
    RegularizationLoss { source: candle_core::Error },

    #[snafu(display(
        "Identity shortcut requires {out_channels} input channels and stride 1, got {in_channels} channels and stride {strides}"
    ))]
    ShortcutShape {
        in_channels: usize,
        out_channels: usize,
        strides: usize,
    },
}

/// Bottleneck block (_He et al., 2015_).
///
/// A 1x1 convolution reduces the channels to `filters`, a 3x3 convolution
/// applies the stride and a final 1x1 convolution expands to
/// `4 * filters` channels.
///
/// * _He et al., 2015_: https://arxiv.org/abs/1512.03385
pub struct BottleneckBlock {
    activation: Activation,
    convs: [Conv2d; 3],
    norms: [BatchNorm; 3],
    resnetd_pool_strides: Option<usize>,
    shape: FeatureMapShape,
    shortcut: Option<Projection>,
    squeeze_excitation: Option<SqueezeExcitation>,
    stochastic_depth: Box<dyn ModuleT>,
}

impl BottleneckBlock {
    fn shortcut(&self, xs: &Tensor, train: bool) -> Result<Tensor, BottleneckBlockError> {
        let projection = match &self.shortcut {
            Some(projection) => projection,
            None => return Ok(xs.clone()),
        };

        let xs = match self.resnetd_pool_strides {
            Some(strides) => avg_pool_same(xs, 2, strides).context(PoolShortcutSnafu)?,
            None => xs.clone(),
        };
        projection
            .conv
            .forward(&xs)
            .and_then(|xs| projection.norm.forward_t(&xs, train))
            .context(ForwardSnafu)
    }

    fn residual_branch(&self, xs: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        let mut hidden = xs.clone();
        for (idx, (conv, norm)) in self.convs.iter().zip(&self.norms).enumerate() {
            hidden = norm.forward_t(&conv.forward(&hidden)?, train)?;
            if idx < 2 {
                hidden = self.activation.forward(&hidden)?;
            }
        }

        if let Some(squeeze_excitation) = &self.squeeze_excitation {
            hidden = squeeze_excitation.forward(&hidden)?;
        }
        self.stochastic_depth.forward_t(&hidden, train)
    }
}

impl Block for BottleneckBlock {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor, BoxedError> {
        self.shape.check(xs).context(InputShapeSnafu)?;
        let data_format = self.shape.data_format();
        let xs = data_format.to_channels_first(xs).context(ForwardSnafu)?;

        let shortcut = self.shortcut(&xs, train)?;
        let ys = self
            .residual_branch(&xs, train)
            .and_then(|hidden| self.activation.forward(&(hidden + shortcut)?))
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
        for (conv, norm) in self.convs.iter().zip(&self.norms) {
            variables.extend(conv.trainable_variables());
            variables.extend(norm.trainable_variables());
        }
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
        for norm in &self.norms {
            variables.extend(norm.non_trainable_variables());
        }
        variables
    }

    fn regularization_loss(&self) -> Result<Option<Tensor>, BoxedError> {
        let mut penalties = Vec::new();
        let convs = self
            .shortcut
            .iter()
            .map(|projection| &projection.conv)
            .chain(&self.convs);
        for conv in convs {
            penalties.extend(conv.penalties().context(RegularizationLossSnafu)?);
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
    use rstest::rstest;
    use snafu::{report, ResultExt, Whatever};

    use super::BottleneckBlockConfig;
    use crate::blocks::{Block, BlockConfig, BuildBlock};
    use crate::layers::init::KernelInitializer;
    use crate::util::tests::{assert_tensor_eq, IntoLocalErr, PseudoRandom};

    #[rstest]
    #[case(1, false, 1, &[2, 8, 8, 32])]
    #[case(2, false, 1, &[2, 4, 4, 32])]
    #[case(2, true, 1, &[2, 4, 4, 32])]
    #[case(1, true, 2, &[2, 8, 8, 32])]
    fn bottleneck_block_has_correct_output_shape(
        #[case] strides: usize,
        #[case] resnetd_shortcut: bool,
        #[case] dilation_rate: usize,
        #[case] expected: &[usize],
    ) {
        let device = Device::Cpu;
        let vb = VarBuilder::from_varmap(&VarMap::new(), DType::F32, &device);
        let block = BottleneckBlockConfig::default()
            .filters(8)
            .strides(strides)
            .dilation_rate(dilation_rate)
            .use_projection(true)
            .resnetd_shortcut(resnetd_shortcut)
            .se_ratio(Some(0.25))
            .stochastic_depth_drop_rate(Some(0.1))
            .build(vb, &[2, 8, 8, 16])
            .unwrap();
        let xs = Tensor::pseudo_random((2, 8, 8, 16), 3, DType::F32, &device).unwrap();
        assert_eq!(block.forward_t(&xs, true).unwrap().dims(), expected);
    }

    #[test]
    #[report]
    fn zero_branch_passes_shortcut_through_activation() -> Result<(), Whatever> {
        let device = Device::Cpu;
        let vb = VarBuilder::from_varmap(&VarMap::new(), DType::F32, &device);
        let block = BottleneckBlockConfig::default()
            .filters(4)
            .kernel_initializer(KernelInitializer::Zeros)
            .build(vb, &[2, 4, 4, 16])
            .into_local_err().whatever_context("Cannot build block")?;
        let xs = Tensor::pseudo_random((2, 4, 4, 16), 4, DType::F32, &device)
            .whatever_context("Cannot create input")?;
        let ys = block
            .forward_t(&xs, false)
            .into_local_err().whatever_context("Cannot apply block")?;
        assert_tensor_eq!(
            ys,
            xs.relu().whatever_context("Cannot apply relu")?,
            epsilon = 1e-6f32
        );
        Ok(())
    }

    #[test]
    fn identity_shortcut_requires_expanded_channels() {
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        assert!(BottleneckBlockConfig::default()
            .filters(8)
            .build(vb.clone(), &[2, 8, 8, 16])
            .is_err());
        assert!(BottleneckBlockConfig::default()
            .filters(4)
            .build(vb, &[2, 8, 8, 16])
            .is_ok());
    }

    #[test]
    fn bottleneck_block_config_roundtrips() {
        let config = BottleneckBlockConfig::default()
            .filters(16)
            .strides(2)
            .dilation_rate(2)
            .use_projection(true)
            .resnetd_shortcut(true)
            .stochastic_depth_drop_rate(Some(0.2));
        let exported = config.to_config().unwrap();
        assert_eq!(exported["resnetd_shortcut"], true);
        assert_eq!(BottleneckBlockConfig::from_config(exported).unwrap(), config);
    }
}
