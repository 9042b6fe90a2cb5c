use candle_core::{Tensor, Var};
use candle_nn::VarBuilder;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use crate::blocks::{
    Block, BlockConfig, BlockShapeError, BuildBlock, ConvNorm, FeatureMapShape, NormOptions,
};
use crate::error::BoxedError;
use crate::layers::activation::Activation;
use crate::layers::batch_norm::BatchNormError;
use crate::layers::conv::{Conv2dConfig, Conv2dError};
use crate::layers::data_format::DataFormat;
use crate::layers::init::KernelInitializer;
use crate::layers::regularizer::{sum_penalties, Regularizer};

/// Depthwise separable convolution block configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DepthwiseSeparableConvBlockConfig {
    activation: Activation,
    dilation_rate: usize,
    filters: usize,
    kernel_initializer: KernelInitializer,
    kernel_regularizer: Option<Regularizer>,
    kernel_size: usize,
    norm_epsilon: f64,
    norm_momentum: f64,
    regularize_depthwise: bool,
    strides: usize,
    use_sync_bn: bool,
}

impl DepthwiseSeparableConvBlockConfig {
    /// Activation after both convolutions.
    ///
    /// Default: `Activation::Relu6`
    pub fn activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }

    /// Dilation rate of the depthwise convolution.
    ///
    /// Default: `1`
    pub fn dilation_rate(mut self, dilation_rate: usize) -> Self {
        self.dilation_rate = dilation_rate;
        self
    }

    /// Number of output channels of the pointwise convolution.
    ///
    /// Default: `32`
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

    /// Kernel regularizer of the pointwise convolution.
    ///
    /// Default: `None`
    pub fn kernel_regularizer(mut self, kernel_regularizer: Option<Regularizer>) -> Self {
        self.kernel_regularizer = kernel_regularizer;
        self
    }

    /// Kernel size of the depthwise convolution.
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

    /// Also apply the kernel regularizer to the depthwise kernel.
    ///
    /// Default: `false`
    pub fn regularize_depthwise(mut self, regularize_depthwise: bool) -> Self {
        self.regularize_depthwise = regularize_depthwise;
        self
    }

    /// Stride of the depthwise convolution.
    ///
    /// Default: `1`
    pub fn strides(mut self, strides: usize) -> Self {
        self.strides = strides;
        self
    }

    /// Use synchronized batch normalization.
    ///
    /// Default: `false`
    pub fn use_sync_bn(mut self, use_sync_bn: bool) -> Self {
        self.use_sync_bn = use_sync_bn;
        self
    }
}

impl Default for DepthwiseSeparableConvBlockConfig {
    fn default() -> Self {
        Self {
            activation: Activation::Relu6,
            dilation_rate: 1,
            filters: 32,
            kernel_initializer: KernelInitializer::default(),
            kernel_regularizer: None,
            kernel_size: 3,
            norm_epsilon: 0.001,
            norm_momentum: 0.99,
            regularize_depthwise: false,
            strides: 1,
            use_sync_bn: false,
        }
    }
}

impl BlockConfig for DepthwiseSeparableConvBlockConfig {}

impl BuildBlock for DepthwiseSeparableConvBlockConfig {
    type Block = DepthwiseSeparableConvBlock;

    fn build(
        &self,
        vb: VarBuilder,
        input_shape: &[usize],
    ) -> Result<DepthwiseSeparableConvBlock, BoxedError> {
        let shape = FeatureMapShape::new(
            "DepthwiseSeparableConvBlock",
            input_shape,
            DataFormat::current(),
        )
        .context(InputShapeSnafu)?;
        let in_channels = shape.channels();

        let norm = NormOptions {
            epsilon: self.norm_epsilon,
            momentum: self.norm_momentum,
            synchronized: self.use_sync_bn,
            trainable: true,
        };
        let conv = Conv2dConfig::default().kernel_initializer(self.kernel_initializer);

        let depthwise = ConvNorm {
            activation: Some(self.activation),
            conv: conv
                .clone()
                .depthwise(true)
                .dilation_rate(self.dilation_rate)
                .in_channels(in_channels)
                .kernel_regularizer(self.kernel_regularizer.filter(|_| self.regularize_depthwise))
                .kernel_size(self.kernel_size)
                .out_channels(in_channels)
                .strides(self.strides)
                .build(vb.push_prefix("dwconv0"))
                .context(BuildConvSnafu)?,
            norm: norm
                .build(vb.push_prefix("norm0"), in_channels)
                .context(BuildNormSnafu)?,
        };

        let pointwise = ConvNorm {
            activation: Some(self.activation),
            conv: conv
                .in_channels(in_channels)
                .kernel_regularizer(self.kernel_regularizer)
                .out_channels(self.filters)
                .build(vb.push_prefix("conv1"))
                .context(BuildConvSnafu)?,
            norm: norm
                .build(vb.push_prefix("norm1"), self.filters)
                .context(BuildNormSnafu)?,
        };

        Ok(DepthwiseSeparableConvBlock {
            depthwise,
            pointwise,
            shape,
        })
    }
}

/// Depthwise separable convolution block errors.
#[derive(Debug, Snafu)]
pub enum DepthwiseSeparableConvBlockError {
    #[snafu(display("Cannot build convolution"))]
    BuildConv { source: Conv2dError },

    #[snafu(display("Cannot build batch normalization"))]
    BuildNorm { source: BatchNormError },

    #[snafu(display("Cannot apply depthwise separable convolution block"))]
    Forward { source: candle_core::Error },

    #[snafu(display("Invalid depthwise separable convolution block input"))]
    InputShape { source: BlockShapeError },

    #[snafu(display("Cannot compute regularization loss"))]
    RegularizationLoss { source: candle_core::Error },
}

/// Depthwise separable convolution block (_Howard et al., 2017_).
///
/// A depthwise convolution filters every channel separately, then a
/// pointwise convolution mixes the channels. Both convolutions are
/// followed by batch normalization and the activation.
///
/// * _Howard et al., 2017_: https://arxiv.org/abs/1704.04861
pub struct DepthwiseSeparableConvBlock {
    depthwise: ConvNorm,
    pointwise: ConvNorm,
    shape: FeatureMapShape,
}

impl Block for DepthwiseSeparableConvBlock {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor, BoxedError> {
        self.shape.check(xs).context(InputShapeSnafu)?;
        let data_format = self.shape.data_format();
        let ys = data_format
            .to_channels_first(xs)
            .and_then(|xs| self.depthwise.forward_t(&xs, train))
            .and_then(|xs| self.pointwise.forward_t(&xs, train))
            .and_then(|ys| data_format.from_channels_first(&ys))
            .context(ForwardSnafu)?;
        Ok(ys)
    }

    fn trainable_variables(&self) -> Vec<Tensor> {
        let mut variables = self.depthwise.trainable_variables();
        variables.extend(self.pointwise.trainable_variables());
        variables
    }

    fn non_trainable_variables(&self) -> Vec<Var> {
        let mut variables = self.depthwise.non_trainable_variables();
        variables.extend(self.pointwise.non_trainable_variables());
        variables
    }

    fn regularization_loss(&self) -> Result<Option<Tensor>, BoxedError> {
        let mut penalties = self.depthwise.penalties().context(RegularizationLossSnafu)?;
        penalties.extend(self.pointwise.penalties().context(RegularizationLossSnafu)?);
        Ok(sum_penalties(penalties).context(RegularizationLossSnafu)?)
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device, Tensor};
    use candle_nn::{VarBuilder, VarMap};
    use rstest::rstest;
    use snafu::{report, ResultExt, Whatever};

    use super::DepthwiseSeparableConvBlockConfig;
    use crate::blocks::{Block, BlockConfig, BuildBlock};
    use crate::layers::data_format::{with_data_format, DataFormat};
    use crate::util::tests::{IntoLocalErr, PseudoRandom};

    #[rstest]
    #[case(1, 1, &[2, 7, 7, 24])]
    #[case(2, 1, &[2, 4, 4, 24])]
    #[case(1, 2, &[2, 7, 7, 24])]
    fn depthwise_separable_block_has_correct_output_shape(
        #[case] strides: usize,
        #[case] dilation_rate: usize,
        #[case] expected: &[usize],
    ) {
        let device = Device::Cpu;
        let vb = VarBuilder::from_varmap(&VarMap::new(), DType::F32, &device);
        let block = DepthwiseSeparableConvBlockConfig::default()
            .filters(24)
            .strides(strides)
            .dilation_rate(dilation_rate)
            .build(vb, &[2, 7, 7, 8])
            .unwrap();
        let xs = Tensor::pseudo_random((2, 7, 7, 8), 10, DType::F32, &device).unwrap();
        assert_eq!(block.forward_t(&xs, true).unwrap().dims(), expected);
    }

    #[test]
    #[report]
    fn relu6_caps_outputs() -> Result<(), Whatever> {
        let device = Device::Cpu;
        let vb = VarBuilder::from_varmap(&VarMap::new(), DType::F32, &device);
        let block = with_data_format(DataFormat::ChannelsFirst, || {
            DepthwiseSeparableConvBlockConfig::default()
                .filters(4)
                .build(vb, &[1, 4, 5, 5])
        })
        .into_local_err().whatever_context("Cannot build block")?;
        let xs = (Tensor::pseudo_random((1, 4, 5, 5), 11, DType::F32, &device)
            .whatever_context("Cannot create input")?
            * 100.)
            .whatever_context("Cannot scale input")?;
        let ys = block
            .forward_t(&xs, false)
            .and_then(|ys| Ok(ys.flatten_all()?.to_vec1::<f32>()?))
            .into_local_err().whatever_context("Cannot apply block")?;
        assert!(ys.iter().all(|&v| (0. ..=6.).contains(&v)));
        Ok(())
    }

    #[test]
    fn depthwise_separable_config_roundtrips() {
        let config = DepthwiseSeparableConvBlockConfig::default()
            .filters(64)
            .kernel_size(5)
            .regularize_depthwise(true);
        let exported = config.to_config().unwrap();
        assert_eq!(exported["activation"], "relu6");
        assert_eq!(
            DepthwiseSeparableConvBlockConfig::from_config(exported).unwrap(),
            config
        );
    }
}
