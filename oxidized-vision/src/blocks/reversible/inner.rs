use candle_core::{Module, ModuleT, Tensor, Var};
use candle_nn::VarBuilder;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use crate::blocks::{
    Block, BlockConfig, BlockShapeError, BuildBlock, FeatureMapShape, NormOptions,
};
use crate::error::BoxedError;
use crate::layers::activation::Activation;
use crate::layers::batch_norm::{BatchNorm, BatchNormError};
use crate::layers::conv::{Conv2d, Conv2dConfig, Conv2dError};
use crate::layers::data_format::DataFormat;
use crate::layers::init::KernelInitializer;
use crate::layers::regularizer::{sum_penalties, Regularizer};

/// Residual function of a reversible layer.
///
/// A reversible layer recomputes its residual functions during the
/// backward pass. Implementations must not depend on state other than
/// their trainable variables and normalization statistics.
pub trait ReversibleFunction: Block {
    /// Spatial stride of the function.
    fn strides(&self) -> usize;
}

/// Options shared by the inner block configurations.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
struct InnerOptions {
    activation: Activation,
    batch_norm_first: bool,
    filters: usize,
    kernel_initializer: KernelInitializer,
    kernel_regularizer: Option<Regularizer>,
    norm_epsilon: f64,
    norm_momentum: f64,
    strides: usize,
    use_sync_bn: bool,
}

impl Default for InnerOptions {
    fn default() -> Self {
        Self {
            activation: Activation::Relu,
            batch_norm_first: true,
            filters: 16,
            kernel_initializer: KernelInitializer::default(),
            kernel_regularizer: None,
            norm_epsilon: 0.001,
            norm_momentum: 0.99,
            strides: 1,
            use_sync_bn: false,
        }
    }
}

/// A convolution in an inner block.
struct ConvStage {
    kernel_size: usize,
    out_channels: usize,
    strides: usize,
}

impl InnerOptions {
    /// Build an inner block with the given convolutions. Every convolution
    /// except the first is preceded by batch normalization and the
    /// activation.
    fn build(
        &self,
        vb: VarBuilder,
        input_shape: &[usize],
        block: &'static str,
        stages: &[ConvStage],
    ) -> Result<InnerBlock, InnerBlockError> {
        let shape = FeatureMapShape::new(block, input_shape, DataFormat::current())
            .context(InputShapeSnafu)?;
        let norm = NormOptions {
            epsilon: self.norm_epsilon,
            momentum: self.norm_momentum,
            synchronized: self.use_sync_bn,
            trainable: true,
        };

        let pre_norm = if self.batch_norm_first {
            Some(
                norm.build(vb.push_prefix("batch_norm_0"), shape.channels())
                    .context(BuildNormSnafu)?,
            )
        } else {
            None
        };

        let mut convs = Vec::with_capacity(stages.len());
        let mut norms = Vec::with_capacity(stages.len().saturating_sub(1));
        let mut in_channels = shape.channels();
        for (idx, stage) in stages.iter().enumerate() {
            if idx > 0 {
                norms.push(
                    norm.build(vb.push_prefix(format!("batch_norm_{idx}")), in_channels)
                        .context(BuildNormSnafu)?,
                );
            }
            convs.push(
                Conv2dConfig::default()
                    .in_channels(in_channels)
                    .kernel_initializer(self.kernel_initializer)
                    .kernel_regularizer(self.kernel_regularizer)
                    .kernel_size(stage.kernel_size)
                    .out_channels(stage.out_channels)
                    .strides(stage.strides)
                    .build(vb.push_prefix(format!("conv2d_{}", idx + 1)))
                    .context(BuildConvSnafu)?,
            );
            in_channels = stage.out_channels;
        }

        Ok(InnerBlock {
            activation: self.activation,
            convs,
            norms,
            pre_norm,
            shape,
            strides: self.strides,
        })
    }
}

/// Configuration of the basic residual function of a reversible layer.
///
/// `[bn → act] → conv3x3(stride) → bn → act → conv3x3` with `filters`
/// output channels.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResidualInnerConfig {
    options: InnerOptions,
}

/// Configuration of the bottleneck residual function of a reversible layer.
///
/// `[bn → act] → conv1x1(stride) → bn → act → conv3x3 → bn → act →
/// conv1x1` with `4 * filters` output channels.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BottleneckResidualInnerConfig {
    options: InnerOptions,
}

/// Builder methods that are shared by the inner block configurations.
macro_rules! inner_config_builders {
    ($config:ty) => {
        impl $config {
            /// Activation function.
            ///
            /// Default: `Activation::Relu`
            pub fn activation(mut self, activation: Activation) -> Self {
                self.options.activation = activation;
                self
            }

            /// Apply batch normalization and the activation before the
            /// first convolution.
            ///
            /// Default: `true`
            pub fn batch_norm_first(mut self, batch_norm_first: bool) -> Self {
                self.options.batch_norm_first = batch_norm_first;
                self
            }

            /// Number of filters.
            ///
            /// Default: `16`
            pub fn filters(mut self, filters: usize) -> Self {
                self.options.filters = filters;
                self
            }

            /// Kernel initializer of the convolutions.
            ///
            /// Default: `KernelInitializer::VarianceScaling`
            pub fn kernel_initializer(mut self, kernel_initializer: KernelInitializer) -> Self {
                self.options.kernel_initializer = kernel_initializer;
                self
            }

            /// Kernel regularizer of the convolutions.
            ///
            /// Default: `None`
            pub fn kernel_regularizer(mut self, kernel_regularizer: Option<Regularizer>) -> Self {
                self.options.kernel_regularizer = kernel_regularizer;
                self
            }

            /// Epsilon of the batch normalization layers.
            ///
            /// Default: `0.001`
            pub fn norm_epsilon(mut self, norm_epsilon: f64) -> Self {
                self.options.norm_epsilon = norm_epsilon;
                self
            }

            /// Momentum of the batch normalization moving statistics.
            ///
            /// Default: `0.99`
            pub fn norm_momentum(mut self, norm_momentum: f64) -> Self {
                self.options.norm_momentum = norm_momentum;
                self
            }

            /// Stride of the first convolution.
            ///
            /// Default: `1`
            pub fn strides(mut self, strides: usize) -> Self {
                self.options.strides = strides;
                self
            }

            /// Use synchronized batch normalization.
            ///
            /// Default: `false`
            pub fn use_sync_bn(mut self, use_sync_bn: bool) -> Self {
                self.options.use_sync_bn = use_sync_bn;
                self
            }
        }
    };
}

inner_config_builders!(ResidualInnerConfig);
inner_config_builders!(BottleneckResidualInnerConfig);

impl ResidualInnerConfig {
    /// Number of output channels.
    pub fn out_channels(&self) -> usize {
        self.options.filters
    }
}

impl BottleneckResidualInnerConfig {
    /// Number of output channels.
    pub fn out_channels(&self) -> usize {
        4 * self.options.filters
    }
}

impl BlockConfig for ResidualInnerConfig {}

impl BlockConfig for BottleneckResidualInnerConfig {}

impl BuildBlock for ResidualInnerConfig {
    type Block = InnerBlock;

    fn build(&self, vb: VarBuilder, input_shape: &[usize]) -> Result<InnerBlock, BoxedError> {
        let filters = self.options.filters;
        Ok(self.options.build(
            vb,
            input_shape,
            "ResidualInner",
            &[
                ConvStage {
                    kernel_size: 3,
                    out_channels: filters,
                    strides: self.options.strides,
                },
                ConvStage {
                    kernel_size: 3,
                    out_channels: filters,
                    strides: 1,
                },
            ],
        )?)
    }
}

impl BuildBlock for BottleneckResidualInnerConfig {
    type Block = InnerBlock;

    fn build(&self, vb: VarBuilder, input_shape: &[usize]) -> Result<InnerBlock, BoxedError> {
        let filters = self.options.filters;
        Ok(self.options.build(
            vb,
            input_shape,
            "BottleneckResidualInner",
            &[
                ConvStage {
                    kernel_size: 1,
                    out_channels: filters,
                    strides: self.options.strides,
                },
                ConvStage {
                    kernel_size: 3,
                    out_channels: filters,
                    strides: 1,
                },
                ConvStage {
                    kernel_size: 1,
                    out_channels: 4 * filters,
                    strides: 1,
                },
            ],
        )?)
    }
}

/// Configuration of a residual function of a reversible layer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "class_name", rename_all = "snake_case")]
pub enum InnerBlockConfig {
    Residual(ResidualInnerConfig),
    BottleneckResidual(BottleneckResidualInnerConfig),
}

impl InnerBlockConfig {
    /// Number of output channels.
    pub fn out_channels(&self) -> usize {
        match self {
            InnerBlockConfig::Residual(config) => config.out_channels(),
            InnerBlockConfig::BottleneckResidual(config) => config.out_channels(),
        }
    }

    /// Stride of the first convolution.
    pub fn strides(&self) -> usize {
        match self {
            InnerBlockConfig::Residual(config) => config.options.strides,
            InnerBlockConfig::BottleneckResidual(config) => config.options.strides,
        }
    }
}

impl Default for InnerBlockConfig {
    fn default() -> Self {
        InnerBlockConfig::Residual(ResidualInnerConfig::default())
    }
}

impl From<ResidualInnerConfig> for InnerBlockConfig {
    fn from(config: ResidualInnerConfig) -> Self {
        InnerBlockConfig::Residual(config)
    }
}

impl From<BottleneckResidualInnerConfig> for InnerBlockConfig {
    fn from(config: BottleneckResidualInnerConfig) -> Self {
        InnerBlockConfig::BottleneckResidual(config)
    }
}

impl BuildBlock for InnerBlockConfig {
    type Block = InnerBlock;

    fn build(&self, vb: VarBuilder, input_shape: &[usize]) -> Result<InnerBlock, BoxedError> {
        match self {
            InnerBlockConfig::Residual(config) => config.build(vb, input_shape),
            InnerBlockConfig::BottleneckResidual(config) => config.build(vb, input_shape),
        }
    }
}

/// Inner block errors.
#[derive(Debug, Snafu)]
pub enum InnerBlockError {
    #[snafu(display("Cannot build convolution"))]
    BuildConv { source: Conv2dError },

    #[snafu(display("Cannot build batch normalization"))]
    BuildNorm { source: BatchNormError },

    #[snafu(display("Cannot apply inner block"))]
    Forward { source: candle_core::Error },

    #[snafu(display("Invalid inner block input"))]
    InputShape { source: BlockShapeError },

    #[snafu(display("Cannot compute regularization loss"))]
    RegularizationLoss { source: candle_core::Error },
}

/// Residual function of a reversible layer (_Gomez et al., 2017_).
///
/// A sequence of bias-free convolutions. Each convolution after the first
/// is preceded by batch normalization and the activation. Optionally, the
/// input is also normalized and activated.
///
/// * _Gomez et al., 2017_: https://arxiv.org/abs/1707.04585
pub struct InnerBlock {
    activation: Activation,
    convs: Vec<Conv2d>,
    norms: Vec<BatchNorm>,
    pre_norm: Option<BatchNorm>,
    shape: FeatureMapShape,
    strides: usize,
}

impl InnerBlock {
    fn forward_channels_first(&self, xs: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        let mut hidden = match &self.pre_norm {
            Some(pre_norm) => self.activation.forward(&pre_norm.forward_t(xs, train)?)?,
            None => xs.clone(),
        };

        for (idx, conv) in self.convs.iter().enumerate() {
            if idx > 0 {
                let norm = &self.norms[idx - 1];
                hidden = self.activation.forward(&norm.forward_t(&hidden, train)?)?;
            }
            hidden = conv.forward(&hidden)?;
        }

        Ok(hidden)
    }
}

impl Block for InnerBlock {
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
        if let Some(pre_norm) = &self.pre_norm {
            variables.extend(pre_norm.trainable_variables());
        }
        for (idx, conv) in self.convs.iter().enumerate() {
            if idx > 0 {
                variables.extend(self.norms[idx - 1].trainable_variables());
            }
            variables.extend(conv.trainable_variables());
        }
        variables
    }

    fn non_trainable_variables(&self) -> Vec<Var> {
        self.pre_norm
            .iter()
            .chain(&self.norms)
            .flat_map(BatchNorm::non_trainable_variables)
            .collect()
    }

    fn regularization_loss(&self) -> Result<Option<Tensor>, BoxedError> {
        let mut penalties = Vec::new();
        for conv in &self.convs {
            penalties.extend(conv.penalties().context(RegularizationLossSnafu)?);
        }
        Ok(sum_penalties(penalties).context(RegularizationLossSnafu)?)
    }
}

impl ReversibleFunction for InnerBlock {
    fn strides(&self) -> usize {
        self.strides
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device, Tensor};
    use candle_nn::{VarBuilder, VarMap};
    use rstest::rstest;
    use serde_json::json;

    use super::{BottleneckResidualInnerConfig, InnerBlockConfig, ResidualInnerConfig};
    use crate::blocks::reversible::ReversibleFunction;
    use crate::blocks::{Block, BuildBlock};
    use crate::util::tests::PseudoRandom;

    #[rstest]
    #[case(ResidualInnerConfig::default().filters(8).into(), 1, &[2, 6, 6, 8], 6)]
    #[case(ResidualInnerConfig::default().filters(8).strides(2).into(), 2, &[2, 3, 3, 8], 6)]
    #[case(
        ResidualInnerConfig::default().filters(8).batch_norm_first(false).into(),
        1,
        &[2, 6, 6, 8],
        4
    )]
    #[case(BottleneckResidualInnerConfig::default().filters(4).into(), 1, &[2, 6, 6, 16], 9)]
    #[case(
        BottleneckResidualInnerConfig::default().filters(4).strides(2).into(),
        2,
        &[2, 3, 3, 16],
        9
    )]
    fn inner_block_has_correct_output(
        #[case] config: InnerBlockConfig,
        #[case] strides: usize,
        #[case] expected: &[usize],
        #[case] n_trainable: usize,
    ) {
        let device = Device::Cpu;
        let vb = VarBuilder::from_varmap(&VarMap::new(), DType::F32, &device);
        let block = config.build(vb, &[2, 6, 6, 4]).unwrap();
        assert_eq!(block.strides(), strides);
        assert_eq!(config.out_channels(), expected[3]);

        let xs = Tensor::pseudo_random((2, 6, 6, 4), 12, DType::F32, &device).unwrap();
        assert_eq!(block.forward_t(&xs, true).unwrap().dims(), expected);
        assert_eq!(block.trainable_variables().len(), n_trainable);
    }

    #[test]
    fn inner_block_rejects_wrong_channels() {
        let device = Device::Cpu;
        let vb = VarBuilder::from_varmap(&VarMap::new(), DType::F32, &device);
        let block = ResidualInnerConfig::default()
            .filters(4)
            .build(vb, &[1, 4, 4, 4])
            .unwrap();
        let xs = Tensor::zeros((1, 4, 4, 6), DType::F32, &device).unwrap();
        assert!(block.forward_t(&xs, false).is_err());
    }

    #[test]
    fn inner_block_config_is_tagged() {
        let config: InnerBlockConfig = BottleneckResidualInnerConfig::default()
            .filters(32)
            .strides(2)
            .into();
        let exported = serde_json::to_value(&config).unwrap();
        assert_eq!(exported["class_name"], "bottleneck_residual");
        assert_eq!(exported["filters"], 32);
        assert_eq!(exported["batch_norm_first"], true);
        assert_eq!(
            serde_json::from_value::<InnerBlockConfig>(exported).unwrap(),
            config
        );

        let config: InnerBlockConfig =
            serde_json::from_value(json!({"class_name": "residual", "filters": 8})).unwrap();
        assert_eq!(config, ResidualInnerConfig::default().filters(8).into());
    }
}
