use std::fmt::Debug;

use candle_core::{Module, ModuleT, Tensor, Var};
use candle_nn::VarBuilder;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use snafu::{ensure, ResultExt, Snafu};

use crate::error::BoxedError;
use crate::layers::activation::Activation;
use crate::layers::batch_norm::{BatchNorm, BatchNormConfig, BatchNormError};
use crate::layers::conv::Conv2d;
use crate::layers::data_format::DataFormat;

pub mod bottleneck;
pub use bottleneck::{BottleneckBlock, BottleneckBlockConfig, BottleneckBlockError};

pub mod depthwise_separable;
pub use depthwise_separable::{
    DepthwiseSeparableConvBlock, DepthwiseSeparableConvBlockConfig,
    DepthwiseSeparableConvBlockError,
};

pub mod inverted_bottleneck;
pub use inverted_bottleneck::{
    InvertedBottleneckBlock, InvertedBottleneckBlockConfig, InvertedBottleneckBlockError,
    InvertedBottleneckOutput,
};

pub mod residual;
pub use residual::{ResidualBlock, ResidualBlockConfig, ResidualBlockError};

pub mod reversible;
pub use reversible::{
    CustomGradient, ReversibleGradients, ReversibleLayer, ReversibleLayerConfig,
    ReversibleLayerError, ReversibleResidual,
};

pub mod transformer;
pub use transformer::{
    TransformerBlockError, TransformerBlockOutput, TransformerEncoderBlock,
    TransformerEncoderBlockConfig, TransformerInputs, TransformerScaffold,
    TransformerScaffoldConfig,
};

pub mod tucker;
pub use tucker::{TuckerConvBlock, TuckerConvBlockConfig, TuckerConvBlockError};

/// Trait for blocks that transform feature maps.
pub trait Block {
    /// Apply the block.
    ///
    /// * `xs` - Feature map in the data format the block was built with.
    ///   *Shape:* `(batch_size, height, width, channels)` or
    ///   `(batch_size, channels, height, width)`
    /// * `train` - Whether to train the block. In training mode, batch
    ///   normalization uses batch statistics and updates its moving
    ///   statistics.
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor, BoxedError>;

    /// Trainable variables, in construction order.
    fn trainable_variables(&self) -> Vec<Tensor>;

    /// Non-trainable variables, in construction order.
    fn non_trainable_variables(&self) -> Vec<Var>;

    /// Sum of the weight penalties of regularized variables.
    ///
    /// Returns `None` when no variable is regularized.
    fn regularization_loss(&self) -> Result<Option<Tensor>, BoxedError>;
}

/// Trait for building blocks.
///
/// Configurations are plain data. Parameters are allocated once by
/// `build`, for the shape of the inputs that the block will be applied
/// to.
pub trait BuildBlock: Debug {
    /// Block type.
    type Block;

    /// Build a block.
    ///
    /// * `vb` - Variable builder for the block parameters.
    /// * `input_shape` - Shape of the block input.
    fn build(&self, vb: VarBuilder, input_shape: &[usize]) -> Result<Self::Block, BoxedError>;
}

/// Errors that occur when exporting or importing block configurations.
#[derive(Debug, Snafu)]
pub enum BlockConfigError {
    #[snafu(display("Cannot export block configuration"))]
    Export { source: serde_json::Error },

    #[snafu(display("Cannot import block configuration"))]
    Import { source: serde_json::Error },

    #[snafu(display("Block configuration was not exported as a key-value record"))]
    NotARecord,
}

/// Export and import of block configurations.
///
/// A configuration is exported as a key-value record with one entry per
/// option. Importing the record gives back an equal configuration.
pub trait BlockConfig: Serialize + DeserializeOwned {
    /// Export the configuration.
    fn to_config(&self) -> Result<Map<String, Value>, BlockConfigError> {
        match serde_json::to_value(self).context(ExportSnafu)? {
            Value::Object(config) => Ok(config),
            _ => NotARecordSnafu.fail(),
        }
    }

    /// Import a configuration.
    fn from_config(config: Map<String, Value>) -> Result<Self, BlockConfigError> {
        serde_json::from_value(Value::Object(config)).context(ImportSnafu)
    }
}

/// Errors for block input shapes.
#[derive(Debug, Snafu)]
pub enum BlockShapeError {
    #[snafu(display("{block} was built for {expected} input channels, got {actual}"))]
    Channels {
        block: &'static str,
        expected: usize,
        actual: usize,
    },

    #[snafu(display("{block} expects rank-{expected} inputs, got shape {shape:?}"))]
    Rank {
        block: &'static str,
        expected: usize,
        shape: Vec<usize>,
    },
}

/// Input feature map shape that a block was built for.
#[derive(Clone, Copy, Debug)]
pub struct FeatureMapShape {
    block: &'static str,
    channels: usize,
    data_format: DataFormat,
    height: usize,
    width: usize,
}

impl FeatureMapShape {
    /// Record the input shape of a block.
    ///
    /// * `block` - Name of the block, used in errors.
    /// * `input_shape` - Rank-4 input shape.
    /// * `data_format` - Layout of the input.
    pub fn new(
        block: &'static str,
        input_shape: &[usize],
        data_format: DataFormat,
    ) -> Result<Self, BlockShapeError> {
        ensure!(
            input_shape.len() == 4,
            RankSnafu {
                block,
                expected: 4usize,
                shape: input_shape.to_vec()
            }
        );
        let (height_axis, width_axis) = data_format.spatial_axes();
        Ok(FeatureMapShape {
            block,
            channels: input_shape[data_format.channel_axis()],
            data_format,
            height: input_shape[height_axis],
            width: input_shape[width_axis],
        })
    }

    /// Number of input channels.
    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Layout of the input.
    pub fn data_format(&self) -> DataFormat {
        self.data_format
    }

    /// Shape of the output of a branch with the given stride and number
    /// of output channels.
    pub fn output_shape(&self, batch_size: usize, channels: usize, strides: usize) -> Vec<usize> {
        let height = self.height.div_ceil(strides);
        let width = self.width.div_ceil(strides);
        match self.data_format {
            DataFormat::ChannelsFirst => vec![batch_size, channels, height, width],
            DataFormat::ChannelsLast => vec![batch_size, height, width, channels],
        }
    }

    /// Check that an input has the rank and channel count that the block
    /// was built for.
    pub fn check(&self, xs: &Tensor) -> Result<(), BlockShapeError> {
        ensure!(
            xs.rank() == 4,
            RankSnafu {
                block: self.block,
                expected: 4usize,
                shape: xs.dims().to_vec()
            }
        );
        let actual = xs.dims()[self.data_format.channel_axis()];
        ensure!(
            actual == self.channels,
            ChannelsSnafu {
                block: self.block,
                expected: self.channels,
                actual
            }
        );
        Ok(())
    }
}

/// Squeeze-and-excitation is used for ratios in `(0, 1]`.
pub(crate) fn use_squeeze_excitation(se_ratio: Option<f64>) -> bool {
    matches!(se_ratio, Some(se_ratio) if se_ratio > 0. && se_ratio <= 1.)
}

/// Batch normalization options shared by the convolution blocks.
#[derive(Clone, Copy, Debug)]
pub(crate) struct NormOptions {
    pub epsilon: f64,
    pub momentum: f64,
    pub synchronized: bool,
    pub trainable: bool,
}

impl NormOptions {
    /// Build a batch normalization layer for `size` channels.
    pub fn build(&self, vb: VarBuilder, size: usize) -> Result<BatchNorm, BatchNormError> {
        BatchNormConfig::default()
            .epsilon(self.epsilon)
            .momentum(self.momentum)
            .size(size)
            .synchronized(self.synchronized)
            .trainable(self.trainable)
            .build(vb)
    }
}

/// Convolution followed by batch normalization and an optional
/// activation, on channels-first feature maps.
pub(crate) struct ConvNorm {
    pub activation: Option<Activation>,
    pub conv: Conv2d,
    pub norm: BatchNorm,
}

impl ConvNorm {
    pub fn forward_t(&self, xs: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        let xs = self.norm.forward_t(&self.conv.forward(xs)?, train)?;
        match self.activation {
            Some(activation) => activation.forward(&xs),
            None => Ok(xs),
        }
    }

    pub fn trainable_variables(&self) -> Vec<Tensor> {
        let mut variables = self.conv.trainable_variables();
        variables.extend(self.norm.trainable_variables());
        variables
    }

    pub fn non_trainable_variables(&self) -> Vec<Var> {
        self.norm.non_trainable_variables()
    }

    pub fn penalties(&self) -> candle_core::Result<Vec<Tensor>> {
        self.conv.penalties()
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device, Tensor};

    use super::FeatureMapShape;
    use crate::layers::data_format::DataFormat;

    #[test]
    fn feature_map_shape_checks_rank_and_channels() {
        let shape = FeatureMapShape::new("TestBlock", &[2, 8, 8, 16], DataFormat::ChannelsLast)
            .unwrap();
        assert_eq!(shape.channels(), 16);
        assert_eq!(shape.output_shape(2, 32, 2), vec![2, 4, 4, 32]);

        let xs = Tensor::zeros((2, 8, 8, 16), DType::F32, &Device::Cpu).unwrap();
        assert!(shape.check(&xs).is_ok());
        let xs = Tensor::zeros((2, 8, 8, 8), DType::F32, &Device::Cpu).unwrap();
        let err = shape.check(&xs).unwrap_err();
        assert_eq!(
            err.to_string(),
            "TestBlock was built for 16 input channels, got 8"
        );
        let xs = Tensor::zeros((2, 8, 16), DType::F32, &Device::Cpu).unwrap();
        assert!(shape.check(&xs).is_err());

        assert!(FeatureMapShape::new("TestBlock", &[8, 16], DataFormat::ChannelsLast).is_err());
    }
}
