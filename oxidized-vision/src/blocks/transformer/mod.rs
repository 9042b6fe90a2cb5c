//! Transformer encoder blocks with stochastic depth and layer scale.

use candle_core::{ModuleT, Tensor};
use snafu::{ensure, ResultExt, Snafu};

use crate::error::BoxedError;
use crate::layers::attention::{AttentionMask, AttentionMaskError};
use crate::layers::identity::Identity;

mod encoder;
pub use encoder::{TransformerEncoderBlock, TransformerEncoderBlockConfig};

mod scaffold;
pub use scaffold::{TransformerScaffold, TransformerScaffoldConfig};

mod sublayers;
pub use sublayers::{
    AttentionFeedForward, AttentionFeedForwardConfig, BuildTransformerSublayers,
    TransformerSublayers,
};

/// Errors for transformer blocks.
#[derive(Debug, Snafu)]
pub enum TransformerBlockError {
    #[snafu(display("Cannot apply attention"))]
    Attention { source: BoxedError },

    #[snafu(display("Cannot apply attention output dropout"))]
    AttentionDropout { source: candle_core::Error },

    #[snafu(display("Cannot build layer"))]
    BuildLayer { source: BoxedError },

    #[snafu(display("Cannot build sublayers"))]
    BuildSublayers { source: BoxedError },

    #[snafu(display("Cannot apply feed-forward layer"))]
    FeedForward { source: BoxedError },

    #[snafu(display(
        "The residual connection of the feed-forward layer must be applied by the block when norm_first is set"
    ))]
    FeedForwardResidual,

    #[snafu(display("Cannot narrow attention mask to the output range"))]
    NarrowMask { source: AttentionMaskError },

    #[snafu(display("Cannot apply layer normalization"))]
    Norm { source: candle_core::Error },

    #[snafu(display("Cannot narrow input to the output range"))]
    OutputRange { source: candle_core::Error },

    #[snafu(display("Cannot apply residual connection"))]
    Residual { source: candle_core::Error },

    #[snafu(display("{block} expects inputs of shape (batch_size, seq_len, {width}), got {shape:?}"))]
    Shape {
        block: &'static str,
        width: usize,
        shape: Vec<usize>,
    },
}

/// Errors for transformer block inputs.
#[derive(Debug, Snafu)]
pub enum TransformerInputsError {
    #[snafu(display("Cannot create attention mask"))]
    Mask { source: AttentionMaskError },

    #[snafu(display("Unexpected inputs to {block} with length {len}"))]
    UnexpectedLength { block: &'static str, len: usize },
}

/// Inputs of a transformer block.
#[derive(Clone, Debug)]
pub struct TransformerInputs {
    /// Input representations.
    ///
    /// *Shape:* `(batch_size, seq_len, width)`
    pub input: Tensor,

    /// Representations to attend to. The block attends to the input
    /// itself when absent.
    ///
    /// *Shape:* `(batch_size, key_len, width)`
    pub key_value: Option<Tensor>,

    /// Attention mask.
    pub attention_mask: Option<AttentionMask>,
}

impl TransformerInputs {
    /// Inputs for self-attention without masking.
    pub fn new(input: Tensor) -> Self {
        TransformerInputs {
            input,
            key_value: None,
            attention_mask: None,
        }
    }

    /// Attention mask.
    pub fn attention_mask(mut self, attention_mask: AttentionMask) -> Self {
        self.attention_mask = Some(attention_mask);
        self
    }

    /// Representations to attend to.
    pub fn key_value(mut self, key_value: Tensor) -> Self {
        self.key_value = Some(key_value);
        self
    }

    /// Inputs from a list of tensors.
    ///
    /// The list is either `[input, attention_mask]` or
    /// `[input, key_value, attention_mask]`. A single input tensor is
    /// converted with [`From<Tensor>`].
    ///
    /// * `block` - Name of the block that receives the inputs, used in
    ///   errors.
    /// * `tensors` - Input tensors.
    pub fn from_tensors(
        block: &'static str,
        tensors: Vec<Tensor>,
    ) -> Result<Self, TransformerInputsError> {
        let mask = |mask: &Tensor| AttentionMask::new(mask.clone()).context(MaskSnafu);
        match tensors.as_slice() {
            [input, attention_mask] => {
                Ok(TransformerInputs::new(input.clone()).attention_mask(mask(attention_mask)?))
            }
            [input, key_value, attention_mask] => Ok(TransformerInputs::new(input.clone())
                .key_value(key_value.clone())
                .attention_mask(mask(attention_mask)?)),
            _ => UnexpectedLengthSnafu {
                block,
                len: tensors.len(),
            }
            .fail(),
        }
    }
}

impl From<Tensor> for TransformerInputs {
    fn from(input: Tensor) -> Self {
        TransformerInputs::new(input)
    }
}

/// Output of a transformer block.
#[derive(Clone, Debug)]
pub struct TransformerBlockOutput {
    /// Block output.
    ///
    /// *Shape:* `(batch_size, seq_len, width)`
    pub output: Tensor,

    /// Attention weights, when the block is configured to return them.
    ///
    /// *Shape:* `(batch_size, n_heads, seq_len, key_len)`
    pub attention_scores: Option<Tensor>,
}

/// Residual connection around a sublayer.
///
/// The sublayer output is scaled by the layer scale. When a residual is
/// given, stochastic depth is applied to the scaled output before it is
/// added to the residual.
pub struct ResidualConnection {
    layer_scale: Box<dyn ModuleT>,
    stochastic_depth: Box<dyn ModuleT>,
}

impl ResidualConnection {
    /// Construct a residual connection.
    ///
    /// * `layer_scale` - Scaling of the sublayer output.
    /// * `stochastic_depth` - Stochastic depth applied to the scaled
    ///   sublayer output.
    pub fn new(layer_scale: Box<dyn ModuleT>, stochastic_depth: Box<dyn ModuleT>) -> Self {
        ResidualConnection {
            layer_scale,
            stochastic_depth,
        }
    }

    /// Combine the residual and the sublayer output.
    ///
    /// * `residual` - Residual to add the sublayer output to.
    /// * `sublayer_output` - Sublayer output.
    /// * `train` - Whether the block is trained.
    pub fn forward_t(
        &self,
        residual: Option<&Tensor>,
        sublayer_output: &Tensor,
        train: bool,
    ) -> candle_core::Result<Tensor> {
        let scaled = self.layer_scale.forward_t(sublayer_output, train)?;
        match residual {
            Some(residual) => residual + self.stochastic_depth.forward_t(&scaled, train)?,
            None => Ok(scaled),
        }
    }

    /// Apply layer scale and stochastic depth to a sublayer output whose
    /// residual connection is applied by the sublayer itself.
    ///
    /// * `sublayer_output` - Sublayer output.
    /// * `train` - Whether the block is trained.
    pub fn branch_t(&self, sublayer_output: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        let scaled = self.layer_scale.forward_t(sublayer_output, train)?;
        self.stochastic_depth.forward_t(&scaled, train)
    }
}

impl Default for ResidualConnection {
    fn default() -> Self {
        ResidualConnection::new(Box::new(Identity), Box::new(Identity))
    }
}

/// Check that the input has the width that the block was built for.
fn check_input(
    block: &'static str,
    width: usize,
    input: &Tensor,
) -> Result<(), TransformerBlockError> {
    let shape = input.dims();
    ensure!(
        shape.len() == 3 && shape[2] == width,
        ShapeSnafu {
            block,
            width,
            shape: shape.to_vec()
        }
    );
    Ok(())
}

/// Get the width from the shape that a block is built for.
fn input_width(block: &'static str, input_shape: &[usize]) -> Result<usize, TransformerBlockError> {
    match input_shape {
        [_, _, width] => Ok(*width),
        _ => ShapeSnafu {
            block,
            width: input_shape.last().copied().unwrap_or_default(),
            shape: input_shape.to_vec(),
        }
        .fail(),
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device, Tensor};
    use candle_nn::VarBuilder;

    use super::{ResidualConnection, TransformerInputs};
    use crate::layers::build_module::BuildModule;
    use crate::layers::identity::Identity;
    use crate::layers::stochastic_depth::StochasticDepthConfig;
    use crate::util::tests::{assert_tensor_eq, PseudoRandom};

    #[test]
    fn inputs_from_tensors() {
        let device = Device::Cpu;
        let input = Tensor::zeros((2, 3, 4), DType::F32, &device).unwrap();
        let mask = Tensor::ones((2, 3, 3), DType::F32, &device).unwrap();

        let inputs = TransformerInputs::from(input.clone());
        assert!(inputs.key_value.is_none() && inputs.attention_mask.is_none());

        let inputs =
            TransformerInputs::from_tensors("TestBlock", vec![input.clone(), mask.clone()])
                .unwrap();
        assert!(inputs.key_value.is_none() && inputs.attention_mask.is_some());

        let inputs = TransformerInputs::from_tensors(
            "TestBlock",
            vec![input.clone(), input.clone(), mask.clone()],
        )
        .unwrap();
        assert!(inputs.key_value.is_some() && inputs.attention_mask.is_some());

        let err = TransformerInputs::from_tensors("TestBlock", vec![input.clone(); 4])
            .err()
            .unwrap();
        assert_eq!(err.to_string(), "Unexpected inputs to TestBlock with length 4");
        let err = TransformerInputs::from_tensors("TestBlock", vec![input.clone()])
            .err()
            .unwrap();
        assert_eq!(err.to_string(), "Unexpected inputs to TestBlock with length 1");
        assert!(TransformerInputs::from_tensors("TestBlock", vec![]).is_err());
    }

    #[test]
    fn residual_connection_skips_dropped_branch_at_inference() {
        let device = Device::Cpu;
        let residual_connection = ResidualConnection::new(
            Box::new(Identity),
            StochasticDepthConfig::default()
                .drop_rate(Some(0.5))
                .build(VarBuilder::zeros(DType::F32, &device))
                .unwrap(),
        );
        let residual = Tensor::pseudo_random((2, 3, 4), 1, DType::F32, &device).unwrap();
        let branch = Tensor::pseudo_random((2, 3, 4), 2, DType::F32, &device).unwrap();

        let ys = residual_connection
            .forward_t(Some(&residual), &branch, false)
            .unwrap();
        assert_tensor_eq!(ys, (&residual + &branch).unwrap(), epsilon = 1e-6f32);

        let ys = residual_connection.forward_t(None, &branch, true).unwrap();
        assert_tensor_eq!(ys, &branch, epsilon = 0f32);
    }
}
