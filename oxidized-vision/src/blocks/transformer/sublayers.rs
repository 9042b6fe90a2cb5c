use std::fmt::Debug;

use candle_core::{ModuleT, Tensor};
use candle_nn::VarBuilder;
use serde::{Deserialize, Serialize};
use snafu::{ensure, ResultExt, Snafu};

use crate::error::BoxedError;
use crate::layers::activation::Activation;
use crate::layers::attention::{
    AttentionMask, AttentionOutput, MultiHeadAttention, MultiHeadAttentionConfig,
    MultiHeadAttentionError,
};
use crate::layers::build_module::BuildModule;
use crate::layers::dropout::DropoutConfig;
use crate::layers::feedforward::PointwiseFeedForward;

/// Sublayers of a transformer block.
///
/// A transformer block wires the sublayers together with normalization
/// and residual connections.
pub trait TransformerSublayers {
    /// Attend to the key/value representations.
    ///
    /// * `query` - Query representations.
    ///   *Shape:* `(batch_size, query_len, width)`
    /// * `key_value` - Key/value representations.
    ///   *Shape:* `(batch_size, key_len, width)`
    /// * `attention_mask` - Attention mask.
    /// * `train` - Whether the block is trained.
    fn attend(
        &self,
        query: &Tensor,
        key_value: &Tensor,
        attention_mask: Option<&AttentionMask>,
        train: bool,
    ) -> Result<AttentionOutput, BoxedError>;

    /// Apply the feed-forward sublayer.
    ///
    /// * `xs` - Representations.
    ///   *Shape:* `(batch_size, seq_len, width)`
    /// * `train` - Whether the block is trained.
    fn feed_forward(&self, xs: &Tensor, train: bool) -> Result<Tensor, BoxedError>;
}

/// Trait for building transformer sublayers.
pub trait BuildTransformerSublayers: Debug {
    /// Build the sublayers.
    ///
    /// * `vb` - Variable builder for the sublayer parameters.
    /// * `width` - Width of the block representations.
    /// * `max_attention_inference_parallelism` - Maximum number of batch
    ///   elements to attend to in parallel during inference.
    fn build(
        &self,
        vb: VarBuilder,
        width: usize,
        max_attention_inference_parallelism: Option<usize>,
    ) -> Result<Box<dyn TransformerSublayers>, BoxedError>;
}

/// Configuration of multi-head attention and point-wise feed-forward
/// sublayers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttentionFeedForwardConfig {
    attention_dropout: f32,
    inner_activation: Activation,
    inner_dim: usize,
    inner_dropout: f32,
    num_attention_heads: usize,
    output_dropout: f32,
    use_bias: bool,
}

impl AttentionFeedForwardConfig {
    /// Dropout probability of the attention weights.
    ///
    /// Default: `0.0`
    pub fn attention_dropout(mut self, attention_dropout: f32) -> Self {
        self.attention_dropout = attention_dropout;
        self
    }

    /// Activation of the feed-forward intermediate layer.
    ///
    /// Default: `Activation::Gelu`
    pub fn inner_activation(mut self, inner_activation: Activation) -> Self {
        self.inner_activation = inner_activation;
        self
    }

    /// Width of the feed-forward intermediate layer.
    ///
    /// Default: `3072`
    pub fn inner_dim(mut self, inner_dim: usize) -> Self {
        self.inner_dim = inner_dim;
        self
    }

    /// Dropout probability of the feed-forward intermediate activations.
    ///
    /// Default: `0.0`
    pub fn inner_dropout(mut self, inner_dropout: f32) -> Self {
        self.inner_dropout = inner_dropout;
        self
    }

    /// Number of attention heads.
    ///
    /// Default: `12`
    pub fn num_attention_heads(mut self, num_attention_heads: usize) -> Self {
        self.num_attention_heads = num_attention_heads;
        self
    }

    /// Dropout probability of the feed-forward output.
    ///
    /// Default: `0.0`
    pub fn output_dropout(mut self, output_dropout: f32) -> Self {
        self.output_dropout = output_dropout;
        self
    }

    /// Use biases in the attention projections.
    ///
    /// Default: `true`
    pub fn use_bias(mut self, use_bias: bool) -> Self {
        self.use_bias = use_bias;
        self
    }

    /// Build the sublayers.
    pub fn build_sublayers(
        &self,
        vb: VarBuilder,
        width: usize,
        max_attention_inference_parallelism: Option<usize>,
    ) -> Result<AttentionFeedForward, AttentionFeedForwardError> {
        let n_heads = self.num_attention_heads;
        ensure!(
            n_heads > 0 && width % n_heads == 0,
            HeadsSnafu { n_heads, width }
        );

        let attention = MultiHeadAttentionConfig::default()
            .dropout_prob(self.attention_dropout)
            .head_width(width / n_heads)
            .max_inference_parallelism(max_attention_inference_parallelism)
            .n_heads(n_heads)
            .use_bias(self.use_bias)
            .width(width)
            .build(vb.push_prefix("attention"), width)
            .context(BuildAttentionSnafu)?;

        let dropout = |p| {
            DropoutConfig::default()
                .p(p)
                .build(vb.clone())
                .context(BuildDropoutSnafu)
        };
        let feed_forward = PointwiseFeedForward::new(
            vb.push_prefix("ffn"),
            self.inner_activation,
            width,
            dropout(self.inner_dropout)?,
            self.inner_dim,
            dropout(self.output_dropout)?,
        )
        .context(BuildFeedForwardSnafu)?;

        Ok(AttentionFeedForward {
            attention,
            feed_forward,
        })
    }
}

impl Default for AttentionFeedForwardConfig {
    fn default() -> Self {
        Self {
            attention_dropout: 0.0,
            inner_activation: Activation::Gelu,
            inner_dim: 3072,
            inner_dropout: 0.0,
            num_attention_heads: 12,
            output_dropout: 0.0,
            use_bias: true,
        }
    }
}

impl BuildTransformerSublayers for AttentionFeedForwardConfig {
    fn build(
        &self,
        vb: VarBuilder,
        width: usize,
        max_attention_inference_parallelism: Option<usize>,
    ) -> Result<Box<dyn TransformerSublayers>, BoxedError> {
        Ok(Box::new(self.build_sublayers(
            vb,
            width,
            max_attention_inference_parallelism,
        )?))
    }
}

/// Errors for attention and feed-forward sublayers.
#[derive(Debug, Snafu)]
pub enum AttentionFeedForwardError {
    #[snafu(display("Cannot apply attention"))]
    Attend { source: MultiHeadAttentionError },

    #[snafu(display("Cannot build attention layer"))]
    BuildAttention { source: MultiHeadAttentionError },

    #[snafu(display("Cannot build dropout"))]
    BuildDropout { source: BoxedError },

    #[snafu(display("Cannot build feed-forward layer"))]
    BuildFeedForward { source: candle_core::Error },

    #[snafu(display("Cannot apply feed-forward layer"))]
    FeedForward { source: candle_core::Error },

    #[snafu(display("Width {width} is not divisible by the number of attention heads ({n_heads})"))]
    Heads { n_heads: usize, width: usize },
}

/// Multi-head attention and point-wise feed-forward sublayers.
pub struct AttentionFeedForward {
    attention: MultiHeadAttention,
    feed_forward: PointwiseFeedForward,
}

impl TransformerSublayers for AttentionFeedForward {
    fn attend(
        &self,
        query: &Tensor,
        key_value: &Tensor,
        attention_mask: Option<&AttentionMask>,
        train: bool,
    ) -> Result<AttentionOutput, BoxedError> {
        Ok(self
            .attention
            .forward_t(query, key_value, attention_mask, train)
            .context(AttendSnafu)?)
    }

    fn feed_forward(&self, xs: &Tensor, train: bool) -> Result<Tensor, BoxedError> {
        Ok(self
            .feed_forward
            .forward_t(xs, train)
            .context(FeedForwardSnafu)?)
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device, Tensor};
    use candle_nn::{VarBuilder, VarMap};

    use super::{AttentionFeedForwardConfig, TransformerSublayers};

    #[test]
    fn sublayers_keep_width() {
        let device = Device::Cpu;
        let vb = VarBuilder::from_varmap(&VarMap::new(), DType::F32, &device);
        let sublayers = AttentionFeedForwardConfig::default()
            .num_attention_heads(2)
            .inner_dim(16)
            .build_sublayers(vb, 8, None)
            .unwrap();

        let xs = Tensor::zeros((2, 5, 8), DType::F32, &device).unwrap();
        let attention = sublayers.attend(&xs, &xs, None, false).unwrap();
        assert_eq!(attention.output.dims(), &[2, 5, 8]);
        assert_eq!(attention.scores.dims(), &[2, 2, 5, 5]);
        assert_eq!(
            sublayers.feed_forward(&xs, false).unwrap().dims(),
            &[2, 5, 8]
        );
    }

    #[test]
    fn width_must_be_divisible_by_heads() {
        let device = Device::Cpu;
        let vb = VarBuilder::from_varmap(&VarMap::new(), DType::F32, &device);
        let err = AttentionFeedForwardConfig::default()
            .num_attention_heads(3)
            .build_sublayers(vb, 8, None)
            .err()
            .unwrap();
        assert_eq!(
            err.to_string(),
            "Width 8 is not divisible by the number of attention heads (3)"
        );
    }
}
