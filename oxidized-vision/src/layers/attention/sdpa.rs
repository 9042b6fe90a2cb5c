use candle_core::{ModuleT, Tensor, D};
use candle_nn::ops::softmax;
use snafu::{ResultExt, Snafu};

use crate::layers::attention::{AttentionMask, AttentionMaskError};

/// Errors for scaled dot-product attention.
#[derive(Debug, Snafu)]
pub enum SDPAError {
    #[snafu(display("Cannot apply attention mask"))]
    AttentionMask { source: AttentionMaskError },

    #[snafu(display("Cannot calculate attention scores"))]
    AttentionScores { source: candle_core::Error },

    #[snafu(display("Cannot weigh representations using attention weights"))]
    AttentionWeight { source: candle_core::Error },

    #[snafu(display("Cannot apply dropout"))]
    Dropout { source: candle_core::Error },

    #[snafu(display("Cannot apply softmax temperature"))]
    Temperature { source: candle_core::Error },
}

/// Scaled dot-product attention.
///
/// See [Vaswani et al., 2017](https://arxiv.org/abs/1706.03762).
pub struct SDPA {
    dropout: Box<dyn ModuleT>,
}

impl SDPA {
    /// Construct scaled dot-product attention.
    ///
    /// * `dropout` - Dropout applied to the attention weights.
    pub fn new(dropout: Box<dyn ModuleT>) -> Self {
        SDPA { dropout }
    }

    /// Apply attention to the given key, query and value.
    ///
    /// * `query` - Query tensor.
    ///   *Shape:* `(batch_size, heads, query_len, width)`
    /// * `key` - Key tensor.
    ///   *Shape:* `(batch_size, heads, key_len, width)`
    /// * `value` - Value tensor.
    ///   *Shape:* `(batch_size, heads, key_len, width)`
    /// * `attention_mask` - Attention mask.
    /// * `train` - Whether the model is trained.
    ///
    /// Returns: attention values and the attention weights before dropout.
    /// *Shapes:* `(batch_size, heads, query_len, width)`,
    /// `(batch_size, heads, query_len, key_len)`
    pub fn forward(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        attention_mask: Option<&AttentionMask>,
        train: bool,
    ) -> Result<(Tensor, Tensor), SDPAError> {
        let query = query.contiguous().context(AttentionScoresSnafu)?;
        let mut attn_scores = key
            .contiguous()
            .and_then(|key| key.transpose(3, 2))
            .and_then(|key| query.broadcast_matmul(&key))
            .context(AttentionScoresSnafu)?;

        let head_width = key.dim(3).context(TemperatureSnafu)?;
        let temperature = (head_width as f64).sqrt();
        attn_scores = (attn_scores / temperature).context(TemperatureSnafu)?;

        if let Some(attention_mask) = attention_mask {
            attn_scores = attention_mask
                .apply_logit_mask(&attn_scores)
                .context(AttentionMaskSnafu)?;
        }

        let attn_weights = softmax(&attn_scores, D::Minus1).context(AttentionWeightSnafu)?;
        let attn_weights_dropout = self
            .dropout
            .forward_t(&attn_weights, train)
            .context(DropoutSnafu)?;

        let attn_values = value
            .contiguous()
            .and_then(|value| attn_weights_dropout.broadcast_matmul(&value))
            .context(AttentionWeightSnafu)?;

        Ok((attn_values, attn_weights))
    }
}
