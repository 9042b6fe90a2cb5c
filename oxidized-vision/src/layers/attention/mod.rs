use candle_core::{Module, Tensor};
use candle_nn::{linear, linear_no_bias, Linear, VarBuilder};
use snafu::{ResultExt, Snafu};

use crate::error::BoxedError;
use crate::layers::build_module::BuildModule;
use crate::layers::dropout::DropoutConfig;

mod mask;
pub use mask::{AttentionMask, AttentionMaskError};

mod sdpa;
pub use sdpa::{SDPAError, SDPA};

/// Multi-head attention configuration.
#[derive(Clone, Debug)]
pub struct MultiHeadAttentionConfig {
    dropout_prob: f32,
    head_width: usize,
    max_inference_parallelism: Option<usize>,
    n_heads: usize,
    use_bias: bool,
    width: usize,
}

impl MultiHeadAttentionConfig {
    /// Dropout probability of the attention weights.
    ///
    /// Default: `0.0`
    pub fn dropout_prob(mut self, dropout_prob: f32) -> Self {
        self.dropout_prob = dropout_prob;
        self
    }

    /// Width of query and key heads.
    ///
    /// Default: `64`
    pub fn head_width(mut self, head_width: usize) -> Self {
        self.head_width = head_width;
        self
    }

    /// Maximum number of batch elements to attend in parallel during
    /// inference.
    ///
    /// Limiting parallelism bounds peak memory use. `None` attends the
    /// whole batch at once.
    ///
    /// Default: `None`
    pub fn max_inference_parallelism(mut self, max_inference_parallelism: Option<usize>) -> Self {
        self.max_inference_parallelism = max_inference_parallelism;
        self
    }

    /// Number of attention heads.
    ///
    /// Default: `12`
    pub fn n_heads(mut self, n_heads: usize) -> Self {
        self.n_heads = n_heads;
        self
    }

    /// Use biases in the query, key, value, and output projections.
    ///
    /// Default: `true`
    pub fn use_bias(mut self, use_bias: bool) -> Self {
        self.use_bias = use_bias;
        self
    }

    /// Width of the query and output representations.
    ///
    /// Default: `768`
    pub fn width(mut self, width: usize) -> Self {
        self.width = width;
        self
    }

    /// Build the attention layer.
    ///
    /// * `vb` - Variable builder for the projections.
    /// * `key_value_width` - Width of the key/value input representations.
    pub fn build(
        &self,
        vb: VarBuilder,
        key_value_width: usize,
    ) -> Result<MultiHeadAttention, MultiHeadAttentionError> {
        let linear_ctor = if self.use_bias {
            linear
        } else {
            linear_no_bias
        };
        let heads_width = self.n_heads * self.head_width;

        Ok(MultiHeadAttention {
            key: linear_ctor(key_value_width, heads_width, vb.push_prefix("key"))
                .context(ConstructionSnafu)?,
            max_inference_parallelism: self.max_inference_parallelism,
            n_heads: self.n_heads,
            output: linear_ctor(heads_width, self.width, vb.push_prefix("output"))
                .context(ConstructionSnafu)?,
            query: linear_ctor(self.width, heads_width, vb.push_prefix("query"))
                .context(ConstructionSnafu)?,
            sdpa: SDPA::new(
                DropoutConfig::default()
                    .p(self.dropout_prob)
                    .build(vb.clone())
                    .context(BuildDropoutSnafu)?,
            ),
            value: linear_ctor(key_value_width, heads_width, vb.push_prefix("value"))
                .context(ConstructionSnafu)?,
        })
    }
}

impl Default for MultiHeadAttentionConfig {
    fn default() -> Self {
        Self {
            dropout_prob: 0.0,
            head_width: 64,
            max_inference_parallelism: None,
            n_heads: 12,
            use_bias: true,
            width: 768,
        }
    }
}

/// Errors for multi-head attention.
#[derive(Debug, Snafu)]
pub enum MultiHeadAttentionError {
    #[snafu(display("Cannot build dropout module"))]
    BuildDropout { source: BoxedError },

    #[snafu(display("Cannot split attention mask into chunks"))]
    ChunkMask { source: AttentionMaskError },

    #[snafu(display("Cannot combine heads"))]
    CombineHeads { source: candle_core::Error },

    #[snafu(display("Cannot concatenate attention chunks"))]
    ConcatChunks { source: candle_core::Error },

    #[snafu(display("Cannot construct layer"))]
    Construction { source: candle_core::Error },

    #[snafu(display("Cannot apply output layer"))]
    Output { source: candle_core::Error },

    #[snafu(display("Cannot calculate key, query, or value"))]
    Qkv { source: candle_core::Error },

    #[snafu(display("Cannot apply the scaled dot product attention"))]
    ScaledDotProductAttention { source: SDPAError },

    #[snafu(display("Cannot split heads"))]
    SplitHeads { source: candle_core::Error },
}

/// Attention output.
pub struct AttentionOutput {
    /// Attention output representations.
    ///
    /// *Shape:* `(batch_size, query_len, width)`
    pub output: Tensor,

    /// Attention weights of every head.
    ///
    /// *Shape:* `(batch_size, n_heads, query_len, key_len)`
    pub scores: Tensor,
}

/// Multi-head attention layer.
///
/// See [Vaswani et al., 2017](https://arxiv.org/abs/1706.03762).
pub struct MultiHeadAttention {
    key: Linear,
    max_inference_parallelism: Option<usize>,
    n_heads: usize,
    output: Linear,
    query: Linear,
    sdpa: SDPA,
    value: Linear,
}

impl MultiHeadAttention {
    /// Attend to the key/value representations.
    ///
    /// * `query` - Query input.
    ///   *Shape:* `(batch_size, query_len, width)`
    /// * `key_value` - Key/value input.
    ///   *Shape:* `(batch_size, key_len, key_value_width)`
    /// * `attention_mask` - Attention mask.
    /// * `train` - Whether the model is trained.
    pub fn forward_t(
        &self,
        query: &Tensor,
        key_value: &Tensor,
        attention_mask: Option<&AttentionMask>,
        train: bool,
    ) -> Result<AttentionOutput, MultiHeadAttentionError> {
        let query = self
            .query
            .forward(query)
            .context(QkvSnafu)?
            .split_heads(self.n_heads)?;
        let key = self
            .key
            .forward(key_value)
            .context(QkvSnafu)?
            .split_heads(self.n_heads)?;
        let value = self
            .value
            .forward(key_value)
            .context(QkvSnafu)?
            .split_heads(self.n_heads)?;

        let batch_size = query.dim(0).context(SplitHeadsSnafu)?;
        let (attn, scores) = match self.max_inference_parallelism {
            Some(chunk_size) if !train && chunk_size > 0 && chunk_size < batch_size => self
                .attend_chunked(&query, &key, &value, attention_mask, chunk_size)?,
            _ => self
                .sdpa
                .forward(&query, &key, &value, attention_mask, train)
                .context(ScaledDotProductAttentionSnafu)?,
        };

        let output = self
            .output
            .forward(&attn.combine_heads()?)
            .context(OutputSnafu)?;

        Ok(AttentionOutput { output, scores })
    }

    /// Attend in chunks of at most `chunk_size` batch elements.
    fn attend_chunked(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        attention_mask: Option<&AttentionMask>,
        chunk_size: usize,
    ) -> Result<(Tensor, Tensor), MultiHeadAttentionError> {
        let batch_size = query.dim(0).context(SplitHeadsSnafu)?;
        let mut attn_chunks = Vec::new();
        let mut score_chunks = Vec::new();
        for start in (0..batch_size).step_by(chunk_size) {
            let len = chunk_size.min(batch_size - start);
            let chunk = |xs: &Tensor| xs.narrow(0, start, len).context(SplitHeadsSnafu);
            let mask = attention_mask
                .map(|mask| mask.narrow_batch(start, len))
                .transpose()
                .context(ChunkMaskSnafu)?;
            let (attn, scores) = self
                .sdpa
                .forward(
                    &chunk(query)?,
                    &chunk(key)?,
                    &chunk(value)?,
                    mask.as_ref(),
                    false,
                )
                .context(ScaledDotProductAttentionSnafu)?;
            attn_chunks.push(attn);
            score_chunks.push(scores);
        }

        Ok((
            Tensor::cat(&attn_chunks, 0).context(ConcatChunksSnafu)?,
            Tensor::cat(&score_chunks, 0).context(ConcatChunksSnafu)?,
        ))
    }
}

trait CombineHeads {
    fn combine_heads(&self) -> Result<Tensor, MultiHeadAttentionError>;
}

impl CombineHeads for Tensor {
    fn combine_heads(&self) -> Result<Tensor, MultiHeadAttentionError> {
        let (batch_size, n_heads, seq_len, head_width) =
            self.dims4().context(CombineHeadsSnafu)?;
        self.transpose(1, 2)
            .and_then(|heads| heads.reshape((batch_size, seq_len, n_heads * head_width)))
            .context(CombineHeadsSnafu)
    }
}

trait SplitHeads {
    fn split_heads(&self, n_heads: usize) -> Result<Tensor, MultiHeadAttentionError>;
}

impl SplitHeads for Tensor {
    fn split_heads(&self, n_heads: usize) -> Result<Tensor, MultiHeadAttentionError> {
        let (batch_size, seq_len, heads_width) = self.dims3().context(SplitHeadsSnafu)?;
        let head_width = heads_width / n_heads;
        self.reshape((batch_size, seq_len, n_heads, head_width))
            .and_then(|heads| heads.transpose(1, 2))
            .context(SplitHeadsSnafu)
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device, Tensor};
    use candle_nn::{VarBuilder, VarMap};
    use snafu::{report, ResultExt, Whatever};

    use super::{AttentionMask, MultiHeadAttentionConfig};
    use crate::util::tests::{assert_tensor_eq, PseudoRandom};

    fn attention_config() -> MultiHeadAttentionConfig {
        MultiHeadAttentionConfig::default()
            .n_heads(2)
            .head_width(4)
            .width(8)
    }

    #[test]
    #[report]
    fn attention_has_correct_output_shapes() -> Result<(), Whatever> {
        let device = Device::Cpu;
        let vb = VarBuilder::from_varmap(&VarMap::new(), DType::F32, &device);
        let attention = attention_config()
            .build(vb, 6)
            .whatever_context("Cannot build attention")?;

        let query = Tensor::pseudo_random((3, 5, 8), 1, DType::F32, &device)
            .whatever_context("Cannot create query")?;
        let key_value = Tensor::pseudo_random((3, 7, 6), 2, DType::F32, &device)
            .whatever_context("Cannot create key/value")?;
        let output = attention
            .forward_t(&query, &key_value, None, false)
            .whatever_context("Cannot apply attention")?;

        assert_eq!(output.output.dims(), &[3, 5, 8]);
        assert_eq!(output.scores.dims(), &[3, 2, 5, 7]);

        Ok(())
    }

    #[test]
    #[report]
    fn chunked_inference_gives_same_output() -> Result<(), Whatever> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let attention = attention_config()
            .build(VarBuilder::from_varmap(&varmap, DType::F32, &device), 8)
            .whatever_context("Cannot build attention")?;
        let chunked_attention = attention_config()
            .max_inference_parallelism(Some(2))
            .build(VarBuilder::from_varmap(&varmap, DType::F32, &device), 8)
            .whatever_context("Cannot build chunked attention")?;

        let xs = Tensor::pseudo_random((5, 4, 8), 3, DType::F32, &device)
            .whatever_context("Cannot create input")?;
        let mask = Tensor::pseudo_random((5, 4, 4), 4, DType::F32, &device)
            .and_then(|mask| mask.ge(-0.5))
            .and_then(|mask| AttentionMask::new(mask).map_err(candle_core::Error::wrap))
            .whatever_context("Cannot create mask")?;

        let output = attention
            .forward_t(&xs, &xs, Some(&mask), false)
            .whatever_context("Cannot apply attention")?;
        let chunked_output = chunked_attention
            .forward_t(&xs, &xs, Some(&mask), false)
            .whatever_context("Cannot apply chunked attention")?;

        assert_tensor_eq!(output.output, chunked_output.output, epsilon = 1e-6f32);
        assert_tensor_eq!(output.scores, chunked_output.scores, epsilon = 1e-6f32);

        Ok(())
    }
}
