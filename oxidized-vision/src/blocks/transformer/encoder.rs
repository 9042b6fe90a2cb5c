use candle_core::{ModuleT, Tensor};
use candle_nn::VarBuilder;
use serde::{Deserialize, Serialize};
use snafu::ResultExt;

use crate::blocks::transformer::{
    check_input, input_width, AttentionDropoutSnafu, AttentionFeedForwardConfig, AttentionSnafu,
    BuildLayerSnafu, BuildSublayersSnafu, BuildTransformerSublayers, FeedForwardSnafu,
    NarrowMaskSnafu, NormSnafu, OutputRangeSnafu, ResidualConnection, ResidualSnafu,
    TransformerBlockOutput, TransformerInputs, TransformerSublayers,
};
use crate::blocks::{BlockConfig, BuildBlock};
use crate::error::BoxedError;
use crate::layers::activation::Activation;
use crate::layers::build_module::BuildModule;
use crate::layers::dropout::DropoutConfig;
use crate::layers::layer_norm::LayerNormConfig;
use crate::layers::layer_scale::LayerScaleConfig;
use crate::layers::stochastic_depth::StochasticDepthConfig;

/// Transformer encoder block configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransformerEncoderBlockConfig {
    attention_dropout: f32,
    inner_activation: Activation,
    inner_dim: usize,
    inner_dropout: f32,
    layer_scale_init_value: f64,
    max_attention_inference_parallelism: Option<usize>,
    norm_epsilon: f64,
    norm_first: bool,
    num_attention_heads: usize,
    output_dropout: f32,
    output_range: Option<usize>,
    return_attention_scores: bool,
    stochastic_depth_drop_rate: Option<f64>,
    use_bias: bool,
    use_query_residual: bool,
}

impl TransformerEncoderBlockConfig {
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

    /// Initial value of the layer scales of the attention and
    /// feed-forward outputs. Layer scale is disabled when zero.
    ///
    /// Default: `0.0`
    pub fn layer_scale_init_value(mut self, layer_scale_init_value: f64) -> Self {
        self.layer_scale_init_value = layer_scale_init_value;
        self
    }

    /// Maximum number of batch elements to attend to in parallel during
    /// inference.
    ///
    /// Default: `None`
    pub fn max_attention_inference_parallelism(
        mut self,
        max_attention_inference_parallelism: Option<usize>,
    ) -> Self {
        self.max_attention_inference_parallelism = max_attention_inference_parallelism;
        self
    }

    /// Epsilon of the layer normalizations.
    ///
    /// Default: `1e-12`
    pub fn norm_epsilon(mut self, norm_epsilon: f64) -> Self {
        self.norm_epsilon = norm_epsilon;
        self
    }

    /// Normalize the inputs of the sublayers rather than the outputs of
    /// the residual connections.
    ///
    /// Default: `false`
    pub fn norm_first(mut self, norm_first: bool) -> Self {
        self.norm_first = norm_first;
        self
    }

    /// Number of attention heads.
    ///
    /// Default: `12`
    pub fn num_attention_heads(mut self, num_attention_heads: usize) -> Self {
        self.num_attention_heads = num_attention_heads;
        self
    }

    /// Dropout probability of the attention and feed-forward outputs.
    ///
    /// Default: `0.0`
    pub fn output_dropout(mut self, output_dropout: f32) -> Self {
        self.output_dropout = output_dropout;
        self
    }

    /// Only compute outputs for the first `output_range` sequence
    /// elements.
    ///
    /// Default: `None`
    pub fn output_range(mut self, output_range: Option<usize>) -> Self {
        self.output_range = output_range;
        self
    }

    /// Return the attention weights with the block output.
    ///
    /// Default: `false`
    pub fn return_attention_scores(mut self, return_attention_scores: bool) -> Self {
        self.return_attention_scores = return_attention_scores;
        self
    }

    /// Drop rate of stochastic depth on the residual branches.
    ///
    /// Default: `None`
    pub fn stochastic_depth_drop_rate(mut self, stochastic_depth_drop_rate: Option<f64>) -> Self {
        self.stochastic_depth_drop_rate = stochastic_depth_drop_rate;
        self
    }

    /// Use biases in the attention projections.
    ///
    /// Default: `true`
    pub fn use_bias(mut self, use_bias: bool) -> Self {
        self.use_bias = use_bias;
        self
    }

    /// Add the query to the attention output.
    ///
    /// Default: `true`
    pub fn use_query_residual(mut self, use_query_residual: bool) -> Self {
        self.use_query_residual = use_query_residual;
        self
    }
}

impl Default for TransformerEncoderBlockConfig {
    fn default() -> Self {
        Self {
            attention_dropout: 0.0,
            inner_activation: Activation::Gelu,
            inner_dim: 3072,
            inner_dropout: 0.0,
            layer_scale_init_value: 0.0,
            max_attention_inference_parallelism: None,
            norm_epsilon: 1e-12,
            norm_first: false,
            num_attention_heads: 12,
            output_dropout: 0.0,
            output_range: None,
            return_attention_scores: false,
            stochastic_depth_drop_rate: None,
            use_bias: true,
            use_query_residual: true,
        }
    }
}

impl BlockConfig for TransformerEncoderBlockConfig {}

impl BuildBlock for TransformerEncoderBlockConfig {
    type Block = TransformerEncoderBlock;

    fn build(
        &self,
        vb: VarBuilder,
        input_shape: &[usize],
    ) -> Result<TransformerEncoderBlock, BoxedError> {
        let width = input_width("TransformerEncoderBlock", input_shape)?;

        let sublayers = AttentionFeedForwardConfig::default()
            .attention_dropout(self.attention_dropout)
            .inner_activation(self.inner_activation)
            .inner_dim(self.inner_dim)
            .inner_dropout(self.inner_dropout)
            .num_attention_heads(self.num_attention_heads)
            .output_dropout(self.output_dropout)
            .use_bias(self.use_bias)
            .build(vb.clone(), width, self.max_attention_inference_parallelism)
            .context(BuildSublayersSnafu)?;

        let norm = |name: &str| {
            LayerNormConfig::default()
                .eps(self.norm_epsilon)
                .width(width)
                .build(vb.push_prefix(name))
                .context(BuildLayerSnafu)
        };
        let layer_scale = |name: &str| {
            LayerScaleConfig::default()
                .init_value(self.layer_scale_init_value)
                .width(width)
                .build(vb.push_prefix(name))
                .context(BuildLayerSnafu)
        };
        let stochastic_depth = || {
            StochasticDepthConfig::default()
                .drop_rate(self.stochastic_depth_drop_rate)
                .build(vb.clone())
                .context(BuildLayerSnafu)
        };

        if self.layer_scale_init_value != 0. {
            tracing::debug!(
                init_value = self.layer_scale_init_value,
                "Transformer encoder block uses layer scale"
            );
        }

        Ok(TransformerEncoderBlock {
            attention_dropout: DropoutConfig::default()
                .p(self.output_dropout)
                .build(vb.clone())
                .context(BuildLayerSnafu)?,
            attention_norm: norm("attention_norm")?,
            attention_residual: ResidualConnection::new(
                layer_scale("layer_scale_attn")?,
                stochastic_depth()?,
            ),
            feed_forward_residual: ResidualConnection::new(
                layer_scale("layer_scale_mlp")?,
                stochastic_depth()?,
            ),
            norm_first: self.norm_first,
            output_norm: norm("output_norm")?,
            output_range: self.output_range,
            return_attention_scores: self.return_attention_scores,
            sublayers,
            use_query_residual: self.use_query_residual,
            width,
        })
    }
}

/// Transformer encoder block (_Vaswani et al., 2017_) with stochastic
/// depth (_Huang et al., 2016_) and layer scale (_Touvron et al., 2021_).
///
/// Layer scale is applied to the attention and feed-forward outputs, and
/// stochastic depth to the scaled outputs, before they are added to the
/// residual.
///
/// * _Vaswani et al., 2017_: https://arxiv.org/abs/1706.03762
/// * _Huang et al., 2016_: https://arxiv.org/abs/1603.09382
/// * _Touvron et al., 2021_: https://arxiv.org/abs/2103.17239
pub struct TransformerEncoderBlock {
    attention_dropout: Box<dyn ModuleT>,
    attention_norm: Box<dyn ModuleT>,
    attention_residual: ResidualConnection,
    feed_forward_residual: ResidualConnection,
    norm_first: bool,
    output_norm: Box<dyn ModuleT>,
    output_range: Option<usize>,
    return_attention_scores: bool,
    sublayers: Box<dyn TransformerSublayers>,
    use_query_residual: bool,
    width: usize,
}

impl TransformerEncoderBlock {
    /// Apply the block.
    ///
    /// * `inputs` - Block inputs.
    /// * `train` - Whether to train the block.
    pub fn forward_t(
        &self,
        inputs: impl Into<TransformerInputs>,
        train: bool,
    ) -> Result<TransformerBlockOutput, BoxedError> {
        self.forward_range_t(inputs, self.output_range, train)
    }

    /// Apply the block, computing outputs for the first `output_range`
    /// sequence elements.
    ///
    /// * `inputs` - Block inputs.
    /// * `output_range` - Number of sequence elements to compute outputs
    ///   for. Outputs are computed for all elements when `None`, zero, or
    ///   larger than the sequence length.
    /// * `train` - Whether to train the block.
    pub fn forward_range_t(
        &self,
        inputs: impl Into<TransformerInputs>,
        output_range: Option<usize>,
        train: bool,
    ) -> Result<TransformerBlockOutput, BoxedError> {
        let TransformerInputs {
            input,
            key_value,
            attention_mask,
        } = inputs.into();
        check_input("TransformerEncoderBlock", self.width, &input)?;

        let seq_len = input.dim(1).context(OutputRangeSnafu)?;
        let output_range = output_range
            .filter(|&output_range| output_range > 0)
            .map(|output_range| output_range.min(seq_len));
        let narrow = |xs: &Tensor| match output_range {
            Some(output_range) => xs.narrow(1, 0, output_range).context(OutputRangeSnafu),
            None => Ok(xs.clone()),
        };
        let attention_mask = match (output_range, attention_mask) {
            (Some(output_range), Some(attention_mask)) => Some(
                attention_mask
                    .narrow_queries(output_range)
                    .context(NarrowMaskSnafu)?,
            ),
            (_, attention_mask) => attention_mask,
        };

        let source = narrow(&input)?;
        let (input, key_value) = if self.norm_first {
            let attention_norm = |xs: &Tensor| {
                self.attention_norm
                    .forward_t(xs, train)
                    .context(NormSnafu)
            };
            (
                attention_norm(&input)?,
                key_value.as_ref().map(attention_norm).transpose()?,
            )
        } else {
            (input, key_value)
        };
        let target = narrow(&input)?;
        let key_value = key_value.unwrap_or(input);

        let attention = self
            .sublayers
            .attend(&target, &key_value, attention_mask.as_ref(), train)
            .context(AttentionSnafu)?;
        let attention_output = self
            .attention_dropout
            .forward_t(&attention.output, train)
            .context(AttentionDropoutSnafu)?;

        let residual = if self.norm_first { &source } else { &target };
        let attention_output = self
            .attention_residual
            .forward_t(
                self.use_query_residual.then_some(residual),
                &attention_output,
                train,
            )
            .context(ResidualSnafu)?;

        let output = if self.norm_first {
            let ffn_input = self
                .output_norm
                .forward_t(&attention_output, train)
                .context(NormSnafu)?;
            let ffn_output = self
                .sublayers
                .feed_forward(&ffn_input, train)
                .context(FeedForwardSnafu)?;
            self.feed_forward_residual
                .forward_t(Some(&attention_output), &ffn_output, train)
                .context(ResidualSnafu)?
        } else {
            let attention_output = self
                .attention_norm
                .forward_t(&attention_output, train)
                .context(NormSnafu)?;
            let ffn_output = self
                .sublayers
                .feed_forward(&attention_output, train)
                .context(FeedForwardSnafu)?;
            self.feed_forward_residual
                .forward_t(Some(&attention_output), &ffn_output, train)
                .and_then(|output| self.output_norm.forward_t(&output, train))
                .context(ResidualSnafu)?
        };

        Ok(TransformerBlockOutput {
            output,
            attention_scores: self.return_attention_scores.then_some(attention.scores),
        })
    }
}
