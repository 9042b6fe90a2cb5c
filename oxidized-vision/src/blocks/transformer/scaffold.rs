use candle_core::{ModuleT, Tensor};
use candle_nn::VarBuilder;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use snafu::{ensure, ResultExt};

use crate::blocks::transformer::{
    check_input, input_width, AttentionDropoutSnafu, AttentionSnafu, BuildLayerSnafu,
    BuildSublayersSnafu, BuildTransformerSublayers, FeedForwardResidualSnafu, FeedForwardSnafu,
    NormSnafu, ResidualConnection, ResidualSnafu, TransformerBlockOutput, TransformerInputs,
    TransformerSublayers,
};
use crate::blocks::{BlockConfig, BuildBlock};
use crate::error::BoxedError;
use crate::layers::build_module::BuildModule;
use crate::layers::dropout::DropoutConfig;
use crate::layers::identity::Identity;
use crate::layers::layer_norm::LayerNormConfig;
use crate::layers::stochastic_depth::StochasticDepthConfig;

/// Transformer scaffold configuration.
///
/// The scaffold wires user-provided sublayers together with layer
/// normalization, stochastic depth, and residual connections.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, bound(deserialize = "S: Deserialize<'de> + Default"))]
pub struct TransformerScaffoldConfig<S> {
    dropout: f32,
    ffn_has_residual_connection: bool,
    max_attention_inference_parallelism: Option<usize>,
    norm_epsilon: f64,
    norm_first: bool,
    return_attention_scores: bool,
    stochastic_depth_drop_rate: Option<f64>,
    sublayers: S,
}

impl<S> TransformerScaffoldConfig<S> {
    /// Construct a scaffold configuration for the given sublayers.
    pub fn new(sublayers: S) -> Self {
        TransformerScaffoldConfig {
            dropout: 0.0,
            ffn_has_residual_connection: false,
            max_attention_inference_parallelism: None,
            norm_epsilon: 1e-12,
            norm_first: false,
            return_attention_scores: false,
            stochastic_depth_drop_rate: None,
            sublayers,
        }
    }

    /// Dropout probability of the attention output.
    ///
    /// Default: `0.0`
    pub fn dropout(mut self, dropout: f32) -> Self {
        self.dropout = dropout;
        self
    }

    /// The feed-forward sublayer applies its own residual connection and
    /// normalization.
    ///
    /// Default: `false`
    pub fn ffn_has_residual_connection(mut self, ffn_has_residual_connection: bool) -> Self {
        self.ffn_has_residual_connection = ffn_has_residual_connection;
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
}

impl<S> Default for TransformerScaffoldConfig<S>
where
    S: Default,
{
    fn default() -> Self {
        TransformerScaffoldConfig::new(S::default())
    }
}

impl<S> BlockConfig for TransformerScaffoldConfig<S>
where
    S: Default + Serialize + DeserializeOwned,
{
}

impl<S> BuildBlock for TransformerScaffoldConfig<S>
where
    S: BuildTransformerSublayers,
{
    type Block = TransformerScaffold;

    fn build(&self, vb: VarBuilder, input_shape: &[usize]) -> Result<TransformerScaffold, BoxedError> {
        ensure!(
            !(self.norm_first && self.ffn_has_residual_connection),
            FeedForwardResidualSnafu
        );
        let width = input_width("TransformerScaffold", input_shape)?;

        let sublayers = self
            .sublayers
            .build(vb.clone(), width, self.max_attention_inference_parallelism)
            .context(BuildSublayersSnafu)?;

        let norm = |name: &str| {
            LayerNormConfig::default()
                .eps(self.norm_epsilon)
                .width(width)
                .build(vb.push_prefix(name))
                .context(BuildLayerSnafu)
        };
        let residual_connection = || {
            StochasticDepthConfig::default()
                .drop_rate(self.stochastic_depth_drop_rate)
                .build(vb.clone())
                .context(BuildLayerSnafu)
                .map(|stochastic_depth| {
                    ResidualConnection::new(Box::new(Identity), stochastic_depth)
                })
        };

        Ok(TransformerScaffold {
            attention_dropout: DropoutConfig::default()
                .p(self.dropout)
                .build(vb.clone())
                .context(BuildLayerSnafu)?,
            attention_norm: norm("attention_norm")?,
            attention_residual: residual_connection()?,
            feed_forward_residual: residual_connection()?,
            ffn_has_residual_connection: self.ffn_has_residual_connection,
            norm_first: self.norm_first,
            output_norm: norm("output_norm")?,
            return_attention_scores: self.return_attention_scores,
            sublayers,
            width,
        })
    }
}

/// Transformer block with pluggable attention and feed-forward sublayers.
///
/// Stochastic depth is applied to the sublayer outputs before they are
/// added to the residual.
pub struct TransformerScaffold {
    attention_dropout: Box<dyn ModuleT>,
    attention_norm: Box<dyn ModuleT>,
    attention_residual: ResidualConnection,
    feed_forward_residual: ResidualConnection,
    ffn_has_residual_connection: bool,
    norm_first: bool,
    output_norm: Box<dyn ModuleT>,
    return_attention_scores: bool,
    sublayers: Box<dyn TransformerSublayers>,
    width: usize,
}

impl TransformerScaffold {
    /// Apply the block.
    ///
    /// * `inputs` - Block inputs.
    /// * `train` - Whether to train the block.
    pub fn forward_t(
        &self,
        inputs: impl Into<TransformerInputs>,
        train: bool,
    ) -> Result<TransformerBlockOutput, BoxedError> {
        let TransformerInputs {
            input,
            key_value,
            attention_mask,
        } = inputs.into();
        check_input("TransformerScaffold", self.width, &input)?;

        let source = input.clone();
        let input = if self.norm_first {
            self.attention_norm
                .forward_t(&input, train)
                .context(NormSnafu)?
        } else {
            input
        };
        let key_value = key_value.unwrap_or_else(|| input.clone());

        let attention = self
            .sublayers
            .attend(&input, &key_value, attention_mask.as_ref(), train)
            .context(AttentionSnafu)?;
        let attention_output = self
            .attention_dropout
            .forward_t(&attention.output, train)
            .context(AttentionDropoutSnafu)?;

        let output = if self.norm_first {
            let source_attention_output = self
                .attention_residual
                .forward_t(Some(&source), &attention_output, train)
                .context(ResidualSnafu)?;
            let ffn_input = self
                .output_norm
                .forward_t(&source_attention_output, train)
                .context(NormSnafu)?;
            let ffn_output = self.feed_forward(&ffn_input, train)?;
            self.feed_forward_residual
                .forward_t(Some(&source_attention_output), &ffn_output, train)
                .context(ResidualSnafu)?
        } else {
            let attention_output = self
                .attention_residual
                .forward_t(Some(&input), &attention_output, train)
                .and_then(|xs| self.attention_norm.forward_t(&xs, train))
                .context(ResidualSnafu)?;
            let ffn_output = self.feed_forward(&attention_output, train)?;
            if self.ffn_has_residual_connection {
                self.feed_forward_residual
                    .branch_t(&ffn_output, train)
                    .context(ResidualSnafu)?
            } else {
                self.feed_forward_residual
                    .forward_t(Some(&attention_output), &ffn_output, train)
                    .and_then(|xs| self.output_norm.forward_t(&xs, train))
                    .context(ResidualSnafu)?
            }
        };

        Ok(TransformerBlockOutput {
            output,
            attention_scores: self.return_attention_scores.then_some(attention.scores),
        })
    }

    fn feed_forward(&self, xs: &Tensor, train: bool) -> Result<Tensor, BoxedError> {
        Ok(self
            .sublayers
            .feed_forward(xs, train)
            .context(FeedForwardSnafu)?)
    }
}
