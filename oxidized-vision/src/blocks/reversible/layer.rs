use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};
use candle_nn::VarBuilder;
use serde::{Deserialize, Serialize};
use snafu::{ensure, OptionExt, ResultExt, Snafu};

use crate::blocks::reversible::inner::{InnerBlockConfig, ReversibleFunction};
use crate::blocks::{Block, BlockConfig, BlockShapeError, BuildBlock, FeatureMapShape};
use crate::error::BoxedError;
use crate::layers::data_format::DataFormat;
use crate::layers::pooling::{maybe_downsample, PoolingError};
use crate::layers::regularizer::sum_penalties;
use crate::util::tensor_ext::{SplitHalves, SplitHalvesError};

/// Trait for layers with a custom backward pass.
///
/// The forward pass returns the output together with a residual that
/// holds everything the backward pass needs. The backward pass consumes
/// the residual.
pub trait CustomGradient {
    /// Data passed from the forward pass to the backward pass.
    type Residual;

    /// Apply the layer.
    ///
    /// * `xs` - Layer input.
    /// * `train` - Whether to train the layer.
    fn forward(&self, xs: &Tensor, train: bool) -> Result<(Tensor, Self::Residual), BoxedError>;

    /// Compute the gradients of the layer.
    ///
    /// * `residual` - Residual of the forward pass.
    /// * `dy` - Gradient of the loss with respect to the layer output.
    /// * `variables` - Variables to compute the gradients for.
    ///
    /// Returns the gradient with respect to the input and the gradients
    /// of `variables`, in the same order as `variables`.
    fn backward(
        &self,
        residual: Self::Residual,
        dy: &Tensor,
        variables: &[Tensor],
    ) -> Result<ReversibleGradients, BoxedError>;
}

/// Gradients computed by the backward pass of a reversible layer.
#[derive(Clone, Debug)]
pub struct ReversibleGradients {
    /// Gradient with respect to the layer input.
    pub input: Tensor,

    /// Gradients with respect to the requested variables.
    pub vars: Vec<Tensor>,
}

/// Copy of non-trainable statistics.
///
/// Recomputing the residual functions in training mode updates their
/// normalization statistics again. Restoring the snapshot undoes those
/// updates.
pub struct StatisticsSnapshot {
    statistics: Vec<(Var, Tensor)>,
}

impl StatisticsSnapshot {
    /// Copy the current values of the given statistics.
    pub fn capture(statistics: Vec<Var>) -> candle_core::Result<Self> {
        let statistics = statistics
            .into_iter()
            .map(|var| {
                let value = var.as_tensor().copy()?;
                Ok::<_, candle_core::Error>((var, value))
            })
            .collect::<candle_core::Result<_>>()?;
        Ok(StatisticsSnapshot { statistics })
    }

    /// Restore the statistics to the captured values.
    pub fn restore(&self) -> candle_core::Result<()> {
        for (var, value) in &self.statistics {
            var.set(value)?;
        }
        Ok(())
    }
}

/// Activations kept for the backward pass.
enum Activations {
    /// The forward graph is kept for reverse-mode autodiff.
    Recorded { input: Var, output: Tensor },

    /// Only the detached output halves are kept, the input is
    /// reconstructed from them.
    Reconstructible { y1: Tensor, y2: Tensor },
}

/// Residual of the forward pass of a reversible layer.
pub struct ReversibleResidual {
    activations: Activations,
    snapshot: StatisticsSnapshot,
    train: bool,
}

impl ReversibleResidual {
    /// Whether the backward pass reconstructs the input from the output.
    pub fn uses_reconstruction(&self) -> bool {
        matches!(self.activations, Activations::Reconstructible { .. })
    }
}

/// Reversible layer configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReversibleLayerConfig {
    f: InnerBlockConfig,
    g: InnerBlockConfig,
    manual_grads: bool,
}

impl ReversibleLayerConfig {
    /// Residual function applied to the second half of the input.
    ///
    /// Default: `InnerBlockConfig::Residual(ResidualInnerConfig::default())`
    pub fn f(mut self, f: impl Into<InnerBlockConfig>) -> Self {
        self.f = f.into();
        self
    }

    /// Residual function applied to the first half of the output.
    ///
    /// Default: `InnerBlockConfig::Residual(ResidualInnerConfig::default())`
    pub fn g(mut self, g: impl Into<InnerBlockConfig>) -> Self {
        self.g = g.into();
        self
    }

    /// Compute gradients by reconstructing the input from the output.
    ///
    /// When disabled, or when the layer is not reversible, gradients are
    /// computed with reverse-mode autodiff over the recorded forward
    /// graph.
    ///
    /// Default: `true`
    pub fn manual_grads(mut self, manual_grads: bool) -> Self {
        self.manual_grads = manual_grads;
        self
    }
}

impl Default for ReversibleLayerConfig {
    fn default() -> Self {
        Self {
            f: InnerBlockConfig::default(),
            g: InnerBlockConfig::default(),
            manual_grads: true,
        }
    }
}

impl BlockConfig for ReversibleLayerConfig {}

impl BuildBlock for ReversibleLayerConfig {
    type Block = ReversibleLayer;

    fn build(&self, vb: VarBuilder, input_shape: &[usize]) -> Result<ReversibleLayer, BoxedError> {
        let shape = FeatureMapShape::new("ReversibleLayer", input_shape, DataFormat::current())
            .context(InputShapeSnafu)?;
        check_pair(&shape, self.f.strides(), self.g.strides())?;

        let batch_size = input_shape[0];
        let half_shape = shape.output_shape(batch_size, shape.channels() / 2, 1);
        let f = self
            .f
            .build(vb.push_prefix("f"), &half_shape)
            .context(BuildFSnafu)?;

        let g_shape = shape.output_shape(batch_size, self.f.out_channels(), self.f.strides());
        let g = self
            .g
            .build(vb.push_prefix("g"), &g_shape)
            .context(BuildGSnafu)?;

        Ok(ReversibleLayer::new(
            Box::new(f),
            Box::new(g),
            self.manual_grads,
            input_shape,
        )?)
    }
}

fn check_pair(
    shape: &FeatureMapShape,
    f_strides: usize,
    g_strides: usize,
) -> Result<(), ReversibleLayerError> {
    ensure!(
        shape.channels() % 2 == 0,
        OddChannelsSnafu {
            channels: shape.channels()
        }
    );
    ensure!(
        f_strides == g_strides,
        StrideMismatchSnafu {
            f_strides,
            g_strides
        }
    );
    Ok(())
}

/// Reversible layer errors.
#[derive(Debug, Snafu)]
pub enum ReversibleLayerError {
    #[snafu(display("Cannot apply residual function F"))]
    ApplyF { source: BoxedError },

    #[snafu(display("Cannot apply residual function G"))]
    ApplyG { source: BoxedError },

    #[snafu(display("Cannot compute gradients"))]
    Backward { source: candle_core::Error },

    #[snafu(display("Cannot build residual function F"))]
    BuildF { source: BoxedError },

    #[snafu(display("Cannot build residual function G"))]
    BuildG { source: BoxedError },

    #[snafu(display("Cannot downsample input half"))]
    Downsample { source: PoolingError },

    #[snafu(display("Cannot combine residual branches"))]
    Forward { source: candle_core::Error },

    #[snafu(display("Invalid reversible layer input"))]
    InputShape { source: BlockShapeError },

    #[snafu(display("Reversible layer requires an even number of channels, got {channels}"))]
    OddChannels { channels: usize },

    #[snafu(display("Cannot compute regularization loss"))]
    RegularizationLoss { source: BoxedError },

    #[snafu(display("Cannot restore normalization statistics"))]
    RestoreStatistics { source: candle_core::Error },

    #[snafu(display("Cannot capture normalization statistics"))]
    SnapshotStatistics { source: candle_core::Error },

    #[snafu(display("Cannot split tensor into halves"))]
    Split { source: SplitHalvesError },

    #[snafu(display("Cannot sum regularization losses"))]
    SumPenalties { source: candle_core::Error },

    #[snafu(display(
        "Residual functions must have the same strides, got {f_strides} (F) and {g_strides} (G)"
    ))]
    StrideMismatch { f_strides: usize, g_strides: usize },

    #[snafu(display("Variable at position {index} is not a trainable variable of the layer"))]
    UnknownVariable { index: usize },
}

/// Reversible residual layer (_Gomez et al., 2017_).
///
/// The input is split into two halves `x1` and `x2` along the channel
/// axis. The layer computes:
///
/// ```text
/// y1 = x1 + F(x2)
/// y2 = x2 + G(y1)
/// ```
///
/// and concatenates `y1` and `y2`. When the layer does not change the
/// shape of its input, `x1` and `x2` can be reconstructed from `y1` and
/// `y2`. The backward pass of [`CustomGradient`] then recomputes the
/// activations instead of keeping the forward graph alive.
///
/// * _Gomez et al., 2017_: https://arxiv.org/abs/1707.04585
pub struct ReversibleLayer {
    f: Box<dyn ReversibleFunction>,
    g: Box<dyn ReversibleFunction>,
    manual_grads: bool,
    shape: FeatureMapShape,
}

impl ReversibleLayer {
    /// Construct a reversible layer from two residual functions.
    ///
    /// * `f` - Residual function for half of the input channels.
    /// * `g` - Residual function for the output of `f`.
    /// * `manual_grads` - Use the reconstructing backward pass when the
    ///   layer is reversible.
    /// * `input_shape` - Shape of the layer input in the current data
    ///   format.
    pub fn new(
        f: Box<dyn ReversibleFunction>,
        g: Box<dyn ReversibleFunction>,
        manual_grads: bool,
        input_shape: &[usize],
    ) -> Result<Self, ReversibleLayerError> {
        let shape = FeatureMapShape::new("ReversibleLayer", input_shape, DataFormat::current())
            .context(InputShapeSnafu)?;
        check_pair(&shape, f.strides(), g.strides())?;
        Ok(ReversibleLayer {
            f,
            g,
            manual_grads,
            shape,
        })
    }

    fn channel_axis(&self) -> usize {
        self.shape.data_format().channel_axis()
    }

    /// Compute the output halves `(y1, y2)`.
    fn forward_halves(
        &self,
        xs: &Tensor,
        train: bool,
    ) -> Result<(Tensor, Tensor), ReversibleLayerError> {
        self.shape.check(xs).context(InputShapeSnafu)?;
        let data_format = self.shape.data_format();
        let (x1, x2) = xs.split_halves(self.channel_axis()).context(SplitSnafu)?;

        let f_x2 = self.f.forward_t(&x2, train).context(ApplyFSnafu)?;
        let x1_down = maybe_downsample(
            &x1,
            f_x2.dim(self.channel_axis()).context(ForwardSnafu)?,
            self.f.strides(),
            data_format,
        )
        .context(DownsampleSnafu)?;
        let z1 = (&f_x2 + &x1_down).context(ForwardSnafu)?;

        let g_z1 = self.g.forward_t(&z1, train).context(ApplyGSnafu)?;
        let x2_down = maybe_downsample(
            &x2,
            g_z1.dim(self.channel_axis()).context(ForwardSnafu)?,
            self.f.strides(),
            data_format,
        )
        .context(DownsampleSnafu)?;
        let y2 = (&x2_down + &g_z1).context(ForwardSnafu)?;

        Ok((z1, y2))
    }

    /// Whether the input can be reconstructed from the output.
    ///
    /// F and G always have equal strides and strides above one fail during
    /// the forward pass, so in practice only a change in the number of
    /// channels makes a layer irreversible.
    fn is_reversible(&self, xs: &Tensor, ys: &Tensor) -> candle_core::Result<bool> {
        let channel_axis = self.channel_axis();
        Ok(self.f.strides() == 1
            && self.g.strides() == 1
            && xs.dim(channel_axis)? == ys.dim(channel_axis)?)
    }

    /// Backward pass with reverse-mode autodiff over the forward graph.
    fn autodiff_backward(
        &self,
        input: &Var,
        output: &Tensor,
        dy: &Tensor,
        variables: &[Tensor],
    ) -> Result<ReversibleGradients, ReversibleLayerError> {
        let grads = vjp(output, dy).context(BackwardSnafu)?;
        let input_grad = grad_or_zeros(&grads, input.as_tensor()).context(BackwardSnafu)?;
        let vars = variables
            .iter()
            .map(|variable| grad_or_zeros(&grads, variable))
            .collect::<candle_core::Result<_>>()
            .context(BackwardSnafu)?;
        Ok(ReversibleGradients {
            input: input_grad,
            vars,
        })
    }

    /// Backward pass that reconstructs the input from the output.
    fn reconstructing_backward(
        &self,
        y1: &Tensor,
        y2: &Tensor,
        dy: &Tensor,
        variables: &[Tensor],
        train: bool,
    ) -> Result<ReversibleGradients, ReversibleLayerError> {
        let channel_axis = self.channel_axis();
        let (dy1, dy2) = dy.split_halves(channel_axis).context(SplitSnafu)?;

        // Recompute G and F on fresh graphs with the reconstructed halves
        // as leaves.
        let z1 = Var::from_tensor(&y1.detach()).context(BackwardSnafu)?;
        let g_z1 = self.g.forward_t(z1.as_tensor(), train).context(ApplyGSnafu)?;
        let x2 = (y2.detach() - g_z1.detach())
            .and_then(|x2| Var::from_tensor(&x2))
            .context(BackwardSnafu)?;
        let f_x2 = self.f.forward_t(x2.as_tensor(), train).context(ApplyFSnafu)?;

        let g_grads = vjp(&g_z1, &dy2).context(BackwardSnafu)?;
        let dz1 = grad_or_zeros(&g_grads, z1.as_tensor())
            .and_then(|grad| &dy1 + grad)
            .context(BackwardSnafu)?;

        let f_grads = vjp(&f_x2, &dz1).context(BackwardSnafu)?;
        let dx2 = grad_or_zeros(&f_grads, x2.as_tensor())
            .and_then(|grad| &dy2 + grad)
            .context(BackwardSnafu)?;

        let input = Tensor::cat(&[&dz1, &dx2], channel_axis).context(BackwardSnafu)?;

        let f_variables = self.f.trainable_variables();
        let g_variables = self.g.trainable_variables();
        let layer_grads = f_variables
            .iter()
            .map(|variable| (variable, &f_grads))
            .chain(g_variables.iter().map(|variable| (variable, &g_grads)))
            .map(|(variable, grads)| {
                Ok::<_, candle_core::Error>((variable.id(), grad_or_zeros(grads, variable)?))
            })
            .collect::<candle_core::Result<Vec<_>>>()
            .context(BackwardSnafu)?;

        let vars = variables
            .iter()
            .enumerate()
            .map(|(index, variable)| {
                layer_grads
                    .iter()
                    .find(|(id, _)| *id == variable.id())
                    .map(|(_, grad)| grad.clone())
                    .context(UnknownVariableSnafu { index })
            })
            .collect::<Result<_, ReversibleLayerError>>()?;

        Ok(ReversibleGradients { input, vars })
    }
}

/// Gradients of `sum(ys * dy)` with `dy` treated as a constant.
fn vjp(ys: &Tensor, dy: &Tensor) -> candle_core::Result<GradStore> {
    (ys * dy.detach())?.sum_all()?.backward()
}

fn grad_or_zeros(grads: &GradStore, tensor: &Tensor) -> candle_core::Result<Tensor> {
    match grads.get(tensor) {
        Some(grad) => Ok(grad.clone()),
        None => tensor.zeros_like(),
    }
}

impl Block for ReversibleLayer {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor, BoxedError> {
        let (y1, y2) = self.forward_halves(xs, train)?;
        Ok(Tensor::cat(&[&y1, &y2], self.channel_axis()).context(ForwardSnafu)?)
    }

    fn trainable_variables(&self) -> Vec<Tensor> {
        let mut variables = self.f.trainable_variables();
        variables.extend(self.g.trainable_variables());
        variables
    }

    fn non_trainable_variables(&self) -> Vec<Var> {
        let mut variables = self.f.non_trainable_variables();
        variables.extend(self.g.non_trainable_variables());
        variables
    }

    fn regularization_loss(&self) -> Result<Option<Tensor>, BoxedError> {
        let mut penalties = Vec::new();
        penalties.extend(
            self.f
                .regularization_loss()
                .context(RegularizationLossSnafu)?,
        );
        penalties.extend(
            self.g
                .regularization_loss()
                .context(RegularizationLossSnafu)?,
        );
        Ok(sum_penalties(penalties).context(SumPenaltiesSnafu)?)
    }
}

impl CustomGradient for ReversibleLayer {
    type Residual = ReversibleResidual;

    fn forward(
        &self,
        xs: &Tensor,
        train: bool,
    ) -> Result<(Tensor, ReversibleResidual), BoxedError> {
        let input = Var::from_tensor(&xs.detach()).context(ForwardSnafu)?;
        let (y1, y2) = self.forward_halves(input.as_tensor(), train)?;
        let output = Tensor::cat(&[&y1, &y2], self.channel_axis()).context(ForwardSnafu)?;

        let reversible = self.is_reversible(xs, &output).context(ForwardSnafu)?;
        let (output, activations) = if self.manual_grads && reversible {
            tracing::trace!("Reversible layer gradients use input reconstruction");
            let y1 = y1.detach();
            let y2 = y2.detach();
            (output.detach(), Activations::Reconstructible { y1, y2 })
        } else {
            tracing::trace!(
                manual_grads = self.manual_grads,
                reversible,
                "Reversible layer gradients use autodiff"
            );
            (output.clone(), Activations::Recorded { input, output })
        };

        let snapshot = StatisticsSnapshot::capture(self.non_trainable_variables())
            .context(SnapshotStatisticsSnafu)?;

        Ok((
            output,
            ReversibleResidual {
                activations,
                snapshot,
                train,
            },
        ))
    }

    fn backward(
        &self,
        residual: ReversibleResidual,
        dy: &Tensor,
        variables: &[Tensor],
    ) -> Result<ReversibleGradients, BoxedError> {
        let gradients = match &residual.activations {
            Activations::Recorded { input, output } => {
                self.autodiff_backward(input, output, dy, variables)
            }
            Activations::Reconstructible { y1, y2 } => {
                self.reconstructing_backward(y1, y2, dy, variables, residual.train)
            }
        };

        // Restore before propagating errors, so that a failed backward
        // pass does not leave updated statistics behind.
        let restored = residual
            .snapshot
            .restore()
            .context(RestoreStatisticsSnafu);

        let gradients = gradients?;
        restored?;
        Ok(gradients)
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device, Tensor, Var};
    use candle_nn::{VarBuilder, VarMap};
    use rstest::rstest;
    use snafu::{report, ResultExt, Whatever};

    use super::{CustomGradient, ReversibleLayer, ReversibleLayerConfig};
    use crate::blocks::reversible::{BottleneckResidualInnerConfig, ResidualInnerConfig};
    use crate::blocks::{Block, BlockConfig, BuildBlock};
    use crate::layers::data_format::{with_data_format, DataFormat};
    use crate::util::device::tests::test_devices;
    use crate::util::tests::{assert_tensor_eq, IntoLocalErr, PseudoRandom};

    fn statistics(layer: &ReversibleLayer) -> Vec<Tensor> {
        layer
            .non_trainable_variables()
            .iter()
            .map(|var| var.as_tensor().copy().unwrap())
            .collect()
    }

    fn residual_config(filters: usize) -> ReversibleLayerConfig {
        ReversibleLayerConfig::default()
            .f(ResidualInnerConfig::default().filters(filters))
            .g(ResidualInnerConfig::default().filters(filters))
    }

    fn bottleneck_config(filters: usize) -> ReversibleLayerConfig {
        ReversibleLayerConfig::default()
            .f(BottleneckResidualInnerConfig::default().filters(filters))
            .g(BottleneckResidualInnerConfig::default().filters(filters))
    }

    #[rstest]
    #[case(residual_config(4), &[2, 6, 6, 8], true)]
    #[case(residual_config(4), &[2, 6, 6, 8], false)]
    #[case(bottleneck_config(2), &[2, 5, 5, 16], true)]
    #[case(bottleneck_config(4), &[2, 8, 8, 32], false)]
    fn manual_gradients_match_autodiff(
        #[case] config: ReversibleLayerConfig,
        #[case] input_shape: &[usize],
        #[case] train: bool,
    ) {
        for device in test_devices(DType::F64) {
            check_gradients(&config, input_shape, train, &device);
        }
    }

    fn check_gradients(
        config: &ReversibleLayerConfig,
        input_shape: &[usize],
        train: bool,
        device: &Device,
    ) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F64, device);
        let manual = config.clone().build(vb.clone(), input_shape).unwrap();
        let autodiff = config.clone().manual_grads(false).build(vb, input_shape).unwrap();

        let xs = Tensor::pseudo_random(input_shape, 42, DType::F64, device).unwrap();
        let dy = Tensor::pseudo_random(input_shape, 43, DType::F64, device).unwrap();

        let (manual_ys, manual_residual) = manual.forward(&xs, train).unwrap();
        assert!(manual_residual.uses_reconstruction());
        let (autodiff_ys, autodiff_residual) = autodiff.forward(&xs, train).unwrap();
        assert!(!autodiff_residual.uses_reconstruction());
        assert_tensor_eq!(&manual_ys, &autodiff_ys, epsilon = 1e-12f64);

        // Request the variables in a different order than the layer
        // stores them.
        let mut variables = manual.trainable_variables();
        variables.reverse();

        let manual_grads = manual.backward(manual_residual, &dy, &variables).unwrap();
        let autodiff_grads = autodiff
            .backward(autodiff_residual, &dy, &variables)
            .unwrap();

        assert_eq!(manual_grads.input.dims(), input_shape);
        assert_tensor_eq!(
            &manual_grads.input,
            &autodiff_grads.input,
            epsilon = 1e-8f64,
            max_relative = 1e-4f64
        );
        assert_eq!(manual_grads.vars.len(), variables.len());
        for ((manual_grad, autodiff_grad), variable) in manual_grads
            .vars
            .iter()
            .zip(&autodiff_grads.vars)
            .zip(&variables)
        {
            assert_eq!(manual_grad.dims(), variable.dims());
            assert_tensor_eq!(
                manual_grad,
                autodiff_grad,
                epsilon = 1e-8f64,
                max_relative = 1e-4f64
            );
        }
    }

    #[test]
    #[report]
    fn backward_restores_statistics() -> Result<(), Whatever> {
        let device = Device::Cpu;
        let vb = VarBuilder::from_varmap(&VarMap::new(), DType::F64, &device);
        let layer = residual_config(4)
            .build(vb, &[2, 6, 6, 8])
            .into_local_err().whatever_context("Cannot build layer")?;
        let initial = statistics(&layer);

        let xs = Tensor::pseudo_random((2, 6, 6, 8), 7, DType::F64, &device)
            .whatever_context("Cannot create input")?;
        let (ys, residual) = layer
            .forward(&xs, true)
            .into_local_err().whatever_context("Cannot apply layer")?;
        let after_forward = statistics(&layer);
        assert!(initial
            .iter()
            .zip(&after_forward)
            .any(|(initial, updated)| initial
                .sub(updated)
                .and_then(|diff| diff.abs()?.sum_all()?.to_scalar::<f64>())
                .unwrap()
                > 0.));

        let dy = ys.ones_like().whatever_context("Cannot create gradient")?;
        layer
            .backward(residual, &dy, &layer.trainable_variables())
            .into_local_err().whatever_context("Cannot compute gradients")?;

        for (expected, actual) in after_forward.iter().zip(statistics(&layer)) {
            assert_tensor_eq!(expected, &actual, epsilon = 0f64);
        }

        Ok(())
    }

    #[test]
    fn unknown_variable_is_rejected_and_statistics_restored() {
        let device = Device::Cpu;
        let vb = VarBuilder::from_varmap(&VarMap::new(), DType::F64, &device);
        let layer = residual_config(4).build(vb, &[2, 6, 6, 8]).unwrap();

        let xs = Tensor::pseudo_random((2, 6, 6, 8), 8, DType::F64, &device).unwrap();
        let (ys, residual) = layer.forward(&xs, true).unwrap();
        let after_forward = statistics(&layer);

        let mut variables = layer.trainable_variables();
        variables.insert(1, Tensor::zeros(3, DType::F64, &device).unwrap());
        let err = layer
            .backward(residual, &ys.ones_like().unwrap(), &variables)
            .err()
            .unwrap();
        assert_eq!(
            err.to_string(),
            "Variable at position 1 is not a trainable variable of the layer"
        );

        for (expected, actual) in after_forward.iter().zip(statistics(&layer)) {
            assert_tensor_eq!(expected, &actual, epsilon = 0f64);
        }
    }

    #[test]
    fn channel_expansion_falls_back_to_autodiff() {
        let device = Device::Cpu;
        let vb = VarBuilder::from_varmap(&VarMap::new(), DType::F64, &device);
        let layer = bottleneck_config(16).build(vb, &[2, 8, 8, 32]).unwrap();

        let xs = Tensor::pseudo_random((2, 8, 8, 32), 9, DType::F64, &device).unwrap();
        let (ys, residual) = layer.forward(&xs, false).unwrap();
        assert_eq!(ys.dims(), &[2, 8, 8, 128]);
        assert!(!residual.uses_reconstruction());

        let dy = Tensor::pseudo_random((2, 8, 8, 128), 10, DType::F64, &device).unwrap();
        let variables = layer.trainable_variables();
        let grads = layer.backward(residual, &dy, &variables).unwrap();
        assert_eq!(grads.input.dims(), &[2, 8, 8, 32]);
        assert_eq!(grads.vars.len(), variables.len());

        // Gradients of the plain forward pass on the same variables.
        let input = Var::from_tensor(&xs).unwrap();
        let plain_ys = layer.forward_t(input.as_tensor(), false).unwrap();
        let plain_grads = (plain_ys * &dy)
            .unwrap()
            .sum_all()
            .unwrap()
            .backward()
            .unwrap();
        assert_tensor_eq!(
            &grads.input,
            plain_grads.get(input.as_tensor()).unwrap(),
            epsilon = 1e-10f64
        );
        for (grad, variable) in grads.vars.iter().zip(&variables) {
            assert_tensor_eq!(grad, plain_grads.get(variable).unwrap(), epsilon = 1e-10f64);
        }
    }

    #[test]
    fn plain_forward_matches_custom_forward() {
        let device = Device::Cpu;
        let vb = VarBuilder::from_varmap(&VarMap::new(), DType::F32, &device);
        let layer = with_data_format(DataFormat::ChannelsFirst, || {
            residual_config(2).build(vb, &[1, 4, 5, 5])
        })
        .unwrap();

        let xs = Tensor::pseudo_random((1, 4, 5, 5), 10, DType::F32, &device).unwrap();
        let ys = layer.forward_t(&xs, false).unwrap();
        let (custom_ys, residual) = CustomGradient::forward(&layer, &xs, false).unwrap();
        assert!(residual.uses_reconstruction());
        assert_tensor_eq!(ys, custom_ys, epsilon = 1e-6f32);
    }

    #[test]
    fn strided_functions_cannot_be_added() {
        let device = Device::Cpu;
        let vb = VarBuilder::from_varmap(&VarMap::new(), DType::F32, &device);
        let layer = ReversibleLayerConfig::default()
            .f(ResidualInnerConfig::default().filters(4).strides(2))
            .g(ResidualInnerConfig::default().filters(4).strides(2))
            .build(vb, &[2, 8, 8, 8])
            .unwrap();

        let xs = Tensor::pseudo_random((2, 8, 8, 8), 11, DType::F32, &device).unwrap();
        assert!(layer.forward_t(&xs, false).is_err());
        assert!(CustomGradient::forward(&layer, &xs, false).is_err());
    }

    #[test]
    fn invalid_pairs_are_rejected() {
        let device = Device::Cpu;
        let vb = VarBuilder::from_varmap(&VarMap::new(), DType::F32, &device);

        let err = ReversibleLayerConfig::default()
            .f(ResidualInnerConfig::default().strides(2))
            .build(vb.clone(), &[2, 8, 8, 8])
            .err()
            .unwrap();
        assert_eq!(
            err.to_string(),
            "Residual functions must have the same strides, got 2 (F) and 1 (G)"
        );

        let err = residual_config(4)
            .build(vb, &[2, 8, 8, 7])
            .err()
            .unwrap();
        assert_eq!(
            err.to_string(),
            "Reversible layer requires an even number of channels, got 7"
        );
    }

    #[test]
    fn reversible_config_roundtrips() {
        let config = bottleneck_config(4).manual_grads(false);
        let exported = config.to_config().unwrap();
        assert_eq!(exported["f"]["class_name"], "bottleneck_residual");
        assert_eq!(exported["manual_grads"], false);
        assert_eq!(ReversibleLayerConfig::from_config(exported).unwrap(), config);
    }
}
