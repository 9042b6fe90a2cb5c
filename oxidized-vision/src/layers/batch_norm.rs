use candle_core::{ModuleT, Tensor, Var};
use candle_nn::{Init, VarBuilder};
use snafu::{ResultExt, Snafu};

/// Batch normalization configuration.
#[derive(Clone, Debug)]
pub struct BatchNormConfig {
    pub epsilon: f64,
    pub momentum: f64,
    pub size: usize,
    pub synchronized: bool,
    pub trainable: bool,
}

impl BatchNormConfig {
    /// Epsilon added to the variance.
    ///
    /// Default: `0.001`
    pub fn epsilon(mut self, epsilon: f64) -> Self {
        self.epsilon = epsilon;
        self
    }

    /// Momentum of the moving averages.
    ///
    /// The moving statistics are updated as
    /// `moving = moving * momentum + batch * (1 - momentum)`.
    ///
    /// Default: `0.99`
    pub fn momentum(mut self, momentum: f64) -> Self {
        self.momentum = momentum;
        self
    }

    /// Number of channels.
    ///
    /// Default: `1`
    pub fn size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    /// Request statistics synchronized across devices.
    ///
    /// Blocks are executed on a single device, so statistics are always
    /// computed over the local batch. The option is kept so that
    /// configurations round-trip.
    ///
    /// Default: `false`
    pub fn synchronized(mut self, synchronized: bool) -> Self {
        self.synchronized = synchronized;
        self
    }

    /// Whether the scale and offset are trainable.
    ///
    /// A non-trainable batch normalization always normalizes with the
    /// moving statistics and does not update them.
    ///
    /// Default: `true`
    pub fn trainable(mut self, trainable: bool) -> Self {
        self.trainable = trainable;
        self
    }

    /// Build the batch normalization layer.
    pub fn build(&self, vb: VarBuilder) -> Result<BatchNorm, BatchNormError> {
        if self.synchronized {
            tracing::debug!("synchronized batch normalization uses local batch statistics");
        }

        let mut weight = vb
            .get_with_hints(self.size, "gamma", Init::Const(1.))
            .context(ConstructionSnafu)?;
        let mut bias = vb
            .get_with_hints(self.size, "beta", Init::Const(0.))
            .context(ConstructionSnafu)?;
        if !self.trainable {
            weight = weight.detach();
            bias = bias.detach();
        }

        Ok(BatchNorm {
            bias,
            epsilon: self.epsilon,
            momentum: self.momentum,
            moving_mean: Var::zeros(self.size, vb.dtype(), vb.device())
                .context(ConstructionSnafu)?,
            moving_variance: Var::ones(self.size, vb.dtype(), vb.device())
                .context(ConstructionSnafu)?,
            trainable: self.trainable,
            weight,
        })
    }
}

impl Default for BatchNormConfig {
    fn default() -> Self {
        Self {
            epsilon: 0.001,
            momentum: 0.99,
            size: 1,
            synchronized: false,
            trainable: true,
        }
    }
}

/// Batch normalization errors.
#[derive(Debug, Snafu)]
pub enum BatchNormError {
    #[snafu(display("Cannot construct batch normalization"))]
    Construction { source: candle_core::Error },
}

/// Batch normalization over the channel axis of channels-first feature maps.
///
/// See [Ioffe and Szegedy, 2015](https://arxiv.org/abs/1502.03167).
///
/// The moving mean and variance are non-trainable variables that are
/// updated on every training-mode call. They are not part of the
/// variable map, so that optimizers do not treat them as parameters.
#[derive(Clone, Debug)]
pub struct BatchNorm {
    bias: Tensor,
    epsilon: f64,
    momentum: f64,
    moving_mean: Var,
    moving_variance: Var,
    trainable: bool,
    weight: Tensor,
}

impl BatchNorm {
    /// Trainable variables: the scale followed by the offset.
    pub fn trainable_variables(&self) -> Vec<Tensor> {
        if self.trainable {
            vec![self.weight.clone(), self.bias.clone()]
        } else {
            Vec::new()
        }
    }

    /// Non-trainable variables: the moving mean followed by the moving
    /// variance.
    pub fn non_trainable_variables(&self) -> Vec<Var> {
        vec![self.moving_mean.clone(), self.moving_variance.clone()]
    }

    fn channel_view(xs: &Tensor) -> candle_core::Result<Tensor> {
        xs.reshape((1, (), 1, 1))
    }

    fn update_moving(&self, moving: &Var, batch: &Tensor) -> candle_core::Result<()> {
        let batch = batch
            .detach()
            .flatten_all()?
            .to_dtype(moving.dtype())?
            .affine(1. - self.momentum, 0.)?;
        let updated = (moving.as_tensor().affine(self.momentum, 0.)? + batch)?;
        moving.set(&updated)
    }
}

impl ModuleT for BatchNorm {
    /// Normalize a feature map.
    ///
    /// * `xs` - Feature map.
    ///   *Shape:* `(batch_size, channels, height, width)`
    /// * `train` - Normalize with batch statistics and update the moving
    ///   statistics.
    fn forward_t(&self, xs: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        let (mean, variance) = if train && self.trainable {
            let mean = xs.mean_keepdim((0, 2, 3))?;
            let variance = xs.broadcast_sub(&mean)?.sqr()?.mean_keepdim((0, 2, 3))?;
            self.update_moving(&self.moving_mean, &mean)?;
            self.update_moving(&self.moving_variance, &variance)?;
            (mean, variance)
        } else {
            (
                Self::channel_view(&self.moving_mean.as_tensor().to_dtype(xs.dtype())?)?,
                Self::channel_view(&self.moving_variance.as_tensor().to_dtype(xs.dtype())?)?,
            )
        };

        let weight = Self::channel_view(&self.weight.to_dtype(xs.dtype())?)?;
        let bias = Self::channel_view(&self.bias.to_dtype(xs.dtype())?)?;

        xs.broadcast_sub(&mean)?
            .broadcast_div(&variance.affine(1., self.epsilon)?.sqrt()?)?
            .broadcast_mul(&weight)?
            .broadcast_add(&bias)
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device, ModuleT, Tensor};
    use candle_nn::{VarBuilder, VarMap};
    use ndarray::array;
    use snafu::{report, ResultExt, Whatever};

    use super::BatchNormConfig;
    use crate::util::tests::{assert_tensor_eq, PseudoRandom};

    #[test]
    #[report]
    fn batch_norm_normalizes_and_updates_moving_statistics() -> Result<(), Whatever> {
        let device = Device::Cpu;
        let vb = VarBuilder::from_varmap(&VarMap::new(), DType::F64, &device);
        let batch_norm = BatchNormConfig::default()
            .size(2)
            .momentum(0.9)
            .build(vb)
            .whatever_context("Cannot build batch norm")?;

        let xs = Tensor::new(&[1f64, 3., 5., 7.], &device)
            .and_then(|xs| xs.reshape((2, 2, 1, 1)))
            .whatever_context("Cannot create input")?;

        let ys = batch_norm
            .forward_t(&xs, true)
            .whatever_context("Cannot apply batch norm")?;
        // Channel 0: [1, 5], channel 1: [3, 7], both with mean +-2.
        let expected = 2. / (4f64 + 0.001).sqrt();
        assert_tensor_eq!(
            ys.flatten_all().whatever_context("Cannot flatten")?,
            array![-expected, -expected, expected, expected],
            epsilon = 1e-9
        );

        let moving = batch_norm.non_trainable_variables();
        assert_tensor_eq!(moving[0].as_tensor(), array![0.3f64, 0.5], epsilon = 1e-9);
        assert_tensor_eq!(moving[1].as_tensor(), array![1.3f64, 1.3], epsilon = 1e-9);

        Ok(())
    }

    #[test]
    #[report]
    fn inference_does_not_update_moving_statistics() -> Result<(), Whatever> {
        let device = Device::Cpu;
        let vb = VarBuilder::from_varmap(&VarMap::new(), DType::F64, &device);
        let batch_norm = BatchNormConfig::default()
            .size(3)
            .build(vb)
            .whatever_context("Cannot build batch norm")?;
        let xs = Tensor::pseudo_random((2, 3, 4, 4), 3, DType::F64, &device)
            .whatever_context("Cannot create input")?;

        let ys = batch_norm
            .forward_t(&xs, false)
            .whatever_context("Cannot apply batch norm")?;
        assert_tensor_eq!(
            ys,
            (&xs / (1f64 + 0.001).sqrt()).whatever_context("Cannot scale input")?,
            epsilon = 1e-12
        );

        let moving = batch_norm.non_trainable_variables();
        assert_tensor_eq!(moving[0].as_tensor(), array![0f64, 0., 0.], epsilon = 0.);
        assert_tensor_eq!(moving[1].as_tensor(), array![1f64, 1., 1.], epsilon = 0.);

        Ok(())
    }

    #[test]
    fn non_trainable_batch_norm_has_no_trainable_variables() {
        let vb = VarBuilder::from_varmap(&VarMap::new(), DType::F32, &Device::Cpu);
        let batch_norm = BatchNormConfig::default()
            .size(4)
            .trainable(false)
            .build(vb)
            .unwrap();
        assert!(batch_norm.trainable_variables().is_empty());
        assert_eq!(batch_norm.non_trainable_variables().len(), 2);
    }
}
