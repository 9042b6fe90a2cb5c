use candle_core::{ModuleT, Tensor};
use candle_nn::VarBuilder;
use serde::{Deserialize, Serialize};

use crate::error::BoxedError;
use crate::layers::build_module::BuildModule;
use crate::layers::identity::Identity;

/// Stochastic depth configuration.
///
/// Builds an [`Identity`] module when no drop rate is set or the drop
/// rate is zero.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StochasticDepthConfig {
    drop_rate: Option<f64>,
}

impl StochasticDepthConfig {
    /// Probability of dropping a residual branch.
    ///
    /// Default: `None`
    pub fn drop_rate(mut self, drop_rate: Option<f64>) -> Self {
        self.drop_rate = drop_rate;
        self
    }

    /// Whether the built module drops branches.
    pub fn is_enabled(&self) -> bool {
        matches!(self.drop_rate, Some(drop_rate) if drop_rate != 0.)
    }
}

impl BuildModule for StochasticDepthConfig {
    fn build(&self, _vb: VarBuilder) -> Result<Box<dyn ModuleT>, BoxedError> {
        match self.drop_rate {
            Some(drop_rate) if drop_rate != 0. => Ok(Box::new(StochasticDepth { drop_rate })),
            _ => Ok(Box::new(Identity)),
        }
    }
}

/// Stochastic depth.
///
/// See [Huang et al., 2016](https://arxiv.org/abs/1603.09382).
///
/// During training, the residual branch of every sample is dropped with
/// probability `drop_rate`. Branches that are kept are scaled by
/// `1 / (1 - drop_rate)`. During inference, the branch is passed through
/// unchanged.
#[derive(Clone, Debug)]
pub struct StochasticDepth {
    drop_rate: f64,
}

impl ModuleT for StochasticDepth {
    /// Apply stochastic depth to a residual branch.
    ///
    /// * `xs` - Residual branch output, batch-major.
    ///   *Shape:* `(batch_size, ...)`
    fn forward_t(&self, xs: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        if !train || self.drop_rate == 0. {
            return Ok(xs.clone());
        }

        let keep_prob = 1. - self.drop_rate;
        let mut mask_shape = vec![1; xs.rank()];
        mask_shape[0] = xs.dim(0)?;

        let mask = Tensor::rand(0f32, 1f32, mask_shape, xs.device())?
            .ge(self.drop_rate)?
            .to_dtype(xs.dtype())?;

        xs.broadcast_mul(&mask)?.affine(1. / keep_prob, 0.)
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device, ModuleT, Tensor};
    use candle_nn::VarBuilder;
    use rstest::rstest;
    use snafu::{report, ResultExt, Whatever};

    use super::StochasticDepthConfig;
    use crate::layers::build_module::BuildModule;
    use crate::util::tests::{assert_tensor_eq, IntoLocalErr, PseudoRandom};

    #[rstest]
    #[case(None, true)]
    #[case(Some(0.), true)]
    #[case(Some(0.), false)]
    #[case(Some(0.5), false)]
    #[case(Some(1.), false)]
    fn stochastic_depth_is_identity(#[case] drop_rate: Option<f64>, #[case] train: bool) {
        let device = Device::Cpu;
        let stochastic_depth = StochasticDepthConfig::default()
            .drop_rate(drop_rate)
            .build(VarBuilder::zeros(DType::F32, &device))
            .unwrap();
        let xs = Tensor::pseudo_random((4, 3, 3, 2), 7, DType::F32, &device).unwrap();
        let ys = stochastic_depth.forward_t(&xs, train).unwrap();
        assert_tensor_eq!(ys, &xs, epsilon = 0f32);
    }

    #[test]
    #[report]
    fn stochastic_depth_drops_or_scales_samples() -> Result<(), Whatever> {
        let device = Device::Cpu;
        let stochastic_depth = StochasticDepthConfig::default()
            .drop_rate(Some(0.5))
            .build(VarBuilder::zeros(DType::F32, &device))
            .into_local_err().whatever_context("Cannot build stochastic depth")?;
        let xs = Tensor::ones((64, 2, 2, 3), DType::F32, &device)
            .whatever_context("Cannot create input")?;
        let ys = stochastic_depth
            .forward_t(&xs, true)
            .whatever_context("Cannot apply stochastic depth")?;

        let ys = ys
            .reshape((64, 12))
            .and_then(|ys| ys.to_vec2::<f32>())
            .whatever_context("Cannot convert output")?;
        for sample in ys {
            let first = sample[0];
            assert!(first == 0. || (first - 2.).abs() < 1e-6);
            assert!(sample.iter().all(|&v| v == first));
        }

        Ok(())
    }
}
