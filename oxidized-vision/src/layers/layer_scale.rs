use candle_core::{DType, ModuleT, Tensor};
use candle_nn::{Init, VarBuilder};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use crate::error::BoxedError;
use crate::layers::build_module::BuildModule;
use crate::layers::identity::Identity;

/// Layer scale configuration.
///
/// Builds an [`Identity`] module when the initial value is zero.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct LayerScaleConfig {
    init_value: f64,
    width: usize,
}

impl LayerScaleConfig {
    /// Initial value of every scale.
    ///
    /// Default: `0.0`
    pub fn init_value(mut self, init_value: f64) -> Self {
        self.init_value = init_value;
        self
    }

    /// Width of the representations that are scaled.
    ///
    /// Default: `768`
    pub fn width(mut self, width: usize) -> Self {
        self.width = width;
        self
    }
}

impl Default for LayerScaleConfig {
    fn default() -> Self {
        Self {
            init_value: 0.0,
            width: 768,
        }
    }
}

impl BuildModule for LayerScaleConfig {
    fn build(&self, vb: VarBuilder) -> Result<Box<dyn ModuleT>, BoxedError> {
        if self.init_value == 0. {
            return Ok(Box::new(Identity));
        }

        let gamma = vb
            .get_with_hints((1, 1, self.width), "gamma", Init::Const(self.init_value))
            .context(ConstructionSnafu)?;
        Ok(Box::new(LayerScale { gamma }))
    }
}

/// Layer scale errors.
#[derive(Debug, Snafu)]
pub enum LayerScaleError {
    #[snafu(display("Cannot construct layer scale"))]
    Construction { source: candle_core::Error },
}

/// Layer scale.
///
/// See [Touvron et al., 2021](https://arxiv.org/abs/2103.17239).
///
/// Multiplies every channel of a sublayer output with a learned scale.
/// The multiplication is done in single precision and the result is
/// converted back to the input data type.
#[derive(Clone, Debug)]
pub struct LayerScale {
    gamma: Tensor,
}

impl ModuleT for LayerScale {
    /// Scale a sublayer output.
    ///
    /// * `xs` - Sublayer output.
    ///   *Shape:* `(batch_size, seq_len, width)`
    fn forward_t(&self, xs: &Tensor, _train: bool) -> candle_core::Result<Tensor> {
        xs.to_dtype(DType::F32)?
            .broadcast_mul(&self.gamma.to_dtype(DType::F32)?)?
            .to_dtype(xs.dtype())
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device, ModuleT, Tensor};
    use candle_nn::{VarBuilder, VarMap};
    use snafu::{report, ResultExt, Whatever};

    use super::LayerScaleConfig;
    use crate::layers::build_module::BuildModule;
    use crate::util::tests::{assert_tensor_eq, IntoLocalErr, PseudoRandom};

    #[test]
    #[report]
    fn layer_scale_scales_channels() -> Result<(), Whatever> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let layer_scale = LayerScaleConfig::default()
            .init_value(0.1)
            .width(4)
            .build(vb)
            .into_local_err().whatever_context("Cannot build layer scale")?;

        let data = varmap.data().lock().unwrap();
        assert_eq!(data["gamma"].dims(), &[1, 1, 4]);
        drop(data);

        let xs = Tensor::pseudo_random((2, 3, 4), 5, DType::F32, &device)
            .whatever_context("Cannot create input")?;
        let ys = layer_scale
            .forward_t(&xs, false)
            .whatever_context("Cannot apply layer scale")?;
        assert_tensor_eq!(
            ys,
            (&xs * 0.1).whatever_context("Cannot scale input")?,
            epsilon = 1e-6f32
        );

        Ok(())
    }

    #[test]
    fn zero_init_value_builds_identity() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let layer_scale = LayerScaleConfig::default()
            .width(4)
            .build(VarBuilder::from_varmap(&varmap, DType::F64, &device))
            .unwrap();
        assert!(varmap.all_vars().is_empty());

        let xs = Tensor::pseudo_random((1, 2, 4), 2, DType::F64, &device).unwrap();
        assert_tensor_eq!(
            layer_scale.forward_t(&xs, true).unwrap(),
            &xs,
            epsilon = 0f64
        );
    }
}
