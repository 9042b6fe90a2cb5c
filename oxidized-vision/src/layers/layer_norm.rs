use candle_core::ModuleT;
use candle_nn::{layer_norm, LayerNormConfig as CandleLayerNormConfig, VarBuilder};

use crate::error::BoxedError;
use crate::layers::build_module::BuildModule;

/// Layer normalization over the last (channel) axis of transformer
/// representations.
///
/// The module has a learned scale (`weight`) and shift (`bias`).
#[derive(Clone, Debug, PartialEq)]
pub struct LayerNormConfig {
    eps: f64,
    width: usize,
}

impl LayerNormConfig {
    /// Epsilon added to the variance.
    ///
    /// Default: `1e-12`
    pub fn eps(mut self, eps: f64) -> Self {
        self.eps = eps;
        self
    }

    /// Width of the normalized representations.
    ///
    /// Default: `768`
    pub fn width(mut self, width: usize) -> Self {
        self.width = width;
        self
    }
}

impl Default for LayerNormConfig {
    fn default() -> Self {
        Self {
            eps: 1e-12,
            width: 768,
        }
    }
}

impl BuildModule for LayerNormConfig {
    fn build(&self, vb: VarBuilder) -> Result<Box<dyn ModuleT>, BoxedError> {
        Ok(Box::new(layer_norm(
            self.width,
            CandleLayerNormConfig {
                affine: true,
                eps: self.eps,
                remove_mean: true,
            },
            vb,
        )?))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use candle_core::{DType, Device, ModuleT, Tensor, D};
    use candle_nn::VarBuilder;

    use super::LayerNormConfig;
    use crate::layers::build_module::BuildModule;
    use crate::util::tests::{assert_tensor_eq, PseudoRandom};

    #[test]
    fn layer_norm_standardizes_channels() {
        let device = Device::Cpu;
        let params = HashMap::from([
            (
                "weight".to_string(),
                Tensor::ones(8, DType::F32, &device).unwrap(),
            ),
            (
                "bias".to_string(),
                Tensor::zeros(8, DType::F32, &device).unwrap(),
            ),
        ]);
        let norm = LayerNormConfig::default()
            .eps(1e-6)
            .width(8)
            .build(VarBuilder::from_tensors(params, DType::F32, &device))
            .unwrap();

        let xs = Tensor::pseudo_random((2, 3, 8), 0, DType::F32, &device).unwrap();
        let ys = norm.forward_t(&xs, false).unwrap();
        assert_eq!(ys.dims(), &[2, 3, 8]);
        assert_tensor_eq!(
            ys.mean_keepdim(D::Minus1).unwrap(),
            Tensor::zeros((2, 3, 1), DType::F32, &device).unwrap(),
            epsilon = 1e-5f32
        );
        assert_tensor_eq!(
            ys.sqr().unwrap().mean_keepdim(D::Minus1).unwrap(),
            Tensor::ones((2, 3, 1), DType::F32, &device).unwrap(),
            epsilon = 1e-3f32
        );
    }
}
