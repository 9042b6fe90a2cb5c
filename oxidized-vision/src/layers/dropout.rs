use candle_core::ModuleT;
use candle_nn::{Dropout, VarBuilder};

use crate::error::BoxedError;
use crate::layers::build_module::BuildModule;
use crate::layers::identity::Identity;

/// Dropout configuration.
#[derive(Clone, Debug)]
pub struct DropoutConfig {
    p: f32,
}

impl DropoutConfig {
    /// Dropout probability.
    ///
    /// A probability of zero builds an identity module.
    ///
    /// Default: `0.0`
    pub fn p(mut self, p: f32) -> Self {
        self.p = p;
        self
    }
}

impl Default for DropoutConfig {
    fn default() -> Self {
        Self { p: 0.0 }
    }
}

impl BuildModule for DropoutConfig {
    fn build(&self, _vb: VarBuilder) -> Result<Box<dyn ModuleT>, BoxedError> {
        if self.p == 0.0 {
            Ok(Box::new(Identity))
        } else {
            Ok(Box::new(Dropout::new(self.p)))
        }
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device, Tensor};
    use candle_nn::VarBuilder;

    use super::DropoutConfig;
    use crate::layers::build_module::BuildModule;
    use crate::util::tests::assert_tensor_eq;

    #[test]
    fn dropout_is_identity_during_inference() {
        let device = Device::Cpu;
        let dropout = DropoutConfig::default()
            .p(0.5)
            .build(VarBuilder::zeros(DType::F32, &device))
            .unwrap();
        let xs = Tensor::ones((2, 3), DType::F32, &device).unwrap();
        assert_tensor_eq!(dropout.forward_t(&xs, false).unwrap(), &xs, epsilon = 0f32);
    }
}
