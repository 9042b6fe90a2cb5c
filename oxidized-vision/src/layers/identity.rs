use candle_core::{Module, Tensor};

/// Identity module.
///
/// Disabled optional stages (dropout, stochastic depth, layer scale,
/// squeeze-and-excitation) are replaced by this module, so that blocks
/// can apply every stage unconditionally.
#[derive(Clone, Copy, Debug, Default)]
pub struct Identity;

impl Module for Identity {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        Ok(xs.clone())
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device, ModuleT, Tensor};

    use super::Identity;
    use crate::util::tests::{assert_tensor_eq, PseudoRandom};

    #[test]
    fn identity_ignores_train_flag() {
        let xs = Tensor::pseudo_random((2, 4, 4, 3), 0, DType::F32, &Device::Cpu).unwrap();
        for train in [false, true] {
            let ys = Identity.forward_t(&xs, train).unwrap();
            assert_eq!(ys.id(), xs.id());
            assert_tensor_eq!(&ys, &xs, epsilon = 0f32);
        }
    }
}
