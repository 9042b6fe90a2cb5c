use candle_core::{Module, ModuleT, Tensor};
use candle_nn::{linear, Linear, VarBuilder};

use crate::layers::activation::Activation;

/// Point-wise feed-forward layer (_Vaswani et al., 2017_).
///
/// This layer is applied pointwise, meaning that the same
/// transformation is applied to each sequence element. This
/// transformation is:
///
/// `g(xW_1 + b_1)W_2 + b_2`
///
/// `W_1` and `b_1` transform the input to an
/// intermediate width, `g` is a non-linear activation
/// function and `W_2` and `b_2` transform the
/// output of the activation back to the input width.
///
/// Dropout is applied to the activations of the intermediate layer
/// and to the output.
///
/// * _Vaswani et al., 2017_: https://arxiv.org/abs/1706.03762
pub struct PointwiseFeedForward {
    activation: Activation,
    inner_dropout: Box<dyn ModuleT>,
    intermediate: Linear,
    output: Linear,
    output_dropout: Box<dyn ModuleT>,
}

impl PointwiseFeedForward {
    /// Construct a point-wise feed-forward layer.
    ///
    /// * `vb` - Variable store.
    /// * `activation` - Non-linearity.
    /// * `hidden_width` - Hidden width, dimensionality of the layer input and output.
    /// * `inner_dropout` - Dropout applied to the intermediate activations.
    /// * `intermediate_width` - Intermediate width inside the feed-forward layer.
    /// * `output_dropout` - Dropout applied to the output of the layer.
    pub fn new(
        vb: VarBuilder,
        activation: Activation,
        hidden_width: usize,
        inner_dropout: Box<dyn ModuleT>,
        intermediate_width: usize,
        output_dropout: Box<dyn ModuleT>,
    ) -> Result<Self, candle_core::Error> {
        let intermediate = linear(
            hidden_width,
            intermediate_width,
            vb.push_prefix("intermediate"),
        )?;
        let output = linear(intermediate_width, hidden_width, vb.push_prefix("output"))?;

        Ok(Self {
            activation,
            inner_dropout,
            intermediate,
            output,
            output_dropout,
        })
    }
}

impl ModuleT for PointwiseFeedForward {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor, candle_core::Error> {
        let xs = self
            .activation
            .forward(&self.intermediate.forward(xs)?)?;
        let xs = self.inner_dropout.forward_t(&xs, train)?;
        let xs = self.output.forward(&xs)?;
        self.output_dropout.forward_t(&xs, train)
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device, ModuleT, Tensor};
    use candle_nn::{VarBuilder, VarMap};

    use super::PointwiseFeedForward;
    use crate::layers::activation::Activation;
    use crate::layers::identity::Identity;

    #[test]
    fn feed_forward_keeps_hidden_width() {
        let device = Device::Cpu;
        let vb = VarBuilder::from_varmap(&VarMap::new(), DType::F32, &device);
        let feed_forward = PointwiseFeedForward::new(
            vb,
            Activation::Gelu,
            8,
            Box::new(Identity),
            32,
            Box::new(Identity),
        )
        .unwrap();
        let xs = Tensor::zeros((2, 3, 8), DType::F32, &device).unwrap();
        assert_eq!(feed_forward.forward_t(&xs, true).unwrap().dims(), &[2, 3, 8]);
    }
}
