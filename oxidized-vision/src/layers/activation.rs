use std::str::FromStr;

use candle_core::{Module, ModuleT, Tensor};
use candle_nn::VarBuilder;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use crate::error::BoxedError;
use crate::layers::build_module::BuildModule;

/// Activation functions.
///
/// Activations are identified by their snake-case name in configurations,
/// e.g. `"relu"` or `"hard_swish"`. Unknown names are rejected when a
/// configuration is parsed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    /// Gausian Error Linear Unit.
    ///
    /// See [Hendrycks and Gimpel, 2016](https://arxiv.org/abs/1606.08415).
    Gelu,

    /// Gausian Error Linear Unit approximation.
    ///
    /// See [Hendrycks and Gimpel, 2016](https://arxiv.org/abs/1606.08415).
    GeluNew,

    /// Hard sigmoid, `relu6(x + 3) / 6`.
    HardSigmoid,

    /// Hard swish, `x * relu6(x + 3) / 6`.
    ///
    /// See [Howard et al., 2019](https://arxiv.org/abs/1905.02244).
    HardSwish,

    /// Identity.
    #[serde(alias = "identity")]
    Linear,

    /// Rectified Linear Unit.
    ///
    /// See [Fukushima, 1969](https://ieeexplore.ieee.org/document/4082265).
    #[default]
    Relu,

    /// Rectified Linear Unit capped at 6.
    Relu6,

    /// Logistic sigmoid.
    Sigmoid,

    /// Sigmoid Linear Unit.
    ///
    /// See [Hendrycks and Gimpel, 2016](https://arxiv.org/abs/1606.08415).
    Silu,

    /// Swish, `x * sigmoid(x)`.
    ///
    /// See [Ramachandran et al., 2017](https://arxiv.org/abs/1710.05941).
    Swish,

    /// Hyperbolic tangent.
    Tanh,
}

/// Activation errors.
#[derive(Debug, Snafu)]
pub enum ActivationError {
    #[snafu(display("Unknown activation function: {name}"))]
    UnknownActivation {
        source: serde_json::Error,
        name: String,
    },
}

impl FromStr for Activation {
    type Err = ActivationError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(serde_json::Value::String(name.to_owned()))
            .context(UnknownActivationSnafu { name })
    }
}

impl Module for Activation {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        use Activation::*;
        match self {
            Gelu => xs.gelu_erf(),
            GeluNew => xs.gelu(),
            HardSigmoid => hard_sigmoid(xs),
            HardSwish => xs.mul(&hard_sigmoid(xs)?),
            Linear => Ok(xs.clone()),
            Relu => xs.relu(),
            Relu6 => relu6(xs),
            Sigmoid => sigmoid(xs),
            Silu | Swish => xs.mul(&sigmoid(xs)?),
            Tanh => xs.tanh(),
        }
    }
}

impl BuildModule for Activation {
    fn build(&self, _vb: VarBuilder) -> Result<Box<dyn ModuleT>, BoxedError> {
        Ok(Box::new(*self))
    }
}

// The activations below are composed from primitive ops, so that they
// are differentiable by candle's backprop.

fn relu6(xs: &Tensor) -> candle_core::Result<Tensor> {
    xs.relu()? - xs.affine(1.0, -6.0)?.relu()?
}

fn hard_sigmoid(xs: &Tensor) -> candle_core::Result<Tensor> {
    relu6(&xs.affine(1.0, 3.0)?)?.affine(1.0 / 6.0, 0.0)
}

fn sigmoid(xs: &Tensor) -> candle_core::Result<Tensor> {
    xs.neg()?.exp()?.affine(1.0, 1.0)?.recip()
}

#[cfg(test)]
mod tests {
    use candle_core::{Device, Module, Tensor};
    use ndarray::array;
    use rstest::rstest;
    use snafu::{report, ResultExt, Whatever};

    use super::Activation;
    use crate::util::tests::assert_tensor_eq;

    #[rstest]
    #[case("relu", Activation::Relu)]
    #[case("relu6", Activation::Relu6)]
    #[case("hard_swish", Activation::HardSwish)]
    #[case("identity", Activation::Linear)]
    #[case("swish", Activation::Swish)]
    fn activation_parses_from_name(#[case] name: &str, #[case] expected: Activation) {
        assert_eq!(name.parse::<Activation>().unwrap(), expected);
    }

    #[test]
    fn unknown_activation_is_rejected() {
        assert!("leaky_tanh".parse::<Activation>().is_err());
    }

    #[test]
    #[report]
    fn activations_have_correct_output() -> Result<(), Whatever> {
        let xs = Tensor::new(&[-4f64, -1.0, 0.0, 1.0, 7.0], &Device::Cpu)
            .whatever_context("Cannot create input")?;

        let relu6 = Activation::Relu6
            .forward(&xs)
            .whatever_context("Cannot apply relu6")?;
        assert_tensor_eq!(relu6, array![0f64, 0.0, 0.0, 1.0, 6.0], epsilon = 1e-12);

        let hard_sigmoid = Activation::HardSigmoid
            .forward(&xs)
            .whatever_context("Cannot apply hard sigmoid")?;
        assert_tensor_eq!(
            hard_sigmoid,
            array![0f64, 2.0 / 6.0, 0.5, 4.0 / 6.0, 1.0],
            epsilon = 1e-12
        );

        let sigmoid = Activation::Sigmoid
            .forward(&xs)
            .whatever_context("Cannot apply sigmoid")?;
        assert_tensor_eq!(
            sigmoid,
            array![0.017986f64, 0.268941, 0.5, 0.731059, 0.999089],
            epsilon = 1e-6
        );

        Ok(())
    }
}
