use candle_nn::Init;
use serde::{Deserialize, Serialize};

/// Initializers for convolution kernels.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
#[serde(rename_all = "snake_case")]
pub enum KernelInitializer {
    /// Glorot/Xavier uniform initialization.
    ///
    /// See [Glorot and Bengio, 2010](https://proceedings.mlr.press/v9/glorot10a.html).
    GlorotUniform,

    /// He normal initialization.
    ///
    /// See [He et al., 2015](https://arxiv.org/abs/1502.01852).
    HeNormal,

    /// All ones.
    Ones,

    /// Normal distribution with variance `1 / fan_in`.
    #[default]
    VarianceScaling,

    /// All zeros.
    Zeros,
}

impl KernelInitializer {
    /// Get the candle initialization for a kernel.
    ///
    /// * `fan_in` - Number of inputs that contribute to an output unit.
    /// * `fan_out` - Number of outputs an input unit contributes to.
    pub fn init(self, fan_in: usize, fan_out: usize) -> Init {
        use KernelInitializer::*;
        let fan_in = fan_in.max(1) as f64;
        let fan_out = fan_out.max(1) as f64;
        match self {
            GlorotUniform => {
                let limit = (6. / (fan_in + fan_out)).sqrt();
                Init::Uniform {
                    lo: -limit,
                    up: limit,
                }
            }
            HeNormal => Init::Randn {
                mean: 0.,
                stdev: (2. / fan_in).sqrt(),
            },
            Ones => Init::Const(1.),
            VarianceScaling => Init::Randn {
                mean: 0.,
                stdev: (1. / fan_in).sqrt(),
            },
            Zeros => Init::Const(0.),
        }
    }
}
