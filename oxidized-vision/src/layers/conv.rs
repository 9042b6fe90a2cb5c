use candle_core::{Module, Tensor};
use candle_nn::{Conv2d as CandleConv2d, Conv2dConfig as CandleConv2dConfig, Init, VarBuilder};
use serde::{Deserialize, Serialize};
use snafu::{ensure, ResultExt, Snafu};

use crate::layers::init::KernelInitializer;
use crate::layers::regularizer::Regularizer;

/// Convolution padding.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Padding {
    /// Pad so that the output size is `ceil(input_size / stride)`.
    ///
    /// When the padding is uneven, the extra row/column is added at the
    /// bottom/right.
    #[default]
    Same,

    /// No padding.
    Valid,
}

/// Compute the `(before, after)` padding for `same` convolution or pooling.
///
/// * `input_size` - Size of the spatial dimension.
/// * `kernel_size` - Effective kernel size (after dilation).
/// * `stride` - Stride.
pub fn same_padding(input_size: usize, kernel_size: usize, stride: usize) -> (usize, usize) {
    let output_size = input_size.div_ceil(stride);
    let total = ((output_size - 1) * stride + kernel_size).saturating_sub(input_size);
    (total / 2, total - total / 2)
}

/// Pad the spatial axes of a channels-first feature map with zeros
/// for `same` padding.
pub(crate) fn pad_same(xs: &Tensor, kernel_size: usize, stride: usize) -> candle_core::Result<Tensor> {
    let (_, _, height, width) = xs.dims4()?;
    let (top, bottom) = same_padding(height, kernel_size, stride);
    let (left, right) = same_padding(width, kernel_size, stride);
    if top + bottom + left + right == 0 {
        return Ok(xs.clone());
    }
    xs.pad_with_zeros(2, top, bottom)?
        .pad_with_zeros(3, left, right)
}

/// 2D convolution configuration.
#[derive(Clone, Debug)]
pub struct Conv2dConfig {
    bias_regularizer: Option<Regularizer>,
    depthwise: bool,
    dilation_rate: usize,
    in_channels: usize,
    kernel_initializer: KernelInitializer,
    kernel_regularizer: Option<Regularizer>,
    kernel_size: usize,
    out_channels: usize,
    padding: Padding,
    strides: usize,
    use_bias: bool,
}

impl Conv2dConfig {
    /// Bias regularizer.
    ///
    /// Default: `None`
    pub fn bias_regularizer(mut self, bias_regularizer: Option<Regularizer>) -> Self {
        self.bias_regularizer = bias_regularizer;
        self
    }

    /// Use a depthwise convolution.
    ///
    /// A depthwise convolution convolves every input channel separately.
    /// The number of output channels must be equal to the number of input
    /// channels.
    ///
    /// Default: `false`
    pub fn depthwise(mut self, depthwise: bool) -> Self {
        self.depthwise = depthwise;
        self
    }

    /// Dilation rate.
    ///
    /// Default: `1`
    pub fn dilation_rate(mut self, dilation_rate: usize) -> Self {
        self.dilation_rate = dilation_rate;
        self
    }

    /// Number of input channels.
    ///
    /// Default: `1`
    pub fn in_channels(mut self, in_channels: usize) -> Self {
        self.in_channels = in_channels;
        self
    }

    /// Kernel initializer.
    ///
    /// Default: `KernelInitializer::VarianceScaling`
    pub fn kernel_initializer(mut self, kernel_initializer: KernelInitializer) -> Self {
        self.kernel_initializer = kernel_initializer;
        self
    }

    /// Kernel regularizer.
    ///
    /// Default: `None`
    pub fn kernel_regularizer(mut self, kernel_regularizer: Option<Regularizer>) -> Self {
        self.kernel_regularizer = kernel_regularizer;
        self
    }

    /// Height and width of the convolution window.
    ///
    /// Default: `1`
    pub fn kernel_size(mut self, kernel_size: usize) -> Self {
        self.kernel_size = kernel_size;
        self
    }

    /// Number of output channels.
    ///
    /// Default: `1`
    pub fn out_channels(mut self, out_channels: usize) -> Self {
        self.out_channels = out_channels;
        self
    }

    /// Padding.
    ///
    /// Default: `Padding::Same`
    pub fn padding(mut self, padding: Padding) -> Self {
        self.padding = padding;
        self
    }

    /// Stride.
    ///
    /// Default: `1`
    pub fn strides(mut self, strides: usize) -> Self {
        self.strides = strides;
        self
    }

    /// Add a bias to the convolution output.
    ///
    /// Default: `false`
    pub fn use_bias(mut self, use_bias: bool) -> Self {
        self.use_bias = use_bias;
        self
    }

    /// Build the convolution.
    pub fn build(&self, vb: VarBuilder) -> Result<Conv2d, Conv2dError> {
        let groups = if self.depthwise {
            ensure!(
                self.in_channels == self.out_channels,
                DepthwiseChannelsSnafu {
                    in_channels: self.in_channels,
                    out_channels: self.out_channels
                }
            );
            self.in_channels
        } else {
            1
        };

        let receptive_field = self.kernel_size * self.kernel_size;
        let fan_in = (self.in_channels / groups) * receptive_field;
        let fan_out = (self.out_channels / groups) * receptive_field;

        let weight = vb
            .get_with_hints(
                (
                    self.out_channels,
                    self.in_channels / groups,
                    self.kernel_size,
                    self.kernel_size,
                ),
                "weight",
                self.kernel_initializer.init(fan_in, fan_out),
            )
            .context(ConstructionSnafu)?;

        let bias = if self.use_bias {
            Some(
                vb.get_with_hints(self.out_channels, "bias", Init::Const(0.))
                    .context(ConstructionSnafu)?,
            )
        } else {
            None
        };

        let conv = CandleConv2d::new(
            weight.clone(),
            bias.clone(),
            CandleConv2dConfig {
                stride: self.strides,
                dilation: self.dilation_rate,
                groups,
                ..Default::default()
            },
        );

        Ok(Conv2d {
            bias,
            bias_regularizer: self.bias_regularizer,
            conv,
            effective_kernel_size: (self.kernel_size - 1) * self.dilation_rate + 1,
            kernel_regularizer: self.kernel_regularizer,
            padding: self.padding,
            strides: self.strides,
            weight,
        })
    }
}

impl Default for Conv2dConfig {
    fn default() -> Self {
        Self {
            bias_regularizer: None,
            depthwise: false,
            dilation_rate: 1,
            in_channels: 1,
            kernel_initializer: KernelInitializer::default(),
            kernel_regularizer: None,
            kernel_size: 1,
            out_channels: 1,
            padding: Padding::Same,
            strides: 1,
            use_bias: false,
        }
    }
}

/// 2D convolution errors.
#[derive(Debug, Snafu)]
pub enum Conv2dError {
    #[snafu(display("Cannot construct convolution"))]
    Construction { source: candle_core::Error },

    #[snafu(display(
        "Depthwise convolution requires equal input and output channels, got {in_channels} and {out_channels}"
    ))]
    DepthwiseChannels {
        in_channels: usize,
        out_channels: usize,
    },
}

/// 2D convolution on channels-first feature maps.
///
/// Unlike the candle convolution, this convolution supports `same`
/// padding with strides, which may require uneven padding.
#[derive(Clone, Debug)]
pub struct Conv2d {
    bias: Option<Tensor>,
    bias_regularizer: Option<Regularizer>,
    conv: CandleConv2d,
    effective_kernel_size: usize,
    kernel_regularizer: Option<Regularizer>,
    padding: Padding,
    strides: usize,
    weight: Tensor,
}

impl Conv2d {
    /// Trainable variables of the convolution.
    pub fn trainable_variables(&self) -> Vec<Tensor> {
        let mut variables = vec![self.weight.clone()];
        variables.extend(self.bias.iter().cloned());
        variables
    }

    /// Weight penalties of the regularized variables.
    pub fn penalties(&self) -> candle_core::Result<Vec<Tensor>> {
        let mut penalties = Vec::new();
        if let Some(regularizer) = &self.kernel_regularizer {
            penalties.push(regularizer.penalty(&self.weight)?);
        }
        if let (Some(regularizer), Some(bias)) = (&self.bias_regularizer, &self.bias) {
            penalties.push(regularizer.penalty(bias)?);
        }
        Ok(penalties)
    }
}

impl Module for Conv2d {
    /// Apply the convolution.
    ///
    /// * `xs` - Feature map.
    ///   *Shape:* `(batch_size, in_channels, height, width)`
    ///
    /// Returns the convolved feature map.
    /// *Shape:* `(batch_size, out_channels, height', width')`
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let xs = match self.padding {
            Padding::Same => pad_same(xs, self.effective_kernel_size, self.strides)?,
            Padding::Valid => xs.clone(),
        };
        self.conv.forward(&xs)
    }
}
