use std::cell::Cell;

use candle_core::Tensor;
use serde::{Deserialize, Serialize};

/// Axis order of image feature maps.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataFormat {
    /// `(batch_size, channels, height, width)`
    ChannelsFirst,

    /// `(batch_size, height, width, channels)`
    #[default]
    ChannelsLast,
}

thread_local! {
    static DATA_FORMAT: Cell<DataFormat> = const { Cell::new(DataFormat::ChannelsLast) };
}

/// Run a closure with a specific data format.
///
/// Blocks capture the data format when they are built, so the format
/// only needs to be set around construction. Afterwards, a block always
/// uses the format it was built with.
pub fn with_data_format<T>(data_format: DataFormat, f: impl FnOnce() -> T) -> T {
    DATA_FORMAT.with(|current| {
        let prev = current.replace(data_format);
        let result = f();
        current.replace(prev);
        result
    })
}

impl DataFormat {
    /// The data format that blocks are currently built with.
    pub fn current() -> Self {
        DATA_FORMAT.get()
    }

    /// Index of the channel axis in a rank-4 feature map.
    pub fn channel_axis(self) -> usize {
        match self {
            DataFormat::ChannelsFirst => 1,
            DataFormat::ChannelsLast => 3,
        }
    }

    /// Indices of the spatial `(height, width)` axes in a rank-4 feature map.
    pub fn spatial_axes(self) -> (usize, usize) {
        match self {
            DataFormat::ChannelsFirst => (2, 3),
            DataFormat::ChannelsLast => (1, 2),
        }
    }

    /// Convert a feature map in this format to channels-first.
    ///
    /// Convolution and pooling kernels expect channels-first inputs.
    pub fn to_channels_first(self, xs: &Tensor) -> candle_core::Result<Tensor> {
        match self {
            DataFormat::ChannelsFirst => Ok(xs.clone()),
            DataFormat::ChannelsLast => xs.permute((0, 3, 1, 2))?.contiguous(),
        }
    }

    /// Convert a channels-first feature map to this format.
    pub fn from_channels_first(self, xs: &Tensor) -> candle_core::Result<Tensor> {
        match self {
            DataFormat::ChannelsFirst => Ok(xs.clone()),
            DataFormat::ChannelsLast => xs.permute((0, 2, 3, 1))?.contiguous(),
        }
    }
}
