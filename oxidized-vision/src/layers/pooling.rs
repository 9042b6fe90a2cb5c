use candle_core::Tensor;
use snafu::{ResultExt, Snafu};

use crate::layers::conv::same_padding;
use crate::layers::data_format::DataFormat;

/// Pooling errors.
#[derive(Debug, Snafu)]
pub enum PoolingError {
    #[snafu(display("Cannot apply average pooling"))]
    AveragePool { source: candle_core::Error },

    #[snafu(display("Cannot pad channels"))]
    PadChannels { source: candle_core::Error },
}

/// Average pooling with `same` padding on channels-first feature maps.
///
/// Padded positions are excluded from the averages, so border outputs
/// average over fewer elements.
///
/// * `xs` - Feature map.
///   *Shape:* `(batch_size, channels, height, width)`
/// * `pool_size` - Height and width of the pooling window.
/// * `strides` - Stride of the pooling window.
pub fn avg_pool_same(xs: &Tensor, pool_size: usize, strides: usize) -> Result<Tensor, PoolingError> {
    let (_, _, height, width) = xs.dims4().context(AveragePoolSnafu)?;
    let (top, bottom) = same_padding(height, pool_size, strides);
    let (left, right) = same_padding(width, pool_size, strides);

    let pool = |xs: &Tensor| {
        xs.pad_with_zeros(2, top, bottom)?
            .pad_with_zeros(3, left, right)?
            .avg_pool2d_with_stride(pool_size, strides)
    };

    if top + bottom + left + right == 0 {
        return pool(xs).context(AveragePoolSnafu);
    }

    // Rescale by the fraction of non-padding elements in each window.
    let coverage = Tensor::ones((1, 1, height, width), xs.dtype(), xs.device())
        .and_then(|ones| pool(&ones))
        .context(AveragePoolSnafu)?;
    pool(xs)
        .and_then(|pooled| pooled.broadcast_div(&coverage))
        .context(AveragePoolSnafu)
}

/// Downsample a feature map to line up with the output of a strided branch.
///
/// The feature map is average-pooled with a window and stride of
/// `strides` (without padding). If the feature map then has fewer than
/// `out_channels` channels, it is zero-padded on the channel axis, with
/// half of the padding before and half after the existing channels.
///
/// * `xs` - Feature map in `data_format` layout.
/// * `out_channels` - Number of channels of the branch output.
/// * `strides` - Stride of the branch.
/// * `data_format` - Layout of `xs`.
pub fn maybe_downsample(
    xs: &Tensor,
    out_channels: usize,
    strides: usize,
    data_format: DataFormat,
) -> Result<Tensor, PoolingError> {
    let mut xs = if strides == 1 {
        xs.clone()
    } else {
        data_format
            .to_channels_first(xs)
            .and_then(|xs| xs.avg_pool2d_with_stride(strides, strides))
            .and_then(|xs| data_format.from_channels_first(&xs))
            .context(AveragePoolSnafu)?
    };

    let channel_axis = data_format.channel_axis();
    let in_channels = xs.dim(channel_axis).context(PadChannelsSnafu)?;
    if in_channels < out_channels {
        let pad = (out_channels - in_channels) / 2;
        xs = xs
            .pad_with_zeros(channel_axis, pad, pad)
            .context(PadChannelsSnafu)?;
    }

    Ok(xs)
}
