/// Tensor extension traits.
use candle_core::{DType, Tensor};
use half::{bf16, f16};
use snafu::{ensure, ResultExt, Snafu};

/// Get a tensor with the data types minimum value.
pub trait MinLike: Sized {
    /// Get a new tensor with the data type's minimum value.
    ///
    /// The tensor has the same shape as `self`.
    fn min_like(&self) -> Result<Self, candle_core::Error>;
}

impl MinLike for Tensor {
    fn min_like(&self) -> Result<Self, candle_core::Error> {
        match self.dtype() {
            DType::BF16 => Tensor::try_from(bf16::MIN),
            DType::F16 => Tensor::try_from(f16::MIN),
            DType::F32 => Tensor::try_from(f32::MIN),
            DType::F64 => Tensor::try_from(f64::MIN),
            DType::U8 => Tensor::try_from(u8::MIN),
            DType::U32 => Tensor::try_from(u32::MIN),
            DType::I64 => Tensor::try_from(i64::MIN),
        }
        .and_then(|scalar| scalar.broadcast_as(self.shape()))
        .and_then(|tensor| tensor.to_device(self.device()))
    }
}

/// Errors that occur when splitting a tensor in halves.
#[derive(Debug, Snafu)]
pub enum SplitHalvesError {
    #[snafu(display("Cannot split dimension {dim} with odd size {size} in halves"))]
    OddSize { dim: usize, size: usize },

    #[snafu(display("Cannot split tensor"))]
    Split { source: candle_core::Error },
}

/// Split a tensor into two equally-sized halves.
pub trait SplitHalves {
    /// Split the tensor into two halves along `dim`.
    ///
    /// Fails when the size of `dim` is odd.
    fn split_halves(&self, dim: usize) -> Result<(Tensor, Tensor), SplitHalvesError>;
}

impl SplitHalves for Tensor {
    fn split_halves(&self, dim: usize) -> Result<(Tensor, Tensor), SplitHalvesError> {
        let size = self.dim(dim).context(SplitSnafu)?;
        ensure!(size % 2 == 0, OddSizeSnafu { dim, size });
        let half = size / 2;
        Ok((
            self.narrow(dim, 0, half).context(SplitSnafu)?,
            self.narrow(dim, half, half).context(SplitSnafu)?,
        ))
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device, Tensor};

    use super::{SplitHalves, SplitHalvesError};

    #[test]
    fn split_halves_rejects_odd_sizes() {
        let xs = Tensor::zeros((2, 3, 3, 5), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            xs.split_halves(3),
            Err(SplitHalvesError::OddSize { dim: 3, size: 5 })
        ));
        assert!(xs.split_halves(1).is_err());
    }

    #[test]
    fn split_halves_splits_even_sizes() {
        let xs = Tensor::arange(0f32, 16., &Device::Cpu)
            .unwrap()
            .reshape((1, 2, 2, 4))
            .unwrap();
        let (first, second) = xs.split_halves(3).unwrap();
        assert_eq!(first.dims(), &[1, 2, 2, 2]);
        assert_eq!(second.dims(), &[1, 2, 2, 2]);
        assert_eq!(
            second.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
            vec![2., 3., 6., 7., 10., 11., 14., 15.]
        );
    }
}
