use candle_core::Tensor;
use snafu::{ensure, ResultExt, Snafu};

use crate::util::tensor_ext::MinLike;

/// Errors for attention masks.
#[derive(Debug, Snafu)]
pub enum AttentionMaskError {
    #[snafu(display("Cannot apply logits mask"))]
    ApplyLogitsMask { source: candle_core::Error },

    #[snafu(display("Cannot convert attention mask to boolean mask"))]
    BoolMask { source: candle_core::Error },

    #[snafu(display("Attention mask must be 3D, was {}D", n_dims))]
    InvalidDims { n_dims: usize },

    #[snafu(display("Cannot slice attention mask"))]
    SliceMask { source: candle_core::Error },
}

/// Attention mask.
///
/// A 3D attention mask with shape `(batch_size, query_len, key_len)`.
/// A query element cannot attend to key elements for which the
/// corresponding mask element is zero.
#[derive(Clone, Debug)]
pub struct AttentionMask {
    bool_mask: Tensor,
}

impl AttentionMask {
    /// Create an attention mask.
    ///
    /// * `mask` - Mask tensor of any data type. Non-zero elements are
    ///   attended to.
    ///   *Shape:* `(batch_size, query_len, key_len)`
    pub fn new(mask: Tensor) -> Result<Self, AttentionMaskError> {
        let n_dims = mask.dims().len();
        ensure!(n_dims == 3, InvalidDimsSnafu { n_dims });
        Ok(AttentionMask {
            bool_mask: mask.ne(0f64).context(BoolMaskSnafu)?,
        })
    }

    /// Boolean mask tensor.
    ///
    /// *Shape:* `(batch_size, query_len, key_len)`
    pub fn bool_mask(&self) -> &Tensor {
        &self.bool_mask
    }

    /// Use the attention mask to mask logits.
    ///
    /// * input - Tensor to which the mask is applied.
    ///   *Shape:* `(batch_size, heads, query_len, key_len)`
    ///
    /// Returns: Logits with the attention mask applied.
    /// *Shape:* `(batch_size, heads, query_len, key_len)`
    pub fn apply_logit_mask(&self, input: &Tensor) -> Result<Tensor, AttentionMaskError> {
        let blocked_value = input.min_like().context(ApplyLogitsMaskSnafu)?;
        self.bool_mask
            .unsqueeze(1)
            .and_then(|mask| mask.broadcast_as(input.shape()))
            .and_then(|mask| mask.where_cond(input, &blocked_value))
            .context(ApplyLogitsMaskSnafu)
    }

    /// Narrow the mask along the batch axis.
    pub fn narrow_batch(&self, start: usize, len: usize) -> Result<Self, AttentionMaskError> {
        Ok(AttentionMask {
            bool_mask: self
                .bool_mask
                .narrow(0, start, len)
                .context(SliceMaskSnafu)?,
        })
    }

    /// Keep the mask of the first `len` queries.
    pub fn narrow_queries(&self, len: usize) -> Result<Self, AttentionMaskError> {
        Ok(AttentionMask {
            bool_mask: self
                .bool_mask
                .narrow(1, 0, len)
                .context(SliceMaskSnafu)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device, Tensor};
    use ndarray::array;

    use super::AttentionMask;
    use crate::util::tests::assert_tensor_eq;

    #[test]
    fn attention_mask_must_be_3d() {
        let mask = Tensor::ones((2, 3), DType::F32, &Device::Cpu).unwrap();
        assert!(AttentionMask::new(mask).is_err());
    }

    #[test]
    fn logit_mask_blocks_masked_keys() {
        let device = Device::Cpu;
        let mask = Tensor::new(&[[[1f32, 0.], [1., 1.]]], &device).unwrap();
        let mask = AttentionMask::new(mask).unwrap();
        let logits = Tensor::ones((1, 1, 2, 2), DType::F32, &device).unwrap();
        let masked = mask.apply_logit_mask(&logits).unwrap();
        assert_tensor_eq!(
            masked.flatten_all().unwrap(),
            array![1f32, f32::MIN, 1., 1.],
            epsilon = 0f32
        );
    }
}
