use candle_core::Tensor;
use serde::{Deserialize, Serialize};

/// Weight penalties.
///
/// Regularizers do not change the forward computation. Blocks collect
/// the penalties of their regularized weights in `regularization_loss`,
/// which a training loop adds to its loss.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "class_name", rename_all = "snake_case")]
pub enum Regularizer {
    /// `l1 * sum(|w|)`
    L1 { l1: f64 },

    /// `l2 * sum(w^2)`
    L2 { l2: f64 },

    /// `l1 * sum(|w|) + l2 * sum(w^2)`
    L1L2 { l1: f64, l2: f64 },
}

impl Regularizer {
    /// Compute the penalty for a weight tensor.
    ///
    /// Returns a scalar tensor.
    pub fn penalty(&self, weight: &Tensor) -> candle_core::Result<Tensor> {
        match *self {
            Regularizer::L1 { l1 } => weight.abs()?.sum_all()?.affine(l1, 0.),
            Regularizer::L2 { l2 } => weight.sqr()?.sum_all()?.affine(l2, 0.),
            Regularizer::L1L2 { l1, l2 } => {
                weight.abs()?.sum_all()?.affine(l1, 0.)? + weight.sqr()?.sum_all()?.affine(l2, 0.)?
            }
        }
    }
}

/// Sum penalties, returning `None` when there are no penalties.
pub(crate) fn sum_penalties(
    penalties: impl IntoIterator<Item = Tensor>,
) -> candle_core::Result<Option<Tensor>> {
    let mut total: Option<Tensor> = None;
    for penalty in penalties {
        total = Some(match total {
            Some(total) => (total + penalty)?,
            None => penalty,
        });
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use candle_core::{Device, Tensor};

    use super::Regularizer;

    #[test]
    fn l1_l2_penalty_is_correct() {
        let weight = Tensor::new(&[1f64, -2., 3.], &Device::Cpu).unwrap();
        let penalty = Regularizer::L1L2 { l1: 0.5, l2: 0.1 }
            .penalty(&weight)
            .unwrap()
            .to_scalar::<f64>()
            .unwrap();
        assert!((penalty - (0.5 * 6. + 0.1 * 14.)).abs() < 1e-12);
    }

    #[test]
    fn regularizer_serializes_with_class_name() {
        let json = serde_json::to_value(Regularizer::L2 { l2: 1e-4 }).unwrap();
        assert_eq!(json["class_name"], "l2");
        let regularizer: Regularizer = serde_json::from_value(json).unwrap();
        assert_eq!(regularizer, Regularizer::L2 { l2: 1e-4 });
    }
}
