use candle_core::Tensor;
use snafu::{ensure, ResultExt, Snafu};

/// Smallest probability used when taking logarithms.
const PROBABILITY_EPSILON: f64 = 1e-7;

/// Loss errors.
#[derive(Debug, Snafu)]
pub enum LossError {
    #[snafu(display("Cannot compute binary cross-entropy"))]
    BinaryCrossEntropy { source: candle_core::Error },

    #[snafu(display("Predictions with shape {predictions:?} do not match targets with shape {targets:?}"))]
    ShapeMismatch {
        predictions: Vec<usize>,
        targets: Vec<usize>,
    },
}

/// Binary cross-entropy of predicted probabilities.
///
/// Predictions are clamped to `[eps, 1 - eps]` before taking logarithms.
/// The loss is averaged over all elements.
///
/// * `predictions` - Predicted probabilities of the positive class.
/// * `targets` - Target labels (`0` or `1`). Converted to the data type of
///   the predictions.
///   *Shape:* same as `predictions`
///
/// Returns the mean loss as a scalar tensor.
pub fn binary_cross_entropy(predictions: &Tensor, targets: &Tensor) -> Result<Tensor, LossError> {
    ensure!(
        predictions.dims() == targets.dims(),
        ShapeMismatchSnafu {
            predictions: predictions.dims().to_vec(),
            targets: targets.dims().to_vec(),
        }
    );

    let targets = targets
        .to_dtype(predictions.dtype())
        .context(BinaryCrossEntropySnafu)?;
    let predictions = predictions
        .clamp(PROBABILITY_EPSILON, 1.0 - PROBABILITY_EPSILON)
        .context(BinaryCrossEntropySnafu)?;

    let positive = predictions
        .log()
        .and_then(|log_p| &targets * log_p)
        .context(BinaryCrossEntropySnafu)?;
    let negative = predictions
        .affine(-1., 1.)
        .and_then(|q| q.log())
        .and_then(|log_q| targets.affine(-1., 1.)? * log_q)
        .context(BinaryCrossEntropySnafu)?;
    (positive + negative)
        .and_then(|log_likelihood| log_likelihood.mean_all())
        .and_then(|log_likelihood| log_likelihood.neg())
        .context(BinaryCrossEntropySnafu)
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use candle_core::{DType, Device, Tensor};

    use super::{binary_cross_entropy, LossError};

    #[test]
    fn binary_cross_entropy_matches_reference() {
        let device = Device::Cpu;
        let predictions = Tensor::new(&[[0.9f32, 0.2], [0.6, 0.5]], &device).unwrap();
        let targets = Tensor::new(&[[1u32, 0], [0, 1]], &device).unwrap();
        let loss = binary_cross_entropy(&predictions, &targets)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();

        let expected = -(0.9f32.ln() + 0.8f32.ln() + 0.4f32.ln() + 0.5f32.ln()) / 4.;
        assert_relative_eq!(loss, expected, epsilon = 1e-5);
    }

    #[test]
    fn binary_cross_entropy_is_finite_for_saturated_predictions() {
        let device = Device::Cpu;
        let predictions = Tensor::new(&[0f32, 1.], &device).unwrap();
        let targets = Tensor::new(&[1f32, 0.], &device).unwrap();
        let loss = binary_cross_entropy(&predictions, &targets)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(loss.is_finite());
        assert!(loss > 10.);
    }

    #[test]
    fn binary_cross_entropy_rejects_shape_mismatch() {
        let device = Device::Cpu;
        let predictions = Tensor::zeros((2, 3), DType::F32, &device).unwrap();
        let targets = Tensor::zeros((2, 3, 1), DType::F32, &device).unwrap();
        assert!(matches!(
            binary_cross_entropy(&predictions, &targets),
            Err(LossError::ShapeMismatch { .. })
        ));
    }
}
