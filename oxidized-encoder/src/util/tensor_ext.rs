/// Tensor extension traits.
use candle_core::{DType, Tensor};
use half::{bf16, f16};

/// Get a tensor filled with the data type's minimum value.
pub trait MinLike: Sized {
    /// Get a new tensor with the data type's minimum value.
    ///
    /// The tensor has the same shape, data type and device as `self`.
    /// Used as the replacement value for masked attention logits: for
    /// floating point types the minimum underflows to zero after softmax.
    fn min_like(&self) -> Result<Self, candle_core::Error>;
}

impl MinLike for Tensor {
    fn min_like(&self) -> Result<Self, candle_core::Error> {
        let device = self.device();
        let scalar = match self.dtype() {
            DType::BF16 => Tensor::new(bf16::MIN, device),
            DType::F16 => Tensor::new(f16::MIN, device),
            DType::F32 => Tensor::new(f32::MIN, device),
            DType::F64 => Tensor::new(f64::MIN, device),
            DType::U8 => Tensor::new(u8::MIN, device),
            DType::U32 => Tensor::new(u32::MIN, device),
            DType::I64 => Tensor::new(i64::MIN, device),
        }?;
        scalar.broadcast_as(self.shape())
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device, Tensor};

    use super::MinLike;

    #[test]
    fn min_like_has_shape_and_dtype_of_input() {
        let xs = Tensor::zeros((2, 3), DType::F32, &Device::Cpu).unwrap();
        let min = xs.min_like().unwrap();
        assert_eq!(min.dims(), &[2, 3]);
        assert_eq!(min.dtype(), DType::F32);
        let values: Vec<Vec<f32>> = min.to_vec2().unwrap();
        assert!(values.iter().flatten().all(|&v| v == f32::MIN));
    }
}
