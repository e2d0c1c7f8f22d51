use candle_core::{DType, Tensor};
use snafu::{ensure, ResultExt, Snafu};

use crate::util::tensor_ext::MinLike;

/// Errors for attention masks.
#[derive(Debug, Snafu)]
pub enum AttentionMaskError {
    #[snafu(display("Cannot convert attention mask to u8"))]
    ConvertMask { source: candle_core::Error },

    #[snafu(display("Attention mask must be 2D, was {}D", n_dims))]
    InvalidDims { n_dims: usize },
}

/// Attention mask.
///
/// Sequence elements for which the corresponding mask element is set to
/// `false` (zero) are ignored during attention calculation. Guaranteed to
/// be a 2D array.
#[derive(Clone, Debug)]
pub struct AttentionMask {
    bool_mask: Tensor,
}

impl AttentionMask {
    /// Create an input attention mask.
    ///
    /// * `bool_mask` - Boolean mask tensor. Non-zero values mark valid
    ///   sequence elements. Other data types are converted to `u8`.
    ///   *Shape:* `(batch_size, seq_len)`
    pub fn new(bool_mask: Tensor) -> Result<Self, AttentionMaskError> {
        let n_dims = bool_mask.dims().len();
        ensure!(n_dims == 2, InvalidDimsSnafu { n_dims });
        let bool_mask = if bool_mask.dtype() == DType::U8 {
            bool_mask
        } else {
            bool_mask.ne(0u8).context(ConvertMaskSnafu)?
        };
        Ok(AttentionMask { bool_mask })
    }

    /// Get the boolean mask.
    ///
    /// *Shape:* `(batch_size, seq_len)`
    pub fn bool_mask(&self) -> &Tensor {
        &self.bool_mask
    }
}

/// Errors for self-attention masks.
#[derive(Debug, Snafu)]
pub enum SelfAttentionMaskError {
    #[snafu(display("Cannot apply logits mask"))]
    ApplyLogitsMask { source: candle_core::Error },

    #[snafu(display("Cannot reshape attention mask to self-attention mask"))]
    ReshapeMask { source: candle_core::Error },
}

/// Self-attention mask.
///
/// A 4D mask with shape `(batch_size, 1, 1, key_len)` that is broadcast
/// over heads and query positions. Keys for which the mask element is
/// `false` receive zero attention weight.
#[derive(Clone, Debug)]
pub struct SelfAttentionMask {
    bool_mask: Tensor,
}

impl TryFrom<&AttentionMask> for SelfAttentionMask {
    type Error = SelfAttentionMaskError;

    fn try_from(attention_mask: &AttentionMask) -> Result<Self, Self::Error> {
        let (batch_size, key_len) = attention_mask
            .bool_mask
            .dims2()
            .context(ReshapeMaskSnafu)?;
        Ok(SelfAttentionMask {
            bool_mask: attention_mask
                .bool_mask
                .reshape((batch_size, 1, 1, key_len))
                .context(ReshapeMaskSnafu)?,
        })
    }
}

impl SelfAttentionMask {
    /// Use the attention mask to mask logits.
    ///
    /// Masked logits are replaced by the minimum value of the logits'
    /// data type, so that they vanish after softmax.
    ///
    /// * input - Tensor to which the mask is applied.
    ///   *Shape:* `(batch_size, heads, query_len, key_len)`
    ///
    /// Returns: Logits with the attention mask applied.
    /// *Shape:* `(batch_size, heads, query_len, key_len)`
    pub fn apply_logit_mask(&self, input: &Tensor) -> Result<Tensor, SelfAttentionMaskError> {
        let blocked_value = input.min_like().context(ApplyLogitsMaskSnafu)?;
        self.bool_mask
            .broadcast_as(input.shape())
            .and_then(|mask| mask.where_cond(input, &blocked_value))
            .context(ApplyLogitsMaskSnafu)
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device, Tensor};
    use ndarray::array;

    use super::{AttentionMask, SelfAttentionMask};
    use crate::util::tests::assert_tensor_eq;

    #[test]
    fn attention_mask_must_be_2d() {
        let mask = Tensor::ones((2, 4, 1), DType::U8, &Device::Cpu).unwrap();
        assert!(AttentionMask::new(mask).is_err());
    }

    #[test]
    fn attention_mask_converts_to_u8() {
        let mask = Tensor::new(&[[1f32, 0., 2.]], &Device::Cpu).unwrap();
        let mask = AttentionMask::new(mask).unwrap();
        assert_eq!(mask.bool_mask().dtype(), DType::U8);
        assert_eq!(
            mask.bool_mask().to_vec2::<u8>().unwrap(),
            vec![vec![1, 0, 1]]
        );
    }

    #[test]
    fn logit_mask_blocks_masked_keys() {
        let mask = Tensor::new(&[[1u8, 0, 1]], &Device::Cpu).unwrap();
        let mask = AttentionMask::new(mask).unwrap();
        let self_attention_mask = SelfAttentionMask::try_from(&mask).unwrap();

        let logits = Tensor::zeros((1, 2, 2, 3), DType::F32, &Device::Cpu).unwrap();
        let masked = self_attention_mask.apply_logit_mask(&logits).unwrap();
        let m = f32::MIN;
        assert_eq!(masked.dims(), &[1, 2, 2, 3]);
        assert_tensor_eq!(
            masked.squeeze(0).unwrap(),
            array![[[0f32, m, 0.], [0., m, 0.]], [[0., m, 0.], [0., m, 0.]]]
        );
    }
}
