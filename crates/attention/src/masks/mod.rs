//! Mask utilities shared by attention implementations.
//!
//! Masks are boolean tensors with dtype [`MASK_DTYPE`] where `1` marks a
//! disallowed position and `0` a visible one. Dense scoring strategies take
//! `[batch, q_len, k_len]` masks, the banded strategy takes a key padding mask
//! `[batch, k_len]`.
//!
//! Masked scores are filled with [`MASK_FILL_VALUE`] rather than `-inf` so
//! that reduced-precision arithmetic stays finite, and the resulting weights
//! are zeroed again after the softmax so a fully masked row contributes
//! nothing.

pub mod band;
pub mod padding;

use candle_core::{DType, Result, Tensor};
use candle_nn::ops::softmax_last_dim;

/// Dtype shared by all boolean masks.
pub const MASK_DTYPE: DType = DType::U8;

/// Score assigned to masked positions before the softmax.
pub const MASK_FILL_VALUE: f64 = -10000.0;

pub use band::{build_band_mask, build_causal_mask};
pub use padding::{
    combine_masks, expand_key_padding, padding_mask_from_booleans, padding_mask_from_lengths,
};

/// Replaces entries of `scores` where `mask` is set with `value`.
///
/// `mask` must broadcast to the shape of `scores`.
pub fn masked_fill(scores: &Tensor, mask: &Tensor, value: f64) -> Result<Tensor> {
    let shape = scores.shape();
    let mask = mask.broadcast_as(shape)?;
    let fill = Tensor::new(value, scores.device())?
        .to_dtype(scores.dtype())?
        .broadcast_as(shape)?;
    mask.where_cond(&fill, scores)
}

/// Softmax over the last axis with masked entries excluded.
///
/// Masked scores are set to [`MASK_FILL_VALUE`] before normalisation and the
/// corresponding weights are forced to exactly `0` afterwards.
pub fn masked_softmax(scores: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
    match mask {
        None => softmax_last_dim(&scores.contiguous()?),
        Some(mask) => {
            let filled = masked_fill(scores, mask, MASK_FILL_VALUE)?;
            let probs = softmax_last_dim(&filled.contiguous()?)?;
            masked_fill(&probs, mask, 0.0)
        }
    }
}
