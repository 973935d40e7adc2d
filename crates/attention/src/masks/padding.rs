//! Builders for key padding masks.
//!
//! Key padding masks are shaped `[batch, k_len]` with dtype
//! [`MASK_DTYPE`](super::MASK_DTYPE); `1` marks a padded key.

use candle_core::{bail, Device, Result, Tensor};

/// Construct key padding masks from per-batch valid key lengths.
///
/// Lengths larger than `k_len` are clamped.
pub fn padding_mask_from_lengths(
    device: &Device,
    key_lengths: &[usize],
    k_len: usize,
) -> Result<Tensor> {
    let batch = key_lengths.len();
    let mut data = vec![0u8; batch * k_len];

    for (b, &valid) in key_lengths.iter().enumerate() {
        let valid = valid.min(k_len);
        for k in valid..k_len {
            data[b * k_len + k] = 1;
        }
    }

    Tensor::from_vec(data, (batch, k_len), device)
}

/// Construct key padding masks from boolean padding indicators.
///
/// Each inner slice corresponds to a batch element and must share the same
/// length. `true` indicates a padded (masked) key position.
pub fn padding_mask_from_booleans(device: &Device, padding: &[Vec<bool>]) -> Result<Tensor> {
    let k_len = padding.first().map(Vec::len).unwrap_or(0);
    if padding.iter().any(|row| row.len() != k_len) {
        bail!("all boolean padding masks must share k_len");
    }

    let data: Vec<u8> = padding
        .iter()
        .flat_map(|row| row.iter().map(|&is_padding| u8::from(is_padding)))
        .collect();

    Tensor::from_vec(data, (padding.len(), k_len), device)
}

/// Broadcasts a `[batch, k_len]` key padding mask to `[batch, q_len, k_len]`.
pub fn expand_key_padding(mask: &Tensor, q_len: usize) -> Result<Tensor> {
    let (batch, k_len) = mask.dims2()?;
    mask.unsqueeze(1)?
        .broadcast_as((batch, q_len, k_len))?
        .contiguous()
}

/// Union of two boolean masks: a position is masked if either mask sets it.
pub fn combine_masks(lhs: &Tensor, rhs: &Tensor) -> Result<Tensor> {
    lhs.broadcast_maximum(rhs)
}
