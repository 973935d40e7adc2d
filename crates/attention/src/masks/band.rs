//! Builders for causal and banded visibility masks.
//!
//! The resulting tensors have dtype [`MASK_DTYPE`](super::MASK_DTYPE) and
//! shape `[batch, q_len, k_len]`. When `k_len > q_len`, queries are aligned
//! with the most recent `q_len` keys so that a cached prefix stays visible.

use candle_core::{Device, Result, Tensor};

/// Construct a causal mask for the supplied sequence dimensions.
pub fn build_causal_mask(
    device: &Device,
    batch: usize,
    q_len: usize,
    k_len: usize,
) -> Result<Tensor> {
    let offset = k_len.saturating_sub(q_len);
    let mut data = vec![0u8; batch * q_len * k_len];

    for b in 0..batch {
        for q in 0..q_len {
            let row_start = (b * q_len + q) * k_len;
            for k in (q + offset + 1).min(k_len)..k_len {
                data[row_start + k] = 1;
            }
        }
    }

    Tensor::from_vec(data, (batch, q_len, k_len), device)
}

/// Construct a mask that keeps keys within `[pos - left, pos + right]` of
/// each query position `pos`.
///
/// This is the dense equivalent of local attention with context
/// `[left, right]`.
pub fn build_band_mask(
    device: &Device,
    batch: usize,
    q_len: usize,
    k_len: usize,
    left: usize,
    right: usize,
) -> Result<Tensor> {
    let offset = k_len.saturating_sub(q_len);
    let mut data = vec![0u8; batch * q_len * k_len];

    for b in 0..batch {
        for q in 0..q_len {
            let pos = q + offset;
            let row_start = (b * q_len + q) * k_len;
            for k in 0..k_len {
                if k + left < pos || k > pos + right {
                    data[row_start + k] = 1;
                }
            }
        }
    }

    Tensor::from_vec(data, (batch, q_len, k_len), device)
}
