//! Core traits and types shared across attention implementations.
//!
//! Implementations operate on head-split tensors with layout
//! `[batch, n_heads, seq_len, head_dim]` that have already been projected and
//! cast to the compute dtype by the owning layer. The returned context tensor
//! mirrors the query layout.

pub mod config;
pub mod errors;

use candle_core::{DType, Tensor};
use candle_nn::ops::dropout;

pub use config::{AttentionConfig, AttentionKind, Config, PrecisionMode};
pub use errors::AttentionError;

/// Unified interface for attention scoring strategies.
///
/// * `q` is `[batch, n_heads, q_len, head_dim]`; `k` and `v` share the layout
///   with `k_len` frames.
/// * `mask` uses `u8` with `1` marking a disallowed position; its expected
///   shape depends on the strategy (see each implementation).
/// * `pos_emb` is the raw positional embedding `[1 | batch, positions, feature]`
///   for strategies that use one; others ignore it.
/// * Dropout is controlled via [`Config::dropout_p`].
pub trait Attention {
    /// Compute the attention context `[batch, n_heads, q_len, head_dim]`.
    fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: Option<&Tensor>,
        pos_emb: Option<&Tensor>,
        config: &Config,
    ) -> Result<Tensor, AttentionError>;
}

/// Dimensions shared by a validated `q`/`k`/`v` triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeadShape {
    pub batch: usize,
    pub heads: usize,
    pub q_len: usize,
    pub k_len: usize,
    pub head_dim: usize,
}

/// Checks device, dtype and layout agreement between `q`, `k` and `v`.
pub(crate) fn check_qkv(q: &Tensor, k: &Tensor, v: &Tensor) -> Result<HeadShape, AttentionError> {
    let device = q.device();
    if !device.same_device(k.device()) || !device.same_device(v.device()) {
        return Err(AttentionError::shape(
            "q, k, v must reside on the same device",
        ));
    }

    let dtype = q.dtype();
    if dtype != k.dtype() || dtype != v.dtype() {
        return Err(AttentionError::shape("q, k, v must share the same dtype"));
    }
    if !matches!(dtype, DType::F32 | DType::F16 | DType::BF16 | DType::F64) {
        return Err(AttentionError::UnsupportedDType {
            requested: format!("{dtype:?}"),
        });
    }

    let (batch, heads, q_len, head_dim) = q
        .dims4()
        .map_err(|_| AttentionError::shape("q must have shape [batch, heads, seq_len, head_dim]"))?;
    let (kb, kh, k_len, kd) = k
        .dims4()
        .map_err(|_| AttentionError::shape("k must have shape [batch, heads, seq_len, head_dim]"))?;
    let (vb, vh, vk, vd) = v
        .dims4()
        .map_err(|_| AttentionError::shape("v must have shape [batch, heads, seq_len, head_dim]"))?;

    if kb != batch || kh != heads || kd != head_dim {
        return Err(AttentionError::shape(format!(
            "k is [{kb}, {kh}, {k_len}, {kd}], expected [{batch}, {heads}, _, {head_dim}]"
        )));
    }
    if vb != batch || vh != heads || vk != k_len || vd != head_dim {
        return Err(AttentionError::shape(format!(
            "v is [{vb}, {vh}, {vk}, {vd}], expected [{batch}, {heads}, {k_len}, {head_dim}]"
        )));
    }

    Ok(HeadShape {
        batch,
        heads,
        q_len,
        k_len,
        head_dim,
    })
}

/// Checks a `u8` mask against the expected dimensions.
pub(crate) fn check_mask(
    mask: &Tensor,
    reference: &Tensor,
    expected: &[usize],
    layout: &str,
) -> Result<(), AttentionError> {
    if !reference.device().same_device(mask.device()) {
        return Err(AttentionError::shape(
            "mask must reside on the same device as q",
        ));
    }
    if mask.dtype() != crate::masks::MASK_DTYPE {
        return Err(AttentionError::UnsupportedDType {
            requested: format!(
                "mask expects dtype {:?}, got {:?}",
                crate::masks::MASK_DTYPE,
                mask.dtype()
            ),
        });
    }
    if mask.dims() != expected {
        return Err(AttentionError::shape(format!(
            "mask must have shape {layout} = {expected:?}, got {:?}",
            mask.dims()
        )));
    }
    Ok(())
}

/// Applies dropout to attention weights when the call config enables it.
pub(crate) fn attention_dropout(probs: Tensor, config: &Config) -> Result<Tensor, AttentionError> {
    match config.dropout_p {
        Some(p) if !(0.0..1.0).contains(&p) => Err(AttentionError::config(format!(
            "dropout probability must be in [0, 1), got {p}"
        ))),
        Some(p) if p > 0.0 => Ok(dropout(&probs, p)?),
        _ => Ok(probs),
    }
}
