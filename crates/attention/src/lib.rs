//! Multi-head attention with relative positional bias and banded locality.
//!
//! The crate computes scaled dot-product attention over tensors with layout
//! `[batch, n_heads, seq_len, head_dim]` and wraps the scoring strategies in a
//! [`MultiHeadAttention`] layer operating on `(batch, time, feature)` inputs.
//! Three strategies are available:
//!
//! * [`ExactAttention`]: dense `softmax(Q·Kᵗ / sqrt(d)) · V`.
//! * [`RelPositionAttention`]: Transformer-XL relative-position scores with
//!   learned per-head biases `u` and `v`.
//! * [`LocalRelPositionAttention`]: the relative variant restricted to a
//!   `[left, right]` window and evaluated in `O(T * w)` with banded scores.
//!
//! Masks are `u8` tensors where `1` marks a disallowed position. Masked scores
//! are filled with [`masks::MASK_FILL_VALUE`] and re-zeroed after the softmax.
//!
//! Streaming inference prepends a per-layer [`CacheSlots`] slot to the key
//! stream and writes the next state into a caller-provided buffer (see
//! [`CacheAccess`]). Dropout on attention weights only happens in training
//! mode. Reduced-precision inputs are promoted to `f32` internally unless the
//! layer is configured with [`PrecisionMode::Inherit`].

pub mod banded;
pub mod core;
pub mod kv_cache;
pub mod masks;
pub mod multi_head;
pub mod reference;
pub mod relative;

pub use crate::core::{
    Attention, AttentionConfig, AttentionError, AttentionKind, Config, PrecisionMode,
};
pub use banded::LocalRelPositionAttention;
pub use kv_cache::{CacheAccess, CacheSlots};
pub use multi_head::{MultiHeadAttention, Projections, RelativeParts};
pub use reference::ExactAttention;
pub use relative::{PositionBias, RelPositionAttention, RelPositionBias};
