//! Transformer-XL relative-position attention.
//!
//! Scores combine a content term `(Q + u)·Kᵗ` with a position term
//! `(Q + v)·Pᵗ`, where `P` is the projected relative positional embedding.
//! The position term is computed against the embedding table indexed by
//! offset and then realigned with [`rel_shift`] so that column `j` of row `i`
//! holds the score for the offset between query `i` and key `j`.

use candle_core::{DType, Device, Tensor};
use layers::{Linear, LinearLayer, PrecisionPolicy};

use crate::core::{check_mask, check_qkv, Attention, AttentionError, Config};
use crate::reference::exact::aggregate;

/// Learned per-head bias vectors `u` and `v`, each `[heads, head_dim]`.
///
/// Tensors share storage on clone, so one `PositionBias` can be handed to
/// several layers.
#[derive(Debug, Clone)]
pub struct PositionBias {
    pub u: Tensor,
    pub v: Tensor,
}

impl PositionBias {
    pub fn new(u: Tensor, v: Tensor) -> Result<Self, AttentionError> {
        let (heads, head_dim) = u.dims2().map_err(|_| {
            AttentionError::shape("pos_bias_u must have shape [heads, head_dim]")
        })?;
        if v.dims() != [heads, head_dim] {
            return Err(AttentionError::shape(format!(
                "pos_bias_v must match pos_bias_u [{heads}, {head_dim}], got {:?}",
                v.dims()
            )));
        }
        Ok(Self { u, v })
    }

    /// Zero-initialised biases.
    pub fn zeros(
        heads: usize,
        head_dim: usize,
        dtype: DType,
        device: &Device,
    ) -> Result<Self, AttentionError> {
        let zeros = Tensor::zeros((heads, head_dim), dtype, device)?;
        Self::new(zeros.clone(), zeros)
    }

    pub fn heads(&self) -> usize {
        self.u.dims()[0]
    }

    pub fn head_dim(&self) -> usize {
        self.u.dims()[1]
    }
}

/// Positional projection and biases shared by the relative scoring strategies.
#[derive(Debug, Clone)]
pub struct RelPositionBias {
    linear_pos: Linear,
    bias: PositionBias,
}

impl RelPositionBias {
    /// `linear_pos` must be a bias-free `feature -> feature` projection with
    /// `feature = heads * head_dim` of `bias`.
    pub fn new(linear_pos: Linear, bias: PositionBias) -> Result<Self, AttentionError> {
        let config = linear_pos.config();
        let feature = bias.heads() * bias.head_dim();
        if config.bias {
            return Err(AttentionError::config("linear_pos must not carry a bias"));
        }
        if config.input_dim != feature || config.output_dim != feature {
            return Err(AttentionError::config(format!(
                "linear_pos must map {feature} -> {feature}, got {} -> {}",
                config.input_dim, config.output_dim
            )));
        }
        Ok(Self { linear_pos, bias })
    }

    pub fn position_bias(&self) -> &PositionBias {
        &self.bias
    }

    pub fn linear_pos(&self) -> &Linear {
        &self.linear_pos
    }

    /// Returns `(q + u, q + v)` for head-split `q`.
    pub(crate) fn biased_queries(&self, q: &Tensor) -> Result<(Tensor, Tensor), AttentionError> {
        let (heads, head_dim) = (self.bias.heads(), self.bias.head_dim());
        let (_, q_heads, _, q_dim) = q.dims4()?;
        if q_heads != heads || q_dim != head_dim {
            return Err(AttentionError::shape(format!(
                "biases are [{heads}, {head_dim}] but q has {q_heads} heads of width {q_dim}"
            )));
        }
        let as_row = |bias: &Tensor| -> candle_core::Result<Tensor> {
            bias.to_dtype(q.dtype())?.reshape((1, heads, 1, head_dim))
        };
        let q_u = q.broadcast_add(&as_row(&self.bias.u)?)?;
        let q_v = q.broadcast_add(&as_row(&self.bias.v)?)?;
        Ok((q_u, q_v))
    }

    /// Projects `pos_emb` `[1 | batch, positions, feature]` to
    /// `[1 | batch, heads, positions, head_dim]` in `dtype`.
    pub(crate) fn project_positions(
        &self,
        pos_emb: &Tensor,
        batch: usize,
        dtype: DType,
    ) -> Result<Tensor, AttentionError> {
        let (heads, head_dim) = (self.bias.heads(), self.bias.head_dim());
        let (pos_batch, positions, feature) = pos_emb.dims3().map_err(|_| {
            AttentionError::shape("pos_emb must have shape [1 | batch, positions, feature]")
        })?;
        if (pos_batch != 1 && pos_batch != batch) || feature != heads * head_dim {
            return Err(AttentionError::shape(format!(
                "pos_emb must be [1 | {batch}, positions, {}], got {:?}",
                heads * head_dim,
                pos_emb.dims()
            )));
        }
        let projected = self
            .linear_pos
            .forward(pos_emb, &PrecisionPolicy::uniform(dtype))?;
        Ok(projected
            .reshape((pos_batch, positions, heads, head_dim))?
            .transpose(1, 2)?
            .contiguous()?)
    }
}

/// Realigns a `[.., q_len, positions]` score table from table index to key index.
///
/// With a positional table of `positions = 2 * k_len - 1` rows ordered from
/// offset `k_len - 1` down to `-(k_len - 1)`, entry `[i, j]` of the result
/// equals `x[i, j - i + q_len - 1]`, the score for key `j` at offset
/// `(k_len - q_len + i) - j` from query `i`. Columns `>= k_len` are
/// meaningless and are dropped by the caller.
pub fn rel_shift(x: &Tensor) -> candle_core::Result<Tensor> {
    let (batch, heads, q_len, positions) = x.dims4()?;
    x.pad_with_zeros(3, 1, 0)?
        .reshape((batch, heads, positions + 1, q_len))?
        .narrow(2, 1, positions)?
        .reshape((batch, heads, q_len, positions))
}

/// Relative-position attention over the full key sequence.
#[derive(Debug, Clone)]
pub struct RelPositionAttention {
    bias: RelPositionBias,
}

impl RelPositionAttention {
    pub fn new(bias: RelPositionBias) -> Self {
        Self { bias }
    }

    pub fn bias(&self) -> &RelPositionBias {
        &self.bias
    }
}

impl Attention for RelPositionAttention {
    /// `mask` is `[batch, q_len, k_len]`; `pos_emb` is required and spans
    /// `2 * k_len - 1` offsets.
    fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: Option<&Tensor>,
        pos_emb: Option<&Tensor>,
        config: &Config,
    ) -> Result<Tensor, AttentionError> {
        let shape = check_qkv(q, k, v)?;
        if shape.q_len > shape.k_len {
            return Err(AttentionError::shape(format!(
                "relative attention needs q_len <= k_len, got {} > {}",
                shape.q_len, shape.k_len
            )));
        }
        if let Some(mask) = mask {
            check_mask(
                mask,
                q,
                &[shape.batch, shape.q_len, shape.k_len],
                "[batch, q_len, k_len]",
            )?;
        }
        let pos_emb = pos_emb.ok_or_else(|| {
            AttentionError::shape("relative attention requires a positional embedding")
        })?;
        let expected_positions = 2 * shape.k_len - 1;
        if pos_emb.dims().get(1) != Some(&expected_positions) {
            return Err(AttentionError::shape(format!(
                "pos_emb must span 2 * k_len - 1 = {expected_positions} offsets, got {:?}",
                pos_emb.dims()
            )));
        }

        let (q_u, q_v) = self.bias.biased_queries(q)?;
        let p = self
            .bias
            .project_positions(pos_emb, shape.batch, q.dtype())?;

        let matrix_ac = q_u.contiguous()?.matmul(&k.t()?.contiguous()?)?;
        let matrix_bd = q_v.contiguous()?.broadcast_matmul(&p.t()?.contiguous()?)?;
        let matrix_bd = rel_shift(&matrix_bd)?.narrow(3, 0, shape.k_len)?;

        let scale = 1.0 / (shape.head_dim as f64).sqrt();
        let scores = (matrix_ac + matrix_bd)?.affine(scale, 0.0)?;
        aggregate(&scores, v, mask, config)
    }
}
