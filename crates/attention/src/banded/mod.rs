//! Sliding-window relative-position attention.
//!
//! Every query attends to keys at most `left` frames before and `right`
//! frames after it. Scores are kept in a banded `[T, 2w + 1]` layout with
//! `w = max(left, right)`, so time and memory grow with `T * w` instead of
//! `T * T`. Column `c` of row `i` belongs to key `i + c - w`; columns outside
//! `[w - left, w + right]` are forced to [`MASK_FILL_VALUE`].
//!
//! The banded strategy takes a key padding mask `[batch, k_len]` instead of a
//! dense mask. When `q_len < k_len` (cached streaming), queries are aligned to
//! the last `q_len` keys.

pub mod chunks;
pub mod invalid;

use candle_core::{Device, Tensor};
use candle_nn::ops::softmax_last_dim;

pub use chunks::{chunk_overlap, skew, skew2, sliding_chunks_matmul_pv, sliding_chunks_matmul_qk};
pub use invalid::InvalidLocationMemo;

use crate::core::{attention_dropout, check_mask, check_qkv, Attention, AttentionError, Config};
use crate::masks::{
    build_band_mask, combine_masks, expand_key_padding, masked_fill, MASK_DTYPE, MASK_FILL_VALUE,
};
use crate::relative::RelPositionBias;

/// Relative-position attention restricted to a `[left, right]` window.
#[derive(Debug)]
pub struct LocalRelPositionAttention {
    bias: RelPositionBias,
    left: usize,
    right: usize,
    memo: InvalidLocationMemo,
}

impl LocalRelPositionAttention {
    /// Fails when either side is negative or both are zero.
    pub fn new(bias: RelPositionBias, att_context_size: [i64; 2]) -> Result<Self, AttentionError> {
        let [left, right] = att_context_size;
        if left < 0 || right < 0 {
            return Err(AttentionError::config(format!(
                "att_context_size must be non-negative, got [{left}, {right}]"
            )));
        }
        if left.max(right) <= 0 {
            return Err(AttentionError::config(format!(
                "local attention requires a window greater than 0, got [{left}, {right}]"
            )));
        }
        Ok(Self {
            bias,
            left: left as usize,
            right: right as usize,
            memo: InvalidLocationMemo::new(),
        })
    }

    pub fn bias(&self) -> &RelPositionBias {
        &self.bias
    }

    /// `(left, right)` context in frames.
    pub fn context(&self) -> (usize, usize) {
        (self.left, self.right)
    }

    /// Band half-width.
    pub fn window(&self) -> usize {
        self.left.max(self.right)
    }

    /// Number of positional rows the layer expects: `left + right + 1`.
    pub fn positions(&self) -> usize {
        self.left + self.right + 1
    }

    pub fn memo(&self) -> &InvalidLocationMemo {
        &self.memo
    }

    /// `[1, 1, 1, 2w + 1]` mask of band columns outside the context window.
    fn context_columns(&self, device: &Device) -> candle_core::Result<Tensor> {
        let w = self.window();
        let data: Vec<u8> = (0..2 * w + 1)
            .map(|c| u8::from(c < w - self.left || c > w + self.right))
            .collect();
        Tensor::from_vec(data, (1, 1, 1, 2 * w + 1), device)
    }
}

impl Attention for LocalRelPositionAttention {
    /// `mask` is a key padding mask `[batch, k_len]`; `pos_emb` is required
    /// and spans `left + right + 1` offsets ordered from `+left` to `-right`.
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
                "local attention needs q_len <= k_len, got {} > {}",
                shape.q_len, shape.k_len
            )));
        }
        if let Some(mask) = mask {
            check_mask(mask, q, &[shape.batch, shape.k_len], "[batch, k_len]")?;
        }
        let pos_emb = pos_emb.ok_or_else(|| {
            AttentionError::shape("local attention requires a positional embedding")
        })?;
        if pos_emb.dims().get(1) != Some(&self.positions()) {
            return Err(AttentionError::shape(format!(
                "pos_emb must span left + right + 1 = {} offsets, got {:?}",
                self.positions(),
                pos_emb.dims()
            )));
        }

        let device = q.device();
        let dtype = q.dtype();
        let w = self.window();
        let seq_len = shape.k_len;
        let offset = shape.k_len - shape.q_len;
        let pad_len = (2 * w - seq_len % (2 * w)) % (2 * w);
        let padded_len = seq_len + pad_len;
        log::trace!(
            "local attention: q_len={} k_len={seq_len} w={w} pad={pad_len}",
            shape.q_len
        );

        let q = q.pad_with_zeros(2, offset, pad_len)?;
        let k = k.pad_with_zeros(2, 0, pad_len)?;
        let v = v.pad_with_zeros(2, 0, pad_len)?;

        let key_padding = match mask {
            Some(mask) => mask.clone(),
            None => Tensor::zeros((shape.batch, seq_len), MASK_DTYPE, device)?,
        };
        let key_padding = if pad_len > 0 {
            let tail = Tensor::ones((shape.batch, pad_len), MASK_DTYPE, device)?;
            Tensor::cat(&[key_padding, tail], 1)?
        } else {
            key_padding
        };
        // [B, 1, Tp, 1]
        let frame_mask = key_padding.reshape((shape.batch, 1, padded_len, 1))?;

        let (q_u, q_v) = self.bias.biased_queries(&q)?;
        let matrix_ac = sliding_chunks_matmul_qk(&q_u, &k, w, &self.memo)?;

        // [B | 1, H, Tp, left + right + 1] aligned so that column c holds
        // offset w - c.
        let p = self.bias.project_positions(pos_emb, shape.batch, dtype)?;
        let matrix_bd = q_v
            .contiguous()?
            .broadcast_matmul(&p.t()?.contiguous()?)?
            .pad_with_zeros(3, w - self.left, w - self.right)?;

        let scale = 1.0 / (shape.head_dim as f64).sqrt();
        let scores = (matrix_ac + matrix_bd)?.affine(scale, 0.0)?;
        let out_of_window = self.context_columns(device)?;
        let scores = masked_fill(&scores, &out_of_window, MASK_FILL_VALUE)?;

        // Banded key padding penalty via the same band primitive.
        let float_mask = frame_mask.to_dtype(dtype)?.affine(MASK_FILL_VALUE, 0.0)?;
        let ones = Tensor::ones((shape.batch, 1, padded_len, 1), dtype, device)?;
        let d_mask = sliding_chunks_matmul_qk(&ones, &float_mask, w, &self.memo)?;
        let scores = scores.broadcast_add(&d_mask)?;

        let masked = d_mask
            .lt(MASK_FILL_VALUE / 2.0)?
            .broadcast_maximum(&out_of_window)?;
        let probs = softmax_last_dim(&scores.contiguous()?)?;
        let probs = masked_fill(&probs, &masked, 0.0)?;
        let probs = masked_fill(&probs, &frame_mask, 0.0)?;
        let probs = attention_dropout(probs, config)?;

        let context = sliding_chunks_matmul_pv(&probs, &v, w)?;
        Ok(context.narrow(2, offset, shape.q_len)?)
    }
}

/// Dense `[batch, q_len, k_len]` equivalent of a local window and key padding.
///
/// Padded keys, keys outside `[i - left, i + right]` and every key of a padded
/// query frame are disallowed. Queries are aligned to the last `q_len` keys.
pub fn dense_local_mask(
    key_padding: &Tensor,
    q_len: usize,
    left: usize,
    right: usize,
) -> Result<Tensor, AttentionError> {
    let (batch, k_len) = key_padding.dims2()?;
    if q_len > k_len {
        return Err(AttentionError::shape(format!(
            "dense_local_mask needs q_len <= k_len, got {q_len} > {k_len}"
        )));
    }
    let band = build_band_mask(key_padding.device(), batch, q_len, k_len, left, right)?;
    let keys = expand_key_padding(key_padding, q_len)?;
    let queries = key_padding.narrow(1, k_len - q_len, q_len)?.unsqueeze(2)?;
    Ok(combine_masks(&combine_masks(&band, &keys)?, &queries)?)
}
