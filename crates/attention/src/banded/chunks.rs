//! Chunk and skew transforms behind banded attention.
//!
//! The sequence (already padded to a multiple of `2w`) is split into
//! `T / w - 1` chunks of `2w` frames overlapping by `w`. Dense `2w x 2w`
//! products inside each chunk are skewed so that column index encodes the
//! key offset, then stitched into a `[T, 2w + 1]` banded matrix whose column
//! `c` of row `i` scores key `i + c - w`. All transforms are expressed with
//! `narrow`, `pad_with_zeros`, `reshape` and `stack`, so every step is a copy
//! with explicit index arithmetic rather than an aliasing strided view.

use candle_core::{bail, Result, Tensor};

use super::invalid::InvalidLocationMemo;
use crate::masks::masked_fill;

/// `[BH, T, D] -> [BH, T / w - 1, 2w, D]`; chunk `c` covers frames `c*w .. c*w + 2w`.
pub fn chunk_overlap(x: &Tensor, w: usize) -> Result<Tensor> {
    let (_, seq_len, _) = x.dims3()?;
    if w == 0 || seq_len % (2 * w) != 0 {
        bail!("chunk_overlap needs seq_len ({seq_len}) to be a positive multiple of 2w (w={w})");
    }
    let chunks = (0..seq_len / w - 1)
        .map(|c| x.narrow(1, c * w, 2 * w))
        .collect::<Result<Vec<_>>>()?;
    Tensor::stack(&chunks, 1)?.contiguous()
}

/// `[BH, C, 2w, 2w] -> [BH, C, 2w, 2w + 1]`.
///
/// Appends a zero row and reads the `(2w + 1) x 2w` block back as
/// `2w x (2w + 1)`: entry `[r, m]` becomes `x[r, r + m]` while `r + m < 2w`
/// and `x[r + 1, r + m - 2w]` after wrapping.
pub fn skew(x: &Tensor) -> Result<Tensor> {
    let (bh, chunks, rows, cols) = x.dims4()?;
    x.pad_with_zeros(2, 0, 1)?
        .reshape((bh, chunks, rows, cols + 1))
}

/// `[B, C, M, L] -> [B, C, M, M + L - 1]`, shifting row `r` right by `r`.
///
/// Entry `[r, n]` becomes `x[r, n - r]` when `0 <= n - r < L` and zero
/// otherwise. With `M = w`, `L = 2w + 1` this turns banded probabilities into
/// rows aligned with a `3w`-frame value chunk.
pub fn skew2(x: &Tensor) -> Result<Tensor> {
    let (b, c, m, l) = x.dims4()?;
    x.pad_with_zeros(3, 0, m + 1)?
        .reshape((b, c, m * (l + m + 1)))?
        .narrow(2, 0, m * (l + m))?
        .reshape((b, c, m, l + m))?
        .narrow(3, 0, l + m - 1)
}

/// Banded `Q·Kᵗ`: `[B, H, T, D] x [B, H, T, D] -> [B, H, T, 2w + 1]`.
///
/// Entries whose key lies outside the sequence are `-inf`.
pub fn sliding_chunks_matmul_qk(
    q: &Tensor,
    k: &Tensor,
    w: usize,
    memo: &InvalidLocationMemo,
) -> Result<Tensor> {
    let (batch, heads, seq_len, head_dim) = q.dims4()?;
    if k.dims() != q.dims() {
        bail!(
            "sliding_chunks_matmul_qk needs matching q/k shapes, got {:?} and {:?}",
            q.dims(),
            k.dims()
        );
    }
    let merged = batch * heads;
    let chunk_count = seq_len / w - 1;

    let q = q.contiguous()?.reshape((merged, seq_len, head_dim))?;
    let k = k.contiguous()?.reshape((merged, seq_len, head_dim))?;
    let chunk_q = chunk_overlap(&q, w)?;
    let chunk_k = chunk_overlap(&k, w)?;

    // [BH, C, 2w, 2w]
    let chunk_attn = chunk_q.matmul(&chunk_k.t()?.contiguous()?)?;
    let diagonal = skew(&chunk_attn)?;

    // Main diagonal and upper triangle: first w rows of every chunk, plus the
    // second half of the last chunk.
    let upper = Tensor::cat(
        &[
            diagonal.narrow(2, 0, w)?.narrow(3, 0, w + 1)?,
            diagonal
                .narrow(1, chunk_count - 1, 1)?
                .narrow(2, w, w)?
                .narrow(3, 0, w + 1)?,
        ],
        1,
    )?;

    // Lower triangle: block c + 1 comes from rows w-1 .. 2w-1 of chunk c;
    // block 0 only has the part that stays inside the first chunk.
    let lower_rest = diagonal.narrow(2, w - 1, w)?.narrow(3, w + 1, w)?;
    let lower_first = if w > 1 {
        diagonal
            .narrow(1, 0, 1)?
            .narrow(2, 0, w - 1)?
            .narrow(3, w + 2, w - 1)?
            .pad_with_zeros(2, 1, 0)?
            .pad_with_zeros(3, 1, 0)?
    } else {
        Tensor::zeros((merged, 1, 1, 1), diagonal.dtype(), diagonal.device())?
    };
    let lower = Tensor::cat(&[lower_first, lower_rest], 1)?;

    let banded = Tensor::cat(&[lower, upper], 3)?.reshape((batch, heads, seq_len, 2 * w + 1))?;
    let invalid = memo.mask(w, seq_len, banded.device())?;
    masked_fill(&banded, &invalid, f64::NEG_INFINITY)
}

/// Banded `P·V`: `[B, H, T, 2w + 1] x [B, H, T, D] -> [B, H, T, D]`.
pub fn sliding_chunks_matmul_pv(prob: &Tensor, v: &Tensor, w: usize) -> Result<Tensor> {
    let (batch, heads, seq_len, head_dim) = v.dims4()?;
    let width = 2 * w + 1;
    if prob.dims() != [batch, heads, seq_len, width] {
        bail!(
            "sliding_chunks_matmul_pv expects [{batch}, {heads}, {seq_len}, {width}], got {:?}",
            prob.dims()
        );
    }
    let merged = batch * heads;
    let blocks = seq_len / w;

    let chunk_prob = prob.contiguous()?.reshape((merged, blocks, w, width))?;
    let padded_v = v
        .contiguous()?
        .reshape((merged, seq_len, head_dim))?
        .pad_with_zeros(1, w, w)?;
    let chunk_v = (0..blocks)
        .map(|c| padded_v.narrow(1, c * w, 3 * w))
        .collect::<Result<Vec<_>>>()?;
    let chunk_v = Tensor::stack(&chunk_v, 1)?.contiguous()?;

    let skewed = skew2(&chunk_prob)?.contiguous()?;
    skewed
        .matmul(&chunk_v)?
        .reshape((batch, heads, seq_len, head_dim))
}
