//! Dense scaled dot-product attention.
//!
//! The exact path materialises the full `[q_len, k_len]` score matrix per
//! head. It is the scoring strategy of absolute-position layers and the
//! baseline the banded kernel is validated against.

use candle_core::Tensor;

use crate::core::{attention_dropout, check_mask, check_qkv, Attention, AttentionError, Config};
use crate::masks::masked_softmax;

/// Plain `softmax(Q·Kᵗ / sqrt(d)) · V` attention.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExactAttention;

impl ExactAttention {
    pub fn new() -> Self {
        Self
    }
}

impl Attention for ExactAttention {
    /// `mask` is `[batch, q_len, k_len]`; `pos_emb` is ignored.
    fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: Option<&Tensor>,
        _pos_emb: Option<&Tensor>,
        config: &Config,
    ) -> Result<Tensor, AttentionError> {
        let shape = check_qkv(q, k, v)?;
        if let Some(mask) = mask {
            check_mask(
                mask,
                q,
                &[shape.batch, shape.q_len, shape.k_len],
                "[batch, q_len, k_len]",
            )?;
        }

        let scale = 1.0 / (shape.head_dim as f64).sqrt();
        let scores = q
            .contiguous()?
            .matmul(&k.t()?.contiguous()?)?
            .affine(scale, 0.0)?;
        aggregate(&scores, v, mask, config)
    }
}

/// Masked softmax over `[batch, heads, q_len, k_len]` scores followed by
/// dropout and the weighted sum of `v`.
///
/// `mask` is `[batch, q_len, k_len]` and is shared by every head.
pub(crate) fn aggregate(
    scores: &Tensor,
    v: &Tensor,
    mask: Option<&Tensor>,
    config: &Config,
) -> Result<Tensor, AttentionError> {
    let mask = mask.map(|m| m.unsqueeze(1)).transpose()?;
    let probs = masked_softmax(scores, mask.as_ref())?;
    let probs = attention_dropout(probs, config)?;
    Ok(probs.matmul(&v.contiguous()?)?)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::masks::{build_causal_mask, MASK_FILL_VALUE};
    use candle_core::{DType, Device, Result as CandleResult};

    fn build_inputs(device: &Device) -> CandleResult<(Tensor, Tensor, Tensor)> {
        let data: Vec<f32> = (0..64).map(|i| (i as f32) * 0.01).collect();
        let q = Tensor::from_vec(data.clone(), (1, 2, 4, 8), device)?;
        let reversed: Vec<f32> = data.iter().rev().copied().collect();
        let k = Tensor::from_vec(reversed, (1, 2, 4, 8), device)?;
        let v = Tensor::from_vec(data, (1, 2, 4, 8), device)?;
        Ok((q, k, v))
    }

    /// Loop implementation of masked attention with a `[batch, q_len, k_len]` mask.
    pub(crate) fn naive_attention(
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: Option<&Tensor>,
    ) -> CandleResult<Tensor> {
        let (batch, heads, q_len, head_dim) = q.dims4()?;
        let (_, _, k_len, _) = k.dims4()?;
        let mut output = vec![0f32; batch * heads * q_len * head_dim];

        let q_vec = q.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        let k_vec = k.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        let v_vec = v.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        let mask_vec = match mask {
            Some(m) => Some(m.flatten_all()?.to_vec1::<u8>()?),
            None => None,
        };
        let scale = 1.0 / (head_dim as f32).sqrt();

        for b in 0..batch {
            for h in 0..heads {
                for q_idx in 0..q_len {
                    let mut row = vec![0f32; k_len];
                    let mut masked = vec![false; k_len];
                    let mut max_val = f32::NEG_INFINITY;
                    for k_idx in 0..k_len {
                        let mut dot = 0f32;
                        for d in 0..head_dim {
                            let qi = ((b * heads + h) * q_len + q_idx) * head_dim + d;
                            let ki = ((b * heads + h) * k_len + k_idx) * head_dim + d;
                            dot += q_vec[qi] * k_vec[ki];
                        }
                        dot *= scale;
                        if let Some(mask_vec) = &mask_vec {
                            if mask_vec[(b * q_len + q_idx) * k_len + k_idx] == 1 {
                                dot = MASK_FILL_VALUE as f32;
                                masked[k_idx] = true;
                            }
                        }
                        row[k_idx] = dot;
                        max_val = max_val.max(dot);
                    }
                    let mut denom = 0f32;
                    for val in row.iter_mut() {
                        *val = (*val - max_val).exp();
                        denom += *val;
                    }
                    for d in 0..head_dim {
                        let mut acc = 0f32;
                        for k_idx in 0..k_len {
                            if masked[k_idx] {
                                continue;
                            }
                            let vi = ((b * heads + h) * k_len + k_idx) * head_dim + d;
                            acc += row[k_idx] / denom * v_vec[vi];
                        }
                        output[((b * heads + h) * q_len + q_idx) * head_dim + d] = acc;
                    }
                }
            }
        }

        Tensor::from_vec(output, (batch, heads, q_len, head_dim), q.device())
    }

    fn max_diff(a: &Tensor, b: &Tensor) -> CandleResult<f32> {
        a.to_dtype(DType::F32)?
            .sub(&b.to_dtype(DType::F32)?)?
            .abs()?
            .max_all()?
            .to_vec0::<f32>()
    }

    #[test]
    fn exact_attention_matches_naive() -> CandleResult<()> {
        let device = Device::Cpu;
        let (q, k, v) = build_inputs(&device)?;
        let mask = build_causal_mask(&device, 1, 4, 4)?;
        let output = ExactAttention
            .attend(&q, &k, &v, Some(&mask), None, &Config::default())
            .unwrap();
        let expected = naive_attention(&q, &k, &v, Some(&mask))?;
        assert!(max_diff(&output, &expected)? < 1e-5);

        let unmasked = ExactAttention
            .attend(&q, &k, &v, None, None, &Config::default())
            .unwrap();
        assert!(max_diff(&unmasked, &naive_attention(&q, &k, &v, None)?)? < 1e-5);
        Ok(())
    }

    #[test]
    fn cross_lengths_are_supported() -> CandleResult<()> {
        let device = Device::Cpu;
        let q = Tensor::randn(0f32, 1.0, (2, 2, 3, 4), &device)?;
        let k = Tensor::randn(0f32, 1.0, (2, 2, 5, 4), &device)?;
        let v = Tensor::randn(0f32, 1.0, (2, 2, 5, 4), &device)?;
        let mask = build_causal_mask(&device, 2, 3, 5)?;
        let output = ExactAttention
            .attend(&q, &k, &v, Some(&mask), None, &Config::default())
            .unwrap();
        assert_eq!(output.dims(), &[2, 2, 3, 4]);
        assert!(max_diff(&output, &naive_attention(&q, &k, &v, Some(&mask))?)? < 1e-5);
        Ok(())
    }

    #[test]
    fn mismatched_shapes_error() {
        let device = Device::Cpu;
        let q = Tensor::zeros((1, 2, 4, 8), DType::F32, &device).unwrap();
        let k = Tensor::zeros((1, 2, 5, 8), DType::F32, &device).unwrap();
        let v = Tensor::zeros((1, 2, 4, 8), DType::F32, &device).unwrap();
        let err = ExactAttention
            .attend(&q, &k, &v, None, None, &Config::default())
            .unwrap_err();
        assert!(matches!(err, AttentionError::InvalidShape { .. }));
    }

    #[test]
    fn mask_shape_and_dtype_validation() {
        let device = Device::Cpu;
        let q = Tensor::zeros((1, 2, 4, 8), DType::F32, &device).unwrap();
        let mask = Tensor::zeros((1, 3, 4), DType::U8, &device).unwrap();
        let err = ExactAttention
            .attend(&q, &q, &q, Some(&mask), None, &Config::default())
            .unwrap_err();
        assert!(matches!(err, AttentionError::InvalidShape { .. }));

        let float_mask = Tensor::zeros((1, 4, 4), DType::F32, &device).unwrap();
        let err = ExactAttention
            .attend(&q, &q, &q, Some(&float_mask), None, &Config::default())
            .unwrap_err();
        assert!(matches!(err, AttentionError::UnsupportedDType { .. }));
    }

    #[test]
    fn numerical_stability() {
        let device = Device::Cpu;
        let q = Tensor::full(10_000.0f32, (1, 1, 4, 4), &device).unwrap();
        let k = Tensor::full(-10_000.0f32, (1, 1, 4, 4), &device).unwrap();
        let v = Tensor::ones((1, 1, 4, 4), DType::F32, &device).unwrap();
        let out = ExactAttention
            .attend(&q, &k, &v, None, None, &Config::default())
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        assert!(out.iter().all(|value| value.is_finite()));
    }

    #[test]
    fn dropout_zero_probability_is_noop() {
        let device = Device::Cpu;
        let (q, k, v) = build_inputs(&device).unwrap();
        let config = Config {
            dropout_p: Some(0.0),
        };
        let out = ExactAttention.attend(&q, &k, &v, None, None, &config).unwrap();
        let reference = ExactAttention
            .attend(&q, &k, &v, None, None, &Config::default())
            .unwrap();
        assert!(max_diff(&out, &reference).unwrap() < 1e-6);

        let invalid = Config {
            dropout_p: Some(1.5),
        };
        assert!(ExactAttention
            .attend(&q, &k, &v, None, None, &invalid)
            .is_err());
    }
}
