#![allow(dead_code)]

use anyhow::Result;
use attention::{
    AttentionConfig, AttentionKind, MultiHeadAttention, PositionBias, Projections, RelativeParts,
};
use candle_core::{DType, Device, Tensor};
use layers::{Linear, LinearConfig};

pub fn eye(n: usize, device: &Device) -> Result<Tensor> {
    let data: Vec<f32> = (0..n * n)
        .map(|i| if i / n == i % n { 1.0 } else { 0.0 })
        .collect();
    Ok(Tensor::from_vec(data, (n, n), device)?)
}

pub fn identity_projections(feature: usize, device: &Device) -> Result<Projections> {
    let linear = || -> Result<Linear> {
        Ok(Linear::new(
            LinearConfig::new(feature, feature),
            eye(feature, device)?,
            Some(Tensor::zeros(feature, DType::F32, device)?),
        )?)
    };
    Ok(Projections {
        linear_q: linear()?,
        linear_k: linear()?,
        linear_v: linear()?,
        linear_out: linear()?,
    })
}

pub fn random_projections(feature: usize, device: &Device) -> Result<Projections> {
    let linear = || -> Result<Linear> {
        let weight = Tensor::randn(0f32, 0.4, (feature, feature), device)?;
        let bias = Tensor::randn(0f32, 0.1, feature, device)?;
        Ok(Linear::new(
            LinearConfig::new(feature, feature),
            weight,
            Some(bias),
        )?)
    };
    Ok(Projections {
        linear_q: linear()?,
        linear_k: linear()?,
        linear_v: linear()?,
        linear_out: linear()?,
    })
}

pub fn random_relative(heads: usize, head_dim: usize, device: &Device) -> Result<RelativeParts> {
    let feature = heads * head_dim;
    let weight = Tensor::randn(0f32, 0.4, (feature, feature), device)?;
    Ok(RelativeParts {
        linear_pos: Linear::new(LinearConfig::without_bias(feature, feature), weight, None)?,
        bias: PositionBias::new(
            Tensor::randn(0f32, 0.5, (heads, head_dim), device)?,
            Tensor::randn(0f32, 0.5, (heads, head_dim), device)?,
        )?,
    })
}

/// Two layers sharing every weight, differing only in scoring kind.
pub fn twin_layers(
    heads: usize,
    head_dim: usize,
    first: AttentionKind,
    second: AttentionKind,
    max_cache_len: usize,
    device: &Device,
) -> Result<(MultiHeadAttention, MultiHeadAttention)> {
    let feature = heads * head_dim;
    let projections = random_projections(feature, device)?;
    let relative = random_relative(heads, head_dim, device)?;
    let build = |kind: AttentionKind| -> Result<MultiHeadAttention> {
        let mut config = AttentionConfig::new(heads, feature, kind);
        config.max_cache_len = max_cache_len;
        Ok(MultiHeadAttention::from_parts(
            config,
            projections.clone(),
            Some(relative.clone()),
        )?)
    };
    Ok((build(first)?, build(second)?))
}

pub fn max_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
    Ok(a.to_dtype(DType::F32)?
        .sub(&b.to_dtype(DType::F32)?)?
        .abs()?
        .max_all()?
        .to_vec0::<f32>()?)
}
