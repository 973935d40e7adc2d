//! Sinusoidal positional encodings.
//!
//! Three generators share one sinusoid formula and differ in the positions
//! they tabulate:
//! - [`absolute::AbsolutePositionalEncoding`]: positions `0..L`, added to the input.
//! - [`relative::RelPositionalEncoding`]: offsets `+(L-1) ..= -(L-1)`, returned
//!   alongside the input for relative-bias attention.
//! - [`local::LocalRelPositionalEncoding`]: offsets `+left ..= -right` of a fixed
//!   attention window, built once.
//!
//! Tables are stored in `f32` shaped `(1, positions, d_model)` and cast to the
//! input dtype on use.

pub mod absolute;
pub mod local;
pub mod relative;

use candle_core::{bail, DType, Device, Result, Tensor};
use serde::{Deserialize, Serialize};

/// Default number of positions tabulated before the first call.
pub const DEFAULT_MAX_LEN: usize = 5000;

const SINUSOID_BASE: f64 = 10_000.0;

/// Shared configuration for every positional encoder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PositionalConfig {
    /// Embedding width; must be even.
    pub d_model: usize,
    /// Dropout applied to the (scaled) input during training.
    pub dropout_p: f32,
    /// Dropout applied to the positional embedding during training; `0` disables it.
    pub emb_dropout_p: f32,
    /// Length the table is pre-extended to at construction.
    pub max_len: usize,
    /// Optional multiplier for the input, usually `sqrt(d_model)`.
    pub xscale: Option<f64>,
}

impl Default for PositionalConfig {
    fn default() -> Self {
        Self {
            d_model: 0,
            dropout_p: 0.0,
            emb_dropout_p: 0.0,
            max_len: DEFAULT_MAX_LEN,
            xscale: None,
        }
    }
}

impl PositionalConfig {
    /// Configuration with the given width and no dropout or scaling.
    pub fn new(d_model: usize) -> Self {
        Self {
            d_model,
            ..Self::default()
        }
    }

    /// Sets `xscale` to `sqrt(d_model)`.
    pub fn with_sqrt_xscale(mut self) -> Self {
        self.xscale = Some((self.d_model as f64).sqrt());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.d_model == 0 || self.d_model % 2 != 0 {
            bail!(
                "positional encoding requires a positive even d_model, got {}",
                self.d_model
            );
        }
        for (name, p) in [
            ("dropout_p", self.dropout_p),
            ("emb_dropout_p", self.emb_dropout_p),
        ] {
            if !(0.0..1.0).contains(&p) {
                bail!("{name} must be in [0, 1), got {p}");
            }
        }
        if let Some(scale) = self.xscale {
            if !scale.is_finite() {
                bail!("xscale must be finite, got {scale}");
            }
        }
        Ok(())
    }
}

/// Builds the `(1, positions.len(), d_model)` sinusoid table.
///
/// Column `2i` holds `sin(p / 10000^(2i/d_model))` and column `2i+1` the
/// matching cosine. Angles are evaluated in `f64` before narrowing to `f32`.
pub fn sinusoid_table(positions: &[f64], d_model: usize, device: &Device) -> Result<Tensor> {
    if d_model == 0 || d_model % 2 != 0 {
        bail!("sinusoid table requires a positive even d_model, got {d_model}");
    }
    let half = d_model / 2;
    let inv_freqs: Vec<f64> = (0..half)
        .map(|i| (-((2 * i) as f64) * SINUSOID_BASE.ln() / d_model as f64).exp())
        .collect();

    let mut data = Vec::with_capacity(positions.len() * d_model);
    for &pos in positions {
        for &inv_freq in &inv_freqs {
            let angle = pos * inv_freq;
            data.push(angle.sin() as f32);
            data.push(angle.cos() as f32);
        }
    }
    Tensor::from_vec(data, (1, positions.len(), d_model), device)
}

/// Scales the input by `xscale` when configured.
pub(crate) fn scale_input(x: &Tensor, xscale: Option<f64>) -> Result<Tensor> {
    match xscale {
        Some(scale) => x.affine(scale, 0.0),
        None => Ok(x.clone()),
    }
}

/// Dropout that is the identity outside training or when `p == 0`.
pub(crate) fn train_dropout(x: &Tensor, p: f32, training: bool) -> Result<Tensor> {
    if training && p > 0.0 {
        candle_nn::ops::dropout(x, p)
    } else {
        Ok(x.clone())
    }
}

/// Casts a table slice to the dtype of the tensor it is combined with.
pub(crate) fn match_dtype(table: &Tensor, dtype: DType) -> Result<Tensor> {
    if table.dtype() == dtype {
        Ok(table.clone())
    } else {
        table.to_dtype(dtype)
    }
}

pub use absolute::AbsolutePositionalEncoding;
pub use local::LocalRelPositionalEncoding;
pub use relative::RelPositionalEncoding;
