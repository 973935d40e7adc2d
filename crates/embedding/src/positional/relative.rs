//! Relative sinusoidal positional encoding (Transformer-XL style).
//!
//! For a table built for length `L`, row `j` encodes the relative offset
//! `(L - 1) - j`: positive offsets (keys to the left of the query) come first
//! and negative offsets (keys to the right) last. Callers receive the centered
//! window of `2 * T - 1` rows covering offsets `T - 1 ..= -(T - 1)`, which is
//! the layout the relative-shift in the attention crate expects.

use candle_core::{bail, Device, Result, Tensor};

use super::{match_dtype, scale_input, sinusoid_table, train_dropout, PositionalConfig};

/// Growable table over symmetric relative offsets.
#[derive(Debug, Clone)]
pub struct RelPositionalEncoding {
    config: PositionalConfig,
    device: Device,
    table: Tensor,
    training: bool,
}

impl RelPositionalEncoding {
    /// Builds the encoder covering sequences up to `config.max_len` frames.
    pub fn new(config: PositionalConfig, device: &Device) -> Result<Self> {
        config.validate()?;
        let table = Self::build(config.max_len.max(1), config.d_model, device)?;
        Ok(Self {
            config,
            device: device.clone(),
            table,
            training: false,
        })
    }

    pub fn config(&self) -> &PositionalConfig {
        &self.config
    }

    /// Longest sequence (query plus cache) the current table covers.
    pub fn max_length(&self) -> usize {
        (self.table.dims()[1] + 1) / 2
    }

    /// `(1, 2 * max_length - 1, d_model)` table in `f32`.
    pub fn table(&self) -> &Tensor {
        &self.table
    }

    pub fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    /// Regenerates the table when it covers fewer than `2 * length - 1` offsets.
    pub fn ensure_length(&mut self, length: usize) -> Result<()> {
        if self.max_length() >= length {
            return Ok(());
        }
        self.table = Self::build(length, self.config.d_model, &self.device)?;
        Ok(())
    }

    /// Centered `(1, 2 * length - 1, d_model)` window over offsets
    /// `length - 1 ..= -(length - 1)`, without dropout.
    pub fn window(&mut self, length: usize) -> Result<Tensor> {
        if length == 0 {
            bail!("relative positional window needs a positive length");
        }
        self.ensure_length(length)?;
        let start = self.max_length() - length;
        self.table.narrow(1, start, 2 * length - 1)
    }

    /// Returns `(dropout(x * xscale), pos_emb)` where `pos_emb` covers the
    /// `time + cache_len` frames the attention layer will see as keys.
    pub fn forward(&mut self, x: &Tensor, cache_len: usize) -> Result<(Tensor, Tensor)> {
        let (_, time, width) = x.dims3()?;
        if width != self.config.d_model {
            bail!(
                "relative positional encoding expects width {}, got {width}",
                self.config.d_model
            );
        }
        let pos_emb = match_dtype(&self.window(time + cache_len)?, x.dtype())?;
        let pos_emb = train_dropout(&pos_emb, self.config.emb_dropout_p, self.training)?;

        let x = scale_input(x, self.config.xscale)?;
        Ok((
            train_dropout(&x, self.config.dropout_p, self.training)?,
            pos_emb,
        ))
    }

    fn build(length: usize, d_model: usize, device: &Device) -> Result<Tensor> {
        log::debug!("relative positional table regenerated: len={length} d_model={d_model}");
        let last = length as i64 - 1;
        let positions: Vec<f64> = (-last..=last).rev().map(|p| p as f64).collect();
        sinusoid_table(&positions, d_model, device)
    }
}
