//! Absolute sinusoidal positional encoding.

use candle_core::{bail, Device, Result, Tensor};

use super::{match_dtype, scale_input, sinusoid_table, train_dropout, PositionalConfig};

/// Adds `pe[0..T]` to the (optionally scaled) input.
#[derive(Debug, Clone)]
pub struct AbsolutePositionalEncoding {
    config: PositionalConfig,
    device: Device,
    table: Tensor,
    training: bool,
}

impl AbsolutePositionalEncoding {
    /// Builds the encoder with a table covering `config.max_len` positions.
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

    /// Number of positions currently tabulated.
    pub fn len(&self) -> usize {
        self.table.dims()[1]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `(1, len, d_model)` table in `f32`.
    pub fn table(&self) -> &Tensor {
        &self.table
    }

    pub fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    /// Regenerates the table when it covers fewer than `length` positions.
    pub fn ensure_length(&mut self, length: usize) -> Result<()> {
        if self.len() >= length {
            return Ok(());
        }
        self.table = Self::build(length, self.config.d_model, &self.device)?;
        Ok(())
    }

    /// Returns `(dropout(x * xscale + pe), pe)` for `x` shaped `(batch, time, d_model)`.
    pub fn forward(&mut self, x: &Tensor) -> Result<(Tensor, Tensor)> {
        let (_, time, width) = x.dims3()?;
        if width != self.config.d_model {
            bail!(
                "absolute positional encoding expects width {}, got {width}",
                self.config.d_model
            );
        }
        self.ensure_length(time)?;

        let x = scale_input(x, self.config.xscale)?;
        let pos_emb = match_dtype(&self.table.narrow(1, 0, time)?, x.dtype())?;
        let pos_emb = train_dropout(&pos_emb, self.config.emb_dropout_p, self.training)?;
        let x = x.broadcast_add(&pos_emb)?;
        Ok((
            train_dropout(&x, self.config.dropout_p, self.training)?,
            pos_emb,
        ))
    }

    fn build(length: usize, d_model: usize, device: &Device) -> Result<Tensor> {
        log::debug!("absolute positional table regenerated: len={length} d_model={d_model}");
        let positions: Vec<f64> = (0..length).map(|p| p as f64).collect();
        sinusoid_table(&positions, d_model, device)
    }
}
