//! Relative positional encoding for a fixed local attention window.

use candle_core::{bail, Device, Result, Tensor};

use super::{match_dtype, scale_input, sinusoid_table, train_dropout, PositionalConfig};

/// Table over offsets `+left ..= -right`, built once and never regrown.
#[derive(Debug, Clone)]
pub struct LocalRelPositionalEncoding {
    config: PositionalConfig,
    left_context: usize,
    right_context: usize,
    table: Tensor,
    training: bool,
}

impl LocalRelPositionalEncoding {
    /// Builds the `(1, left + right + 1, d_model)` table for the given window.
    pub fn new(
        config: PositionalConfig,
        att_context_size: [i64; 2],
        device: &Device,
    ) -> Result<Self> {
        config.validate()?;
        let [left, right] = att_context_size;
        if left < 0 || right < 0 {
            bail!("local attention context must be non-negative, got [{left}, {right}]");
        }
        let positions: Vec<f64> = (-right..=left).rev().map(|p| p as f64).collect();
        log::debug!(
            "local positional table built: left={left} right={right} d_model={}",
            config.d_model
        );
        let table = sinusoid_table(&positions, config.d_model, device)?;
        Ok(Self {
            config,
            left_context: left as usize,
            right_context: right as usize,
            table,
            training: false,
        })
    }

    pub fn config(&self) -> &PositionalConfig {
        &self.config
    }

    /// `(left, right)` context of the window.
    pub fn context(&self) -> (usize, usize) {
        (self.left_context, self.right_context)
    }

    pub fn table(&self) -> &Tensor {
        &self.table
    }

    pub fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    /// Returns `(dropout(x * xscale), pos_emb)`; `pos_emb` is the whole table
    /// regardless of the input length.
    pub fn forward(&self, x: &Tensor) -> Result<(Tensor, Tensor)> {
        let (_, _, width) = x.dims3()?;
        if width != self.config.d_model {
            bail!(
                "local positional encoding expects width {}, got {width}",
                self.config.d_model
            );
        }
        let pos_emb = match_dtype(&self.table, x.dtype())?;
        let pos_emb = train_dropout(&pos_emb, self.config.emb_dropout_p, self.training)?;
        let x = scale_input(x, self.config.xscale)?;
        Ok((
            train_dropout(&x, self.config.dropout_p, self.training)?,
            pos_emb,
        ))
    }
}
