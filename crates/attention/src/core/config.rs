//! Configuration options shared by all attention implementations.
//!
//! [`AttentionConfig`] is the construction-time description of a
//! [`MultiHeadAttention`](crate::MultiHeadAttention) layer and can be loaded
//! from a TOML fragment. The per-call [`Config`] captures run-time knobs such
//! as dropout that callers can tune without swapping implementations.

use serde::{Deserialize, Serialize};

use super::AttentionError;

/// Configuration driving a single attention call.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Config {
    /// Probability for dropout applied to attention weights during training.
    ///
    /// When `None`, dropout is disabled and the computation is deterministic.
    pub dropout_p: Option<f32>,
}

impl Config {
    /// Dropout enabled with `p` when `training` is set and `p > 0`.
    pub fn for_mode(dropout_p: f32, training: bool) -> Self {
        Self {
            dropout_p: (training && dropout_p > 0.0).then_some(dropout_p),
        }
    }
}

/// Precision handling for reduced-precision inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrecisionMode {
    /// Promote `f16`/`bf16` inputs to `f32` for projections, scores and softmax.
    #[default]
    ForceF32,
    /// Compute in whatever dtype the inputs arrive in.
    Inherit,
}

/// Scoring strategy selected at construction.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AttentionKind {
    /// Plain scaled dot-product attention.
    #[default]
    Absolute,
    /// Transformer-XL relative-position attention over the full sequence.
    RelPosition,
    /// Relative-position attention restricted to `[left, right]` frames around each query.
    LocalRelPosition { att_context_size: [i64; 2] },
}

/// Construction parameters of a multi-head attention layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttentionConfig {
    /// Number of attention heads.
    pub heads: usize,
    /// Model width; must be divisible by `heads`.
    pub feature: usize,
    /// Dropout on attention weights, applied in training mode only.
    #[serde(default)]
    pub dropout_p: f32,
    /// Largest cache capacity this layer accepts; `0` disables caching.
    #[serde(default)]
    pub max_cache_len: usize,
    #[serde(default)]
    pub kind: AttentionKind,
    #[serde(default)]
    pub precision: PrecisionMode,
}

impl AttentionConfig {
    pub fn new(heads: usize, feature: usize, kind: AttentionKind) -> Self {
        Self {
            heads,
            feature,
            dropout_p: 0.0,
            max_cache_len: 0,
            kind,
            precision: PrecisionMode::default(),
        }
    }

    /// Parses and validates a TOML fragment.
    ///
    /// ```toml
    /// heads = 4
    /// feature = 256
    /// max_cache_len = 64
    /// kind = { type = "local_rel_position", att_context_size = [64, 0] }
    /// ```
    pub fn from_toml_str(source: &str) -> Result<Self, AttentionError> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Width of a single head.
    pub fn head_dim(&self) -> usize {
        if self.heads == 0 {
            0
        } else {
            self.feature / self.heads
        }
    }

    /// Band half-width `w = max(left, right)` for the local variant.
    pub fn window(&self) -> Option<i64> {
        match self.kind {
            AttentionKind::LocalRelPosition {
                att_context_size: [left, right],
            } => Some(left.max(right)),
            _ => None,
        }
    }

    /// Reports the first violated invariant.
    pub fn validate(&self) -> Result<(), AttentionError> {
        if self.heads == 0 {
            return Err(AttentionError::config("heads must be greater than 0"));
        }
        if self.feature == 0 {
            return Err(AttentionError::config("feature must be greater than 0"));
        }
        if self.feature % self.heads != 0 {
            return Err(AttentionError::config(format!(
                "feature {} is not divisible by heads {}",
                self.feature, self.heads
            )));
        }
        if !(0.0..1.0).contains(&self.dropout_p) {
            return Err(AttentionError::config(format!(
                "dropout_p must be in [0, 1), got {}",
                self.dropout_p
            )));
        }
        if let AttentionKind::LocalRelPosition {
            att_context_size: [left, right],
        } = self.kind
        {
            if left < 0 || right < 0 {
                return Err(AttentionError::config(format!(
                    "att_context_size must be non-negative, got [{left}, {right}]"
                )));
            }
            if left.max(right) <= 0 {
                return Err(AttentionError::config(
                    "local attention requires a context size greater than 0",
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_local_variant_from_toml() {
        let config = AttentionConfig::from_toml_str(
            r#"
            heads = 4
            feature = 32
            max_cache_len = 16
            precision = "inherit"
            kind = { type = "local_rel_position", att_context_size = [8, 2] }
            "#,
        )
        .expect("valid config");
        assert_eq!(config.head_dim(), 8);
        assert_eq!(config.window(), Some(8));
        assert_eq!(config.precision, PrecisionMode::Inherit);
        assert_eq!(config.dropout_p, 0.0);
    }

    #[test]
    fn defaults_to_absolute_scoring() {
        let config = AttentionConfig::from_toml_str("heads = 2\nfeature = 8").expect("valid");
        assert_eq!(config.kind, AttentionKind::Absolute);
        assert_eq!(config.precision, PrecisionMode::ForceF32);
        assert_eq!(config.window(), None);
    }

    #[test]
    fn rejects_zero_window_and_indivisible_width() {
        let zero = AttentionConfig::new(
            2,
            8,
            AttentionKind::LocalRelPosition {
                att_context_size: [0, 0],
            },
        );
        assert!(matches!(
            zero.validate(),
            Err(AttentionError::InvalidConfig { .. })
        ));

        let negative = AttentionConfig::new(
            2,
            8,
            AttentionKind::LocalRelPosition {
                att_context_size: [-4, 2],
            },
        );
        assert!(negative.validate().is_err());

        let uneven = AttentionConfig::new(3, 8, AttentionKind::Absolute);
        assert!(uneven.validate().is_err());
    }

    #[test]
    fn malformed_toml_reports_parse_error() {
        let err = AttentionConfig::from_toml_str("heads = \"four\"").unwrap_err();
        assert!(matches!(err, AttentionError::ConfigParse { .. }));
    }

    #[test]
    fn runtime_config_only_drops_out_in_training() {
        assert_eq!(Config::for_mode(0.1, false).dropout_p, None);
        assert_eq!(Config::for_mode(0.0, true).dropout_p, None);
        assert_eq!(Config::for_mode(0.1, true).dropout_p, Some(0.1));
    }
}
