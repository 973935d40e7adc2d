//! Error types emitted by attention implementations.

use thiserror::Error;

/// Attention-specific error category.
#[derive(Debug, Error)]
pub enum AttentionError {
    /// A construction parameter violates an invariant of the selected variant.
    #[error("invalid attention configuration: {context}")]
    InvalidConfig { context: String },
    /// The supplied tensor shapes do not align with the documented contract.
    #[error("invalid tensor shape for {context}")]
    InvalidShape { context: String },
    /// The kernel does not support the requested data type.
    #[error("unsupported dtype {requested}")]
    UnsupportedDType { requested: String },
    /// A cache was supplied to an instance that has no slot assigned.
    #[error("a cache was supplied but no cache_id is assigned to this attention layer")]
    MissingCacheId,
    /// The assigned slot does not exist in the supplied cache.
    #[error("cache_id {id} is out of range for a cache with {slots} slots")]
    CacheSlotOutOfRange { id: usize, slots: usize },
    /// A TOML configuration fragment could not be parsed.
    #[error("failed to parse attention configuration: {message}")]
    ConfigParse { message: String },
    /// A backend-specific failure propagated to the caller.
    #[error("backend error: {source}")]
    Backend {
        #[from]
        source: candle_core::Error,
    },
}

impl AttentionError {
    pub(crate) fn shape(context: impl Into<String>) -> Self {
        Self::InvalidShape {
            context: context.into(),
        }
    }

    pub(crate) fn config(context: impl Into<String>) -> Self {
        Self::InvalidConfig {
            context: context.into(),
        }
    }
}

impl From<toml::de::Error> for AttentionError {
    fn from(err: toml::de::Error) -> Self {
        Self::ConfigParse {
            message: err.to_string(),
        }
    }
}
