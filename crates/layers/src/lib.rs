//! Building blocks shared by the attention crates.
//!
//! The crate hosts the dense projections used for query/key/value/output and
//! positional projections, the precision policy that decides which dtype
//! matmuls run in, and small shape validation helpers. Everything operates on
//! Candle tensors and reports failures through `candle_core::Result`.

pub mod checks;
pub mod dtypes;
pub mod linear;

pub use dtypes::PrecisionPolicy;
pub use linear::{Linear, LinearConfig, LinearInit, LinearLayer};
