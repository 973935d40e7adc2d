//! Portable, exact implementation of dense attention.
//!
//! This path favours clarity over performance and serves as the baseline for
//! validating the banded kernel.

pub mod exact;

pub use exact::ExactAttention;
