//! Embedding crate
//!
//! The positional module exposes sinusoidal absolute, relative and
//! local-window positional encodings consumed by the attention crate.

pub mod positional;

pub use positional::*;
