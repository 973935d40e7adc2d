//! Streaming cache access for attention layers.
//!
//! During streaming inference each layer prepends the frames stored in its
//! cache slot to the incoming key/value stream and produces the next state of
//! the slot. The old state is always read before the next one is written, so
//! [`CacheAccess::InPlace`] is safe even though it reads and writes the same
//! buffer.

pub mod slots;

pub use slots::{next_cache_state, CacheSlots};

/// How a forward call interacts with the streaming cache.
#[derive(Debug, Default)]
pub enum CacheAccess<'a> {
    /// No cache: keys and values are exactly the supplied tensors.
    #[default]
    None,
    /// Prepend the cached frames without producing a next state.
    Read(&'a CacheSlots),
    /// Prepend from `cache` and write the next state into `next`.
    ReadWrite {
        cache: &'a CacheSlots,
        next: &'a mut CacheSlots,
    },
    /// Prepend from the slots and overwrite them with the next state.
    InPlace(&'a mut CacheSlots),
}

impl CacheAccess<'_> {
    /// Slots the cached frames are read from.
    pub fn current(&self) -> Option<&CacheSlots> {
        match self {
            CacheAccess::None => None,
            CacheAccess::Read(cache) => Some(&**cache),
            CacheAccess::ReadWrite { cache, .. } => Some(&**cache),
            CacheAccess::InPlace(cache) => Some(&**cache),
        }
    }

    /// Whether the call produces a next cache state.
    pub fn writes(&self) -> bool {
        matches!(
            self,
            CacheAccess::ReadWrite { .. } | CacheAccess::InPlace(_)
        )
    }

    /// Buffer receiving the next state, if any.
    pub(crate) fn target(&mut self) -> Option<&mut CacheSlots> {
        match self {
            CacheAccess::ReadWrite { next, .. } => Some(&mut **next),
            CacheAccess::InPlace(cache) => Some(&mut **cache),
            _ => None,
        }
    }
}
