//! Fixed-capacity streaming cache slots.
//!
//! A [`CacheSlots`] value wraps one tensor shaped
//! `[slot_count, batch, capacity, feature]`. Each attention layer of a
//! streaming encoder owns one slot (its `cache_id`) holding the trailing
//! input frames it has already seen.

use candle_core::{DType, Device, Tensor};

use crate::core::AttentionError;

/// Stacked cache slots shared by several attention layers.
#[derive(Debug, Clone)]
pub struct CacheSlots {
    data: Tensor,
}

impl CacheSlots {
    /// Wraps an existing `[slot_count, batch, capacity, feature]` tensor.
    pub fn new(data: Tensor) -> Result<Self, AttentionError> {
        if data.rank() != 4 {
            return Err(AttentionError::shape(format!(
                "cache must have shape [slots, batch, capacity, feature], got {:?}",
                data.dims()
            )));
        }
        Ok(Self { data })
    }

    /// Zero-initialised slots.
    pub fn zeros(
        slots: usize,
        batch: usize,
        capacity: usize,
        feature: usize,
        dtype: DType,
        device: &Device,
    ) -> Result<Self, AttentionError> {
        Self::new(Tensor::zeros(
            (slots, batch, capacity, feature),
            dtype,
            device,
        )?)
    }

    pub fn slot_count(&self) -> usize {
        self.data.dims()[0]
    }

    pub fn batch(&self) -> usize {
        self.data.dims()[1]
    }

    pub fn capacity(&self) -> usize {
        self.data.dims()[2]
    }

    pub fn feature(&self) -> usize {
        self.data.dims()[3]
    }

    pub fn tensor(&self) -> &Tensor {
        &self.data
    }

    pub fn into_tensor(self) -> Tensor {
        self.data
    }

    /// Snapshot of slot `id`, shaped `[batch, capacity, feature]`.
    pub fn slot(&self, id: usize) -> Result<Tensor, AttentionError> {
        self.check_id(id)?;
        Ok(self.data.get(id)?)
    }

    /// Replaces the contents of slot `id`.
    pub fn write_slot(&mut self, id: usize, state: &Tensor) -> Result<(), AttentionError> {
        self.check_id(id)?;
        let expected = [self.batch(), self.capacity(), self.feature()];
        if state.dims() != expected {
            return Err(AttentionError::shape(format!(
                "cache slot state must be {expected:?}, got {:?}",
                state.dims()
            )));
        }
        let state = state.to_dtype(self.data.dtype())?.unsqueeze(0)?;
        self.data = self.data.slice_assign(
            &[
                id..id + 1,
                0..expected[0],
                0..expected[1],
                0..expected[2],
            ],
            &state,
        )?;
        Ok(())
    }

    fn check_id(&self, id: usize) -> Result<(), AttentionError> {
        let slots = self.slot_count();
        if id < slots {
            Ok(())
        } else {
            Err(AttentionError::CacheSlotOutOfRange { id, slots })
        }
    }
}

/// Next state of a slot after seeing `query`.
///
/// The first `keep = q_len - drop_size` query frames are appended to the old
/// state and the oldest frames fall off the front so the capacity is kept:
/// `next = cat(slot[keep..], query[..keep])`. With `keep == 0` the state is
/// unchanged; with `keep > capacity` only the newest `capacity` of the kept
/// frames survive.
pub fn next_cache_state(
    slot: &Tensor,
    query: &Tensor,
    drop_size: usize,
) -> Result<Tensor, AttentionError> {
    let (batch, capacity, feature) = slot.dims3()?;
    let (q_batch, q_len, q_feature) = query.dims3()?;
    if q_batch != batch || q_feature != feature {
        return Err(AttentionError::shape(format!(
            "query [{q_batch}, {q_len}, {q_feature}] vs cache slot [{batch}, {capacity}, {feature}]"
        )));
    }
    if drop_size > q_len {
        return Err(AttentionError::config(format!(
            "cache_drop_size {drop_size} exceeds query length {q_len}"
        )));
    }

    let keep = q_len - drop_size;
    let query = query.to_dtype(slot.dtype())?;
    let next = if keep == 0 {
        slot.clone()
    } else if keep >= capacity {
        query.narrow(1, keep - capacity, capacity)?
    } else {
        Tensor::cat(
            &[
                &slot.narrow(1, keep, capacity - keep)?,
                &query.narrow(1, 0, keep)?,
            ],
            1,
        )?
    };
    Ok(next.contiguous()?)
}
