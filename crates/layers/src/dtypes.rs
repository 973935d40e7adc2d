//! Precision and dtype policy utilities used throughout the attention stack.
//!
//! Parameters and activations may arrive in `f16`/`bf16` for memory
//! efficiency, but attention scores span a dynamic range that reduced
//! precision cannot hold: a softmax over scores computed in half precision
//! saturates or underflows. [`PrecisionPolicy`] records the dtype tensors are
//! stored in and the dtype matmuls and reductions run in, and exposes the
//! casts between the two so that every component promotes and restores
//! tensors the same way.

use candle_core::{DType, Result, Tensor};

/// Describes how tensors should be cast during different phases of a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrecisionPolicy {
    storage: DType,
    compute: DType,
}

impl PrecisionPolicy {
    /// Constructs a new policy from explicit dtype selections.
    pub fn new(storage: DType, compute: DType) -> Self {
        Self { storage, compute }
    }

    /// Policy that computes in the same dtype it stores.
    pub fn uniform(dtype: DType) -> Self {
        Self::new(dtype, dtype)
    }

    /// Builds a policy from the storage dtype, promoting half types to `f32`.
    pub fn from_parameter_dtype(storage: DType) -> Self {
        let compute = if is_reduced_precision(storage) {
            DType::F32
        } else {
            storage
        };
        Self::new(storage, compute)
    }

    /// Returns the dtype used to store parameters and outputs.
    pub fn storage(&self) -> DType {
        self.storage
    }

    /// Returns the dtype used for matmuls, softmax and reductions.
    pub fn compute(&self) -> DType {
        self.compute
    }

    /// Indicates whether computation is promoted above the storage dtype.
    pub fn is_mixed_precision(&self) -> bool {
        self.storage != self.compute
    }

    /// Casts a tensor to the compute dtype for matmul readiness.
    pub fn cast_for_matmul(&self, tensor: &Tensor) -> Result<Tensor> {
        cast_tensor(tensor, self.compute)
    }

    /// Casts a tensor back to the storage dtype (or leaves it unchanged).
    pub fn cast_to_storage(&self, tensor: &Tensor) -> Result<Tensor> {
        cast_tensor(tensor, self.storage)
    }
}

/// Returns `true` for the half-precision floating point dtypes.
pub fn is_reduced_precision(dtype: DType) -> bool {
    matches!(dtype, DType::F16 | DType::BF16)
}

fn cast_tensor(tensor: &Tensor, dtype: DType) -> Result<Tensor> {
    if tensor.dtype() == dtype {
        Ok(tensor.clone())
    } else {
        tensor.to_dtype(dtype)
    }
}
