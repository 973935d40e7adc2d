//! Invalid-location masks for banded score matrices.
//!
//! Row `i` of a banded matrix `[T, 2w + 1]` holds scores for keys
//! `i - w ..= i + w`. In the first and last `w` rows some of those keys fall
//! outside `0..T`; the entries are filled with `-inf` so they never receive
//! attention weight. The two triangular masks depend only on `w` and are
//! built once per `(w, device)`.

use std::collections::HashMap;
use std::sync::Mutex;

use candle_core::{Device, DeviceLocation, Error, Result, Tensor};

use crate::masks::MASK_DTYPE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum DeviceKind {
    Cpu,
    Cuda(usize),
    Metal(usize),
}

impl DeviceKind {
    fn from_device(device: &Device) -> Self {
        match device.location() {
            DeviceLocation::Cpu => Self::Cpu,
            DeviceLocation::Cuda { gpu_id } => Self::Cuda(gpu_id),
            DeviceLocation::Metal { gpu_id } => Self::Metal(gpu_id),
        }
    }
}

/// Beginning and ending triangles, each `[w, w + 1]`.
#[derive(Debug, Clone)]
struct Triangles {
    beginning: Tensor,
    ending: Tensor,
}

/// Memo of triangular masks keyed by window size and device.
#[derive(Debug, Default)]
pub struct InvalidLocationMemo {
    entries: Mutex<HashMap<(usize, DeviceKind), Triangles>>,
}

impl InvalidLocationMemo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of memoized window sizes.
    pub fn len(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `[1, 1, seq_len, 2w + 1]` mask of out-of-sequence band entries.
    ///
    /// `seq_len` must be at least `2w`, which holds for any sequence padded
    /// to a multiple of `2w`.
    pub fn mask(&self, w: usize, seq_len: usize, device: &Device) -> Result<Tensor> {
        if w == 0 || seq_len < 2 * w {
            return Err(Error::Msg(format!(
                "invalid-location mask needs w > 0 and seq_len >= 2w, got w={w} seq_len={seq_len}"
            )));
        }
        let triangles = self.triangles(w, device)?;
        let width = 2 * w + 1;

        let mut rows = vec![triangles.beginning.pad_with_zeros(1, 0, w)?];
        if seq_len > 2 * w {
            rows.push(Tensor::zeros((seq_len - 2 * w, width), MASK_DTYPE, device)?);
        }
        rows.push(triangles.ending.pad_with_zeros(1, w, 0)?);
        Tensor::cat(&rows, 0)?.reshape((1, 1, seq_len, width))
    }

    fn triangles(&self, w: usize, device: &Device) -> Result<Triangles> {
        let key = (w, DeviceKind::from_device(device));
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| Error::Msg("invalid-location memo mutex poisoned".to_string()))?;
        if let Some(found) = entries.get(&key) {
            return Ok(found.clone());
        }

        log::debug!("invalid-location memo miss: w={w} device={:?}", key.1);
        let triangles = Triangles {
            beginning: triangle(w, device, |r, c| r + c < w)?,
            ending: triangle(w, device, |r, c| r + c > w - 1)?,
        };
        entries.insert(key, triangles.clone());
        Ok(triangles)
    }
}

fn triangle(w: usize, device: &Device, invalid: impl Fn(usize, usize) -> bool) -> Result<Tensor> {
    let width = w + 1;
    let data: Vec<u8> = (0..w * width)
        .map(|idx| u8::from(invalid(idx / width, idx % width)))
        .collect();
    Tensor::from_vec(data, (w, width), device)
}
