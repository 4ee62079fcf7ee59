//! Device and buffer collaborator interfaces.
//!
//! The parameter/gradient tensor implementation lives outside this crate;
//! it is consumed through the object-safe [`FlatBuffer`] and
//! [`DeviceContext`] traits. [`HostDevice`] is the in-memory CPU
//! implementation used by the local fallback path and the tests.

use crate::error::{GradsyncError, Result};
use std::any::Any;
use std::ops::Range;
use std::sync::Mutex;

/// Element kind of a device buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementType {
    F32,
    F16,
}

/// Class of execution hardware backing a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Cpu,
    Gpu,
}

/// A flat per-device numeric buffer (gradient or parameter vector).
///
/// Host copies stage through f32 regardless of the stored element type.
/// `as_any` is the downcast seam for backends that need direct access to
/// the concrete buffer (the NCCL backend requires its CUDA buffer type).
pub trait FlatBuffer: Send + Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn element_type(&self) -> ElementType;

    /// Copy `range` of the buffer into `out` (`out.len() == range.len()`).
    fn copy_to_host(&self, range: Range<usize>, out: &mut [f32]) -> Result<()>;

    /// Overwrite `range` of the buffer from `src` (`src.len() == range.len()`).
    fn copy_from_host(&self, range: Range<usize>, src: &[f32]) -> Result<()>;

    /// Set every element in `range` to `value`.
    fn fill(&self, range: Range<usize>, value: f32) -> Result<()>;

    fn as_any(&self) -> &dyn Any;
}

/// Per-device execution context: a compute stream plus the gradient and
/// parameter buffers bound to it.
///
/// The stream and any communication handle bound to the device are owned
/// exclusively by the communicator for the device's lifetime.
pub trait DeviceContext: Send + Sync {
    fn kind(&self) -> DeviceKind;

    /// Device ordinal within the process (0..devices_per_process).
    fn ordinal(&self) -> usize;

    /// Make this device the active context on the calling thread.
    fn set_active(&self) -> Result<()>;

    /// Block until the device's compute stream has drained.
    fn synchronize_stream(&self) -> Result<()>;

    fn grads(&self) -> &dyn FlatBuffer;

    fn params(&self) -> &dyn FlatBuffer;

    fn as_any(&self) -> &dyn Any;
}

/// Host-memory f32 buffer.
pub struct HostBuffer {
    data: Mutex<Vec<f32>>,
}

impl HostBuffer {
    pub fn zeros(len: usize) -> Self {
        Self {
            data: Mutex::new(vec![0.0; len]),
        }
    }

    pub fn from_vec(data: Vec<f32>) -> Self {
        Self {
            data: Mutex::new(data),
        }
    }

    /// Copy of the full buffer contents, for inspection.
    pub fn snapshot(&self) -> Vec<f32> {
        self.data.lock().expect("host buffer poisoned").clone()
    }

    fn check_range(&self, range: &Range<usize>, slice_len: usize) -> Result<()> {
        let len = self.len();
        if range.end > len || range.len() != slice_len {
            return Err(GradsyncError::Config(format!(
                "host buffer range {}..{} with slice length {slice_len} does not fit buffer of length {len}",
                range.start, range.end
            )));
        }
        Ok(())
    }
}

impl FlatBuffer for HostBuffer {
    fn len(&self) -> usize {
        self.data.lock().expect("host buffer poisoned").len()
    }

    fn element_type(&self) -> ElementType {
        ElementType::F32
    }

    fn copy_to_host(&self, range: Range<usize>, out: &mut [f32]) -> Result<()> {
        self.check_range(&range, out.len())?;
        let data = self.data.lock().expect("host buffer poisoned");
        out.copy_from_slice(&data[range]);
        Ok(())
    }

    fn copy_from_host(&self, range: Range<usize>, src: &[f32]) -> Result<()> {
        self.check_range(&range, src.len())?;
        let mut data = self.data.lock().expect("host buffer poisoned");
        data[range].copy_from_slice(src);
        Ok(())
    }

    fn fill(&self, range: Range<usize>, value: f32) -> Result<()> {
        self.check_range(&range, range.len())?;
        let mut data = self.data.lock().expect("host buffer poisoned");
        for v in &mut data[range] {
            *v = value;
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// In-memory CPU device: no real stream, so activation and stream
/// synchronization are no-ops.
pub struct HostDevice {
    ordinal: usize,
    grads: HostBuffer,
    params: HostBuffer,
}

impl HostDevice {
    pub fn new(ordinal: usize, len: usize) -> Self {
        Self {
            ordinal,
            grads: HostBuffer::zeros(len),
            params: HostBuffer::zeros(len),
        }
    }

    pub fn with_buffers(ordinal: usize, grads: Vec<f32>, params: Vec<f32>) -> Self {
        Self {
            ordinal,
            grads: HostBuffer::from_vec(grads),
            params: HostBuffer::from_vec(params),
        }
    }

    pub fn grads_host(&self) -> &HostBuffer {
        &self.grads
    }

    pub fn params_host(&self) -> &HostBuffer {
        &self.params
    }
}

impl DeviceContext for HostDevice {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Cpu
    }

    fn ordinal(&self) -> usize {
        self.ordinal
    }

    fn set_active(&self) -> Result<()> {
        Ok(())
    }

    fn synchronize_stream(&self) -> Result<()> {
        Ok(())
    }

    fn grads(&self) -> &dyn FlatBuffer {
        &self.grads
    }

    fn params(&self) -> &dyn FlatBuffer {
        &self.params
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_buffer_copy_roundtrip() {
        let buf = HostBuffer::zeros(8);
        buf.copy_from_host(2..5, &[1.0, 2.0, 3.0]).unwrap();
        let mut out = [0.0; 3];
        buf.copy_to_host(2..5, &mut out).unwrap();
        assert_eq!(out, [1.0, 2.0, 3.0]);
        assert_eq!(buf.snapshot(), vec![0.0, 0.0, 1.0, 2.0, 3.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn host_buffer_fill() {
        let buf = HostBuffer::from_vec(vec![1.0; 6]);
        buf.fill(0..2, 0.0).unwrap();
        buf.fill(4..6, 0.0).unwrap();
        assert_eq!(buf.snapshot(), vec![0.0, 0.0, 1.0, 1.0, 0.0, 0.0]);
    }

    #[test]
    fn mismatched_range_is_a_config_error() {
        let buf = HostBuffer::zeros(4);
        let mut out = [0.0; 3];
        assert!(buf.copy_to_host(0..2, &mut out).is_err());
        assert!(buf.copy_from_host(2..6, &[0.0; 4]).is_err());
    }
}
