//! Shared-memory transfer of bulk array data to the worker.
//!
//! Each bulk transfer gets its own segment:
//!
//! ```text
//!   caller                                   worker script
//!   ──────                                   ─────────────
//!   allocate(shape, dtype)  ──┐
//!   write_from(array)         │  name + shape + dtype embedded in script text
//!   submit(task) ─────────────┴────────────► attach, copy, close, unlink
//!   close()  (always)
//!   unlink() (error paths only)
//! ```
//!
//! The consumer unlinks the segment once it has copied the data out; the
//! creator always closes its own mapping, and on error paths also unlinks so
//! a failed task never leaves a segment behind.

mod memory;
mod shm;

pub use memory::{ChannelStats, MemoryBuffer, MemoryChannel};
pub use shm::{ShmBuffer, ShmChannel};

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::array::{DType, NdArray};
use crate::error::{BridgeError, Result};

/// Prefix of every segment name created by this process.
pub const NAME_PREFIX: &str = "sgb";

/// Longest name we generate. macOS rejects shm names over 31 bytes
/// including the leading slash.
pub const MAX_NAME_LEN: usize = 30;

static NAME_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a segment name unique within this process and, with high
/// probability, across processes.
pub fn unique_name() -> String {
    let random = uuid::Uuid::new_v4().simple().to_string();
    let seq = NAME_COUNTER.fetch_add(1, Ordering::Relaxed);
    let mut name = format!("{}{}_{:x}", NAME_PREFIX, &random[..16], seq);
    name.truncate(MAX_NAME_LEN);
    name
}

/// Everything the worker needs to rebuild an array from a segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferDescriptor {
    /// Segment name token, without the leading slash.
    pub name: String,
    pub dtype: DType,
    pub shape: Vec<usize>,
}

impl BufferDescriptor {
    pub fn new(name: String, dtype: DType, shape: Vec<usize>) -> Self {
        Self { name, dtype, shape }
    }

    pub fn byte_size(&self) -> usize {
        self.shape.iter().product::<usize>() * self.dtype.width()
    }

    /// Check that `array` fits this buffer exactly.
    pub fn check_compatible(&self, array: &NdArray) -> Result<()> {
        if array.dtype() != self.dtype {
            return Err(BridgeError::InvalidInput(format!(
                "buffer {} holds {} elements, array is {}",
                self.name,
                self.dtype,
                array.dtype()
            )));
        }
        if array.shape() != self.shape.as_slice() {
            return Err(BridgeError::InvalidInput(format!(
                "buffer {} has shape {:?}, array has shape {:?}",
                self.name,
                self.shape,
                array.shape()
            )));
        }
        Ok(())
    }
}

/// Validate a requested allocation.
pub(crate) fn check_allocation(shape: &[usize], dtype: DType) -> Result<usize> {
    if shape.is_empty() {
        return Err(BridgeError::InvalidInput(
            "shared arrays need at least one dimension".into(),
        ));
    }
    shape
        .iter()
        .try_fold(dtype.width(), |acc, d| acc.checked_mul(*d))
        .filter(|size| *size > 0)
        .ok_or_else(|| {
            BridgeError::InvalidInput(format!(
                "cannot allocate a {} buffer of shape {:?}",
                dtype, shape
            ))
        })
}

/// Creator-side handle on one segment.
pub trait SharedBuffer {
    fn descriptor(&self) -> &BufferDescriptor;

    /// Writable view of the segment.
    fn bytes_mut(&mut self) -> &mut [u8];

    /// Copy `source` into the segment in row-major order.
    fn write_from(&mut self, source: &NdArray) -> Result<()> {
        self.descriptor().check_compatible(source)?;
        source.write_le_bytes(self.bytes_mut())
    }

    /// Remove the segment name. A segment already removed by the consumer
    /// counts as released.
    fn unlink(&mut self) -> Result<()>;

    /// Release the local handle.
    fn close(self) -> Result<()>
    where
        Self: Sized;
}

/// Factory for shared buffers plus the consumer-side read.
pub trait BufferChannel: Clone + Send + 'static {
    type Buffer: SharedBuffer;

    /// Reserve `product(shape) * width(dtype)` bytes under a fresh name.
    fn allocate(&self, shape: &[usize], dtype: DType) -> Result<Self::Buffer>;

    /// Worker-side read: attach by name, copy out, unlink.
    fn consume(&self, descriptor: &BufferDescriptor) -> Result<Vec<u8>>;
}

/// Release a buffer after use: unlink when the call failed, always close.
///
/// Both steps run even if the first one fails; the first cleanup failure is
/// returned.
pub(crate) fn release<B: SharedBuffer>(mut buffer: B, failed: bool) -> Result<()> {
    let name = buffer.descriptor().name.clone();
    let unlinked = if failed {
        tracing::debug!(buffer = %name, "Unlinking shared buffer after failed call");
        buffer.unlink()
    } else {
        Ok(())
    };
    let closed = buffer.close();
    if let Err(e) = &closed {
        tracing::warn!(buffer = %name, error = %e, "Failed to close shared buffer");
    }
    unlinked.and(closed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_unique_names_fit_and_differ() {
        let names: HashSet<String> = (0..500).map(|_| unique_name()).collect();
        assert_eq!(names.len(), 500);
        for name in &names {
            assert!(name.starts_with(NAME_PREFIX));
            assert!(name.len() <= MAX_NAME_LEN, "{} too long", name);
            assert!(!name.contains('/'));
        }
    }

    #[test]
    fn test_check_allocation() {
        assert_eq!(check_allocation(&[2, 3], DType::Float32).unwrap(), 24);
        assert!(check_allocation(&[], DType::Uint8).is_err());
        assert!(check_allocation(&[4, 0], DType::Uint8).is_err());
        assert!(check_allocation(&[usize::MAX, 2], DType::Uint16).is_err());
    }

    #[test]
    fn test_descriptor_compatibility() {
        let d = BufferDescriptor::new("sgbtest".into(), DType::Uint8, vec![2, 2]);
        assert_eq!(d.byte_size(), 4);

        let ok = NdArray::from(ndarray::ArrayD::<u8>::zeros(ndarray::IxDyn(&[2, 2])));
        assert!(d.check_compatible(&ok).is_ok());

        let wrong_type = NdArray::from(ndarray::ArrayD::<f32>::zeros(ndarray::IxDyn(&[2, 2])));
        assert!(d.check_compatible(&wrong_type).is_err());

        let wrong_shape = NdArray::from(ndarray::ArrayD::<u8>::zeros(ndarray::IxDyn(&[4])));
        assert!(d.check_compatible(&wrong_shape).is_err());
    }
}
