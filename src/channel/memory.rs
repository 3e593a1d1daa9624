//! In-process buffer channel with allocation accounting.
//!
//! Segments live in a shared map instead of the OS namespace. The stub worker
//! consumes from the same map, which lets tests assert that every allocation
//! was released on every path.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};

use super::{BufferChannel, BufferDescriptor, SharedBuffer, check_allocation, unique_name};
use crate::array::DType;
use crate::error::{BridgeError, Result};

/// Counters kept by a [`MemoryChannel`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelStats {
    /// Buffers handed out by `allocate`.
    pub allocated: usize,
    /// Local handles closed by the creator.
    pub closed: usize,
    /// Unlink calls made by the creator (including no-op ones).
    pub creator_unlinks: usize,
    /// Segments read and removed by the consumer.
    pub consumed: usize,
    /// Segments that still exist.
    pub live: usize,
}

#[derive(Default)]
struct Inner {
    segments: HashMap<String, Vec<u8>>,
    stats: ChannelStats,
    fail_unlink: bool,
}

/// Buffer channel that keeps segments in memory.
#[derive(Clone, Default)]
pub struct MemoryChannel {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every creator-side unlink fail, to exercise compound errors.
    pub fn fail_unlinks(&self) {
        self.lock().fail_unlink = true;
    }

    pub fn stats(&self) -> ChannelStats {
        let inner = self.lock();
        ChannelStats {
            live: inner.segments.len(),
            ..inner.stats
        }
    }

    /// Whether every allocation has been closed and no segment remains.
    pub fn is_balanced(&self) -> bool {
        let stats = self.stats();
        stats.allocated == stats.closed && stats.live == 0
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panic while holding the lock only happens in a failing test.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Creator-side handle on an in-memory segment.
pub struct MemoryBuffer {
    descriptor: BufferDescriptor,
    staging: Vec<u8>,
    channel: MemoryChannel,
    closed: bool,
}

impl SharedBuffer for MemoryBuffer {
    fn descriptor(&self) -> &BufferDescriptor {
        &self.descriptor
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.staging
    }

    fn write_from(&mut self, source: &crate::array::NdArray) -> Result<()> {
        self.descriptor.check_compatible(source)?;
        source.write_le_bytes(&mut self.staging)?;
        // Publish so the consumer sees the written bytes.
        let mut inner = self.channel.lock();
        if let Some(segment) = inner.segments.get_mut(&self.descriptor.name) {
            segment.copy_from_slice(&self.staging);
        }
        Ok(())
    }

    fn unlink(&mut self) -> Result<()> {
        let mut inner = self.channel.lock();
        inner.stats.creator_unlinks += 1;
        if inner.fail_unlink {
            return Err(BridgeError::Io(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("unlink of {} refused", self.descriptor.name),
            )));
        }
        inner.segments.remove(&self.descriptor.name);
        Ok(())
    }

    fn close(mut self) -> Result<()> {
        self.mark_closed();
        Ok(())
    }
}

impl MemoryBuffer {
    fn mark_closed(&mut self) {
        if !self.closed {
            self.closed = true;
            self.channel.lock().stats.closed += 1;
        }
    }
}

impl Drop for MemoryBuffer {
    fn drop(&mut self) {
        self.mark_closed();
    }
}

impl BufferChannel for MemoryChannel {
    type Buffer = MemoryBuffer;

    fn allocate(&self, shape: &[usize], dtype: DType) -> Result<MemoryBuffer> {
        let size = check_allocation(shape, dtype)?;
        let name = unique_name();
        {
            let mut inner = self.lock();
            inner.segments.insert(name.clone(), vec![0u8; size]);
            inner.stats.allocated += 1;
        }
        Ok(MemoryBuffer {
            descriptor: BufferDescriptor::new(name, dtype, shape.to_vec()),
            staging: vec![0u8; size],
            channel: self.clone(),
            closed: false,
        })
    }

    fn consume(&self, descriptor: &BufferDescriptor) -> Result<Vec<u8>> {
        let mut inner = self.lock();
        let data = inner.segments.remove(&descriptor.name).ok_or_else(|| {
            BridgeError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no shared segment named {}", descriptor.name),
            ))
        })?;
        inner.stats.consumed += 1;
        if data.len() < descriptor.byte_size() {
            return Err(BridgeError::Protocol(format!(
                "segment {} holds {} bytes, descriptor needs {}",
                descriptor.name,
                data.len(),
                descriptor.byte_size()
            )));
        }
        Ok(data)
    }
}
