//! POSIX shared-memory segments (`shm_open` + `mmap`).
//!
//! Names are created with a leading slash, which is what Python's
//! `multiprocessing.shared_memory.SharedMemory(name=...)` prepends on POSIX,
//! so the worker attaches with the bare token.

use std::ffi::c_void;
use std::fs::File;
use std::io;
use std::num::NonZeroUsize;
use std::os::fd::OwnedFd;
use std::ptr::NonNull;

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::libc::off_t;
use nix::sys::mman::{MapFlags, ProtFlags, mmap, munmap, shm_open, shm_unlink};
use nix::sys::stat::Mode;
use nix::unistd::ftruncate;

use super::{BufferChannel, BufferDescriptor, SharedBuffer, check_allocation, unique_name};
use crate::array::DType;
use crate::error::{BridgeError, Result};

fn shm_path(name: &str) -> String {
    format!("/{}", name)
}

fn shm_error(action: &str, name: &str, errno: Errno) -> BridgeError {
    let err = io::Error::from(errno);
    BridgeError::Io(io::Error::new(
        err.kind(),
        format!("failed to {} shared segment {}: {}", action, name, err),
    ))
}

/// A live mapping of a segment into this process.
struct Mapping {
    ptr: NonNull<c_void>,
    len: usize,
    // Held so the descriptor closes with the mapping.
    _fd: OwnedFd,
}

impl Mapping {
    fn map(fd: OwnedFd, len: usize, writable: bool) -> std::result::Result<Self, Errno> {
        let length = NonZeroUsize::new(len).ok_or(Errno::EINVAL)?;
        let prot = if writable {
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE
        } else {
            ProtFlags::PROT_READ
        };
        // SAFETY: fresh mapping chosen by the kernel, backed by a segment of at
        // least `len` bytes; no existing memory is aliased.
        let ptr = unsafe { mmap(None, length, prot, MapFlags::MAP_SHARED, &fd, 0)? };
        Ok(Self { ptr, len, _fd: fd })
    }

    fn bytes(&self) -> &[u8] {
        // SAFETY: the mapping stays valid for `len` bytes until `unmap`.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr().cast::<u8>(), self.len) }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: as above, and `&mut self` guarantees exclusive access on
        // this side of the segment.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr().cast::<u8>(), self.len) }
    }

    fn unmap(self) -> std::result::Result<(), Errno> {
        let Self { ptr, len, _fd } = self;
        // SAFETY: `ptr`/`len` come from a successful mmap and are unmapped once.
        unsafe { munmap(ptr, len) }
    }
}

/// Creator-side handle on a POSIX shared-memory segment.
pub struct ShmBuffer {
    descriptor: BufferDescriptor,
    mapping: Option<Mapping>,
    unlinked: bool,
}

impl SharedBuffer for ShmBuffer {
    fn descriptor(&self) -> &BufferDescriptor {
        &self.descriptor
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        match self.mapping.as_mut() {
            Some(m) => m.bytes_mut(),
            None => &mut [],
        }
    }

    fn unlink(&mut self) -> Result<()> {
        if self.unlinked {
            return Ok(());
        }
        match shm_unlink(shm_path(&self.descriptor.name).as_str()) {
            Ok(()) | Err(Errno::ENOENT) => {
                self.unlinked = true;
                Ok(())
            }
            Err(e) => Err(shm_error("unlink", &self.descriptor.name, e)),
        }
    }

    fn close(mut self) -> Result<()> {
        match self.mapping.take() {
            Some(mapping) => mapping
                .unmap()
                .map_err(|e| shm_error("unmap", &self.descriptor.name, e)),
            None => Ok(()),
        }
    }
}

impl Drop for ShmBuffer {
    fn drop(&mut self) {
        if let Some(mapping) = self.mapping.take() {
            let _ = mapping.unmap();
        }
    }
}

/// Channel backed by POSIX shared memory.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShmChannel;

impl ShmChannel {
    pub fn new() -> Self {
        Self
    }

    /// Whether a segment with this name currently exists.
    pub fn segment_exists(name: &str) -> bool {
        shm_open(shm_path(name).as_str(), OFlag::O_RDONLY, Mode::empty()).is_ok()
    }
}

impl BufferChannel for ShmChannel {
    type Buffer = ShmBuffer;

    fn allocate(&self, shape: &[usize], dtype: DType) -> Result<ShmBuffer> {
        let size = check_allocation(shape, dtype)?;
        let name = unique_name();
        let path = shm_path(&name);

        let fd = shm_open(
            path.as_str(),
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .map_err(|e| shm_error("create", &name, e))?;

        let mapped = off_t::try_from(size)
            .map_err(|_| Errno::EFBIG)
            .and_then(|len| ftruncate(&fd, len))
            .and_then(|()| Mapping::map(fd, size, true));
        let mapping = match mapped {
            Ok(m) => m,
            Err(e) => {
                let _ = shm_unlink(path.as_str());
                return Err(shm_error("size", &name, e));
            }
        };

        tracing::trace!(buffer = %name, bytes = size, %dtype, ?shape, "Allocated shared buffer");
        Ok(ShmBuffer {
            descriptor: BufferDescriptor::new(name, dtype, shape.to_vec()),
            mapping: Some(mapping),
            unlinked: false,
        })
    }

    fn consume(&self, descriptor: &BufferDescriptor) -> Result<Vec<u8>> {
        let name = &descriptor.name;
        let path = shm_path(name);
        let fd = shm_open(path.as_str(), OFlag::O_RDONLY, Mode::empty())
            .map_err(|e| shm_error("attach", name, e))?;

        let size = descriptor.byte_size();
        let file = File::from(fd);
        let actual = file.metadata()?.len();
        if actual < size as u64 {
            return Err(BridgeError::Protocol(format!(
                "segment {} holds {} bytes, descriptor needs {}",
                name, actual, size
            )));
        }

        let fd = OwnedFd::from(file);
        let mapping = Mapping::map(fd, size, false).map_err(|e| shm_error("map", name, e))?;
        let data = mapping.bytes().to_vec();
        mapping.unmap().map_err(|e| shm_error("unmap", name, e))?;
        shm_unlink(path.as_str()).map_err(|e| shm_error("unlink", name, e))?;
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::NdArray;
    use ndarray::{Array3, ArrayD, IxDyn};

    #[test]
    fn test_float_image_round_trip() {
        let channel = ShmChannel::new();
        let pixel = |(y, x, c): (usize, usize, usize)| y as f32 * 0.25 + x as f32 - c as f32 * 1e-3;
        let image = NdArray::from(Array3::from_shape_fn((7, 9, 3), pixel).into_dyn());

        let mut buffer = channel.allocate(image.shape(), DType::Float32).unwrap();
        buffer.write_from(&image).unwrap();
        let descriptor = buffer.descriptor().clone();
        assert_eq!(descriptor.byte_size(), 7 * 9 * 3 * 4);

        let bytes = channel.consume(&descriptor).unwrap();
        assert_eq!(bytes, image.to_le_bytes());
        let rebuilt = NdArray::from_le_bytes(&bytes, &descriptor.shape, descriptor.dtype).unwrap();
        assert_eq!(rebuilt, image);

        // Consumer unlinked; creator close still succeeds and unlink is a no-op.
        assert!(!ShmChannel::segment_exists(&descriptor.name));
        super::super::release(buffer, true).unwrap();
    }

    #[test]
    fn test_creator_unlink_on_error_path() {
        let channel = ShmChannel::new();
        let buffer = channel.allocate(&[4, 4], DType::Uint8).unwrap();
        let name = buffer.descriptor().name.clone();
        assert!(ShmChannel::segment_exists(&name));

        super::super::release(buffer, true).unwrap();
        assert!(!ShmChannel::segment_exists(&name));
    }

    #[test]
    fn test_write_rejects_mismatched_array() {
        let channel = ShmChannel::new();
        let mut buffer = channel.allocate(&[2, 2], DType::Uint8).unwrap();
        let wrong = NdArray::from(ArrayD::<u16>::zeros(IxDyn(&[2, 2])));
        assert!(matches!(
            buffer.write_from(&wrong),
            Err(BridgeError::InvalidInput(_))
        ));
        super::super::release(buffer, true).unwrap();
    }

    #[test]
    fn test_consume_missing_segment() {
        let channel = ShmChannel::new();
        let d = BufferDescriptor::new(unique_name(), DType::Uint8, vec![1]);
        assert!(matches!(channel.consume(&d), Err(BridgeError::Io(_))));
    }
}
