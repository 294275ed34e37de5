//! GPU-visible memory: one GEM buffer object per driver context,
//! suballocated into typed buffers.
//!
//! The v3d address space and the host mapping refer to the same physical
//! pages, so a buffer filled through [`GpuBuffer::as_mut_slice`] is what
//! the QPUs read, with no staging copies. Device addresses embedded in
//! uniform tables come from [`GpuBuffer::bus_address`] /
//! [`GpuBuffer::address_of`]; host virtual addresses must never be handed
//! to the hardware.
//!
//! Allocation is a bump pointer over the arena: buffers are disjoint
//! 64-byte-aligned ranges and are never recycled individually. The arena
//! (and its GEM handle) is released exactly once when the last buffer or
//! driver handle drops.

use std::marker::PhantomData;
use std::sync::{Arc, Mutex};

use log::debug;
use memmap2::{MmapMut, MmapOptions};
use thiserror::Error;
use zerocopy::{AsBytes, FromBytes};

use crate::drm::{Device, DrmError};

/// Minimum alignment of every suballocation. Covers the TMU's vector
/// access patterns and the CSD unit's code alignment requirement.
pub const ALLOC_ALIGN: usize = 64;

/// Page granularity of GEM allocations.
pub const PAGE_SIZE: usize = 4096;

/// GPU memory allocation failure.
#[derive(Debug, Error)]
pub enum MemoryError {
    /// The arena cannot satisfy the request. No buffer is returned.
    #[error("arena exhausted: requested {requested} bytes, {available} available")]
    ResourceExhausted { requested: usize, available: usize },

    /// Mapping the buffer object into the host failed.
    #[error("failed to map buffer object: {0}")]
    Map(#[source] std::io::Error),

    #[error(transparent)]
    Drm(#[from] DrmError),
}

fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

/// The backing buffer object. Shared by the arena handle and every buffer
/// allocated from it; dropping the last owner closes the GEM handle.
struct ArenaInner {
    dev: Arc<Device>,
    handle: u32,
    bus_addr: u32,
    base: *mut u8,
    size: usize,
    cursor: Mutex<usize>,
    /// Keeps the host mapping alive; `base` points into it.
    _map: MmapMut,
}

// Safety: `base` points into the mmap owned by this struct, every
// GpuBuffer view covers a disjoint range of it, and the cursor is behind
// a mutex.
unsafe impl Send for ArenaInner {}
unsafe impl Sync for ArenaInner {}

impl Drop for ArenaInner {
    fn drop(&mut self) {
        debug!("releasing arena BO handle {}", self.handle);
        self.dev.gem_close(self.handle);
    }
}

/// GPU memory arena for one driver context.
pub struct MemoryArena {
    inner: Arc<ArenaInner>,
}

impl MemoryArena {
    /// Create a buffer object of at least `size` bytes and map it.
    pub fn new(dev: Arc<Device>, size: usize) -> Result<MemoryArena, MemoryError> {
        let size = align_up(size.max(PAGE_SIZE), PAGE_SIZE);
        let (handle, bus_addr) = dev.create_bo(size as u32)?;

        let inner = (|| {
            let mmap_offset = dev.mmap_bo_offset(handle)?;
            // Safety: the fake offset names this BO on the card fd; the
            // kernel hands out a shared mapping of its pages.
            let mut map = unsafe {
                MmapOptions::new()
                    .len(size)
                    .offset(mmap_offset)
                    .map_mut(dev.file())
            }
            .map_err(MemoryError::Map)?;
            let base = map.as_mut_ptr();
            Ok::<_, MemoryError>(ArenaInner {
                dev: dev.clone(),
                handle,
                bus_addr,
                base,
                size,
                cursor: Mutex::new(0),
                _map: map,
            })
        })();

        match inner {
            Ok(inner) => {
                debug!(
                    "arena: {} bytes at bus address {:#010x}",
                    size, inner.bus_addr
                );
                Ok(MemoryArena {
                    inner: Arc::new(inner),
                })
            }
            Err(e) => {
                // The handle must not leak on the error path.
                dev.gem_close(handle);
                Err(e)
            }
        }
    }

    /// GEM handle of the backing buffer object.
    pub fn handle(&self) -> u32 {
        self.inner.handle
    }

    /// Device address of the arena base.
    pub fn bus_address(&self) -> u32 {
        self.inner.bus_addr
    }

    /// Bytes not yet handed out.
    pub fn remaining(&self) -> usize {
        self.inner.size - *self.inner.cursor.lock().unwrap()
    }

    /// Allocate a zero-initialized buffer of `count` elements.
    pub fn alloc<T: AsBytes + FromBytes + Copy>(
        &self,
        count: usize,
    ) -> Result<GpuBuffer<T>, MemoryError> {
        let bytes = align_up(count * std::mem::size_of::<T>(), ALLOC_ALIGN);
        let offset = {
            let mut cursor = self.inner.cursor.lock().unwrap();
            let available = self.inner.size - *cursor;
            if bytes > available {
                return Err(MemoryError::ResourceExhausted {
                    requested: bytes,
                    available,
                });
            }
            let offset = *cursor;
            *cursor += bytes;
            offset
        };
        let mut buffer = GpuBuffer {
            arena: self.inner.clone(),
            byte_offset: offset,
            len: count,
            _elem: PhantomData,
        };
        // GEM pages arrive zeroed from the kernel, but this arena may sit
        // below a re-opened driver on some stacks; make the contract
        // unconditional.
        buffer.as_bytes_mut().fill(0);
        Ok(buffer)
    }
}

/// A typed, GPU-visible buffer: a host slice and a device address over the
/// same physical memory.
pub struct GpuBuffer<T> {
    arena: Arc<ArenaInner>,
    byte_offset: usize,
    len: usize,
    _elem: PhantomData<T>,
}

// Safety: each buffer owns a disjoint range of the arena mapping; access
// to it follows Rust's usual &/&mut rules on the buffer itself.
unsafe impl<T: Send> Send for GpuBuffer<T> {}
unsafe impl<T: Sync> Sync for GpuBuffer<T> {}

impl<T: AsBytes + FromBytes + Copy> GpuBuffer<T> {
    /// Element count.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Element stride in bytes.
    pub fn stride(&self) -> usize {
        std::mem::size_of::<T>()
    }

    /// Device address of element 0. This is the address to embed in
    /// uniform tables and submit descriptors.
    pub fn bus_address(&self) -> u32 {
        self.arena.bus_addr + self.byte_offset as u32
    }

    /// Device address of element `index`.
    pub fn address_of(&self, index: usize) -> u32 {
        assert!(index < self.len, "index {} out of {}", index, self.len);
        self.bus_address() + (index * self.stride()) as u32
    }

    /// Host view of the buffer.
    pub fn as_slice(&self) -> &[T] {
        // Safety: the range is within the live mapping, exclusively owned
        // by this buffer, and T is FromBytes (any bit pattern is valid).
        unsafe {
            std::slice::from_raw_parts(self.arena.base.add(self.byte_offset) as *const T, self.len)
        }
    }

    /// Mutable host view of the buffer.
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        // Safety: as above, plus &mut self guarantees exclusivity.
        unsafe {
            std::slice::from_raw_parts_mut(
                self.arena.base.add(self.byte_offset) as *mut T,
                self.len,
            )
        }
    }

    fn as_bytes_mut(&mut self) -> &mut [u8] {
        // Safety: the byte range is within the mapping and owned by this
        // buffer.
        unsafe {
            std::slice::from_raw_parts_mut(
                self.arena.base.add(self.byte_offset),
                self.len * std::mem::size_of::<T>(),
            )
        }
    }

    /// Copy `data` into the buffer starting at element 0.
    pub fn write(&mut self, data: &[T]) {
        self.as_mut_slice()[..data.len()].copy_from_slice(data);
    }

    /// GEM handle of the backing arena, for submit descriptors.
    pub(crate) fn handle(&self) -> u32 {
        self.arena.handle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 64), 0);
        assert_eq!(align_up(1, 64), 64);
        assert_eq!(align_up(64, 64), 64);
        assert_eq!(align_up(65, 64), 128);
        assert_eq!(align_up(4097, 4096), 8192);
    }

    // Allocation behaviour against real GEM objects is covered by the
    // hardware tests; the arithmetic above is the only part that can be
    // checked off-device.
}
