//! Device memory allocations and sub-allocation.

use crate::backend::{MemoryHandle, MemoryType};
use crate::device::Device;
use crate::error::{GpuError, Result};
use nyx_core::MemoryFlags;
use parking_lot::Mutex;
use std::fmt;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Index of the first memory type whose bit is set in `filter` and whose
/// property flags contain all of `flags`.
pub fn select_memory_type(types: &[MemoryType], filter: u32, flags: MemoryFlags) -> Option<u32> {
    types
        .iter()
        .enumerate()
        .take(32)
        .find(|(index, ty)| filter & (1 << index) != 0 && ty.flags.contains(flags))
        .map(|(index, _)| index as u32)
}

struct HostMirror {
    bytes: Vec<u8>,
    dirty: bool,
}

struct MemoryBlock {
    device: Device,
    handle: MemoryHandle,
    size: u64,
    type_index: u32,
    flags: MemoryFlags,
    freed: AtomicBool,
    host: Option<Mutex<HostMirror>>,
    /// Live sub-allocations, in block coordinates.
    reservations: Mutex<Vec<Range<u64>>>,
}

impl MemoryBlock {
    fn release(&self) -> bool {
        if self.freed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.device.backend().free_memory(self.handle);
        tracing::debug!("Freed {} bytes of memory type {}", self.size, self.type_index);
        true
    }
}

impl Drop for MemoryBlock {
    fn drop(&mut self) {
        self.release();
    }
}

/// One device memory allocation, or a view into part of one.
///
/// Clones share the allocation. Views never own it: only a non-view handle
/// can free the block, and only while nothing is sub-allocated from it.
/// The block is released when the last handle goes away if it was not
/// freed explicitly.
#[derive(Clone)]
pub struct Memory {
    block: Arc<MemoryBlock>,
    offset: u64,
    size: u64,
    view: bool,
}

impl Memory {
    /// Allocate `size` bytes with at least the properties in `flags`.
    pub fn allocate(device: &Device, size: u64, host_mirror: bool, flags: MemoryFlags) -> Result<Self> {
        Self::allocate_filtered(device, size, u32::MAX, host_mirror, flags)
    }

    /// Allocate from a memory type allowed by `filter`.
    ///
    /// Nothing is allocated when no type qualifies.
    pub fn allocate_filtered(
        device: &Device,
        size: u64,
        filter: u32,
        host_mirror: bool,
        flags: MemoryFlags,
    ) -> Result<Self> {
        let type_index = device.find_memory_type(filter, flags).ok_or_else(|| {
            GpuError::AllocationFailed(format!(
                "no memory type in filter {filter:#b} provides {flags:?}"
            ))
        })?;
        let handle = device.backend().allocate_memory(type_index, size)?;
        let flags = device.memory_types()[type_index as usize].flags;

        tracing::debug!("Allocated {size} bytes of memory type {type_index} ({flags:?})");

        Ok(Self {
            block: Arc::new(MemoryBlock {
                device: device.clone(),
                handle,
                size,
                type_index,
                flags,
                freed: AtomicBool::new(false),
                host: host_mirror.then(|| {
                    Mutex::new(HostMirror {
                        bytes: vec![0; size as usize],
                        dirty: false,
                    })
                }),
                reservations: Mutex::new(Vec::new()),
            }),
            offset: 0,
            size,
            view: false,
        })
    }

    pub fn device(&self) -> &Device {
        &self.block.device
    }

    /// Bytes visible through this handle.
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Where this handle starts inside the allocation.
    pub const fn base_offset(&self) -> u64 {
        self.offset
    }

    /// Actual property flags of the chosen memory type.
    pub fn flags(&self) -> MemoryFlags {
        self.block.flags
    }

    pub fn type_index(&self) -> u32 {
        self.block.type_index
    }

    pub fn handle(&self) -> MemoryHandle {
        self.block.handle
    }

    pub const fn is_view(&self) -> bool {
        self.view
    }

    pub fn is_freed(&self) -> bool {
        self.block.freed.load(Ordering::SeqCst)
    }

    pub fn is_host_visible(&self) -> bool {
        self.block.flags.is_host_visible()
    }

    pub fn has_host_mirror(&self) -> bool {
        self.block.host.is_some()
    }

    /// A view starting `bytes` further in, clamped to the end.
    pub fn offset(&self, bytes: u64) -> Self {
        let shift = bytes.min(self.size);
        Self {
            block: Arc::clone(&self.block),
            offset: self.offset + shift,
            size: self.size - shift,
            view: true,
        }
    }

    /// Map, copy `src` in at `offset`, unmap.
    pub fn copy_host_to_device(&self, src: &[u8], offset: u64) -> Result<()> {
        self.check_mappable(offset, src.len() as u64)?;
        self.device()
            .backend()
            .write_memory(self.block.handle, self.offset + offset, src)
    }

    /// Map, copy out from `offset` into `dst`, unmap.
    pub fn copy_device_to_host(&self, dst: &mut [u8], offset: u64) -> Result<()> {
        self.check_mappable(offset, dst.len() as u64)?;
        self.device()
            .backend()
            .read_memory(self.block.handle, self.offset + offset, dst)
    }

    /// Write into the host mirror and mark it dirty.
    pub fn write_host(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.check_range(offset, data.len() as u64)?;
        let mut mirror = self.mirror()?.lock();
        let start = (self.offset + offset) as usize;
        mirror.bytes[start..start + data.len()].copy_from_slice(data);
        mirror.dirty = true;
        Ok(())
    }

    pub fn read_host(&self, offset: u64, dst: &mut [u8]) -> Result<()> {
        self.check_range(offset, dst.len() as u64)?;
        let mirror = self.mirror()?.lock();
        let start = (self.offset + offset) as usize;
        dst.copy_from_slice(&mirror.bytes[start..start + dst.len()]);
        Ok(())
    }

    /// Copy this handle's range of the host mirror to the device.
    pub fn sync_to_device(&self) -> Result<()> {
        self.check_mappable(0, self.size)?;
        let mut mirror = self.mirror()?.lock();
        let range = self.offset as usize..(self.offset + self.size) as usize;
        self.device()
            .backend()
            .write_memory(self.block.handle, self.offset, &mirror.bytes[range])?;
        mirror.dirty = false;
        Ok(())
    }

    /// Copy this handle's range of device memory into the host mirror.
    pub fn sync_to_host(&self) -> Result<()> {
        self.check_mappable(0, self.size)?;
        let mut mirror = self.mirror()?.lock();
        let range = self.offset as usize..(self.offset + self.size) as usize;
        self.device()
            .backend()
            .read_memory(self.block.handle, self.offset, &mut mirror.bytes[range])?;
        mirror.dirty = false;
        Ok(())
    }

    /// Whether the host mirror holds writes not yet synced to the device.
    pub fn dirty(&self) -> bool {
        self.block.host.as_ref().is_some_and(|m| m.lock().dirty)
    }

    /// Release the allocation.
    ///
    /// Views cannot free, and neither can the owner while sub-allocations
    /// are alive. Freeing twice is reported as a use after free.
    pub fn free(&self) -> Result<()> {
        if self.view {
            return Err(GpuError::InvalidState(
                "memory views cannot free their allocation".to_string(),
            ));
        }
        let live = self.block.reservations.lock().len();
        if live > 0 {
            return Err(GpuError::InvalidState(format!(
                "{live} sub-allocation(s) still use this memory"
            )));
        }
        if self.block.release() {
            Ok(())
        } else {
            Err(self.use_after_free())
        }
    }

    /// Carve `size` bytes out of this handle's range, first fit.
    pub(crate) fn reserve(&self, size: u64, alignment: u64) -> Option<Reservation> {
        if self.is_freed() || size == 0 {
            return None;
        }
        let alignment = alignment.max(1);
        let end = self.offset + self.size;

        let mut taken = self.block.reservations.lock();
        taken.sort_by_key(|r| r.start);

        let mut candidate = self.offset.next_multiple_of(alignment);
        for range in taken.iter() {
            if range.end <= candidate {
                continue;
            }
            if candidate + size <= range.start {
                break;
            }
            candidate = range.end.next_multiple_of(alignment);
        }
        if candidate + size > end {
            return None;
        }

        let range = candidate..candidate + size;
        taken.push(range.clone());
        Some(Reservation {
            memory: Self {
                block: Arc::clone(&self.block),
                offset: range.start,
                size,
                view: true,
            },
            range,
        })
    }

    fn mirror(&self) -> Result<&Mutex<HostMirror>> {
        self.check_live()?;
        self.block.host.as_ref().ok_or_else(|| {
            GpuError::InvalidState("memory was allocated without a host mirror".to_string())
        })
    }

    fn check_live(&self) -> Result<()> {
        if self.is_freed() {
            Err(self.use_after_free())
        } else {
            Ok(())
        }
    }

    fn check_range(&self, offset: u64, len: u64) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(GpuError::OutOfRange {
                offset,
                end: offset.saturating_add(len),
                len: self.size,
            }),
        }
    }

    fn check_mappable(&self, offset: u64, len: u64) -> Result<()> {
        self.check_live()?;
        if !self.is_host_visible() {
            return Err(GpuError::InvalidState(format!(
                "memory type {} is not host visible",
                self.block.type_index
            )));
        }
        self.check_range(offset, len)
    }

    fn use_after_free(&self) -> GpuError {
        let err = GpuError::UseAfterFree;
        self.device().report(&err);
        err
    }
}

impl fmt::Debug for Memory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Memory")
            .field("type_index", &self.block.type_index)
            .field("flags", &self.block.flags)
            .field("offset", &self.offset)
            .field("size", &self.size)
            .field("view", &self.view)
            .field("freed", &self.is_freed())
            .finish()
    }
}

/// A sub-range of a [`Memory`] held by a borrower until dropped.
pub(crate) struct Reservation {
    memory: Memory,
    range: Range<u64>,
}

impl Reservation {
    pub(crate) const fn memory(&self) -> &Memory {
        &self.memory
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.memory
            .block
            .reservations
            .lock()
            .retain(|r| *r != self.range);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::host::HostBackend;
    use crate::window::WindowRegistry;
    use nyx_core::{ErrorChannel, ErrorCode, Report};

    fn device_with(errors: Arc<ErrorChannel>) -> (Device, Arc<HostBackend>) {
        let backend = Arc::new(HostBackend::default());
        let device = Device::new(
            0,
            backend.clone(),
            errors,
            Arc::new(WindowRegistry::default()),
        )
        .unwrap();
        (device, backend)
    }

    fn device() -> (Device, Arc<HostBackend>) {
        device_with(Arc::new(ErrorChannel::silent()))
    }

    #[test]
    fn first_matching_type_wins() {
        let types = [
            MemoryType {
                flags: MemoryFlags::DEVICE_LOCAL,
                heap: 0,
            },
            MemoryType {
                flags: MemoryFlags::HOST_SHARED,
                heap: 1,
            },
            MemoryType {
                flags: MemoryFlags::HOST_SHARED | MemoryFlags::HOST_CACHED,
                heap: 1,
            },
        ];
        assert_eq!(select_memory_type(&types, u32::MAX, MemoryFlags::HOST_VISIBLE), Some(1));
        assert_eq!(select_memory_type(&types, 0b100, MemoryFlags::HOST_VISIBLE), Some(2));
        assert_eq!(select_memory_type(&types, u32::MAX, MemoryFlags::PROTECTED), None);
        assert_eq!(select_memory_type(&types, u32::MAX, MemoryFlags::empty()), Some(0));
    }

    #[test]
    fn unmatched_flags_allocate_nothing() {
        let (device, backend) = device();
        let result = Memory::allocate(&device, 64, false, MemoryFlags::PROTECTED);
        assert!(matches!(result, Err(GpuError::AllocationFailed(_))));
        assert_eq!(backend.stats().live_allocations, 0);
    }

    #[test]
    fn host_copies_round_trip() {
        let (device, _) = device();
        let memory = Memory::allocate(&device, 32, false, MemoryFlags::HOST_SHARED).unwrap();
        memory.copy_host_to_device(&[1, 2, 3, 4], 8).unwrap();
        let mut out = [0u8; 4];
        memory.copy_device_to_host(&mut out, 8).unwrap();
        assert_eq!(out, [1, 2, 3, 4]);
        assert!(memory.copy_host_to_device(&[0; 8], 28).is_err());
    }

    #[test]
    fn device_local_memory_cannot_be_mapped() {
        let (device, _) = device();
        let memory = Memory::allocate(&device, 32, false, MemoryFlags::DEVICE_LOCAL).unwrap();
        assert!(memory.copy_host_to_device(&[1], 0).is_err());
    }

    #[test]
    fn mirror_tracks_dirtiness() {
        let (device, _) = device();
        let memory = Memory::allocate(&device, 16, true, MemoryFlags::HOST_SHARED).unwrap();
        assert!(!memory.dirty());
        memory.write_host(4, &[7, 7]).unwrap();
        assert!(memory.dirty());
        memory.sync_to_device().unwrap();
        assert!(!memory.dirty());

        let mut out = [0u8; 2];
        memory.copy_device_to_host(&mut out, 4).unwrap();
        assert_eq!(out, [7, 7]);
    }

    #[test]
    fn views_are_clamped_and_cannot_free() {
        let (device, _) = device();
        let memory = Memory::allocate(&device, 64, false, MemoryFlags::HOST_SHARED).unwrap();
        let view = memory.offset(48);
        assert_eq!(view.base_offset(), 48);
        assert_eq!(view.size(), 16);
        assert_eq!(memory.offset(100).size(), 0);
        assert!(view.free().is_err());

        view.copy_host_to_device(&[5], 0).unwrap();
        let mut out = [0u8; 1];
        memory.copy_device_to_host(&mut out, 48).unwrap();
        assert_eq!(out, [5]);
    }

    #[test]
    fn reservations_are_first_fit_and_released_on_drop() {
        let (device, _) = device();
        let memory = Memory::allocate(&device, 64, false, MemoryFlags::DEVICE_LOCAL).unwrap();
        let a = memory.reserve(16, 16).unwrap();
        let b = memory.reserve(20, 16).unwrap();
        assert_eq!(a.memory().base_offset(), 0);
        assert_eq!(b.memory().base_offset(), 16);
        assert!(memory.reserve(32, 16).is_none());

        drop(a);
        assert_eq!(memory.reserve(16, 16).unwrap().memory().base_offset(), 0);
    }

    #[test]
    fn owner_cannot_free_while_borrowed() {
        let (device, backend) = device();
        let memory = Memory::allocate(&device, 64, false, MemoryFlags::DEVICE_LOCAL).unwrap();
        let borrowed = memory.reserve(16, 16).unwrap();
        assert!(memory.free().is_err());
        drop(borrowed);
        memory.free().unwrap();
        assert!(memory.is_freed());
        assert_eq!(backend.stats().live_allocations, 0);
    }

    #[test]
    fn double_free_is_reported() {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::<Report>::new()));
        let errors = Arc::new(ErrorChannel::silent());
        let sink = Arc::clone(&seen);
        errors.set_callback(move |report| sink.lock().push(report.clone()));

        let (device, _) = device_with(errors);
        let memory = Memory::allocate(&device, 16, true, MemoryFlags::HOST_SHARED).unwrap();
        memory.free().unwrap();
        assert!(matches!(memory.free(), Err(GpuError::UseAfterFree)));
        assert!(memory.write_host(0, &[1]).is_err());

        let codes: Vec<_> = seen.lock().iter().map(|r| r.code).collect();
        assert_eq!(codes, vec![ErrorCode::UseAfterFree, ErrorCode::UseAfterFree]);
    }
}
