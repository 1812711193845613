//! Typed GPU-resident arrays.

use crate::backend::{BufferHandle, Command, IndexType, ReadbackSlot};
use crate::device::Device;
use crate::error::{GpuError, Result};
use crate::memory::{Memory, Reservation};
use bytemuck::Pod;
use nyx_core::{ArrayFlags, MemoryFlags};
use parking_lot::Mutex;
use std::fmt;
use std::marker::PhantomData;
use std::mem::size_of;
use std::sync::Arc;

pub(crate) struct HostCopy {
    bytes: Vec<u8>,
    dirty: bool,
}

pub(crate) struct BufferInner {
    device: Device,
    handle: BufferHandle,
    usage: ArrayFlags,
    count: usize,
    size: u64,
    memory: Memory,
    _reservation: Option<Reservation>,
    address: u64,
    host: Option<Mutex<HostCopy>>,
}

impl BufferInner {
    pub(crate) const fn handle(&self) -> BufferHandle {
        self.handle
    }

    pub(crate) const fn size(&self) -> u64 {
        self.size
    }

    pub(crate) const fn usage(&self) -> ArrayFlags {
        self.usage
    }

    pub(crate) const fn device(&self) -> &Device {
        &self.device
    }
}

impl Drop for BufferInner {
    fn drop(&mut self) {
        self.device.backend().destroy_buffer(self.handle);
    }
}

/// Where element `index` of an array lives on the device.
///
/// Used to build indirect and indexed draw descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArrayCursor {
    /// Device address of the element, 0 when addresses are unsupported.
    pub address: u64,
    pub index: usize,
    /// Elements in the whole array.
    pub count: usize,
    pub element_size: usize,
}

/// Element types usable in index buffers.
pub trait IndexElement: Pod {
    const INDEX_TYPE: IndexType;
}

impl IndexElement for u16 {
    const INDEX_TYPE: IndexType = IndexType::U16;
}

impl IndexElement for u32 {
    const INDEX_TYPE: IndexType = IndexType::U32;
}

/// A GPU buffer of `T` with an optional host mirror.
///
/// Cloning shares the buffer and the mirror; it never copies data. The
/// mirror is only moved to or from the device by explicit
/// [`sync_to_device`](Self::sync_to_device) and
/// [`sync_to_host`](Self::sync_to_host) calls.
pub struct Array<T: Pod> {
    inner: Option<Arc<BufferInner>>,
    _marker: PhantomData<T>,
}

impl<T: Pod> Clone for Array<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: Pod> Default for Array<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Pod> Array<T> {
    pub const fn new() -> Self {
        Self {
            inner: None,
            _marker: PhantomData,
        }
    }

    /// Allocate `count` elements in device-local memory.
    ///
    /// Any previous allocation is released first. `usage` is extended
    /// with device addressing when the device supports it.
    pub fn initialize(
        &mut self,
        device: &Device,
        count: usize,
        host_mirror: bool,
        usage: ArrayFlags,
    ) -> Result<()> {
        self.initialize_with_memory(device, count, host_mirror, usage, MemoryFlags::DEVICE_LOCAL)
    }

    /// Allocate with explicit memory properties.
    pub fn initialize_with_memory(
        &mut self,
        device: &Device,
        count: usize,
        host_mirror: bool,
        usage: ArrayFlags,
        memory_flags: MemoryFlags,
    ) -> Result<()> {
        self.reset();
        let usage = Self::usage_for(device, usage);
        let size = Self::byte_len(count)?;

        let backend = device.backend();
        let (handle, requirements) = backend.create_buffer(size, usage)?;
        let bound = Memory::allocate_filtered(
            device,
            requirements.size,
            requirements.type_filter,
            false,
            memory_flags,
        )
        .and_then(|memory| {
            backend.bind_buffer_memory(handle, memory.handle(), memory.base_offset())?;
            Ok(memory)
        });
        let memory = match bound {
            Ok(memory) => memory,
            Err(err) => {
                backend.destroy_buffer(handle);
                return Err(err);
            }
        };

        self.inner = Some(Self::wrap(device, handle, usage, count, size, memory, None, host_mirror));
        Ok(())
    }

    /// Sub-allocate `count` elements from caller-owned memory.
    ///
    /// Returns false, leaving the array uninitialized, when the memory is
    /// too small, already in use, freed, or of a type buffers cannot use.
    pub fn initialize_in(
        &mut self,
        memory: &Memory,
        count: usize,
        host_mirror: bool,
        usage: ArrayFlags,
    ) -> bool {
        self.reset();
        let device = memory.device();
        let usage = Self::usage_for(device, usage);
        let Ok(size) = Self::byte_len(count) else {
            return false;
        };

        let backend = device.backend();
        let Ok((handle, requirements)) = backend.create_buffer(size, usage) else {
            return false;
        };
        let reservation = (requirements.type_filter & (1 << memory.type_index()) != 0)
            .then(|| memory.reserve(requirements.size, requirements.alignment))
            .flatten();
        let Some(reservation) = reservation else {
            backend.destroy_buffer(handle);
            return false;
        };
        let view = reservation.memory().clone();
        if let Err(err) = backend.bind_buffer_memory(handle, view.handle(), view.base_offset()) {
            tracing::warn!("Binding sub-allocated buffer failed: {err}");
            backend.destroy_buffer(handle);
            return false;
        }

        self.inner = Some(Self::wrap(
            device,
            handle,
            usage,
            count,
            size,
            view,
            Some(reservation),
            host_mirror,
        ));
        true
    }

    #[allow(clippy::too_many_arguments)]
    fn wrap(
        device: &Device,
        handle: BufferHandle,
        usage: ArrayFlags,
        count: usize,
        size: u64,
        memory: Memory,
        reservation: Option<Reservation>,
        host_mirror: bool,
    ) -> Arc<BufferInner> {
        let address = device.backend().buffer_address(handle);
        tracing::debug!("Array of {count} x {} bytes ({usage:?})", size_of::<T>());
        Arc::new(BufferInner {
            device: device.clone(),
            handle,
            usage,
            count,
            size,
            memory,
            _reservation: reservation,
            address,
            host: host_mirror.then(|| {
                Mutex::new(HostCopy {
                    bytes: vec![0; size as usize],
                    dirty: false,
                })
            }),
        })
    }

    fn usage_for(device: &Device, usage: ArrayFlags) -> ArrayFlags {
        if device.info().supports_device_address {
            usage | ArrayFlags::DEVICE_ADDRESS
        } else {
            usage - ArrayFlags::DEVICE_ADDRESS
        }
    }

    fn byte_len(count: usize) -> Result<u64> {
        if count == 0 || size_of::<T>() == 0 {
            return Err(GpuError::InvalidArgument(
                "arrays need at least one non-empty element".to_string(),
            ));
        }
        count
            .checked_mul(size_of::<T>())
            .map(|n| n as u64)
            .ok_or_else(|| GpuError::InvalidArgument(format!("{count} elements overflow")))
    }

    /// Release the buffer. Clones keep it alive until they reset too.
    pub fn reset(&mut self) {
        self.inner = None;
    }

    pub const fn is_initialized(&self) -> bool {
        self.inner.is_some()
    }

    pub fn len(&self) -> usize {
        self.inner.as_ref().map_or(0, |b| b.count)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub const fn element_size(&self) -> usize {
        size_of::<T>()
    }

    /// Always `len() * element_size()`.
    pub fn byte_size(&self) -> u64 {
        (self.len() * size_of::<T>()) as u64
    }

    pub fn device(&self) -> Option<&Device> {
        self.inner.as_ref().map(|b| &b.device)
    }

    /// The memory the buffer is bound to; a view when sub-allocated.
    pub fn memory(&self) -> Option<&Memory> {
        self.inner.as_ref().map(|b| &b.memory)
    }

    pub fn handle(&self) -> Option<BufferHandle> {
        self.inner.as_ref().map(|b| b.handle)
    }

    pub fn usage(&self) -> ArrayFlags {
        self.inner.as_ref().map_or(ArrayFlags::empty(), |b| b.usage)
    }

    pub fn has_host_mirror(&self) -> bool {
        self.inner.as_ref().is_some_and(|b| b.host.is_some())
    }

    /// Whether two arrays alias the same buffer.
    pub fn shares_buffer<U: Pod>(&self, other: &Array<U>) -> bool {
        match (&self.inner, &other.inner) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Read element `index` from the host mirror.
    ///
    /// `None` when out of range or when the array has no mirror.
    pub fn get(&self, index: usize) -> Option<T> {
        let inner = self.inner.as_ref()?;
        let host = inner.host.as_ref()?.lock();
        let start = index.checked_mul(size_of::<T>())?;
        let end = start.checked_add(size_of::<T>())?;
        let bytes = host.bytes.get(start..end)?;
        Some(bytemuck::pod_read_unaligned(bytes))
    }

    /// Write element `index` of the host mirror.
    pub fn set(&self, index: usize, value: T) -> Result<()> {
        self.write(index, std::slice::from_ref(&value))
    }

    /// Write `values` into the host mirror starting at element `offset`.
    pub fn write(&self, offset: usize, values: &[T]) -> Result<()> {
        let inner = self.buffer()?;
        let mut host = Self::host(&inner)?.lock();
        let bytes: &[u8] = bytemuck::cast_slice(values);
        let (start, end) = byte_span::<T>(offset, bytes.len(), host.bytes.len() as u64)?;
        host.bytes[start as usize..end as usize].copy_from_slice(bytes);
        host.dirty = true;
        Ok(())
    }

    /// Copy of the host mirror. Empty without a mirror.
    pub fn to_vec(&self) -> Vec<T> {
        self.inner
            .as_ref()
            .and_then(|b| b.host.as_ref())
            .map(|host| bytemuck::pod_collect_to_vec(&host.lock().bytes))
            .unwrap_or_default()
    }

    /// Whether the mirror has writes not yet synced to the device.
    pub fn dirty(&self) -> bool {
        self.inner
            .as_ref()
            .and_then(|b| b.host.as_ref())
            .is_some_and(|host| host.lock().dirty)
    }

    /// Push the whole host mirror to the device.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn sync_to_device(&self) -> Result<()> {
        let inner = self.buffer()?;
        let mut host = Self::host(&inner)?.lock();
        Self::upload(&inner, 0, &host.bytes)?;
        host.dirty = false;
        Ok(())
    }

    /// Overwrite the host mirror with the device contents.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn sync_to_host(&self) -> Result<()> {
        let inner = self.buffer()?;
        let mut host = Self::host(&inner)?.lock();
        if inner.memory.is_host_visible() {
            inner.memory.copy_device_to_host(&mut host.bytes, 0)?;
        } else {
            let slot = ReadbackSlot::new();
            inner.device.transfer_queue().execute(&[Command::Download {
                src: inner.handle,
                src_offset: 0,
                size: inner.size,
                slot: slot.clone(),
            }])?;
            let bytes = slot.take().ok_or_else(|| {
                GpuError::InvalidState("download finished without data".to_string())
            })?;
            host.bytes.copy_from_slice(&bytes);
        }
        host.dirty = false;
        Ok(())
    }

    /// Write `values` straight to the device at element `offset`,
    /// bypassing the mirror.
    pub fn write_device(&self, offset: usize, values: &[T]) -> Result<()> {
        let inner = self.buffer()?;
        let bytes: &[u8] = bytemuck::cast_slice(values);
        let (start, _) = byte_span::<T>(offset, bytes.len(), inner.size)?;
        Self::upload(&inner, start, bytes)
    }

    /// Write into the mirror and push the whole mirror to the device.
    pub fn write_synced(&self, offset: usize, values: &[T]) -> Result<()> {
        self.write(offset, values)?;
        self.sync_to_device()
    }

    /// Device location of element `index`.
    pub fn cursor(&self, index: usize) -> Option<ArrayCursor> {
        let inner = self.inner.as_ref()?;
        if index >= inner.count {
            return None;
        }
        let address = if inner.address == 0 {
            0
        } else {
            inner.address + (index * size_of::<T>()) as u64
        };
        Some(ArrayCursor {
            address,
            index,
            count: inner.count,
            element_size: size_of::<T>(),
        })
    }

    pub(crate) fn buffer(&self) -> Result<Arc<BufferInner>> {
        self.inner
            .clone()
            .ok_or_else(|| GpuError::InvalidState("array is not initialized".to_string()))
    }

    fn host(inner: &BufferInner) -> Result<&Mutex<HostCopy>> {
        inner.host.as_ref().ok_or_else(|| {
            GpuError::InvalidState("array was initialized without a host mirror".to_string())
        })
    }

    fn upload(inner: &BufferInner, offset: u64, bytes: &[u8]) -> Result<()> {
        if inner.memory.is_host_visible() {
            inner.memory.copy_host_to_device(bytes, offset)
        } else {
            inner.device.transfer_queue().execute(&[Command::Upload {
                dst: inner.handle,
                dst_offset: offset,
                data: bytes.into(),
            }])
        }
    }
}

/// Byte range of `len` bytes starting at element `offset`, checked against `limit`.
fn byte_span<T>(offset: usize, len: usize, limit: u64) -> Result<(u64, u64)> {
    let start = offset.checked_mul(size_of::<T>()).map(|s| s as u64);
    let end = start.and_then(|s| s.checked_add(len as u64));
    match (start, end) {
        (Some(start), Some(end)) if end <= limit => Ok((start, end)),
        _ => Err(GpuError::OutOfRange {
            offset: start.unwrap_or(u64::MAX),
            end: end.unwrap_or(u64::MAX),
            len: limit,
        }),
    }
}

impl<T: Pod> fmt::Debug for Array<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Array")
            .field("len", &self.len())
            .field("element_size", &size_of::<T>())
            .field("usage", &self.usage())
            .field("mirror", &self.has_host_mirror())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::host::{HostBackend, HostConfig};
    use crate::window::WindowRegistry;
    use nyx_core::ErrorChannel;

    fn device(config: HostConfig) -> (Device, Arc<HostBackend>) {
        let backend = Arc::new(HostBackend::new(config));
        let device = Device::new(
            0,
            backend.clone(),
            Arc::new(ErrorChannel::silent()),
            Arc::new(WindowRegistry::default()),
        )
        .unwrap();
        (device, backend)
    }

    #[test]
    fn byte_size_is_count_times_element_size() {
        let (device, _) = device(HostConfig::default());
        let mut array = Array::<[f32; 3]>::new();
        array.initialize(&device, 10, false, ArrayFlags::default()).unwrap();
        assert_eq!(array.len(), 10);
        assert_eq!(array.element_size(), 12);
        assert_eq!(array.byte_size(), 120);
    }

    #[test]
    fn out_of_range_reads_are_none() {
        let (device, _) = device(HostConfig::default());
        let mut array = Array::<u32>::new();
        array.initialize(&device, 2, true, ArrayFlags::default()).unwrap();
        array.set(1, 9).unwrap();
        assert_eq!(array.get(1), Some(9));
        assert_eq!(array.get(2), None);
        assert!(array.set(2, 1).is_err());
    }

    #[test]
    fn huge_indices_are_errors_not_overflows() {
        let (device, _) = device(HostConfig::default());
        let mut array = Array::<u32>::new();
        array.initialize(&device, 4, true, ArrayFlags::default()).unwrap();
        assert_eq!(array.get(usize::MAX / size_of::<u32>()), None);
        assert_eq!(array.get(usize::MAX), None);
        assert!(matches!(
            array.set(usize::MAX / 2, 1),
            Err(GpuError::OutOfRange { .. })
        ));
        assert!(matches!(
            array.write(usize::MAX / size_of::<u32>(), &[1, 2]),
            Err(GpuError::OutOfRange { .. })
        ));
        assert!(matches!(
            array.write_device(usize::MAX / 2, &[1]),
            Err(GpuError::OutOfRange { .. })
        ));
        assert_eq!(array.to_vec(), vec![0; 4]);
    }

    #[test]
    fn clones_alias_the_buffer() {
        let (device, _) = device(HostConfig::default());
        let mut array = Array::<u32>::new();
        array.initialize(&device, 4, true, ArrayFlags::default()).unwrap();
        let alias = array.clone();
        alias.set(0, 42).unwrap();
        assert_eq!(array.get(0), Some(42));
        assert!(array.shares_buffer(&alias));
    }

    #[test]
    fn device_local_sync_round_trip() {
        let (device, backend) = device(HostConfig::default());
        let mut array = Array::<u32>::new();
        array.initialize(&device, 4, true, ArrayFlags::default()).unwrap();
        array.write(0, &[5, 6, 7, 8]).unwrap();
        assert!(array.dirty());
        array.sync_to_device().unwrap();
        assert!(!array.dirty());

        array.write(0, &[0, 0, 0, 0]).unwrap();
        array.sync_to_host().unwrap();
        assert_eq!(array.to_vec(), vec![5, 6, 7, 8]);
        assert_eq!(backend.stats().submissions, 2);
    }

    #[test]
    fn host_visible_sync_skips_the_queue() {
        let (device, backend) = device(HostConfig::default());
        let mut array = Array::<u16>::new();
        array
            .initialize_with_memory(&device, 3, true, ArrayFlags::default(), MemoryFlags::HOST_SHARED)
            .unwrap();
        array.write_synced(0, &[1, 2, 3]).unwrap();
        array.sync_to_host().unwrap();
        assert_eq!(array.to_vec(), vec![1, 2, 3]);
        assert_eq!(backend.stats().submissions, 0);
    }

    #[test]
    fn sub_allocation_fails_when_too_small() {
        let (device, _) = device(HostConfig::default());
        let memory = Memory::allocate(&device, 64, false, MemoryFlags::DEVICE_LOCAL).unwrap();

        let mut fits = Array::<u32>::new();
        assert!(fits.initialize_in(&memory, 8, false, ArrayFlags::default()));
        assert_eq!(fits.memory().unwrap().base_offset(), 0);

        let mut too_big = Array::<u32>::new();
        assert!(!too_big.initialize_in(&memory, 16, false, ArrayFlags::default()));
        assert!(!too_big.is_initialized());

        let mut rest = Array::<u32>::new();
        assert!(rest.initialize_in(&memory, 8, false, ArrayFlags::default()));
        assert_eq!(rest.memory().unwrap().base_offset(), 32);
    }

    #[test]
    fn cursor_addresses_elements() {
        let (device, _) = device(HostConfig::default());
        let mut array = Array::<u64>::new();
        array.initialize(&device, 4, false, ArrayFlags::default()).unwrap();
        let first = array.cursor(0).unwrap();
        let third = array.cursor(2).unwrap();
        assert_ne!(first.address, 0);
        assert_eq!(third.address - first.address, 16);
        assert_eq!(third.count, 4);
        assert!(array.cursor(4).is_none());
        assert!(array.usage().contains(ArrayFlags::DEVICE_ADDRESS));
    }

    #[test]
    fn addresses_are_dropped_without_device_support() {
        let (device, _) = device(HostConfig::default().with_device_address(false));
        let mut array = Array::<u32>::new();
        array
            .initialize(&device, 1, false, ArrayFlags::default() | ArrayFlags::DEVICE_ADDRESS)
            .unwrap();
        assert_eq!(array.cursor(0).unwrap().address, 0);
        assert!(!array.usage().contains(ArrayFlags::DEVICE_ADDRESS));
    }
}
