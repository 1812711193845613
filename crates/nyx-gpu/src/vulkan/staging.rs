//! Host-visible staging buffers for uploads and downloads.
//!
//! Front-end memory is allocated raw so it can be sub-allocated by the
//! caller; staging is transient and goes through `gpu-allocator`.

use crate::error::{GpuError, Result};
use ash::vk;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;

/// A staging buffer and its allocation.
pub struct StagingBuffer {
    pub buffer: vk::Buffer,
    allocation: Option<Allocation>,
    size: u64,
}

impl StagingBuffer {
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        let mapped = self
            .allocation
            .as_mut()
            .and_then(Allocation::mapped_slice_mut)
            .ok_or_else(|| GpuError::InvalidState("staging buffer is not mapped".to_string()))?;
        mapped[..data.len()].copy_from_slice(data);
        Ok(())
    }

    pub fn read(&self) -> Result<Vec<u8>> {
        let mapped = self
            .allocation
            .as_ref()
            .and_then(Allocation::mapped_slice)
            .ok_or_else(|| GpuError::InvalidState("staging buffer is not mapped".to_string()))?;
        Ok(mapped[..self.size as usize].to_vec())
    }
}

/// Staging allocator. Shut down before the device is destroyed.
pub struct Staging {
    allocator: Mutex<Option<Allocator>>,
}

impl Staging {
    /// # Safety
    /// The instance, device, and physical device must be valid.
    pub unsafe fn new(
        instance: &ash::Instance,
        device: &ash::Device,
        physical_device: vk::PhysicalDevice,
        buffer_device_address: bool,
    ) -> Result<Self> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: gpu_allocator::AllocatorDebugSettings {
                log_memory_information: cfg!(debug_assertions),
                log_leaks_on_shutdown: true,
                store_stack_traces: false,
                log_allocations: false,
                log_frees: false,
                log_stack_traces: false,
            },
            buffer_device_address,
            allocation_sizes: gpu_allocator::AllocationSizes::default(),
        })
        .map_err(|e| GpuError::AllocationFailed(e.to_string()))?;

        Ok(Self {
            allocator: Mutex::new(Some(allocator)),
        })
    }

    /// A mapped buffer of `size` bytes. Uploads read from it, downloads
    /// write to it.
    pub fn create(&self, device: &ash::Device, size: u64, upload: bool) -> Result<StagingBuffer> {
        let (usage, location, name) = if upload {
            (vk::BufferUsageFlags::TRANSFER_SRC, MemoryLocation::CpuToGpu, "upload staging")
        } else {
            (vk::BufferUsageFlags::TRANSFER_DST, MemoryLocation::GpuToCpu, "download staging")
        };

        let buffer_info = vk::BufferCreateInfo::default()
            .size(size.max(1))
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { device.create_buffer(&buffer_info, None)? };
        let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };

        let allocated = self
            .allocator
            .lock()
            .as_mut()
            .ok_or_else(|| GpuError::InvalidState("staging allocator is shut down".to_string()))
            .and_then(|allocator| {
                allocator
                    .allocate(&AllocationCreateDesc {
                        name,
                        requirements,
                        location,
                        linear: true,
                        allocation_scheme: AllocationScheme::GpuAllocatorManaged,
                    })
                    .map_err(|e| GpuError::AllocationFailed(e.to_string()))
            });
        let allocation = match allocated {
            Ok(allocation) => allocation,
            Err(err) => {
                unsafe { device.destroy_buffer(buffer, None) };
                return Err(err);
            }
        };

        let mut staging = StagingBuffer {
            buffer,
            allocation: None,
            size,
        };
        let bound = unsafe {
            device.bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        };
        staging.allocation = Some(allocation);
        if let Err(err) = bound {
            self.free(device, staging);
            return Err(err.into());
        }
        Ok(staging)
    }

    pub fn free(&self, device: &ash::Device, mut staging: StagingBuffer) {
        if let Some(allocation) = staging.allocation.take() {
            if let Some(allocator) = self.allocator.lock().as_mut() {
                if let Err(err) = allocator.free(allocation) {
                    tracing::warn!("Failed to free staging memory: {err}");
                }
            }
        }
        unsafe { device.destroy_buffer(staging.buffer, None) };
    }

    /// Free all staging memory. Must run before the device is destroyed.
    pub fn shutdown(&self) {
        self.allocator.lock().take();
    }
}
