//! Physical device capability detection.

use super::instance::supports_1_3;
use crate::backend::{DeviceInfo, DeviceKind};
use ash::vk;
use std::collections::HashSet;
use std::ffi::CStr;

/// GPU vendor identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Apple,
    Other(u32),
}

impl GpuVendor {
    /// Identify vendor from PCI vendor ID.
    pub const fn from_vendor_id(id: u32) -> Self {
        match id {
            0x10DE => Self::Nvidia,
            0x1002 => Self::Amd,
            0x8086 => Self::Intel,
            0x106B => Self::Apple,
            other => Self::Other(other),
        }
    }
}

/// What a physical device offers.
#[derive(Debug, Clone)]
pub struct Capabilities {
    pub vendor: GpuVendor,
    pub vendor_id: u32,
    pub device_name: String,
    pub device_type: vk::PhysicalDeviceType,
    pub api_version: u32,
    pub driver_version: u32,

    pub supports_dynamic_rendering: bool,
    pub supports_synchronization2: bool,
    pub supports_buffer_device_address: bool,
    pub supports_swapchain: bool,

    /// Device-local memory in MB
    pub device_local_memory_mb: u64,
    pub max_push_constants_size: u32,
    pub max_compute_workgroup_count: [u32; 3],

    pub available_extensions: HashSet<String>,
}

impl Capabilities {
    /// Query capabilities from a physical device.
    ///
    /// # Safety
    /// The instance and physical device must be valid.
    pub unsafe fn query(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Self {
        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };

        let available_extensions: HashSet<String> =
            unsafe { instance.enumerate_device_extension_properties(physical_device) }
                .unwrap_or_default()
                .iter()
                .filter_map(|ext| ext.extension_name_as_c_str().ok())
                .filter_map(|name| name.to_str().ok().map(String::from))
                .collect();

        let mut features12 = vk::PhysicalDeviceVulkan12Features::default();
        let mut features13 = vk::PhysicalDeviceVulkan13Features::default();
        let has_1_3 = supports_1_3(properties.api_version);
        if has_1_3 {
            let mut features2 = vk::PhysicalDeviceFeatures2::default()
                .push_next(&mut features12)
                .push_next(&mut features13);
            unsafe { instance.get_physical_device_features2(physical_device, &mut features2) };
        }

        let device_name = properties
            .device_name_as_c_str()
            .map(CStr::to_string_lossy)
            .map_or_else(|_| "unknown device".to_string(), |name| name.into_owned());

        let device_local_memory_mb: u64 = memory_properties
            .memory_heaps
            .iter()
            .take(memory_properties.memory_heap_count as usize)
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size / (1024 * 1024))
            .sum();

        let swapchain = ash::khr::swapchain::NAME.to_string_lossy();

        Self {
            vendor: GpuVendor::from_vendor_id(properties.vendor_id),
            vendor_id: properties.vendor_id,
            device_name,
            device_type: properties.device_type,
            api_version: properties.api_version,
            driver_version: properties.driver_version,

            supports_dynamic_rendering: has_1_3 && features13.dynamic_rendering == vk::TRUE,
            supports_synchronization2: has_1_3 && features13.synchronization2 == vk::TRUE,
            supports_buffer_device_address: features12.buffer_device_address == vk::TRUE,
            supports_swapchain: available_extensions.contains(swapchain.as_ref()),

            device_local_memory_mb,
            max_push_constants_size: properties.limits.max_push_constants_size,
            max_compute_workgroup_count: properties.limits.max_compute_work_group_count,

            available_extensions,
        }
    }

    /// Vulkan 1.3 with dynamic rendering and synchronization2.
    pub const fn meets_requirements(&self) -> bool {
        supports_1_3(self.api_version)
            && self.supports_dynamic_rendering
            && self.supports_synchronization2
    }

    pub fn summary(&self) -> String {
        format!(
            "{} ({:?}) - Vulkan {}.{}.{} - {} MB VRAM",
            self.device_name,
            self.vendor,
            vk::api_version_major(self.api_version),
            vk::api_version_minor(self.api_version),
            vk::api_version_patch(self.api_version),
            self.device_local_memory_mb,
        )
    }

    /// Device description for the front end.
    pub fn info(&self, presentation: bool) -> DeviceInfo {
        DeviceInfo {
            name: self.device_name.clone(),
            kind: match self.device_type {
                vk::PhysicalDeviceType::DISCRETE_GPU => DeviceKind::Discrete,
                vk::PhysicalDeviceType::INTEGRATED_GPU => DeviceKind::Integrated,
                vk::PhysicalDeviceType::VIRTUAL_GPU => DeviceKind::Virtual,
                vk::PhysicalDeviceType::CPU => DeviceKind::Cpu,
                _ => DeviceKind::Other,
            },
            vendor_id: self.vendor_id,
            supports_device_address: self.supports_buffer_device_address,
            supports_presentation: presentation && self.supports_swapchain,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vendor_identification() {
        assert_eq!(GpuVendor::from_vendor_id(0x10DE), GpuVendor::Nvidia);
        assert_eq!(GpuVendor::from_vendor_id(0x1002), GpuVendor::Amd);
        assert_eq!(GpuVendor::from_vendor_id(0x8086), GpuVendor::Intel);
        assert_eq!(GpuVendor::from_vendor_id(0x1234), GpuVendor::Other(0x1234));
    }
}
