//! Vulkan instance creation and device ranking.

use crate::error::{GpuError, Result};
use ash::vk;
use std::ffi::{c_char, CStr, CString};

/// Surface extensions for the platforms windows may come from.
pub fn surface_extensions() -> Vec<&'static CStr> {
    vec![
        ash::khr::surface::NAME,
        #[cfg(target_os = "windows")]
        ash::khr::win32_surface::NAME,
        #[cfg(target_os = "linux")]
        ash::khr::xlib_surface::NAME,
        #[cfg(target_os = "linux")]
        ash::khr::xcb_surface::NAME,
        #[cfg(target_os = "linux")]
        ash::khr::wayland_surface::NAME,
        #[cfg(target_os = "macos")]
        ash::ext::metal_surface::NAME,
    ]
}

pub fn validation_layers() -> Vec<&'static CStr> {
    vec![c"VK_LAYER_KHRONOS_validation"]
}

/// Create an instance, enabling surface extensions when `presentation` is
/// set. Unavailable extensions and layers are skipped with a warning.
///
/// # Safety
/// The entry must be a valid Vulkan entry point.
pub unsafe fn create_instance(
    entry: &ash::Entry,
    app_name: &str,
    validation: bool,
    presentation: bool,
) -> Result<ash::Instance> {
    let app_name = CString::new(app_name)
        .map_err(|_| GpuError::InvalidArgument("application name contains NUL".to_string()))?;

    let app_info = vk::ApplicationInfo::default()
        .application_name(&app_name)
        .application_version(vk::make_api_version(0, 0, 1, 0))
        .engine_name(c"nyx")
        .engine_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(vk::API_VERSION_1_3);

    let available: Vec<String> = unsafe { entry.enumerate_instance_extension_properties(None)? }
        .iter()
        .filter_map(|ext| ext.extension_name_as_c_str().ok())
        .filter_map(|name| name.to_str().ok().map(String::from))
        .collect();

    let mut wanted = Vec::new();
    if presentation {
        wanted.extend(surface_extensions());
    }
    #[cfg(target_os = "macos")]
    wanted.push(ash::khr::portability_enumeration::NAME);

    let mut extension_names: Vec<*const c_char> = Vec::new();
    for ext in wanted {
        let name = ext.to_string_lossy();
        if available.iter().any(|a| *a == name) {
            extension_names.push(ext.as_ptr());
        } else {
            tracing::warn!("Instance extension {} not available", name);
        }
    }

    let layers = if validation {
        validation_layers()
    } else {
        Vec::new()
    };
    let available_layers = unsafe { entry.enumerate_instance_layer_properties()? };
    let layer_names: Vec<*const c_char> = layers
        .iter()
        .filter(|&&layer| {
            let found = available_layers
                .iter()
                .any(|props| props.layer_name_as_c_str().ok() == Some(layer));
            if !found {
                tracing::warn!("Validation layer {} not available", layer.to_string_lossy());
            }
            found
        })
        .map(|layer| layer.as_ptr())
        .collect();

    // Required for MoltenVK on macOS
    #[cfg(target_os = "macos")]
    let create_flags = vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR;
    #[cfg(not(target_os = "macos"))]
    let create_flags = vk::InstanceCreateFlags::empty();

    let create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_extension_names(&extension_names)
        .enabled_layer_names(&layer_names)
        .flags(create_flags);

    Ok(unsafe { entry.create_instance(&create_info, None)? })
}

/// Rank a physical device. Devices without Vulkan 1.3 score below zero.
///
/// # Safety
/// The instance and device must be valid.
pub unsafe fn score_physical_device(instance: &ash::Instance, device: vk::PhysicalDevice) -> i64 {
    let properties = unsafe { instance.get_physical_device_properties(device) };
    if !supports_1_3(properties.api_version) {
        return -1;
    }

    let mut score = match properties.device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 50,
        _ => 0,
    };

    let memory = unsafe { instance.get_physical_device_memory_properties(device) };
    let vram_gb: u64 = memory
        .memory_heaps
        .iter()
        .take(memory.memory_heap_count as usize)
        .filter(|h| h.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
        .map(|h| h.size >> 30)
        .sum();
    score += vram_gb as i64;
    score
}

pub const fn supports_1_3(api_version: u32) -> bool {
    let major = vk::api_version_major(api_version);
    major > 1 || (major == 1 && vk::api_version_minor(api_version) >= 3)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_gate() {
        assert!(supports_1_3(vk::API_VERSION_1_3));
        assert!(!supports_1_3(vk::API_VERSION_1_2));
        assert!(supports_1_3(vk::make_api_version(0, 2, 0, 0)));
    }

    #[test]
    fn surface_extension_list_starts_with_surface() {
        assert_eq!(surface_extensions()[0], ash::khr::surface::NAME);
    }
}
