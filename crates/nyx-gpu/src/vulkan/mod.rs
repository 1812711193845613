//! Vulkan backend.
//!
//! Requires Vulkan 1.3 with dynamic rendering and synchronization2. Each
//! suitable physical device becomes one [`VulkanBackend`]; all of them
//! share a single instance.

mod capabilities;
mod command;
mod convert;
mod device;
mod instance;
mod pipeline;
mod staging;
mod swapchain;

pub use capabilities::{Capabilities, GpuVendor};
pub use device::VulkanBackend;

use crate::backend::Backend;
use crate::error::{GpuError, Result};
use std::sync::Arc;

/// Instance-level settings.
#[derive(Debug, Clone)]
pub struct VulkanConfig {
    pub app_name: String,
    pub validation: bool,
    /// Load surface extensions and create swapchain-capable devices.
    pub presentation: bool,
}

impl Default for VulkanConfig {
    fn default() -> Self {
        Self {
            app_name: "nyx".to_string(),
            validation: cfg!(debug_assertions),
            presentation: !cfg!(feature = "headless"),
        }
    }
}

/// The loader and instance, destroyed after the last device.
pub(crate) struct InstanceShared {
    pub entry: ash::Entry,
    pub instance: ash::Instance,
    pub surface_loader: Option<ash::khr::surface::Instance>,
}

impl Drop for InstanceShared {
    fn drop(&mut self) {
        unsafe { self.instance.destroy_instance(None) };
    }
}

/// Create a backend for every physical device that meets the requirements,
/// best first.
///
/// Devices that fail to initialize are skipped with a warning.
pub fn enumerate_devices(config: &VulkanConfig) -> Result<Vec<Arc<dyn Backend>>> {
    let presentation = config.presentation && !cfg!(feature = "headless");

    let entry = unsafe { ash::Entry::load() }
        .map_err(|e| GpuError::Other(format!("Failed to load Vulkan: {e}")))?;
    let instance = unsafe {
        instance::create_instance(&entry, &config.app_name, config.validation, presentation)?
    };
    let surface_loader = presentation.then(|| ash::khr::surface::Instance::new(&entry, &instance));
    let shared = Arc::new(InstanceShared {
        entry,
        instance,
        surface_loader,
    });

    let physical_devices = unsafe { shared.instance.enumerate_physical_devices()? };
    let mut ranked: Vec<_> = physical_devices
        .into_iter()
        .map(|device| {
            let score = unsafe { instance::score_physical_device(&shared.instance, device) };
            (score, device)
        })
        .filter(|(score, _)| *score >= 0)
        .collect();
    ranked.sort_by_key(|(score, _)| std::cmp::Reverse(*score));

    let mut backends: Vec<Arc<dyn Backend>> = Vec::new();
    for (_, physical_device) in ranked {
        let capabilities =
            unsafe { Capabilities::query(&shared.instance, physical_device) };
        if !capabilities.meets_requirements() {
            tracing::warn!(
                "Skipping {}: missing dynamic rendering or synchronization2",
                capabilities.device_name
            );
            continue;
        }

        let summary = capabilities.summary();
        match unsafe {
            VulkanBackend::new(
                Arc::clone(&shared),
                physical_device,
                capabilities,
                presentation,
            )
        } {
            Ok(backend) => {
                tracing::info!("Vulkan device {}: {summary}", backends.len());
                backends.push(Arc::new(backend));
            }
            Err(err) => tracing::warn!("Skipping {summary}: {err}"),
        }
    }

    if backends.is_empty() {
        return Err(GpuError::NoSuitableDevice);
    }
    Ok(backends)
}
