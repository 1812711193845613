//! Surfaces and swapchains.

use super::convert;
use crate::error::{GpuError, Result};
use ash::vk;
use nyx_core::ImageFormat;

/// A window surface with its swapchain.
pub struct VulkanSwapchain {
    pub surface: vk::SurfaceKHR,
    pub swapchain: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
    pub views: Vec<vk::ImageView>,
    /// Front-end handles of `images`, in order.
    pub handles: Vec<u64>,
    pub format: ImageFormat,
    pub extent: vk::Extent2D,
    /// Signaled when an acquired image is ready.
    pub acquire_fence: vk::Fence,
}

/// Everything needed to build a swapchain for a surface.
pub struct SwapchainParams<'a> {
    pub device: &'a ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub surface_loader: &'a ash::khr::surface::Instance,
    pub swapchain_loader: &'a ash::khr::swapchain::Device,
    pub graphics_family: u32,
}

impl VulkanSwapchain {
    /// Create a swapchain for `surface`. The surface is owned by the result
    /// on success and left to the caller on failure.
    ///
    /// # Safety
    /// All handles must be valid.
    pub unsafe fn new(
        params: &SwapchainParams<'_>,
        surface: vk::SurfaceKHR,
        width: u32,
        height: u32,
        vsync: bool,
    ) -> Result<Self> {
        let loader = params.surface_loader;
        let supported = unsafe {
            loader.get_physical_device_surface_support(
                params.physical_device,
                params.graphics_family,
                surface,
            )?
        };
        if !supported {
            return Err(GpuError::Unsupported(
                "graphics queue cannot present to this surface".to_string(),
            ));
        }

        let (caps, formats, present_modes) = unsafe {
            (
                loader.get_physical_device_surface_capabilities(params.physical_device, surface)?,
                loader.get_physical_device_surface_formats(params.physical_device, surface)?,
                loader.get_physical_device_surface_present_modes(params.physical_device, surface)?,
            )
        };

        let surface_format = select_surface_format(&formats).ok_or_else(|| {
            GpuError::SwapchainCreation("surface offers no usable format".to_string())
        })?;
        let format = convert::image_format(surface_format.format).ok_or_else(|| {
            GpuError::SwapchainCreation(format!(
                "unsupported surface format {:?}",
                surface_format.format
            ))
        })?;
        let present_mode = select_present_mode(&present_modes, vsync);
        let extent = calculate_extent(&caps, width, height);

        let mut image_count = caps.min_image_count + 1;
        if caps.max_image_count > 0 && image_count > caps.max_image_count {
            image_count = caps.max_image_count;
        }

        let queue_families = [params.graphics_family];
        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(
                vk::ImageUsageFlags::COLOR_ATTACHMENT
                    | vk::ImageUsageFlags::TRANSFER_DST
                    | vk::ImageUsageFlags::TRANSFER_SRC,
            )
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .queue_family_indices(&queue_families)
            .pre_transform(caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true);

        let swapchain = unsafe {
            params
                .swapchain_loader
                .create_swapchain(&create_info, None)
                .map_err(|e| GpuError::SwapchainCreation(e.to_string()))?
        };

        let mut created = Self {
            surface,
            swapchain,
            images: Vec::new(),
            views: Vec::new(),
            handles: Vec::new(),
            format,
            extent,
            acquire_fence: vk::Fence::null(),
        };
        if let Err(err) = unsafe { created.fill(params, surface_format.format) } {
            unsafe { created.destroy_swapchain(params.device, params.swapchain_loader) };
            return Err(err);
        }
        Ok(created)
    }

    unsafe fn fill(&mut self, params: &SwapchainParams<'_>, format: vk::Format) -> Result<()> {
        self.images = unsafe { params.swapchain_loader.get_swapchain_images(self.swapchain)? };
        for &image in &self.images {
            let view_info = vk::ImageViewCreateInfo::default()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(format)
                .components(vk::ComponentMapping::default())
                .subresource_range(
                    vk::ImageSubresourceRange::default()
                        .aspect_mask(vk::ImageAspectFlags::COLOR)
                        .level_count(1)
                        .layer_count(1),
                );
            self.views
                .push(unsafe { params.device.create_image_view(&view_info, None)? });
        }
        self.acquire_fence =
            unsafe { params.device.create_fence(&vk::FenceCreateInfo::default(), None)? };
        Ok(())
    }

    /// Acquire the next image and wait until it can be rendered to.
    ///
    /// # Safety
    /// All handles must be valid and `fence` unsignaled.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub unsafe fn acquire(
        device: &ash::Device,
        loader: &ash::khr::swapchain::Device,
        swapchain: vk::SwapchainKHR,
        fence: vk::Fence,
    ) -> Result<(u32, bool)> {
        let (index, suboptimal) = unsafe {
            loader.acquire_next_image(swapchain, u64::MAX, vk::Semaphore::null(), fence)?
        };
        unsafe {
            device.wait_for_fences(&[fence], true, u64::MAX)?;
            device.reset_fences(&[fence])?;
        }
        Ok((index, suboptimal))
    }

    /// Present an image. Returns true when the swapchain is stale.
    ///
    /// # Safety
    /// All handles must be valid.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub unsafe fn present(
        loader: &ash::khr::swapchain::Device,
        queue: vk::Queue,
        swapchain: vk::SwapchainKHR,
        index: u32,
    ) -> Result<bool> {
        let swapchains = [swapchain];
        let indices = [index];
        let present_info = vk::PresentInfoKHR::default()
            .swapchains(&swapchains)
            .image_indices(&indices);

        match unsafe { loader.queue_present(queue, &present_info) } {
            Ok(suboptimal) => Ok(suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(true),
            Err(e) => Err(GpuError::from(e)),
        }
    }

    /// Destroy the swapchain, leaving the surface alive.
    ///
    /// # Safety
    /// The swapchain must not be in use.
    pub unsafe fn destroy_swapchain(
        &self,
        device: &ash::Device,
        loader: &ash::khr::swapchain::Device,
    ) {
        unsafe {
            for &view in &self.views {
                device.destroy_image_view(view, None);
            }
            if self.acquire_fence != vk::Fence::null() {
                device.destroy_fence(self.acquire_fence, None);
            }
            loader.destroy_swapchain(self.swapchain, None);
        }
    }
}

/// Prefer 8-bit BGRA sRGB, then any format the front end can name.
pub fn select_surface_format(available: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    available
        .iter()
        .find(|f| {
            f.format == vk::Format::B8G8R8A8_SRGB
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| {
            available
                .iter()
                .find(|f| convert::image_format(f.format).is_some())
        })
        .copied()
}

pub fn select_present_mode(available: &[vk::PresentModeKHR], vsync: bool) -> vk::PresentModeKHR {
    if vsync {
        return vk::PresentModeKHR::FIFO;
    }
    [vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::IMMEDIATE]
        .into_iter()
        .find(|mode| available.contains(mode))
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

pub fn calculate_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    desired_width: u32,
    desired_height: u32,
) -> vk::Extent2D {
    if capabilities.current_extent.width == u32::MAX {
        vk::Extent2D {
            width: desired_width.clamp(
                capabilities.min_image_extent.width,
                capabilities.max_image_extent.width,
            ),
            height: desired_height.clamp(
                capabilities.min_image_extent.height,
                capabilities.max_image_extent.height,
            ),
        }
    } else {
        capabilities.current_extent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn surface_format(format: vk::Format) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }
    }

    #[test]
    fn prefers_srgb_bgra() {
        let formats = [
            surface_format(vk::Format::R8G8B8A8_UNORM),
            surface_format(vk::Format::B8G8R8A8_SRGB),
        ];
        assert_eq!(
            select_surface_format(&formats).map(|f| f.format),
            Some(vk::Format::B8G8R8A8_SRGB)
        );
        assert!(select_surface_format(&[surface_format(vk::Format::R16_UNORM)]).is_none());
    }

    #[test]
    fn present_mode_fallbacks() {
        let modes = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::IMMEDIATE];
        assert_eq!(select_present_mode(&modes, true), vk::PresentModeKHR::FIFO);
        assert_eq!(select_present_mode(&modes, false), vk::PresentModeKHR::IMMEDIATE);
        assert_eq!(select_present_mode(&[], false), vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn extent_is_clamped_when_surface_defers() {
        let caps = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
            max_image_extent: vk::Extent2D {
                width: 800,
                height: 600,
            },
            ..Default::default()
        };
        let extent = calculate_extent(&caps, 1024, 100);
        assert_eq!((extent.width, extent.height), (800, 100));
    }
}
