//! Vulkan implementation of [`Backend`].

use super::capabilities::Capabilities;
use super::command::Recorder;
use super::convert;
use super::pipeline::{self, VulkanPipeline};
use super::staging::{Staging, StagingBuffer};
use super::swapchain::{SwapchainParams, VulkanSwapchain};
use super::InstanceShared;
use crate::backend::{
    select_queue_families, Backend, BufferHandle, Command, DeviceInfo, ImageDesc, ImageHandle,
    MemoryHandle, MemoryRequirements, MemoryType, PipelineDesc, PipelineHandle, QueueFamily,
    QueueHandle, ReadbackSlot, Resource, SwapchainDesc, SwapchainHandle, SwapchainInfo, Ticket,
};
use crate::error::{GpuError, Result};
use crate::window::WindowSource;
use ash::vk;
use nyx_core::{ArrayFlags, Extent2D, ImageUsage};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ffi::CStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub(crate) struct MemoryRecord {
    memory: vk::DeviceMemory,
    size: u64,
    flags: vk::MemoryPropertyFlags,
}

pub(crate) struct BufferRecord {
    pub buffer: vk::Buffer,
    usage: ArrayFlags,
    bound: bool,
}

pub(crate) struct ImageRecord {
    pub image: vk::Image,
    /// Null until memory is bound.
    pub view: vk::ImageView,
    pub desc: ImageDesc,
    /// False for swapchain images, which the swapchain destroys.
    owned: bool,
}

/// Native objects addressed by front-end handles.
#[derive(Default)]
pub(crate) struct Objects {
    memories: HashMap<u64, MemoryRecord>,
    buffers: HashMap<u64, BufferRecord>,
    images: HashMap<u64, ImageRecord>,
    pipelines: HashMap<u64, VulkanPipeline>,
    swapchains: HashMap<u64, VulkanSwapchain>,
}

impl Objects {
    pub fn buffer(&self, handle: BufferHandle) -> Result<&BufferRecord> {
        self.buffers
            .get(&handle.0)
            .ok_or_else(|| GpuError::ResourceNotFound(format!("buffer {}", handle.0)))
    }

    pub fn image(&self, handle: ImageHandle) -> Result<&ImageRecord> {
        self.images
            .get(&handle.0)
            .ok_or_else(|| GpuError::ResourceNotFound(format!("image {}", handle.0)))
    }

    pub fn pipeline(&self, handle: PipelineHandle) -> Result<&VulkanPipeline> {
        self.pipelines
            .get(&handle.0)
            .ok_or_else(|| GpuError::ResourceNotFound(format!("pipeline {}", handle.0)))
    }

    fn memory(&self, handle: MemoryHandle) -> Result<&MemoryRecord> {
        self.memories
            .get(&handle.0)
            .ok_or(GpuError::UseAfterFree)
    }
}

/// Work handed to a queue and not yet waited on.
struct Submission {
    family: u32,
    cmd: vk::CommandBuffer,
    fence: vk::Fence,
    buffers: Vec<StagingBuffer>,
    readbacks: Vec<(ReadbackSlot, usize)>,
}

/// One Vulkan logical device.
pub struct VulkanBackend {
    instance: Arc<InstanceShared>,
    physical_device: vk::PhysicalDevice,
    device: ash::Device,
    swapchain_loader: Option<ash::khr::swapchain::Device>,
    capabilities: Capabilities,
    info: DeviceInfo,
    memory_types: Vec<MemoryType>,
    memory_flags: Vec<vk::MemoryPropertyFlags>,
    families: Vec<QueueFamily>,
    queues: HashMap<QueueHandle, vk::Queue>,
    graphics_family: u32,
    sampler: vk::Sampler,
    staging: Staging,
    // Lock order: pools, then objects. Submissions are only held briefly.
    objects: Mutex<Objects>,
    pools: Mutex<HashMap<u32, vk::CommandPool>>,
    submissions: Mutex<HashMap<u64, Submission>>,
    next_handle: AtomicU64,
    next_ticket: AtomicU64,
}

impl VulkanBackend {
    /// Create a logical device with one queue in every family.
    ///
    /// # Safety
    /// `physical_device` must belong to `instance`.
    pub(crate) unsafe fn new(
        instance: Arc<InstanceShared>,
        physical_device: vk::PhysicalDevice,
        capabilities: Capabilities,
        presentation: bool,
    ) -> Result<Self> {
        let vk_instance = &instance.instance;
        let family_properties =
            unsafe { vk_instance.get_physical_device_queue_family_properties(physical_device) };
        let presentation = presentation
            && capabilities.supports_swapchain
            && instance.surface_loader.is_some();

        let families: Vec<QueueFamily> = family_properties
            .iter()
            .enumerate()
            .filter(|(_, props)| props.queue_count > 0)
            .map(|(index, props)| QueueFamily {
                index: index as u32,
                capabilities: convert::queue_capabilities(
                    props.queue_flags,
                    presentation && props.queue_flags.contains(vk::QueueFlags::GRAPHICS),
                ),
                queue_count: 1,
            })
            .collect();
        let graphics_family = select_queue_families(&families)
            .ok_or(GpuError::NoSuitableDevice)?
            .graphics;

        let priority = 1.0_f32;
        let queue_infos: Vec<_> = families
            .iter()
            .map(|family| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(family.index)
                    .queue_priorities(std::slice::from_ref(&priority))
            })
            .collect();

        let mut extensions: Vec<&CStr> = Vec::new();
        if presentation {
            extensions.push(ash::khr::swapchain::NAME);
        }
        let extension_names: Vec<_> = extensions.iter().map(|ext| ext.as_ptr()).collect();

        let device_address = capabilities.supports_buffer_device_address;
        let mut features13 = vk::PhysicalDeviceVulkan13Features::default()
            .dynamic_rendering(true)
            .synchronization2(true);
        let mut features12 =
            vk::PhysicalDeviceVulkan12Features::default().buffer_device_address(device_address);
        let mut features2 = vk::PhysicalDeviceFeatures2::default()
            .push_next(&mut features13)
            .push_next(&mut features12);

        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&extension_names)
            .push_next(&mut features2);
        let device = unsafe { vk_instance.create_device(physical_device, &create_info, None)? };

        let queues = families
            .iter()
            .map(|family| {
                let handle = QueueHandle {
                    family: family.index,
                    index: 0,
                };
                (handle, unsafe { device.get_device_queue(family.index, 0) })
            })
            .collect();

        let memory_properties =
            unsafe { vk_instance.get_physical_device_memory_properties(physical_device) };
        let native_types =
            &memory_properties.memory_types[..memory_properties.memory_type_count as usize];
        let memory_flags: Vec<_> = native_types.iter().map(|t| t.property_flags).collect();
        let memory_types = native_types
            .iter()
            .map(|t| MemoryType {
                flags: convert::memory_flags(t.property_flags),
                heap: t.heap_index,
            })
            .collect();

        let sampler_info = vk::SamplerCreateInfo::default()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
            .address_mode_u(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .address_mode_v(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .address_mode_w(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .max_lod(vk::LOD_CLAMP_NONE);
        let sampler = match unsafe { device.create_sampler(&sampler_info, None) } {
            Ok(sampler) => sampler,
            Err(err) => {
                unsafe { device.destroy_device(None) };
                return Err(err.into());
            }
        };

        let staging = match unsafe {
            Staging::new(vk_instance, &device, physical_device, device_address)
        } {
            Ok(staging) => staging,
            Err(err) => {
                unsafe {
                    device.destroy_sampler(sampler, None);
                    device.destroy_device(None);
                }
                return Err(err);
            }
        };

        let swapchain_loader =
            presentation.then(|| ash::khr::swapchain::Device::new(vk_instance, &device));
        let info = capabilities.info(presentation);

        Ok(Self {
            instance,
            physical_device,
            device,
            swapchain_loader,
            capabilities,
            info,
            memory_types,
            memory_flags,
            families,
            queues,
            graphics_family,
            sampler,
            staging,
            objects: Mutex::new(Objects::default()),
            pools: Mutex::new(HashMap::new()),
            submissions: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
            next_ticket: AtomicU64::new(1),
        })
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    fn handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    fn queue(&self, queue: QueueHandle) -> Result<vk::Queue> {
        self.queues.get(&queue).copied().ok_or_else(|| {
            GpuError::ResourceNotFound(format!("queue {}:{}", queue.family, queue.index))
        })
    }

    fn swapchain_loader(&self) -> Result<&ash::khr::swapchain::Device> {
        self.swapchain_loader
            .as_ref()
            .ok_or_else(|| GpuError::Unsupported("presentation is disabled".to_string()))
    }

    fn command_buffer(
        &self,
        pools: &mut HashMap<u32, vk::CommandPool>,
        family: u32,
    ) -> Result<vk::CommandBuffer> {
        let pool = match pools.get(&family) {
            Some(pool) => *pool,
            None => {
                let info = vk::CommandPoolCreateInfo::default()
                    .queue_family_index(family)
                    .flags(vk::CommandPoolCreateFlags::TRANSIENT);
                let pool = unsafe { self.device.create_command_pool(&info, None)? };
                pools.insert(family, pool);
                pool
            }
        };
        let info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buffers = unsafe { self.device.allocate_command_buffers(&info)? };
        buffers
            .first()
            .copied()
            .ok_or_else(|| GpuError::Other("no command buffer allocated".to_string()))
    }

    fn free_command_buffer(&self, family: u32, cmd: vk::CommandBuffer) {
        if let Some(pool) = self.pools.lock().get(&family) {
            unsafe { self.device.free_command_buffers(*pool, &[cmd]) };
        }
    }

    /// Wait for a submission, deliver its downloads and free its resources.
    fn complete(&self, submission: Submission) -> Result<()> {
        let waited = unsafe {
            self.device
                .wait_for_fences(&[submission.fence], true, u64::MAX)
        };

        let delivered = waited.map_err(GpuError::from).and_then(|()| {
            submission
                .readbacks
                .iter()
                .try_for_each(|(slot, index)| {
                    let bytes = submission.buffers[*index].read()?;
                    slot.fill(bytes);
                    Ok(())
                })
        });

        for buffer in submission.buffers {
            self.staging.free(&self.device, buffer);
        }
        unsafe { self.device.destroy_fence(submission.fence, None) };
        self.free_command_buffer(submission.family, submission.cmd);
        delivered
    }

    fn complete_where(&self, keep: impl Fn(&Submission) -> bool) -> Result<()> {
        let done: Vec<Submission> = {
            let mut submissions = self.submissions.lock();
            let tickets: Vec<u64> = submissions
                .iter()
                .filter(|(_, s)| keep(s))
                .map(|(ticket, _)| *ticket)
                .collect();
            tickets
                .into_iter()
                .filter_map(|ticket| submissions.remove(&ticket))
                .collect()
        };
        let mut result = Ok(());
        for submission in done {
            if let Err(err) = self.complete(submission) {
                result = Err(err);
            }
        }
        result
    }

    fn image_view(&self, image: vk::Image, desc: &ImageDesc) -> Result<vk::ImageView> {
        let view_type = if desc.layers > 1 {
            vk::ImageViewType::TYPE_2D_ARRAY
        } else {
            vk::ImageViewType::TYPE_2D
        };
        let info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(view_type)
            .format(convert::format(desc.format))
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(convert::aspect(desc.format))
                    .level_count(desc.mip_levels)
                    .layer_count(desc.layers),
            );
        Ok(unsafe { self.device.create_image_view(&info, None)? })
    }

    fn destroy_image_record(&self, record: &ImageRecord) {
        unsafe {
            if record.view != vk::ImageView::null() {
                self.device.destroy_image_view(record.view, None);
            }
            self.device.destroy_image(record.image, None);
        }
    }

    fn destroy_swapchain_record(&self, objects: &mut Objects, swapchain: &VulkanSwapchain) {
        for handle in &swapchain.handles {
            objects.images.remove(handle);
        }
        if let (Some(loader), Some(surface_loader)) =
            (self.swapchain_loader.as_ref(), self.instance.surface_loader.as_ref())
        {
            unsafe {
                swapchain.destroy_swapchain(&self.device, loader);
                surface_loader.destroy_surface(swapchain.surface, None);
            }
        }
    }
}

impl Backend for VulkanBackend {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn memory_types(&self) -> &[MemoryType] {
        &self.memory_types
    }

    fn queue_families(&self) -> &[QueueFamily] {
        &self.families
    }

    fn allocate_memory(&self, type_index: u32, size: u64) -> Result<MemoryHandle> {
        if type_index as usize >= self.memory_types.len() {
            return Err(GpuError::AllocationFailed(format!("no memory type {type_index}")));
        }
        let mut flags_info =
            vk::MemoryAllocateFlagsInfo::default().flags(vk::MemoryAllocateFlags::DEVICE_ADDRESS);
        let mut info = vk::MemoryAllocateInfo::default()
            .allocation_size(size)
            .memory_type_index(type_index);
        if self.capabilities.supports_buffer_device_address {
            info = info.push_next(&mut flags_info);
        }

        let memory = unsafe { self.device.allocate_memory(&info, None) }.map_err(|e| {
            GpuError::AllocationFailed(format!("{size} bytes of type {type_index}: {e}"))
        })?;

        let id = self.handle();
        self.objects.lock().memories.insert(
            id,
            MemoryRecord {
                memory,
                size,
                flags: self.memory_flags[type_index as usize],
            },
        );
        Ok(MemoryHandle(id))
    }

    fn free_memory(&self, memory: MemoryHandle) {
        if let Some(record) = self.objects.lock().memories.remove(&memory.0) {
            unsafe { self.device.free_memory(record.memory, None) };
        }
    }

    fn write_memory(&self, memory: MemoryHandle, offset: u64, data: &[u8]) -> Result<()> {
        let objects = self.objects.lock();
        let record = objects.memory(memory)?;
        let mapped = map(&self.device, record, offset, data.len() as u64)?;
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), mapped, data.len());
            let flushed = if record.flags.contains(vk::MemoryPropertyFlags::HOST_COHERENT) {
                Ok(())
            } else {
                let range = vk::MappedMemoryRange::default()
                    .memory(record.memory)
                    .size(vk::WHOLE_SIZE);
                self.device.flush_mapped_memory_ranges(&[range])
            };
            self.device.unmap_memory(record.memory);
            flushed?;
        }
        Ok(())
    }

    fn read_memory(&self, memory: MemoryHandle, offset: u64, data: &mut [u8]) -> Result<()> {
        let objects = self.objects.lock();
        let record = objects.memory(memory)?;
        let mapped = map(&self.device, record, offset, data.len() as u64)?;
        unsafe {
            let invalidated = if record.flags.contains(vk::MemoryPropertyFlags::HOST_COHERENT) {
                Ok(())
            } else {
                let range = vk::MappedMemoryRange::default()
                    .memory(record.memory)
                    .size(vk::WHOLE_SIZE);
                self.device.invalidate_mapped_memory_ranges(&[range])
            };
            if invalidated.is_ok() {
                std::ptr::copy_nonoverlapping(mapped, data.as_mut_ptr(), data.len());
            }
            self.device.unmap_memory(record.memory);
            invalidated?;
        }
        Ok(())
    }

    fn create_buffer(
        &self,
        size: u64,
        usage: ArrayFlags,
    ) -> Result<(BufferHandle, MemoryRequirements)> {
        if size == 0 {
            return Err(GpuError::InvalidArgument("buffers cannot be empty".to_string()));
        }
        if usage.contains(ArrayFlags::DEVICE_ADDRESS)
            && !self.capabilities.supports_buffer_device_address
        {
            return Err(GpuError::InvalidArgument(
                "device addresses are not supported".to_string(),
            ));
        }

        let info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(convert::buffer_usage(usage))
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { self.device.create_buffer(&info, None)? };
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };

        let id = self.handle();
        self.objects.lock().buffers.insert(
            id,
            BufferRecord {
                buffer,
                usage,
                bound: false,
            },
        );
        Ok((BufferHandle(id), requirements_of(requirements)))
    }

    fn bind_buffer_memory(
        &self,
        buffer: BufferHandle,
        memory: MemoryHandle,
        offset: u64,
    ) -> Result<()> {
        let mut objects = self.objects.lock();
        let memory = objects.memory(memory)?.memory;
        let record = objects
            .buffers
            .get_mut(&buffer.0)
            .ok_or_else(|| GpuError::ResourceNotFound(format!("buffer {}", buffer.0)))?;
        if record.bound {
            return Err(GpuError::InvalidState(format!("buffer {} is already bound", buffer.0)));
        }
        unsafe { self.device.bind_buffer_memory(record.buffer, memory, offset)? };
        record.bound = true;
        Ok(())
    }

    fn buffer_address(&self, buffer: BufferHandle) -> u64 {
        if !self.capabilities.supports_buffer_device_address {
            return 0;
        }
        let objects = self.objects.lock();
        match objects.buffers.get(&buffer.0) {
            Some(record) if record.bound && record.usage.contains(ArrayFlags::DEVICE_ADDRESS) => {
                let info = vk::BufferDeviceAddressInfo::default().buffer(record.buffer);
                unsafe { self.device.get_buffer_device_address(&info) }
            }
            _ => 0,
        }
    }

    fn destroy_buffer(&self, buffer: BufferHandle) {
        if let Some(record) = self.objects.lock().buffers.remove(&buffer.0) {
            unsafe { self.device.destroy_buffer(record.buffer, None) };
        }
    }

    fn create_image(&self, desc: &ImageDesc) -> Result<(ImageHandle, MemoryRequirements)> {
        if desc.width == 0 || desc.height == 0 || desc.layers == 0 {
            return Err(GpuError::InvalidArgument(format!(
                "image extent {}x{}x{} is empty",
                desc.width, desc.height, desc.layers
            )));
        }

        let info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(convert::format(desc.format))
            .extent(vk::Extent3D {
                width: desc.width,
                height: desc.height,
                depth: 1,
            })
            .mip_levels(desc.mip_levels.max(1))
            .array_layers(desc.layers)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(convert::image_usage(desc.usage))
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let image = unsafe { self.device.create_image(&info, None)? };
        let requirements = unsafe { self.device.get_image_memory_requirements(image) };

        let id = self.handle();
        self.objects.lock().images.insert(
            id,
            ImageRecord {
                image,
                view: vk::ImageView::null(),
                desc: *desc,
                owned: true,
            },
        );
        Ok((ImageHandle(id), requirements_of(requirements)))
    }

    fn bind_image_memory(
        &self,
        image: ImageHandle,
        memory: MemoryHandle,
        offset: u64,
    ) -> Result<()> {
        let mut objects = self.objects.lock();
        let memory = objects.memory(memory)?.memory;
        let (handle, desc) = {
            let record = objects.image(image)?;
            if record.view != vk::ImageView::null() || !record.owned {
                return Err(GpuError::InvalidState(format!("image {} is already bound", image.0)));
            }
            (record.image, record.desc)
        };

        unsafe { self.device.bind_image_memory(handle, memory, offset)? };
        let view = self.image_view(handle, &desc)?;
        if let Some(record) = objects.images.get_mut(&image.0) {
            record.view = view;
        }
        Ok(())
    }

    fn destroy_image(&self, image: ImageHandle) {
        let mut objects = self.objects.lock();
        if objects.images.get(&image.0).is_some_and(|r| r.owned) {
            if let Some(record) = objects.images.remove(&image.0) {
                self.destroy_image_record(&record);
            }
        }
    }

    fn create_pipeline(&self, desc: &PipelineDesc) -> Result<PipelineHandle> {
        let created = unsafe { VulkanPipeline::new(&self.device, desc)? };
        let id = self.handle();
        self.objects.lock().pipelines.insert(id, created);
        Ok(PipelineHandle(id))
    }

    fn update_bindings(
        &self,
        pipeline: PipelineHandle,
        bindings: &[(u32, Resource)],
    ) -> Result<()> {
        let objects = self.objects.lock();
        let record = objects.pipeline(pipeline)?;
        let set = record.set.ok_or_else(|| {
            GpuError::InvalidArgument(format!("pipeline {} has no bindings", pipeline.0))
        })?;

        for (slot, resource) in bindings {
            let ty = record.slot(*slot).ok_or_else(|| {
                GpuError::InvalidArgument(format!("pipeline {} has no binding {slot}", pipeline.0))
            })?;
            match *resource {
                Resource::Buffer {
                    buffer,
                    offset,
                    range,
                } => {
                    let buffer = objects.buffer(buffer)?.buffer;
                    unsafe {
                        pipeline::write_buffer(&self.device, set, *slot, ty, buffer, offset, range);
                    }
                }
                Resource::Image { image, layout } => {
                    let record = objects.image(image)?;
                    if record.view == vk::ImageView::null() {
                        return Err(GpuError::InvalidState(format!(
                            "image {} has no memory bound",
                            image.0
                        )));
                    }
                    let layout = convert::layout(layout, record.desc.format.is_depth());
                    unsafe {
                        pipeline::write_image(
                            &self.device,
                            set,
                            *slot,
                            ty,
                            record.view,
                            layout,
                            self.sampler,
                        );
                    }
                }
            }
        }
        Ok(())
    }

    fn destroy_pipeline(&self, pipeline: PipelineHandle) {
        if let Some(record) = self.objects.lock().pipelines.remove(&pipeline.0) {
            unsafe { record.destroy(&self.device) };
        }
    }

    fn create_swapchain(
        &self,
        window: &dyn WindowSource,
        desc: &SwapchainDesc,
    ) -> Result<SwapchainInfo> {
        let swapchain_loader = self.swapchain_loader()?;
        let surface_loader = self
            .instance
            .surface_loader
            .as_ref()
            .ok_or_else(|| GpuError::Unsupported("presentation is disabled".to_string()))?;
        if desc.extent.is_empty() {
            return Err(GpuError::SwapchainCreation("surface has zero extent".to_string()));
        }
        let (display, handle) = window.raw_handles().ok_or_else(|| {
            GpuError::SurfaceCreation("window has no native handles".to_string())
        })?;

        let surface = unsafe {
            ash_window::create_surface(
                &self.instance.entry,
                &self.instance.instance,
                display,
                handle,
                None,
            )
        }
        .map_err(|e| GpuError::SurfaceCreation(e.to_string()))?;

        let params = SwapchainParams {
            device: &self.device,
            physical_device: self.physical_device,
            surface_loader,
            swapchain_loader,
            graphics_family: self.graphics_family,
        };
        let mut swapchain = match unsafe {
            VulkanSwapchain::new(&params, surface, desc.extent.width, desc.extent.height, desc.vsync)
        } {
            Ok(swapchain) => swapchain,
            Err(err) => {
                unsafe { surface_loader.destroy_surface(surface, None) };
                return Err(err);
            }
        };

        let image_desc = ImageDesc {
            format: swapchain.format,
            width: swapchain.extent.width,
            height: swapchain.extent.height,
            layers: 1,
            mip_levels: 1,
            usage: ImageUsage::COLOR_ATTACHMENT
                | ImageUsage::TRANSFER_SRC
                | ImageUsage::TRANSFER_DST,
        };
        let mut objects = self.objects.lock();
        for (&image, &view) in swapchain.images.iter().zip(&swapchain.views) {
            let id = self.handle();
            objects.images.insert(
                id,
                ImageRecord {
                    image,
                    view,
                    desc: image_desc,
                    owned: false,
                },
            );
            swapchain.handles.push(id);
        }

        let info = SwapchainInfo {
            handle: SwapchainHandle(self.handle()),
            images: swapchain.handles.iter().copied().map(ImageHandle).collect(),
            format: swapchain.format,
            extent: Extent2D::new(swapchain.extent.width, swapchain.extent.height),
        };
        objects.swapchains.insert(info.handle.0, swapchain);
        Ok(info)
    }

    fn acquire_image(&self, swapchain: SwapchainHandle) -> Result<(u32, bool)> {
        let loader = self.swapchain_loader()?;
        let (native, fence) = {
            let objects = self.objects.lock();
            let record = objects.swapchains.get(&swapchain.0).ok_or_else(|| {
                GpuError::ResourceNotFound(format!("swapchain {}", swapchain.0))
            })?;
            (record.swapchain, record.acquire_fence)
        };
        unsafe { VulkanSwapchain::acquire(&self.device, loader, native, fence) }
    }

    fn present(&self, queue: QueueHandle, swapchain: SwapchainHandle, index: u32) -> Result<bool> {
        let loader = self.swapchain_loader()?;
        let native_queue = self.queue(queue)?;
        let native = self
            .objects
            .lock()
            .swapchains
            .get(&swapchain.0)
            .map(|record| record.swapchain)
            .ok_or_else(|| GpuError::ResourceNotFound(format!("swapchain {}", swapchain.0)))?;

        self.queue_wait_idle(queue)?;
        unsafe { VulkanSwapchain::present(loader, native_queue, native, index) }
    }

    fn destroy_swapchain(&self, swapchain: SwapchainHandle) {
        let mut objects = self.objects.lock();
        if let Some(record) = objects.swapchains.remove(&swapchain.0) {
            self.destroy_swapchain_record(&mut objects, &record);
        }
    }

    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    fn submit(&self, queue: QueueHandle, commands: &[Command]) -> Result<Ticket> {
        let native_queue = self.queue(queue)?;
        let mut pools = self.pools.lock();
        let cmd = self.command_buffer(&mut pools, queue.family)?;
        let pool = pools.get(&queue.family).copied();
        let free_cmd = |device: &ash::Device| {
            if let Some(pool) = pool {
                unsafe { device.free_command_buffers(pool, &[cmd]) };
            }
        };

        let recorded = {
            let objects = self.objects.lock();
            let mut recorder = Recorder::new(&self.device, &objects, &self.staging, cmd);
            let result = unsafe { recorder.record_all(commands) };
            (result, recorder.buffers, recorder.readbacks)
        };
        let (result, buffers, readbacks) = recorded;
        if let Err(err) = result {
            for buffer in buffers {
                self.staging.free(&self.device, buffer);
            }
            free_cmd(&self.device);
            return Err(err);
        }

        let submitted = unsafe {
            self.device
                .create_fence(&vk::FenceCreateInfo::default(), None)
                .and_then(|fence| {
                    let submit = vk::SubmitInfo::default().command_buffers(std::slice::from_ref(&cmd));
                    match self.device.queue_submit(native_queue, &[submit], fence) {
                        Ok(()) => Ok(fence),
                        Err(err) => {
                            self.device.destroy_fence(fence, None);
                            Err(err)
                        }
                    }
                })
        };
        let fence = match submitted {
            Ok(fence) => fence,
            Err(err) => {
                for buffer in buffers {
                    self.staging.free(&self.device, buffer);
                }
                free_cmd(&self.device);
                return Err(err.into());
            }
        };
        drop(pools);

        let ticket = self.next_ticket.fetch_add(1, Ordering::SeqCst);
        self.submissions.lock().insert(
            ticket,
            Submission {
                family: queue.family,
                cmd,
                fence,
                buffers,
                readbacks,
            },
        );
        Ok(Ticket(ticket))
    }

    fn wait(&self, ticket: Ticket) -> Result<()> {
        if ticket.0 == 0 || ticket.0 >= self.next_ticket.load(Ordering::SeqCst) {
            return Err(GpuError::InvalidState(format!(
                "ticket {} was never issued",
                ticket.0
            )));
        }
        let submission = self.submissions.lock().remove(&ticket.0);
        submission.map_or(Ok(()), |s| self.complete(s))
    }

    fn queue_wait_idle(&self, queue: QueueHandle) -> Result<()> {
        let native = self.queue(queue)?;
        unsafe { self.device.queue_wait_idle(native)? };
        self.complete_where(|s| s.family == queue.family)
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
        }
        if let Err(err) = self.complete_where(|_| true) {
            tracing::warn!("Pending submission failed during shutdown: {err}");
        }

        let mut objects = std::mem::take(&mut *self.objects.lock());
        let swapchains: Vec<_> = objects.swapchains.drain().map(|(_, s)| s).collect();
        for swapchain in &swapchains {
            self.destroy_swapchain_record(&mut objects, swapchain);
        }
        unsafe {
            for (_, pipeline) in objects.pipelines.drain() {
                pipeline.destroy(&self.device);
            }
            for (_, record) in objects.images.drain() {
                if record.owned {
                    self.destroy_image_record(&record);
                }
            }
            for (_, record) in objects.buffers.drain() {
                self.device.destroy_buffer(record.buffer, None);
            }
            for (_, record) in objects.memories.drain() {
                self.device.free_memory(record.memory, None);
            }
            for (_, pool) in self.pools.lock().drain() {
                self.device.destroy_command_pool(pool, None);
            }
            self.device.destroy_sampler(self.sampler, None);

            // Staging memory must be released before the device goes away
            self.staging.shutdown();
            self.device.destroy_device(None);
        }
    }
}

/// Map `len` bytes at `offset` of host-visible memory.
fn map(device: &ash::Device, record: &MemoryRecord, offset: u64, len: u64) -> Result<*mut u8> {
    if !record
        .flags
        .contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
    {
        return Err(GpuError::InvalidState("memory is not host visible".to_string()));
    }
    if offset.checked_add(len).map_or(true, |end| end > record.size) {
        return Err(GpuError::OutOfRange {
            offset,
            end: offset.saturating_add(len),
            len: record.size,
        });
    }
    let base = unsafe {
        device.map_memory(record.memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())?
    };
    Ok(unsafe { base.cast::<u8>().add(offset as usize) })
}

fn requirements_of(requirements: vk::MemoryRequirements) -> MemoryRequirements {
    MemoryRequirements {
        size: requirements.size,
        alignment: requirements.alignment,
        type_filter: requirements.memory_type_bits,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requirements_carry_the_type_filter() {
        let native = vk::MemoryRequirements {
            size: 256,
            alignment: 64,
            memory_type_bits: 0b1010,
        };
        let converted = requirements_of(native);
        assert_eq!(converted.size, 256);
        assert_eq!(converted.alignment, 64);
        assert_eq!(converted.type_filter, 0b1010);
    }

    #[test]
    fn missing_objects_are_reported() {
        let objects = Objects::default();
        assert!(matches!(
            objects.buffer(BufferHandle(7)),
            Err(GpuError::ResourceNotFound(_))
        ));
        assert!(matches!(
            objects.memory(MemoryHandle(7)),
            Err(GpuError::UseAfterFree)
        ));
    }
}
