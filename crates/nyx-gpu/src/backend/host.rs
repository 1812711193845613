//! Software backend.
//!
//! Runs every command on the calling thread at submission time. Device
//! memory is a byte vector per allocation and images are stored linearly:
//! base mip level first, layer-major, full rows. Rendering scopes clear
//! their attachments; draws and dispatches are validated and counted but
//! not rasterized.
//!
//! Used for headless runs and for testing the front end without a GPU.

use super::{
    Backend, BufferHandle, Command, DeviceInfo, DeviceKind, ImageDesc, ImageHandle, ImageRegion,
    MemoryHandle, MemoryRequirements, MemoryType, PipelineDesc, PipelineHandle, PipelineKind,
    QueueFamily, QueueHandle, ReadbackSlot, RenderTargets, Resource, SwapchainDesc,
    SwapchainHandle, SwapchainInfo, Ticket,
};
use crate::error::{GpuError, Result};
use crate::window::WindowSource;
use nyx_core::{
    ArrayFlags, ImageFormat, ImageLayout, ImageUsage, MemoryFlags, PipelineStage, QueueCapabilities,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

const BUFFER_ALIGNMENT: u64 = 16;
const IMAGE_ALIGNMENT: u64 = 16;
const SWAPCHAIN_IMAGE_COUNT: u32 = 3;

/// Shape of an emulated device.
#[derive(Debug, Clone)]
pub struct HostConfig {
    pub name: String,
    pub memory_types: Vec<MemoryType>,
    pub queue_families: Vec<QueueFamily>,
    /// Memory types buffers may live in, before masking to the type count.
    pub buffer_type_filter: u32,
    /// Memory types images may live in, before masking to the type count.
    pub image_type_filter: u32,
    /// Time spent inside every submission and idle wait, outside the
    /// state lock.
    pub submit_latency: Option<Duration>,
    pub supports_device_address: bool,
}

impl Default for HostConfig {
    /// A discrete-GPU-like device: device-local, host-coherent, cached and
    /// resizable-BAR memory types; one general, one compute and one
    /// transfer queue family.
    fn default() -> Self {
        let general = QueueCapabilities::GRAPHICS
            | QueueCapabilities::COMPUTE
            | QueueCapabilities::TRANSFER
            | QueueCapabilities::PRESENT;

        Self {
            name: "nyx host device".to_string(),
            memory_types: vec![
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
                MemoryType {
                    flags: MemoryFlags::DEVICE_LOCAL | MemoryFlags::HOST_SHARED,
                    heap: 0,
                },
            ],
            queue_families: vec![
                QueueFamily {
                    index: 0,
                    capabilities: general,
                    queue_count: 1,
                },
                QueueFamily {
                    index: 1,
                    capabilities: QueueCapabilities::COMPUTE | QueueCapabilities::TRANSFER,
                    queue_count: 1,
                },
                QueueFamily {
                    index: 2,
                    capabilities: QueueCapabilities::TRANSFER,
                    queue_count: 1,
                },
            ],
            buffer_type_filter: u32::MAX,
            image_type_filter: u32::MAX,
            submit_latency: None,
            supports_device_address: true,
        }
    }
}

impl HostConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_memory_types(mut self, types: Vec<MemoryType>) -> Self {
        self.memory_types = types;
        self
    }

    pub fn with_queue_families(mut self, families: Vec<QueueFamily>) -> Self {
        self.queue_families = families;
        self
    }

    pub fn with_buffer_type_filter(mut self, filter: u32) -> Self {
        self.buffer_type_filter = filter;
        self
    }

    pub fn with_submit_latency(mut self, latency: Duration) -> Self {
        self.submit_latency = Some(latency);
        self
    }

    pub fn with_device_address(mut self, supported: bool) -> Self {
        self.supports_device_address = supported;
        self
    }
}

/// Counters collected by a [`HostBackend`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostStats {
    pub submissions: u64,
    pub commands: u64,
    pub copies: u64,
    pub transitions: u64,
    pub draws: u64,
    pub dispatches: u64,
    pub presents: u64,
    /// Allocations currently alive.
    pub live_allocations: u64,
    /// Bytes currently allocated.
    pub live_bytes: u64,
    /// Highest number of threads seen inside `submit` or
    /// `queue_wait_idle` on one queue family at once.
    pub max_concurrent_submits: u64,
}

#[derive(Debug, Clone, Copy)]
struct Binding {
    memory: u64,
    offset: u64,
}

struct HostMemory {
    type_index: u32,
    flags: MemoryFlags,
    bytes: Vec<u8>,
}

struct HostBuffer {
    size: u64,
    binding: Option<Binding>,
}

enum ImageStorage {
    Unbound,
    Bound(Binding),
    Owned(Vec<u8>),
}

struct HostImage {
    desc: ImageDesc,
    storage: ImageStorage,
}

struct HostPipeline {
    desc: PipelineDesc,
    bindings: HashMap<u32, Resource>,
}

struct HostSwapchain {
    images: Vec<u64>,
    next: u32,
}

#[derive(Default)]
struct HostState {
    memories: HashMap<u64, HostMemory>,
    buffers: HashMap<u64, HostBuffer>,
    images: HashMap<u64, HostImage>,
    pipelines: HashMap<u64, HostPipeline>,
    swapchains: HashMap<u64, HostSwapchain>,
    /// Downloads captured at submission, delivered on wait.
    pending: HashMap<u64, Vec<(ReadbackSlot, Vec<u8>)>>,
    stats: HostStats,
}

/// Software implementation of [`Backend`].
pub struct HostBackend {
    info: DeviceInfo,
    config: HostConfig,
    state: Mutex<HostState>,
    next_handle: AtomicU64,
    next_ticket: AtomicU64,
    /// Threads currently inside each queue family.
    in_queue: Mutex<HashMap<u32, u64>>,
    max_in_submit: AtomicU64,
}

impl HostBackend {
    pub fn new(config: HostConfig) -> Self {
        let info = DeviceInfo {
            name: config.name.clone(),
            kind: DeviceKind::Cpu,
            vendor_id: 0,
            supports_device_address: config.supports_device_address,
            supports_presentation: config
                .queue_families
                .iter()
                .any(|f| f.capabilities.contains(QueueCapabilities::PRESENT)),
        };

        Self {
            info,
            config,
            state: Mutex::new(HostState::default()),
            next_handle: AtomicU64::new(1),
            next_ticket: AtomicU64::new(1),
            in_queue: Mutex::new(HashMap::new()),
            max_in_submit: AtomicU64::new(0),
        }
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> HostStats {
        let mut stats = self.state.lock().stats;
        stats.max_concurrent_submits = self.max_in_submit.load(Ordering::SeqCst);
        stats
    }

    fn enter_queue(&self, queue: QueueHandle) {
        let inside = {
            let mut in_queue = self.in_queue.lock();
            let count = in_queue.entry(queue.family).or_default();
            *count += 1;
            *count
        };
        self.max_in_submit.fetch_max(inside, Ordering::SeqCst);
        if let Some(latency) = self.config.submit_latency {
            std::thread::sleep(latency);
        }
    }

    fn leave_queue(&self, queue: QueueHandle) {
        if let Some(count) = self.in_queue.lock().get_mut(&queue.family) {
            *count -= 1;
        }
    }

    fn handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    fn type_mask(&self) -> u32 {
        match self.config.memory_types.len() {
            n if n >= 32 => u32::MAX,
            n => (1u32 << n) - 1,
        }
    }
}

impl Default for HostBackend {
    fn default() -> Self {
        Self::new(HostConfig::default())
    }
}

fn check_range(offset: u64, len: u64, size: u64) -> Result<()> {
    let end = offset.checked_add(len).ok_or(GpuError::OutOfRange {
        offset,
        end: u64::MAX,
        len: size,
    })?;
    if end > size {
        return Err(GpuError::OutOfRange {
            offset,
            end,
            len: size,
        });
    }
    Ok(())
}

fn image_storage_size(desc: &ImageDesc) -> u64 {
    let bpp = u64::from(desc.format.bytes_per_pixel());
    (0..desc.mip_levels.max(1))
        .map(|level| {
            let w = u64::from((desc.width >> level).max(1));
            let h = u64::from((desc.height >> level).max(1));
            w * h * u64::from(desc.layers) * bpp
        })
        .sum()
}

/// Byte spans of every row a region covers, relative to the image start.
fn region_rows(desc: &ImageDesc, region: &ImageRegion) -> Result<Vec<(u64, u64)>> {
    if region.width == 0
        || region.width > desc.width
        || region.layer >= desc.layers
        || region.y + region.rows > desc.height
    {
        return Err(GpuError::InvalidArgument(format!(
            "region {region:?} outside {}x{}x{} image",
            desc.width, desc.height, desc.layers
        )));
    }
    let pitch = desc.row_pitch();
    let len = u64::from(region.width) * u64::from(desc.format.bytes_per_pixel());
    let first = u64::from(region.layer) * u64::from(desc.height) + u64::from(region.y);
    Ok((0..u64::from(region.rows))
        .map(|row| ((first + row) * pitch, len))
        .collect())
}

fn expect_layout(layout: ImageLayout, allowed: ImageLayout, what: &str) -> Result<()> {
    if layout == allowed || layout == ImageLayout::General {
        Ok(())
    } else {
        Err(GpuError::InvalidState(format!(
            "{what} image is in layout {layout:?}, expected {allowed:?} or General"
        )))
    }
}

impl HostState {
    fn memory(&self, id: u64) -> Result<&HostMemory> {
        self.memories
            .get(&id)
            .ok_or_else(|| GpuError::ResourceNotFound(format!("memory {id}")))
    }

    fn buffer_span(&self, buffer: BufferHandle, offset: u64, len: u64) -> Result<Binding> {
        let record = self
            .buffers
            .get(&buffer.0)
            .ok_or_else(|| GpuError::ResourceNotFound(format!("buffer {}", buffer.0)))?;
        let binding = record
            .binding
            .ok_or_else(|| GpuError::InvalidState(format!("buffer {} is not bound", buffer.0)))?;
        check_range(offset, len, record.size)?;
        Ok(Binding {
            memory: binding.memory,
            offset: binding.offset + offset,
        })
    }

    fn read(&self, at: Binding, len: u64) -> Result<Vec<u8>> {
        let memory = self.memory(at.memory)?;
        check_range(at.offset, len, memory.bytes.len() as u64)?;
        let start = at.offset as usize;
        Ok(memory.bytes[start..start + len as usize].to_vec())
    }

    fn write(&mut self, at: Binding, data: &[u8]) -> Result<()> {
        let memory = self
            .memories
            .get_mut(&at.memory)
            .ok_or_else(|| GpuError::ResourceNotFound(format!("memory {}", at.memory)))?;
        check_range(at.offset, data.len() as u64, memory.bytes.len() as u64)?;
        let start = at.offset as usize;
        memory.bytes[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn image(&self, image: ImageHandle) -> Result<&HostImage> {
        self.images
            .get(&image.0)
            .ok_or_else(|| GpuError::ResourceNotFound(format!("image {}", image.0)))
    }

    fn read_image(&self, image: ImageHandle, start: u64, len: u64) -> Result<Vec<u8>> {
        let record = self.image(image)?;
        match &record.storage {
            ImageStorage::Unbound => Err(GpuError::InvalidState(format!(
                "image {} is not bound",
                image.0
            ))),
            ImageStorage::Bound(binding) => self.read(
                Binding {
                    memory: binding.memory,
                    offset: binding.offset + start,
                },
                len,
            ),
            ImageStorage::Owned(bytes) => {
                check_range(start, len, bytes.len() as u64)?;
                Ok(bytes[start as usize..(start + len) as usize].to_vec())
            }
        }
    }

    fn write_image(&mut self, image: ImageHandle, start: u64, data: &[u8]) -> Result<()> {
        let record = self
            .images
            .get_mut(&image.0)
            .ok_or_else(|| GpuError::ResourceNotFound(format!("image {}", image.0)))?;
        let binding = match &mut record.storage {
            ImageStorage::Unbound => {
                return Err(GpuError::InvalidState(format!(
                    "image {} is not bound",
                    image.0
                )))
            }
            ImageStorage::Owned(bytes) => {
                check_range(start, data.len() as u64, bytes.len() as u64)?;
                bytes[start as usize..start as usize + data.len()].copy_from_slice(data);
                return Ok(());
            }
            ImageStorage::Bound(binding) => *binding,
        };
        self.write(
            Binding {
                memory: binding.memory,
                offset: binding.offset + start,
            },
            data,
        )
    }

    fn pipeline(&self, pipeline: PipelineHandle) -> Result<&HostPipeline> {
        self.pipelines
            .get(&pipeline.0)
            .ok_or_else(|| GpuError::ResourceNotFound(format!("pipeline {}", pipeline.0)))
    }

    fn begin_rendering(&mut self, targets: &RenderTargets) -> Result<()> {
        for color in &targets.colors {
            let desc = self.image(color.image)?.desc;
            if let Some(clear) = color.clear {
                let pixel = desc.format.encode_color(clear);
                let fill = pixel.repeat((desc.base_level_size() / pixel.len() as u64) as usize);
                self.write_image(color.image, 0, &fill)?;
            }
        }
        if let Some(depth) = &targets.depth {
            let desc = self.image(depth.image)?.desc;
            if let Some(clear) = depth.clear {
                let pixel = ImageFormat::D32F.encode_color([clear, 0.0, 0.0, 0.0]);
                let fill = pixel.repeat((desc.base_level_size() / 4) as usize);
                self.write_image(depth.image, 0, &fill)?;
            }
        }
        Ok(())
    }

    fn check_bound(&self, pipeline: PipelineHandle) -> Result<&HostPipeline> {
        let record = self.pipeline(pipeline)?;
        if let Some(missing) = record
            .desc
            .bindings
            .iter()
            .find(|b| !record.bindings.contains_key(&b.binding))
        {
            return Err(GpuError::InvalidState(format!(
                "binding '{}' of pipeline {} is not bound",
                missing.name, pipeline.0
            )));
        }
        Ok(record)
    }

    fn check_graphics(&self, pipeline: PipelineHandle, rendering: bool) -> Result<()> {
        if !rendering {
            return Err(GpuError::InvalidState(
                "draw recorded outside a rendering scope".to_string(),
            ));
        }
        match self.check_bound(pipeline)?.desc.kind {
            PipelineKind::Graphics { .. } => Ok(()),
            PipelineKind::Compute => Err(GpuError::InvalidState(format!(
                "pipeline {} is not a graphics pipeline",
                pipeline.0
            ))),
        }
    }

    fn execute(
        &mut self,
        command: &Command,
        rendering: &mut bool,
        readbacks: &mut Vec<(ReadbackSlot, Vec<u8>)>,
    ) -> Result<()> {
        self.stats.commands += 1;
        match command {
            Command::CopyBuffer {
                src,
                dst,
                src_offset,
                dst_offset,
                size,
            } => {
                let from = self.buffer_span(*src, *src_offset, *size)?;
                let to = self.buffer_span(*dst, *dst_offset, *size)?;
                let bytes = self.read(from, *size)?;
                self.write(to, &bytes)?;
                self.stats.copies += 1;
            }
            Command::CopyBufferToImage {
                src,
                src_offset,
                dst,
                layout,
                regions,
                ..
            } => {
                expect_layout(*layout, ImageLayout::TransferDst, "destination")?;
                let desc = self.image(*dst)?.desc;
                let mut cursor = *src_offset;
                for region in regions {
                    for (start, len) in region_rows(&desc, region)? {
                        let from = self.buffer_span(*src, cursor, len)?;
                        let bytes = self.read(from, len)?;
                        self.write_image(*dst, start, &bytes)?;
                        cursor += len;
                    }
                }
                self.stats.copies += 1;
            }
            Command::CopyImageToBuffer {
                src,
                layout,
                regions,
                dst,
                dst_offset,
                ..
            } => {
                expect_layout(*layout, ImageLayout::TransferSrc, "source")?;
                let desc = self.image(*src)?.desc;
                let mut cursor = *dst_offset;
                for region in regions {
                    for (start, len) in region_rows(&desc, region)? {
                        let bytes = self.read_image(*src, start, len)?;
                        let to = self.buffer_span(*dst, cursor, len)?;
                        self.write(to, &bytes)?;
                        cursor += len;
                    }
                }
                self.stats.copies += 1;
            }
            Command::CopyImage {
                src,
                src_layout,
                src_regions,
                dst,
                dst_layout,
                dst_regions,
                ..
            } => {
                expect_layout(*src_layout, ImageLayout::TransferSrc, "source")?;
                expect_layout(*dst_layout, ImageLayout::TransferDst, "destination")?;
                let src_desc = self.image(*src)?.desc;
                let dst_desc = self.image(*dst)?.desc;
                let mut src_rows = Vec::new();
                for region in src_regions {
                    src_rows.extend(region_rows(&src_desc, region)?);
                }
                let mut dst_rows = Vec::new();
                for region in dst_regions {
                    dst_rows.extend(region_rows(&dst_desc, region)?);
                }
                if src_rows.len() != dst_rows.len()
                    || src_rows.iter().zip(&dst_rows).any(|(a, b)| a.1 != b.1)
                {
                    return Err(GpuError::InvalidArgument(
                        "image copy regions differ in size".to_string(),
                    ));
                }
                for ((src_start, len), (dst_start, _)) in src_rows.into_iter().zip(dst_rows) {
                    let bytes = self.read_image(*src, src_start, len)?;
                    self.write_image(*dst, dst_start, &bytes)?;
                }
                self.stats.copies += 1;
            }
            Command::Upload {
                dst,
                dst_offset,
                data,
            } => {
                let to = self.buffer_span(*dst, *dst_offset, data.len() as u64)?;
                self.write(to, data)?;
                self.stats.copies += 1;
            }
            Command::Download {
                src,
                src_offset,
                size,
                slot,
            } => {
                let from = self.buffer_span(*src, *src_offset, *size)?;
                readbacks.push((slot.clone(), self.read(from, *size)?));
                self.stats.copies += 1;
            }
            Command::Transition { image, .. } => {
                self.image(*image)?;
                self.stats.transitions += 1;
            }
            Command::BeginRendering(targets) => {
                if *rendering {
                    return Err(GpuError::InvalidState(
                        "rendering scopes cannot nest".to_string(),
                    ));
                }
                self.begin_rendering(targets)?;
                *rendering = true;
            }
            Command::EndRendering => {
                if !*rendering {
                    return Err(GpuError::InvalidState(
                        "no rendering scope to end".to_string(),
                    ));
                }
                *rendering = false;
            }
            Command::PushConstants {
                pipeline,
                offset,
                data,
            } => {
                let size = self.pipeline(*pipeline)?.desc.push_constant_size;
                check_range(u64::from(*offset), data.len() as u64, u64::from(size))?;
            }
            Command::Draw {
                pipeline,
                vertex_buffer,
                ..
            } => {
                self.check_graphics(*pipeline, *rendering)?;
                self.buffer_span(*vertex_buffer, 0, 0)?;
                self.stats.draws += 1;
            }
            Command::DrawIndexed {
                pipeline,
                vertex_buffer,
                index_buffer,
                ..
            } => {
                self.check_graphics(*pipeline, *rendering)?;
                self.buffer_span(*vertex_buffer, 0, 0)?;
                self.buffer_span(*index_buffer, 0, 0)?;
                self.stats.draws += 1;
            }
            Command::Dispatch { pipeline, .. } => {
                if !self.check_bound(*pipeline)?.desc.is_compute() {
                    return Err(GpuError::InvalidState(format!(
                        "pipeline {} is not a compute pipeline",
                        pipeline.0
                    )));
                }
                self.stats.dispatches += 1;
            }
        }
        Ok(())
    }
}

impl Backend for HostBackend {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn memory_types(&self) -> &[MemoryType] {
        &self.config.memory_types
    }

    fn queue_families(&self) -> &[QueueFamily] {
        &self.config.queue_families
    }

    fn allocate_memory(&self, type_index: u32, size: u64) -> Result<MemoryHandle> {
        let memory_type = self
            .config
            .memory_types
            .get(type_index as usize)
            .ok_or_else(|| GpuError::AllocationFailed(format!("no memory type {type_index}")))?;
        if size == 0 {
            return Err(GpuError::InvalidArgument(
                "cannot allocate zero bytes".to_string(),
            ));
        }

        let id = self.handle();
        let mut state = self.state.lock();
        state.memories.insert(
            id,
            HostMemory {
                type_index,
                flags: memory_type.flags,
                bytes: vec![0; size as usize],
            },
        );
        state.stats.live_allocations += 1;
        state.stats.live_bytes += size;
        Ok(MemoryHandle(id))
    }

    fn free_memory(&self, memory: MemoryHandle) {
        let mut state = self.state.lock();
        if let Some(freed) = state.memories.remove(&memory.0) {
            state.stats.live_allocations -= 1;
            state.stats.live_bytes -= freed.bytes.len() as u64;
        }
    }

    fn write_memory(&self, memory: MemoryHandle, offset: u64, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        if !state.memory(memory.0)?.flags.is_host_visible() {
            return Err(GpuError::InvalidState(format!(
                "memory {} is not host visible",
                memory.0
            )));
        }
        state.write(
            Binding {
                memory: memory.0,
                offset,
            },
            data,
        )
    }

    fn read_memory(&self, memory: MemoryHandle, offset: u64, data: &mut [u8]) -> Result<()> {
        let state = self.state.lock();
        if !state.memory(memory.0)?.flags.is_host_visible() {
            return Err(GpuError::InvalidState(format!(
                "memory {} is not host visible",
                memory.0
            )));
        }
        let bytes = state.read(
            Binding {
                memory: memory.0,
                offset,
            },
            data.len() as u64,
        )?;
        data.copy_from_slice(&bytes);
        Ok(())
    }

    fn create_buffer(
        &self,
        size: u64,
        usage: ArrayFlags,
    ) -> Result<(BufferHandle, MemoryRequirements)> {
        if size == 0 {
            return Err(GpuError::InvalidArgument(
                "buffers cannot be empty".to_string(),
            ));
        }
        if usage.contains(ArrayFlags::DEVICE_ADDRESS) && !self.config.supports_device_address {
            return Err(GpuError::InvalidArgument(
                "device addresses are not supported".to_string(),
            ));
        }

        let id = self.handle();
        self.state
            .lock()
            .buffers
            .insert(id, HostBuffer { size, binding: None });

        Ok((
            BufferHandle(id),
            MemoryRequirements {
                size: size.next_multiple_of(BUFFER_ALIGNMENT),
                alignment: BUFFER_ALIGNMENT,
                type_filter: self.config.buffer_type_filter & self.type_mask(),
            },
        ))
    }

    fn bind_buffer_memory(
        &self,
        buffer: BufferHandle,
        memory: MemoryHandle,
        offset: u64,
    ) -> Result<()> {
        let filter = self.config.buffer_type_filter & self.type_mask();
        let mut state = self.state.lock();
        let (type_index, capacity) = {
            let memory = state.memory(memory.0)?;
            (memory.type_index, memory.bytes.len() as u64)
        };
        if filter & (1 << type_index) == 0 {
            return Err(GpuError::InvalidArgument(format!(
                "memory type {type_index} cannot back buffers"
            )));
        }
        if offset % BUFFER_ALIGNMENT != 0 {
            return Err(GpuError::InvalidArgument(format!(
                "buffer offset {offset} is not {BUFFER_ALIGNMENT}-byte aligned"
            )));
        }

        let record = state
            .buffers
            .get_mut(&buffer.0)
            .ok_or_else(|| GpuError::ResourceNotFound(format!("buffer {}", buffer.0)))?;
        if record.binding.is_some() {
            return Err(GpuError::InvalidState(format!(
                "buffer {} is already bound",
                buffer.0
            )));
        }
        check_range(offset, record.size, capacity)?;
        record.binding = Some(Binding {
            memory: memory.0,
            offset,
        });
        Ok(())
    }

    fn buffer_address(&self, buffer: BufferHandle) -> u64 {
        if !self.config.supports_device_address {
            return 0;
        }
        self.state
            .lock()
            .buffers
            .get(&buffer.0)
            .and_then(|b| b.binding)
            .map_or(0, |b| (b.memory << 32) + b.offset)
    }

    fn destroy_buffer(&self, buffer: BufferHandle) {
        self.state.lock().buffers.remove(&buffer.0);
    }

    fn create_image(&self, desc: &ImageDesc) -> Result<(ImageHandle, MemoryRequirements)> {
        if desc.width == 0 || desc.height == 0 || desc.layers == 0 {
            return Err(GpuError::InvalidArgument(format!(
                "image extent {}x{}x{} is empty",
                desc.width, desc.height, desc.layers
            )));
        }

        let id = self.handle();
        self.state.lock().images.insert(
            id,
            HostImage {
                desc: *desc,
                storage: ImageStorage::Unbound,
            },
        );

        Ok((
            ImageHandle(id),
            MemoryRequirements {
                size: image_storage_size(desc).next_multiple_of(IMAGE_ALIGNMENT),
                alignment: IMAGE_ALIGNMENT,
                type_filter: self.config.image_type_filter & self.type_mask(),
            },
        ))
    }

    fn bind_image_memory(
        &self,
        image: ImageHandle,
        memory: MemoryHandle,
        offset: u64,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let capacity = state.memory(memory.0)?.bytes.len() as u64;
        let record = state
            .images
            .get_mut(&image.0)
            .ok_or_else(|| GpuError::ResourceNotFound(format!("image {}", image.0)))?;
        if !matches!(record.storage, ImageStorage::Unbound) {
            return Err(GpuError::InvalidState(format!(
                "image {} is already bound",
                image.0
            )));
        }
        check_range(offset, image_storage_size(&record.desc), capacity)?;
        record.storage = ImageStorage::Bound(Binding {
            memory: memory.0,
            offset,
        });
        Ok(())
    }

    fn destroy_image(&self, image: ImageHandle) {
        self.state.lock().images.remove(&image.0);
    }

    fn create_pipeline(&self, desc: &PipelineDesc) -> Result<PipelineHandle> {
        let missing = match desc.kind {
            PipelineKind::Compute => desc
                .shader(PipelineStage::Compute)
                .is_none()
                .then_some("compute"),
            PipelineKind::Graphics { .. } => desc
                .shader(PipelineStage::Vertex)
                .is_none()
                .then_some("vertex"),
        };
        if let Some(stage) = missing {
            return Err(GpuError::PipelineCreation(format!(
                "missing {stage} shader"
            )));
        }

        let id = self.handle();
        self.state.lock().pipelines.insert(
            id,
            HostPipeline {
                desc: desc.clone(),
                bindings: HashMap::new(),
            },
        );
        Ok(PipelineHandle(id))
    }

    fn update_bindings(
        &self,
        pipeline: PipelineHandle,
        bindings: &[(u32, Resource)],
    ) -> Result<()> {
        let mut state = self.state.lock();
        let record = state
            .pipelines
            .get_mut(&pipeline.0)
            .ok_or_else(|| GpuError::ResourceNotFound(format!("pipeline {}", pipeline.0)))?;
        for (slot, resource) in bindings {
            if !record.desc.bindings.iter().any(|b| b.binding == *slot) {
                return Err(GpuError::InvalidArgument(format!(
                    "pipeline {} has no binding {slot}",
                    pipeline.0
                )));
            }
            record.bindings.insert(*slot, *resource);
        }
        Ok(())
    }

    fn destroy_pipeline(&self, pipeline: PipelineHandle) {
        self.state.lock().pipelines.remove(&pipeline.0);
    }

    fn create_swapchain(
        &self,
        _window: &dyn WindowSource,
        desc: &SwapchainDesc,
    ) -> Result<SwapchainInfo> {
        if desc.extent.is_empty() {
            return Err(GpuError::SwapchainCreation(
                "surface has zero extent".to_string(),
            ));
        }

        let image_desc = ImageDesc {
            format: ImageFormat::Bgra8,
            width: desc.extent.width,
            height: desc.extent.height,
            layers: 1,
            mip_levels: 1,
            usage: ImageUsage::COLOR_ATTACHMENT | ImageUsage::TRANSFER_SRC | ImageUsage::TRANSFER_DST,
        };
        let id = self.handle();
        let images: Vec<u64> = (0..SWAPCHAIN_IMAGE_COUNT).map(|_| self.handle()).collect();

        let mut state = self.state.lock();
        for &image in &images {
            state.images.insert(
                image,
                HostImage {
                    desc: image_desc,
                    storage: ImageStorage::Owned(vec![0; image_desc.base_level_size() as usize]),
                },
            );
        }
        state.swapchains.insert(
            id,
            HostSwapchain {
                images: images.clone(),
                next: 0,
            },
        );

        Ok(SwapchainInfo {
            handle: SwapchainHandle(id),
            images: images.into_iter().map(ImageHandle).collect(),
            format: ImageFormat::Bgra8,
            extent: desc.extent,
        })
    }

    fn acquire_image(&self, swapchain: SwapchainHandle) -> Result<(u32, bool)> {
        let mut state = self.state.lock();
        let record = state
            .swapchains
            .get_mut(&swapchain.0)
            .ok_or_else(|| GpuError::ResourceNotFound(format!("swapchain {}", swapchain.0)))?;
        let index = record.next;
        record.next = (record.next + 1) % record.images.len() as u32;
        Ok((index, false))
    }

    fn present(&self, _queue: QueueHandle, swapchain: SwapchainHandle, index: u32) -> Result<bool> {
        let mut state = self.state.lock();
        let count = state
            .swapchains
            .get(&swapchain.0)
            .ok_or_else(|| GpuError::ResourceNotFound(format!("swapchain {}", swapchain.0)))?
            .images
            .len();
        if index as usize >= count {
            return Err(GpuError::InvalidArgument(format!(
                "swapchain image {index} out of {count}"
            )));
        }
        state.stats.presents += 1;
        Ok(false)
    }

    fn destroy_swapchain(&self, swapchain: SwapchainHandle) {
        let mut state = self.state.lock();
        if let Some(record) = state.swapchains.remove(&swapchain.0) {
            for image in record.images {
                state.images.remove(&image);
            }
        }
    }

    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    fn submit(&self, queue: QueueHandle, commands: &[Command]) -> Result<Ticket> {
        self.enter_queue(queue);

        let result = {
            let mut state = self.state.lock();
            state.stats.submissions += 1;

            let mut rendering = false;
            let mut readbacks = Vec::new();
            let executed = commands
                .iter()
                .try_for_each(|command| state.execute(command, &mut rendering, &mut readbacks));

            executed.map(|()| {
                let ticket = self.next_ticket.fetch_add(1, Ordering::SeqCst);
                state.pending.insert(ticket, readbacks);
                Ticket(ticket)
            })
        };

        self.leave_queue(queue);
        result
    }

    fn wait(&self, ticket: Ticket) -> Result<()> {
        if ticket.0 == 0 || ticket.0 >= self.next_ticket.load(Ordering::SeqCst) {
            return Err(GpuError::InvalidState(format!(
                "ticket {} was never issued",
                ticket.0
            )));
        }
        let readbacks = self.state.lock().pending.remove(&ticket.0);
        for (slot, bytes) in readbacks.into_iter().flatten() {
            slot.fill(bytes);
        }
        Ok(())
    }

    fn queue_wait_idle(&self, queue: QueueHandle) -> Result<()> {
        self.enter_queue(queue);
        let pending: Vec<_> = self.state.lock().pending.drain().collect();
        for (_, readbacks) in pending {
            for (slot, bytes) in readbacks {
                slot.fill(bytes);
            }
        }
        self.leave_queue(queue);
        Ok(())
    }
}
