//! Execution backends.
//!
//! The front-end resource types reach a device only through [`Backend`].
//! Native objects are addressed by opaque handles the backend hands out, and
//! recorded work travels as a list of backend-neutral [`Command`]s.

pub mod host;

use crate::error::Result;
use crate::window::WindowSource;
use nyx_core::{
    ArrayFlags, Extent2D, ImageFormat, ImageLayout, ImageUsage, MemoryFlags, PipelineStage,
    QueueCapabilities, ShaderStages,
};
use parking_lot::Mutex;
use std::sync::Arc;

macro_rules! handles {
    ($($(#[$meta:meta])* $name:ident),* $(,)?) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
            pub struct $name(pub u64);
        )*
    };
}

handles! {
    /// A raw device memory allocation.
    MemoryHandle,
    BufferHandle,
    ImageHandle,
    PipelineHandle,
    SwapchainHandle,
    /// Identifies one submission until it has been waited on.
    Ticket,
}

/// One native queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueHandle {
    pub family: u32,
    pub index: u32,
}

/// A memory type as reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryType {
    pub flags: MemoryFlags,
    pub heap: u32,
}

/// Size, alignment and acceptable memory types for a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemoryRequirements {
    pub size: u64,
    pub alignment: u64,
    /// Bit `i` set when memory type `i` may back the resource.
    pub type_filter: u32,
}

/// A queue family and how many queues the backend created in it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamily {
    pub index: u32,
    pub capabilities: QueueCapabilities,
    pub queue_count: u32,
}

/// Families chosen for each chain type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSelection {
    pub graphics: u32,
    pub compute: u32,
    pub transfer: u32,
}

/// Pick graphics, compute and transfer families.
///
/// Dedicated compute and transfer families are preferred; compute falls
/// back to graphics and transfer falls back to compute.
pub fn select_queue_families(families: &[QueueFamily]) -> Option<QueueSelection> {
    let mut graphics = None;
    let mut compute = None;
    let mut transfer = None;

    for family in families.iter().filter(|f| f.queue_count > 0) {
        let caps = family.capabilities;

        if caps.contains(QueueCapabilities::COMPUTE)
            && !caps.contains(QueueCapabilities::GRAPHICS)
            && compute.is_none()
        {
            compute = Some(family.index);
        }

        if caps.contains(QueueCapabilities::TRANSFER)
            && !caps.contains(QueueCapabilities::GRAPHICS)
            && !caps.contains(QueueCapabilities::COMPUTE)
            && transfer.is_none()
        {
            transfer = Some(family.index);
        }

        if caps.contains(QueueCapabilities::GRAPHICS) && graphics.is_none() {
            graphics = Some(family.index);
        }
    }

    let graphics = graphics?;
    let compute = compute.unwrap_or(graphics);
    let transfer = transfer.unwrap_or(compute);

    Some(QueueSelection {
        graphics,
        compute,
        transfer,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    Discrete,
    Integrated,
    Virtual,
    Cpu,
    Other,
}

/// Static description of a device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub name: String,
    pub kind: DeviceKind,
    pub vendor_id: u32,
    pub supports_device_address: bool,
    pub supports_presentation: bool,
}

/// Parameters for a 2D (optionally layered) image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageDesc {
    pub format: ImageFormat,
    pub width: u32,
    pub height: u32,
    pub layers: u32,
    pub mip_levels: u32,
    pub usage: ImageUsage,
}

impl ImageDesc {
    pub const fn row_pitch(&self) -> u64 {
        self.width as u64 * self.format.bytes_per_pixel() as u64
    }

    /// Bytes in the base mip level across all layers.
    pub const fn base_level_size(&self) -> u64 {
        self.row_pitch() * self.height as u64 * self.layers as u64
    }
}

/// Full-width rows of one layer of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageRegion {
    pub layer: u32,
    pub y: u32,
    pub rows: u32,
    pub width: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindingKind {
    UniformBuffer,
    StorageBuffer,
    SampledImage,
    StorageImage,
}

/// A named shader resource slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingDesc {
    pub name: String,
    pub binding: u32,
    pub kind: BindingKind,
    pub stages: ShaderStages,
}

impl BindingDesc {
    pub fn new(name: impl Into<String>, binding: u32, kind: BindingKind, stages: ShaderStages) -> Self {
        Self {
            name: name.into(),
            binding,
            kind,
            stages,
        }
    }
}

/// What a binding slot points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    Buffer {
        buffer: BufferHandle,
        offset: u64,
        range: u64,
    },
    Image {
        image: ImageHandle,
        layout: ImageLayout,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VertexFormat {
    Float,
    Float2,
    Float3,
    Float4,
    UInt,
    Int,
}

impl VertexFormat {
    pub const fn size(self) -> u32 {
        match self {
            Self::Float | Self::UInt | Self::Int => 4,
            Self::Float2 => 8,
            Self::Float3 => 12,
            Self::Float4 => 16,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexAttribute {
    pub location: u32,
    pub format: VertexFormat,
    pub offset: u32,
}

/// Layout of one interleaved vertex buffer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VertexLayout {
    pub stride: u32,
    pub attributes: Vec<VertexAttribute>,
}

/// SPIR-V for one stage.
#[derive(Debug, Clone)]
pub struct ShaderSource {
    pub stage: PipelineStage,
    pub spirv: Arc<[u32]>,
}

impl ShaderSource {
    pub fn new(stage: PipelineStage, spirv: impl Into<Arc<[u32]>>) -> Self {
        Self {
            stage,
            spirv: spirv.into(),
        }
    }

    /// Build from raw SPIR-V bytes. Fails when the length is not a multiple of four.
    pub fn from_bytes(stage: PipelineStage, bytes: &[u8]) -> Option<Self> {
        if bytes.len() % 4 != 0 {
            return None;
        }
        let words: Vec<u32> = bytes
            .chunks_exact(4)
            .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
            .collect();
        Some(Self::new(stage, words))
    }
}

#[derive(Debug, Clone)]
pub enum PipelineKind {
    Graphics {
        vertex_layout: Option<VertexLayout>,
        color_formats: Vec<ImageFormat>,
        depth_format: Option<ImageFormat>,
    },
    Compute,
}

#[derive(Debug, Clone)]
pub struct PipelineDesc {
    pub kind: PipelineKind,
    pub shaders: Vec<ShaderSource>,
    pub bindings: Vec<BindingDesc>,
    pub push_constant_size: u32,
}

impl PipelineDesc {
    pub fn shader(&self, stage: PipelineStage) -> Option<&ShaderSource> {
        self.shaders.iter().find(|s| s.stage == stage)
    }

    pub const fn is_compute(&self) -> bool {
        matches!(self.kind, PipelineKind::Compute)
    }
}

/// Viewport rectangle in framebuffer pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub max_depth: f32,
}

impl Viewport {
    pub const fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
            max_depth: 1.0,
        }
    }

    pub const fn with_max_depth(mut self, max_depth: f32) -> Self {
        self.max_depth = max_depth;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColorTarget {
    pub image: ImageHandle,
    pub format: ImageFormat,
    /// Cleared to this color when rendering begins; loaded otherwise.
    pub clear: Option<[f32; 4]>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DepthTarget {
    pub image: ImageHandle,
    pub clear: Option<f32>,
}

/// Attachments for one rendering scope.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderTargets {
    pub extent: Extent2D,
    pub colors: Vec<ColorTarget>,
    pub depth: Option<DepthTarget>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexType {
    U16,
    U32,
}

/// Host destination for a download, filled when its submission completes.
#[derive(Debug, Clone, Default)]
pub struct ReadbackSlot(Arc<Mutex<Option<Vec<u8>>>>);

impl ReadbackSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fill(&self, bytes: Vec<u8>) {
        *self.0.lock() = Some(bytes);
    }

    pub fn take(&self) -> Option<Vec<u8>> {
        self.0.lock().take()
    }

    pub fn is_ready(&self) -> bool {
        self.0.lock().is_some()
    }
}

/// One recorded operation. Commands in a submission execute in order.
#[derive(Debug, Clone)]
pub enum Command {
    CopyBuffer {
        src: BufferHandle,
        dst: BufferHandle,
        src_offset: u64,
        dst_offset: u64,
        size: u64,
    },
    CopyBufferToImage {
        src: BufferHandle,
        src_offset: u64,
        dst: ImageHandle,
        format: ImageFormat,
        layout: ImageLayout,
        regions: Vec<ImageRegion>,
    },
    CopyImageToBuffer {
        src: ImageHandle,
        format: ImageFormat,
        layout: ImageLayout,
        regions: Vec<ImageRegion>,
        dst: BufferHandle,
        dst_offset: u64,
    },
    /// Row-for-row copy; `src_regions[i]` lands in `dst_regions[i]`.
    CopyImage {
        src: ImageHandle,
        src_layout: ImageLayout,
        src_regions: Vec<ImageRegion>,
        dst: ImageHandle,
        dst_layout: ImageLayout,
        dst_regions: Vec<ImageRegion>,
        format: ImageFormat,
    },
    /// Host bytes into a buffer, staged by the backend.
    Upload {
        dst: BufferHandle,
        dst_offset: u64,
        data: Arc<[u8]>,
    },
    /// Buffer bytes back to the host.
    Download {
        src: BufferHandle,
        src_offset: u64,
        size: u64,
        slot: ReadbackSlot,
    },
    Transition {
        image: ImageHandle,
        format: ImageFormat,
        old: ImageLayout,
        new: ImageLayout,
        layers: u32,
        mip_levels: u32,
    },
    BeginRendering(RenderTargets),
    EndRendering,
    PushConstants {
        pipeline: PipelineHandle,
        offset: u32,
        data: Vec<u8>,
    },
    Draw {
        pipeline: PipelineHandle,
        extent: Extent2D,
        viewports: Vec<Viewport>,
        vertex_buffer: BufferHandle,
        vertex_count: u32,
        first_vertex: u32,
    },
    DrawIndexed {
        pipeline: PipelineHandle,
        extent: Extent2D,
        viewports: Vec<Viewport>,
        vertex_buffer: BufferHandle,
        index_buffer: BufferHandle,
        index_type: IndexType,
        index_count: u32,
        first_index: u32,
    },
    Dispatch {
        pipeline: PipelineHandle,
        groups: [u32; 3],
    },
}

/// Swapchain creation parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainDesc {
    pub extent: Extent2D,
    pub vsync: bool,
}

/// A created swapchain and its presentable images.
#[derive(Debug, Clone)]
pub struct SwapchainInfo {
    pub handle: SwapchainHandle,
    pub images: Vec<ImageHandle>,
    pub format: ImageFormat,
    pub extent: Extent2D,
}

/// A device's execution backend.
///
/// Implementations are shared between threads. Handles passed in must have
/// been created by the same backend; destroy calls on unknown handles are
/// ignored.
pub trait Backend: Send + Sync {
    fn info(&self) -> &DeviceInfo;
    fn memory_types(&self) -> &[MemoryType];
    /// Families with at least one created queue.
    fn queue_families(&self) -> &[QueueFamily];

    fn allocate_memory(&self, type_index: u32, size: u64) -> Result<MemoryHandle>;
    fn free_memory(&self, memory: MemoryHandle);
    /// Map, copy `data` in at `offset`, unmap. Memory must be host visible.
    fn write_memory(&self, memory: MemoryHandle, offset: u64, data: &[u8]) -> Result<()>;
    /// Map, copy out from `offset`, unmap. Memory must be host visible.
    fn read_memory(&self, memory: MemoryHandle, offset: u64, data: &mut [u8]) -> Result<()>;

    fn create_buffer(&self, size: u64, usage: ArrayFlags)
        -> Result<(BufferHandle, MemoryRequirements)>;
    fn bind_buffer_memory(&self, buffer: BufferHandle, memory: MemoryHandle, offset: u64)
        -> Result<()>;
    /// Device address of a bound buffer, or 0 when addresses are unsupported.
    fn buffer_address(&self, buffer: BufferHandle) -> u64;
    fn destroy_buffer(&self, buffer: BufferHandle);

    fn create_image(&self, desc: &ImageDesc) -> Result<(ImageHandle, MemoryRequirements)>;
    fn bind_image_memory(&self, image: ImageHandle, memory: MemoryHandle, offset: u64)
        -> Result<()>;
    fn destroy_image(&self, image: ImageHandle);

    fn create_pipeline(&self, desc: &PipelineDesc) -> Result<PipelineHandle>;
    fn update_bindings(&self, pipeline: PipelineHandle, bindings: &[(u32, Resource)])
        -> Result<()>;
    fn destroy_pipeline(&self, pipeline: PipelineHandle);

    fn create_swapchain(&self, window: &dyn WindowSource, desc: &SwapchainDesc)
        -> Result<SwapchainInfo>;
    /// Index of the next presentable image and whether the swapchain is suboptimal.
    fn acquire_image(&self, swapchain: SwapchainHandle) -> Result<(u32, bool)>;
    /// Present after all prior work on `queue`. Returns true when the
    /// swapchain no longer matches the surface.
    fn present(&self, queue: QueueHandle, swapchain: SwapchainHandle, index: u32) -> Result<bool>;
    /// Callers synchronize the device first.
    fn destroy_swapchain(&self, swapchain: SwapchainHandle);

    /// Hand commands to a queue. The caller serializes calls per queue.
    fn submit(&self, queue: QueueHandle, commands: &[Command]) -> Result<Ticket>;
    /// Block until a submission completes and fill its readback slots.
    fn wait(&self, ticket: Ticket) -> Result<()>;
    /// Block until `queue` is idle. The caller serializes this with
    /// submissions to the same queue.
    fn queue_wait_idle(&self, queue: QueueHandle) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(index: u32, caps: QueueCapabilities) -> QueueFamily {
        QueueFamily {
            index,
            capabilities: caps,
            queue_count: 1,
        }
    }

    #[test]
    fn prefers_dedicated_families() {
        let families = [
            family(
                0,
                QueueCapabilities::GRAPHICS | QueueCapabilities::COMPUTE | QueueCapabilities::TRANSFER,
            ),
            family(1, QueueCapabilities::COMPUTE | QueueCapabilities::TRANSFER),
            family(2, QueueCapabilities::TRANSFER),
        ];
        let selection = select_queue_families(&families).unwrap();
        assert_eq!(selection.graphics, 0);
        assert_eq!(selection.compute, 1);
        assert_eq!(selection.transfer, 2);
    }

    #[test]
    fn falls_back_to_graphics_family() {
        let families = [family(
            0,
            QueueCapabilities::GRAPHICS | QueueCapabilities::COMPUTE | QueueCapabilities::TRANSFER,
        )];
        let selection = select_queue_families(&families).unwrap();
        assert_eq!(selection.compute, 0);
        assert_eq!(selection.transfer, 0);
    }

    #[test]
    fn no_graphics_family_means_no_selection() {
        let families = [family(0, QueueCapabilities::COMPUTE)];
        assert!(select_queue_families(&families).is_none());
    }

    #[test]
    fn shader_bytes_must_be_whole_words() {
        assert!(ShaderSource::from_bytes(PipelineStage::Compute, &[0, 1, 2]).is_none());
        let shader = ShaderSource::from_bytes(PipelineStage::Compute, &[0x03, 0x02, 0x23, 0x07])
            .unwrap();
        assert_eq!(&*shader.spirv, &[0x0723_0203]);
    }
}
