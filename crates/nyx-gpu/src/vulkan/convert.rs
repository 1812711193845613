//! Translation between the neutral vocabulary and `ash` types.

use crate::backend::{BindingKind, IndexType, VertexFormat};
use nyx_core::{
    ArrayFlags, Extent2D, ImageFormat, ImageLayout, ImageUsage, MemoryFlags, PipelineStage,
    QueueCapabilities, ShaderStages,
};
use ash::vk;

pub fn memory_flags(flags: vk::MemoryPropertyFlags) -> MemoryFlags {
    MemoryFlags::from_bits_truncate(flags.as_raw())
}

pub fn buffer_usage(flags: ArrayFlags) -> vk::BufferUsageFlags {
    vk::BufferUsageFlags::from_raw(flags.bits())
}

pub fn image_usage(usage: ImageUsage) -> vk::ImageUsageFlags {
    vk::ImageUsageFlags::from_raw(usage.bits())
}

pub fn shader_stages(stages: ShaderStages) -> vk::ShaderStageFlags {
    vk::ShaderStageFlags::from_raw(stages.bits())
}

pub fn queue_capabilities(flags: vk::QueueFlags, present: bool) -> QueueCapabilities {
    let mut caps = QueueCapabilities::empty();
    if flags.contains(vk::QueueFlags::GRAPHICS) {
        caps |= QueueCapabilities::GRAPHICS;
    }
    if flags.contains(vk::QueueFlags::COMPUTE) {
        caps |= QueueCapabilities::COMPUTE;
    }
    // Graphics and compute queues accept transfers without advertising it.
    if flags.intersects(vk::QueueFlags::TRANSFER | vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
    {
        caps |= QueueCapabilities::TRANSFER;
    }
    if present {
        caps |= QueueCapabilities::PRESENT;
    }
    caps
}

pub const fn format(format: ImageFormat) -> vk::Format {
    match format {
        ImageFormat::R8 => vk::Format::R8_UNORM,
        ImageFormat::R32I => vk::Format::R32_SINT,
        ImageFormat::R32F => vk::Format::R32_SFLOAT,
        ImageFormat::Rgb8 => vk::Format::R8G8B8_UNORM,
        ImageFormat::Bgr8 => vk::Format::B8G8R8_UNORM,
        ImageFormat::Rgb32I => vk::Format::R32G32B32_SINT,
        ImageFormat::Rgb32F => vk::Format::R32G32B32_SFLOAT,
        ImageFormat::Rgba8 => vk::Format::R8G8B8A8_UNORM,
        ImageFormat::Bgra8 => vk::Format::B8G8R8A8_UNORM,
        ImageFormat::Rgba32I => vk::Format::R32G32B32A32_SINT,
        ImageFormat::Rgba32F => vk::Format::R32G32B32A32_SFLOAT,
        ImageFormat::D32F => vk::Format::D32_SFLOAT,
    }
}

/// The neutral format for a surface format, sRGB variants included.
pub const fn image_format(format: vk::Format) -> Option<ImageFormat> {
    Some(match format {
        vk::Format::R8_UNORM => ImageFormat::R8,
        vk::Format::R8G8B8A8_UNORM | vk::Format::R8G8B8A8_SRGB => ImageFormat::Rgba8,
        vk::Format::B8G8R8A8_UNORM | vk::Format::B8G8R8A8_SRGB => ImageFormat::Bgra8,
        vk::Format::R32G32B32A32_SFLOAT => ImageFormat::Rgba32F,
        vk::Format::D32_SFLOAT => ImageFormat::D32F,
        _ => return None,
    })
}

pub const fn aspect(format: ImageFormat) -> vk::ImageAspectFlags {
    if format.is_depth() {
        vk::ImageAspectFlags::DEPTH
    } else {
        vk::ImageAspectFlags::COLOR
    }
}

pub const fn extent(extent: Extent2D) -> vk::Extent2D {
    vk::Extent2D {
        width: extent.width,
        height: extent.height,
    }
}

/// Native layout for a neutral one. Depth images keep their attachment
/// layout where color images use the color variant.
pub const fn layout(layout: ImageLayout, depth: bool) -> vk::ImageLayout {
    match layout {
        ImageLayout::Undefined => vk::ImageLayout::UNDEFINED,
        ImageLayout::General => vk::ImageLayout::GENERAL,
        ImageLayout::ColorAttachment if depth => vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL,
        ImageLayout::ColorAttachment => vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        ImageLayout::ShaderRead => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        ImageLayout::TransferSrc => vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        ImageLayout::TransferDst => vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        ImageLayout::PresentSrc => vk::ImageLayout::PRESENT_SRC_KHR,
        ImageLayout::DepthRead => vk::ImageLayout::DEPTH_READ_ONLY_OPTIMAL,
    }
}

/// Stage and access mask that work in `layout` touches.
pub const fn layout_scope(
    layout: ImageLayout,
) -> (vk::PipelineStageFlags2, vk::AccessFlags2) {
    match layout {
        ImageLayout::Undefined => (vk::PipelineStageFlags2::TOP_OF_PIPE, vk::AccessFlags2::NONE),
        ImageLayout::General => (
            vk::PipelineStageFlags2::ALL_COMMANDS,
            vk::AccessFlags2::from_raw(
                vk::AccessFlags2::MEMORY_READ.as_raw() | vk::AccessFlags2::MEMORY_WRITE.as_raw(),
            ),
        ),
        ImageLayout::ColorAttachment => (
            vk::PipelineStageFlags2::from_raw(
                vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT.as_raw()
                    | vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS.as_raw()
                    | vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS.as_raw(),
            ),
            vk::AccessFlags2::from_raw(
                vk::AccessFlags2::COLOR_ATTACHMENT_WRITE.as_raw()
                    | vk::AccessFlags2::COLOR_ATTACHMENT_READ.as_raw()
                    | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE.as_raw()
                    | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ.as_raw(),
            ),
        ),
        ImageLayout::ShaderRead | ImageLayout::DepthRead => (
            vk::PipelineStageFlags2::from_raw(
                vk::PipelineStageFlags2::FRAGMENT_SHADER.as_raw()
                    | vk::PipelineStageFlags2::COMPUTE_SHADER.as_raw(),
            ),
            vk::AccessFlags2::SHADER_READ,
        ),
        ImageLayout::TransferSrc => (
            vk::PipelineStageFlags2::TRANSFER,
            vk::AccessFlags2::TRANSFER_READ,
        ),
        ImageLayout::TransferDst => (
            vk::PipelineStageFlags2::TRANSFER,
            vk::AccessFlags2::TRANSFER_WRITE,
        ),
        ImageLayout::PresentSrc => (
            vk::PipelineStageFlags2::BOTTOM_OF_PIPE,
            vk::AccessFlags2::NONE,
        ),
    }
}

pub const fn stage(stage: PipelineStage) -> vk::ShaderStageFlags {
    match stage {
        PipelineStage::Vertex => vk::ShaderStageFlags::VERTEX,
        PipelineStage::Fragment => vk::ShaderStageFlags::FRAGMENT,
        PipelineStage::Compute => vk::ShaderStageFlags::COMPUTE,
        PipelineStage::TessControl => vk::ShaderStageFlags::TESSELLATION_CONTROL,
    }
}

pub const fn descriptor_type(kind: BindingKind) -> vk::DescriptorType {
    match kind {
        BindingKind::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
        BindingKind::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
        BindingKind::SampledImage => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
        BindingKind::StorageImage => vk::DescriptorType::STORAGE_IMAGE,
    }
}

pub const fn vertex_format(format: VertexFormat) -> vk::Format {
    match format {
        VertexFormat::Float => vk::Format::R32_SFLOAT,
        VertexFormat::Float2 => vk::Format::R32G32_SFLOAT,
        VertexFormat::Float3 => vk::Format::R32G32B32_SFLOAT,
        VertexFormat::Float4 => vk::Format::R32G32B32A32_SFLOAT,
        VertexFormat::UInt => vk::Format::R32_UINT,
        VertexFormat::Int => vk::Format::R32_SINT,
    }
}

pub const fn index_type(index: IndexType) -> vk::IndexType {
    match index {
        IndexType::U16 => vk::IndexType::UINT16,
        IndexType::U32 => vk::IndexType::UINT32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_bits_line_up() {
        assert_eq!(
            buffer_usage(ArrayFlags::STORAGE | ArrayFlags::DEVICE_ADDRESS),
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
        );
        assert_eq!(
            image_usage(ImageUsage::COLOR_ATTACHMENT | ImageUsage::SAMPLED),
            vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::SAMPLED
        );
        assert_eq!(
            memory_flags(
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
            ),
            MemoryFlags::HOST_SHARED
        );
        assert_eq!(
            shader_stages(ShaderStages::VERTEX | ShaderStages::FRAGMENT),
            vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT
        );
    }

    #[test]
    fn transfer_is_implied_by_graphics_and_compute() {
        let caps = queue_capabilities(vk::QueueFlags::COMPUTE, false);
        assert!(caps.contains(QueueCapabilities::COMPUTE | QueueCapabilities::TRANSFER));
        assert!(!caps.contains(QueueCapabilities::PRESENT));
        let caps = queue_capabilities(vk::QueueFlags::GRAPHICS, true);
        assert!(caps.contains(QueueCapabilities::PRESENT));
    }

    #[test]
    fn formats_round_trip_where_supported() {
        for neutral in [ImageFormat::R8, ImageFormat::Rgba8, ImageFormat::Bgra8, ImageFormat::D32F] {
            assert_eq!(image_format(format(neutral)), Some(neutral));
        }
        assert_eq!(image_format(vk::Format::B8G8R8A8_SRGB), Some(ImageFormat::Bgra8));
        assert_eq!(image_format(vk::Format::R16_UNORM), None);
    }

    #[test]
    fn depth_layouts() {
        assert_eq!(
            layout(ImageLayout::ColorAttachment, true),
            vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL
        );
        assert_eq!(aspect(ImageFormat::D32F), vk::ImageAspectFlags::DEPTH);
    }
}
