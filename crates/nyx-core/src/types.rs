//! Formats, layouts and small enums shared by front end and backends.

use crate::flags::ShaderStages;

/// Which queue a chain records for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ChainType {
    #[default]
    Graphics,
    Compute,
    Transfer,
}

/// A programmable pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineStage {
    Vertex,
    Fragment,
    Compute,
    TessControl,
}

impl PipelineStage {
    pub const fn stages(self) -> ShaderStages {
        match self {
            Self::Vertex => ShaderStages::VERTEX,
            Self::Fragment => ShaderStages::FRAGMENT,
            Self::Compute => ShaderStages::COMPUTE,
            Self::TessControl => ShaderStages::TESSELLATION_CONTROL,
        }
    }
}

/// Access mode of an image's memory.
///
/// Every image starts `Undefined` and only changes through an explicit
/// transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ImageLayout {
    #[default]
    Undefined,
    General,
    ColorAttachment,
    ShaderRead,
    TransferSrc,
    TransferDst,
    PresentSrc,
    DepthRead,
}

/// Pixel formats the layer understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageFormat {
    R8,
    R32I,
    R32F,
    Rgb8,
    Bgr8,
    Rgb32I,
    Rgb32F,
    Rgba8,
    Bgra8,
    Rgba32I,
    Rgba32F,
    /// 32-bit float depth, used for depth attachments.
    D32F,
}

impl ImageFormat {
    pub const fn bytes_per_pixel(self) -> u32 {
        match self {
            Self::R8 => 1,
            Self::Rgb8 | Self::Bgr8 => 3,
            Self::R32I | Self::R32F | Self::Rgba8 | Self::Bgra8 | Self::D32F => 4,
            Self::Rgb32I | Self::Rgb32F => 12,
            Self::Rgba32I | Self::Rgba32F => 16,
        }
    }

    pub const fn channels(self) -> u32 {
        match self {
            Self::R8 | Self::R32I | Self::R32F | Self::D32F => 1,
            Self::Rgb8 | Self::Bgr8 | Self::Rgb32I | Self::Rgb32F => 3,
            Self::Rgba8 | Self::Bgra8 | Self::Rgba32I | Self::Rgba32F => 4,
        }
    }

    pub const fn is_depth(self) -> bool {
        matches!(self, Self::D32F)
    }

    /// Encode a normalized RGBA color as one pixel of this format.
    ///
    /// 8-bit channels are rounded and clamped, integer formats truncate.
    pub fn encode_color(self, rgba: [f32; 4]) -> Vec<u8> {
        let unorm = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
        let [r, g, b, a] = rgba;
        match self {
            Self::R8 => vec![unorm(r)],
            Self::Rgb8 => vec![unorm(r), unorm(g), unorm(b)],
            Self::Bgr8 => vec![unorm(b), unorm(g), unorm(r)],
            Self::Rgba8 => vec![unorm(r), unorm(g), unorm(b), unorm(a)],
            Self::Bgra8 => vec![unorm(b), unorm(g), unorm(r), unorm(a)],
            Self::R32F | Self::D32F => bytemuck::bytes_of(&r).to_vec(),
            Self::Rgb32F => bytemuck::cast_slice(&[r, g, b]).to_vec(),
            Self::Rgba32F => bytemuck::cast_slice(&rgba).to_vec(),
            Self::R32I => bytemuck::bytes_of(&(r as i32)).to_vec(),
            Self::Rgb32I => bytemuck::cast_slice(&[r as i32, g as i32, b as i32]).to_vec(),
            Self::Rgba32I => {
                bytemuck::cast_slice(&[r as i32, g as i32, b as i32, a as i32]).to_vec()
            }
        }
    }
}

/// Width and height in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Extent2D {
    pub width: u32,
    pub height: u32,
}

impl Extent2D {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub const fn is_empty(self) -> bool {
        self.width == 0 || self.height == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoded_pixel_matches_pixel_size() {
        let formats = [
            ImageFormat::R8,
            ImageFormat::R32I,
            ImageFormat::R32F,
            ImageFormat::Rgb8,
            ImageFormat::Bgr8,
            ImageFormat::Rgb32I,
            ImageFormat::Rgb32F,
            ImageFormat::Rgba8,
            ImageFormat::Bgra8,
            ImageFormat::Rgba32I,
            ImageFormat::Rgba32F,
            ImageFormat::D32F,
        ];
        for format in formats {
            let pixel = format.encode_color([0.25, 0.5, 0.75, 1.0]);
            assert_eq!(pixel.len() as u32, format.bytes_per_pixel(), "{format:?}");
        }
    }

    #[test]
    fn bgra_swaps_red_and_blue() {
        assert_eq!(ImageFormat::Rgba8.encode_color([1.0, 0.0, 0.0, 1.0]), [255, 0, 0, 255]);
        assert_eq!(ImageFormat::Bgra8.encode_color([1.0, 0.0, 0.0, 1.0]), [0, 0, 255, 255]);
    }

    #[test]
    fn compute_stage_maps_to_compute_bits() {
        assert_eq!(PipelineStage::Compute.stages(), ShaderStages::COMPUTE);
        assert!(ShaderStages::ALL_GRAPHICS.contains(PipelineStage::Fragment.stages()));
    }
}
