//! Pixel formats lifted to the type level.
//!
//! `Image<F>` is parameterized by one of these markers so that the format
//! of an image is fixed when it is declared.

use crate::types::ImageFormat;

/// A pixel format known at compile time.
pub trait PixelFormat: Send + Sync + 'static {
    const FORMAT: ImageFormat;

    fn bytes_per_pixel() -> u32 {
        Self::FORMAT.bytes_per_pixel()
    }
}

macro_rules! pixel_formats {
    ($($(#[$meta:meta])* $name:ident => $format:ident),* $(,)?) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
            pub struct $name;

            impl PixelFormat for $name {
                const FORMAT: ImageFormat = ImageFormat::$format;
            }
        )*
    };
}

pixel_formats! {
    /// Single 8-bit unsigned normalized channel.
    R8 => R8,
    R32I => R32I,
    R32F => R32F,
    Rgb8 => Rgb8,
    Bgr8 => Bgr8,
    Rgb32I => Rgb32I,
    Rgb32F => Rgb32F,
    /// 8-bit RGBA, the usual texture format.
    Rgba8 => Rgba8,
    /// 8-bit BGRA, the usual swapchain format.
    Bgra8 => Bgra8,
    Rgba32I => Rgba32I,
    Rgba32F => Rgba32F,
    /// 32-bit float depth.
    D32F => D32F,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn markers_carry_their_format() {
        assert_eq!(Rgba8::FORMAT, ImageFormat::Rgba8);
        assert_eq!(Rgba8::bytes_per_pixel(), 4);
        assert_eq!(Rgba32F::bytes_per_pixel(), 16);
        assert_eq!(Bgr8::bytes_per_pixel(), 3);
    }
}
