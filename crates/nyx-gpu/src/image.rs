//! Images with a type-level pixel format and a tracked layout.

use crate::array::Array;
use crate::backend::{ImageDesc, ImageHandle, ImageRegion};
use crate::chain::Chain;
use crate::device::Device;
use crate::error::{GpuError, Result};
use crate::memory::{Memory, Reservation};
use bytemuck::Pod;
use nyx_core::{Extent2D, ImageFormat, ImageLayout, ImageUsage, MemoryFlags, PixelFormat};
use parking_lot::Mutex;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

struct TextureInner {
    device: Device,
    handle: ImageHandle,
    desc: ImageDesc,
    /// Logical size, never larger than the allocation.
    extent: Mutex<Extent2D>,
    layout: Mutex<ImageLayout>,
    _memory: Option<Memory>,
    _reservation: Option<Reservation>,
    /// Swapchain images belong to their swapchain.
    owned: bool,
}

impl Drop for TextureInner {
    fn drop(&mut self) {
        if self.owned {
            self.device.backend().destroy_image(self.handle);
        }
    }
}

/// A backend image without a static format.
///
/// Clones share the image and its layout tag.
#[derive(Clone)]
pub struct Texture {
    inner: Arc<TextureInner>,
}

impl Texture {
    /// Create an image in its own device-local allocation.
    pub fn allocate(device: &Device, desc: ImageDesc) -> Result<Self> {
        let backend = device.backend();
        let (handle, requirements) = backend.create_image(&desc)?;
        let bound = Memory::allocate_filtered(
            device,
            requirements.size,
            requirements.type_filter,
            false,
            MemoryFlags::DEVICE_LOCAL,
        )
        .and_then(|memory| {
            backend.bind_image_memory(handle, memory.handle(), memory.base_offset())?;
            Ok(memory)
        });
        match bound {
            Ok(memory) => Ok(Self::wrap(device, handle, desc, Some(memory), None, true)),
            Err(err) => {
                backend.destroy_image(handle);
                Err(err)
            }
        }
    }

    /// Create an image inside caller-owned memory. `None` when it does not fit.
    pub fn allocate_in(memory: &Memory, desc: ImageDesc) -> Result<Option<Self>> {
        let device = memory.device();
        let backend = device.backend();
        let (handle, requirements) = backend.create_image(&desc)?;

        let reservation = (requirements.type_filter & (1 << memory.type_index()) != 0)
            .then(|| memory.reserve(requirements.size, requirements.alignment))
            .flatten();
        let Some(reservation) = reservation else {
            backend.destroy_image(handle);
            return Ok(None);
        };
        let view = reservation.memory();
        if let Err(err) = backend.bind_image_memory(handle, view.handle(), view.base_offset()) {
            backend.destroy_image(handle);
            return Err(err);
        }
        Ok(Some(Self::wrap(device, handle, desc, None, Some(reservation), true)))
    }

    pub(crate) fn from_swapchain(
        device: &Device,
        handle: ImageHandle,
        format: ImageFormat,
        extent: Extent2D,
    ) -> Self {
        let desc = ImageDesc {
            format,
            width: extent.width,
            height: extent.height,
            layers: 1,
            mip_levels: 1,
            usage: ImageUsage::COLOR_ATTACHMENT | ImageUsage::TRANSFER_SRC | ImageUsage::TRANSFER_DST,
        };
        Self::wrap(device, handle, desc, None, None, false)
    }

    fn wrap(
        device: &Device,
        handle: ImageHandle,
        desc: ImageDesc,
        memory: Option<Memory>,
        reservation: Option<Reservation>,
        owned: bool,
    ) -> Self {
        Self {
            inner: Arc::new(TextureInner {
                device: device.clone(),
                handle,
                desc,
                extent: Mutex::new(Extent2D::new(desc.width, desc.height)),
                layout: Mutex::new(ImageLayout::Undefined),
                _memory: memory,
                _reservation: reservation,
                owned,
            }),
        }
    }

    pub fn device(&self) -> &Device {
        &self.inner.device
    }

    pub fn handle(&self) -> ImageHandle {
        self.inner.handle
    }

    /// Parameters the image was allocated with.
    pub fn desc(&self) -> &ImageDesc {
        &self.inner.desc
    }

    pub fn format(&self) -> ImageFormat {
        self.inner.desc.format
    }

    pub fn extent(&self) -> Extent2D {
        *self.inner.extent.lock()
    }

    pub fn width(&self) -> u32 {
        self.extent().width
    }

    pub fn height(&self) -> u32 {
        self.extent().height
    }

    pub fn layers(&self) -> u32 {
        self.inner.desc.layers
    }

    pub fn layout(&self) -> ImageLayout {
        *self.inner.layout.lock()
    }

    /// Bytes in the logical extent across all layers, base level only.
    pub fn byte_size(&self) -> u64 {
        let extent = self.extent();
        u64::from(extent.width)
            * u64::from(extent.height)
            * u64::from(self.layers())
            * u64::from(self.format().bytes_per_pixel())
    }

    pub fn same(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn set_layout(&self, layout: ImageLayout) {
        *self.inner.layout.lock() = layout;
    }

    fn set_extent(&self, extent: Extent2D) {
        *self.inner.extent.lock() = extent;
    }
}

impl fmt::Debug for Texture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Texture")
            .field("handle", &self.inner.handle)
            .field("format", &self.format())
            .field("extent", &self.extent())
            .field("layers", &self.layers())
            .field("layout", &self.layout())
            .finish()
    }
}

/// Anything a chain can address as an image.
pub trait AsTexture {
    fn texture(&self) -> Option<&Texture>;
}

impl AsTexture for Texture {
    fn texture(&self) -> Option<&Texture> {
        Some(self)
    }
}

/// A 2D image, optionally layered, whose pixel format is `F`.
pub struct Image<F: PixelFormat> {
    texture: Option<Texture>,
    mip_levels: u32,
    usage: ImageUsage,
    _format: PhantomData<F>,
}

impl<F: PixelFormat> Default for Image<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: PixelFormat> Clone for Image<F> {
    fn clone(&self) -> Self {
        Self {
            texture: self.texture.clone(),
            mip_levels: self.mip_levels,
            usage: self.usage,
            _format: PhantomData,
        }
    }
}

impl<F: PixelFormat> AsTexture for Image<F> {
    fn texture(&self) -> Option<&Texture> {
        self.texture.as_ref()
    }
}

impl<F: PixelFormat> Image<F> {
    pub fn new() -> Self {
        Self {
            texture: None,
            mip_levels: 1,
            usage: ImageUsage::default(),
            _format: PhantomData,
        }
    }

    /// Adopt a texture, checking it holds `F` pixels.
    ///
    /// A mismatch is reported as a warning and returned as an error.
    pub fn from_texture(texture: Texture) -> Result<Self> {
        if texture.format() != F::FORMAT {
            let err = GpuError::FormatMismatch {
                expected: F::FORMAT,
                found: texture.format(),
            };
            texture.device().report(&err);
            return Err(err);
        }
        Ok(Self {
            mip_levels: texture.desc().mip_levels,
            usage: texture.desc().usage,
            texture: Some(texture),
            _format: PhantomData,
        })
    }

    /// Mip levels used by the next allocation.
    pub fn set_mip_levels(&mut self, levels: u32) {
        self.mip_levels = levels.max(1);
    }

    /// Usage used by the next allocation.
    pub fn set_usage(&mut self, usage: ImageUsage) {
        self.usage = usage;
    }

    fn desc(&self, width: u32, height: u32, layers: u32) -> ImageDesc {
        ImageDesc {
            format: F::FORMAT,
            width,
            height,
            layers: layers.max(1),
            mip_levels: self.mip_levels,
            usage: self.usage,
        }
    }

    /// Allocate `width * height * layers` pixels of device storage.
    pub fn initialize(&mut self, device: &Device, width: u32, height: u32, layers: u32) -> Result<()> {
        self.reset();
        self.texture = Some(Texture::allocate(device, self.desc(width, height, layers))?);
        Ok(())
    }

    /// Sub-allocate from caller-owned memory. False when it does not fit.
    pub fn initialize_in(&mut self, memory: &Memory, width: u32, height: u32, layers: u32) -> bool {
        self.reset();
        match Texture::allocate_in(memory, self.desc(width, height, layers)) {
            Ok(texture) => {
                self.texture = texture;
                self.texture.is_some()
            }
            Err(err) => {
                tracing::warn!("Image sub-allocation failed: {err}");
                false
            }
        }
    }

    /// Change the logical size.
    ///
    /// Storage is reallocated only when either dimension outgrows the
    /// allocation; returns whether that happened. Reallocation discards
    /// contents and resets the layout to `Undefined`.
    pub fn resize(&mut self, width: u32, height: u32) -> Result<bool> {
        let texture = self
            .texture
            .as_ref()
            .ok_or_else(|| GpuError::InvalidState("image is not initialized".to_string()))?;
        let allocated = texture.desc();
        if width <= allocated.width && height <= allocated.height {
            texture.set_extent(Extent2D::new(width, height));
            return Ok(false);
        }

        let device = texture.device().clone();
        let layers = allocated.layers;
        self.texture = Some(Texture::allocate(&device, self.desc(width, height, layers))?);
        tracing::debug!("Image reallocated at {width}x{height}");
        Ok(true)
    }

    /// Release the storage. Clones keep it alive.
    pub fn reset(&mut self) {
        self.texture = None;
    }

    pub const fn is_initialized(&self) -> bool {
        self.texture.is_some()
    }

    pub fn width(&self) -> u32 {
        self.texture.as_ref().map_or(0, Texture::width)
    }

    pub fn height(&self) -> u32 {
        self.texture.as_ref().map_or(0, Texture::height)
    }

    pub fn layers(&self) -> u32 {
        self.texture.as_ref().map_or(0, Texture::layers)
    }

    pub fn size(&self) -> Extent2D {
        self.texture.as_ref().map_or_else(Extent2D::default, Texture::extent)
    }

    pub const fn format(&self) -> ImageFormat {
        F::FORMAT
    }

    pub const fn mip_levels(&self) -> u32 {
        self.mip_levels
    }

    pub const fn usage(&self) -> ImageUsage {
        self.usage
    }

    pub fn layout(&self) -> ImageLayout {
        self.texture
            .as_ref()
            .map_or(ImageLayout::Undefined, Texture::layout)
    }

    /// `width * height * layers * bytes_per_pixel`.
    pub fn byte_size(&self) -> u64 {
        self.texture.as_ref().map_or(0, Texture::byte_size)
    }

    pub fn device(&self) -> Option<&Device> {
        self.texture.as_ref().map(Texture::device)
    }

    pub fn texture(&self) -> Option<&Texture> {
        self.texture.as_ref()
    }

    /// Record a layout transition into `chain`.
    pub fn transition(&self, chain: &mut Chain, layout: ImageLayout) -> Result<()> {
        chain.transition(self, layout)
    }

    /// Record a full copy from another image into `chain`.
    pub fn copy_from_image(&self, src: &impl AsTexture, chain: &mut Chain) -> Result<()> {
        chain.copy_image(src, self, 0, 0, 0)
    }

    /// Record a copy of a whole array into `chain`.
    pub fn copy_from_array<T: Pod>(&self, src: &Array<T>, chain: &mut Chain) -> Result<()> {
        chain.copy_array_to_image(src, self, 0, 0, 0)
    }
}

impl<F: PixelFormat> fmt::Debug for Image<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Image")
            .field("format", &F::FORMAT)
            .field("size", &self.size())
            .field("layers", &self.layers())
            .field("layout", &self.layout())
            .finish()
    }
}

/// Split `len` bytes starting `offset` bytes into an image into per-layer
/// row regions. Both must cover whole rows of the logical width.
pub(crate) fn row_regions(texture: &Texture, offset: u64, len: u64) -> Result<Vec<ImageRegion>> {
    let extent = texture.extent();
    let layers = texture.layers();
    let row = u64::from(extent.width) * u64::from(texture.format().bytes_per_pixel());
    let total = row * u64::from(extent.height) * u64::from(layers);

    if row == 0 || offset % row != 0 || len % row != 0 {
        return Err(GpuError::InvalidArgument(format!(
            "image copies must cover whole rows of {row} bytes (offset {offset}, length {len})"
        )));
    }
    let end = match offset.checked_add(len) {
        Some(end) if end <= total => end,
        _ => {
            return Err(GpuError::OutOfRange {
                offset,
                end: offset.saturating_add(len),
                len: total,
            })
        }
    };

    let height = u64::from(extent.height);
    let mut regions = Vec::new();
    let mut next = offset / row;
    let end = end / row;
    while next < end {
        let layer = next / height;
        let y = next % height;
        let rows = (height - y).min(end - next);
        regions.push(ImageRegion {
            layer: layer as u32,
            y: y as u32,
            rows: rows as u32,
            width: extent.width,
        });
        next += rows;
    }
    Ok(regions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::host::HostBackend;
    use crate::window::WindowRegistry;
    use nyx_core::format::{Rgba8, R8};
    use nyx_core::{ErrorChannel, ErrorCode, Report};

    fn device_with(errors: Arc<ErrorChannel>) -> Device {
        Device::new(
            0,
            Arc::new(HostBackend::default()),
            errors,
            Arc::new(WindowRegistry::default()),
        )
        .unwrap()
    }

    fn device() -> Device {
        device_with(Arc::new(ErrorChannel::silent()))
    }

    #[test]
    fn byte_size_follows_format() {
        let device = device();
        let mut image = Image::<Rgba8>::new();
        image.initialize(&device, 2, 2, 1).unwrap();
        assert_eq!(image.byte_size(), 16);
        assert_eq!(image.layout(), ImageLayout::Undefined);

        let mut layered = Image::<R8>::new();
        layered.initialize(&device, 3, 2, 4).unwrap();
        assert_eq!(layered.byte_size(), 24);
    }

    #[test]
    fn resize_reallocates_only_when_growing() {
        let device = device();
        let mut image = Image::<Rgba8>::new();
        image.initialize(&device, 8, 8, 1).unwrap();
        let before = image.texture().unwrap().handle();

        assert!(!image.resize(4, 6).unwrap());
        assert_eq!(image.size(), Extent2D::new(4, 6));
        assert_eq!(image.texture().unwrap().handle(), before);

        assert!(image.resize(16, 4).unwrap());
        assert_ne!(image.texture().unwrap().handle(), before);
        assert_eq!(image.byte_size(), 16 * 4 * 4);
    }

    #[test]
    fn format_mismatch_is_a_reported_warning() {
        let seen = Arc::new(Mutex::new(Vec::<Report>::new()));
        let errors = Arc::new(ErrorChannel::silent());
        let sink = Arc::clone(&seen);
        errors.set_callback(move |report| sink.lock().push(report.clone()));
        let device = device_with(errors);

        let mut image = Image::<Rgba8>::new();
        image.initialize(&device, 1, 1, 1).unwrap();
        let texture = image.texture().unwrap().clone();

        assert!(Image::<Rgba8>::from_texture(texture.clone()).is_ok());
        assert!(matches!(
            Image::<R8>::from_texture(texture),
            Err(GpuError::FormatMismatch { .. })
        ));
        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].code, ErrorCode::FormatMismatch);
        assert_eq!(seen[0].severity, nyx_core::Severity::Warning);
    }

    #[test]
    fn sub_allocated_images_respect_capacity() {
        let device = device();
        let memory = Memory::allocate(&device, 64, false, MemoryFlags::DEVICE_LOCAL).unwrap();
        let mut a = Image::<Rgba8>::new();
        assert!(a.initialize_in(&memory, 2, 2, 2));
        let mut b = Image::<Rgba8>::new();
        assert!(a.is_initialized());
        assert!(!b.initialize_in(&memory, 4, 4, 1));
        assert!(!b.is_initialized());
    }

    #[test]
    fn regions_split_at_layer_boundaries() {
        let device = device();
        let mut image = Image::<Rgba8>::new();
        image.initialize(&device, 2, 3, 2).unwrap();
        let texture = image.texture().unwrap();

        // Rows 2..5 of 6: last row of layer 0 and first two of layer 1.
        let regions = row_regions(texture, 16, 24).unwrap();
        assert_eq!(
            regions,
            vec![
                ImageRegion {
                    layer: 0,
                    y: 2,
                    rows: 1,
                    width: 2
                },
                ImageRegion {
                    layer: 1,
                    y: 0,
                    rows: 2,
                    width: 2
                },
            ]
        );
        assert!(row_regions(texture, 4, 8).is_err());
        assert!(row_regions(texture, 0, 56).is_err());
    }

    #[test]
    fn row_aligned_overflow_is_out_of_range() {
        let device = device();
        let mut image = Image::<Rgba8>::new();
        image.initialize(&device, 2, 3, 1).unwrap();
        let texture = image.texture().unwrap();

        // A multiple of the 8-byte row that wraps when the length is added.
        let offset = u64::MAX - 7;
        assert!(matches!(
            row_regions(texture, offset, 8),
            Err(GpuError::OutOfRange { .. })
        ));
    }
}
