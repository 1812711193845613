//! Render passes: attachment sets, offscreen or backed by a swapchain.

use crate::backend::{ColorTarget, DepthTarget, ImageDesc, RenderTargets, SwapchainDesc, SwapchainInfo};
use crate::device::Device;
use crate::error::{GpuError, Result};
use crate::image::Texture;
use crate::window::WindowId;
use nyx_core::{ErrorCode, Extent2D, ImageFormat, ImageLayout, ImageUsage, QueueCapabilities};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

/// One color attachment of a subpass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Attachment {
    pub clear_color: [f32; 4],
    pub format: ImageFormat,
    /// Layout the attachment is left in when a chain using it is submitted.
    pub layout: ImageLayout,
    /// Clear when rendering begins; keep the previous contents otherwise.
    pub clear: bool,
}

impl Default for Attachment {
    fn default() -> Self {
        Self {
            clear_color: [0.0, 0.0, 0.0, 1.0],
            format: ImageFormat::Rgba8,
            layout: ImageLayout::ColorAttachment,
            clear: true,
        }
    }
}

impl Attachment {
    pub fn new(format: ImageFormat) -> Self {
        Self {
            format,
            ..Self::default()
        }
    }

    pub const fn with_clear_color(mut self, color: [f32; 4]) -> Self {
        self.clear_color = color;
        self
    }

    pub const fn with_layout(mut self, layout: ImageLayout) -> Self {
        self.layout = layout;
        self
    }

    /// Keep previous contents instead of clearing.
    pub const fn load(mut self) -> Self {
        self.clear = false;
        self
    }
}

/// Attachments rendered together, plus an optional depth buffer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Subpass {
    pub attachments: Vec<Attachment>,
    /// Depth clear value; `None` for no depth attachment.
    pub depth: Option<f32>,
}

impl Subpass {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    pub const fn with_depth(mut self, clear: f32) -> Self {
        self.depth = Some(clear);
        self
    }
}

struct Frame {
    /// Color textures per subpass.
    colors: Vec<Vec<Texture>>,
    depth: Vec<Option<Texture>>,
}

struct PassState {
    swapchain: Option<SwapchainInfo>,
    frames: Vec<Frame>,
    current: usize,
    extent: Extent2D,
    pending: Option<Extent2D>,
    stale: bool,
}

struct PassShared {
    device: Device,
    window: Option<WindowId>,
    subpasses: Vec<Subpass>,
    vsync: bool,
    state: Mutex<PassState>,
}

impl Drop for PassShared {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        state.frames.clear();
        if let Some(swapchain) = state.swapchain.take() {
            if let Err(err) = self.device.synchronize() {
                tracing::warn!("Destroying swapchain on a busy device: {err}");
            }
            self.device.backend().destroy_swapchain(swapchain.handle);
        }
    }
}

/// A set of framebuffers and the subpasses that render into them.
///
/// Offscreen passes own one framebuffer. Window passes own one per
/// swapchain image, and color attachment 0 of subpass 0 is the swapchain
/// image itself. Clones share the framebuffers.
#[derive(Clone)]
pub struct RenderPass {
    subpasses: Vec<Subpass>,
    extent: Extent2D,
    vsync: bool,
    shared: Option<Arc<PassShared>>,
}

impl Default for RenderPass {
    fn default() -> Self {
        Self::new()
    }
}

impl RenderPass {
    pub fn new() -> Self {
        Self {
            subpasses: Vec::new(),
            extent: Extent2D::default(),
            vsync: true,
            shared: None,
        }
    }

    /// Add a subpass. Takes effect at the next initialize.
    pub fn add_subpass(&mut self, subpass: Subpass) {
        self.subpasses.push(subpass);
    }

    pub fn set_vsync(&mut self, vsync: bool) {
        self.vsync = vsync;
    }

    /// Set the framebuffer size.
    ///
    /// On an initialized offscreen pass the framebuffers are rebuilt at the
    /// next [`present`](Self::present). Window passes follow their window.
    pub fn set_dimensions(&mut self, width: u32, height: u32) {
        self.extent = Extent2D::new(width, height);
        if let Some(shared) = &self.shared {
            if shared.window.is_none() {
                shared.state.lock().pending = Some(self.extent);
            }
        }
    }

    /// Create offscreen framebuffers of the configured size.
    pub fn initialize(&mut self, device: &Device) -> Result<()> {
        self.reset();
        if self.subpasses.is_empty() {
            return Err(GpuError::InvalidArgument(
                "render pass has no subpasses".to_string(),
            ));
        }
        if self.extent.is_empty() {
            return Err(GpuError::InvalidArgument(format!(
                "render pass extent {}x{} is empty",
                self.extent.width, self.extent.height
            )));
        }

        let frames = vec![build_frame(device, &self.subpasses, self.extent, None)?];
        self.shared = Some(Arc::new(PassShared {
            device: device.clone(),
            window: None,
            subpasses: self.subpasses.clone(),
            vsync: self.vsync,
            state: Mutex::new(PassState {
                swapchain: None,
                frames,
                current: 0,
                extent: self.extent,
                pending: None,
                stale: false,
            }),
        }));
        Ok(())
    }

    /// Create a swapchain for `window` and framebuffers around its images.
    pub fn initialize_for_window(&mut self, device: &Device, window: WindowId) -> Result<()> {
        self.reset();
        if !device
            .graphics_queue()
            .supports(QueueCapabilities::PRESENT)
        {
            return Err(GpuError::Unsupported(format!(
                "device {} cannot present from its graphics queue",
                device.id()
            )));
        }
        let source = device
            .window(window)
            .ok_or_else(|| GpuError::ResourceNotFound(format!("window {}", window.index())))?;

        if self.subpasses.is_empty() {
            self.subpasses.push(Subpass::new());
        }
        if self.subpasses[0].attachments.is_empty() {
            self.subpasses[0].attachments.push(Attachment::default());
        }

        let shared = Arc::new(PassShared {
            device: device.clone(),
            window: Some(window),
            subpasses: self.subpasses.clone(),
            vsync: self.vsync,
            state: Mutex::new(PassState {
                swapchain: None,
                frames: Vec::new(),
                current: 0,
                extent: Extent2D::default(),
                pending: None,
                stale: false,
            }),
        });
        {
            let mut state = shared.state.lock();
            recreate(&shared, &mut state, source.extent())?;
        }
        self.extent = shared.state.lock().extent;
        self.shared = Some(shared);
        Ok(())
    }

    /// Finish the frame.
    ///
    /// Window passes present the current image and acquire the next one.
    /// Returns true when framebuffers were rebuilt (after a resize or a
    /// stale swapchain); anything bound to the old attachments must be
    /// rebound.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn present(&mut self) -> Result<bool> {
        let shared = Arc::clone(self.shared()?);
        let mut state = shared.state.lock();

        let Some(window) = shared.window else {
            let Some(extent) = state.pending.take() else {
                return Ok(false);
            };
            state.frames = vec![build_frame(&shared.device, &shared.subpasses, extent, None)?];
            state.extent = extent;
            state.current = 0;
            return Ok(true);
        };

        let wanted = shared
            .device
            .window(window)
            .ok_or_else(|| GpuError::ResourceNotFound(format!("window {}", window.index())))?
            .extent();
        if wanted.is_empty() {
            return Ok(false);
        }

        let rebuilt = if state.stale || wanted != state.extent {
            true
        } else {
            let handle = swapchain_handle(&state)?;
            shared
                .device
                .graphics_queue()
                .present(handle, state.current as u32)?
                || !acquire(&shared, &mut state)?
        };
        if rebuilt {
            recreate(&shared, &mut state, wanted)?;
            self.extent = state.extent;
        }
        Ok(rebuilt)
    }

    pub fn reset(&mut self) {
        self.shared = None;
    }

    pub const fn is_initialized(&self) -> bool {
        self.shared.is_some()
    }

    pub fn device(&self) -> Option<&Device> {
        self.shared.as_ref().map(|s| &s.device)
    }

    pub fn window(&self) -> Option<WindowId> {
        self.shared.as_ref().and_then(|s| s.window)
    }

    pub fn subpasses(&self) -> &[Subpass] {
        self.shared
            .as_ref()
            .map_or(self.subpasses.as_slice(), |s| s.subpasses.as_slice())
    }

    pub fn subpass_count(&self) -> usize {
        self.subpasses().len()
    }

    /// Current framebuffer size.
    pub fn extent(&self) -> Extent2D {
        self.shared
            .as_ref()
            .map_or(self.extent, |s| s.state.lock().extent)
    }

    /// Number of framebuffers.
    pub fn count(&self) -> usize {
        self.shared.as_ref().map_or(0, |s| s.state.lock().frames.len())
    }

    /// Index of the framebuffer being rendered.
    pub fn current(&self) -> usize {
        self.shared.as_ref().map_or(0, |s| s.state.lock().current)
    }

    /// Color textures of framebuffer `index`, subpass by subpass.
    pub fn framebuffer(&self, index: usize) -> Option<Vec<Texture>> {
        let shared = self.shared.as_ref()?;
        let state = shared.state.lock();
        let frame = state.frames.get(index)?;
        Some(frame.colors.iter().flatten().cloned().collect())
    }

    /// Color attachment `index` of `subpass` in the current framebuffer.
    pub fn attachment(&self, subpass: usize, index: usize) -> Option<Texture> {
        let shared = self.shared.as_ref()?;
        let state = shared.state.lock();
        state
            .frames
            .get(state.current)?
            .colors
            .get(subpass)?
            .get(index)
            .cloned()
    }

    pub fn depth(&self, subpass: usize) -> Option<Texture> {
        let shared = self.shared.as_ref()?;
        let state = shared.state.lock();
        state.frames.get(state.current)?.depth.get(subpass)?.clone()
    }

    /// Formats pipelines for `subpass` must render to.
    pub fn color_formats(&self, subpass: usize) -> Vec<ImageFormat> {
        let Some(shared) = &self.shared else {
            return self
                .subpasses
                .get(subpass)
                .map(|s| s.attachments.iter().map(|a| a.format).collect())
                .unwrap_or_default();
        };
        let state = shared.state.lock();
        state
            .frames
            .first()
            .and_then(|frame| frame.colors.get(subpass))
            .map(|colors| colors.iter().map(Texture::format).collect())
            .unwrap_or_default()
    }

    pub fn has_depth(&self, subpass: usize) -> bool {
        self.subpasses()
            .get(subpass)
            .is_some_and(|s| s.depth.is_some())
    }

    /// Targets for a rendering scope over `subpass` of the current frame,
    /// and the layout each texture must be in first.
    pub(crate) fn render_targets(
        &self,
        subpass: usize,
    ) -> Result<(RenderTargets, Vec<(Texture, ImageLayout)>)> {
        let shared = self.shared()?;
        let config = shared.subpasses.get(subpass).ok_or_else(|| {
            GpuError::InvalidArgument(format!("render pass has no subpass {subpass}"))
        })?;
        let state = shared.state.lock();
        let frame = current_frame(&state)?;

        let mut layouts = Vec::new();
        let mut colors = Vec::new();
        for (attachment, texture) in config.attachments.iter().zip(&frame.colors[subpass]) {
            colors.push(ColorTarget {
                image: texture.handle(),
                format: texture.format(),
                clear: attachment.clear.then_some(attachment.clear_color),
            });
            layouts.push((texture.clone(), ImageLayout::ColorAttachment));
        }
        let depth = match (config.depth, &frame.depth[subpass]) {
            (Some(clear), Some(texture)) => {
                layouts.push((texture.clone(), ImageLayout::General));
                Some(DepthTarget {
                    image: texture.handle(),
                    clear: Some(clear),
                })
            }
            _ => None,
        };

        Ok((
            RenderTargets {
                extent: state.extent,
                colors,
                depth,
            },
            layouts,
        ))
    }

    /// Layouts the current frame's attachments are left in after a chain.
    pub(crate) fn final_layouts(&self) -> Result<Vec<(Texture, ImageLayout)>> {
        let shared = self.shared()?;
        let state = shared.state.lock();
        let frame = current_frame(&state)?;

        let mut layouts = Vec::new();
        for (index, (config, textures)) in shared.subpasses.iter().zip(&frame.colors).enumerate() {
            for (slot, (attachment, texture)) in config.attachments.iter().zip(textures).enumerate() {
                let layout = if shared.window.is_some() && index == 0 && slot == 0 {
                    ImageLayout::PresentSrc
                } else {
                    attachment.layout
                };
                if layout != ImageLayout::Undefined {
                    layouts.push((texture.clone(), layout));
                }
            }
        }
        Ok(layouts)
    }

    fn shared(&self) -> Result<&Arc<PassShared>> {
        self.shared
            .as_ref()
            .ok_or_else(|| GpuError::InvalidState("render pass is not initialized".to_string()))
    }
}

impl fmt::Debug for RenderPass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderPass")
            .field("subpasses", &self.subpass_count())
            .field("extent", &self.extent())
            .field("window", &self.window())
            .field("frames", &self.count())
            .finish()
    }
}

fn current_frame(state: &PassState) -> Result<&Frame> {
    state
        .frames
        .get(state.current)
        .ok_or_else(|| GpuError::InvalidState("render pass has no current frame".to_string()))
}

fn swapchain_handle(state: &PassState) -> Result<crate::backend::SwapchainHandle> {
    state
        .swapchain
        .as_ref()
        .map(|s| s.handle)
        .ok_or_else(|| GpuError::InvalidState("render pass has no swapchain".to_string()))
}

fn build_frame(
    device: &Device,
    subpasses: &[Subpass],
    extent: Extent2D,
    swapchain_image: Option<Texture>,
) -> Result<Frame> {
    let mut swapchain_image = swapchain_image;
    let mut colors = Vec::with_capacity(subpasses.len());
    let mut depth = Vec::with_capacity(subpasses.len());

    for subpass in subpasses {
        let mut textures = Vec::with_capacity(subpass.attachments.len());
        for attachment in &subpass.attachments {
            let texture = match swapchain_image.take() {
                Some(image) => image,
                None => Texture::allocate(
                    device,
                    ImageDesc {
                        format: attachment.format,
                        width: extent.width,
                        height: extent.height,
                        layers: 1,
                        mip_levels: 1,
                        usage: ImageUsage::COLOR_ATTACHMENT
                            | ImageUsage::SAMPLED
                            | ImageUsage::TRANSFER_SRC
                            | ImageUsage::TRANSFER_DST,
                    },
                )?,
            };
            textures.push(texture);
        }
        colors.push(textures);

        depth.push(match subpass.depth {
            Some(_) => Some(Texture::allocate(
                device,
                ImageDesc {
                    format: ImageFormat::D32F,
                    width: extent.width,
                    height: extent.height,
                    layers: 1,
                    mip_levels: 1,
                    usage: ImageUsage::DEPTH_STENCIL_ATTACHMENT | ImageUsage::SAMPLED,
                },
            )?),
            None => None,
        });
    }

    Ok(Frame { colors, depth })
}

/// Acquire the next swapchain image. False when the swapchain is out of date.
fn acquire(shared: &PassShared, state: &mut PassState) -> Result<bool> {
    let handle = swapchain_handle(state)?;
    match shared.device.backend().acquire_image(handle) {
        Ok((index, suboptimal)) => {
            state.current = index as usize;
            if suboptimal {
                shared
                    .device
                    .errors()
                    .report(ErrorCode::Suboptimal, "swapchain no longer matches its surface");
                state.stale = true;
            }
            Ok(true)
        }
        Err(err) if err.code() == ErrorCode::OutOfDate => Ok(false),
        Err(err) => Err(err),
    }
}

/// Replace the swapchain and every framebuffer, then acquire an image.
fn recreate(shared: &PassShared, state: &mut PassState, extent: Extent2D) -> Result<()> {
    let device = &shared.device;
    let window = shared
        .window
        .and_then(|id| device.window(id))
        .ok_or_else(|| GpuError::InvalidState("render pass has no window".to_string()))?;

    device.synchronize()?;
    state.frames.clear();
    if let Some(old) = state.swapchain.take() {
        device.backend().destroy_swapchain(old.handle);
    }

    let info = device.backend().create_swapchain(
        window.as_ref(),
        &SwapchainDesc {
            extent,
            vsync: shared.vsync,
        },
    )?;
    tracing::debug!(
        "Swapchain {}x{} with {} image(s)",
        info.extent.width,
        info.extent.height,
        info.images.len()
    );

    state.frames = info
        .images
        .iter()
        .map(|&image| {
            let texture = Texture::from_swapchain(device, image, info.format, info.extent);
            build_frame(device, &shared.subpasses, info.extent, Some(texture))
        })
        .collect::<Result<_>>()?;
    state.extent = info.extent;
    state.swapchain = Some(info);
    state.stale = false;

    if !acquire(shared, state)? {
        return Err(GpuError::SwapchainCreation(
            "new swapchain is already out of date".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::host::HostBackend;
    use crate::window::{VirtualWindow, WindowRegistry};
    use nyx_core::ErrorChannel;

    fn setup() -> (Device, Arc<WindowRegistry>, Arc<HostBackend>) {
        let backend = Arc::new(HostBackend::default());
        let windows = Arc::new(WindowRegistry::default());
        let device = Device::new(
            0,
            backend.clone(),
            Arc::new(ErrorChannel::silent()),
            Arc::clone(&windows),
        )
        .unwrap();
        (device, windows, backend)
    }

    #[test]
    fn offscreen_pass_has_one_framebuffer() {
        let (device, _, _) = setup();
        let mut pass = RenderPass::new();
        pass.add_subpass(
            Subpass::new()
                .with_attachment(Attachment::new(ImageFormat::Rgba8))
                .with_attachment(Attachment::new(ImageFormat::R32F))
                .with_depth(1.0),
        );
        pass.set_dimensions(4, 4);
        pass.initialize(&device).unwrap();

        assert_eq!(pass.count(), 1);
        assert_eq!(pass.framebuffer(0).unwrap().len(), 2);
        assert_eq!(pass.color_formats(0), vec![ImageFormat::Rgba8, ImageFormat::R32F]);
        assert!(pass.depth(0).is_some());
        assert!(!pass.clone().present().unwrap());
    }

    #[test]
    fn offscreen_resize_applies_on_present() {
        let (device, _, _) = setup();
        let mut pass = RenderPass::new();
        pass.add_subpass(Subpass::new().with_attachment(Attachment::default()));
        pass.set_dimensions(4, 4);
        pass.initialize(&device).unwrap();

        pass.set_dimensions(8, 2);
        assert_eq!(pass.extent(), Extent2D::new(4, 4));
        assert!(pass.present().unwrap());
        assert_eq!(pass.extent(), Extent2D::new(8, 2));
        assert_eq!(pass.attachment(0, 0).unwrap().width(), 8);
    }

    #[test]
    fn empty_passes_are_rejected() {
        let (device, _, _) = setup();
        let mut pass = RenderPass::new();
        pass.set_dimensions(4, 4);
        assert!(pass.initialize(&device).is_err());
    }

    #[test]
    fn window_pass_tracks_swapchain_images() {
        let (device, windows, backend) = setup();
        let window = Arc::new(VirtualWindow::new(16, 8));
        let id = windows.register(window.clone());

        let mut pass = RenderPass::new();
        pass.initialize_for_window(&device, id).unwrap();
        assert_eq!(pass.count(), 3);
        assert_eq!(pass.extent(), Extent2D::new(16, 8));
        assert_eq!(pass.attachment(0, 0).unwrap().format(), ImageFormat::Bgra8);

        assert!(!pass.present().unwrap());
        assert_eq!(pass.current(), 1);
        assert_eq!(backend.stats().presents, 1);

        window.resize(32, 8);
        assert!(pass.present().unwrap());
        assert_eq!(pass.extent(), Extent2D::new(32, 8));
        assert_eq!(pass.current(), 0);
    }
}
