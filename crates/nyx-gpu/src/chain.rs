//! Command chains: record, submit, synchronize, reset.
//!
//! A chain moves through `Empty -> Recording -> Submitted -> Empty`.
//! Recording calls append backend commands in program order and keep every
//! resource they touch alive until the submission has been waited on.
//! Calls made in the wrong state are reported through the device's error
//! channel and rejected.
//!
//! Copy amounts count elements of the array's type for copies that involve
//! an array and bytes for image-to-image copies. Zero means the whole
//! source. Offsets are always bytes.

use crate::array::{Array, BufferInner, IndexElement};
use crate::backend::{Command, ReadbackSlot, Ticket};
use crate::binding::{Pipeline, PipelineBinding};
use crate::computer::Computer;
use crate::device::Device;
use crate::error::{ChainState, GpuError, Result};
use crate::image::{row_regions, AsTexture, Texture};
use crate::queue::Queue;
use crate::render_pass::RenderPass;
use crate::renderer::Renderer;
use crate::window::WindowId;
use bytemuck::Pod;
use nyx_core::{ChainType, Extent2D, ImageLayout, QueueCapabilities};
use std::fmt;
use std::marker::PhantomData;
use std::mem::size_of;
use std::sync::Arc;

/// A resource kept alive by a chain until its work completes.
#[derive(Clone)]
pub(crate) enum Retained {
    Buffer(Arc<BufferInner>),
    Texture(Texture),
    Pipeline(Pipeline),
}

/// Host copy of array data, filled once its chain is synchronized.
pub struct Readback<T: Pod> {
    slot: ReadbackSlot,
    dst_offset: usize,
    _marker: PhantomData<T>,
}

impl<T: Pod> Readback<T> {
    pub fn is_ready(&self) -> bool {
        self.slot.is_ready()
    }

    /// The downloaded elements, once.
    pub fn take(&self) -> Option<Vec<T>> {
        self.slot.take().map(|bytes| bytemuck::pod_collect_to_vec(&bytes))
    }

    /// Copy the downloaded bytes into `dst` at the destination offset the
    /// copy was recorded with. Returns false when nothing has arrived yet.
    pub fn take_into(&self, dst: &mut [T]) -> Result<bool> {
        let Some(bytes) = self.slot.take() else {
            return Ok(false);
        };
        let target: &mut [u8] = bytemuck::cast_slice_mut(dst);
        let end = self.dst_offset + bytes.len();
        if end > target.len() {
            return Err(GpuError::OutOfRange {
                offset: self.dst_offset as u64,
                end: end as u64,
                len: target.len() as u64,
            });
        }
        target[self.dst_offset..end].copy_from_slice(&bytes);
        Ok(true)
    }
}

/// A recorded sequence of GPU work submitted as a unit.
pub struct Chain {
    kind: ChainType,
    state: ChainState,
    device: Option<Device>,
    queue: Option<Arc<Queue>>,
    pass: Option<RenderPass>,
    window: Option<WindowId>,
    commands: Vec<Command>,
    rendering: bool,
    subpass: usize,
    render_extent: Extent2D,
    ticket: Option<Ticket>,
    retained: Vec<Retained>,
    /// Layouts recorded but not yet submitted, oldest first.
    pending_layouts: Vec<(Texture, ImageLayout)>,
}

impl Default for Chain {
    fn default() -> Self {
        Self::new()
    }
}

impl Chain {
    /// An unbound chain. Initialize it before recording.
    pub const fn new() -> Self {
        Self {
            kind: ChainType::Graphics,
            state: ChainState::Empty,
            device: None,
            queue: None,
            pass: None,
            window: None,
            commands: Vec::new(),
            rendering: false,
            subpass: 0,
            render_extent: Extent2D::new(0, 0),
            ticket: None,
            retained: Vec::new(),
            pending_layouts: Vec::new(),
        }
    }

    /// Bind to `device`'s queue for `kind` and start recording.
    pub fn initialize(&mut self, device: &Device, kind: ChainType) -> Result<()> {
        self.release()?;
        self.kind = kind;
        self.queue = Some(Arc::clone(device.queue(kind)));
        self.device = Some(device.clone());
        self.pass = None;
        self.window = None;
        self.state = ChainState::Recording;
        Ok(())
    }

    /// Bind to a render pass so draws render into its framebuffers.
    pub fn initialize_with_pass(&mut self, pass: &RenderPass, kind: ChainType) -> Result<()> {
        let device = pass
            .device()
            .ok_or_else(|| GpuError::InvalidState("render pass is not initialized".to_string()))?
            .clone();
        self.initialize(&device, kind)?;
        self.pass = Some(pass.clone());
        Ok(())
    }

    /// Bind to the graphics queue for work that ends up on `window`.
    pub fn initialize_for_window(&mut self, device: &Device, window: WindowId) -> Result<()> {
        if device.window(window).is_none() {
            return Err(GpuError::ResourceNotFound(format!(
                "window {}",
                window.index()
            )));
        }
        if !device.graphics_queue().supports(QueueCapabilities::PRESENT) {
            return Err(GpuError::Unsupported(format!(
                "device {} cannot present from its graphics queue",
                device.id()
            )));
        }
        self.initialize(device, ChainType::Graphics)?;
        self.window = Some(window);
        Ok(())
    }

    /// Bind to a window-backed render pass. Submitting leaves the
    /// swapchain image ready to present.
    pub fn initialize_with_pass_for_window(
        &mut self,
        pass: &RenderPass,
        window: WindowId,
    ) -> Result<()> {
        if pass.window() != Some(window) {
            return Err(GpuError::InvalidArgument(format!(
                "render pass does not present to window {}",
                window.index()
            )));
        }
        self.initialize_with_pass(pass, ChainType::Graphics)?;
        self.window = Some(window);
        Ok(())
    }

    /// Start recording again after [`reset`](Self::reset).
    pub fn begin(&mut self) -> Result<()> {
        if self.device.is_none() || self.state != ChainState::Empty {
            return Err(self.invalid_state("begin"));
        }
        self.state = ChainState::Recording;
        Ok(())
    }

    pub const fn kind(&self) -> ChainType {
        self.kind
    }

    pub const fn state(&self) -> ChainState {
        self.state
    }

    pub fn is_recording(&self) -> bool {
        self.state == ChainState::Recording
    }

    pub const fn device(&self) -> Option<&Device> {
        self.device.as_ref()
    }

    pub const fn pass(&self) -> Option<&RenderPass> {
        self.pass.as_ref()
    }

    pub const fn window(&self) -> Option<WindowId> {
        self.window
    }

    pub const fn subpass(&self) -> usize {
        self.subpass
    }

    /// Commands recorded since the last submit or reset.
    pub fn command_count(&self) -> usize {
        self.commands.len()
    }

    /// Copy `amount` elements between arrays.
    pub fn copy_array<T: Pod>(
        &mut self,
        src: &Array<T>,
        dst: &Array<T>,
        amount: usize,
        src_offset: u64,
        dst_offset: u64,
    ) -> Result<()> {
        self.ensure_recording("copy")?;
        let from = src.buffer()?;
        let to = dst.buffer()?;
        self.check_device(from.device())?;
        self.check_device(to.device())?;

        let size = elements(amount, src.len(), size_of::<T>())?;
        check_span(src_offset, size, from.size())?;
        check_span(dst_offset, size, to.size())?;
        if Arc::ptr_eq(&from, &to)
            && src_offset < dst_offset + size
            && dst_offset < src_offset + size
        {
            return Err(GpuError::InvalidArgument(
                "source and destination ranges overlap".to_string(),
            ));
        }

        self.end_rendering();
        self.commands.push(Command::CopyBuffer {
            src: from.handle(),
            dst: to.handle(),
            src_offset,
            dst_offset,
            size,
        });
        self.retained.push(Retained::Buffer(from));
        self.retained.push(Retained::Buffer(to));
        Ok(())
    }

    /// Copy `amount` elements of an array into whole rows of an image.
    /// The image must already be in a transfer-destination layout.
    pub fn copy_array_to_image<T: Pod>(
        &mut self,
        src: &Array<T>,
        dst: &impl AsTexture,
        amount: usize,
        src_offset: u64,
        dst_offset: u64,
    ) -> Result<()> {
        self.ensure_recording("copy")?;
        let from = src.buffer()?;
        let texture = texture_of(dst)?;
        self.check_device(from.device())?;
        self.check_device(texture.device())?;

        let size = elements(amount, src.len(), size_of::<T>())?;
        check_span(src_offset, size, from.size())?;
        let regions = row_regions(&texture, dst_offset, size)?;

        self.end_rendering();
        self.commands.push(Command::CopyBufferToImage {
            src: from.handle(),
            src_offset,
            dst: texture.handle(),
            format: texture.format(),
            layout: self.layout_of(&texture),
            regions,
        });
        self.retained.push(Retained::Buffer(from));
        self.retained.push(Retained::Texture(texture));
        Ok(())
    }

    /// Copy whole image rows into an array. `amount` counts array elements
    /// and defaults to the image size.
    pub fn copy_image_to_array<T: Pod>(
        &mut self,
        src: &impl AsTexture,
        dst: &Array<T>,
        amount: usize,
        src_offset: u64,
        dst_offset: u64,
    ) -> Result<()> {
        self.ensure_recording("copy")?;
        let texture = texture_of(src)?;
        let to = dst.buffer()?;
        self.check_device(texture.device())?;
        self.check_device(to.device())?;

        let whole = (texture.byte_size() / size_of::<T>() as u64) as usize;
        let size = elements(amount, whole, size_of::<T>())?;
        let regions = row_regions(&texture, src_offset, size)?;
        check_span(dst_offset, size, to.size())?;

        self.end_rendering();
        self.commands.push(Command::CopyImageToBuffer {
            src: texture.handle(),
            format: texture.format(),
            layout: self.layout_of(&texture),
            regions,
            dst: to.handle(),
            dst_offset,
        });
        self.retained.push(Retained::Texture(texture));
        self.retained.push(Retained::Buffer(to));
        Ok(())
    }

    /// Copy `amount` bytes of whole rows between images of the same format
    /// and width.
    pub fn copy_image(
        &mut self,
        src: &impl AsTexture,
        dst: &impl AsTexture,
        amount: u64,
        src_offset: u64,
        dst_offset: u64,
    ) -> Result<()> {
        self.ensure_recording("copy")?;
        let from = texture_of(src)?;
        let to = texture_of(dst)?;
        self.check_device(from.device())?;
        self.check_device(to.device())?;

        if from.format() != to.format() {
            return Err(GpuError::FormatMismatch {
                expected: to.format(),
                found: from.format(),
            });
        }
        if from.width() != to.width() {
            return Err(GpuError::InvalidArgument(format!(
                "image widths differ ({} and {})",
                from.width(),
                to.width()
            )));
        }
        if from.same(&to) {
            return Err(GpuError::InvalidArgument(
                "cannot copy an image onto itself".to_string(),
            ));
        }

        let size = if amount == 0 { from.byte_size() } else { amount };
        let src_regions = row_regions(&from, src_offset, size)?;
        let dst_regions = row_regions(&to, dst_offset, size)?;

        self.end_rendering();
        self.commands.push(Command::CopyImage {
            src: from.handle(),
            src_layout: self.layout_of(&from),
            src_regions,
            dst: to.handle(),
            dst_layout: self.layout_of(&to),
            dst_regions,
            format: from.format(),
        });
        self.retained.push(Retained::Texture(from));
        self.retained.push(Retained::Texture(to));
        Ok(())
    }

    /// Copy `amount` elements of host data into an array. The data is
    /// captured now; `src` may be reused immediately.
    pub fn copy_from_host<T: Pod>(
        &mut self,
        src: &[T],
        dst: &Array<T>,
        amount: usize,
        src_offset: u64,
        dst_offset: u64,
    ) -> Result<()> {
        self.ensure_recording("copy")?;
        let to = dst.buffer()?;
        self.check_device(to.device())?;

        let bytes: &[u8] = bytemuck::cast_slice(src);
        let size = elements(amount, src.len(), size_of::<T>())?;
        check_span(src_offset, size, bytes.len() as u64)?;
        check_span(dst_offset, size, to.size())?;

        self.end_rendering();
        let start = src_offset as usize;
        self.commands.push(Command::Upload {
            dst: to.handle(),
            dst_offset,
            data: bytes[start..start + size as usize].into(),
        });
        self.retained.push(Retained::Buffer(to));
        Ok(())
    }

    /// Copy `amount` elements of an array back to the host.
    ///
    /// The data arrives in the returned [`Readback`] once the chain has
    /// been submitted and synchronized.
    pub fn copy_to_host<T: Pod>(
        &mut self,
        src: &Array<T>,
        amount: usize,
        src_offset: u64,
        dst_offset: u64,
    ) -> Result<Readback<T>> {
        self.ensure_recording("copy")?;
        let from = src.buffer()?;
        self.check_device(from.device())?;

        let size = elements(amount, src.len(), size_of::<T>())?;
        check_span(src_offset, size, from.size())?;

        self.end_rendering();
        let slot = ReadbackSlot::new();
        self.commands.push(Command::Download {
            src: from.handle(),
            src_offset,
            size,
            slot: slot.clone(),
        });
        self.retained.push(Retained::Buffer(from));
        Ok(Readback {
            slot,
            dst_offset: dst_offset as usize,
            _marker: PhantomData,
        })
    }

    /// Record a layout transition. The image's layout tag follows once the
    /// chain is submitted; discarded work leaves it unchanged.
    pub fn transition(&mut self, image: &impl AsTexture, layout: ImageLayout) -> Result<()> {
        self.ensure_recording("transition")?;
        let texture = texture_of(image)?;
        self.check_device(texture.device())?;
        if layout == ImageLayout::Undefined {
            return Err(GpuError::InvalidArgument(
                "images cannot transition to Undefined".to_string(),
            ));
        }
        self.end_rendering();
        self.record_transition(&texture, layout);
        Ok(())
    }

    /// Draw `count` vertices starting at `first`. Zero draws every vertex.
    pub fn draw<V: Pod>(
        &mut self,
        renderer: &Renderer,
        vertices: &Array<V>,
        count: u32,
        first: u32,
    ) -> Result<()> {
        self.ensure_recording("draw")?;
        let pipeline = finalized(renderer)?;
        let vertex_buffer = vertices.buffer()?;
        self.check_device(vertex_buffer.device())?;
        self.begin_rendering()?;

        let count = if count == 0 {
            (vertices.len() as u32).saturating_sub(first)
        } else {
            count
        };
        self.commands.push(Command::Draw {
            pipeline: pipeline.handle(),
            extent: self.render_extent,
            viewports: renderer.viewports_for(self.render_extent),
            vertex_buffer: vertex_buffer.handle(),
            vertex_count: count,
            first_vertex: first,
        });
        self.retained.push(Retained::Buffer(vertex_buffer));
        self.retained.extend(renderer.retained());
        Ok(())
    }

    /// Draw `count` indices starting at `first`. Zero draws every index.
    pub fn draw_indexed<V: Pod, I: IndexElement>(
        &mut self,
        renderer: &Renderer,
        vertices: &Array<V>,
        indices: &Array<I>,
        count: u32,
        first: u32,
    ) -> Result<()> {
        self.ensure_recording("draw")?;
        let pipeline = finalized(renderer)?;
        let vertex_buffer = vertices.buffer()?;
        let index_buffer = indices.buffer()?;
        self.check_device(vertex_buffer.device())?;
        self.check_device(index_buffer.device())?;
        self.begin_rendering()?;

        let count = if count == 0 {
            (indices.len() as u32).saturating_sub(first)
        } else {
            count
        };
        self.commands.push(Command::DrawIndexed {
            pipeline: pipeline.handle(),
            extent: self.render_extent,
            viewports: renderer.viewports_for(self.render_extent),
            vertex_buffer: vertex_buffer.handle(),
            index_buffer: index_buffer.handle(),
            index_type: I::INDEX_TYPE,
            index_count: count,
            first_index: first,
        });
        self.retained.push(Retained::Buffer(vertex_buffer));
        self.retained.push(Retained::Buffer(index_buffer));
        self.retained.extend(renderer.retained());
        Ok(())
    }

    /// Record push constants for `target`'s pipeline at byte `offset`.
    pub fn push<T: Pod>(
        &mut self,
        target: &impl PipelineBinding,
        value: &T,
        offset: u32,
    ) -> Result<()> {
        self.ensure_recording("push")?;
        let pipeline = target.pipeline().cloned().ok_or_else(|| {
            GpuError::InvalidState("pipeline is not finalized".to_string())
        })?;
        self.check_device(pipeline.device())?;
        let data = bytemuck::bytes_of(value).to_vec();
        check_span(
            u64::from(offset),
            data.len() as u64,
            u64::from(pipeline.push_constant_size()),
        )?;

        if pipeline.is_compute() {
            self.end_rendering();
        }
        self.commands.push(Command::PushConstants {
            pipeline: pipeline.handle(),
            offset,
            data,
        });
        self.retained.push(Retained::Pipeline(pipeline));
        Ok(())
    }

    /// Record a compute dispatch of `x * y * z` workgroups.
    pub fn dispatch(&mut self, computer: &Computer, x: u32, y: u32, z: u32) -> Result<()> {
        self.ensure_recording("dispatch")?;
        let pipeline = computer.pipeline().cloned().ok_or_else(|| {
            GpuError::InvalidState("computer is not finalized".to_string())
        })?;
        self.check_device(pipeline.device())?;
        if !self.queue()?.supports(QueueCapabilities::COMPUTE) {
            return Err(GpuError::Unsupported(format!(
                "{:?} queue cannot run compute work",
                self.kind
            )));
        }

        self.end_rendering();
        self.commands.push(Command::Dispatch {
            pipeline: pipeline.handle(),
            groups: [x, y, z],
        });
        self.retained.extend(computer.retained());
        Ok(())
    }

    /// Move the following draws to the next subpass of the render pass.
    pub fn next_subpass(&mut self) -> Result<()> {
        self.ensure_recording("advance")?;
        let count = self
            .pass
            .as_ref()
            .ok_or_else(|| GpuError::InvalidState("chain has no render pass".to_string()))?
            .subpass_count();
        if self.subpass + 1 >= count {
            return Err(GpuError::InvalidState(format!(
                "render pass has only {count} subpass(es)"
            )));
        }
        self.end_rendering();
        self.subpass += 1;
        Ok(())
    }

    /// Append everything `child` has recorded so far.
    ///
    /// Both chains must be recording on the same device. The child is left
    /// untouched.
    pub fn combine(&mut self, child: &Self) -> Result<()> {
        self.ensure_recording("combine")?;
        child.ensure_recording("combine")?;
        if let (Some(ours), Some(theirs)) = (&self.device, &child.device) {
            if !ours.same(theirs) {
                return Err(GpuError::InvalidArgument(
                    "chains belong to different devices".to_string(),
                ));
            }
        }
        if child.rendering {
            return Err(GpuError::InvalidState(
                "child chain has an open rendering scope".to_string(),
            ));
        }
        self.end_rendering();
        self.commands.extend(child.commands.iter().cloned());
        self.retained.extend(child.retained.iter().cloned());
        self.pending_layouts
            .extend(child.pending_layouts.iter().cloned());
        Ok(())
    }

    /// Hand the recorded work to the queue.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn submit(&mut self) -> Result<()> {
        self.ensure_recording("submit")?;
        self.end_rendering();
        if let Some(pass) = self.pass.clone() {
            for (texture, layout) in pass.final_layouts()? {
                self.record_transition(&texture, layout);
            }
        }

        let queue = Arc::clone(self.queue()?);
        match queue.submit(&self.commands) {
            Ok(ticket) => {
                for (texture, layout) in self.pending_layouts.drain(..) {
                    texture.set_layout(layout);
                }
                self.ticket = Some(ticket);
                self.commands.clear();
                self.state = ChainState::Submitted;
                Ok(())
            }
            Err(err) => {
                self.commands.clear();
                self.pending_layouts.clear();
                self.retained.clear();
                self.state = ChainState::Empty;
                Err(err)
            }
        }
    }

    /// Block until submitted work has completed and fill readbacks.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn synchronize(&mut self) -> Result<()> {
        if let Some(ticket) = self.ticket.take() {
            self.queue()?.wait(ticket)?;
        }
        self.retained.clear();
        Ok(())
    }

    /// Wait for pending work and discard anything recorded. The chain
    /// stays bound and returns to `Empty`; call [`begin`](Self::begin) to
    /// record again.
    pub fn reset(&mut self) -> Result<()> {
        self.synchronize()?;
        self.commands.clear();
        self.pending_layouts.clear();
        self.rendering = false;
        self.subpass = 0;
        self.state = ChainState::Empty;
        Ok(())
    }

    fn release(&mut self) -> Result<()> {
        self.reset()?;
        self.device = None;
        self.queue = None;
        self.pass = None;
        self.window = None;
        Ok(())
    }

    fn queue(&self) -> Result<&Arc<Queue>> {
        self.queue
            .as_ref()
            .ok_or_else(|| GpuError::InvalidState("chain is not initialized".to_string()))
    }

    fn invalid_state(&self, operation: &'static str) -> GpuError {
        let err = GpuError::InvalidChainState {
            operation,
            kind: self.kind,
            state: self.state,
        };
        if let Some(device) = &self.device {
            device.report(&err);
        }
        err
    }

    fn ensure_recording(&self, operation: &'static str) -> Result<()> {
        if self.state == ChainState::Recording {
            Ok(())
        } else {
            Err(self.invalid_state(operation))
        }
    }

    fn check_device(&self, device: &Device) -> Result<()> {
        match &self.device {
            Some(ours) if ours.same(device) => Ok(()),
            _ => Err(GpuError::InvalidArgument(format!(
                "resource belongs to device {}, not this chain's",
                device.id()
            ))),
        }
    }

    /// The layout `texture` will be in when the recorded work reaches it.
    fn layout_of(&self, texture: &Texture) -> ImageLayout {
        self.pending_layouts
            .iter()
            .rev()
            .find(|(pending, _)| pending.same(texture))
            .map_or_else(|| texture.layout(), |(_, layout)| *layout)
    }

    fn record_transition(&mut self, texture: &Texture, layout: ImageLayout) {
        let old = self.layout_of(texture);
        if old == layout {
            return;
        }
        self.commands.push(Command::Transition {
            image: texture.handle(),
            format: texture.format(),
            old,
            new: layout,
            layers: texture.layers(),
            mip_levels: texture.desc().mip_levels,
        });
        self.pending_layouts.push((texture.clone(), layout));
        self.retained.push(Retained::Texture(texture.clone()));
    }

    fn begin_rendering(&mut self) -> Result<()> {
        if self.rendering {
            return Ok(());
        }
        if self.kind != ChainType::Graphics {
            return Err(GpuError::InvalidState(format!(
                "{:?} chains cannot draw",
                self.kind
            )));
        }
        let pass = self.pass.clone().ok_or_else(|| {
            GpuError::InvalidState("draws need a chain bound to a render pass".to_string())
        })?;
        let (targets, layouts) = pass.render_targets(self.subpass)?;
        for (texture, layout) in layouts {
            self.record_transition(&texture, layout);
        }
        self.render_extent = targets.extent;
        self.commands.push(Command::BeginRendering(targets));
        self.rendering = true;
        Ok(())
    }

    fn end_rendering(&mut self) {
        if self.rendering {
            self.commands.push(Command::EndRendering);
            self.rendering = false;
        }
    }
}

impl Drop for Chain {
    fn drop(&mut self) {
        if let Err(err) = self.synchronize() {
            tracing::warn!("Chain dropped with unfinished work: {err}");
        }
    }
}

impl fmt::Debug for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chain")
            .field("kind", &self.kind)
            .field("state", &self.state)
            .field("commands", &self.commands.len())
            .field("pass", &self.pass.is_some())
            .field("window", &self.window)
            .finish()
    }
}

/// Bytes covered by `amount` elements, or `default` elements when zero.
fn elements(amount: usize, default: usize, element_size: usize) -> Result<u64> {
    let count = if amount == 0 { default } else { amount };
    (count as u64)
        .checked_mul(element_size as u64)
        .ok_or(GpuError::OutOfRange {
            offset: 0,
            end: u64::MAX,
            len: count as u64,
        })
}

fn check_span(offset: u64, len: u64, size: u64) -> Result<()> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => Err(GpuError::OutOfRange {
            offset,
            end: offset.saturating_add(len),
            len: size,
        }),
    }
}

fn texture_of(image: &impl AsTexture) -> Result<Texture> {
    image
        .texture()
        .cloned()
        .ok_or_else(|| GpuError::InvalidState("image is not initialized".to_string()))
}

fn finalized(renderer: &Renderer) -> Result<Pipeline> {
    renderer
        .pipeline()
        .cloned()
        .ok_or_else(|| GpuError::InvalidState("renderer is not finalized".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::host::HostBackend;
    use crate::image::Image;
    use crate::render_pass::{Attachment, Subpass};
    use crate::window::{VirtualWindow, WindowRegistry};
    use nyx_core::format::Rgba8;
    use nyx_core::{ArrayFlags, ErrorChannel, ErrorCode, Report, Severity};
    use parking_lot::Mutex;

    struct Setup {
        device: Device,
        backend: Arc<HostBackend>,
        windows: Arc<WindowRegistry>,
        reports: Arc<Mutex<Vec<Report>>>,
    }

    fn setup() -> Setup {
        let reports = Arc::new(Mutex::new(Vec::new()));
        let errors = Arc::new(ErrorChannel::silent());
        let sink = Arc::clone(&reports);
        errors.set_callback(move |report| sink.lock().push(report.clone()));
        let backend = Arc::new(HostBackend::default());
        let windows = Arc::new(WindowRegistry::default());
        let device = Device::new(0, backend.clone(), errors, Arc::clone(&windows)).unwrap();
        Setup {
            device,
            backend,
            windows,
            reports,
        }
    }

    fn array(device: &Device, values: &[u32]) -> Array<u32> {
        let mut array = Array::new();
        array
            .initialize(device, values.len(), true, ArrayFlags::default())
            .unwrap();
        array.write_synced(0, values).unwrap();
        array
    }

    #[test]
    fn state_machine() {
        let s = setup();
        let mut chain = Chain::new();
        assert_eq!(chain.state(), ChainState::Empty);
        assert!(chain.begin().is_err());

        chain.initialize(&s.device, ChainType::Transfer).unwrap();
        assert_eq!(chain.state(), ChainState::Recording);
        chain.submit().unwrap();
        assert_eq!(chain.state(), ChainState::Submitted);
        chain.synchronize().unwrap();
        chain.reset().unwrap();
        assert_eq!(chain.state(), ChainState::Empty);
        chain.begin().unwrap();
        assert!(chain.is_recording());
    }

    #[test]
    fn double_submit_is_reported_fatal() {
        let s = setup();
        let mut chain = Chain::new();
        chain.initialize(&s.device, ChainType::Graphics).unwrap();
        chain.submit().unwrap();

        let err = chain.submit().unwrap_err();
        assert!(matches!(err, GpuError::InvalidChainState { operation: "submit", .. }));
        let reports = s.reports.lock();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].code, ErrorCode::InvalidChainState);
        assert_eq!(reports[0].severity, Severity::Fatal);
    }

    #[test]
    fn recording_after_submit_is_not_executed() {
        let s = setup();
        let src = array(&s.device, &[1, 2]);
        let dst = array(&s.device, &[0, 0]);
        let mut chain = Chain::new();
        chain.initialize(&s.device, ChainType::Transfer).unwrap();
        chain.submit().unwrap();

        assert!(chain.copy_array(&src, &dst, 0, 0, 0).is_err());
        assert_eq!(chain.command_count(), 0);
        chain.synchronize().unwrap();
        dst.sync_to_host().unwrap();
        assert_eq!(dst.to_vec(), vec![0, 0]);
    }

    #[test]
    fn copies_respect_amounts_and_offsets() {
        let s = setup();
        let src = array(&s.device, &[1, 2, 3, 4]);
        let dst = array(&s.device, &[0, 0, 0, 0]);

        let mut chain = Chain::new();
        chain.initialize(&s.device, ChainType::Transfer).unwrap();
        chain.copy_array(&src, &dst, 2, 8, 4).unwrap();
        chain.submit().unwrap();
        chain.synchronize().unwrap();

        dst.sync_to_host().unwrap();
        assert_eq!(dst.to_vec(), vec![0, 3, 4, 0]);
    }

    #[test]
    fn out_of_range_copies_are_rejected() {
        let s = setup();
        let src = array(&s.device, &[1, 2, 3, 4]);
        let dst = array(&s.device, &[0, 0]);
        let mut chain = Chain::new();
        chain.initialize(&s.device, ChainType::Transfer).unwrap();
        assert!(matches!(
            chain.copy_array(&src, &dst, 0, 0, 0),
            Err(GpuError::OutOfRange { .. })
        ));
        assert!(chain.copy_array(&src, &src, 2, 0, 4).is_err());
        assert!(chain.copy_array(&src, &src, 1, 0, 4).is_ok());
    }

    #[test]
    fn host_round_trip_through_readback() {
        let s = setup();
        let mut target = Array::<u32>::new();
        target
            .initialize(&s.device, 3, false, ArrayFlags::default())
            .unwrap();

        let mut chain = Chain::new();
        chain.initialize(&s.device, ChainType::Transfer).unwrap();
        chain.copy_from_host(&[7u32, 8, 9], &target, 0, 0, 0).unwrap();
        let readback = chain.copy_to_host(&target, 2, 4, 4).unwrap();
        chain.submit().unwrap();
        assert!(!readback.is_ready());
        chain.synchronize().unwrap();

        let mut out = [0u32; 3];
        assert!(readback.take_into(&mut out).unwrap());
        assert_eq!(out, [0, 8, 9]);
        assert!(!readback.take_into(&mut out).unwrap());
    }

    #[test]
    fn transitions_update_the_layout_tag() {
        let s = setup();
        let mut image = Image::<Rgba8>::new();
        image.initialize(&s.device, 2, 2, 1).unwrap();

        let mut chain = Chain::new();
        chain.initialize(&s.device, ChainType::Graphics).unwrap();
        image.transition(&mut chain, ImageLayout::TransferDst).unwrap();
        assert_eq!(image.layout(), ImageLayout::Undefined);
        image.transition(&mut chain, ImageLayout::TransferDst).unwrap();
        assert_eq!(chain.command_count(), 1);
        assert!(chain.transition(&image, ImageLayout::Undefined).is_err());
        chain.submit().unwrap();
        assert_eq!(image.layout(), ImageLayout::TransferDst);
        chain.synchronize().unwrap();
        assert_eq!(s.backend.stats().transitions, 1);
    }

    #[test]
    fn discarded_transitions_leave_the_tag_unchanged() {
        let s = setup();
        let mut image = Image::<Rgba8>::new();
        image.initialize(&s.device, 2, 2, 1).unwrap();

        let mut chain = Chain::new();
        chain.initialize(&s.device, ChainType::Graphics).unwrap();
        chain.transition(&image, ImageLayout::TransferDst).unwrap();
        chain.reset().unwrap();
        assert_eq!(image.layout(), ImageLayout::Undefined);

        chain.begin().unwrap();
        chain.transition(&image, ImageLayout::TransferDst).unwrap();
        assert_eq!(chain.command_count(), 1);
        chain.submit().unwrap();
        chain.synchronize().unwrap();
        assert_eq!(image.layout(), ImageLayout::TransferDst);
        assert_eq!(s.backend.stats().transitions, 1);
    }

    #[test]
    fn huge_amounts_are_out_of_range() {
        let s = setup();
        let src = array(&s.device, &[1, 2, 3, 4]);
        let dst = array(&s.device, &[0, 0, 0, 0]);
        let mut chain = Chain::new();
        chain.initialize(&s.device, ChainType::Transfer).unwrap();
        assert!(matches!(
            chain.copy_array(&src, &dst, usize::MAX / 2, 0, 0),
            Err(GpuError::OutOfRange { .. })
        ));
        assert!(matches!(
            chain.copy_to_host(&src, usize::MAX, 0, 0),
            Err(GpuError::OutOfRange { .. })
        ));
        assert_eq!(chain.command_count(), 0);
    }

    #[test]
    fn image_copy_requires_matching_width() {
        let s = setup();
        let mut a = Image::<Rgba8>::new();
        a.initialize(&s.device, 2, 2, 1).unwrap();
        let mut b = Image::<Rgba8>::new();
        b.initialize(&s.device, 4, 1, 1).unwrap();

        let mut chain = Chain::new();
        chain.initialize(&s.device, ChainType::Graphics).unwrap();
        assert!(chain.copy_image(&a, &b, 0, 0, 0).is_err());
        assert!(chain.copy_image(&a, &a, 0, 0, 0).is_err());
    }

    #[test]
    fn image_copy_moves_pixels_between_images() {
        let s = setup();
        let mut a = Image::<Rgba8>::new();
        a.initialize(&s.device, 2, 2, 1).unwrap();
        let mut b = Image::<Rgba8>::new();
        b.initialize(&s.device, 2, 2, 1).unwrap();
        let pixels = array(&s.device, &[1, 2, 3, 4]);
        let mut out = Array::<u32>::new();
        out.initialize(&s.device, 4, false, ArrayFlags::default())
            .unwrap();

        let mut chain = Chain::new();
        chain.initialize(&s.device, ChainType::Graphics).unwrap();
        chain.transition(&a, ImageLayout::TransferDst).unwrap();
        chain.copy_array_to_image(&pixels, &a, 0, 0, 0).unwrap();
        chain.transition(&a, ImageLayout::TransferSrc).unwrap();
        chain.transition(&b, ImageLayout::TransferDst).unwrap();
        // Second row of `a` lands on the first row of `b`.
        chain.copy_image(&a, &b, 8, 8, 0).unwrap();
        chain.transition(&b, ImageLayout::TransferSrc).unwrap();
        chain.copy_image_to_array(&b, &out, 0, 0, 0).unwrap();
        let readback = chain.copy_to_host(&out, 0, 0, 0).unwrap();
        chain.submit().unwrap();
        chain.synchronize().unwrap();

        assert_eq!(readback.take().unwrap(), vec![3, 4, 0, 0]);
        assert_eq!(b.layout(), ImageLayout::TransferSrc);
    }

    #[test]
    fn combined_chains_run_child_work() {
        let s = setup();
        let src = array(&s.device, &[5, 6]);
        let dst = array(&s.device, &[0, 0]);

        let mut child = Chain::new();
        child.initialize(&s.device, ChainType::Transfer).unwrap();
        child.copy_array(&src, &dst, 0, 0, 0).unwrap();

        let mut parent = Chain::new();
        parent.initialize(&s.device, ChainType::Transfer).unwrap();
        parent.combine(&child).unwrap();
        parent.submit().unwrap();
        parent.synchronize().unwrap();

        dst.sync_to_host().unwrap();
        assert_eq!(dst.to_vec(), vec![5, 6]);
        assert_eq!(child.command_count(), 1);
    }

    #[test]
    fn draws_need_a_render_pass() {
        let s = setup();
        let renderer = Renderer::new();
        let vertices = array(&s.device, &[0, 0, 0]);
        let mut chain = Chain::new();
        chain.initialize(&s.device, ChainType::Graphics).unwrap();
        assert!(chain.draw(&renderer, &vertices, 0, 0).is_err());
    }

    #[test]
    fn failed_submissions_leave_the_chain_empty() {
        let s = setup();
        let mut image = Image::<Rgba8>::new();
        image.initialize(&s.device, 2, 2, 1).unwrap();
        let pixels = array(&s.device, &[0xff; 4]);

        let mut chain = Chain::new();
        chain.initialize(&s.device, ChainType::Graphics).unwrap();
        // Still Undefined: the backend rejects the copy.
        chain.copy_array_to_image(&pixels, &image, 0, 0, 0).unwrap();
        assert!(chain.submit().is_err());
        assert_eq!(chain.state(), ChainState::Empty);
        chain.begin().unwrap();
    }

    #[test]
    fn failed_submissions_keep_earlier_layouts() {
        let s = setup();
        let mut image = Image::<Rgba8>::new();
        image.initialize(&s.device, 2, 2, 1).unwrap();
        let mut other = Image::<Rgba8>::new();
        other.initialize(&s.device, 2, 2, 1).unwrap();
        let pixels = array(&s.device, &[0xff; 4]);

        let mut chain = Chain::new();
        chain.initialize(&s.device, ChainType::Graphics).unwrap();
        chain.transition(&image, ImageLayout::TransferDst).unwrap();
        chain.copy_array_to_image(&pixels, &other, 0, 0, 0).unwrap();
        assert!(chain.submit().is_err());
        assert_eq!(image.layout(), ImageLayout::Undefined);

        chain.begin().unwrap();
        chain.transition(&image, ImageLayout::TransferDst).unwrap();
        chain.copy_array_to_image(&pixels, &image, 0, 0, 0).unwrap();
        chain.submit().unwrap();
        chain.synchronize().unwrap();
        assert_eq!(image.layout(), ImageLayout::TransferDst);
    }

    #[test]
    fn window_chains_bind_the_graphics_queue() {
        let s = setup();
        let id = s.windows.register(Arc::new(VirtualWindow::new(8, 4)));

        let mut chain = Chain::new();
        chain.initialize_for_window(&s.device, id).unwrap();
        assert_eq!(chain.kind(), ChainType::Graphics);
        assert_eq!(chain.window(), Some(id));
        assert!(chain.is_recording());
        chain.submit().unwrap();
        chain.synchronize().unwrap();
        assert_eq!(s.backend.stats().submissions, 1);

        assert!(matches!(
            Chain::new().initialize_for_window(&s.device, WindowId(99)),
            Err(GpuError::ResourceNotFound(_))
        ));
    }

    #[test]
    fn window_pass_chains_leave_the_image_presentable() {
        let s = setup();
        let id = s.windows.register(Arc::new(VirtualWindow::new(8, 4)));
        let mut pass = RenderPass::new();
        pass.initialize_for_window(&s.device, id).unwrap();

        let mut chain = Chain::new();
        chain.initialize_with_pass_for_window(&pass, id).unwrap();
        assert_eq!(chain.window(), Some(id));
        assert!(chain.pass().is_some());
        chain.submit().unwrap();
        chain.synchronize().unwrap();

        let image = pass.attachment(0, 0).unwrap();
        assert_eq!(image.layout(), ImageLayout::PresentSrc);
        assert!(!pass.present().unwrap());
        assert_eq!(s.backend.stats().presents, 1);

        let mut offscreen = RenderPass::new();
        offscreen.add_subpass(Subpass::new().with_attachment(Attachment::default()));
        offscreen.set_dimensions(4, 4);
        offscreen.initialize(&s.device).unwrap();
        assert!(Chain::new()
            .initialize_with_pass_for_window(&offscreen, id)
            .is_err());
    }
}
