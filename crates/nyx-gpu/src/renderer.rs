//! Graphics pipelines bound to render passes.

use crate::array::Array;
use crate::backend::{BindingDesc, PipelineKind, ShaderSource, VertexLayout, Viewport};
use crate::binding::{Pipeline, PipelineBinding, Program};
use crate::chain::Retained;
use crate::device::Device;
use crate::error::{GpuError, Result};
use crate::image::AsTexture;
use crate::render_pass::RenderPass;
use bytemuck::Pod;
use nyx_core::{Extent2D, ImageFormat, PipelineStage};
use std::fmt;

/// Shaders, vertex input and bindings for drawing into a render pass.
///
/// Bindings may be made before or after [`finalize`](Self::finalize).
/// Changing the vertex layout or push constant size takes effect at the
/// next finalize.
pub struct Renderer {
    program: Program,
    vertex_layout: Option<VertexLayout>,
    viewports: Vec<Viewport>,
    dimensions: Option<Extent2D>,
}

impl Default for Renderer {
    fn default() -> Self {
        Self::new()
    }
}

impl Renderer {
    pub const fn new() -> Self {
        Self {
            program: Program::new(),
            vertex_layout: None,
            viewports: Vec::new(),
            dimensions: None,
        }
    }

    /// Set shaders and binding slots. A vertex shader is required.
    pub fn initialize(
        &mut self,
        device: &Device,
        shaders: Vec<ShaderSource>,
        bindings: Vec<BindingDesc>,
    ) -> Result<()> {
        if !shaders.iter().any(|s| s.stage == PipelineStage::Vertex) {
            return Err(GpuError::InvalidArgument(
                "a renderer needs a vertex shader".to_string(),
            ));
        }
        if shaders.iter().any(|s| s.stage == PipelineStage::Compute) {
            return Err(GpuError::InvalidArgument(
                "compute shaders belong to a computer".to_string(),
            ));
        }
        self.program.initialize(device, shaders, bindings)?;
        self.vertex_layout = None;
        self.viewports.clear();
        self.dimensions = None;
        Ok(())
    }

    pub fn set_vertex_layout(&mut self, layout: VertexLayout) {
        self.vertex_layout = Some(layout);
    }

    pub fn set_push_constant_size(&mut self, size: u32) {
        self.program.set_push_constant_size(size);
    }

    pub fn add_viewport(&mut self, viewport: Viewport) {
        self.viewports.push(viewport);
    }

    pub fn viewports(&self) -> &[Viewport] {
        &self.viewports
    }

    /// Size of the default viewport. Unset means the render area.
    pub fn set_dimensions(&mut self, width: u32, height: u32) {
        self.dimensions = Some(Extent2D::new(width, height));
    }

    pub fn device(&self) -> Option<&Device> {
        self.program.device().ok()
    }

    pub fn shaders(&self) -> &[ShaderSource] {
        self.program.shaders()
    }

    /// Bind an array to a uniform or storage buffer slot.
    pub fn bind<T: Pod>(&mut self, name: &str, array: &Array<T>) -> Result<()> {
        self.program.bind_array(name, array)
    }

    /// Bind an image to a sampled or storage image slot.
    pub fn bind_image(&mut self, name: &str, image: &impl AsTexture) -> Result<()> {
        let texture = image
            .texture()
            .ok_or_else(|| GpuError::InvalidState("image is not initialized".to_string()))?;
        self.program.bind_texture(name, texture)
    }

    /// Create the pipeline for the first subpass of `pass`.
    pub fn finalize(&mut self, pass: &RenderPass) -> Result<()> {
        self.finalize_for_subpass(pass, 0)
    }

    pub fn finalize_for_subpass(&mut self, pass: &RenderPass, subpass: usize) -> Result<()> {
        if subpass >= pass.subpass_count() {
            return Err(GpuError::InvalidArgument(format!(
                "render pass has no subpass {subpass}"
            )));
        }
        if let (Some(ours), Some(theirs)) = (self.device(), pass.device()) {
            if !ours.same(theirs) {
                return Err(GpuError::InvalidArgument(
                    "render pass belongs to another device".to_string(),
                ));
            }
        }
        let kind = PipelineKind::Graphics {
            vertex_layout: self.vertex_layout.clone(),
            color_formats: pass.color_formats(subpass),
            depth_format: pass.has_depth(subpass).then_some(ImageFormat::D32F),
        };
        self.program.finalize(kind)
    }

    pub const fn is_finalized(&self) -> bool {
        self.program.pipeline().is_some()
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub(crate) fn retained(&self) -> impl Iterator<Item = Retained> + '_ {
        self.program.retained()
    }

    /// Viewports for drawing into a render area of `extent`.
    pub(crate) fn viewports_for(&self, extent: Extent2D) -> Vec<Viewport> {
        if !self.viewports.is_empty() {
            return self.viewports.clone();
        }
        let size = self.dimensions.unwrap_or(extent);
        vec![Viewport::new(0.0, 0.0, size.width as f32, size.height as f32)]
    }
}

impl PipelineBinding for Renderer {
    fn pipeline(&self) -> Option<&Pipeline> {
        self.program.pipeline()
    }
}

impl fmt::Debug for Renderer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Renderer")
            .field("shaders", &self.program.shaders().len())
            .field("viewports", &self.viewports)
            .field("finalized", &self.is_finalized())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::host::HostBackend;
    use crate::backend::{BindingKind, VertexAttribute, VertexFormat};
    use crate::chain::Chain;
    use crate::render_pass::{Attachment, Subpass};
    use crate::window::WindowRegistry;
    use nyx_core::format::Rgba8;
    use nyx_core::{ArrayFlags, ChainType, ErrorChannel, ImageLayout, ShaderStages};
    use std::sync::Arc;

    fn device() -> (Device, Arc<HostBackend>) {
        let backend = Arc::new(HostBackend::default());
        let device = Device::new(
            0,
            backend.clone(),
            Arc::new(ErrorChannel::silent()),
            Arc::new(WindowRegistry::default()),
        )
        .unwrap();
        (device, backend)
    }

    fn shaders() -> Vec<ShaderSource> {
        vec![
            ShaderSource::new(PipelineStage::Vertex, vec![0x0723_0203]),
            ShaderSource::new(PipelineStage::Fragment, vec![0x0723_0203]),
        ]
    }

    fn offscreen(device: &Device) -> RenderPass {
        let mut pass = RenderPass::new();
        pass.add_subpass(Subpass::new().with_attachment(
            Attachment::new(ImageFormat::Rgba8).with_layout(ImageLayout::TransferSrc),
        ));
        pass.set_dimensions(4, 4);
        pass.initialize(device).unwrap();
        pass
    }

    #[test]
    fn requires_a_vertex_stage() {
        let (device, _) = device();
        let mut renderer = Renderer::new();
        let fragment_only = vec![ShaderSource::new(PipelineStage::Fragment, vec![0x0723_0203])];
        assert!(renderer.initialize(&device, fragment_only, Vec::new()).is_err());
        assert!(renderer.initialize(&device, shaders(), Vec::new()).is_ok());
    }

    #[test]
    fn default_viewport_covers_render_area() {
        let mut renderer = Renderer::new();
        let area = Extent2D::new(640, 480);
        assert_eq!(
            renderer.viewports_for(area),
            vec![Viewport::new(0.0, 0.0, 640.0, 480.0)]
        );
        renderer.set_dimensions(320, 240);
        assert_eq!(renderer.viewports_for(area)[0].width, 320.0);
        renderer.add_viewport(Viewport::new(1.0, 2.0, 3.0, 4.0).with_max_depth(0.5));
        assert_eq!(renderer.viewports_for(area)[0].max_depth, 0.5);
    }

    #[test]
    fn draws_into_an_offscreen_pass() {
        let (device, backend) = device();
        let pass = offscreen(&device);

        let mut uniforms = Array::<[f32; 4]>::new();
        uniforms
            .initialize(&device, 1, true, ArrayFlags::default() | ArrayFlags::UNIFORM)
            .unwrap();
        let mut renderer = Renderer::new();
        renderer
            .initialize(
                &device,
                shaders(),
                vec![BindingDesc::new(
                    "globals",
                    0,
                    BindingKind::UniformBuffer,
                    ShaderStages::VERTEX,
                )],
            )
            .unwrap();
        renderer.bind("globals", &uniforms).unwrap();
        renderer.set_vertex_layout(VertexLayout {
            stride: 8,
            attributes: vec![VertexAttribute {
                location: 0,
                format: VertexFormat::Float2,
                offset: 0,
            }],
        });
        renderer.set_push_constant_size(16);
        renderer.finalize(&pass).unwrap();
        assert!(renderer.is_finalized());

        let mut vertices = Array::<[f32; 2]>::new();
        vertices
            .initialize(&device, 3, true, ArrayFlags::default() | ArrayFlags::VERTEX)
            .unwrap();

        let mut chain = Chain::new();
        chain.initialize_with_pass(&pass, ChainType::Graphics).unwrap();
        chain.push(&renderer, &[1.0f32, 0.0, 0.0, 1.0], 0).unwrap();
        chain.draw(&renderer, &vertices, 0, 0).unwrap();
        chain.submit().unwrap();
        chain.synchronize().unwrap();

        assert_eq!(backend.stats().draws, 1);
        let target = pass.attachment(0, 0).unwrap();
        assert_eq!(target.layout(), ImageLayout::TransferSrc);
    }

    #[test]
    fn indexed_draws_into_an_offscreen_pass() {
        let (device, backend) = device();
        let pass = offscreen(&device);
        let mut renderer = Renderer::new();
        renderer.initialize(&device, shaders(), Vec::new()).unwrap();
        renderer.set_vertex_layout(VertexLayout {
            stride: 8,
            attributes: vec![VertexAttribute {
                location: 0,
                format: VertexFormat::Float2,
                offset: 0,
            }],
        });
        renderer.finalize(&pass).unwrap();

        let mut vertices = Array::<[f32; 2]>::new();
        vertices
            .initialize(&device, 4, true, ArrayFlags::default() | ArrayFlags::VERTEX)
            .unwrap();
        let mut indices = Array::<u16>::new();
        indices
            .initialize(&device, 6, true, ArrayFlags::default() | ArrayFlags::INDEX)
            .unwrap();
        indices.write_synced(0, &[0, 1, 2, 2, 3, 0]).unwrap();

        let mut chain = Chain::new();
        chain.initialize_with_pass(&pass, ChainType::Graphics).unwrap();
        chain.draw_indexed(&renderer, &vertices, &indices, 0, 0).unwrap();
        chain.draw_indexed(&renderer, &vertices, &indices, 3, 3).unwrap();
        chain.submit().unwrap();
        chain.synchronize().unwrap();

        assert_eq!(backend.stats().draws, 2);
        assert_eq!(
            pass.attachment(0, 0).unwrap().layout(),
            ImageLayout::TransferSrc
        );
    }

    #[test]
    fn bind_checks_kind_and_usage() {
        let (device, _) = device();
        let mut renderer = Renderer::new();
        renderer
            .initialize(
                &device,
                shaders(),
                vec![
                    BindingDesc::new("data", 0, BindingKind::StorageBuffer, ShaderStages::FRAGMENT),
                    BindingDesc::new("tex", 1, BindingKind::SampledImage, ShaderStages::FRAGMENT),
                ],
            )
            .unwrap();

        let mut plain = Array::<u32>::new();
        plain.initialize(&device, 4, false, ArrayFlags::default()).unwrap();
        assert!(renderer.bind("data", &plain).is_err());
        assert!(renderer.bind("tex", &plain).is_err());
        assert!(renderer.bind("missing", &plain).is_err());

        let mut image = crate::image::Image::<Rgba8>::new();
        image.initialize(&device, 2, 2, 1).unwrap();
        assert!(renderer.bind_image("tex", &image).is_ok());
        assert!(renderer.bind_image("data", &image).is_err());
    }
}
