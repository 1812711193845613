//! Pipelines and the resources bound to them.

use crate::array::Array;
use crate::backend::{BindingDesc, BindingKind, PipelineDesc, PipelineHandle, PipelineKind, Resource, ShaderSource};
use crate::chain::Retained;
use crate::device::Device;
use crate::error::{GpuError, Result};
use crate::image::Texture;
use bytemuck::Pod;
use nyx_core::{ArrayFlags, ImageLayout, ImageUsage};
use std::collections::BTreeMap;
use std::sync::Arc;

struct PipelineInner {
    device: Device,
    handle: PipelineHandle,
    push_constant_size: u32,
    compute: bool,
}

impl Drop for PipelineInner {
    fn drop(&mut self) {
        self.device.backend().destroy_pipeline(self.handle);
    }
}

/// A created pipeline. Clones share it.
#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<PipelineInner>,
}

impl Pipeline {
    fn create(device: &Device, desc: &PipelineDesc) -> Result<Self> {
        let handle = device.backend().create_pipeline(desc)?;
        tracing::debug!(
            "Created {} pipeline with {} binding(s)",
            if desc.is_compute() { "compute" } else { "graphics" },
            desc.bindings.len()
        );
        Ok(Self {
            inner: Arc::new(PipelineInner {
                device: device.clone(),
                handle,
                push_constant_size: desc.push_constant_size,
                compute: desc.is_compute(),
            }),
        })
    }

    pub fn handle(&self) -> PipelineHandle {
        self.inner.handle
    }

    pub fn push_constant_size(&self) -> u32 {
        self.inner.push_constant_size
    }

    pub fn is_compute(&self) -> bool {
        self.inner.compute
    }

    pub fn device(&self) -> &Device {
        &self.inner.device
    }
}

/// Something with a pipeline that push constants can target.
pub trait PipelineBinding {
    /// `None` until finalized.
    fn pipeline(&self) -> Option<&Pipeline>;
}

/// Shaders, binding slots and the resources bound to them.
///
/// Shared by the renderer and the computer. Bindings made before the
/// pipeline exists are applied when it is created.
pub(crate) struct Program {
    device: Option<Device>,
    shaders: Vec<ShaderSource>,
    descs: Vec<BindingDesc>,
    bound: BTreeMap<u32, (Resource, Retained)>,
    push_constant_size: u32,
    pipeline: Option<Pipeline>,
}

impl Program {
    pub(crate) const fn new() -> Self {
        Self {
            device: None,
            shaders: Vec::new(),
            descs: Vec::new(),
            bound: BTreeMap::new(),
            push_constant_size: 0,
            pipeline: None,
        }
    }

    pub(crate) fn initialize(
        &mut self,
        device: &Device,
        shaders: Vec<ShaderSource>,
        bindings: Vec<BindingDesc>,
    ) -> Result<()> {
        for (i, binding) in bindings.iter().enumerate() {
            if let Some(other) = bindings[..i]
                .iter()
                .find(|b| b.binding == binding.binding || b.name == binding.name)
            {
                return Err(GpuError::InvalidArgument(format!(
                    "bindings '{}' and '{}' collide",
                    other.name, binding.name
                )));
            }
        }
        self.reset();
        self.device = Some(device.clone());
        self.shaders = shaders;
        self.descs = bindings;
        Ok(())
    }

    pub(crate) fn reset(&mut self) {
        *self = Self::new();
    }

    pub(crate) fn device(&self) -> Result<&Device> {
        self.device
            .as_ref()
            .ok_or_else(|| GpuError::InvalidState("program is not initialized".to_string()))
    }

    pub(crate) fn shaders(&self) -> &[ShaderSource] {
        &self.shaders
    }

    pub(crate) fn set_push_constant_size(&mut self, size: u32) {
        self.push_constant_size = size;
    }

    pub(crate) const fn pipeline(&self) -> Option<&Pipeline> {
        self.pipeline.as_ref()
    }

    pub(crate) fn bind_array<T: Pod>(&mut self, name: &str, array: &Array<T>) -> Result<()> {
        let buffer = array.buffer()?;
        self.check_device(buffer.device())?;
        let desc = self.find(name)?;
        let required = match desc.kind {
            BindingKind::UniformBuffer => ArrayFlags::UNIFORM,
            BindingKind::StorageBuffer => ArrayFlags::STORAGE,
            kind => {
                return Err(GpuError::InvalidArgument(format!(
                    "binding '{name}' expects {kind:?}, got an array"
                )))
            }
        };
        if !buffer.usage().contains(required) {
            return Err(GpuError::InvalidArgument(format!(
                "array bound to '{name}' lacks {required:?} usage"
            )));
        }
        let resource = Resource::Buffer {
            buffer: buffer.handle(),
            offset: 0,
            range: buffer.size(),
        };
        self.apply(desc.binding, resource, Retained::Buffer(buffer))
    }

    pub(crate) fn bind_texture(&mut self, name: &str, texture: &Texture) -> Result<()> {
        self.check_device(texture.device())?;
        let desc = self.find(name)?;
        let (required, layout) = match desc.kind {
            BindingKind::SampledImage => (ImageUsage::SAMPLED, ImageLayout::ShaderRead),
            BindingKind::StorageImage => (ImageUsage::STORAGE, ImageLayout::General),
            kind => {
                return Err(GpuError::InvalidArgument(format!(
                    "binding '{name}' expects {kind:?}, got an image"
                )))
            }
        };
        if !texture.desc().usage.contains(required) {
            return Err(GpuError::InvalidArgument(format!(
                "image bound to '{name}' lacks {required:?} usage"
            )));
        }
        let resource = Resource::Image {
            image: texture.handle(),
            layout,
        };
        self.apply(desc.binding, resource, Retained::Texture(texture.clone()))
    }

    /// Create (or recreate) the pipeline and apply every binding made so far.
    pub(crate) fn finalize(&mut self, kind: PipelineKind) -> Result<()> {
        let device = self.device()?.clone();
        let desc = PipelineDesc {
            kind,
            shaders: self.shaders.clone(),
            bindings: self.descs.clone(),
            push_constant_size: self.push_constant_size,
        };
        self.pipeline = None;
        let pipeline = Pipeline::create(&device, &desc)?;
        let bindings: Vec<_> = self.bound.iter().map(|(slot, (r, _))| (*slot, *r)).collect();
        if !bindings.is_empty() {
            device.backend().update_bindings(pipeline.handle(), &bindings)?;
        }
        self.pipeline = Some(pipeline);
        Ok(())
    }

    /// Everything a submission using this program must keep alive.
    pub(crate) fn retained(&self) -> impl Iterator<Item = Retained> + '_ {
        self.bound
            .values()
            .map(|(_, retained)| retained.clone())
            .chain(self.pipeline.clone().map(Retained::Pipeline))
    }

    fn find(&self, name: &str) -> Result<BindingDesc> {
        self.device()?;
        self.descs
            .iter()
            .find(|b| b.name == name)
            .cloned()
            .ok_or_else(|| GpuError::ResourceNotFound(format!("binding '{name}'")))
    }

    fn check_device(&self, device: &Device) -> Result<()> {
        if self.device()?.same(device) {
            Ok(())
        } else {
            Err(GpuError::InvalidArgument(format!(
                "resource belongs to device {}",
                device.id()
            )))
        }
    }

    fn apply(&mut self, slot: u32, resource: Resource, retained: Retained) -> Result<()> {
        if let Some(pipeline) = &self.pipeline {
            pipeline
                .device()
                .backend()
                .update_bindings(pipeline.handle(), &[(slot, resource)])?;
        }
        self.bound.insert(slot, (resource, retained));
        Ok(())
    }
}
