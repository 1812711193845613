//! Compute pipelines.

use crate::array::Array;
use crate::backend::{BindingDesc, PipelineKind, ShaderSource};
use crate::binding::{Pipeline, PipelineBinding, Program};
use crate::chain::{Chain, Retained};
use crate::device::Device;
use crate::error::{GpuError, Result};
use crate::image::AsTexture;
use bytemuck::Pod;
use nyx_core::PipelineStage;
use std::fmt;

/// A compute shader with its bound resources.
pub struct Computer {
    program: Program,
}

impl Default for Computer {
    fn default() -> Self {
        Self::new()
    }
}

impl Computer {
    pub const fn new() -> Self {
        Self {
            program: Program::new(),
        }
    }

    pub fn initialize(
        &mut self,
        device: &Device,
        shader: ShaderSource,
        bindings: Vec<BindingDesc>,
    ) -> Result<()> {
        if shader.stage != PipelineStage::Compute {
            return Err(GpuError::InvalidArgument(format!(
                "expected a compute shader, got {:?}",
                shader.stage
            )));
        }
        self.program.initialize(device, vec![shader], bindings)
    }

    pub fn set_push_constant_size(&mut self, size: u32) {
        self.program.set_push_constant_size(size);
    }

    pub fn device(&self) -> Option<&Device> {
        self.program.device().ok()
    }

    pub fn bind<T: Pod>(&mut self, name: &str, array: &Array<T>) -> Result<()> {
        self.program.bind_array(name, array)
    }

    pub fn bind_image(&mut self, name: &str, image: &impl AsTexture) -> Result<()> {
        let texture = image
            .texture()
            .ok_or_else(|| GpuError::InvalidState("image is not initialized".to_string()))?;
        self.program.bind_texture(name, texture)
    }

    pub fn finalize(&mut self) -> Result<()> {
        self.program.finalize(PipelineKind::Compute)
    }

    pub const fn is_finalized(&self) -> bool {
        self.program.pipeline().is_some()
    }

    /// Record a dispatch of `x * y * z` workgroups into `chain`.
    pub fn dispatch(&self, chain: &mut Chain, x: u32, y: u32, z: u32) -> Result<()> {
        chain.dispatch(self, x, y, z)
    }

    pub fn reset(&mut self) {
        self.program.reset();
    }

    pub(crate) fn retained(&self) -> impl Iterator<Item = Retained> + '_ {
        self.program.retained()
    }
}

impl PipelineBinding for Computer {
    fn pipeline(&self) -> Option<&Pipeline> {
        self.program.pipeline()
    }
}

impl fmt::Debug for Computer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Computer")
            .field("finalized", &self.is_finalized())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::host::HostBackend;
    use crate::backend::BindingKind;
    use crate::window::WindowRegistry;
    use nyx_core::{ArrayFlags, ChainType, ErrorChannel, ShaderStages};
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

    fn shader() -> ShaderSource {
        ShaderSource::new(PipelineStage::Compute, vec![0x0723_0203])
    }

    #[test]
    fn rejects_non_compute_shaders() {
        let (device, _) = device();
        let mut computer = Computer::new();
        let vertex = ShaderSource::new(PipelineStage::Vertex, vec![0x0723_0203]);
        assert!(computer.initialize(&device, vertex, Vec::new()).is_err());
    }

    #[test]
    fn dispatch_needs_finalize_and_bindings() {
        let (device, backend) = device();
        let mut data = Array::<u32>::new();
        data.initialize(&device, 64, false, ArrayFlags::default() | ArrayFlags::STORAGE)
            .unwrap();

        let mut computer = Computer::new();
        computer
            .initialize(
                &device,
                shader(),
                vec![BindingDesc::new(
                    "data",
                    0,
                    BindingKind::StorageBuffer,
                    ShaderStages::COMPUTE,
                )],
            )
            .unwrap();

        let mut chain = Chain::new();
        chain.initialize(&device, ChainType::Compute).unwrap();
        assert!(computer.dispatch(&mut chain, 1, 1, 1).is_err());

        computer.finalize().unwrap();
        computer.bind("data", &data).unwrap();
        computer.set_push_constant_size(4);
        computer.finalize().unwrap();
        chain.push(&computer, &7u32, 0).unwrap();
        computer.dispatch(&mut chain, 8, 1, 1).unwrap();
        chain.submit().unwrap();
        chain.synchronize().unwrap();
        assert_eq!(backend.stats().dispatches, 1);
    }

    #[test]
    fn unbound_slots_fail_at_submit() {
        let (device, _) = device();
        let mut computer = Computer::new();
        computer
            .initialize(
                &device,
                shader(),
                vec![BindingDesc::new(
                    "data",
                    0,
                    BindingKind::StorageBuffer,
                    ShaderStages::COMPUTE,
                )],
            )
            .unwrap();
        computer.finalize().unwrap();

        let mut chain = Chain::new();
        chain.initialize(&device, ChainType::Compute).unwrap();
        computer.dispatch(&mut chain, 1, 1, 1).unwrap();
        assert!(chain.submit().is_err());
    }
}
