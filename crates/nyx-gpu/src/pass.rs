//! Chain factory bound to one device.

use crate::chain::Chain;
use crate::device::Device;
use crate::error::{GpuError, Result};
use nyx_core::ChainType;

/// Hands out chains for a device.
#[derive(Debug, Default, Clone)]
pub struct Pass {
    device: Option<Device>,
}

impl Pass {
    pub const fn new() -> Self {
        Self { device: None }
    }

    pub fn initialize(&mut self, device: &Device) {
        self.device = Some(device.clone());
    }

    pub const fn device(&self) -> Option<&Device> {
        self.device.as_ref()
    }

    /// A new chain of `kind`, already recording.
    pub fn make_chain(&self, kind: ChainType) -> Result<Chain> {
        let device = self
            .device
            .as_ref()
            .ok_or_else(|| GpuError::InvalidState("pass is not initialized".to_string()))?;
        let mut chain = Chain::new();
        chain.initialize(device, kind)?;
        Ok(chain)
    }

    pub fn reset(&mut self) {
        self.device = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::host::HostBackend;
    use crate::error::ChainState;
    use crate::window::WindowRegistry;
    use nyx_core::ErrorChannel;
    use std::sync::Arc;

    #[test]
    fn makes_recording_chains() {
        let mut pass = Pass::new();
        assert!(pass.make_chain(ChainType::Graphics).is_err());

        let device = Device::new(
            0,
            Arc::new(HostBackend::default()),
            Arc::new(ErrorChannel::silent()),
            Arc::new(WindowRegistry::default()),
        )
        .unwrap();
        pass.initialize(&device);
        let chain = pass.make_chain(ChainType::Compute).unwrap();
        assert_eq!(chain.state(), ChainState::Recording);
        assert_eq!(chain.kind(), ChainType::Compute);
        assert!(chain.device().unwrap().same(&device));

        pass.reset();
        assert!(pass.device().is_none());
    }
}
