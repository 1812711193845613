//! Logical devices.

use crate::backend::{select_queue_families, Backend, DeviceInfo, MemoryType, QueueSelection};
use crate::error::{GpuError, Result};
use crate::memory::select_memory_type;
use crate::queue::Queue;
use crate::window::{WindowId, WindowRegistry, WindowSource};
use nyx_core::{ChainType, ErrorChannel, MemoryFlags, Severity};
use std::fmt;
use std::sync::Arc;

/// Capability to construct a [`Queue`]. Only this module can create one.
pub struct QueueToken {
    _private: (),
}

struct DeviceShared {
    id: u32,
    backend: Arc<dyn Backend>,
    errors: Arc<ErrorChannel>,
    windows: Arc<WindowRegistry>,
    queues: Vec<Arc<Queue>>,
    selection: QueueSelection,
}

impl Drop for DeviceShared {
    fn drop(&mut self) {
        for queue in &self.queues {
            if let Err(err) = queue.wait_idle() {
                tracing::warn!("Device {} did not go idle on drop: {err}", self.id);
            }
        }
    }
}

/// Handle to one GPU and its queues.
///
/// Cloning is cheap; every resource keeps its device alive.
#[derive(Clone)]
pub struct Device {
    shared: Arc<DeviceShared>,
}

impl Device {
    pub(crate) fn new(
        id: u32,
        backend: Arc<dyn Backend>,
        errors: Arc<ErrorChannel>,
        windows: Arc<WindowRegistry>,
    ) -> Result<Self> {
        let families = backend.queue_families().to_vec();
        let selection = select_queue_families(&families).ok_or(GpuError::NoSuitableDevice)?;

        let token = QueueToken { _private: () };
        let mut queues = Vec::new();
        for family in &families {
            let used = [selection.graphics, selection.compute, selection.transfer]
                .contains(&family.index);
            if used && !queues.iter().any(|q: &Arc<Queue>| q.family() == family.index) {
                queues.push(Arc::new(Queue::new(
                    &token,
                    Arc::clone(&backend),
                    Arc::clone(&errors),
                    family,
                    0,
                    id,
                )));
            }
        }

        tracing::info!(
            "Device {id}: {} (graphics {}, compute {}, transfer {})",
            backend.info().name,
            selection.graphics,
            selection.compute,
            selection.transfer
        );

        Ok(Self {
            shared: Arc::new(DeviceShared {
                id,
                backend,
                errors,
                windows,
                queues,
                selection,
            }),
        })
    }

    pub fn id(&self) -> u32 {
        self.shared.id
    }

    pub fn info(&self) -> &DeviceInfo {
        self.shared.backend.info()
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.shared.backend
    }

    pub fn errors(&self) -> &Arc<ErrorChannel> {
        &self.shared.errors
    }

    pub fn memory_types(&self) -> &[MemoryType] {
        self.shared.backend.memory_types()
    }

    /// First memory type allowed by `filter` that has all of `flags`.
    pub fn find_memory_type(&self, filter: u32, flags: MemoryFlags) -> Option<u32> {
        select_memory_type(self.memory_types(), filter, flags)
    }

    /// The queue chains of `kind` submit to.
    pub fn queue(&self, kind: ChainType) -> &Arc<Queue> {
        let family = match kind {
            ChainType::Graphics => self.shared.selection.graphics,
            ChainType::Compute => self.shared.selection.compute,
            ChainType::Transfer => self.shared.selection.transfer,
        };
        self.shared
            .queues
            .iter()
            .find(|q| q.family() == family)
            .unwrap_or(&self.shared.queues[0])
    }

    pub fn graphics_queue(&self) -> &Arc<Queue> {
        self.queue(ChainType::Graphics)
    }

    pub fn compute_queue(&self) -> &Arc<Queue> {
        self.queue(ChainType::Compute)
    }

    pub fn transfer_queue(&self) -> &Arc<Queue> {
        self.queue(ChainType::Transfer)
    }

    pub fn queues(&self) -> &[Arc<Queue>] {
        &self.shared.queues
    }

    pub fn window(&self, id: WindowId) -> Option<Arc<dyn WindowSource>> {
        self.shared.windows.get(id)
    }

    /// Block until all work on every queue has finished. Each queue is
    /// drained under its submission lock, in queue order.
    pub fn synchronize(&self) -> Result<()> {
        self.shared.queues.iter().try_for_each(|queue| queue.wait_idle())
    }

    /// Whether two handles refer to the same device.
    pub fn same(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Send an error to the device's channel.
    pub fn report(&self, err: &GpuError) -> Severity {
        self.shared.errors.report(err.code(), err.to_string())
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.shared.id)
            .field("name", &self.info().name)
            .field("queues", &self.shared.queues.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::host::{HostBackend, HostConfig};
    use crate::backend::QueueFamily;
    use nyx_core::QueueCapabilities;

    fn device(config: HostConfig) -> Device {
        Device::new(
            0,
            Arc::new(HostBackend::new(config)),
            Arc::new(ErrorChannel::silent()),
            Arc::new(WindowRegistry::default()),
        )
        .unwrap()
    }

    #[test]
    fn one_queue_per_selected_family() {
        let device = device(HostConfig::default());
        assert_eq!(device.queues().len(), 3);
        assert_eq!(device.graphics_queue().family(), 0);
        assert_eq!(device.compute_queue().family(), 1);
        assert_eq!(device.transfer_queue().family(), 2);
    }

    #[test]
    fn single_family_devices_share_one_queue() {
        let device = device(HostConfig::default().with_queue_families(vec![QueueFamily {
            index: 0,
            capabilities: QueueCapabilities::GRAPHICS
                | QueueCapabilities::COMPUTE
                | QueueCapabilities::TRANSFER,
            queue_count: 1,
        }]));
        assert_eq!(device.queues().len(), 1);
        assert!(Arc::ptr_eq(device.graphics_queue(), device.transfer_queue()));
    }

    #[test]
    fn devices_without_graphics_are_rejected() {
        let result = Device::new(
            0,
            Arc::new(HostBackend::new(HostConfig::default().with_queue_families(
                vec![QueueFamily {
                    index: 0,
                    capabilities: QueueCapabilities::TRANSFER,
                    queue_count: 1,
                }],
            ))),
            Arc::new(ErrorChannel::silent()),
            Arc::new(WindowRegistry::default()),
        );
        assert!(matches!(result, Err(GpuError::NoSuitableDevice)));
    }

    #[test]
    fn memory_type_lookup_uses_first_match() {
        let device = device(HostConfig::default());
        assert_eq!(device.find_memory_type(u32::MAX, MemoryFlags::HOST_VISIBLE), Some(1));
        assert_eq!(device.find_memory_type(0b1000, MemoryFlags::HOST_VISIBLE), Some(3));
        assert_eq!(device.find_memory_type(0b0001, MemoryFlags::HOST_VISIBLE), None);
    }
}
