//! Serialized access to one native queue.

use crate::backend::{Backend, Command, QueueFamily, QueueHandle, SwapchainHandle, Ticket};
use crate::device::QueueToken;
use crate::error::{GpuError, Result};
use nyx_core::{ErrorChannel, QueueCapabilities};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

/// One device queue shared by every chain that records for it.
///
/// Native queues must not be submitted to from two threads at once, so
/// every call that touches the queue takes an internal lock first. Only
/// the device module can create a `Queue`.
pub struct Queue {
    backend: Arc<dyn Backend>,
    errors: Arc<ErrorChannel>,
    handle: QueueHandle,
    capabilities: QueueCapabilities,
    device_id: u32,
    guard: Mutex<()>,
}

impl Queue {
    pub(crate) fn new(
        _token: &QueueToken,
        backend: Arc<dyn Backend>,
        errors: Arc<ErrorChannel>,
        family: &QueueFamily,
        index: u32,
        device_id: u32,
    ) -> Self {
        Self {
            backend,
            errors,
            handle: QueueHandle {
                family: family.index,
                index,
            },
            capabilities: family.capabilities,
            device_id,
            guard: Mutex::new(()),
        }
    }

    pub const fn family(&self) -> u32 {
        self.handle.family
    }

    pub const fn index(&self) -> u32 {
        self.handle.index
    }

    pub const fn handle(&self) -> QueueHandle {
        self.handle
    }

    pub const fn device_id(&self) -> u32 {
        self.device_id
    }

    pub const fn capabilities(&self) -> QueueCapabilities {
        self.capabilities
    }

    pub fn supports(&self, capabilities: QueueCapabilities) -> bool {
        self.capabilities.contains(capabilities)
    }

    /// Submit commands, blocking until no other thread is submitting here.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn submit(&self, commands: &[Command]) -> Result<Ticket> {
        let _guard = self.guard.lock();
        tracing::debug!(
            family = self.handle.family,
            commands = commands.len(),
            "Submitting"
        );
        self.backend
            .submit(self.handle, commands)
            .inspect_err(|err| self.report_native(err))
    }

    /// Block until a submission from this queue has completed.
    pub fn wait(&self, ticket: Ticket) -> Result<()> {
        self.backend
            .wait(ticket)
            .inspect_err(|err| self.report_native(err))
    }

    pub fn wait_idle(&self) -> Result<()> {
        let _guard = self.guard.lock();
        self.backend
            .queue_wait_idle(self.handle)
            .inspect_err(|err| self.report_native(err))
    }

    /// Present a swapchain image. Returns true when the swapchain is stale.
    pub fn present(&self, swapchain: SwapchainHandle, index: u32) -> Result<bool> {
        let _guard = self.guard.lock();
        self.backend.present(self.handle, swapchain, index)
    }

    /// Submit and wait.
    pub(crate) fn execute(&self, commands: &[Command]) -> Result<()> {
        let ticket = self.submit(commands)?;
        self.wait(ticket)
    }

    // Front-end validation errors are returned to the caller; only driver
    // failures reach the channel from here.
    fn report_native(&self, err: &GpuError) {
        if let GpuError::Vulkan(_) = err {
            self.errors.report(err.code(), err.to_string());
        }
    }
}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("device", &self.device_id)
            .field("family", &self.handle.family)
            .field("index", &self.handle.index)
            .field("capabilities", &self.capabilities)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use crate::backend::host::{HostBackend, HostConfig};
    use crate::context::Context;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn concurrent_submits_are_serialized() {
        let backend = Arc::new(HostBackend::new(
            HostConfig::new().with_submit_latency(Duration::from_millis(2)),
        ));
        let context = Context::builder()
            .with_backend(backend.clone())
            .build()
            .unwrap();
        let queue = context.device(0).unwrap().graphics_queue().clone();

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let queue = queue.clone();
                thread::spawn(move || {
                    for _ in 0..5 {
                        let ticket = queue.submit(&[]).unwrap();
                        queue.wait(ticket).unwrap();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        let stats = backend.stats();
        assert_eq!(stats.submissions, 20);
        assert_eq!(stats.max_concurrent_submits, 1);
    }

    #[test]
    fn device_synchronize_waits_behind_submits() {
        let backend = Arc::new(HostBackend::new(
            HostConfig::new().with_submit_latency(Duration::from_millis(2)),
        ));
        let context = Arc::new(
            Context::builder()
                .with_backend(backend.clone())
                .build()
                .unwrap(),
        );

        let workers: Vec<_> = (0..4)
            .map(|worker| {
                let context = Arc::clone(&context);
                thread::spawn(move || {
                    let device = context.device(0).unwrap();
                    for _ in 0..5 {
                        if worker % 2 == 0 {
                            device.graphics_queue().submit(&[]).unwrap();
                        } else {
                            device.synchronize().unwrap();
                        }
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        context.wait_idle().unwrap();

        let stats = backend.stats();
        assert_eq!(stats.submissions, 10);
        assert_eq!(stats.max_concurrent_submits, 1);
    }
}
