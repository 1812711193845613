//! Context creation and device enumeration.

use crate::backend::host::{HostBackend, HostConfig};
use crate::backend::Backend;
use crate::device::Device;
use crate::error::{GpuError, Result};
use crate::vulkan::{self, VulkanConfig};
use crate::window::{WindowId, WindowRegistry, WindowSource};
use nyx_core::{ErrorCallback, ErrorChannel, ErrorHandler, Report};
use std::sync::Arc;

/// Which backend a [`ContextBuilder`] enumerates devices from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
    #[default]
    Vulkan,
    /// Software devices, see [`HostBackend`].
    Host,
}

/// Owns the devices, the window registry and the error channel.
pub struct Context {
    devices: Vec<Device>,
    errors: Arc<ErrorChannel>,
    windows: Arc<WindowRegistry>,
}

impl Context {
    pub fn builder() -> ContextBuilder {
        ContextBuilder::new()
    }

    /// Look up a device by id.
    ///
    /// Unknown ids are reported as a warning and returned as an error.
    pub fn device(&self, id: u32) -> Result<&Device> {
        self.devices.get(id as usize).ok_or_else(|| {
            let err = GpuError::DeviceNotFound(id);
            self.errors.report(err.code(), err.to_string());
            err
        })
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    pub fn errors(&self) -> &Arc<ErrorChannel> {
        &self.errors
    }

    pub fn register_window(&self, window: Arc<dyn WindowSource>) -> WindowId {
        self.windows.register(window)
    }

    pub fn window(&self, id: WindowId) -> Option<Arc<dyn WindowSource>> {
        self.windows.get(id)
    }

    pub fn wait_idle(&self) -> Result<()> {
        self.devices.iter().try_for_each(Device::synchronize)
    }
}

/// Builder for creating a [`Context`].
pub struct ContextBuilder {
    app_name: String,
    validation: bool,
    backend: BackendKind,
    presentation: bool,
    host_config: HostConfig,
    host_devices: u32,
    custom: Vec<Arc<dyn Backend>>,
    errors: Option<Arc<ErrorChannel>>,
    callback: Option<ErrorCallback>,
    handler: Option<Arc<dyn ErrorHandler>>,
}

impl Default for ContextBuilder {
    fn default() -> Self {
        Self {
            app_name: "nyx".to_string(),
            validation: cfg!(debug_assertions),
            backend: BackendKind::default(),
            presentation: !cfg!(feature = "headless"),
            host_config: HostConfig::default(),
            host_devices: 1,
            custom: Vec::new(),
            errors: None,
            callback: None,
            handler: None,
        }
    }
}

impl ContextBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    /// Enable or disable validation layers.
    pub fn validation(mut self, enable: bool) -> Self {
        self.validation = enable;
        self
    }

    pub fn backend(mut self, kind: BackendKind) -> Self {
        self.backend = kind;
        self
    }

    /// Request surface support. Ignored with the `headless` feature.
    pub fn presentation(mut self, enable: bool) -> Self {
        self.presentation = enable && !cfg!(feature = "headless");
        self
    }

    pub fn host_config(mut self, config: HostConfig) -> Self {
        self.host_config = config;
        self
    }

    /// Number of software devices created with [`BackendKind::Host`].
    pub fn host_devices(mut self, count: u32) -> Self {
        self.host_devices = count;
        self
    }

    /// Use an already constructed backend as the next device.
    ///
    /// Once any backend is supplied, enumeration is skipped.
    pub fn with_backend(mut self, backend: Arc<dyn Backend>) -> Self {
        self.custom.push(backend);
        self
    }

    /// Share an existing channel instead of creating one.
    pub fn error_channel(mut self, channel: Arc<ErrorChannel>) -> Self {
        self.errors = Some(channel);
        self
    }

    /// Replace the default callback, which logs and exits on fatal errors.
    pub fn error_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Report) + Send + Sync + 'static,
    {
        self.callback = Some(Arc::new(callback));
        self
    }

    pub fn error_handler(mut self, handler: Arc<dyn ErrorHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Build the context.
    pub fn build(self) -> Result<Context> {
        let errors = self
            .errors
            .unwrap_or_else(|| Arc::new(ErrorChannel::new()));
        if let Some(callback) = self.callback {
            errors.set_callback(move |report| callback(report));
        }
        if let Some(handler) = self.handler {
            errors.set_handler(handler);
        }

        let backends: Vec<Arc<dyn Backend>> = if !self.custom.is_empty() {
            self.custom
        } else {
            match self.backend {
                BackendKind::Host => (0..self.host_devices)
                    .map(|_| {
                        Arc::new(HostBackend::new(self.host_config.clone())) as Arc<dyn Backend>
                    })
                    .collect(),
                BackendKind::Vulkan => vulkan::enumerate_devices(&VulkanConfig {
                    app_name: self.app_name.clone(),
                    validation: self.validation,
                    presentation: self.presentation,
                })?,
            }
        };

        if backends.is_empty() {
            return Err(GpuError::NoSuitableDevice);
        }

        let windows = Arc::new(WindowRegistry::default());
        let devices = backends
            .into_iter()
            .enumerate()
            .map(|(id, backend)| {
                Device::new(id as u32, backend, Arc::clone(&errors), Arc::clone(&windows))
            })
            .collect::<Result<Vec<_>>>()?;

        tracing::info!("Context '{}' created with {} device(s)", self.app_name, devices.len());

        Ok(Context {
            devices,
            errors,
            windows,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nyx_core::{ErrorCode, Severity};
    use parking_lot::Mutex;

    #[test]
    fn host_context_creates_requested_devices() {
        let context = Context::builder()
            .backend(BackendKind::Host)
            .host_devices(2)
            .build()
            .unwrap();
        assert_eq!(context.device_count(), 2);
        assert_eq!(context.device(1).unwrap().id(), 1);
    }

    #[test]
    fn missing_device_is_reported_as_warning() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let context = Context::builder()
            .backend(BackendKind::Host)
            .error_callback(move |report| sink.lock().push((report.code, report.severity)))
            .build()
            .unwrap();

        assert!(context.device(7).is_err());
        assert_eq!(
            *seen.lock(),
            vec![(ErrorCode::DeviceNotFound, Severity::Warning)]
        );
    }

    #[test]
    fn zero_host_devices_is_an_error() {
        let result = Context::builder()
            .backend(BackendKind::Host)
            .host_devices(0)
            .build();
        assert!(matches!(result, Err(GpuError::NoSuitableDevice)));
    }
}
