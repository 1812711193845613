//! Headless contexts for tests.
//!
//! Every harness runs on software devices and collects the reports that
//! reach its error channel instead of exiting on fatal ones.

use image::{ImageBuffer, Rgba};
use nyx_core::{ErrorCode, Report, Severity};
use nyx_gpu::{Backend, BackendKind, Context, Device, HostBackend, HostConfig, HostStats};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::{Arc, Once};

use crate::{Result, TestError};

static LOGGING: Once = Once::new();

/// Route `tracing` output to the test writer, filtered by `RUST_LOG`.
pub fn init_logging() {
    LOGGING.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// A software context that records its error reports.
pub struct HeadlessHarness {
    context: Context,
    backends: Vec<Arc<HostBackend>>,
    reports: Arc<Mutex<Vec<Report>>>,
}

impl HeadlessHarness {
    /// One default software device.
    pub fn new() -> Result<Self> {
        Self::with_config(HostConfig::default(), 1)
    }

    /// `devices` software devices shaped by `config`.
    pub fn with_config(config: HostConfig, devices: u32) -> Result<Self> {
        init_logging();
        let reports = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&reports);
        let backends: Vec<_> = (0..devices)
            .map(|_| Arc::new(HostBackend::new(config.clone())))
            .collect();

        let builder = backends.iter().fold(
            Context::builder()
                .app_name("nyx-test")
                .backend(BackendKind::Host),
            |builder, backend| builder.with_backend(Arc::clone(backend) as Arc<dyn Backend>),
        );
        let context = builder
            .error_callback(move |report| sink.lock().push(report.clone()))
            .build()?;
        tracing::debug!(devices, "Headless harness ready");
        Ok(Self {
            context,
            backends,
            reports,
        })
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Device 0.
    pub fn device(&self) -> Result<&Device> {
        Ok(self.context.device(0)?)
    }

    /// Counters of the software device behind device `id`.
    pub fn stats(&self, id: u32) -> Option<HostStats> {
        self.backends.get(id as usize).map(|backend| backend.stats())
    }

    /// Reports received so far.
    pub fn reports(&self) -> Vec<Report> {
        self.reports.lock().clone()
    }

    pub fn codes(&self) -> Vec<ErrorCode> {
        self.reports.lock().iter().map(|r| r.code).collect()
    }

    pub fn fatal_count(&self) -> usize {
        self.reports
            .lock()
            .iter()
            .filter(|r| r.severity == Severity::Fatal)
            .count()
    }

    pub fn clear_reports(&self) {
        self.reports.lock().clear();
    }
}

/// Write tightly packed RGBA8 pixels as a PNG.
pub fn save_rgba(path: impl AsRef<Path>, width: u32, height: u32, pixels: Vec<u8>) -> Result<()> {
    let image: ImageBuffer<Rgba<u8>, Vec<u8>> =
        ImageBuffer::from_raw(width, height, pixels).ok_or(TestError::ImageSize { width, height })?;
    if let Some(parent) = path.as_ref().parent() {
        std::fs::create_dir_all(parent)?;
    }
    image.save(path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn harness_starts_without_reports() {
        let harness = HeadlessHarness::new().unwrap();
        assert_eq!(harness.context().device_count(), 1);
        assert!(harness.reports().is_empty());
        assert_eq!(harness.stats(0).map(|s| s.submissions), Some(0));
        assert!(harness.stats(1).is_none());
    }

    #[test]
    fn unknown_device_is_recorded() {
        let harness = HeadlessHarness::new().unwrap();
        assert!(harness.context().device(3).is_err());
        assert_eq!(harness.codes(), vec![ErrorCode::DeviceNotFound]);
        assert_eq!(harness.fatal_count(), 0);
    }

    #[test]
    fn pixel_count_must_match_extent() {
        let dir = std::env::temp_dir().join("nyx-test-harness");
        let err = save_rgba(dir.join("bad.png"), 2, 2, vec![0; 3]).unwrap_err();
        assert!(matches!(err, TestError::ImageSize { width: 2, height: 2 }));
        save_rgba(dir.join("ok.png"), 1, 1, vec![255, 0, 0, 255]).unwrap();
    }
}
