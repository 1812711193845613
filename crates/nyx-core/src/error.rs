//! Error codes, severities and the error channel.
//!
//! Local failures (allocation, initialization) are returned to the immediate
//! caller. Protocol violations that cut across subsystems, such as importing
//! an image with the wrong format or recording into a submitted chain, are
//! reported through an [`ErrorChannel`].
//!
//! The channel is owned by the context that creates the devices and is
//! shared with everything they produce. It is configured once at startup
//! and lives until the last device referencing it is dropped.

use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// How serious a reported condition is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Severity {
    /// Nothing to report.
    #[default]
    None,
    /// Informational.
    Info,
    /// Recoverable; the operation that raised it failed locally.
    Warning,
    /// Unrecoverable; the default callback terminates the process.
    Fatal,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "none",
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Fatal => "fatal",
        };
        f.write_str(name)
    }
}

/// Conditions that travel through the error channel.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    #[error("success")]
    Success,
    #[error("device lost")]
    DeviceLost,
    #[error("device not found")]
    DeviceNotFound,
    #[error("feature not present")]
    FeatureNotPresent,
    #[error("swapchain is suboptimal")]
    Suboptimal,
    #[error("swapchain is out of date")]
    OutOfDate,
    #[error("initialization failed")]
    InitializationFailed,
    #[error("image format mismatch")]
    FormatMismatch,
    #[error("invalid chain state")]
    InvalidChainState,
    #[error("use of freed memory")]
    UseAfterFree,
    /// A code this layer does not recognize. Always fatal.
    #[error("unknown error code {0}")]
    Unknown(i32),
}

impl ErrorCode {
    /// The severity every report with this code carries.
    pub const fn severity(self) -> Severity {
        match self {
            Self::Success => Severity::None,
            Self::DeviceNotFound
            | Self::FeatureNotPresent
            | Self::Suboptimal
            | Self::FormatMismatch => Severity::Warning,
            Self::DeviceLost
            | Self::OutOfDate
            | Self::InitializationFailed
            | Self::InvalidChainState
            | Self::UseAfterFree
            | Self::Unknown(_) => Severity::Fatal,
        }
    }

    pub const fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}

/// A single reported condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    pub code: ErrorCode,
    pub severity: Severity,
    pub message: String,
}

impl Report {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            severity: code.severity(),
            message: message.into(),
        }
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "[{}] {}", self.severity, self.code)
        } else {
            write!(f, "[{}] {}: {}", self.severity, self.code, self.message)
        }
    }
}

/// Object-style receiver for reports. Runs after the callback.
pub trait ErrorHandler: Send + Sync {
    fn handle_error(&self, report: &Report);
}

/// Plain-function receiver for reports.
pub type ErrorCallback = Arc<dyn Fn(&Report) + Send + Sync>;

/// Dispatches reports to a callback and a handler object.
///
/// Both receivers run when both are installed. A fresh channel carries
/// [`log_and_exit_on_fatal`] as its callback and no handler.
pub struct ErrorChannel {
    callback: RwLock<Option<ErrorCallback>>,
    handler: RwLock<Option<Arc<dyn ErrorHandler>>>,
}

impl ErrorChannel {
    /// Create a channel with the default logging callback.
    pub fn new() -> Self {
        Self {
            callback: RwLock::new(Some(Arc::new(log_and_exit_on_fatal))),
            handler: RwLock::new(None),
        }
    }

    /// Create a channel with no receivers installed.
    pub fn silent() -> Self {
        Self {
            callback: RwLock::new(None),
            handler: RwLock::new(None),
        }
    }

    /// Replace the callback.
    pub fn set_callback<F>(&self, callback: F)
    where
        F: Fn(&Report) + Send + Sync + 'static,
    {
        *self.callback.write() = Some(Arc::new(callback));
    }

    pub fn clear_callback(&self) {
        *self.callback.write() = None;
    }

    /// Replace the handler object.
    pub fn set_handler(&self, handler: Arc<dyn ErrorHandler>) {
        *self.handler.write() = Some(handler);
    }

    pub fn clear_handler(&self) {
        *self.handler.write() = None;
    }

    /// Report a condition. `Success` is a no-op.
    ///
    /// Returns the severity the report was dispatched with.
    pub fn report(&self, code: ErrorCode, message: impl Into<String>) -> Severity {
        if code.is_success() {
            return Severity::None;
        }
        let report = Report::new(code, message);
        self.dispatch(&report);
        report.severity
    }

    /// Hand an already built report to the receivers.
    pub fn dispatch(&self, report: &Report) {
        // Receivers may reconfigure the channel, so never call them under a lock.
        let callback = self.callback.read().clone();
        let handler = self.handler.read().clone();

        if let Some(callback) = callback {
            callback(report);
        }
        if let Some(handler) = handler {
            handler.handle_error(report);
        }
    }
}

impl Default for ErrorChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ErrorChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorChannel")
            .field("callback", &self.callback.read().is_some())
            .field("handler", &self.handler.read().is_some())
            .finish()
    }
}

/// Default callback: log at the report's severity and exit on `Fatal`.
pub fn log_and_exit_on_fatal(report: &Report) {
    match report.severity {
        Severity::None => tracing::debug!("{report}"),
        Severity::Info => tracing::info!("{report}"),
        Severity::Warning => tracing::warn!("{report}"),
        Severity::Fatal => {
            tracing::error!("{report}");
            std::process::exit(-1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn severity_table() {
        assert_eq!(ErrorCode::Success.severity(), Severity::None);
        assert_eq!(ErrorCode::DeviceLost.severity(), Severity::Fatal);
        assert_eq!(ErrorCode::DeviceNotFound.severity(), Severity::Warning);
        assert_eq!(ErrorCode::FeatureNotPresent.severity(), Severity::Warning);
        assert_eq!(ErrorCode::Suboptimal.severity(), Severity::Warning);
        assert_eq!(ErrorCode::OutOfDate.severity(), Severity::Fatal);
        assert_eq!(ErrorCode::InitializationFailed.severity(), Severity::Fatal);
        assert_eq!(ErrorCode::FormatMismatch.severity(), Severity::Warning);
        assert_eq!(ErrorCode::InvalidChainState.severity(), Severity::Fatal);
    }

    #[test]
    fn unknown_codes_are_fatal() {
        assert_eq!(ErrorCode::Unknown(-13).severity(), Severity::Fatal);
        assert_eq!(ErrorCode::Unknown(0).severity(), Severity::Fatal);
    }

    struct Collect(Mutex<Vec<ErrorCode>>);

    impl ErrorHandler for Collect {
        fn handle_error(&self, report: &Report) {
            self.0.lock().push(report.code);
        }
    }

    #[test]
    fn callback_and_handler_both_run() {
        let channel = ErrorChannel::silent();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        channel.set_callback(move |report| sink.lock().push(report.clone()));

        let handler = Arc::new(Collect(Mutex::new(Vec::new())));
        channel.set_handler(handler.clone());

        let severity = channel.report(ErrorCode::FormatMismatch, "expected rgba8");
        assert_eq!(severity, Severity::Warning);

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].code, ErrorCode::FormatMismatch);
        assert_eq!(seen[0].message, "expected rgba8");
        assert_eq!(*handler.0.lock(), vec![ErrorCode::FormatMismatch]);
    }

    #[test]
    fn success_is_not_dispatched() {
        let channel = ErrorChannel::silent();
        let count = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&count);
        channel.set_callback(move |_| *sink.lock() += 1);

        assert_eq!(channel.report(ErrorCode::Success, ""), Severity::None);
        assert_eq!(*count.lock(), 0);
    }

    #[test]
    fn callback_may_reconfigure_channel() {
        let channel = Arc::new(ErrorChannel::silent());
        let inner = Arc::clone(&channel);
        channel.set_callback(move |_| inner.clear_callback());

        channel.report(ErrorCode::Suboptimal, "first");
        channel.report(ErrorCode::Suboptimal, "second");
    }

    #[test]
    fn report_display() {
        let report = Report::new(ErrorCode::DeviceNotFound, "device 3");
        assert_eq!(report.to_string(), "[warning] device not found: device 3");
    }
}
