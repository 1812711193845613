//! Core types for the nyx graphics layer.
//!
//! This crate provides the backend-neutral vocabulary used by every layer:
//! - Error codes, severities and the error channel
//! - Memory, buffer and image usage flags
//! - Image formats, layouts and type-level pixel formats

pub mod error;
pub mod flags;
pub mod format;
pub mod types;

pub use error::{
    log_and_exit_on_fatal, ErrorCallback, ErrorChannel, ErrorCode, ErrorHandler, Report, Severity,
};
pub use flags::{ArrayFlags, BufferFlags, ImageUsage, MemoryFlags, QueueCapabilities, ShaderStages};
pub use format::PixelFormat;
pub use types::{ChainType, Extent2D, ImageFormat, ImageLayout, PipelineStage};
