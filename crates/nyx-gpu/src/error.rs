//! GPU error types.

use ash::vk;
use nyx_core::{ChainType, ErrorCode, ImageFormat};
use thiserror::Error;

/// Where a chain is in its recording lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ChainState {
    /// Not bound to a device, or reset and not yet begun.
    #[default]
    Empty,
    Recording,
    Submitted,
}

/// GPU-related errors.
#[derive(Error, Debug)]
pub enum GpuError {
    /// Vulkan error.
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    /// No suitable GPU found.
    #[error("No suitable GPU found")]
    NoSuitableDevice,

    /// Device id out of range.
    #[error("Device {0} not found")]
    DeviceNotFound(u32),

    /// Memory allocation failed.
    #[error("Memory allocation failed: {0}")]
    AllocationFailed(String),

    /// Memory was used after it was freed.
    #[error("Memory used after free")]
    UseAfterFree,

    /// A chain operation was attempted in the wrong state.
    #[error("Cannot {operation} a {kind:?} chain in state {state:?}")]
    InvalidChainState {
        operation: &'static str,
        kind: ChainType,
        state: ChainState,
    },

    /// A texture's format does not match the image type it is imported as.
    #[error("Format mismatch: expected {expected:?}, found {found:?}")]
    FormatMismatch {
        expected: ImageFormat,
        found: ImageFormat,
    },

    /// Index or byte range outside a resource.
    #[error("Range {offset}..{end} outside resource of {len} bytes")]
    OutOfRange { offset: u64, end: u64, len: u64 },

    /// The device lacks a feature the call needs.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Bad argument to an otherwise valid call.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Surface creation failed.
    #[error("Surface creation failed: {0}")]
    SurfaceCreation(String),

    /// Swapchain creation failed.
    #[error("Swapchain creation failed: {0}")]
    SwapchainCreation(String),

    /// Shader module creation failed.
    #[error("Shader module creation failed: {0}")]
    ShaderCompilation(String),

    /// Pipeline creation failed.
    #[error("Pipeline creation failed: {0}")]
    PipelineCreation(String),

    /// Resource not found.
    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    /// Invalid state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl GpuError {
    /// The error channel code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Vulkan(result) => vulkan_code(*result),
            Self::NoSuitableDevice => ErrorCode::InitializationFailed,
            Self::DeviceNotFound(_) => ErrorCode::DeviceNotFound,
            Self::UseAfterFree => ErrorCode::UseAfterFree,
            Self::InvalidChainState { .. } => ErrorCode::InvalidChainState,
            Self::FormatMismatch { .. } => ErrorCode::FormatMismatch,
            Self::Unsupported(_) => ErrorCode::FeatureNotPresent,
            _ => ErrorCode::Unknown(-1),
        }
    }
}

/// Translate a native result into a channel code.
pub fn vulkan_code(result: vk::Result) -> ErrorCode {
    match result {
        vk::Result::SUCCESS => ErrorCode::Success,
        vk::Result::ERROR_DEVICE_LOST => ErrorCode::DeviceLost,
        vk::Result::ERROR_FEATURE_NOT_PRESENT | vk::Result::ERROR_EXTENSION_NOT_PRESENT => {
            ErrorCode::FeatureNotPresent
        }
        vk::Result::SUBOPTIMAL_KHR => ErrorCode::Suboptimal,
        vk::Result::ERROR_OUT_OF_DATE_KHR => ErrorCode::OutOfDate,
        vk::Result::ERROR_INITIALIZATION_FAILED => ErrorCode::InitializationFailed,
        other => ErrorCode::Unknown(other.as_raw()),
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;

#[cfg(test)]
mod tests {
    use super::*;
    use nyx_core::Severity;

    #[test]
    fn vulkan_results_map_to_codes() {
        assert_eq!(vulkan_code(vk::Result::ERROR_DEVICE_LOST), ErrorCode::DeviceLost);
        assert_eq!(vulkan_code(vk::Result::SUBOPTIMAL_KHR), ErrorCode::Suboptimal);
        assert_eq!(
            vulkan_code(vk::Result::ERROR_OUT_OF_HOST_MEMORY).severity(),
            Severity::Fatal
        );
    }

    #[test]
    fn chain_errors_carry_their_code() {
        let err = GpuError::InvalidChainState {
            operation: "submit",
            kind: ChainType::Transfer,
            state: ChainState::Submitted,
        };
        assert_eq!(err.code(), ErrorCode::InvalidChainState);
        assert_eq!(
            err.to_string(),
            "Cannot submit a Transfer chain in state Submitted"
        );
    }
}
