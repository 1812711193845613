//! GPU resource and command submission layer for nyx.
//!
//! This crate provides:
//! - Context creation and multi-device enumeration
//! - Typed device arrays and images with explicit memory binding
//! - Command chains for transfer, compute and graphics work
//! - Compute and graphics pipelines with named resource bindings
//! - Render passes that own their framebuffers and present to windows
//!
//! Work reaches a device through a [`Backend`]: [`VulkanBackend`] for real
//! hardware or [`HostBackend`] for headless runs and tests.

pub mod array;
pub mod backend;
pub mod binding;
pub mod chain;
pub mod computer;
pub mod context;
pub mod device;
pub mod error;
pub mod image;
pub mod memory;
pub mod pass;
pub mod queue;
pub mod render_pass;
pub mod renderer;
pub mod vulkan;
pub mod window;

pub use array::{Array, ArrayCursor, IndexElement};
pub use backend::host::{HostBackend, HostConfig, HostStats};
pub use backend::{Backend, BindingDesc, BindingKind, ShaderSource, Viewport, VertexLayout};
pub use binding::{Pipeline, PipelineBinding};
pub use chain::{Chain, Readback};
pub use computer::Computer;
pub use context::{BackendKind, Context, ContextBuilder};
pub use device::Device;
pub use error::{ChainState, GpuError, Result};
pub use image::{AsTexture, Image, Texture};
pub use memory::{select_memory_type, Memory};
pub use pass::Pass;
pub use queue::Queue;
pub use render_pass::{Attachment, RenderPass, Subpass};
pub use renderer::Renderer;
pub use vulkan::{VulkanBackend, VulkanConfig};
pub use window::{VirtualWindow, WindowId, WindowSource};

pub use nyx_core::{
    ArrayFlags, ChainType, ErrorCode, Extent2D, ImageFormat, ImageLayout, ImageUsage, MemoryFlags,
    PipelineStage, Severity, ShaderStages,
};
