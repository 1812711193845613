//! Test harness for the nyx graphics layer.
//!
//! Provides headless contexts that record every error report, and PNG
//! dumps of image contents for inspection.

pub mod harness;

pub use harness::{save_rgba, HeadlessHarness};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TestError {
    #[error("GPU error: {0}")]
    Gpu(#[from] nyx_gpu::GpuError),
    #[error("Image data does not match {width}x{height}")]
    ImageSize { width: u32, height: u32 },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
}

pub type Result<T> = std::result::Result<T, TestError>;
