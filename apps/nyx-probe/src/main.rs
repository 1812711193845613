//! nyx device probe
//!
//! Lists the devices a context can see and runs a self-test on one of
//! them: upload, device-to-device copy, an image round trip and a
//! readback to the host.
//!
//! ## Usage
//!
//! ```bash
//! cargo run -p nyx-probe -- [OPTIONS]
//! ```
//!
//! ## Options
//!
//! - `--backend <vulkan|host>`: Backend to enumerate (default: vulkan)
//! - `--device <N>`: Device to test (default: 0)
//! - `--validation`: Enable Vulkan validation layers
//! - `--dump <PATH>`: Write the test image as a PNG
//! - `-h, --help`: Print help message
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Set log level (e.g., info, debug, trace)

use anyhow::{bail, Context as _};
use image::{ImageBuffer, Rgba};
use nyx_core::format::Rgba8;
use nyx_gpu::{
    Array, ArrayFlags, BackendKind, Chain, ChainType, Context, Device, Image, ImageLayout,
};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

const SIZE: u32 = 64;

#[derive(Debug)]
struct Options {
    backend: BackendKind,
    device: u32,
    validation: bool,
    dump: Option<PathBuf>,
}

impl Options {
    fn from_args() -> anyhow::Result<Self> {
        let mut options = Self {
            backend: BackendKind::Vulkan,
            device: 0,
            validation: false,
            dump: None,
        };

        let mut args = std::env::args().skip(1);
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--backend" => {
                    options.backend = match args.next().as_deref() {
                        Some("vulkan") => BackendKind::Vulkan,
                        Some("host") => BackendKind::Host,
                        other => bail!("unknown backend {other:?}"),
                    };
                }
                "--device" => {
                    let value = args.next().context("--device needs a value")?;
                    options.device = value.parse().context("--device must be a number")?;
                }
                "--validation" => options.validation = true,
                "--dump" => {
                    options.dump = Some(args.next().context("--dump needs a path")?.into());
                }
                other => bail!("unknown argument {other}"),
            }
        }
        Ok(options)
    }
}

fn main() -> anyhow::Result<()> {
    if std::env::args().any(|arg| arg == "-h" || arg == "--help") {
        print_help();
        return Ok(());
    }

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let options = Options::from_args()?;
    let context = Context::builder()
        .app_name("nyx-probe")
        .backend(options.backend)
        .validation(options.validation)
        .presentation(false)
        .build()
        .context("no usable device")?;

    for device in context.devices() {
        let info = device.info();
        info!(
            "[{}] {} ({:?}, vendor {:#06x}, device address: {})",
            device.id(),
            info.name,
            info.kind,
            info.vendor_id,
            info.supports_device_address
        );
        for (index, memory) in device.memory_types().iter().enumerate() {
            info!("      memory type {index}: {:?} (heap {})", memory.flags, memory.heap);
        }
    }

    let device = context.device(options.device)?;
    let pixels = self_test(device)?;
    info!("Self-test passed on device {}", device.id());

    if let Some(path) = options.dump {
        let image: ImageBuffer<Rgba<u8>, Vec<u8>> =
            ImageBuffer::from_raw(SIZE, SIZE, pixels).context("readback has the wrong size")?;
        image.save(&path)?;
        info!("Wrote {}", path.display());
    }
    Ok(())
}

/// A gradient with red along x and green along y.
fn pattern() -> Vec<u32> {
    (0..SIZE * SIZE)
        .map(|i| {
            let (x, y) = (i % SIZE, i / SIZE);
            let r = x * 255 / (SIZE - 1);
            let g = y * 255 / (SIZE - 1);
            u32::from_le_bytes([r as u8, g as u8, 128, 255])
        })
        .collect()
}

/// Upload a pattern, push it through a second buffer and an image, and
/// read it back. Returns the RGBA bytes that came back.
fn self_test(device: &Device) -> anyhow::Result<Vec<u8>> {
    let expected = pattern();
    let count = expected.len();

    let mut staging = Array::<u32>::new();
    staging.initialize(device, count, false, ArrayFlags::default())?;
    let mut copy = Array::<u32>::new();
    copy.initialize(device, count, false, ArrayFlags::default())?;
    let mut image = Image::<Rgba8>::new();
    image.initialize(device, SIZE, SIZE, 1)?;
    let mut result = Array::<u32>::new();
    result.initialize(device, count, false, ArrayFlags::default())?;

    let mut chain = Chain::new();
    chain.initialize(device, ChainType::Graphics)?;
    chain.copy_from_host(&expected, &staging, 0, 0, 0)?;
    chain.copy_array(&staging, &copy, 0, 0, 0)?;
    chain.transition(&image, ImageLayout::TransferDst)?;
    chain.copy_array_to_image(&copy, &image, 0, 0, 0)?;
    chain.transition(&image, ImageLayout::TransferSrc)?;
    chain.copy_image_to_array(&image, &result, 0, 0, 0)?;
    let readback = chain.copy_to_host(&result, 0, 0, 0)?;
    chain.submit()?;
    chain.synchronize()?;

    let actual = readback.take().context("readback was not delivered")?;
    if let Some(index) = actual.iter().zip(&expected).position(|(a, b)| a != b) {
        bail!(
            "pixel {index} came back as {:#010x}, expected {:#010x}",
            actual[index],
            expected[index]
        );
    }
    Ok(actual.iter().flat_map(|p| p.to_le_bytes()).collect())
}

fn print_help() {
    eprintln!(
        "nyx device probe

Usage: nyx-probe [OPTIONS]

Options:
  --backend <vulkan|host>  Backend to enumerate (default: vulkan)
  --device <N>             Device to self-test (default: 0)
  --validation             Enable Vulkan validation layers
  --dump <PATH>            Write the test image as a PNG
  -h, --help               Print this help message"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_spans_both_axes() {
        let pixels = pattern();
        assert_eq!(pixels.len(), (SIZE * SIZE) as usize);
        assert_eq!(pixels[0].to_le_bytes(), [0, 0, 128, 255]);
        assert_eq!(pixels[(SIZE * SIZE - 1) as usize].to_le_bytes(), [255, 255, 128, 255]);
    }

    #[test]
    fn self_test_passes_on_the_host_backend() {
        let context = Context::builder()
            .backend(BackendKind::Host)
            .build()
            .unwrap();
        let bytes = self_test(context.device(0).unwrap()).unwrap();
        assert_eq!(bytes.len(), (SIZE * SIZE * 4) as usize);
    }
}
