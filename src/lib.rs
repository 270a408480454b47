//! # guide_hal
//!
//! Hardware-abstraction boundary of an astronomical autoguider. A guiding
//! loop drives any camera and any mount through two small capability traits,
//! without knowing which vendor protocol sits behind them.
//!
//! ## Crate Structure
//!
//! - **`hardware`**: the `GuideCamera`, `Mount` and `St4Port` capability
//!   traits, the SBIG camera binding, the EQMac AppleEvent mount binding, the
//!   on-camera ST4 mount and the device registry.
//! - **`image`**: the caller-owned `ImageBuffer` filled by captures.
//! - **`error`**: `GuideError`, the uniform error taxonomy.
//! - **`config`**: Figment-based configuration (TOML plus `GUIDE_HAL_`
//!   environment variables).
//! - **`tracing_setup`**: `tracing-subscriber` initialization.
//!
//! ## Example
//!
//! ```rust,no_run
//! use guide_hal::config::GuideHalConfig;
//! use guide_hal::hardware::registry::DeviceRegistry;
//! use guide_hal::hardware::{CaptureOptions, GuideDirection};
//! use guide_hal::image::ImageBuffer;
//!
//! # fn main() -> Result<(), guide_hal::error::GuideError> {
//! let mut registry = DeviceRegistry::from_config(&GuideHalConfig::default())?;
//! registry.connect_all()?;
//!
//! let (camera, mount) = registry.camera_and_mount();
//! let mut frame = ImageBuffer::empty();
//! camera.capture(1000, &mut frame, CaptureOptions::SUBTRACT_DARK, None)?;
//! let result = mount.guide(GuideDirection::West, 400);
//! println!("guide pulse: {}", result);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod hardware;
pub mod image;
pub mod tracing_setup;

pub use error::{GuideError, GuideResult};
