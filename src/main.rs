//! CLI Entry Point for guide-hal
//!
//! Exercises the configured camera and mount from the command line:
//! - `info`: connect and describe both devices
//! - `config`: print the effective configuration
//! - `capture`: take one exposure and print frame statistics
//! - `pulse`: ST4 pulse through the camera's guide port
//! - `guide`: guide pulse through the mount binding
//!
//! # Usage
//!
//! ```bash
//! guide-hal capture --duration-ms 2000 --subframe 300,200,64,64
//! guide-hal guide north 500
//! GUIDE_HAL_MOUNT__DRIVER=on_camera guide-hal guide west 250
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use guide_hal::config::GuideHalConfig;
use guide_hal::hardware::registry::DeviceRegistry;
use guide_hal::hardware::{CaptureOptions, GuideDirection};
use guide_hal::image::{ImageBuffer, Subframe};
use guide_hal::tracing_setup::{self, OutputFormat, TracingConfig};
use tracing::info;

#[derive(Parser)]
#[command(name = "guide-hal")]
#[command(about = "Drive autoguider cameras and mounts through uniform capability interfaces", long_about = None)]
struct Cli {
    /// Configuration file (defaults to config/guide_hal.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log output format: pretty, compact or json
    #[arg(long, global = true, default_value = "compact")]
    log_format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect both devices and describe them
    Info,

    /// Print the effective configuration as TOML
    Config,

    /// Take one exposure
    Capture {
        /// Exposure time in milliseconds
        #[arg(long, default_value = "1000")]
        duration_ms: u32,

        /// Read only this region: x,y,width,height
        #[arg(long, value_parser = parse_subframe)]
        subframe: Option<Subframe>,

        /// Reconnaissance frame (full frame, no dark subtraction)
        #[arg(long)]
        recon: bool,

        /// Read the full frame even when a subframe is given
        #[arg(long)]
        full_frame: bool,
    },

    /// Pulse the camera's ST4 guide port
    Pulse {
        /// north, south, east or west
        direction: GuideDirection,
        /// Pulse length in milliseconds
        duration_ms: u32,
    },

    /// Send a guide pulse through the mount
    Guide {
        /// north, south, east or west
        direction: GuideDirection,
        /// Pulse length in milliseconds
        duration_ms: u32,
    },
}

fn parse_subframe(s: &str) -> Result<Subframe, String> {
    let parts: Vec<u32> = s
        .split(',')
        .map(|p| p.trim().parse::<u32>())
        .collect::<Result<_, _>>()
        .map_err(|e| format!("invalid subframe '{}': {}", s, e))?;
    match parts.as_slice() {
        [x, y, width, height] => Ok(Subframe::new(*x, *y, *width, *height)),
        _ => Err(format!("subframe '{}' must be x,y,width,height", s)),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => GuideHalConfig::load_from(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => GuideHalConfig::load().context("loading configuration")?,
    };

    let level = tracing_setup::parse_log_level(&config.application.log_level)?;
    tracing_setup::init(TracingConfig::new(level).with_format(cli.log_format))?;
    info!(application = %config.application.name, "starting");

    match cli.command {
        Commands::Info => show_info(&config),
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Capture {
            duration_ms,
            subframe,
            recon,
            full_frame,
        } => {
            let mut options = CaptureOptions::SUBTRACT_DARK;
            options.set(CaptureOptions::RECON, recon);
            options.set(CaptureOptions::FORCE_FULL_FRAME, full_frame);
            capture(&config, duration_ms, subframe, options)
        }
        Commands::Pulse {
            direction,
            duration_ms,
        } => pulse(&config, direction, duration_ms),
        Commands::Guide {
            direction,
            duration_ms,
        } => guide(&config, direction, duration_ms),
    }
}

fn connected_registry(config: &GuideHalConfig) -> Result<DeviceRegistry> {
    let mut registry = DeviceRegistry::from_config(config)?;
    registry.connect_all().context("connecting devices")?;
    Ok(registry)
}

fn show_info(config: &GuideHalConfig) -> Result<()> {
    let mut registry = connected_registry(config)?;
    for device in registry.list_devices() {
        println!("{} ({})", device.name, device.driver_type);
        println!("  connected:    {}", device.connected);
        println!("  capabilities: {:?}", device.capabilities);
        if let Some((w, h)) = device.frame_size {
            println!("  frame size:   {}x{}", w, h);
        }
        if let Some(bpp) = device.bits_per_pixel {
            println!("  bit depth:    {}", bpp);
        }
    }
    registry.disconnect_all()?;
    Ok(())
}

fn capture(
    config: &GuideHalConfig,
    duration_ms: u32,
    subframe: Option<Subframe>,
    options: CaptureOptions,
) -> Result<()> {
    let mut registry = connected_registry(config)?;
    let mut frame = ImageBuffer::empty();
    registry
        .camera_mut()
        .capture(duration_ms, &mut frame, options, subframe)
        .context("capture failed")?;

    let region = frame
        .subframe
        .unwrap_or_else(|| Subframe::full(frame.width(), frame.height()));
    let (min, max, mean) = region_stats(&frame, region);
    println!(
        "frame #{}: {}x{} @ {} bpp, {} ms",
        frame.frame_number,
        frame.width(),
        frame.height(),
        frame.bits_per_pixel(),
        frame.exposure_ms
    );
    println!(
        "region {},{} {}x{}: min {} max {} mean {:.1}",
        region.x, region.y, region.width, region.height, min, max, mean
    );
    registry.disconnect_all()?;
    Ok(())
}

fn region_stats(frame: &ImageBuffer, region: Subframe) -> (u16, u16, f64) {
    let mut min = u16::MAX;
    let mut max = 0u16;
    let mut sum = 0u64;
    for y in region.y..region.y + region.height {
        for x in region.x..region.x + region.width {
            let v = frame.pixel(x, y).unwrap_or(0);
            min = min.min(v);
            max = max.max(v);
            sum += u64::from(v);
        }
    }
    let count = region.pixel_count().max(1) as f64;
    (min, max, sum as f64 / count)
}

fn pulse(config: &GuideHalConfig, direction: GuideDirection, duration_ms: u32) -> Result<()> {
    let mut registry = connected_registry(config)?;
    registry
        .camera_mut()
        .st4_pulse_guide_scope(direction, duration_ms)
        .context("ST4 pulse failed")?;
    println!("ST4 {} {} ms: done", direction, duration_ms);
    registry.disconnect_all()?;
    Ok(())
}

fn guide(config: &GuideHalConfig, direction: GuideDirection, duration_ms: u32) -> Result<()> {
    let mut registry = connected_registry(config)?;
    let result = registry.mount_mut().guide(direction, duration_ms);
    println!("guide {} {} ms: {}", direction, duration_ms, result);
    registry.disconnect_all()?;
    if !result.is_success() {
        anyhow::bail!("guide pulse did not complete ({})", result);
    }
    Ok(())
}
