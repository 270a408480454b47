//! Guiding Hardware Capabilities
//!
//! This module defines the two capability traits a guiding loop programs
//! against, plus the small `St4Port` trait for guide-relay hardware:
//!
//! - A guide camera implements: `GuideCamera` (and may expose an `St4Port`)
//! - A mount implements: `Mount`
//!
//! The loop holds a `Box<dyn GuideCamera>` and a `Box<dyn Mount>` chosen at
//! runtime (see `hardware::registry`) and never learns which vendor sits
//! behind them.
//!
//! # Design Philosophy
//!
//! Each capability trait:
//! - Is synchronous and blocking (exposure and pulse timing must be
//!   deterministic between a correction and the next measurement)
//! - Takes `&mut self` for device operations, so one instance can never run
//!   two blocking operations at once
//! - Uses `GuideError` for errors, never vendor status codes
//! - Is object safe and `Send`
//!
//! # Example
//!
//! ```rust,ignore
//! fn calibration_step(
//!     camera: &mut dyn GuideCamera,
//!     mount: &mut dyn Mount,
//!     frame: &mut ImageBuffer,
//! ) -> GuideResult<MoveResult> {
//!     camera.capture(1000, frame, CaptureOptions::SUBTRACT_DARK, None)?;
//!     Ok(mount.guide(GuideDirection::West, 750))
//! }
//! ```

use bitflags::bitflags;
use std::sync::Arc;

use crate::error::GuideResult;
use crate::hardware::{AbortSignal, GuideDirection, MoveResult};
use crate::image::{ImageBuffer, Subframe};

bitflags! {
    /// Flags controlling how a single capture is taken.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CaptureOptions: u32 {
        /// Subtract the binding's registered dark frame, if one matches.
        const SUBTRACT_DARK = 1 << 0;
        /// Reconnaissance frame: full frame, no dark subtraction.
        const RECON = 1 << 1;
        /// Read the whole sensor even if a subframe was requested.
        const FORCE_FULL_FRAME = 1 << 2;
    }
}

impl CaptureOptions {
    /// Whether this capture must ignore any requested subframe.
    pub fn wants_full_frame(self) -> bool {
        self.intersects(CaptureOptions::RECON | CaptureOptions::FORCE_FULL_FRAME)
    }
}

/// Capability: Camera for guiding
///
/// # Contract
/// - `connect` opens the device named by an identifier; `DeviceNotFound` or
///   `DeviceBusy` when it cannot
/// - `disconnect` always succeeds, also when already disconnected
/// - `capture` blocks for about `duration_ms` plus readout and either fills
///   the buffer completely or leaves it untouched
/// - A subframe is honored when the camera and options allow; otherwise the
///   binding reads the full frame and logs the fallback
pub trait GuideCamera: Send {
    /// Human-readable binding name
    fn name(&self) -> &str;

    /// Open the device selected by `identifier`.
    fn connect(&mut self, identifier: &str) -> GuideResult<()>;

    /// Release the device. Never fails.
    fn disconnect(&mut self);

    /// Whether the device is connected
    fn is_connected(&self) -> bool;

    /// Take one exposure of `duration_ms` into `buffer`.
    ///
    /// # Arguments
    /// * `duration_ms` - Exposure time in milliseconds (0 is a bias frame)
    /// * `buffer` - Caller-owned image, overwritten only on success
    /// * `options` - Capture mode flags
    /// * `subframe` - Optional region to read instead of the full sensor
    ///
    /// # Returns
    /// - Ok(()) with `buffer` at `bits_per_pixel()` depth and full sensor
    ///   dimensions (a subframe read leaves pixels outside the region at zero
    ///   and sets `buffer.subframe`)
    /// - Err on device error, timeout, invalid subframe or abort
    fn capture(
        &mut self,
        duration_ms: u32,
        buffer: &mut ImageBuffer,
        options: CaptureOptions,
        subframe: Option<Subframe>,
    ) -> GuideResult<()>;

    /// Whether this binding can capture without a visible acquisition window.
    fn has_non_gui_capture(&self) -> bool;

    /// Native pixel depth of captured frames.
    fn bits_per_pixel(&self) -> u8;

    /// Sensor size `(width, height)` at the current binning.
    ///
    /// Returns `(0, 0)` before the first successful connect.
    fn full_size(&self) -> (u32, u32);

    /// Whether the camera has an ST4 guide output.
    fn has_guide_output(&self) -> bool {
        false
    }

    /// Pulse the mount through the camera's guide port and wait for the
    /// pulse to finish. A zero duration returns immediately.
    fn st4_pulse_guide_scope(
        &mut self,
        direction: GuideDirection,
        duration_ms: u32,
    ) -> GuideResult<()>;

    /// Shareable handle to the camera's guide port, if it has one.
    fn guide_port(&self) -> Option<Arc<dyn St4Port>> {
        None
    }

    /// Abort signal polled during captures.
    fn abort_signal(&self) -> AbortSignal;
}

/// Capability: Telescope mount for guiding
///
/// # Contract
/// - `guide` commands a single-axis pulse and blocks until the transport
///   confirms completion
/// - `guide` returns exactly one `MoveResult`; failures are logged, not raised
/// - `disconnect` of a binding whose device is an independent application may
///   report `NothingToDisconnect`, which is not fatal
pub trait Mount: Send {
    /// Human-readable binding name
    fn name(&self) -> &str;

    /// Make the mount reachable.
    fn connect(&mut self) -> GuideResult<()>;

    /// Release the mount.
    fn disconnect(&mut self) -> GuideResult<()>;

    /// Whether the mount is connected
    fn is_connected(&self) -> bool;

    /// Issue one guide pulse of `duration_ms` in `direction`.
    fn guide(&mut self, direction: GuideDirection, duration_ms: u32) -> MoveResult;

    /// Abort signal checked before and during pulses.
    fn abort_signal(&self) -> AbortSignal;
}

/// Guide-relay output that can be shared between a camera and a mount.
///
/// Implementations serialize relay commands against the camera's other
/// device commands internally, which is why this takes `&self`.
pub trait St4Port: Send + Sync {
    /// Pulse `direction` for `duration_ms` and block until it completes.
    fn pulse(&self, direction: GuideDirection, duration_ms: u32) -> GuideResult<()>;

    /// Whether the owning camera is connected.
    fn is_available(&self) -> bool;
}
