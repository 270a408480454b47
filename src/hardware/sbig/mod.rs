//! SBIG camera binding.
//!
//! `SbigCamera` implements [`GuideCamera`] on top of an [`SbigDriver`]. The
//! driver sits behind a mutex that is held for exactly one driver command,
//! and the same mutex is shared with [`SbigGuidePort`]. A relay pulse can
//! therefore run while an exposure is integrating, but never in the middle
//! of a driver command.
//!
//! ## Capture cycle
//!
//! 1. Validate connection state and the requested subframe.
//! 2. Pick the readout window (subframe, or full frame when the options
//!    force it).
//! 3. CC_START_EXPOSURE2.
//! 4. Poll CC_QUERY_COMMAND_STATUS until the exposure completes, the deadline
//!    (`duration + readout_timeout_ms`) passes or the abort signal fires.
//! 5. CC_END_EXPOSURE and read the window into scratch storage.
//! 6. Optionally subtract the registered dark frame.
//! 7. Move the finished frame into the caller's buffer.
//!
//! ## Example
//!
//! ```rust,ignore
//! let sim = SimulatedSbig::new(SimulationSettings::default());
//! let mut camera = SbigCamera::new(sim, SbigSettings::default())?;
//! camera.connect("USB")?;
//! let mut frame = ImageBuffer::empty();
//! camera.capture(2000, &mut frame, CaptureOptions::empty(), None)?;
//! ```

pub mod driver;
pub mod simulated;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{GuideError, GuideResult};
use crate::hardware::capabilities::{CaptureOptions, GuideCamera, St4Port};
use crate::hardware::{AbortSignal, ConnectionState, GuideDirection};
use crate::image::{ImageBuffer, Subframe};

pub use driver::{
    Ccd, CcdInfo, ExposureParams, ExposureStatus, ReadoutMode, ReadoutParams, RelayCommand,
    SbigCommand, SbigDriver, SbigError, SbigPort, SbigStatus, Shutter,
};
pub use simulated::{SimulatedSbig, SimulatedSbigHandle, SimulationSettings};

/// Pixel depth of every SBIG readout.
const SBIG_BITS_PER_PIXEL: u8 = 16;

/// Timing and sensor selection for an [`SbigCamera`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SbigSettings {
    /// Sensor to use on dual-chip cameras
    pub ccd: Ccd,
    /// Binning factor (1-3)
    pub binning: u8,
    /// Interval between exposure/relay status polls
    pub poll_interval_ms: u64,
    /// Allowance for readout beyond the exposure time
    pub readout_timeout_ms: u64,
    /// Allowance for relay completion beyond the pulse length
    pub relay_timeout_ms: u64,
}

impl Default for SbigSettings {
    fn default() -> Self {
        Self {
            ccd: Ccd::Imaging,
            binning: 1,
            poll_interval_ms: 10,
            readout_timeout_ms: 10_000,
            relay_timeout_ms: 2_000,
        }
    }
}

impl SbigSettings {
    fn readout_mode(&self) -> GuideResult<ReadoutMode> {
        ReadoutMode::from_binning(self.binning).ok_or_else(|| {
            GuideError::Configuration(format!(
                "SBIG binning must be 1, 2 or 3 (got {})",
                self.binning
            ))
        })
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

/// `now + budget`, or roughly a century ahead when that is not representable.
fn deadline_after(budget: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(budget)
        .or_else(|| now.checked_add(Duration::from_secs(100 * 365 * 24 * 3600)))
        .unwrap_or(now)
}

/// Guide relay shared by a camera and anything routing pulses through it.
pub struct SbigGuidePort<D: SbigDriver> {
    device: Arc<Mutex<D>>,
    connected: Arc<AtomicBool>,
    has_relay: Arc<AtomicBool>,
    abort: AbortSignal,
    poll_interval: Duration,
    relay_timeout: Duration,
}

impl<D: SbigDriver> SbigGuidePort<D> {
    fn stop_relays(&self) {
        if let Err(e) = self.device.lock().activate_relay(RelayCommand::default()) {
            warn!(error = %e, "failed to release guide relays");
        }
    }
}

impl<D: SbigDriver> St4Port for SbigGuidePort<D> {
    fn pulse(&self, direction: GuideDirection, duration_ms: u32) -> GuideResult<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(GuideError::NotConnected {
                device: "SBIG".to_string(),
            });
        }
        if duration_ms == 0 {
            debug!(%direction, "zero-length pulse, relays untouched");
            return Ok(());
        }
        if !self.has_relay.load(Ordering::SeqCst) {
            return Err(GuideError::PulseFailure(
                "camera has no guide relay port".to_string(),
            ));
        }
        if self.abort.is_requested() {
            return Err(GuideError::Aborted);
        }

        let command = RelayCommand::for_pulse(direction, duration_ms);
        debug!(%direction, duration_ms, ?command, "activating guide relay");
        self.device
            .lock()
            .activate_relay(command)
            .map_err(SbigError::into_pulse_error)?;

        let budget = Duration::from_millis(u64::from(command.max_duration_ms()))
            .saturating_add(self.relay_timeout);
        let deadline = deadline_after(budget);
        loop {
            let active = self
                .device
                .lock()
                .relay_active()
                .map_err(SbigError::into_pulse_error)?;
            if !active {
                return Ok(());
            }
            if self.abort.is_requested() {
                self.stop_relays();
                return Err(GuideError::Aborted);
            }
            let now = Instant::now();
            if now >= deadline {
                self.stop_relays();
                warn!(%direction, duration_ms, "guide relay did not release");
                return Err(GuideError::Timeout {
                    operation: format!("{} relay pulse", direction),
                    timeout_ms: budget.as_millis() as u64,
                });
            }
            thread::sleep(self.poll_interval.min(deadline - now));
        }
    }

    fn is_available(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// SBIG camera over a universal-driver implementation.
pub struct SbigCamera<D: SbigDriver> {
    settings: SbigSettings,
    readout_mode: ReadoutMode,
    device: Arc<Mutex<D>>,
    connected: Arc<AtomicBool>,
    has_relay: Arc<AtomicBool>,
    state: ConnectionState,
    identifier: Option<String>,
    ccd_info: Option<CcdInfo>,
    dark: Option<ImageBuffer>,
    abort: AbortSignal,
    frame_counter: u64,
    port: Arc<SbigGuidePort<D>>,
}

impl<D: SbigDriver + 'static> SbigCamera<D> {
    /// Wrap `driver`. Fails only on invalid settings.
    pub fn new(driver: D, settings: SbigSettings) -> GuideResult<Self> {
        let readout_mode = settings.readout_mode()?;
        let device = Arc::new(Mutex::new(driver));
        let connected = Arc::new(AtomicBool::new(false));
        let has_relay = Arc::new(AtomicBool::new(false));
        let abort = AbortSignal::new();
        let port = Arc::new(SbigGuidePort {
            device: device.clone(),
            connected: connected.clone(),
            has_relay: has_relay.clone(),
            abort: abort.clone(),
            poll_interval: settings.poll_interval(),
            relay_timeout: Duration::from_millis(settings.relay_timeout_ms),
        });
        Ok(Self {
            settings,
            readout_mode,
            device,
            connected,
            has_relay,
            state: ConnectionState::Disconnected,
            identifier: None,
            ccd_info: None,
            dark: None,
            abort,
            frame_counter: 0,
            port,
        })
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Sensor information from the last connect.
    pub fn ccd_info(&self) -> Option<&CcdInfo> {
        self.ccd_info.as_ref()
    }

    /// Register a dark frame for `CaptureOptions::SUBTRACT_DARK`.
    ///
    /// Used only when its dimensions match the captured frame.
    pub fn set_dark_frame(&mut self, dark: ImageBuffer) {
        debug!(width = dark.width(), height = dark.height(), "dark frame registered");
        self.dark = Some(dark);
    }

    /// Drop the registered dark frame.
    pub fn clear_dark_frame(&mut self) {
        self.dark = None;
    }

    fn open(&self, identifier: &str) -> GuideResult<CcdInfo> {
        let port: SbigPort = identifier.parse().map_err(|reason: String| {
            debug!(identifier, %reason, "unparseable SBIG identifier");
            GuideError::DeviceNotFound {
                identifier: identifier.to_string(),
            }
        })?;

        let mut device = self.device.lock();
        device
            .open_device(&port)
            .map_err(|e| e.into_connect_error(identifier))?;
        match device.ccd_info(self.settings.ccd) {
            Ok(info) => Ok(info),
            Err(e) => {
                if let Err(close_err) = device.close_device() {
                    warn!(error = %close_err, "close after failed CCD query");
                }
                Err(GuideError::ConnectionFailure {
                    device: format!("SBIG {}", identifier),
                    message: e.to_string(),
                })
            }
        }
    }

    fn expose_and_read(
        &self,
        duration_ms: u32,
        window: Subframe,
        sensor: (u32, u32),
    ) -> GuideResult<ImageBuffer> {
        let ccd = self.settings.ccd;
        let params = ExposureParams {
            ccd,
            duration_ms,
            shutter: Shutter::Open,
            readout_mode: self.readout_mode,
            window,
        };

        debug!(duration_ms, ?window, "starting SBIG exposure");
        self.device
            .lock()
            .start_exposure(&params)
            .map_err(SbigError::into_capture_error)?;
        let started_at = Utc::now();

        let budget = Duration::from_millis(
            u64::from(duration_ms).saturating_add(self.settings.readout_timeout_ms),
        );
        let deadline = deadline_after(budget);
        let poll = self.settings.poll_interval();
        loop {
            if self.abort.is_requested() {
                self.end_exposure_quietly(ccd);
                info!("SBIG exposure aborted");
                return Err(GuideError::Aborted);
            }
            let status = self.device.lock().exposure_status(ccd);
            match status.map_err(SbigError::into_capture_error)? {
                ExposureStatus::Complete => break,
                ExposureStatus::InProgress => {}
                ExposureStatus::Idle => {
                    return Err(GuideError::CaptureFailure(
                        "exposure stopped before completion".to_string(),
                    ));
                }
            }
            let now = Instant::now();
            if now >= deadline {
                self.end_exposure_quietly(ccd);
                warn!(duration_ms, "SBIG exposure did not complete");
                return Err(GuideError::Timeout {
                    operation: "SBIG exposure".to_string(),
                    timeout_ms: budget.as_millis() as u64,
                });
            }
            thread::sleep(poll.min(deadline - now));
        }

        let mut scratch = vec![0u16; window.pixel_count()];
        self.device
            .lock()
            .end_exposure(ccd)
            .map_err(SbigError::into_capture_error)?;
        self.device
            .lock()
            .readout(
                &ReadoutParams {
                    ccd,
                    readout_mode: self.readout_mode,
                    window,
                },
                &mut scratch,
            )
            .map_err(SbigError::into_capture_error)?;

        let (width, height) = sensor;
        let mut frame = if window.is_full(width, height) {
            ImageBuffer::from_pixels(width, height, SBIG_BITS_PER_PIXEL, scratch)?
        } else {
            let mut frame = ImageBuffer::new(width, height, SBIG_BITS_PER_PIXEL);
            frame.blit(window, &scratch)?;
            frame.subframe = Some(window);
            frame
        };
        frame.exposure_ms = duration_ms;
        frame.timestamp = Some(started_at);
        Ok(frame)
    }

    fn end_exposure_quietly(&self, ccd: Ccd) {
        if let Err(e) = self.device.lock().end_exposure(ccd) {
            warn!(error = %e, "failed to end abandoned exposure");
        }
    }
}

impl<D: SbigDriver + 'static> GuideCamera for SbigCamera<D> {
    fn name(&self) -> &str {
        "SBIG"
    }

    fn connect(&mut self, identifier: &str) -> GuideResult<()> {
        if self.state.is_connected() {
            if self.identifier.as_deref() == Some(identifier) {
                return Ok(());
            }
            self.disconnect();
        }

        let info = self.open(identifier)?;
        info!(
            identifier,
            camera = %info.camera_name,
            width = info.width,
            height = info.height,
            "SBIG camera connected"
        );
        self.has_relay.store(info.has_guide_relay, Ordering::SeqCst);
        self.ccd_info = Some(info);
        self.identifier = Some(identifier.to_string());
        self.state = ConnectionState::Connected;
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn disconnect(&mut self) {
        if !self.state.is_connected() {
            return;
        }
        self.connected.store(false, Ordering::SeqCst);
        if let Err(e) = self.device.lock().close_device() {
            warn!(error = %e, "SBIG close reported an error");
        }
        info!(identifier = ?self.identifier, "SBIG camera disconnected");
        self.state = ConnectionState::Disconnected;
        self.identifier = None;
    }

    fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    fn capture(
        &mut self,
        duration_ms: u32,
        buffer: &mut ImageBuffer,
        options: CaptureOptions,
        subframe: Option<Subframe>,
    ) -> GuideResult<()> {
        if !self.state.is_connected() {
            return Err(GuideError::NotConnected {
                device: self.name().to_string(),
            });
        }
        let (width, height) = self.full_size();
        if let Some(sf) = subframe {
            sf.validate_for_sensor(width, height)?;
        }

        let window = match subframe {
            Some(sf) if !options.wants_full_frame() => sf,
            Some(sf) => {
                debug!(?sf, ?options, "subframe ignored, reading full frame");
                Subframe::full(width, height)
            }
            None => Subframe::full(width, height),
        };

        self.state = ConnectionState::Capturing;
        let result = self.expose_and_read(duration_ms, window, (width, height));
        self.state = ConnectionState::Connected;
        let mut frame = result?;

        if options.contains(CaptureOptions::SUBTRACT_DARK)
            && !options.contains(CaptureOptions::RECON)
        {
            match &self.dark {
                Some(dark) if dark.dimensions() == frame.dimensions() => frame.subtract(dark)?,
                Some(_) => debug!("dark frame size differs, not subtracted"),
                None => debug!("no dark frame registered"),
            }
        }

        self.frame_counter += 1;
        frame.frame_number = self.frame_counter;
        *buffer = frame;
        Ok(())
    }

    fn has_non_gui_capture(&self) -> bool {
        self.device.lock().supports_headless_capture()
    }

    fn bits_per_pixel(&self) -> u8 {
        SBIG_BITS_PER_PIXEL
    }

    fn full_size(&self) -> (u32, u32) {
        self.ccd_info
            .as_ref()
            .map(|info| info.binned_size(self.readout_mode))
            .unwrap_or((0, 0))
    }

    fn has_guide_output(&self) -> bool {
        self.ccd_info
            .as_ref()
            .is_some_and(|info| info.has_guide_relay)
    }

    fn st4_pulse_guide_scope(
        &mut self,
        direction: GuideDirection,
        duration_ms: u32,
    ) -> GuideResult<()> {
        self.port.pulse(direction, duration_ms)
    }

    fn guide_port(&self) -> Option<Arc<dyn St4Port>> {
        let port: Arc<dyn St4Port> = self.port.clone();
        Some(port)
    }

    fn abort_signal(&self) -> AbortSignal {
        self.abort.clone()
    }
}

impl<D: SbigDriver> Drop for SbigCamera<D> {
    fn drop(&mut self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            let _ = self.device.lock().close_device();
        }
    }
}
