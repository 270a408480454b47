//! In-process stand-in for the SBIG universal driver.
//!
//! Produces deterministic synthetic frames (bias level, seeded noise and one
//! Gaussian star), scales exposure and relay timing so tests run fast, and
//! lets tests inject driver faults through a [`SimulatedSbigHandle`] that
//! stays usable after the driver has been moved into a camera.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::driver::{
    Ccd, CcdInfo, ExposureParams, ExposureStatus, ReadoutParams, RelayCommand, SbigCommand,
    SbigDriver, SbigError, SbigPort, SbigStatus, Shutter,
};

/// Geometry and behavior of the simulated camera.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationSettings {
    /// Model name reported by CC_GET_CCD_INFO
    pub camera_name: String,
    /// Imaging CCD width (unbinned)
    pub width: u32,
    /// Imaging CCD height (unbinned)
    pub height: u32,
    /// Tracking CCD size, if the camera has one
    pub tracking_size: Option<(u32, u32)>,
    /// Pixel size in microns
    pub pixel_um: f64,
    /// Whether the camera has a guide relay port
    pub guide_relay: bool,
    /// Whether exposures run without the driver's dialog
    pub headless: bool,
    /// Multiplier applied to exposure and relay durations
    pub time_scale: f64,
    /// USB slots with a camera attached
    pub usb_slots: Vec<u8>,
    /// Bias level in ADU
    pub bias: u16,
    /// Peak star signal per second of exposure, in ADU
    pub star_flux: f64,
    /// Noise RNG seed
    pub seed: u64,
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            camera_name: "SBIG ST-7 (simulated)".to_string(),
            width: 765,
            height: 510,
            tracking_size: Some((657, 495)),
            pixel_um: 9.0,
            guide_relay: true,
            headless: true,
            time_scale: 1.0,
            usb_slots: vec![1],
            bias: 1000,
            star_flux: 20_000.0,
            seed: 42,
        }
    }
}

/// Relay commands kept for inspection; older ones are dropped first.
const RELAY_LOG_LIMIT: usize = 256;

/// Counters and fault switches shared between the driver and its handle.
#[derive(Debug, Default)]
struct SimulatorState {
    busy: bool,
    unplugged: bool,
    fault: Option<SbigError>,
    exposures_started: u64,
    exposures_ended: u64,
    readouts: u64,
    relay_log: VecDeque<RelayCommand>,
}

#[derive(Debug, Clone, Copy)]
struct ActiveExposure {
    ccd: Ccd,
    started: Instant,
    length: Duration,
    params: ExposureParams,
}

/// Test handle to a [`SimulatedSbig`].
#[derive(Debug, Clone)]
pub struct SimulatedSbigHandle {
    state: Arc<Mutex<SimulatorState>>,
}

impl SimulatedSbigHandle {
    /// Make the next `command` fail with `status`.
    pub fn fail_next(&self, command: SbigCommand, status: SbigStatus) {
        self.state.lock().fault = Some(SbigError::new(command, status));
    }

    /// Simulate another process holding the camera.
    pub fn set_busy(&self, busy: bool) {
        self.state.lock().busy = busy;
    }

    /// Simulate the camera being unplugged: status polls stop answering.
    pub fn set_unplugged(&self, unplugged: bool) {
        self.state.lock().unplugged = unplugged;
    }

    /// Exposures started so far.
    pub fn exposures_started(&self) -> u64 {
        self.state.lock().exposures_started
    }

    /// CC_END_EXPOSURE calls so far.
    pub fn exposures_ended(&self) -> u64 {
        self.state.lock().exposures_ended
    }

    /// Completed readouts so far.
    pub fn readouts(&self) -> u64 {
        self.state.lock().readouts
    }

    /// The most recent non-idle relay commands, oldest first.
    pub fn relay_log(&self) -> Vec<RelayCommand> {
        self.state.lock().relay_log.iter().copied().collect()
    }
}

/// Simulated universal driver.
#[derive(Debug)]
pub struct SimulatedSbig {
    settings: SimulationSettings,
    open: Option<SbigPort>,
    exposure: Option<ActiveExposure>,
    relay_until: Option<Instant>,
    rng: StdRng,
    shared: Arc<Mutex<SimulatorState>>,
}

impl SimulatedSbig {
    /// Create a simulator.
    pub fn new(settings: SimulationSettings) -> Self {
        let rng = StdRng::seed_from_u64(settings.seed);
        Self {
            settings,
            open: None,
            exposure: None,
            relay_until: None,
            rng,
            shared: Arc::new(Mutex::new(SimulatorState::default())),
        }
    }

    /// Handle for fault injection and inspection.
    pub fn handle(&self) -> SimulatedSbigHandle {
        SimulatedSbigHandle {
            state: self.shared.clone(),
        }
    }

    /// Settings in use.
    pub fn settings(&self) -> &SimulationSettings {
        &self.settings
    }

    fn scaled(&self, ms: u32) -> Duration {
        Duration::from_secs_f64(f64::from(ms) / 1000.0 * self.settings.time_scale.max(0.0))
    }

    fn take_fault(&self, command: SbigCommand) -> Result<(), SbigError> {
        let mut state = self.shared.lock();
        match state.fault {
            Some(fault) if fault.command == command => {
                state.fault = None;
                Err(fault)
            }
            _ => Ok(()),
        }
    }

    fn require_open(&self, command: SbigCommand) -> Result<(), SbigError> {
        if self.open.is_some() {
            Ok(())
        } else {
            Err(SbigError::new(command, SbigStatus::DeviceNotOpen))
        }
    }

    fn ccd_size(&self, ccd: Ccd) -> Option<(u32, u32)> {
        match ccd {
            Ccd::Imaging => Some((self.settings.width, self.settings.height)),
            Ccd::Tracking => self.settings.tracking_size,
        }
    }

    fn port_present(&self, port: &SbigPort) -> bool {
        match port {
            SbigPort::UsbAuto => !self.settings.usb_slots.is_empty(),
            SbigPort::Usb(slot) => self.settings.usb_slots.contains(slot),
            SbigPort::Ethernet(_) => false,
        }
    }

    /// Synthetic pixel at binned coordinates.
    fn render_pixel(&mut self, x: u32, y: u32, bin: u32, star: Option<(f64, f64, f64)>) -> u16 {
        let mut value = f64::from(self.settings.bias) * f64::from(bin * bin);
        if let Some((cx, cy, peak)) = star {
            let px = (f64::from(x) + 0.5) * f64::from(bin);
            let py = (f64::from(y) + 0.5) * f64::from(bin);
            let r2 = (px - cx).powi(2) + (py - cy).powi(2);
            value += peak * (-r2 / (2.0 * 2.5_f64.powi(2))).exp();
        }
        value += self.rng.gen_range(-20.0..20.0);
        value.clamp(0.0, f64::from(u16::MAX)) as u16
    }
}

impl SbigDriver for SimulatedSbig {
    fn open_device(&mut self, port: &SbigPort) -> Result<(), SbigError> {
        self.take_fault(SbigCommand::OpenDevice)?;
        if self.open.is_some() {
            return Err(SbigError::new(
                SbigCommand::OpenDevice,
                SbigStatus::DeviceNotClosed,
            ));
        }
        if !self.port_present(port) {
            return Err(SbigError::new(
                SbigCommand::OpenDevice,
                SbigStatus::CameraNotFound,
            ));
        }
        if self.shared.lock().busy {
            return Err(SbigError::new(SbigCommand::OpenDevice, SbigStatus::ShareError));
        }
        debug!(port = %port, "simulated SBIG device opened");
        self.open = Some(*port);
        Ok(())
    }

    fn close_device(&mut self) -> Result<(), SbigError> {
        self.take_fault(SbigCommand::CloseDevice)?;
        self.open = None;
        self.exposure = None;
        self.relay_until = None;
        Ok(())
    }

    fn ccd_info(&mut self, ccd: Ccd) -> Result<CcdInfo, SbigError> {
        self.take_fault(SbigCommand::GetCcdInfo)?;
        self.require_open(SbigCommand::GetCcdInfo)?;
        let (width, height) = self
            .ccd_size(ccd)
            .ok_or_else(|| SbigError::new(SbigCommand::GetCcdInfo, SbigStatus::BadParameter))?;
        Ok(CcdInfo {
            camera_name: self.settings.camera_name.clone(),
            width,
            height,
            pixel_width_um: self.settings.pixel_um,
            pixel_height_um: self.settings.pixel_um,
            has_guide_relay: self.settings.guide_relay,
        })
    }

    fn start_exposure(&mut self, params: &ExposureParams) -> Result<(), SbigError> {
        self.take_fault(SbigCommand::StartExposure)?;
        self.require_open(SbigCommand::StartExposure)?;
        if self.exposure.is_some() {
            return Err(SbigError::new(
                SbigCommand::StartExposure,
                SbigStatus::ExposureInProgress,
            ));
        }
        let length = self.scaled(params.duration_ms);
        self.exposure = Some(ActiveExposure {
            ccd: params.ccd,
            started: Instant::now(),
            length,
            params: *params,
        });
        self.shared.lock().exposures_started += 1;
        Ok(())
    }

    fn exposure_status(&mut self, ccd: Ccd) -> Result<ExposureStatus, SbigError> {
        self.take_fault(SbigCommand::QueryStatus)?;
        self.require_open(SbigCommand::QueryStatus)?;
        if self.shared.lock().unplugged {
            return Ok(ExposureStatus::InProgress);
        }
        Ok(match self.exposure {
            Some(exp) if exp.ccd == ccd => {
                if exp.started.elapsed() >= exp.length {
                    ExposureStatus::Complete
                } else {
                    ExposureStatus::InProgress
                }
            }
            _ => ExposureStatus::Idle,
        })
    }

    fn end_exposure(&mut self, ccd: Ccd) -> Result<(), SbigError> {
        self.take_fault(SbigCommand::EndExposure)?;
        self.require_open(SbigCommand::EndExposure)?;
        if let Some(exp) = self.exposure {
            if exp.ccd == ccd && exp.started.elapsed() < exp.length {
                // Ended early: frame is abandoned.
                self.exposure = None;
            }
        }
        self.shared.lock().exposures_ended += 1;
        Ok(())
    }

    fn readout(&mut self, params: &ReadoutParams, dest: &mut [u16]) -> Result<(), SbigError> {
        // A readout consumes the exposure even when it fails.
        let pending = self.exposure.take();
        self.take_fault(SbigCommand::Readout)?;
        self.require_open(SbigCommand::Readout)?;
        let exp = pending
            .filter(|e| e.ccd == params.ccd)
            .ok_or_else(|| {
                SbigError::new(SbigCommand::Readout, SbigStatus::NoExposureInProgress)
            })?;
        if dest.len() != params.window.pixel_count() {
            return Err(SbigError::new(SbigCommand::Readout, SbigStatus::BadLength));
        }

        let (width, height) = self
            .ccd_size(params.ccd)
            .ok_or_else(|| SbigError::new(SbigCommand::Readout, SbigStatus::BadParameter))?;
        let bin = params.readout_mode.factor();
        if !params.window.is_valid_for(width / bin, height / bin) {
            return Err(SbigError::new(SbigCommand::Readout, SbigStatus::BadParameter));
        }

        let star = match exp.params.shutter {
            Shutter::Open => Some((
                f64::from(width) / 2.0,
                f64::from(height) / 2.0,
                self.settings.star_flux * f64::from(exp.params.duration_ms) / 1000.0,
            )),
            Shutter::Closed => None,
        };

        let window = params.window;
        let row_len = window.width as usize;
        for (row, line) in dest.chunks_exact_mut(row_len).enumerate() {
            for (col, pixel) in line.iter_mut().enumerate() {
                *pixel = self.render_pixel(
                    window.x + col as u32,
                    window.y + row as u32,
                    bin,
                    star,
                );
            }
        }
        self.shared.lock().readouts += 1;
        Ok(())
    }

    fn activate_relay(&mut self, command: RelayCommand) -> Result<(), SbigError> {
        self.take_fault(SbigCommand::ActivateRelay)?;
        self.require_open(SbigCommand::ActivateRelay)?;
        if !self.settings.guide_relay {
            return Err(SbigError::new(
                SbigCommand::ActivateRelay,
                SbigStatus::BadCameraCommand,
            ));
        }
        if command.is_idle() {
            self.relay_until = None;
            return Ok(());
        }
        self.relay_until = Some(Instant::now() + self.scaled(command.max_duration_ms()));
        let mut shared = self.shared.lock();
        if shared.relay_log.len() == RELAY_LOG_LIMIT {
            shared.relay_log.pop_front();
        }
        shared.relay_log.push_back(command);
        Ok(())
    }

    fn relay_active(&mut self) -> Result<bool, SbigError> {
        self.take_fault(SbigCommand::QueryStatus)?;
        self.require_open(SbigCommand::QueryStatus)?;
        if self.shared.lock().unplugged {
            return Ok(true);
        }
        Ok(self.relay_until.is_some_and(|until| Instant::now() < until))
    }

    fn supports_headless_capture(&self) -> bool {
        self.settings.headless
    }
}
