//! Configuration using Figment
//!
//! Configuration is layered:
//! 1. Built-in defaults (every field has one)
//! 2. A TOML file (`config/guide_hal.toml` unless another path is given)
//! 3. Environment variables prefixed with `GUIDE_HAL_`, with `__` separating
//!    nested keys
//!
//! # Example
//! ```no_run
//! use guide_hal::config::GuideHalConfig;
//!
//! let config = GuideHalConfig::load()?;
//! println!("Camera driver: {:?}", config.camera.driver);
//! # Ok::<(), guide_hal::error::GuideError>(())
//! ```
//!
//! `GUIDE_HAL_MOUNT__EQMAC__REPLY_TIMEOUT_MS=8000` overrides
//! `[mount.eqmac] reply_timeout_ms`.

use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{GuideError, GuideResult};
use crate::hardware::eqmac::{EqMacProtocol, FourCharCode};
use crate::hardware::registry::{CameraDriver, EqMacTransportKind, MountDriver};
use crate::hardware::sbig::{Ccd, SbigPort, SbigSettings, SimulationSettings};

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/guide_hal.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "GUIDE_HAL_";

/// Upper bound for every millisecond timing setting (one hour).
pub const MAX_TIMING_MS: u64 = 3_600_000;

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuideHalConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Guide camera selection and timing
    pub camera: CameraConfig,
    /// Mount selection and protocol
    pub mount: MountConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "guide-hal".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Camera configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// Camera binding
    pub driver: CameraDriver,
    /// Identifier passed to `connect` (`USB`, `USB1`-`USB8`, `ETH:<ipv4>`)
    pub identifier: String,
    /// Sensor on dual-chip cameras
    pub ccd: Ccd,
    /// Binning factor (1-3)
    pub binning: u8,
    /// Status poll interval in milliseconds
    pub poll_interval_ms: u64,
    /// Readout allowance beyond the exposure, in milliseconds
    pub readout_timeout_ms: u64,
    /// Relay allowance beyond the pulse, in milliseconds
    pub relay_timeout_ms: u64,
    /// Simulated camera behavior
    pub simulation: SimulationSettings,
}

impl Default for CameraConfig {
    fn default() -> Self {
        let sbig = SbigSettings::default();
        Self {
            driver: CameraDriver::default(),
            identifier: default_identifier(),
            ccd: sbig.ccd,
            binning: sbig.binning,
            poll_interval_ms: sbig.poll_interval_ms,
            readout_timeout_ms: sbig.readout_timeout_ms,
            relay_timeout_ms: sbig.relay_timeout_ms,
            simulation: SimulationSettings::default(),
        }
    }
}

impl CameraConfig {
    /// Binding settings for an SBIG camera.
    pub fn sbig_settings(&self) -> SbigSettings {
        SbigSettings {
            ccd: self.ccd,
            binning: self.binning,
            poll_interval_ms: self.poll_interval_ms,
            readout_timeout_ms: self.readout_timeout_ms,
            relay_timeout_ms: self.relay_timeout_ms,
        }
    }
}

/// Mount configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MountConfig {
    /// Mount binding
    pub driver: MountDriver,
    /// EQMac settings (used when `driver = "eqmac"`)
    pub eqmac: EqMacConfig,
}

/// EQMac AppleEvent settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EqMacConfig {
    /// Event delivery
    pub transport: EqMacTransportKind,
    /// Application signature
    pub signature: String,
    /// Guide event class
    pub event_class: String,
    /// Guide event id
    pub event_id: String,
    /// Mount-type code
    pub mount_code: i32,
    /// Reply allowance beyond the pulse, in milliseconds
    pub reply_timeout_ms: u64,
    /// Reply statuses meaning "cancelled"
    pub stopped_codes: Vec<i16>,
}

impl Default for EqMacConfig {
    fn default() -> Self {
        let protocol = EqMacProtocol::default();
        Self {
            transport: EqMacTransportKind::default(),
            signature: protocol.signature.to_string(),
            event_class: protocol.event_class.to_string(),
            event_id: protocol.event_id.to_string(),
            mount_code: protocol.mount_code,
            reply_timeout_ms: default_reply_timeout(),
            stopped_codes: protocol.stopped_codes,
        }
    }
}

impl EqMacConfig {
    /// Resolve into protocol settings.
    pub fn protocol(&self) -> GuideResult<EqMacProtocol> {
        Ok(EqMacProtocol {
            signature: parse_code("signature", &self.signature)?,
            event_class: parse_code("event_class", &self.event_class)?,
            event_id: parse_code("event_id", &self.event_id)?,
            mount_code: self.mount_code,
            reply_timeout: Duration::from_millis(self.reply_timeout_ms),
            stopped_codes: self.stopped_codes.clone(),
        })
    }
}

fn parse_code(field: &str, value: &str) -> GuideResult<FourCharCode> {
    value
        .parse()
        .map_err(|e| GuideError::Configuration(format!("mount.eqmac.{}: {}", field, e)))
}

fn check_timing(field: &str, value_ms: u64) -> GuideResult<()> {
    if value_ms > MAX_TIMING_MS {
        return Err(GuideError::Configuration(format!(
            "{} is {} ms; the maximum is {} ms",
            field, value_ms, MAX_TIMING_MS
        )));
    }
    Ok(())
}

// Default value functions
fn default_identifier() -> String {
    "USB".to_string()
}

fn default_reply_timeout() -> u64 {
    5000
}

impl GuideHalConfig {
    /// Load from `config/guide_hal.toml` and the environment, then validate.
    pub fn load() -> GuideResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file path and the environment, then validate.
    ///
    /// A missing file is not an error; defaults apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> GuideResult<Self> {
        let config: Self = Self::figment(path).extract()?;
        config.validate()?;
        Ok(config)
    }

    /// The layered provider stack, for callers that add their own layers.
    pub fn figment<P: AsRef<Path>>(path: P) -> Figment {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> GuideResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(GuideError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let camera = &self.camera;
        if !(1..=3).contains(&camera.binning) {
            return Err(GuideError::Configuration(format!(
                "Invalid camera.binning {}. Must be 1, 2 or 3",
                camera.binning
            )));
        }
        if camera.poll_interval_ms == 0 {
            return Err(GuideError::Configuration(
                "camera.poll_interval_ms must be greater than 0".to_string(),
            ));
        }
        for (field, value) in [
            ("camera.poll_interval_ms", camera.poll_interval_ms),
            ("camera.readout_timeout_ms", camera.readout_timeout_ms),
            ("camera.relay_timeout_ms", camera.relay_timeout_ms),
            ("mount.eqmac.reply_timeout_ms", self.mount.eqmac.reply_timeout_ms),
        ] {
            check_timing(field, value)?;
        }
        camera
            .identifier
            .parse::<SbigPort>()
            .map_err(|e| GuideError::Configuration(format!("camera.identifier: {}", e)))?;

        let sim = &camera.simulation;
        if sim.width == 0 || sim.height == 0 {
            return Err(GuideError::Configuration(
                "camera.simulation width and height must be non-zero".to_string(),
            ));
        }
        if !sim.time_scale.is_finite() || sim.time_scale < 0.0 {
            return Err(GuideError::Configuration(format!(
                "Invalid camera.simulation.time_scale {}",
                sim.time_scale
            )));
        }

        let eqmac = &self.mount.eqmac;
        eqmac.protocol()?;
        if eqmac.reply_timeout_ms == 0 {
            return Err(GuideError::Configuration(
                "mount.eqmac.reply_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if eqmac.stopped_codes.contains(&0) {
            return Err(GuideError::Configuration(
                "mount.eqmac.stopped_codes cannot contain 0 (the success status)".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = GuideHalConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.camera.identifier, "USB");
        assert_eq!(config.mount.eqmac.signature, "EKEQ");
        assert_eq!(config.mount.eqmac.stopped_codes, vec![-128]);
    }

    #[test]
    fn test_config_validation() {
        let mut config = GuideHalConfig::default();
        config.application.log_level = "verbose".to_string();
        assert!(config.validate().is_err());

        let mut config = GuideHalConfig::default();
        config.camera.binning = 0;
        assert!(config.validate().is_err());

        let mut config = GuideHalConfig::default();
        config.camera.identifier = "COM1".to_string();
        assert!(config.validate().is_err());

        let mut config = GuideHalConfig::default();
        config.mount.eqmac.event_class = "MPj".to_string();
        assert!(matches!(
            config.validate(),
            Err(GuideError::Configuration(_))
        ));

        let mut config = GuideHalConfig::default();
        config.mount.eqmac.stopped_codes = vec![0];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_timing_upper_bound() {
        let mut config = GuideHalConfig::default();
        config.camera.readout_timeout_ms = MAX_TIMING_MS;
        assert!(config.validate().is_ok());

        config.camera.readout_timeout_ms = u64::MAX;
        assert!(config.validate().is_err());

        let mut config = GuideHalConfig::default();
        config.camera.relay_timeout_ms = MAX_TIMING_MS + 1;
        assert!(config.validate().is_err());

        let mut config = GuideHalConfig::default();
        config.mount.eqmac.reply_timeout_ms = u64::MAX;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_protocol_resolution() {
        let mut eqmac = EqMacConfig::default();
        eqmac.mount_code = 2;
        eqmac.reply_timeout_ms = 750;
        let protocol = eqmac.protocol().unwrap();
        assert_eq!(protocol.mount_code, 2);
        assert_eq!(protocol.reply_timeout, Duration::from_millis(750));
        assert_eq!(protocol.event_id, FourCharCode::from_bytes(b"GDe6"));
    }
}
