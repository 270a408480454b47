//! Device Registry for runtime binding selection
//!
//! The guiding loop never names a concrete binding. It asks the registry for
//! the camera and mount described by configuration and gets back trait
//! objects:
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                     DeviceRegistry                        │
//! │      Box<dyn GuideCamera>          Box<dyn Mount>         │
//! ├───────────────────────────────────────────────────────────┤
//! │                   Capability Traits                       │
//! │         GuideCamera | Mount | St4Port                     │
//! ├───────────────────────────────────────────────────────────┤
//! │                       Bindings                            │
//! │  SbigCamera<D> | EqMacMount<T> | OnCameraMount            │
//! ├───────────────────────────────────────────────────────────┤
//! │                  Vendor boundaries                        │
//! │  SbigDriver (SimulatedSbig) | AppleEventTransport         │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example Usage
//!
//! ```rust,ignore
//! let config = GuideHalConfig::load()?;
//! let mut registry = DeviceRegistry::from_config(&config)?;
//! registry.connect_all()?;
//! let (camera, mount) = registry.camera_and_mount();
//! camera.capture(1000, &mut frame, CaptureOptions::empty(), None)?;
//! mount.guide(GuideDirection::West, 400);
//! ```

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::GuideHalConfig;
use crate::error::{GuideError, GuideResult};
use crate::hardware::capabilities::{GuideCamera, Mount};
use crate::hardware::eqmac::{AppleEventTransport, EqMacMount, EqMacProtocol, SimulatedEqMac};
use crate::hardware::on_camera::OnCameraMount;
use crate::hardware::sbig::{SbigCamera, SimulatedSbig};

// =============================================================================
// Capabilities
// =============================================================================

/// Capabilities a binding can have (for introspection)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Takes exposures (`GuideCamera::capture`)
    Capture,
    /// Captures without an acquisition window
    HeadlessCapture,
    /// Has an ST4 guide relay port
    St4Guide,
    /// Accepts guide pulses (`Mount::guide`)
    Guide,
}

// =============================================================================
// Driver Types (Configuration)
// =============================================================================

/// Camera binding selected by `[camera] driver`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CameraDriver {
    /// SBIG binding over the simulated universal driver
    #[default]
    SbigSimulated,
}

impl CameraDriver {
    /// Get the capabilities this driver type provides
    pub fn capabilities(&self) -> Vec<Capability> {
        match self {
            CameraDriver::SbigSimulated => vec![
                Capability::Capture,
                Capability::HeadlessCapture,
                Capability::St4Guide,
            ],
        }
    }

    /// Get human-readable driver type name
    pub fn driver_name(&self) -> &'static str {
        match self {
            CameraDriver::SbigSimulated => "sbig_simulated",
        }
    }
}

/// Mount binding selected by `[mount] driver`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MountDriver {
    /// EQMac through AppleEvents
    #[default]
    #[serde(rename = "eqmac")]
    EqMac,
    /// Pulses through the camera's ST4 port
    OnCamera,
}

impl MountDriver {
    /// Get the capabilities this driver type provides
    pub fn capabilities(&self) -> Vec<Capability> {
        vec![Capability::Guide]
    }

    /// Get human-readable driver type name
    pub fn driver_name(&self) -> &'static str {
        match self {
            MountDriver::EqMac => "eqmac",
            MountDriver::OnCamera => "on_camera",
        }
    }
}

/// How EQMac events are delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EqMacTransportKind {
    /// In-process simulated application
    #[default]
    Simulated,
    /// CoreServices Apple Event Manager (macOS, `apple_events` feature)
    Native,
}

// =============================================================================
// Device Info (for introspection)
// =============================================================================

/// Information about an instantiated binding
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceInfo {
    /// Binding name reported by the device
    pub name: String,
    /// Driver type name (e.g., "sbig_simulated", "eqmac")
    pub driver_type: String,
    /// Capabilities this binding supports
    pub capabilities: Vec<Capability>,
    /// Whether the device is connected
    pub connected: bool,
    /// For cameras: sensor size at the current binning (0x0 until connected)
    pub frame_size: Option<(u32, u32)>,
    /// For cameras: bits per pixel
    pub bits_per_pixel: Option<u8>,
}

// =============================================================================
// Device Registry
// =============================================================================

/// Holds the camera and mount built from configuration
pub struct DeviceRegistry {
    camera_driver: CameraDriver,
    mount_driver: MountDriver,
    identifier: String,
    camera: Box<dyn GuideCamera>,
    mount: Box<dyn Mount>,
}

impl DeviceRegistry {
    /// Instantiate the bindings named by `config`.
    ///
    /// # Errors
    /// Returns `GuideError::Configuration` if the settings are invalid or a
    /// binding is unavailable on this build.
    pub fn from_config(config: &GuideHalConfig) -> GuideResult<Self> {
        config.validate()?;
        let camera = instantiate_camera(config)?;
        let mount = instantiate_mount(config, camera.as_ref())?;
        info!(
            camera = config.camera.driver.driver_name(),
            mount = config.mount.driver.driver_name(),
            "device registry ready"
        );
        Ok(Self {
            camera_driver: config.camera.driver,
            mount_driver: config.mount.driver,
            identifier: config.camera.identifier.clone(),
            camera,
            mount,
        })
    }

    /// Connect the camera, then the mount.
    pub fn connect_all(&mut self) -> GuideResult<()> {
        self.camera.connect(&self.identifier)?;
        self.mount.connect()
    }

    /// Disconnect the mount, then the camera. Non-fatal mount errors are
    /// logged and ignored.
    pub fn disconnect_all(&mut self) -> GuideResult<()> {
        let result = match self.mount.disconnect() {
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                debug!(error = %e, "mount disconnect reported a non-fatal error");
                Ok(())
            }
            Ok(()) => Ok(()),
        };
        self.camera.disconnect();
        if let Err(e) = &result {
            warn!(error = %e, "mount disconnect failed");
        }
        result
    }

    /// The configured camera
    pub fn camera_mut(&mut self) -> &mut dyn GuideCamera {
        self.camera.as_mut()
    }

    /// The configured mount
    pub fn mount_mut(&mut self) -> &mut dyn Mount {
        self.mount.as_mut()
    }

    /// Both devices at once.
    pub fn camera_and_mount(&mut self) -> (&mut dyn GuideCamera, &mut dyn Mount) {
        (self.camera.as_mut(), self.mount.as_mut())
    }

    /// Hand the devices to a guiding loop.
    pub fn into_parts(self) -> (Box<dyn GuideCamera>, Box<dyn Mount>) {
        (self.camera, self.mount)
    }

    /// Describe both devices.
    pub fn list_devices(&self) -> Vec<DeviceInfo> {
        let mut camera_caps = self.camera_driver.capabilities();
        if !self.camera.has_non_gui_capture() {
            camera_caps.retain(|c| *c != Capability::HeadlessCapture);
        }
        vec![
            DeviceInfo {
                name: self.camera.name().to_string(),
                driver_type: self.camera_driver.driver_name().to_string(),
                capabilities: camera_caps,
                connected: self.camera.is_connected(),
                frame_size: Some(self.camera.full_size()),
                bits_per_pixel: Some(self.camera.bits_per_pixel()),
            },
            DeviceInfo {
                name: self.mount.name().to_string(),
                driver_type: self.mount_driver.driver_name().to_string(),
                capabilities: self.mount_driver.capabilities(),
                connected: self.mount.is_connected(),
                frame_size: None,
                bits_per_pixel: None,
            },
        ]
    }

    /// Devices that support a specific capability, by name.
    pub fn devices_with_capability(&self, capability: Capability) -> Vec<String> {
        self.list_devices()
            .into_iter()
            .filter(|d| d.capabilities.contains(&capability))
            .map(|d| d.name)
            .collect()
    }
}

// =============================================================================
// Instantiation (Private)
// =============================================================================

fn instantiate_camera(config: &GuideHalConfig) -> GuideResult<Box<dyn GuideCamera>> {
    match config.camera.driver {
        CameraDriver::SbigSimulated => {
            let driver = SimulatedSbig::new(config.camera.simulation.clone());
            let camera = SbigCamera::new(driver, config.camera.sbig_settings())?;
            Ok(Box::new(camera))
        }
    }
}

fn instantiate_mount(
    config: &GuideHalConfig,
    camera: &dyn GuideCamera,
) -> GuideResult<Box<dyn Mount>> {
    match config.mount.driver {
        MountDriver::EqMac => {
            let protocol = config.mount.eqmac.protocol()?;
            let transport = eqmac_transport(config, &protocol)?;
            Ok(Box::new(EqMacMount::new(transport, protocol)))
        }
        MountDriver::OnCamera => {
            let port = camera.guide_port().ok_or_else(|| {
                GuideError::Configuration(format!(
                    "camera '{}' has no guide port for on-camera guiding",
                    camera.name()
                ))
            })?;
            Ok(Box::new(OnCameraMount::with_abort_signal(
                port,
                camera.abort_signal(),
            )))
        }
    }
}

fn eqmac_transport(
    config: &GuideHalConfig,
    protocol: &EqMacProtocol,
) -> GuideResult<Box<dyn AppleEventTransport>> {
    match config.mount.eqmac.transport {
        EqMacTransportKind::Simulated => Ok(Box::new(SimulatedEqMac::with_protocol(protocol))),
        #[cfg(all(target_os = "macos", feature = "apple_events"))]
        EqMacTransportKind::Native => Ok(Box::new(
            crate::hardware::eqmac::CoreServicesTransport::new(),
        )),
        #[cfg(not(all(target_os = "macos", feature = "apple_events")))]
        EqMacTransportKind::Native => Err(GuideError::Configuration(
            "native AppleEvent transport requires macOS and the 'apple_events' feature"
                .to_string(),
        )),
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_registry() {
        let registry = DeviceRegistry::from_config(&GuideHalConfig::default()).unwrap();
        let devices = registry.list_devices();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].driver_type, "sbig_simulated");
        assert_eq!(devices[1].driver_type, "eqmac");
        assert!(!devices[0].connected);
    }

    #[test]
    fn test_capability_queries() {
        let registry = DeviceRegistry::from_config(&GuideHalConfig::default()).unwrap();
        assert_eq!(registry.devices_with_capability(Capability::Guide), vec!["EQMac"]);
        assert_eq!(
            registry.devices_with_capability(Capability::St4Guide),
            vec!["SBIG"]
        );
    }

    #[test]
    fn test_native_transport_unavailable() {
        let mut config = GuideHalConfig::default();
        config.mount.eqmac.transport = EqMacTransportKind::Native;
        let result = DeviceRegistry::from_config(&config);
        if cfg!(all(target_os = "macos", feature = "apple_events")) {
            assert!(result.is_ok());
        } else {
            assert!(matches!(result, Err(GuideError::Configuration(_))));
        }
    }
}
