//! Integration tests for runtime binding selection.
//!
//! Builds cameras and mounts through `DeviceRegistry` and drives them only
//! through the `GuideCamera` and `Mount` trait objects.

use std::time::Duration;

use guide_hal::config::GuideHalConfig;
use guide_hal::error::GuideError;
use guide_hal::hardware::registry::{Capability, DeviceRegistry, MountDriver};
use guide_hal::hardware::{CaptureOptions, GuideDirection, MoveResult};
use guide_hal::image::ImageBuffer;

fn fast_config() -> GuideHalConfig {
    let mut config = GuideHalConfig::default();
    config.camera.simulation.time_scale = 0.001;
    config.camera.poll_interval_ms = 1;
    config
}

#[test]
fn test_default_bindings_guide_and_capture() {
    let mut registry = DeviceRegistry::from_config(&fast_config()).unwrap();
    registry.connect_all().unwrap();

    let (camera, mount) = registry.camera_and_mount();
    let mut frame = ImageBuffer::empty();
    camera
        .capture(1000, &mut frame, CaptureOptions::SUBTRACT_DARK, None)
        .unwrap();
    assert_eq!(frame.dimensions(), camera.full_size());
    assert_eq!(frame.bits_per_pixel(), camera.bits_per_pixel());

    assert_eq!(mount.guide(GuideDirection::West, 400), MoveResult::Success);

    // EQMac reports NothingToDisconnect, which disconnect_all swallows
    registry.disconnect_all().unwrap();
    let devices = registry.list_devices();
    assert!(devices.iter().all(|d| !d.connected));
}

#[test]
fn test_on_camera_mount_uses_guide_relay() {
    let mut config = fast_config();
    config.mount.driver = MountDriver::OnCamera;
    let mut registry = DeviceRegistry::from_config(&config).unwrap();

    // Pulses need the camera connected first
    assert_eq!(
        registry.mount_mut().guide(GuideDirection::North, 100),
        MoveResult::Error
    );

    registry.connect_all().unwrap();
    assert_eq!(registry.mount_mut().name(), "On-camera");
    assert_eq!(
        registry.mount_mut().guide(GuideDirection::North, 100),
        MoveResult::Success
    );
    assert_eq!(
        registry.mount_mut().guide(GuideDirection::East, 0),
        MoveResult::Success
    );

    registry.disconnect_all().unwrap();
    assert!(!registry.mount_mut().is_connected());
}

#[test]
fn test_on_camera_mount_requires_connected_camera() {
    let mut config = fast_config();
    config.mount.driver = MountDriver::OnCamera;
    let registry = DeviceRegistry::from_config(&config).unwrap();

    let (mut camera, mut mount) = registry.into_parts();
    let err = mount.connect().unwrap_err();
    assert!(matches!(err, GuideError::ConnectionFailure { .. }), "got {:?}", err);

    camera.connect("USB").unwrap();
    mount.connect().unwrap();
    camera.disconnect();
    assert_eq!(mount.guide(GuideDirection::South, 50), MoveResult::Error);
}

#[test]
fn test_on_camera_abort_stops_pulse() {
    let mut config = GuideHalConfig::default();
    config.mount.driver = MountDriver::OnCamera;
    config.camera.poll_interval_ms = 2;
    let mut registry = DeviceRegistry::from_config(&config).unwrap();
    registry.connect_all().unwrap();

    let abort = registry.mount_mut().abort_signal();
    let aborter = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(30));
        abort.request();
    });
    let result = registry.mount_mut().guide(GuideDirection::West, 5_000);
    aborter.join().unwrap();
    assert_eq!(result, MoveResult::Stopped);
}

#[test]
fn test_capability_introspection() {
    let mut config = fast_config();
    config.camera.simulation.headless = false;
    let registry = DeviceRegistry::from_config(&config).unwrap();

    let devices = registry.list_devices();
    let camera = &devices[0];
    assert!(camera.capabilities.contains(&Capability::Capture));
    assert!(camera.capabilities.contains(&Capability::St4Guide));
    assert!(!camera.capabilities.contains(&Capability::HeadlessCapture));
    assert_eq!(camera.frame_size, Some((0, 0)), "size unknown until connect");
    assert_eq!(camera.bits_per_pixel, Some(16));

    assert_eq!(
        registry.devices_with_capability(Capability::Guide),
        vec!["EQMac".to_string()]
    );
    assert!(registry
        .devices_with_capability(Capability::HeadlessCapture)
        .is_empty());
}

#[test]
fn test_connect_all_reports_missing_camera() {
    let mut config = fast_config();
    config.camera.identifier = "USB4".to_string();
    let mut registry = DeviceRegistry::from_config(&config).unwrap();
    let err = registry.connect_all().unwrap_err();
    assert!(err.is_not_found());
}

#[test]
fn test_invalid_config_rejected() {
    let mut config = GuideHalConfig::default();
    config.camera.binning = 5;
    assert!(matches!(
        DeviceRegistry::from_config(&config),
        Err(GuideError::Configuration(_))
    ));
}
