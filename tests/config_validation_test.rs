//! Tests for layered configuration loading and validation.
//!
//! Tests that touch `GUIDE_HAL_*` environment variables run under
//! `#[serial]` so they never see each other's overrides.

use std::io::Write;
use std::time::Duration;

use guide_hal::config::GuideHalConfig;
use guide_hal::error::GuideError;
use guide_hal::hardware::registry::{EqMacTransportKind, MountDriver};
use guide_hal::hardware::sbig::Ccd;
use serial_test::serial;
use tempfile::NamedTempFile;

fn write_config(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("create temp config");
    file.write_all(contents.as_bytes()).expect("write temp config");
    file
}

fn assert_config_error(result: Result<GuideHalConfig, GuideError>, needle: &str) {
    match result {
        Err(GuideError::Configuration(msg)) => {
            assert!(msg.contains(needle), "'{}' should mention '{}'", msg, needle)
        }
        other => panic!("expected configuration error, got {:?}", other),
    }
}

#[test]
#[serial]
fn test_missing_file_uses_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config = GuideHalConfig::load_from(dir.path().join("absent.toml")).unwrap();
    assert_eq!(config, GuideHalConfig::default());
}

#[test]
#[serial]
fn test_file_overrides_defaults() {
    let file = write_config(
        r#"
[application]
log_level = "debug"

[camera]
identifier = "USB2"
ccd = "tracking"
binning = 2

[camera.simulation]
usb_slots = [2]

[mount]
driver = "on_camera"

[mount.eqmac]
reply_timeout_ms = 1500
stopped_codes = [-128, -1711]
"#,
    );

    let config = GuideHalConfig::load_from(file.path()).unwrap();
    assert_eq!(config.application.log_level, "debug");
    assert_eq!(config.camera.identifier, "USB2");
    assert_eq!(config.camera.ccd, Ccd::Tracking);
    assert_eq!(config.camera.binning, 2);
    assert_eq!(config.camera.simulation.usb_slots, vec![2]);
    assert_eq!(config.mount.driver, MountDriver::OnCamera);

    let protocol = config.mount.eqmac.protocol().unwrap();
    assert_eq!(protocol.reply_timeout, Duration::from_millis(1500));
    assert_eq!(protocol.stopped_codes, vec![-128, -1711]);

    // Untouched keys keep their defaults
    assert_eq!(config.camera.poll_interval_ms, 10);
    assert_eq!(config.mount.eqmac.signature, "EKEQ");
}

#[test]
#[serial]
fn test_env_overrides_file() {
    let file = write_config(
        r#"
[mount.eqmac]
reply_timeout_ms = 1500
"#,
    );

    std::env::set_var("GUIDE_HAL_MOUNT__EQMAC__REPLY_TIMEOUT_MS", "8000");
    std::env::set_var("GUIDE_HAL_CAMERA__IDENTIFIER", "USB1");
    let result = GuideHalConfig::load_from(file.path());
    std::env::remove_var("GUIDE_HAL_MOUNT__EQMAC__REPLY_TIMEOUT_MS");
    std::env::remove_var("GUIDE_HAL_CAMERA__IDENTIFIER");

    let config = result.unwrap();
    assert_eq!(config.mount.eqmac.reply_timeout_ms, 8000);
    assert_eq!(config.camera.identifier, "USB1");
}

#[test]
#[serial]
fn test_env_selects_bindings() {
    std::env::set_var("GUIDE_HAL_MOUNT__DRIVER", "on_camera");
    std::env::set_var("GUIDE_HAL_MOUNT__EQMAC__TRANSPORT", "native");
    let dir = tempfile::tempdir().unwrap();
    let result = GuideHalConfig::load_from(dir.path().join("none.toml"));
    std::env::remove_var("GUIDE_HAL_MOUNT__DRIVER");
    std::env::remove_var("GUIDE_HAL_MOUNT__EQMAC__TRANSPORT");

    let config = result.unwrap();
    assert_eq!(config.mount.driver, MountDriver::OnCamera);
    assert_eq!(config.mount.eqmac.transport, EqMacTransportKind::Native);
}

#[test]
#[serial]
fn test_invalid_values_rejected_on_load() {
    let file = write_config("[camera]\nbinning = 4\n");
    assert_config_error(GuideHalConfig::load_from(file.path()), "binning");

    let file = write_config("[camera]\nidentifier = \"LPT1\"\n");
    assert_config_error(GuideHalConfig::load_from(file.path()), "identifier");

    let file = write_config("[camera]\npoll_interval_ms = 0\n");
    assert_config_error(GuideHalConfig::load_from(file.path()), "poll_interval_ms");

    let file = write_config("[camera.simulation]\ntime_scale = -1.0\n");
    assert_config_error(GuideHalConfig::load_from(file.path()), "time_scale");

    let file = write_config("[mount.eqmac]\nsignature = \"EQMAC\"\n");
    assert_config_error(GuideHalConfig::load_from(file.path()), "signature");

    let file = write_config("[mount.eqmac]\nreply_timeout_ms = 0\n");
    assert_config_error(GuideHalConfig::load_from(file.path()), "reply_timeout_ms");

    let file = write_config("[application]\nlog_level = \"loud\"\n");
    assert_config_error(GuideHalConfig::load_from(file.path()), "log_level");
}

#[test]
#[serial]
fn test_oversized_timeouts_rejected() {
    std::env::set_var("GUIDE_HAL_CAMERA__READOUT_TIMEOUT_MS", u64::MAX.to_string());
    let dir = tempfile::tempdir().unwrap();
    let result = GuideHalConfig::load_from(dir.path().join("none.toml"));
    std::env::remove_var("GUIDE_HAL_CAMERA__READOUT_TIMEOUT_MS");
    assert_config_error(result, "camera.readout_timeout_ms");

    let file = write_config("[camera]\nrelay_timeout_ms = 3600001\n");
    assert_config_error(GuideHalConfig::load_from(file.path()), "relay_timeout_ms");
}

#[test]
#[serial]
fn test_unknown_driver_is_extraction_error() {
    let file = write_config("[mount]\ndriver = \"lx200\"\n");
    let err = GuideHalConfig::load_from(file.path()).unwrap_err();
    assert!(matches!(err, GuideError::Config(_)), "got {:?}", err);
}

#[test]
#[serial]
fn test_shipped_config_matches_defaults() {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/config/guide_hal.toml");
    let config = GuideHalConfig::load_from(path).unwrap();
    assert_eq!(config, GuideHalConfig::default());
}

#[test]
fn test_serialized_config_round_trips() {
    let mut config = GuideHalConfig::default();
    config.camera.identifier = "ETH:192.168.0.40".to_string();
    config.mount.eqmac.mount_code = 3;

    let text = toml::to_string_pretty(&config).unwrap();
    let parsed: GuideHalConfig = toml::from_str(&text).unwrap();
    assert_eq!(parsed, config);
    assert!(parsed.validate().is_ok());
}
