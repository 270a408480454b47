//! SBIG universal-driver boundary.
//!
//! `SbigDriver` mirrors the command set of the SBIG universal driver
//! (`SBIGUnivDrvCommand`): open the device, query the CCD, run the
//! start/poll/end exposure cycle, read out a window, and drive the guide
//! relays. Status codes are the driver's `CE_*` values. Nothing above
//! `hardware::sbig` sees them: [`SbigError::into_connect_error`] and friends
//! translate them into `GuideError`.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::GuideError;
use crate::hardware::GuideDirection;
use crate::image::Subframe;

/// Universal driver commands issued by the binding (for error context).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SbigCommand {
    /// CC_OPEN_DRIVER / CC_OPEN_DEVICE / CC_ESTABLISH_LINK
    OpenDevice,
    /// CC_CLOSE_DEVICE / CC_CLOSE_DRIVER
    CloseDevice,
    /// CC_GET_CCD_INFO
    GetCcdInfo,
    /// CC_START_EXPOSURE2
    StartExposure,
    /// CC_QUERY_COMMAND_STATUS
    QueryStatus,
    /// CC_END_EXPOSURE
    EndExposure,
    /// CC_START_READOUT / CC_READOUT_LINE / CC_END_READOUT
    Readout,
    /// CC_ACTIVATE_RELAY
    ActivateRelay,
}

impl fmt::Display for SbigCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SbigCommand::OpenDevice => "CC_OPEN_DEVICE",
            SbigCommand::CloseDevice => "CC_CLOSE_DEVICE",
            SbigCommand::GetCcdInfo => "CC_GET_CCD_INFO",
            SbigCommand::StartExposure => "CC_START_EXPOSURE2",
            SbigCommand::QueryStatus => "CC_QUERY_COMMAND_STATUS",
            SbigCommand::EndExposure => "CC_END_EXPOSURE",
            SbigCommand::Readout => "CC_READOUT_LINE",
            SbigCommand::ActivateRelay => "CC_ACTIVATE_RELAY",
        };
        write!(f, "{}", label)
    }
}

/// Universal driver status codes (`PAR_ERROR`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SbigStatus {
    /// CE_NO_ERROR
    NoError,
    /// CE_CAMERA_NOT_FOUND
    CameraNotFound,
    /// CE_EXPOSURE_IN_PROGRESS
    ExposureInProgress,
    /// CE_NO_EXPOSURE_IN_PROGRESS
    NoExposureInProgress,
    /// CE_UNKNOWN_COMMAND
    UnknownCommand,
    /// CE_BAD_CAMERA_COMMAND
    BadCameraCommand,
    /// CE_BAD_PARAMETER
    BadParameter,
    /// CE_TX_TIMEOUT
    TxTimeout,
    /// CE_RX_TIMEOUT
    RxTimeout,
    /// CE_NAK_RECEIVED
    NakReceived,
    /// CE_CAN_RECEIVED
    CanReceived,
    /// CE_UNKNOWN_RESPONSE
    UnknownResponse,
    /// CE_BAD_LENGTH
    BadLength,
    /// CE_AD_TIMEOUT
    AdTimeout,
    /// CE_KBD_ESC
    KeyboardEscape,
    /// CE_CHECKSUM_ERROR
    ChecksumError,
    /// CE_EEPROM_ERROR
    EepromError,
    /// CE_SHUTTER_ERROR
    ShutterError,
    /// CE_UNKNOWN_CAMERA
    UnknownCamera,
    /// CE_DRIVER_NOT_FOUND
    DriverNotFound,
    /// CE_DRIVER_NOT_OPEN
    DriverNotOpen,
    /// CE_DRIVER_NOT_CLOSED
    DriverNotClosed,
    /// CE_SHARE_ERROR
    ShareError,
    /// CE_TCE_NOT_FOUND
    TceNotFound,
    /// CE_AO_ERROR
    AoError,
    /// CE_ECP_ERROR
    EcpError,
    /// CE_MEMORY_ERROR
    MemoryError,
    /// CE_DEVICE_NOT_FOUND
    DeviceNotFound,
    /// CE_DEVICE_NOT_OPEN
    DeviceNotOpen,
    /// CE_DEVICE_NOT_CLOSED
    DeviceNotClosed,
    /// CE_DEVICE_NOT_IMPLEMENTED
    DeviceNotImplemented,
    /// CE_DEVICE_DISABLED
    DeviceDisabled,
    /// CE_OS_ERROR
    OsError,
    /// CE_SOCK_ERROR
    SocketError,
    /// CE_SERVER_NOT_FOUND
    ServerNotFound,
    /// Any code this binding does not know
    Unknown(u16),
}

impl SbigStatus {
    /// Decode a raw `PAR_ERROR` value.
    pub fn from_code(code: u16) -> Self {
        match code {
            0 => Self::NoError,
            1 => Self::CameraNotFound,
            2 => Self::ExposureInProgress,
            3 => Self::NoExposureInProgress,
            4 => Self::UnknownCommand,
            5 => Self::BadCameraCommand,
            6 => Self::BadParameter,
            7 => Self::TxTimeout,
            8 => Self::RxTimeout,
            9 => Self::NakReceived,
            10 => Self::CanReceived,
            11 => Self::UnknownResponse,
            12 => Self::BadLength,
            13 => Self::AdTimeout,
            14 => Self::KeyboardEscape,
            15 => Self::ChecksumError,
            16 => Self::EepromError,
            17 => Self::ShutterError,
            18 => Self::UnknownCamera,
            19 => Self::DriverNotFound,
            20 => Self::DriverNotOpen,
            21 => Self::DriverNotClosed,
            22 => Self::ShareError,
            23 => Self::TceNotFound,
            24 => Self::AoError,
            25 => Self::EcpError,
            26 => Self::MemoryError,
            27 => Self::DeviceNotFound,
            28 => Self::DeviceNotOpen,
            29 => Self::DeviceNotClosed,
            30 => Self::DeviceNotImplemented,
            31 => Self::DeviceDisabled,
            32 => Self::OsError,
            33 => Self::SocketError,
            34 => Self::ServerNotFound,
            other => Self::Unknown(other),
        }
    }

    /// Raw `PAR_ERROR` value.
    pub fn code(self) -> u16 {
        match self {
            Self::NoError => 0,
            Self::CameraNotFound => 1,
            Self::ExposureInProgress => 2,
            Self::NoExposureInProgress => 3,
            Self::UnknownCommand => 4,
            Self::BadCameraCommand => 5,
            Self::BadParameter => 6,
            Self::TxTimeout => 7,
            Self::RxTimeout => 8,
            Self::NakReceived => 9,
            Self::CanReceived => 10,
            Self::UnknownResponse => 11,
            Self::BadLength => 12,
            Self::AdTimeout => 13,
            Self::KeyboardEscape => 14,
            Self::ChecksumError => 15,
            Self::EepromError => 16,
            Self::ShutterError => 17,
            Self::UnknownCamera => 18,
            Self::DriverNotFound => 19,
            Self::DriverNotOpen => 20,
            Self::DriverNotClosed => 21,
            Self::ShareError => 22,
            Self::TceNotFound => 23,
            Self::AoError => 24,
            Self::EcpError => 25,
            Self::MemoryError => 26,
            Self::DeviceNotFound => 27,
            Self::DeviceNotOpen => 28,
            Self::DeviceNotClosed => 29,
            Self::DeviceNotImplemented => 30,
            Self::DeviceDisabled => 31,
            Self::OsError => 32,
            Self::SocketError => 33,
            Self::ServerNotFound => 34,
            Self::Unknown(code) => code,
        }
    }

    fn is_not_found(self) -> bool {
        matches!(
            self,
            Self::CameraNotFound
                | Self::UnknownCamera
                | Self::DriverNotFound
                | Self::DeviceNotFound
                | Self::ServerNotFound
        )
    }

    fn is_busy(self) -> bool {
        matches!(
            self,
            Self::ShareError | Self::DriverNotClosed | Self::DeviceNotClosed
        )
    }

    fn is_timeout(self) -> bool {
        matches!(self, Self::TxTimeout | Self::RxTimeout | Self::AdTimeout)
    }
}

impl fmt::Display for SbigStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown(code) => write!(f, "unknown status {}", code),
            other => write!(f, "{:?} ({})", other, other.code()),
        }
    }
}

/// A universal-driver command that returned an error status.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("SBIG {command} failed: {status}")]
pub struct SbigError {
    /// Command that failed
    pub command: SbigCommand,
    /// Status returned by the driver
    pub status: SbigStatus,
}

impl SbigError {
    /// Create an error for `command`.
    pub fn new(command: SbigCommand, status: SbigStatus) -> Self {
        Self { command, status }
    }

    /// Translate a failure while opening `identifier`.
    pub fn into_connect_error(self, identifier: &str) -> GuideError {
        if self.status.is_not_found() {
            GuideError::DeviceNotFound {
                identifier: identifier.to_string(),
            }
        } else if self.status.is_busy() {
            GuideError::DeviceBusy {
                identifier: identifier.to_string(),
            }
        } else {
            GuideError::ConnectionFailure {
                device: format!("SBIG {}", identifier),
                message: self.to_string(),
            }
        }
    }

    /// Translate a failure during exposure or readout.
    pub fn into_capture_error(self) -> GuideError {
        match self.status {
            SbigStatus::KeyboardEscape => GuideError::Aborted,
            status if status.is_timeout() => GuideError::Timeout {
                operation: self.command.to_string(),
                timeout_ms: 0,
            },
            _ => GuideError::CaptureFailure(self.to_string()),
        }
    }

    /// Translate a guide-relay failure.
    pub fn into_pulse_error(self) -> GuideError {
        match self.status {
            SbigStatus::KeyboardEscape => GuideError::Aborted,
            status if status.is_timeout() => GuideError::Timeout {
                operation: self.command.to_string(),
                timeout_ms: 0,
            },
            _ => GuideError::PulseFailure(self.to_string()),
        }
    }
}

/// Where the camera is attached. Parsed from the `connect` identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SbigPort {
    /// First USB camera found
    UsbAuto,
    /// USB slot 1-8
    Usb(u8),
    /// Ethernet camera at an IPv4 address
    Ethernet(Ipv4Addr),
}

impl FromStr for SbigPort {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let upper = trimmed.to_ascii_uppercase();
        if upper.is_empty() || upper == "USB" {
            return Ok(SbigPort::UsbAuto);
        }
        if let Some(slot) = upper.strip_prefix("USB") {
            return match slot.parse::<u8>() {
                Ok(n @ 1..=8) => Ok(SbigPort::Usb(n)),
                _ => Err(format!("Invalid USB slot in '{}'. Use USB1-USB8", trimmed)),
            };
        }
        if let Some(addr) = upper.strip_prefix("ETH:") {
            return addr
                .parse::<Ipv4Addr>()
                .map(SbigPort::Ethernet)
                .map_err(|e| format!("Invalid Ethernet address in '{}': {}", trimmed, e));
        }
        Err(format!(
            "Unrecognized SBIG identifier '{}'. Use USB, USB1-USB8 or ETH:<ipv4>",
            trimmed
        ))
    }
}

impl fmt::Display for SbigPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SbigPort::UsbAuto => write!(f, "USB"),
            SbigPort::Usb(n) => write!(f, "USB{}", n),
            SbigPort::Ethernet(addr) => write!(f, "ETH:{}", addr),
        }
    }
}

/// Which sensor of a dual-chip camera to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Ccd {
    /// CCD_IMAGING
    #[default]
    Imaging,
    /// CCD_TRACKING (built-in guide chip)
    Tracking,
}

/// Readout binning mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReadoutMode {
    /// RM_1X1
    Bin1x1,
    /// RM_2X2
    Bin2x2,
    /// RM_3X3
    Bin3x3,
}

impl ReadoutMode {
    /// Mode for a binning factor of 1, 2 or 3.
    pub fn from_binning(binning: u8) -> Option<Self> {
        match binning {
            1 => Some(Self::Bin1x1),
            2 => Some(Self::Bin2x2),
            3 => Some(Self::Bin3x3),
            _ => None,
        }
    }

    /// Binning factor.
    pub fn factor(self) -> u32 {
        match self {
            Self::Bin1x1 => 1,
            Self::Bin2x2 => 2,
            Self::Bin3x3 => 3,
        }
    }
}

/// Shutter state for an exposure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Shutter {
    /// SC_OPEN_SHUTTER (light frame)
    Open,
    /// SC_CLOSE_SHUTTER (dark frame)
    Closed,
}

/// Result of CC_GET_CCD_INFO.
#[derive(Debug, Clone, PartialEq)]
pub struct CcdInfo {
    /// Camera model name
    pub camera_name: String,
    /// Unbinned width in pixels
    pub width: u32,
    /// Unbinned height in pixels
    pub height: u32,
    /// Pixel width in microns
    pub pixel_width_um: f64,
    /// Pixel height in microns
    pub pixel_height_um: f64,
    /// Whether the camera has an ST4 guide relay port
    pub has_guide_relay: bool,
}

impl CcdInfo {
    /// Sensor size at a readout mode.
    pub fn binned_size(&self, mode: ReadoutMode) -> (u32, u32) {
        (self.width / mode.factor(), self.height / mode.factor())
    }
}

/// Parameters of CC_START_EXPOSURE2.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExposureParams {
    /// Sensor to expose
    pub ccd: Ccd,
    /// Exposure time in milliseconds
    pub duration_ms: u32,
    /// Shutter command
    pub shutter: Shutter,
    /// Binning
    pub readout_mode: ReadoutMode,
    /// Window to read, in binned pixels
    pub window: Subframe,
}

/// Parameters of the readout sequence.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReadoutParams {
    /// Sensor to read
    pub ccd: Ccd,
    /// Binning
    pub readout_mode: ReadoutMode,
    /// Window to read, in binned pixels
    pub window: Subframe,
}

/// Exposure state reported by CC_QUERY_COMMAND_STATUS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExposureStatus {
    /// No exposure running
    Idle,
    /// Integrating
    InProgress,
    /// Integration finished, ready for readout
    Complete,
}

/// Relay on-times for CC_ACTIVATE_RELAY, in 1/100 s ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RelayCommand {
    /// +X relay
    pub x_plus: u16,
    /// -X relay
    pub x_minus: u16,
    /// +Y relay
    pub y_plus: u16,
    /// -Y relay
    pub y_minus: u16,
}

impl RelayCommand {
    /// Milliseconds per relay tick.
    pub const TICK_MS: u32 = 10;

    /// Relay command for one guide pulse. West drives +X, East -X,
    /// North -Y and South +Y. Non-zero durations round up to whole ticks and
    /// clamp at the driver maximum.
    pub fn for_pulse(direction: GuideDirection, duration_ms: u32) -> Self {
        let ticks = duration_ms.div_ceil(Self::TICK_MS).min(u32::from(u16::MAX)) as u16;
        let mut cmd = Self::default();
        match direction {
            GuideDirection::West => cmd.x_plus = ticks,
            GuideDirection::East => cmd.x_minus = ticks,
            GuideDirection::North => cmd.y_minus = ticks,
            GuideDirection::South => cmd.y_plus = ticks,
        }
        cmd
    }

    /// Whether every relay is off.
    pub fn is_idle(&self) -> bool {
        *self == Self::default()
    }

    /// Longest on-time in milliseconds.
    pub fn max_duration_ms(&self) -> u32 {
        let ticks = self
            .x_plus
            .max(self.x_minus)
            .max(self.y_plus)
            .max(self.y_minus);
        u32::from(ticks) * Self::TICK_MS
    }
}

/// Vendor SDK boundary for SBIG cameras.
///
/// One instance owns one device handle. The camera binding wraps it in a
/// mutex and locks it for exactly one command at a time.
pub trait SbigDriver: Send {
    /// Open the driver and device on `port` and establish the link.
    fn open_device(&mut self, port: &SbigPort) -> Result<(), SbigError>;

    /// Close the device and driver.
    fn close_device(&mut self) -> Result<(), SbigError>;

    /// Query sensor geometry.
    fn ccd_info(&mut self, ccd: Ccd) -> Result<CcdInfo, SbigError>;

    /// Start an exposure.
    fn start_exposure(&mut self, params: &ExposureParams) -> Result<(), SbigError>;

    /// Poll the exposure state of `ccd`.
    fn exposure_status(&mut self, ccd: Ccd) -> Result<ExposureStatus, SbigError>;

    /// End the exposure (also used to abandon one).
    fn end_exposure(&mut self, ccd: Ccd) -> Result<(), SbigError>;

    /// Read the window into `dest`, row-major, `window.pixel_count()` values.
    fn readout(&mut self, params: &ReadoutParams, dest: &mut [u16]) -> Result<(), SbigError>;

    /// Switch the guide relays on for the given times.
    fn activate_relay(&mut self, command: RelayCommand) -> Result<(), SbigError>;

    /// Whether any guide relay is still on.
    fn relay_active(&mut self) -> Result<bool, SbigError>;

    /// Whether exposures can run without the driver's progress dialog.
    fn supports_headless_capture(&self) -> bool;
}

impl<D: SbigDriver + ?Sized> SbigDriver for Box<D> {
    fn open_device(&mut self, port: &SbigPort) -> Result<(), SbigError> {
        (**self).open_device(port)
    }

    fn close_device(&mut self) -> Result<(), SbigError> {
        (**self).close_device()
    }

    fn ccd_info(&mut self, ccd: Ccd) -> Result<CcdInfo, SbigError> {
        (**self).ccd_info(ccd)
    }

    fn start_exposure(&mut self, params: &ExposureParams) -> Result<(), SbigError> {
        (**self).start_exposure(params)
    }

    fn exposure_status(&mut self, ccd: Ccd) -> Result<ExposureStatus, SbigError> {
        (**self).exposure_status(ccd)
    }

    fn end_exposure(&mut self, ccd: Ccd) -> Result<(), SbigError> {
        (**self).end_exposure(ccd)
    }

    fn readout(&mut self, params: &ReadoutParams, dest: &mut [u16]) -> Result<(), SbigError> {
        (**self).readout(params, dest)
    }

    fn activate_relay(&mut self, command: RelayCommand) -> Result<(), SbigError> {
        (**self).activate_relay(command)
    }

    fn relay_active(&mut self) -> Result<bool, SbigError> {
        (**self).relay_active()
    }

    fn supports_headless_capture(&self) -> bool {
        (**self).supports_headless_capture()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_code_round_trip_for_known_codes() {
        for code in 0..=34u16 {
            assert_eq!(SbigStatus::from_code(code).code(), code);
        }
        assert_eq!(SbigStatus::from_code(99), SbigStatus::Unknown(99));
    }

    #[test]
    fn test_port_parsing() {
        assert_eq!("".parse::<SbigPort>(), Ok(SbigPort::UsbAuto));
        assert_eq!("usb".parse::<SbigPort>(), Ok(SbigPort::UsbAuto));
        assert_eq!("USB3".parse::<SbigPort>(), Ok(SbigPort::Usb(3)));
        assert_eq!(
            "eth:192.168.0.42".parse::<SbigPort>(),
            Ok(SbigPort::Ethernet(Ipv4Addr::new(192, 168, 0, 42)))
        );
        assert!("USB9".parse::<SbigPort>().is_err());
        assert!("LPT1".parse::<SbigPort>().is_err());
        assert!("ETH:not-an-ip".parse::<SbigPort>().is_err());
    }

    #[test]
    fn test_relay_mapping() {
        let cmd = RelayCommand::for_pulse(GuideDirection::West, 500);
        assert_eq!(cmd.x_plus, 50);
        assert_eq!((cmd.x_minus, cmd.y_plus, cmd.y_minus), (0, 0, 0));

        let cmd = RelayCommand::for_pulse(GuideDirection::North, 15);
        assert_eq!(cmd.y_minus, 2, "partial ticks round up");

        let cmd = RelayCommand::for_pulse(GuideDirection::South, u32::MAX);
        assert_eq!(cmd.y_plus, u16::MAX);

        assert!(RelayCommand::for_pulse(GuideDirection::East, 0).is_idle());
    }

    #[test]
    fn test_error_translation() {
        let err = SbigError::new(SbigCommand::OpenDevice, SbigStatus::CameraNotFound);
        assert!(err.into_connect_error("USB2").is_not_found());

        let err = SbigError::new(SbigCommand::OpenDevice, SbigStatus::ShareError);
        assert!(err.into_connect_error("USB2").is_busy());

        let err = SbigError::new(SbigCommand::Readout, SbigStatus::RxTimeout);
        assert!(err.into_capture_error().is_timeout());

        let err = SbigError::new(SbigCommand::StartExposure, SbigStatus::KeyboardEscape);
        assert!(matches!(err.into_capture_error(), GuideError::Aborted));

        let err = SbigError::new(SbigCommand::ActivateRelay, SbigStatus::BadParameter);
        assert!(matches!(err.into_pulse_error(), GuideError::PulseFailure(_)));
    }
}
