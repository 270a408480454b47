//! Error types for the guiding hardware layer.
//!
//! `GuideError` is the only error a guiding loop ever sees from a camera or
//! mount binding. Vendor SDK status codes and OS error numbers are translated
//! into it at the binding boundary (see `hardware::sbig::driver::SbigError` and
//! `hardware::eqmac::apple_event::OsErr`), so callers branch on a small, stable
//! taxonomy instead of device-specific codes.
//!
//! ## Error Taxonomy
//!
//! - **Connection**: the device or external application could not be reached
//!   (`ConnectionFailure`, `DeviceNotFound`, `DeviceBusy`, `NotConnected`,
//!   `NothingToDisconnect`).
//! - **Capture**: exposure or download failed; no partial frame is delivered
//!   (`CaptureFailure`, `InvalidSubframe`, `Aborted`).
//! - **Pulse**: guide-relay or RPC failure (`PulseFailure`).
//! - **Timeout**: a blocking operation exceeded its deadline.
//! - **ProtocolMismatch**: a reply was malformed or carried an unknown status.
//! - **Configuration**: file parsing or semantic validation failed.

use thiserror::Error;

/// Convenience alias for results using the hardware error type.
pub type GuideResult<T> = std::result::Result<T, GuideError>;

/// Taxonomy bucket of a [`GuideError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Device or process unreachable
    Connection,
    /// Exposure or download error
    Capture,
    /// Guide relay or RPC error
    Pulse,
    /// Blocking operation exceeded its deadline
    Timeout,
    /// Reply descriptor malformed or status unrecognized
    ProtocolMismatch,
    /// Invalid configuration
    Configuration,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ErrorKind::Connection => "connection",
            ErrorKind::Capture => "capture",
            ErrorKind::Pulse => "pulse",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ProtocolMismatch => "protocol_mismatch",
            ErrorKind::Configuration => "configuration",
        };
        write!(f, "{}", label)
    }
}

/// Primary error type for camera and mount bindings.
#[derive(Error, Debug)]
pub enum GuideError {
    /// The device or external application could not be reached.
    #[error("Connection to '{device}' failed: {message}")]
    ConnectionFailure {
        /// Binding or device name
        device: String,
        /// Translated reason
        message: String,
    },

    /// The identifier did not resolve to an attached device.
    #[error("Device not found: '{identifier}'")]
    DeviceNotFound {
        /// Identifier passed to `connect`
        identifier: String,
    },

    /// The device exists but is held by another process or handle.
    #[error("Device '{identifier}' is busy")]
    DeviceBusy {
        /// Identifier passed to `connect`
        identifier: String,
    },

    /// An operation that needs a connected device was called while disconnected.
    #[error("Device '{device}' is not connected")]
    NotConnected {
        /// Binding name
        device: String,
    },

    /// The binding has nothing to tear down. Not fatal.
    #[error("'{device}' has nothing to disconnect")]
    NothingToDisconnect {
        /// Binding name
        device: String,
    },

    /// Exposure or download failed.
    #[error("Capture failed: {0}")]
    CaptureFailure(String),

    /// The requested subframe does not fit the sensor.
    #[error("Subframe {x},{y} {width}x{height} exceeds sensor {sensor_width}x{sensor_height}")]
    InvalidSubframe {
        /// Left edge
        x: u32,
        /// Top edge
        y: u32,
        /// Width in pixels
        width: u32,
        /// Height in pixels
        height: u32,
        /// Sensor width in pixels
        sensor_width: u32,
        /// Sensor height in pixels
        sensor_height: u32,
    },

    /// The operation was cancelled through the binding's abort signal.
    #[error("Operation aborted by caller")]
    Aborted,

    /// Guide relay or guide RPC failed.
    #[error("Guide pulse failed: {0}")]
    PulseFailure(String),

    /// A blocking operation exceeded its deadline.
    #[error("{operation} timed out after {timeout_ms} ms")]
    Timeout {
        /// What was being waited on
        operation: String,
        /// Deadline that elapsed
        timeout_ms: u64,
    },

    /// Reply malformed or status code unrecognized.
    #[error("Protocol mismatch: {0}")]
    ProtocolMismatch(String),

    /// Semantic configuration error.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Configuration file or environment could not be parsed.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),
}

impl From<figment::Error> for GuideError {
    fn from(err: figment::Error) -> Self {
        GuideError::Config(Box::new(err))
    }
}

impl GuideError {
    /// Taxonomy bucket of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            GuideError::ConnectionFailure { .. }
            | GuideError::DeviceNotFound { .. }
            | GuideError::DeviceBusy { .. }
            | GuideError::NotConnected { .. }
            | GuideError::NothingToDisconnect { .. } => ErrorKind::Connection,
            GuideError::CaptureFailure(_)
            | GuideError::InvalidSubframe { .. }
            | GuideError::Aborted => ErrorKind::Capture,
            GuideError::PulseFailure(_) => ErrorKind::Pulse,
            GuideError::Timeout { .. } => ErrorKind::Timeout,
            GuideError::ProtocolMismatch(_) => ErrorKind::ProtocolMismatch,
            GuideError::Configuration(_) | GuideError::Config(_) => ErrorKind::Configuration,
        }
    }

    /// Whether the guiding loop should treat this error as a real failure.
    ///
    /// `NothingToDisconnect` is the only non-fatal error: bindings whose device
    /// is an independent application report it from `disconnect()`.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, GuideError::NothingToDisconnect { .. })
    }

    /// Check if this is a "device not found" type error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, GuideError::DeviceNotFound { .. })
    }

    /// Check if the device is busy.
    pub fn is_busy(&self) -> bool {
        matches!(self, GuideError::DeviceBusy { .. })
    }

    /// Check if this is a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, GuideError::Timeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_buckets() {
        let err = GuideError::DeviceBusy {
            identifier: "USB1".into(),
        };
        assert_eq!(err.kind(), ErrorKind::Connection);
        assert!(err.is_busy());

        let err = GuideError::Timeout {
            operation: "exposure".into(),
            timeout_ms: 12_000,
        };
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(err.to_string().contains("12000"));

        assert_eq!(GuideError::Aborted.kind(), ErrorKind::Capture);
        assert_eq!(
            GuideError::ProtocolMismatch("no status".into()).kind(),
            ErrorKind::ProtocolMismatch
        );
    }

    #[test]
    fn nothing_to_disconnect_is_not_fatal() {
        let err = GuideError::NothingToDisconnect {
            device: "EQMac".into(),
        };
        assert!(!err.is_fatal());
        assert!(GuideError::PulseFailure("relay".into()).is_fatal());
    }

    #[test]
    fn subframe_error_message_names_sensor() {
        let err = GuideError::InvalidSubframe {
            x: 700,
            y: 0,
            width: 100,
            height: 100,
            sensor_width: 765,
            sensor_height: 510,
        };
        let msg = err.to_string();
        assert!(msg.contains("765x510"));
        assert!(msg.contains("100x100"));
    }
}
