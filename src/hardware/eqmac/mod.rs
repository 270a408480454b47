//! EQMac mount binding.
//!
//! EQMac is a separate mount-control application. This binding never talks
//! to the mount hardware; it sends one synchronous AppleEvent per guide pulse
//! and maps the reply status onto a [`MoveResult`].
//!
//! # Guide event
//!
//! | Part | Value |
//! |---|---|
//! | target | application signature (default `EKEQ`) |
//! | class / id | `MPj6` / `GDe6` by default |
//! | `MErr` | east/west correction in seconds (f64, East positive) |
//! | `MNrr` | north/south correction in seconds (f64, North positive) |
//! | `Mmnt` | mount-type code (i32) |
//! | reply `----` | status (i16), 0 on success |
//! | reply `errn` | handler error number, if the handler failed |
//!
//! Both descriptors are dropped on every path out of `guide`; the
//! [`DescriptorLedger`] proves it.

pub mod apple_event;
#[cfg(all(target_os = "macos", feature = "apple_events"))]
pub mod macos;
pub mod simulated;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{GuideError, GuideResult};
use crate::hardware::capabilities::Mount;
use crate::hardware::{AbortSignal, ConnectionState, GuideDirection, MoveResult};

pub use apple_event::{
    codes, AeValue, AppleEvent, AppleEventTransport, DescriptorGuard, DescriptorLedger,
    FourCharCode, OsErr,
};
#[cfg(all(target_os = "macos", feature = "apple_events"))]
pub use macos::CoreServicesTransport;
pub use simulated::{ReceivedGuideEvent, SimulatedEqMac, SimulatedEqMacHandle};

/// East/west correction parameter.
pub const PARAM_EW_CORRECTION: FourCharCode = FourCharCode::from_bytes(b"MErr");
/// North/south correction parameter.
pub const PARAM_NS_CORRECTION: FourCharCode = FourCharCode::from_bytes(b"MNrr");
/// Mount-type parameter.
pub const PARAM_MOUNT_CODE: FourCharCode = FourCharCode::from_bytes(b"Mmnt");

/// Addressing and reply handling of the guide event.
#[derive(Debug, Clone, PartialEq)]
pub struct EqMacProtocol {
    /// Target application signature
    pub signature: FourCharCode,
    /// Event class
    pub event_class: FourCharCode,
    /// Event id
    pub event_id: FourCharCode,
    /// Mount-type code passed in every event
    pub mount_code: i32,
    /// Reply allowance on top of the pulse duration
    pub reply_timeout: Duration,
    /// Reply status codes that mean the pulse was cancelled
    pub stopped_codes: Vec<i16>,
}

impl Default for EqMacProtocol {
    fn default() -> Self {
        Self {
            signature: FourCharCode::from_bytes(b"EKEQ"),
            event_class: FourCharCode::from_bytes(b"MPj6"),
            event_id: FourCharCode::from_bytes(b"GDe6"),
            mount_code: 0,
            reply_timeout: Duration::from_millis(5_000),
            stopped_codes: vec![OsErr::USER_CANCELED.0 as i16],
        }
    }
}

/// Correction carried by one guide event, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct GuideCorrection {
    /// East positive
    pub ew_seconds: f64,
    /// North positive
    pub ns_seconds: f64,
}

impl GuideCorrection {
    /// Handshake event payload.
    pub const ZERO: GuideCorrection = GuideCorrection {
        ew_seconds: 0.0,
        ns_seconds: 0.0,
    };

    /// Single-axis correction for one pulse.
    pub fn from_pulse(direction: GuideDirection, duration_ms: u32) -> Self {
        let magnitude = f64::from(duration_ms) / 1000.0;
        let seconds = match direction {
            GuideDirection::North | GuideDirection::East => magnitude,
            GuideDirection::South | GuideDirection::West => -magnitude,
        };
        let mut correction = Self::ZERO;
        if direction.is_dec_axis() {
            correction.ns_seconds = seconds;
        } else {
            correction.ew_seconds = seconds;
        }
        correction
    }
}

/// Mount driven through EQMac.
pub struct EqMacMount<T: AppleEventTransport> {
    transport: T,
    protocol: EqMacProtocol,
    ledger: DescriptorLedger,
    state: ConnectionState,
    abort: AbortSignal,
}

impl<T: AppleEventTransport> EqMacMount<T> {
    /// New, disconnected binding.
    pub fn new(transport: T, protocol: EqMacProtocol) -> Self {
        Self {
            transport,
            protocol,
            ledger: DescriptorLedger::new(),
            state: ConnectionState::Disconnected,
            abort: AbortSignal::new(),
        }
    }

    /// Descriptor ledger shared by every event this binding creates.
    pub fn ledger(&self) -> &DescriptorLedger {
        &self.ledger
    }

    /// Protocol settings
    pub fn protocol(&self) -> &EqMacProtocol {
        &self.protocol
    }

    /// Underlying transport
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Map a reply status to a move result.
    pub fn classify_status(&self, status: i16) -> MoveResult {
        if status == 0 {
            MoveResult::Success
        } else if self.protocol.stopped_codes.contains(&status) {
            MoveResult::Stopped
        } else {
            MoveResult::Error
        }
    }

    /// Send one guide event and return the reply status.
    fn round_trip(&mut self, correction: GuideCorrection, pulse_ms: u32) -> GuideResult<i16> {
        let mut event = AppleEvent::new(
            &self.ledger,
            self.protocol.signature,
            self.protocol.event_class,
            self.protocol.event_id,
        );
        event.put_param(PARAM_EW_CORRECTION, AeValue::Float64(correction.ew_seconds));
        event.put_param(PARAM_NS_CORRECTION, AeValue::Float64(correction.ns_seconds));
        event.put_param(PARAM_MOUNT_CODE, AeValue::SInt32(self.protocol.mount_code));
        let mut reply = AppleEvent::reply(&self.ledger);

        let timeout = self
            .protocol
            .reply_timeout
            .saturating_add(Duration::from_millis(u64::from(pulse_ms)));
        debug!(
            ew = correction.ew_seconds,
            ns = correction.ns_seconds,
            timeout_ms = timeout.as_millis() as u64,
            "sending EQMac guide event"
        );
        self.transport
            .send(&event, &mut reply, timeout)
            .map_err(|err| err.classify("EQMac guide event", timeout))?;

        if let Some(errn) = reply.get_i32(codes::KEY_ERROR_NUMBER) {
            if errn != 0 {
                return Err(GuideError::PulseFailure(format!(
                    "EQMac handler failed with {}",
                    OsErr(errn)
                )));
            }
        }
        reply.get_i16(codes::KEY_DIRECT_OBJECT)
    }
}

impl<T: AppleEventTransport> Mount for EqMacMount<T> {
    fn name(&self) -> &str {
        "EQMac"
    }

    fn connect(&mut self) -> GuideResult<()> {
        if self.state.is_connected() {
            return Ok(());
        }
        match self.round_trip(GuideCorrection::ZERO, 0) {
            Ok(0) => {
                self.state = ConnectionState::Connected;
                info!(signature = %self.protocol.signature, "EQMac connected");
                Ok(())
            }
            Ok(status) => Err(GuideError::ConnectionFailure {
                device: "EQMac".to_string(),
                message: format!("handshake returned status {}", status),
            }),
            Err(e) => {
                warn!(error = %e, "EQMac handshake failed");
                Err(GuideError::ConnectionFailure {
                    device: "EQMac".to_string(),
                    message: e.to_string(),
                })
            }
        }
    }

    fn disconnect(&mut self) -> GuideResult<()> {
        self.state = ConnectionState::Disconnected;
        info!("EQMac marked disconnected; the application keeps running");
        Err(GuideError::NothingToDisconnect {
            device: "EQMac".to_string(),
        })
    }

    fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    fn guide(&mut self, direction: GuideDirection, duration_ms: u32) -> MoveResult {
        if !self.state.is_connected() {
            warn!(%direction, duration_ms, "EQMac guide while disconnected");
            return MoveResult::Error;
        }
        if self.abort.is_requested() {
            debug!(%direction, duration_ms, "abort pending, guide event not sent");
            return MoveResult::Stopped;
        }

        let correction = GuideCorrection::from_pulse(direction, duration_ms);
        let result = match self.round_trip(correction, duration_ms) {
            Ok(status) => {
                let result = self.classify_status(status);
                if result == MoveResult::Error {
                    warn!(%direction, duration_ms, status, "EQMac returned an error status");
                }
                result
            }
            // Only a reply status can report a cancelled pulse
            Err(e) => {
                warn!(%direction, duration_ms, error = %e, "EQMac guide event failed");
                MoveResult::Error
            }
        };
        debug!(%direction, duration_ms, %result, "EQMac guide finished");
        result
    }

    fn abort_signal(&self) -> AbortSignal {
        self.abort.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_correction_single_axis() {
        let c = GuideCorrection::from_pulse(GuideDirection::North, 500);
        assert_eq!(c.ns_seconds, 0.5);
        assert_eq!(c.ew_seconds, 0.0);

        let c = GuideCorrection::from_pulse(GuideDirection::West, 250);
        assert_eq!(c.ew_seconds, -0.25);
        assert_eq!(c.ns_seconds, 0.0);

        assert_eq!(
            GuideCorrection::from_pulse(GuideDirection::South, 0),
            GuideCorrection::ZERO
        );
    }

    #[test]
    fn test_status_classification() {
        let mount = EqMacMount::new(SimulatedEqMac::new(), EqMacProtocol::default());
        assert_eq!(mount.classify_status(0), MoveResult::Success);
        assert_eq!(mount.classify_status(-128), MoveResult::Stopped);
        assert_eq!(mount.classify_status(1), MoveResult::Error);
    }

    #[test]
    fn test_guide_before_connect_is_error() {
        let mut mount = EqMacMount::new(SimulatedEqMac::new(), EqMacProtocol::default());
        assert_eq!(mount.guide(GuideDirection::North, 100), MoveResult::Error);
        assert_eq!(mount.ledger().total_created(), 0);
    }
}
