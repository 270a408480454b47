//! AppleEvent descriptors and the transport boundary.
//!
//! An [`AppleEvent`] is the in-memory form of one outgoing event or one reply
//! descriptor. Each holds a [`DescriptorGuard`] registered with a
//! [`DescriptorLedger`]; dropping the event releases the guard, so the ledger's
//! live count is the number of descriptors not yet disposed. A transport turns
//! an event into an actual inter-application call and fills the reply.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{GuideError, GuideResult};

/// Four-character code (`OSType`/`DescType`/`AEKeyword`).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourCharCode(u32);

impl FourCharCode {
    /// Build from four ASCII bytes.
    pub const fn from_bytes(bytes: &[u8; 4]) -> Self {
        Self(u32::from_be_bytes(*bytes))
    }

    /// Raw big-endian value, as passed to the Apple Event Manager.
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// The four bytes.
    pub const fn to_bytes(self) -> [u8; 4] {
        self.0.to_be_bytes()
    }
}

impl From<u32> for FourCharCode {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

impl fmt::Display for FourCharCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.to_bytes() {
            if b.is_ascii_graphic() || b == b' ' {
                write!(f, "{}", b as char)?;
            } else {
                write!(f, "\\x{:02x}", b)?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for FourCharCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "'{}'", self)
    }
}

impl FromStr for FourCharCode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes: [u8; 4] = s
            .as_bytes()
            .try_into()
            .map_err(|_| format!("'{}' is not a four-character code", s))?;
        if !bytes.iter().all(|b| b.is_ascii() && !b.is_ascii_control()) {
            return Err(format!("'{}' contains non-printable characters", s));
        }
        Ok(Self::from_bytes(&bytes))
    }
}

/// Apple Event Manager constants used by the binding.
pub mod codes {
    use super::FourCharCode;

    /// typeApplSignature
    pub const TYPE_APPL_SIGNATURE: FourCharCode = FourCharCode::from_bytes(b"sign");
    /// typeSInt16
    pub const TYPE_SINT16: FourCharCode = FourCharCode::from_bytes(b"shor");
    /// typeSInt32
    pub const TYPE_SINT32: FourCharCode = FourCharCode::from_bytes(b"long");
    /// typeIEEE64BitFloatingPoint
    pub const TYPE_IEEE64: FourCharCode = FourCharCode::from_bytes(b"doub");
    /// keyDirectObject
    pub const KEY_DIRECT_OBJECT: FourCharCode = FourCharCode::from_bytes(b"----");
    /// keyErrorNumber
    pub const KEY_ERROR_NUMBER: FourCharCode = FourCharCode::from_bytes(b"errn");
}

/// Mac OS error number returned by the Apple Event Manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OsErr(pub i32);

impl OsErr {
    /// noErr
    pub const NO_ERR: OsErr = OsErr(0);
    /// userCanceledErr
    pub const USER_CANCELED: OsErr = OsErr(-128);
    /// procNotFound: no running process has the target signature
    pub const PROC_NOT_FOUND: OsErr = OsErr(-600);
    /// connectionInvalid
    pub const CONNECTION_INVALID: OsErr = OsErr(-609);
    /// errAECoercionFail
    pub const COERCION_FAIL: OsErr = OsErr(-1700);
    /// errAEDescNotFound
    pub const DESC_NOT_FOUND: OsErr = OsErr(-1701);
    /// errAEEventNotHandled
    pub const EVENT_NOT_HANDLED: OsErr = OsErr(-1708);
    /// errAEWaitCanceled
    pub const WAIT_CANCELED: OsErr = OsErr(-1711);
    /// errAETimeout
    pub const TIMEOUT: OsErr = OsErr(-1712);

    /// Translate a failed send into the uniform taxonomy.
    pub fn classify(self, operation: &str, timeout: Duration) -> GuideError {
        match self {
            Self::TIMEOUT => GuideError::Timeout {
                operation: operation.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            },
            Self::USER_CANCELED | Self::WAIT_CANCELED => GuideError::Aborted,
            Self::PROC_NOT_FOUND | Self::CONNECTION_INVALID => GuideError::ConnectionFailure {
                device: operation.to_string(),
                message: format!("target application not reachable ({})", self),
            },
            Self::COERCION_FAIL | Self::DESC_NOT_FOUND | Self::EVENT_NOT_HANDLED => {
                GuideError::ProtocolMismatch(format!("{} rejected: {}", operation, self))
            }
            other => GuideError::PulseFailure(format!("{} failed: {}", operation, other)),
        }
    }
}

impl fmt::Display for OsErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            Self::NO_ERR => "noErr",
            Self::USER_CANCELED => "userCanceledErr",
            Self::PROC_NOT_FOUND => "procNotFound",
            Self::CONNECTION_INVALID => "connectionInvalid",
            Self::COERCION_FAIL => "errAECoercionFail",
            Self::DESC_NOT_FOUND => "errAEDescNotFound",
            Self::EVENT_NOT_HANDLED => "errAEEventNotHandled",
            Self::WAIT_CANCELED => "errAEWaitCanceled",
            Self::TIMEOUT => "errAETimeout",
            _ => return write!(f, "OSErr {}", self.0),
        };
        write!(f, "{} ({})", name, self.0)
    }
}

/// Typed parameter value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AeValue {
    /// typeSInt16
    SInt16(i16),
    /// typeSInt32
    SInt32(i32),
    /// typeIEEE64BitFloatingPoint
    Float64(f64),
}

impl AeValue {
    /// Descriptor type of the value.
    pub fn type_code(&self) -> FourCharCode {
        match self {
            AeValue::SInt16(_) => codes::TYPE_SINT16,
            AeValue::SInt32(_) => codes::TYPE_SINT32,
            AeValue::Float64(_) => codes::TYPE_IEEE64,
        }
    }
}

/// Counts descriptors that have been created but not yet disposed.
#[derive(Debug, Clone, Default)]
pub struct DescriptorLedger {
    live: Arc<AtomicUsize>,
    created: Arc<AtomicU64>,
}

impl DescriptorLedger {
    /// New ledger with nothing outstanding.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new descriptor.
    pub fn track(&self) -> DescriptorGuard {
        self.live.fetch_add(1, Ordering::SeqCst);
        self.created.fetch_add(1, Ordering::SeqCst);
        DescriptorGuard {
            live: self.live.clone(),
        }
    }

    /// Descriptors currently alive.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Descriptors ever created through this ledger.
    pub fn total_created(&self) -> u64 {
        self.created.load(Ordering::SeqCst)
    }
}

/// Ledger entry for one descriptor; disposing it is dropping it.
#[derive(Debug)]
pub struct DescriptorGuard {
    live: Arc<AtomicUsize>,
}

impl Drop for DescriptorGuard {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// One outgoing event or reply descriptor.
#[derive(Debug)]
pub struct AppleEvent {
    event_class: FourCharCode,
    event_id: FourCharCode,
    target: Option<FourCharCode>,
    params: Vec<(FourCharCode, AeValue)>,
    _guard: DescriptorGuard,
}

impl AppleEvent {
    /// Outgoing event addressed to the application with `target` signature.
    pub fn new(
        ledger: &DescriptorLedger,
        target: FourCharCode,
        event_class: FourCharCode,
        event_id: FourCharCode,
    ) -> Self {
        Self {
            event_class,
            event_id,
            target: Some(target),
            params: Vec::new(),
            _guard: ledger.track(),
        }
    }

    /// Empty reply descriptor, filled in by the transport.
    pub fn reply(ledger: &DescriptorLedger) -> Self {
        let null = FourCharCode::from_bytes(b"null");
        Self {
            event_class: null,
            event_id: null,
            target: None,
            params: Vec::new(),
            _guard: ledger.track(),
        }
    }

    /// Event class
    pub fn event_class(&self) -> FourCharCode {
        self.event_class
    }

    /// Event id
    pub fn event_id(&self) -> FourCharCode {
        self.event_id
    }

    /// Target application signature (outgoing events only)
    pub fn target(&self) -> Option<FourCharCode> {
        self.target
    }

    /// Set a parameter, replacing any previous value for `key`.
    pub fn put_param(&mut self, key: FourCharCode, value: AeValue) {
        match self.params.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.params.push((key, value)),
        }
    }

    /// Raw parameter lookup.
    pub fn param(&self, key: FourCharCode) -> Option<AeValue> {
        self.params
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| *v)
    }

    /// All parameters in insertion order.
    pub fn params(&self) -> &[(FourCharCode, AeValue)] {
        &self.params
    }

    /// Read `key` as a 16-bit integer, coercing in-range 32-bit values.
    pub fn get_i16(&self, key: FourCharCode) -> GuideResult<i16> {
        match self.param(key) {
            Some(AeValue::SInt16(v)) => Ok(v),
            Some(AeValue::SInt32(v)) => i16::try_from(v).map_err(|_| {
                GuideError::ProtocolMismatch(format!("parameter {} = {} overflows SInt16", key, v))
            }),
            Some(other) => Err(GuideError::ProtocolMismatch(format!(
                "parameter {} has type {}, expected shor",
                key,
                other.type_code()
            ))),
            None => Err(GuideError::ProtocolMismatch(format!(
                "parameter {} missing",
                key
            ))),
        }
    }

    /// Read `key` as a 32-bit integer, if present.
    pub fn get_i32(&self, key: FourCharCode) -> Option<i32> {
        match self.param(key)? {
            AeValue::SInt16(v) => Some(i32::from(v)),
            AeValue::SInt32(v) => Some(v),
            AeValue::Float64(_) => None,
        }
    }
}

/// Synchronous inter-application event delivery.
///
/// `send` blocks until the target application has handled `event` and the
/// reply has been copied into `reply`, or until `timeout` elapses.
pub trait AppleEventTransport: Send {
    /// Send `event` and wait for the reply.
    fn send(
        &mut self,
        event: &AppleEvent,
        reply: &mut AppleEvent,
        timeout: Duration,
    ) -> Result<(), OsErr>;
}

impl<T: AppleEventTransport + ?Sized> AppleEventTransport for Box<T> {
    fn send(
        &mut self,
        event: &AppleEvent,
        reply: &mut AppleEvent,
        timeout: Duration,
    ) -> Result<(), OsErr> {
        (**self).send(event, reply, timeout)
    }
}
