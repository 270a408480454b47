//! Hardware Abstraction Layer
//!
//! Capability traits plus the concrete camera and mount bindings.
//!
//! - [`capabilities`]: `GuideCamera`, `Mount`, `St4Port`
//! - [`sbig`]: SBIG camera binding over the vendor SDK boundary
//! - [`eqmac`]: EQMac mount binding over synchronous AppleEvents
//! - [`on_camera`]: mount that pulses through a camera's ST4 port
//! - [`registry`]: runtime selection of bindings from configuration

pub mod capabilities;
pub mod eqmac;
pub mod on_camera;
pub mod registry;
pub mod sbig;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub use capabilities::{CaptureOptions, GuideCamera, Mount, St4Port};

/// Direction of a single-axis guide pulse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuideDirection {
    /// +Dec
    North,
    /// -Dec
    South,
    /// +RA
    East,
    /// -RA
    West,
}

impl GuideDirection {
    /// All four directions.
    pub const ALL: [GuideDirection; 4] = [
        GuideDirection::North,
        GuideDirection::South,
        GuideDirection::East,
        GuideDirection::West,
    ];

    /// Whether this direction moves the declination axis.
    pub fn is_dec_axis(self) -> bool {
        matches!(self, GuideDirection::North | GuideDirection::South)
    }
}

impl fmt::Display for GuideDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            GuideDirection::North => "North",
            GuideDirection::South => "South",
            GuideDirection::East => "East",
            GuideDirection::West => "West",
        };
        write!(f, "{}", label)
    }
}

impl FromStr for GuideDirection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "n" | "north" => Ok(GuideDirection::North),
            "s" | "south" => Ok(GuideDirection::South),
            "e" | "east" => Ok(GuideDirection::East),
            "w" | "west" => Ok(GuideDirection::West),
            _ => Err(format!(
                "Invalid direction '{}'. Must be one of: north, south, east, west",
                s
            )),
        }
    }
}

/// Outcome of one guide pulse.
///
/// `Stopped` is a deliberate early cancellation and must not be confused with
/// `Error`: a guiding loop retries after an error but abandons calibration
/// after a stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MoveResult {
    /// Pulse completed
    Success,
    /// Hardware or transport failure
    Error,
    /// Pulse cancelled by the user or the device
    Stopped,
}

impl MoveResult {
    /// Whether the pulse completed.
    pub fn is_success(self) -> bool {
        self == MoveResult::Success
    }
}

impl fmt::Display for MoveResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            MoveResult::Success => "success",
            MoveResult::Error => "error",
            MoveResult::Stopped => "stopped",
        };
        write!(f, "{}", label)
    }
}

/// Device lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// Not connected (initial state)
    #[default]
    Disconnected,
    /// Connected and idle
    Connected,
    /// Connected with an exposure in progress
    Capturing,
}

impl ConnectionState {
    /// Whether capture/guide operations are allowed.
    pub fn is_connected(self) -> bool {
        !matches!(self, ConnectionState::Disconnected)
    }
}

/// Cooperative cancellation flag shared between a binding and its caller.
///
/// Bindings poll it at their suspension points. Requesting an abort is sticky
/// until [`AbortSignal::clear`] is called.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal {
    flag: Arc<AtomicBool>,
}

impl AbortSignal {
    /// New, un-requested signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request that in-flight and subsequent operations stop.
    pub fn request(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Reset the signal.
    pub fn clear(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }

    /// Whether an abort has been requested.
    pub fn is_requested(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}
