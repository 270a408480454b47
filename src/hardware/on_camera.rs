//! Mount that guides through a camera's ST4 port.
//!
//! Many guide setups wire the camera's relay port straight into the mount's
//! autoguider input. `OnCameraMount` exposes that path through the `Mount`
//! interface so a guiding loop does not need to special-case it.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::{GuideError, GuideResult};
use crate::hardware::capabilities::{Mount, St4Port};
use crate::hardware::{AbortSignal, ConnectionState, GuideDirection, MoveResult};

/// `Mount` backed by an [`St4Port`].
pub struct OnCameraMount {
    port: Arc<dyn St4Port>,
    state: ConnectionState,
    abort: AbortSignal,
}

impl OnCameraMount {
    /// Route pulses through `port`.
    pub fn new(port: Arc<dyn St4Port>) -> Self {
        Self {
            port,
            state: ConnectionState::Disconnected,
            abort: AbortSignal::new(),
        }
    }

    /// Route pulses through `port`, sharing the owning camera's abort
    /// signal so an abort also cuts a running relay pulse short.
    pub fn with_abort_signal(port: Arc<dyn St4Port>, abort: AbortSignal) -> Self {
        Self {
            port,
            state: ConnectionState::Disconnected,
            abort,
        }
    }
}

impl Mount for OnCameraMount {
    fn name(&self) -> &str {
        "On-camera"
    }

    fn connect(&mut self) -> GuideResult<()> {
        if !self.port.is_available() {
            return Err(GuideError::ConnectionFailure {
                device: self.name().to_string(),
                message: "camera is not connected".to_string(),
            });
        }
        self.state = ConnectionState::Connected;
        info!("on-camera guiding connected");
        Ok(())
    }

    fn disconnect(&mut self) -> GuideResult<()> {
        self.state = ConnectionState::Disconnected;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state.is_connected() && self.port.is_available()
    }

    fn guide(&mut self, direction: GuideDirection, duration_ms: u32) -> MoveResult {
        if !self.is_connected() {
            warn!(%direction, duration_ms, "on-camera guide while disconnected");
            return MoveResult::Error;
        }
        if self.abort.is_requested() {
            return MoveResult::Stopped;
        }
        match self.port.pulse(direction, duration_ms) {
            Ok(()) => {
                debug!(%direction, duration_ms, "ST4 pulse complete");
                MoveResult::Success
            }
            Err(GuideError::Aborted) => MoveResult::Stopped,
            Err(e) => {
                warn!(%direction, duration_ms, error = %e, "ST4 pulse failed");
                MoveResult::Error
            }
        }
    }

    fn abort_signal(&self) -> AbortSignal {
        self.abort.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct ScriptedPort {
        available: AtomicBool,
        outcome: Mutex<Option<GuideError>>,
        pulses: Mutex<Vec<(GuideDirection, u32)>>,
    }

    impl ScriptedPort {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                available: AtomicBool::new(true),
                outcome: Mutex::new(None),
                pulses: Mutex::new(Vec::new()),
            })
        }
    }

    impl St4Port for ScriptedPort {
        fn pulse(&self, direction: GuideDirection, duration_ms: u32) -> GuideResult<()> {
            self.pulses.lock().push((direction, duration_ms));
            match self.outcome.lock().take() {
                Some(err) => Err(err),
                None => Ok(()),
            }
        }

        fn is_available(&self) -> bool {
            self.available.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn test_connect_requires_camera() {
        let port = ScriptedPort::new();
        port.available.store(false, Ordering::SeqCst);
        let mut mount = OnCameraMount::new(port.clone());
        assert!(mount.connect().is_err());

        port.available.store(true, Ordering::SeqCst);
        mount.connect().unwrap();
        assert!(mount.is_connected());
        assert!(mount.disconnect().is_ok());
    }

    #[test]
    fn test_pulse_outcomes_map_to_move_results() {
        let port = ScriptedPort::new();
        let mut mount = OnCameraMount::new(port.clone());
        mount.connect().unwrap();

        assert_eq!(mount.guide(GuideDirection::East, 300), MoveResult::Success);

        *port.outcome.lock() = Some(GuideError::Aborted);
        assert_eq!(mount.guide(GuideDirection::East, 300), MoveResult::Stopped);

        *port.outcome.lock() = Some(GuideError::PulseFailure("relay".into()));
        assert_eq!(mount.guide(GuideDirection::East, 300), MoveResult::Error);

        assert_eq!(port.pulses.lock().len(), 3);
    }

    #[test]
    fn test_pending_abort_skips_pulse() {
        let port = ScriptedPort::new();
        let mut mount = OnCameraMount::new(port.clone());
        mount.connect().unwrap();
        mount.abort_signal().request();

        assert_eq!(mount.guide(GuideDirection::North, 100), MoveResult::Stopped);
        assert!(port.pulses.lock().is_empty());
    }

    #[test]
    fn test_shared_abort_signal() {
        let camera_abort = AbortSignal::new();
        let mut mount = OnCameraMount::with_abort_signal(ScriptedPort::new(), camera_abort.clone());
        mount.connect().unwrap();

        camera_abort.request();
        assert!(mount.abort_signal().is_requested());
        assert_eq!(mount.guide(GuideDirection::South, 100), MoveResult::Stopped);
    }
}
