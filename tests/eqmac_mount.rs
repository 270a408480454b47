//! Integration tests for the EQMac mount binding over the simulated
//! application.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use guide_hal::error::GuideError;
use guide_hal::hardware::eqmac::{
    codes, AeValue, AppleEvent, AppleEventTransport, EqMacMount, EqMacProtocol, FourCharCode,
    OsErr, SimulatedEqMac, SimulatedEqMacHandle,
};
use guide_hal::hardware::{GuideDirection, Mount, MoveResult};

fn protocol_with_timeout(ms: u64) -> EqMacProtocol {
    EqMacProtocol {
        reply_timeout: Duration::from_millis(ms),
        ..EqMacProtocol::default()
    }
}

fn connected_mount(protocol: EqMacProtocol) -> (EqMacMount<SimulatedEqMac>, SimulatedEqMacHandle) {
    let app = SimulatedEqMac::with_protocol(&protocol);
    let handle = app.handle();
    let mut mount = EqMacMount::new(app, protocol);
    mount.connect().expect("simulated EQMac answers the handshake");
    (mount, handle)
}

/// Transport that replays a fixed list of send outcomes.
struct ScriptedTransport {
    outcomes: VecDeque<Result<i16, OsErr>>,
}

impl ScriptedTransport {
    fn new(outcomes: impl IntoIterator<Item = Result<i16, OsErr>>) -> Self {
        Self {
            outcomes: outcomes.into_iter().collect(),
        }
    }
}

impl AppleEventTransport for ScriptedTransport {
    fn send(
        &mut self,
        _event: &AppleEvent,
        reply: &mut AppleEvent,
        _timeout: Duration,
    ) -> Result<(), OsErr> {
        let status = self.outcomes.pop_front().unwrap_or(Ok(0))?;
        reply.put_param(codes::KEY_DIRECT_OBJECT, AeValue::SInt16(status));
        Ok(())
    }
}

#[test]
fn test_guide_north_success() {
    let (mut mount, handle) = connected_mount(EqMacProtocol::default());

    assert_eq!(mount.guide(GuideDirection::North, 500), MoveResult::Success);

    let events = handle.received();
    assert_eq!(events.len(), 2, "handshake plus one guide event");
    let guide = &events[1];
    assert_eq!(guide.ns_seconds, 0.5);
    assert_eq!(guide.ew_seconds, 0.0);
    assert_eq!(guide.mount_code, 0);
    assert_eq!(guide.timeout, Duration::from_millis(5_500));
    assert_eq!(mount.ledger().live(), 0);
}

#[test]
fn test_handshake_sends_zero_correction() {
    let (mount, handle) = connected_mount(EqMacProtocol::default());
    assert!(mount.is_connected());
    let events = handle.received();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].ew_seconds, 0.0);
    assert_eq!(events[0].ns_seconds, 0.0);
}

#[test]
fn test_each_direction_moves_one_axis() {
    let (mut mount, handle) = connected_mount(EqMacProtocol::default());
    let cases = [
        (GuideDirection::North, 0.0, 0.25),
        (GuideDirection::South, 0.0, -0.25),
        (GuideDirection::East, 0.25, 0.0),
        (GuideDirection::West, -0.25, 0.0),
    ];

    for (direction, ew, ns) in cases {
        assert_eq!(mount.guide(direction, 250), MoveResult::Success);
        let last = handle.received().pop().unwrap();
        assert_eq!((last.ew_seconds, last.ns_seconds), (ew, ns), "{}", direction);
    }
}

#[test]
fn test_every_direction_reaches_one_axis() {
    let (mut mount, handle) = connected_mount(EqMacProtocol::default());

    for direction in GuideDirection::ALL {
        assert_eq!(mount.guide(direction, 1000), MoveResult::Success);
        let last = handle.received().pop().unwrap();
        let (moved, idle) = if direction.is_dec_axis() {
            (last.ns_seconds, last.ew_seconds)
        } else {
            (last.ew_seconds, last.ns_seconds)
        };
        assert_eq!(moved.abs(), 1.0, "{}", direction);
        assert_eq!(idle, 0.0, "{}", direction);
    }
}

#[test]
fn test_pulse_blocks_until_reply() {
    let (mut mount, handle) = connected_mount(EqMacProtocol::default());
    handle.set_time_scale(1.0);

    let started = Instant::now();
    assert_eq!(mount.guide(GuideDirection::West, 200), MoveResult::Success);
    assert!(started.elapsed() >= Duration::from_millis(200));
}

#[test]
fn test_hung_application_times_out() {
    let (mut mount, handle) = connected_mount(protocol_with_timeout(50));
    handle.set_hung(true);

    let started = Instant::now();
    assert_eq!(mount.guide(GuideDirection::East, 1000), MoveResult::Error);
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(1050));
    assert!(elapsed < Duration::from_secs(5));
    assert_eq!(mount.ledger().live(), 0);
}

#[test]
fn test_status_mapping() {
    let (mut mount, handle) = connected_mount(EqMacProtocol::default());

    handle.push_status(-128);
    assert_eq!(mount.guide(GuideDirection::East, 100), MoveResult::Stopped);

    handle.push_status(7);
    assert_eq!(mount.guide(GuideDirection::East, 100), MoveResult::Error);

    handle.push_status(0);
    assert_eq!(mount.guide(GuideDirection::East, 100), MoveResult::Success);
    assert_eq!(mount.ledger().live(), 0);
}

#[test]
fn test_send_failures_are_errors() {
    let transport = ScriptedTransport::new([
        Ok(0),
        Err(OsErr::WAIT_CANCELED),
        Err(OsErr::USER_CANCELED),
        Err(OsErr::TIMEOUT),
        Ok(-128),
    ]);
    let mut mount = EqMacMount::new(transport, EqMacProtocol::default());
    mount.connect().unwrap();

    assert_eq!(mount.guide(GuideDirection::North, 100), MoveResult::Error);
    assert_eq!(mount.guide(GuideDirection::North, 100), MoveResult::Error);
    assert_eq!(mount.guide(GuideDirection::North, 100), MoveResult::Error);
    // A cancel status in the reply is still Stopped
    assert_eq!(mount.guide(GuideDirection::North, 100), MoveResult::Stopped);
    assert_eq!(mount.ledger().live(), 0);
}

#[test]
fn test_custom_stopped_codes() {
    let protocol = EqMacProtocol {
        stopped_codes: vec![-128, 42],
        ..EqMacProtocol::default()
    };
    let (mut mount, handle) = connected_mount(protocol);
    handle.push_status(42);
    assert_eq!(mount.guide(GuideDirection::South, 100), MoveResult::Stopped);
}

#[test]
fn test_malformed_replies_are_errors() {
    let (mut mount, handle) = connected_mount(EqMacProtocol::default());

    handle.set_omit_status(true);
    assert_eq!(mount.guide(GuideDirection::North, 100), MoveResult::Error);
    handle.set_omit_status(false);

    handle.set_handler_error(Some(-1708));
    assert_eq!(mount.guide(GuideDirection::North, 100), MoveResult::Error);
    handle.set_handler_error(None);

    assert_eq!(mount.guide(GuideDirection::North, 100), MoveResult::Success);
    assert_eq!(mount.ledger().live(), 0);
    assert_eq!(mount.ledger().total_created(), 8);
}

#[test]
fn test_application_quit_after_connect() {
    let (mut mount, handle) = connected_mount(EqMacProtocol::default());
    handle.set_running(false);
    assert_eq!(mount.guide(GuideDirection::West, 100), MoveResult::Error);
    assert_eq!(handle.received().len(), 1);
}

#[test]
fn test_connect_fails_when_not_running() {
    let app = SimulatedEqMac::new();
    app.handle().set_running(false);
    let mut mount = EqMacMount::new(app, EqMacProtocol::default());

    let err = mount.connect().unwrap_err();
    assert!(matches!(err, GuideError::ConnectionFailure { .. }));
    assert!(!mount.is_connected());
    assert_eq!(mount.guide(GuideDirection::North, 100), MoveResult::Error);
    assert_eq!(mount.ledger().live(), 0);
}

#[test]
fn test_connect_rejects_wrong_signature() {
    let protocol = EqMacProtocol {
        signature: FourCharCode::from_bytes(b"XXXX"),
        ..EqMacProtocol::default()
    };
    // Application registered under the default signature
    let mut mount = EqMacMount::new(SimulatedEqMac::new(), protocol);
    assert!(mount.connect().is_err());
}

#[test]
fn test_connect_rejects_nonzero_handshake() {
    let app = SimulatedEqMac::new();
    app.handle().push_status(3);
    let mut mount = EqMacMount::new(app, EqMacProtocol::default());
    assert!(mount.connect().is_err());
    assert!(!mount.is_connected());
}

#[test]
fn test_disconnect_is_non_fatal() {
    let (mut mount, _) = connected_mount(EqMacProtocol::default());

    let err = mount.disconnect().unwrap_err();
    assert!(matches!(err, GuideError::NothingToDisconnect { .. }));
    assert!(!err.is_fatal());
    assert!(!mount.is_connected());

    mount.connect().expect("reconnect after disconnect");
    assert!(mount.is_connected());
}

#[test]
fn test_pending_abort_sends_nothing() {
    let (mut mount, handle) = connected_mount(EqMacProtocol::default());
    let abort = mount.abort_signal();
    abort.request();

    assert_eq!(mount.guide(GuideDirection::North, 500), MoveResult::Stopped);
    assert_eq!(handle.received().len(), 1, "only the handshake reached EQMac");

    abort.clear();
    assert_eq!(mount.guide(GuideDirection::North, 500), MoveResult::Success);
}

#[test]
fn test_mount_as_trait_object() {
    let (mount, _) = connected_mount(EqMacProtocol::default());
    let mut boxed: Box<dyn Mount> = Box::new(mount);
    assert_eq!(boxed.name(), "EQMac");
    assert_eq!(boxed.guide(GuideDirection::South, 10), MoveResult::Success);
}

/// Needs EQMac running on the local machine.
#[cfg(all(target_os = "macos", feature = "apple_events", feature = "hardware_tests"))]
#[test]
fn test_native_eqmac_round_trip() {
    use guide_hal::hardware::eqmac::CoreServicesTransport;

    let mut mount = EqMacMount::new(CoreServicesTransport::new(), EqMacProtocol::default());
    mount.connect().expect("EQMac must be running");
    assert_eq!(mount.guide(GuideDirection::North, 100), MoveResult::Success);
    assert_eq!(mount.ledger().live(), 0);
}
