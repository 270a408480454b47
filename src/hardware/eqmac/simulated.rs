//! In-process EQMac stand-in.
//!
//! Decodes guide events the way the real application's handler does, blocks
//! for the pulse (scaled by `time_scale`) and answers with a scripted status.
//! Tests drive it through a [`SimulatedEqMacHandle`].

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use super::apple_event::{codes, AeValue, AppleEvent, AppleEventTransport, FourCharCode, OsErr};
use super::{EqMacProtocol, PARAM_EW_CORRECTION, PARAM_MOUNT_CODE, PARAM_NS_CORRECTION};

/// Guide events kept for inspection; older ones are dropped first.
const RECEIVED_LIMIT: usize = 256;

/// Guide event as decoded by the simulated application.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedGuideEvent {
    /// East/west correction in seconds
    pub ew_seconds: f64,
    /// North/south correction in seconds
    pub ns_seconds: f64,
    /// Mount-type code
    pub mount_code: i32,
    /// Timeout the sender allowed
    pub timeout: Duration,
}

#[derive(Debug)]
struct AppState {
    running: bool,
    hung: bool,
    signature: FourCharCode,
    event_class: FourCharCode,
    event_id: FourCharCode,
    scripted: VecDeque<i16>,
    default_status: i16,
    omit_status: bool,
    handler_error: Option<i32>,
    latency: Duration,
    time_scale: f64,
    received: VecDeque<ReceivedGuideEvent>,
}

/// Test handle to a [`SimulatedEqMac`].
#[derive(Debug, Clone)]
pub struct SimulatedEqMacHandle {
    state: Arc<Mutex<AppState>>,
}

impl SimulatedEqMacHandle {
    /// Start or quit the application.
    pub fn set_running(&self, running: bool) {
        self.state.lock().running = running;
    }

    /// Keep the application running but never reply.
    pub fn set_hung(&self, hung: bool) {
        self.state.lock().hung = hung;
    }

    /// Queue a status for the next reply.
    pub fn push_status(&self, status: i16) {
        self.state.lock().scripted.push_back(status);
    }

    /// Status used when nothing is queued.
    pub fn set_default_status(&self, status: i16) {
        self.state.lock().default_status = status;
    }

    /// Reply without a status parameter.
    pub fn set_omit_status(&self, omit: bool) {
        self.state.lock().omit_status = omit;
    }

    /// Put `errn` into every reply.
    pub fn set_handler_error(&self, errn: Option<i32>) {
        self.state.lock().handler_error = errn;
    }

    /// Extra delay before each reply.
    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().latency = latency;
    }

    /// Multiplier applied to the pulse the application waits out.
    pub fn set_time_scale(&self, scale: f64) {
        self.state.lock().time_scale = scale;
    }

    /// The most recent guide events handled, oldest first.
    pub fn received(&self) -> Vec<ReceivedGuideEvent> {
        self.state.lock().received.iter().cloned().collect()
    }
}

/// Simulated EQMac reachable through [`AppleEventTransport`].
#[derive(Debug)]
pub struct SimulatedEqMac {
    state: Arc<Mutex<AppState>>,
}

impl Default for SimulatedEqMac {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedEqMac {
    /// Running application answering the default protocol with status 0.
    pub fn new() -> Self {
        Self::with_protocol(&EqMacProtocol::default())
    }

    /// Running application that handles `protocol`'s event.
    pub fn with_protocol(protocol: &EqMacProtocol) -> Self {
        Self {
            state: Arc::new(Mutex::new(AppState {
                running: true,
                hung: false,
                signature: protocol.signature,
                event_class: protocol.event_class,
                event_id: protocol.event_id,
                scripted: VecDeque::new(),
                default_status: 0,
                omit_status: false,
                handler_error: None,
                latency: Duration::ZERO,
                time_scale: 0.0,
                received: VecDeque::with_capacity(RECEIVED_LIMIT),
            })),
        }
    }

    /// Handle for scripting and inspection.
    pub fn handle(&self) -> SimulatedEqMacHandle {
        SimulatedEqMacHandle {
            state: self.state.clone(),
        }
    }
}

fn decode(event: &AppleEvent, timeout: Duration) -> Result<ReceivedGuideEvent, OsErr> {
    let ew_seconds = match event.param(PARAM_EW_CORRECTION) {
        Some(AeValue::Float64(v)) => v,
        Some(_) => return Err(OsErr::COERCION_FAIL),
        None => return Err(OsErr::DESC_NOT_FOUND),
    };
    let ns_seconds = match event.param(PARAM_NS_CORRECTION) {
        Some(AeValue::Float64(v)) => v,
        Some(_) => return Err(OsErr::COERCION_FAIL),
        None => return Err(OsErr::DESC_NOT_FOUND),
    };
    let mount_code = event
        .get_i32(PARAM_MOUNT_CODE)
        .ok_or(OsErr::DESC_NOT_FOUND)?;
    Ok(ReceivedGuideEvent {
        ew_seconds,
        ns_seconds,
        mount_code,
        timeout,
    })
}

impl AppleEventTransport for SimulatedEqMac {
    fn send(
        &mut self,
        event: &AppleEvent,
        reply: &mut AppleEvent,
        timeout: Duration,
    ) -> Result<(), OsErr> {
        let (latency, scale) = {
            let state = self.state.lock();
            if !state.running || event.target() != Some(state.signature) {
                return Err(OsErr::PROC_NOT_FOUND);
            }
            if state.hung {
                (None, 0.0)
            } else {
                if event.event_class() != state.event_class || event.event_id() != state.event_id {
                    return Err(OsErr::EVENT_NOT_HANDLED);
                }
                (Some(state.latency), state.time_scale)
            }
        };

        let Some(latency) = latency else {
            thread::sleep(timeout);
            return Err(OsErr::TIMEOUT);
        };

        let received = decode(event, timeout)?;
        let pulse_seconds = received.ew_seconds.abs().max(received.ns_seconds.abs());
        let busy = latency + Duration::from_secs_f64(pulse_seconds * scale.max(0.0));
        if busy > timeout {
            thread::sleep(timeout);
            return Err(OsErr::TIMEOUT);
        }
        thread::sleep(busy);

        let mut state = self.state.lock();
        debug!(
            ew = received.ew_seconds,
            ns = received.ns_seconds,
            "simulated EQMac handled guide event"
        );
        if state.received.len() == RECEIVED_LIMIT {
            state.received.pop_front();
        }
        state.received.push_back(received);
        let status = state.scripted.pop_front().unwrap_or(state.default_status);
        if !state.omit_status {
            reply.put_param(codes::KEY_DIRECT_OBJECT, AeValue::SInt16(status));
        }
        if let Some(errn) = state.handler_error {
            reply.put_param(codes::KEY_ERROR_NUMBER, AeValue::SInt32(errn));
        }
        Ok(())
    }
}
