//! SysEx identity handshake.
//!
//! The verifier sends a universal identity request and classifies the
//! device from the first well-formed identity reply against the
//! [`KnownDevices`] table.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::callback::CallbackSlot;
use crate::known::KnownDevices;
use crate::names::{NameLease, NameRegistry};
use crate::transport::MidiTransport;
use crate::Availability;

/// Universal non-realtime identity request, addressed to all devices.
pub const IDENTITY_REQUEST: [u8; 6] = [0xF0, 0x7E, 0x7F, 0x06, 0x01, 0xF7];

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

/// Name reported for devices that answered with an unrecognised identity.
pub const UNKNOWN_DEVICE: &str = "Unknown";

/// Handler invoked with the triggering message and the resulting status.
pub type VerifiedHandler = dyn Fn(&[u8], Availability) + Send + Sync;

#[derive(Debug)]
struct State {
    status: Availability,
    identity: Vec<u8>,
    name: String,
    display_name: String,
    lease: Option<NameLease>,
    started: Option<Instant>,
}

/// Identity verification state machine for one device.
pub struct IdentityVerifier {
    state: Mutex<State>,
    timeout: Duration,
    known: Arc<KnownDevices>,
    names: Arc<NameRegistry>,
    on_verified: CallbackSlot<VerifiedHandler>,
}

impl IdentityVerifier {
    pub fn new(known: Arc<KnownDevices>, names: Arc<NameRegistry>, timeout: Duration) -> Self {
        Self {
            state: Mutex::new(State {
                status: Availability::NotChecked,
                identity: Vec::new(),
                name: String::new(),
                display_name: String::new(),
                lease: None,
                started: None,
            }),
            timeout,
            known,
            names,
            on_verified: CallbackSlot::new(),
        }
    }

    pub fn on_verified(&self, handler: Arc<VerifiedHandler>) {
        self.on_verified.set(handler);
    }

    /// Send the identity request. Returns `false` if verification already
    /// started.
    pub fn verify(&self, transport: &dyn MidiTransport) -> bool {
        {
            let mut state = self.state.lock();
            if state.status != Availability::NotChecked {
                return false;
            }
            state.status = Availability::InProgress;
            state.started = Some(Instant::now());
        }
        debug!("sending identity request");
        if let Err(err) = transport.send(&IDENTITY_REQUEST) {
            // Left in progress; the timeout settles it.
            warn!(%err, "failed to send identity request");
        }
        true
    }

    /// Process one message received while verification is in progress and
    /// return the resulting status.
    ///
    /// Messages that are not identity replies leave the status untouched and
    /// do not reach the verified handler.
    pub fn handle(&self, bytes: &[u8]) -> Availability {
        let status = {
            let mut state = self.state.lock();
            if state.status != Availability::InProgress {
                return state.status;
            }
            let timed_out = state
                .started
                .is_some_and(|started| started.elapsed() > self.timeout);
            if timed_out {
                state.status = Availability::TimedOut;
            } else {
                let Some(payload) = identity_payload(bytes, self.known.min_payload_len()) else {
                    return Availability::InProgress;
                };
                self.classify(&mut state, payload);
            }
            state.status
        };
        self.finish(bytes, status);
        status
    }

    /// Time out a verification that has been in progress for longer than
    /// the timeout. Returns `true` if this call made the transition.
    pub fn expire(&self) -> bool {
        {
            let mut state = self.state.lock();
            let due = state
                .started
                .is_some_and(|started| started.elapsed() >= self.timeout);
            if state.status != Availability::InProgress || !due {
                return false;
            }
            state.status = Availability::TimedOut;
        }
        self.finish(&[], Availability::TimedOut);
        true
    }

    fn classify(&self, state: &mut State, payload: &[u8]) {
        match self.known.match_payload(payload) {
            Some((name, _)) => {
                let lease = self.names.acquire(name);
                state.status = Availability::Available;
                state.name = lease.canonical.clone();
                state.display_name = lease.display.clone();
                state.identity = payload.to_vec();
                state.lease = Some(lease);
            }
            None => {
                debug!(identity = ?payload, "identity matches no known device");
                state.status = Availability::Unavailable;
                state.name = UNKNOWN_DEVICE.to_owned();
                state.display_name = UNKNOWN_DEVICE.to_owned();
            }
        }
    }

    fn finish(&self, bytes: &[u8], status: Availability) {
        info!(%status, name = %self.display_name(), "identity verification finished");
        if let Some(handler) = self.on_verified.get() {
            handler(bytes, status);
        }
    }

    pub fn status(&self) -> Availability {
        self.state.lock().status
    }

    /// Raw identity payload once the device is available.
    pub fn identity(&self) -> Vec<u8> {
        self.state.lock().identity.clone()
    }

    /// Canonical name of the matched device.
    pub fn name(&self) -> String {
        self.state.lock().name.clone()
    }

    pub fn display_name(&self) -> String {
        self.state.lock().display_name.clone()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl Drop for IdentityVerifier {
    fn drop(&mut self) {
        if let Some(lease) = self.state.get_mut().lease.take() {
            self.names.release(&lease);
        }
    }
}

/// Extract the payload of an identity reply
/// (`F0 7E <id> 06 02 <payload> F7`), or `None` if `bytes` is not one.
pub fn identity_payload(bytes: &[u8], min_payload: usize) -> Option<&[u8]> {
    if bytes.len() < 6 {
        return None;
    }
    if bytes[0] != 0xF0 || bytes[1] != 0x7E || bytes[3] != 0x06 || bytes[4] != 0x02 {
        return None;
    }
    let payload = &bytes[5..bytes.len() - 1];
    if payload.len() < min_payload {
        debug!(len = bytes.len(), "identity reply too short for any known device");
        return None;
    }
    Some(payload)
}
