//! Hot-plug aware MIDI controller tracking.
//!
//! Ports reported by a [`MidiBackend`] are paired into [`Device`]s, each of
//! which verifies its identity with a SysEx handshake before its traffic is
//! recorded or dispatched. The [`DeviceManager`] keeps the device table in
//! sync with hot-plug events and relays debounced notifications.

use std::fmt;
use std::panic::Location;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use thiserror::Error;

pub mod backend_virtual;
#[cfg(feature = "midir-backend")]
pub mod backend_midir;
pub mod callback;
pub mod config;
pub mod debounce;
pub mod device;
pub mod dispatcher;
pub mod hotplug;
pub mod known;
pub mod manager;
pub mod names;
pub mod ports;
pub mod recorder;
pub mod timer;
pub mod transport;
pub mod verifier;

#[cfg(feature = "midir-backend")]
pub use backend_midir::MidirBackend;
pub use backend_virtual::{VirtualBackend, VirtualPeer};
pub use config::ManagerConfig;
pub use debounce::Debouncer;
pub use device::{Device, DeviceContext};
pub use hotplug::{HotplugEvent, HotplugWatcher};
pub use known::{KnownDeviceIdentity, KnownDevices};
pub use manager::{pair_ports, DeviceId, DeviceInfo, DeviceManager};
pub use names::NameRegistry;
pub use ports::PortManager;
pub use recorder::Recorder;
pub use timer::TimerQueue;
pub use transport::{MidiBackend, MidiTransport, TransportEvent, TransportSink};
pub use verifier::IdentityVerifier;

/// Timestamp of a recorded message, in milliseconds since recording started.
pub type MidiTimestamp = u64;

/// Errors that can be produced while dealing with MIDI backends.
#[derive(Debug, Error)]
pub enum MidiError {
    /// The requested port could not be found.
    #[error("unknown MIDI port: {0}")]
    UnknownPort(String),
    /// Backend specific failure with additional context.
    #[error("backend error: {0}")]
    Backend(String),
    /// The transport has no open connection.
    #[error("transport is not open")]
    NotOpen,
    /// Spawning a worker thread or touching the filesystem failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Invalid configuration.
    #[error("invalid config: {0}")]
    Config(String),
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, MidiError>;

/// Direction of a hardware port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PortDirection {
    Input,
    Output,
}

/// Descriptor of one hardware-exposed MIDI endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortInfo {
    /// Backend port name, unique within its direction.
    pub name: String,
    /// Human readable label as reported by the backend.
    pub display_name: String,
    /// Name of the hardware device exposing the port, if known.
    pub device_name: String,
    /// Backend port index at enumeration time.
    pub index: usize,
    pub direction: PortDirection,
}

impl PortInfo {
    /// Creates a descriptor whose display and device names equal `name`.
    pub fn new(name: impl Into<String>, direction: PortDirection, index: usize) -> Self {
        let name = name.into();
        Self {
            display_name: name.clone(),
            device_name: name.clone(),
            name,
            index,
            direction,
        }
    }

    pub fn input(name: impl Into<String>, index: usize) -> Self {
        Self::new(name, PortDirection::Input, index)
    }

    pub fn output(name: impl Into<String>, index: usize) -> Self {
        Self::new(name, PortDirection::Output, index)
    }
}

/// Verification state of a device.
///
/// Only ever advances `NotChecked -> InProgress -> {Available, Unavailable, TimedOut}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Availability {
    NotChecked,
    InProgress,
    Available,
    Unavailable,
    TimedOut,
}

impl Availability {
    /// Whether verification has finished.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Availability::Available | Availability::Unavailable | Availability::TimedOut
        )
    }

    /// Whether `next` is a legal forward step from `self`.
    pub fn can_advance_to(self, next: Availability) -> bool {
        match self {
            Availability::NotChecked => next == Availability::InProgress,
            Availability::InProgress => next.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for Availability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Availability::NotChecked => "not checked",
            Availability::InProgress => "in progress",
            Availability::Available => "available",
            Availability::Unavailable => "unavailable",
            Availability::TimedOut => "timed out",
        };
        f.write_str(label)
    }
}

/// One recorded message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    /// Raw MIDI bytes.
    pub bytes: SmallVec<[u8; 3]>,
    /// Milliseconds since recording started on the owning device.
    pub timestamp: MidiTimestamp,
}

impl MessageRecord {
    pub fn new(bytes: &[u8], timestamp: MidiTimestamp) -> Self {
        Self {
            bytes: SmallVec::from_slice(bytes),
            timestamp,
        }
    }
}

/// Error or warning raised by a backend, tagged with where it was reported.
#[derive(Debug, Clone)]
pub struct BackendReport {
    pub message: String,
    pub location: &'static Location<'static>,
}

impl BackendReport {
    /// Creates a report located at the caller.
    #[track_caller]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            location: Location::caller(),
        }
    }
}

impl fmt::Display for BackendReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}:{})",
            self.message,
            self.location.file(),
            self.location.line()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn availability_only_moves_forward() {
        use Availability::*;
        assert!(NotChecked.can_advance_to(InProgress));
        assert!(InProgress.can_advance_to(Available));
        assert!(InProgress.can_advance_to(TimedOut));
        assert!(!Available.can_advance_to(InProgress));
        assert!(!TimedOut.can_advance_to(Available));
        assert!(!NotChecked.can_advance_to(Available));
    }

    #[test]
    fn report_records_caller_location() {
        let report = BackendReport::new("port vanished");
        assert_eq!(report.location.file(), file!());
        assert!(report.to_string().starts_with("port vanished ("));
    }
}
