//! Seams to the platform MIDI layer.

use std::sync::Arc;

use crate::{BackendReport, PortDirection, PortInfo, Result};

/// Event delivered by an open transport, on a backend-owned thread.
#[derive(Debug)]
pub enum TransportEvent<'a> {
    /// Raw MIDI bytes in arrival order.
    Message(&'a [u8]),
    Error(BackendReport),
    Warning(BackendReport),
}

/// Receiver for transport events.
pub type TransportSink = Arc<dyn Fn(TransportEvent<'_>) + Send + Sync>;

/// One paired input/output connection.
///
/// Implementations lock input and output independently so that `send` may be
/// called from inside the sink (on the input thread) while another thread is
/// closing the transport.
pub trait MidiTransport: Send + Sync {
    /// Connect both ports and start delivering events to `sink`.
    fn open(&self, input: &PortInfo, output: &PortInfo, sink: TransportSink) -> Result<()>;

    /// Disconnect both ports. Blocks until no further events are delivered.
    fn close(&self);

    /// Send raw bytes on the output port.
    fn send(&self, bytes: &[u8]) -> Result<()>;

    fn is_open(&self) -> bool;
}

/// Backend abstraction for platform specific MIDI implementations.
pub trait MidiBackend: Send + Sync {
    /// Enumerate ports currently exposed in `direction`.
    fn enumerate(&self, direction: PortDirection) -> Result<Vec<PortInfo>>;

    /// Create an unopened transport.
    fn transport(&self) -> Box<dyn MidiTransport>;
}
