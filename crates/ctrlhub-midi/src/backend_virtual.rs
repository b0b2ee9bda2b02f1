//! In-memory backend with scriptable peers.
//!
//! Ports are plugged and unplugged programmatically, messages are injected
//! into input ports, and everything sent to an output port is captured.
//! Peers configured with an identity answer the identity request on their
//! input port, synchronously on the sending thread.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::transport::{MidiBackend, MidiTransport, TransportEvent, TransportSink};
use crate::verifier::IDENTITY_REQUEST;
use crate::{BackendReport, MidiError, PortDirection, PortInfo, Result};

/// Identity payload of a Novation Launchpad Pro (manufacturer, device code,
/// family member and firmware bytes).
pub const LAUNCHPAD_PRO_IDENTITY: [u8; 7] = [0x00, 0x20, 0x29, 0x51, 0x00, 0x00, 0x01];

/// Description of a simulated controller.
#[derive(Debug, Clone)]
pub struct VirtualPeer {
    pub name: String,
    pub input: String,
    pub output: String,
    pub identity: Option<Vec<u8>>,
}

impl VirtualPeer {
    /// A peer exposing `"<name> In"` and `"<name> Out"`.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            input: format!("{name} In"),
            output: format!("{name} Out"),
            name,
            identity: None,
        }
    }

    pub fn with_ports(mut self, input: impl Into<String>, output: impl Into<String>) -> Self {
        self.input = input.into();
        self.output = output.into();
        self
    }

    /// Answer identity requests with `payload`.
    pub fn with_identity(mut self, payload: &[u8]) -> Self {
        self.identity = Some(payload.to_vec());
        self
    }
}

struct Connection {
    id: u64,
    input: String,
    output: String,
    sink: TransportSink,
}

#[derive(Default)]
struct Inner {
    inputs: Vec<PortInfo>,
    outputs: Vec<PortInfo>,
    peers: Vec<VirtualPeer>,
    connections: Vec<Connection>,
    sent: Vec<(String, Vec<u8>)>,
    next_index: usize,
    next_connection: u64,
}

impl Inner {
    fn add_port(&mut self, name: &str, direction: PortDirection) -> PortInfo {
        let index = self.next_index;
        let ports = match direction {
            PortDirection::Input => &mut self.inputs,
            PortDirection::Output => &mut self.outputs,
        };
        if let Some(existing) = ports.iter().find(|port| port.name == name) {
            return existing.clone();
        }
        self.next_index += 1;
        let port = PortInfo::new(name, direction, index);
        ports.push(port.clone());
        port
    }

    fn sinks_for_input(&self, input: &str) -> Vec<TransportSink> {
        self.connections
            .iter()
            .filter(|conn| conn.input == input)
            .map(|conn| Arc::clone(&conn.sink))
            .collect()
    }
}

/// Backend whose hardware is simulated in memory.
#[derive(Clone, Default)]
pub struct VirtualBackend {
    inner: Arc<Mutex<Inner>>,
}

impl VirtualBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Expose the peer's ports and return them as (input, output).
    pub fn plug(&self, peer: VirtualPeer) -> (PortInfo, PortInfo) {
        let mut inner = self.inner.lock();
        let input = inner.add_port(&peer.input, PortDirection::Input);
        let output = inner.add_port(&peer.output, PortDirection::Output);
        inner.peers.retain(|existing| existing.name != peer.name);
        inner.peers.push(peer);
        (input, output)
    }

    /// Remove the peer's ports. Open connections stay open but go quiet.
    pub fn unplug(&self, name: &str) {
        let mut inner = self.inner.lock();
        let Some(pos) = inner.peers.iter().position(|peer| peer.name == name) else {
            return;
        };
        let peer = inner.peers.remove(pos);
        inner.inputs.retain(|port| port.name != peer.input);
        inner.outputs.retain(|port| port.name != peer.output);
    }

    /// Expose a single port without a peer behind it.
    pub fn add_port(&self, name: &str, direction: PortDirection) -> PortInfo {
        self.inner.lock().add_port(name, direction)
    }

    pub fn remove_port(&self, name: &str, direction: PortDirection) {
        let mut inner = self.inner.lock();
        match direction {
            PortDirection::Input => inner.inputs.retain(|port| port.name != name),
            PortDirection::Output => inner.outputs.retain(|port| port.name != name),
        }
    }

    /// Deliver `bytes` to every transport listening on `input`.
    pub fn inject(&self, input: &str, bytes: &[u8]) {
        let sinks = self.inner.lock().sinks_for_input(input);
        for sink in sinks {
            sink(TransportEvent::Message(bytes));
        }
    }

    #[track_caller]
    pub fn report_error(&self, input: &str, message: &str) {
        let report = BackendReport::new(message);
        let sinks = self.inner.lock().sinks_for_input(input);
        for sink in sinks {
            sink(TransportEvent::Error(report.clone()));
        }
    }

    #[track_caller]
    pub fn report_warning(&self, input: &str, message: &str) {
        let report = BackendReport::new(message);
        let sinks = self.inner.lock().sinks_for_input(input);
        for sink in sinks {
            sink(TransportEvent::Warning(report.clone()));
        }
    }

    /// Everything sent to `output` so far.
    pub fn sent(&self, output: &str) -> Vec<Vec<u8>> {
        self.inner
            .lock()
            .sent
            .iter()
            .filter(|(port, _)| port == output)
            .map(|(_, bytes)| bytes.clone())
            .collect()
    }

    /// Number of currently open transports.
    pub fn open_connections(&self) -> usize {
        self.inner.lock().connections.len()
    }
}

impl MidiBackend for VirtualBackend {
    fn enumerate(&self, direction: PortDirection) -> Result<Vec<PortInfo>> {
        let inner = self.inner.lock();
        Ok(match direction {
            PortDirection::Input => inner.inputs.clone(),
            PortDirection::Output => inner.outputs.clone(),
        })
    }

    fn transport(&self) -> Box<dyn MidiTransport> {
        Box::new(VirtualTransport {
            backend: Arc::clone(&self.inner),
            connection: Mutex::new(None),
        })
    }
}

struct VirtualTransport {
    backend: Arc<Mutex<Inner>>,
    connection: Mutex<Option<u64>>,
}

impl MidiTransport for VirtualTransport {
    fn open(&self, input: &PortInfo, output: &PortInfo, sink: TransportSink) -> Result<()> {
        let mut backend = self.backend.lock();
        if !backend.inputs.iter().any(|port| port.name == input.name) {
            return Err(MidiError::UnknownPort(input.name.clone()));
        }
        if !backend.outputs.iter().any(|port| port.name == output.name) {
            return Err(MidiError::UnknownPort(output.name.clone()));
        }
        let id = backend.next_connection;
        backend.next_connection += 1;
        backend.connections.push(Connection {
            id,
            input: input.name.clone(),
            output: output.name.clone(),
            sink,
        });
        *self.connection.lock() = Some(id);
        Ok(())
    }

    fn close(&self) {
        if let Some(id) = self.connection.lock().take() {
            self.backend.lock().connections.retain(|conn| conn.id != id);
        }
    }

    fn send(&self, bytes: &[u8]) -> Result<()> {
        let id = (*self.connection.lock()).ok_or(MidiError::NotOpen)?;
        let (reply, sinks) = {
            let mut backend = self.backend.lock();
            let output = backend
                .connections
                .iter()
                .find(|conn| conn.id == id)
                .map(|conn| conn.output.clone())
                .ok_or(MidiError::NotOpen)?;
            backend.sent.push((output.clone(), bytes.to_vec()));
            if bytes != IDENTITY_REQUEST.as_slice() {
                return Ok(());
            }
            let Some(peer) = backend.peers.iter().find(|peer| peer.output == output) else {
                return Ok(());
            };
            let Some(identity) = &peer.identity else {
                return Ok(());
            };
            let mut reply = vec![0xF0, 0x7E, 0x00, 0x06, 0x02];
            reply.extend_from_slice(identity);
            reply.push(0xF7);
            let sinks = backend.sinks_for_input(&peer.input);
            (reply, sinks)
        };
        for sink in sinks {
            sink(TransportEvent::Message(&reply));
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.connection.lock().is_some()
    }
}

impl Drop for VirtualTransport {
    fn drop(&mut self) {
        self.close();
    }
}
