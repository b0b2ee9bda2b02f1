//! Live, de-duplicated view of the ports a backend exposes.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::callback::CallbackSlot;
use crate::device::ReportHandler;
use crate::transport::MidiBackend;
use crate::{BackendReport, PortDirection, PortInfo, Result};

pub type PortHandler = dyn Fn(&PortInfo) + Send + Sync;
pub type ChangedHandler = dyn Fn() + Send + Sync;

#[derive(Debug, Default)]
struct PortLists {
    inputs: Vec<PortInfo>,
    outputs: Vec<PortInfo>,
}

impl PortLists {
    fn list_mut(&mut self, direction: PortDirection) -> &mut Vec<PortInfo> {
        match direction {
            PortDirection::Input => &mut self.inputs,
            PortDirection::Output => &mut self.outputs,
        }
    }
}

/// Tracks input and output ports by name.
///
/// Hardware add/remove notifications enter through [`PortManager::port_added`]
/// and [`PortManager::port_removed`], usually from a backend thread. A port
/// name is tracked at most once per direction, and callbacks fire once per
/// actual transition, after the port lists have been unlocked.
pub struct PortManager {
    backend: Arc<dyn MidiBackend>,
    ports: Mutex<PortLists>,
    on_ports_changed: CallbackSlot<ChangedHandler>,
    on_input_added: CallbackSlot<PortHandler>,
    on_input_removed: CallbackSlot<PortHandler>,
    on_output_added: CallbackSlot<PortHandler>,
    on_output_removed: CallbackSlot<PortHandler>,
    on_error: CallbackSlot<ReportHandler>,
    on_warning: CallbackSlot<ReportHandler>,
}

impl PortManager {
    pub fn new(backend: Arc<dyn MidiBackend>) -> Self {
        Self {
            backend,
            ports: Mutex::new(PortLists::default()),
            on_ports_changed: CallbackSlot::new(),
            on_input_added: CallbackSlot::new(),
            on_input_removed: CallbackSlot::new(),
            on_output_added: CallbackSlot::new(),
            on_output_removed: CallbackSlot::new(),
            on_error: CallbackSlot::new(),
            on_warning: CallbackSlot::new(),
        }
    }

    pub fn backend(&self) -> &Arc<dyn MidiBackend> {
        &self.backend
    }

    /// Re-read both port lists from the backend and replace the cached
    /// ones. Fires no callbacks.
    pub fn scan(&self) -> Result<()> {
        let inputs = dedup_by_name(self.backend.enumerate(PortDirection::Input)?);
        let outputs = dedup_by_name(self.backend.enumerate(PortDirection::Output)?);
        debug!(inputs = inputs.len(), outputs = outputs.len(), "scanned midi ports");
        *self.ports.lock() = PortLists { inputs, outputs };
        Ok(())
    }

    /// Track a newly reported port. Returns `false` if the name was already
    /// tracked in that direction.
    pub fn port_added(&self, port: PortInfo) -> bool {
        {
            let mut ports = self.ports.lock();
            let list = ports.list_mut(port.direction);
            if list.iter().any(|existing| existing.name == port.name) {
                return false;
            }
            list.push(port.clone());
        }
        info!(port = %port.name, direction = ?port.direction, "midi port added");
        self.fire_changed();
        let slot = match port.direction {
            PortDirection::Input => &self.on_input_added,
            PortDirection::Output => &self.on_output_added,
        };
        if let Some(handler) = slot.get() {
            handler(&port);
        }
        true
    }

    /// Forget a port. Returns `false` if it was not tracked.
    pub fn port_removed(&self, port: &PortInfo) -> bool {
        let removed = {
            let mut ports = self.ports.lock();
            let list = ports.list_mut(port.direction);
            let Some(pos) = list.iter().position(|existing| existing.name == port.name) else {
                return false;
            };
            list.remove(pos)
        };
        info!(port = %removed.name, direction = ?removed.direction, "midi port removed");
        self.fire_changed();
        let slot = match removed.direction {
            PortDirection::Input => &self.on_input_removed,
            PortDirection::Output => &self.on_output_removed,
        };
        if let Some(handler) = slot.get() {
            handler(&removed);
        }
        true
    }

    /// Log and forward a backend error.
    pub fn report_error(&self, report: &BackendReport) {
        error!(%report, "midi backend error");
        if let Some(handler) = self.on_error.get() {
            handler(report);
        }
    }

    /// Log and forward a backend warning.
    pub fn report_warning(&self, report: &BackendReport) {
        warn!(%report, "midi backend warning");
        if let Some(handler) = self.on_warning.get() {
            handler(report);
        }
    }

    fn fire_changed(&self) {
        if let Some(handler) = self.on_ports_changed.get() {
            handler();
        }
    }

    pub fn inputs(&self) -> Vec<PortInfo> {
        self.ports.lock().inputs.clone()
    }

    pub fn outputs(&self) -> Vec<PortInfo> {
        self.ports.lock().outputs.clone()
    }

    /// Both lists taken under one lock.
    pub fn snapshot(&self) -> (Vec<PortInfo>, Vec<PortInfo>) {
        let ports = self.ports.lock();
        (ports.inputs.clone(), ports.outputs.clone())
    }

    pub fn on_ports_changed(&self, handler: Arc<ChangedHandler>) {
        self.on_ports_changed.set(handler);
    }

    pub fn on_input_added(&self, handler: Arc<PortHandler>) {
        self.on_input_added.set(handler);
    }

    pub fn on_input_removed(&self, handler: Arc<PortHandler>) {
        self.on_input_removed.set(handler);
    }

    pub fn on_output_added(&self, handler: Arc<PortHandler>) {
        self.on_output_added.set(handler);
    }

    pub fn on_output_removed(&self, handler: Arc<PortHandler>) {
        self.on_output_removed.set(handler);
    }

    pub fn on_error(&self, handler: Arc<ReportHandler>) {
        self.on_error.set(handler);
    }

    pub fn on_warning(&self, handler: Arc<ReportHandler>) {
        self.on_warning.set(handler);
    }
}

fn dedup_by_name(ports: Vec<PortInfo>) -> Vec<PortInfo> {
    let mut unique: Vec<PortInfo> = Vec::with_capacity(ports.len());
    for port in ports {
        if !unique.iter().any(|existing| existing.name == port.name) {
            unique.push(port);
        }
    }
    unique
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend_virtual::{VirtualBackend, VirtualPeer};
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn manager() -> (VirtualBackend, PortManager) {
        let backend = VirtualBackend::new();
        let ports = PortManager::new(Arc::new(backend.clone()));
        (backend, ports)
    }

    #[test]
    fn scan_replaces_cached_lists_without_callbacks() {
        let (backend, ports) = manager();
        let changes = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&changes);
        ports.on_ports_changed(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        backend.plug(VirtualPeer::new("Pad"));
        ports.scan().unwrap();
        assert_eq!(ports.inputs().len(), 1);
        assert_eq!(ports.outputs().len(), 1);

        backend.unplug("Pad");
        ports.scan().unwrap();
        assert!(ports.inputs().is_empty());
        assert_eq!(changes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn duplicate_add_fires_once() {
        let (_backend, ports) = manager();
        let added = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&added);
        ports.on_input_added(Arc::new(move |port: &PortInfo| {
            sink.lock().push(port.name.clone())
        }));

        assert!(ports.port_added(PortInfo::input("Pad In", 0)));
        assert!(!ports.port_added(PortInfo::input("Pad In", 3)));
        assert!(ports.port_added(PortInfo::output("Pad In", 0)));
        assert_eq!(added.lock().as_slice(), &["Pad In".to_owned()]);
    }

    #[test]
    fn remove_fires_direction_specific_callback() {
        let (_backend, ports) = manager();
        let removed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&removed);
        ports.on_output_removed(Arc::new(move |_: &PortInfo| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        ports.port_added(PortInfo::output("Pad Out", 0));

        assert!(ports.port_removed(&PortInfo::output("Pad Out", 0)));
        assert!(!ports.port_removed(&PortInfo::output("Pad Out", 0)));
        assert_eq!(removed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn callbacks_may_reenter_the_manager() {
        let (_backend, ports) = manager();
        let ports = Arc::new(ports);
        let seen = Arc::new(AtomicUsize::new(0));
        let weak = Arc::downgrade(&ports);
        let counter = Arc::clone(&seen);
        ports.on_ports_changed(Arc::new(move || {
            if let Some(ports) = weak.upgrade() {
                counter.store(ports.inputs().len(), Ordering::SeqCst);
            }
        }));
        ports.port_added(PortInfo::input("Pad In", 0));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn reports_are_forwarded() {
        let (_backend, ports) = manager();
        let messages = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&messages);
        ports.on_warning(Arc::new(move |report: &BackendReport| {
            sink.lock().push(report.message.clone())
        }));
        ports.report_warning(&BackendReport::new("port busy"));
        ports.report_error(&BackendReport::new("ignored without handler"));
        assert_eq!(messages.lock().as_slice(), &["port busy".to_owned()]);
    }

    #[derive(Debug, Clone)]
    enum Event {
        Add(PortDirection, u8),
        Remove(PortDirection, u8),
    }

    fn event_strategy() -> impl Strategy<Value = Event> {
        let direction = prop_oneof![Just(PortDirection::Input), Just(PortDirection::Output)];
        (direction, 0u8..4, any::<bool>()).prop_map(|(direction, id, add)| {
            if add {
                Event::Add(direction, id)
            } else {
                Event::Remove(direction, id)
            }
        })
    }

    proptest! {
        #[test]
        fn tracked_names_stay_unique(events in prop::collection::vec(event_strategy(), 1..64)) {
            let (_backend, ports) = manager();
            for event in events {
                match event {
                    Event::Add(direction, id) => {
                        ports.port_added(PortInfo::new(format!("Port {id}"), direction, id as usize));
                    }
                    Event::Remove(direction, id) => {
                        ports.port_removed(&PortInfo::new(format!("Port {id}"), direction, 0));
                    }
                }
                for list in [ports.inputs(), ports.outputs()] {
                    let mut names: Vec<_> = list.iter().map(|port| port.name.clone()).collect();
                    let total = names.len();
                    names.sort();
                    names.dedup();
                    prop_assert_eq!(names.len(), total);
                }
            }
        }
    }
}
