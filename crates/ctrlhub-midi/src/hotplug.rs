use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};

use crate::transport::MidiBackend;
use crate::{BackendReport, PortDirection, PortInfo};

/// Interval between hotplug polling iterations.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Event emitted by the hotplug watcher.
#[derive(Debug, Clone)]
pub enum HotplugEvent {
    /// A port appeared since the previous poll.
    Added(PortInfo),
    /// A port disappeared since the previous poll.
    Removed(PortInfo),
    /// Enumerating the backend failed; the previous snapshot is kept.
    Failed(BackendReport),
}

/// Watcher that polls a backend and reports port arrival and removal.
///
/// Backends without native hot-plug notifications (such as midir) are
/// observed this way. The first poll reports every present port as added.
pub struct HotplugWatcher {
    stop_tx: Option<Sender<()>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl HotplugWatcher {
    /// Spawn a new watcher delivering events to `handler` on its own thread.
    pub fn spawn<F>(
        backend: Arc<dyn MidiBackend>,
        interval: Duration,
        handler: F,
    ) -> std::io::Result<Self>
    where
        F: Fn(HotplugEvent) + Send + 'static,
    {
        let (stop_tx, stop_rx) = bounded(1);
        let handle = thread::Builder::new()
            .name("ctrlhub-midi-hotplug".into())
            .spawn(move || {
                let mut inputs = Vec::new();
                let mut outputs = Vec::new();
                loop {
                    poll(&*backend, PortDirection::Input, &mut inputs, &handler);
                    poll(&*backend, PortDirection::Output, &mut outputs, &handler);
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            })?;
        Ok(Self {
            stop_tx: Some(stop_tx),
            thread: Some(handle),
        })
    }
}

fn poll<F>(
    backend: &dyn MidiBackend,
    direction: PortDirection,
    previous: &mut Vec<PortInfo>,
    handler: &F,
) where
    F: Fn(HotplugEvent),
{
    let current = match backend.enumerate(direction) {
        Ok(current) => current,
        Err(err) => {
            tracing::debug!(%err, ?direction, "midi hotplug enumerate failed");
            handler(HotplugEvent::Failed(BackendReport::new(err.to_string())));
            return;
        }
    };
    let (added, removed) = diff(previous, &current);
    for port in removed {
        handler(HotplugEvent::Removed(port));
    }
    for port in added {
        handler(HotplugEvent::Added(port));
    }
    *previous = current;
}

/// Ports of `current` missing from `previous`, and vice versa, by name.
pub fn diff(previous: &[PortInfo], current: &[PortInfo]) -> (Vec<PortInfo>, Vec<PortInfo>) {
    let added = current
        .iter()
        .filter(|port| !previous.iter().any(|old| old.name == port.name))
        .cloned()
        .collect();
    let removed = previous
        .iter()
        .filter(|old| !current.iter().any(|port| port.name == old.name))
        .cloned()
        .collect();
    (added, removed)
}

impl Drop for HotplugWatcher {
    fn drop(&mut self) {
        if let Some(stop) = self.stop_tx.take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.thread.take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend_virtual::{VirtualBackend, VirtualPeer};
    use crossbeam_channel::unbounded;

    #[test]
    fn diff_reports_changes_by_name() {
        let previous = vec![PortInfo::input("A", 0), PortInfo::input("B", 1)];
        let current = vec![PortInfo::input("B", 0), PortInfo::input("C", 1)];
        let (added, removed) = diff(&previous, &current);
        assert_eq!(added.len(), 1);
        assert_eq!(added[0].name, "C");
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].name, "A");
    }

    #[test]
    fn watcher_reports_plug_and_unplug() {
        let backend = VirtualBackend::new();
        let (tx, rx) = unbounded();
        let watcher = HotplugWatcher::spawn(
            Arc::new(backend.clone()),
            Duration::from_millis(10),
            move |event| {
                let _ = tx.send(event);
            },
        )
        .unwrap();

        backend.plug(VirtualPeer::new("Pad"));
        let mut added = Vec::new();
        while added.len() < 2 {
            match rx.recv_timeout(Duration::from_secs(2)).unwrap() {
                HotplugEvent::Added(port) => added.push(port.direction),
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert!(added.contains(&PortDirection::Input));
        assert!(added.contains(&PortDirection::Output));

        backend.unplug("Pad");
        let mut removed = 0;
        while removed < 2 {
            if let HotplugEvent::Removed(_) = rx.recv_timeout(Duration::from_secs(2)).unwrap() {
                removed += 1;
            }
        }
        drop(watcher);
    }
}
