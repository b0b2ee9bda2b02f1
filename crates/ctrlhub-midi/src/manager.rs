//! Hot-plug pairing engine and owner of the device table.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::callback::CallbackSlot;
use crate::config::ManagerConfig;
use crate::debounce::Debouncer;
use crate::device::{Device, DeviceContext, ReportHandler};
use crate::hotplug::{HotplugEvent, HotplugWatcher};
use crate::names::NameRegistry;
use crate::ports::PortManager;
use crate::timer::TimerQueue;
use crate::transport::MidiBackend;
use crate::{Availability, BackendReport, MessageRecord, PortInfo, Result};

/// Generation-checked key of a device in the manager's table.
///
/// Ids of torn-down devices never resolve again, even when their slot is
/// reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId {
    index: u32,
    generation: u32,
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

/// Snapshot of a device, valid until the next refresh tears it down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub id: DeviceId,
    pub input: PortInfo,
    pub output: PortInfo,
    pub status: Availability,
    pub name: String,
    pub display_name: String,
    pub identity: Vec<u8>,
    pub recording: bool,
}

pub type DeviceMessageHandler = dyn Fn(DeviceId, &[u8]) + Send + Sync;
pub type DeviceHandler = dyn Fn(&DeviceInfo) + Send + Sync;
pub type RefreshHandler = dyn Fn(&[DeviceInfo]) + Send + Sync;

struct Entry {
    device: Arc<Device>,
    input: PortInfo,
    output: PortInfo,
}

impl Entry {
    fn info(&self, id: DeviceId) -> DeviceInfo {
        DeviceInfo {
            id,
            input: self.input.clone(),
            output: self.output.clone(),
            status: self.device.status(),
            name: self.device.name(),
            display_name: self.device.display_name(),
            identity: self.device.identity(),
            recording: self.device.is_recording(),
        }
    }
}

#[derive(Default)]
struct Slot {
    generation: u32,
    entry: Option<Entry>,
}

#[derive(Default)]
struct DeviceTable {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl DeviceTable {
    fn insert(&mut self, entry: Entry) -> DeviceId {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot::default());
                (self.slots.len() - 1) as u32
            }
        };
        let slot = &mut self.slots[index as usize];
        slot.entry = Some(entry);
        DeviceId {
            index,
            generation: slot.generation,
        }
    }

    fn remove(&mut self, id: DeviceId) -> Option<Entry> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let entry = slot.entry.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        Some(entry)
    }

    fn get(&self, id: DeviceId) -> Option<&Entry> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.entry.as_ref()
    }

    fn iter(&self) -> impl Iterator<Item = (DeviceId, &Entry)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.entry.as_ref().map(|entry| {
                (
                    DeviceId {
                        index: index as u32,
                        generation: slot.generation,
                    },
                    entry,
                )
            })
        })
    }

    fn contains_pair(&self, input: &str, output: &str) -> bool {
        self.iter()
            .any(|(_, entry)| entry.input.name == input && entry.output.name == output)
    }

    fn drain(&mut self) -> Vec<(DeviceId, Entry)> {
        let ids: Vec<_> = self.iter().map(|(id, _)| id).collect();
        ids.into_iter()
            .filter_map(|id| self.remove(id).map(|entry| (id, entry)))
            .collect()
    }
}

#[derive(Default)]
struct Callbacks {
    midi_message: CallbackSlot<DeviceMessageHandler>,
    devices_refresh: CallbackSlot<RefreshHandler>,
    device_added: CallbackSlot<DeviceHandler>,
    device_removed: CallbackSlot<DeviceHandler>,
    error: CallbackSlot<ReportHandler>,
    warning: CallbackSlot<ReportHandler>,
}

impl Callbacks {
    fn error(&self, report: &BackendReport) {
        if let Some(handler) = self.error.get() {
            handler(report);
        }
    }

    fn warning(&self, report: &BackendReport) {
        if let Some(handler) = self.warning.get() {
            handler(report);
        }
    }
}

struct ManagerInner {
    config: ManagerConfig,
    ports: PortManager,
    devices: Mutex<DeviceTable>,
    context: DeviceContext,
    recording: Mutex<bool>,
    callbacks: Arc<Callbacks>,
    added: Debouncer<DeviceInfo>,
    removed: Debouncer<DeviceInfo>,
    refreshed: Debouncer<Vec<DeviceInfo>>,
}

/// Pairs ports into devices and keeps the device table in sync with the
/// hardware.
///
/// Every ports-changed event re-pairs the current port lists: devices whose
/// exact (input, output) pair disappeared are torn down, devices whose pair
/// survived are kept untouched, and new pairs get a fresh device that starts
/// identity verification. Added, removed and refreshed notifications are
/// debounced so a hub enumerating many ports at once produces one
/// notification of each kind carrying the latest snapshot.
pub struct DeviceManager {
    inner: Arc<ManagerInner>,
    hotplug: Mutex<Option<HotplugWatcher>>,
}

impl DeviceManager {
    pub fn new(backend: Arc<dyn MidiBackend>, config: ManagerConfig) -> Result<Self> {
        let callbacks = Arc::new(Callbacks::default());
        let timer = Arc::new(TimerQueue::new()?);
        let context = DeviceContext::new(
            Arc::new(config.known_devices()),
            Arc::new(NameRegistry::new()),
        )
        .with_timeout(config.verify_timeout())
        .with_timer(timer, config.verify_delay());

        let debounce = config.debounce();
        let cb = Arc::clone(&callbacks);
        let added = Debouncer::new("added", debounce, move |info: DeviceInfo| {
            if let Some(handler) = cb.device_added.get() {
                handler(&info);
            }
        })?;
        let cb = Arc::clone(&callbacks);
        let removed = Debouncer::new("removed", debounce, move |info: DeviceInfo| {
            if let Some(handler) = cb.device_removed.get() {
                handler(&info);
            }
        })?;
        let cb = Arc::clone(&callbacks);
        let refreshed = Debouncer::new("refreshed", debounce, move |devices: Vec<DeviceInfo>| {
            if let Some(handler) = cb.devices_refresh.get() {
                handler(&devices);
            }
        })?;

        let inner = Arc::new(ManagerInner {
            config,
            ports: PortManager::new(backend),
            devices: Mutex::new(DeviceTable::default()),
            context,
            recording: Mutex::new(false),
            callbacks,
            added,
            removed,
            refreshed,
        });

        let weak = Arc::downgrade(&inner);
        inner.ports.on_ports_changed(Arc::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.sync_devices();
            }
        }));
        let cb = Arc::clone(&inner.callbacks);
        inner
            .ports
            .on_error(Arc::new(move |report: &BackendReport| cb.error(report)));
        let cb = Arc::clone(&inner.callbacks);
        inner
            .ports
            .on_warning(Arc::new(move |report: &BackendReport| cb.warning(report)));

        Ok(Self {
            inner,
            hotplug: Mutex::new(None),
        })
    }

    /// Re-scan the backend and re-pair devices.
    pub fn refresh(&self) -> Result<()> {
        self.inner.ports.scan()?;
        self.inner.sync_devices();
        Ok(())
    }

    /// Start polling the backend for hot-plug changes at the configured
    /// interval.
    pub fn start_hotplug(&self) -> Result<()> {
        self.attach_hotplug(self.inner.config.hotplug_poll())
    }

    /// Feed port changes observed every `interval` into the port manager.
    /// Replaces a running watcher.
    pub fn attach_hotplug(&self, interval: Duration) -> Result<()> {
        let weak = Arc::downgrade(&self.inner);
        let watcher = HotplugWatcher::spawn(
            Arc::clone(self.inner.ports.backend()),
            interval,
            move |event| {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                match event {
                    HotplugEvent::Added(port) => {
                        inner.ports.port_added(port);
                    }
                    HotplugEvent::Removed(port) => {
                        inner.ports.port_removed(&port);
                    }
                    HotplugEvent::Failed(report) => inner.ports.report_warning(&report),
                }
            },
        )?;
        let previous = self.hotplug.lock().replace(watcher);
        drop(previous);
        Ok(())
    }

    pub fn stop_hotplug(&self) {
        let watcher = self.hotplug.lock().take();
        drop(watcher);
    }

    /// Start recording on every available device. Devices verified later
    /// start recording as soon as they become available.
    pub fn start_recording(&self) {
        let mut recording = self.inner.recording.lock();
        *recording = true;
        for device in self.inner.devices_with(Availability::Available) {
            device.start_recording();
        }
    }

    pub fn stop_recording(&self) {
        let mut recording = self.inner.recording.lock();
        *recording = false;
        for device in self.inner.devices_with(Availability::Available) {
            device.stop_recording();
        }
    }

    pub fn is_recording(&self) -> bool {
        *self.inner.recording.lock()
    }

    /// Recorded messages per available device, skipping empty logs.
    pub fn recorded(&self) -> Vec<(String, Vec<MessageRecord>)> {
        let devices: Vec<_> = {
            let table = self.inner.devices.lock();
            table
                .iter()
                .map(|(_, entry)| Arc::clone(&entry.device))
                .collect()
        };
        devices
            .into_iter()
            .filter(|device| device.status() == Availability::Available)
            .filter_map(|device| {
                let records = device.recorded();
                (!records.is_empty()).then(|| (device.display_name(), records))
            })
            .collect()
    }

    pub fn clear_recordings(&self) {
        for device in self.inner.devices_with(Availability::Available) {
            device.clear_recording();
        }
    }

    /// Every tracked device, including ones that failed verification.
    pub fn get_devices(&self) -> Vec<DeviceInfo> {
        self.inner.snapshot()
    }

    pub fn get_available_devices(&self) -> Vec<DeviceInfo> {
        self.inner
            .snapshot()
            .into_iter()
            .filter(|info| info.status == Availability::Available)
            .collect()
    }

    /// Run `f` against a live device. Returns `None` once the device has been
    /// torn down. `f` runs without the table lock held.
    pub fn with_device<R>(&self, id: DeviceId, f: impl FnOnce(&Device) -> R) -> Option<R> {
        let device = self
            .inner
            .devices
            .lock()
            .get(id)
            .map(|entry| Arc::clone(&entry.device))?;
        Some(f(&device))
    }

    pub fn ports(&self) -> &PortManager {
        &self.inner.ports
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    /// Handler for channel messages of available devices.
    pub fn on_midi_message(&self, handler: Arc<DeviceMessageHandler>) {
        self.inner.callbacks.midi_message.set(handler);
    }

    pub fn on_devices_refresh(&self, handler: Arc<RefreshHandler>) {
        self.inner.callbacks.devices_refresh.set(handler);
    }

    /// Handler for devices that passed identity verification.
    pub fn on_device_added(&self, handler: Arc<DeviceHandler>) {
        self.inner.callbacks.device_added.set(handler);
    }

    pub fn on_device_removed(&self, handler: Arc<DeviceHandler>) {
        self.inner.callbacks.device_removed.set(handler);
    }

    pub fn on_error(&self, handler: Arc<ReportHandler>) {
        self.inner.callbacks.error.set(handler);
    }

    pub fn on_warning(&self, handler: Arc<ReportHandler>) {
        self.inner.callbacks.warning.set(handler);
    }
}

impl Drop for DeviceManager {
    fn drop(&mut self) {
        self.stop_hotplug();
        // Close transports while the manager is still alive so no backend
        // thread ends up releasing the last reference to it.
        let entries = self.inner.devices.lock().drain();
        drop(entries);
    }
}

impl ManagerInner {
    fn sync_devices(self: &Arc<Self>) {
        let (stale, fresh) = {
            let mut table = self.devices.lock();
            // Snapshot under the table lock: a sync holding an older port list
            // must never diff after one holding a newer list.
            let (inputs, outputs) = self.ports.snapshot();
            let pairs = pair_ports(&inputs, &outputs, self.config.strip_trailing_digit);
            let stale_ids: Vec<DeviceId> = table
                .iter()
                .filter(|(_, entry)| {
                    !pairs.iter().any(|(input, output)| {
                        input.name == entry.input.name && output.name == entry.output.name
                    })
                })
                .map(|(id, _)| id)
                .collect();
            let stale: Vec<(DeviceId, Entry)> = stale_ids
                .into_iter()
                .filter_map(|id| table.remove(id).map(|entry| (id, entry)))
                .collect();

            let mut fresh = Vec::new();
            for (input, output) in pairs {
                if table.contains_pair(&input.name, &output.name) {
                    continue;
                }
                let device = Arc::new(Device::new(
                    self.ports.backend().transport(),
                    &self.context,
                ));
                let id = table.insert(Entry {
                    device: Arc::clone(&device),
                    input: input.clone(),
                    output: output.clone(),
                });
                self.wire(id, &device);
                fresh.push((id, device, input, output));
            }
            (stale, fresh)
        };

        for (id, entry) in stale {
            let info = entry.info(id);
            entry.device.close();
            drop(entry);
            info!(device = %id, name = %info.display_name, "device removed");
            self.removed.trigger(info);
        }

        for (id, device, input, output) in fresh {
            info!(device = %id, input = %input.name, output = %output.name, "device created");
            if let Err(err) = device.open(input, output) {
                warn!(device = %id, %err, "failed to open device");
                let entry = self.devices.lock().remove(id);
                drop(entry);
                self.callbacks
                    .error(&BackendReport::new(format!("failed to open device: {err}")));
            }
        }

        self.refreshed.trigger(self.snapshot());
    }

    fn wire(self: &Arc<Self>, id: DeviceId, device: &Device) {
        let callbacks = Arc::clone(&self.callbacks);
        device.on_message(Arc::new(move |bytes: &[u8]| {
            if let Some(handler) = callbacks.midi_message.get() {
                handler(id, bytes);
            }
        }));

        let weak = Arc::downgrade(self);
        device.on_verified(Arc::new(move |_: &[u8], status: Availability| {
            if let Some(inner) = weak.upgrade() {
                inner.device_verified(id, status);
            }
        }));

        let callbacks = Arc::clone(&self.callbacks);
        device.on_error(Arc::new(move |report: &BackendReport| callbacks.error(report)));
        let callbacks = Arc::clone(&self.callbacks);
        device.on_warning(Arc::new(move |report: &BackendReport| {
            callbacks.warning(report)
        }));
    }

    fn device_verified(&self, id: DeviceId, status: Availability) {
        debug!(device = %id, %status, "device verification finished");
        if status != Availability::Available {
            return;
        }
        let Some(device) = self
            .devices
            .lock()
            .get(id)
            .map(|entry| Arc::clone(&entry.device))
        else {
            return;
        };
        {
            // Held across the start so stop_recording cannot interleave.
            let recording = self.recording.lock();
            if *recording {
                device.start_recording();
            }
        }
        let Some(info) = self.devices.lock().get(id).map(|entry| entry.info(id)) else {
            return;
        };
        self.added.trigger(info);
    }

    fn devices_with(&self, status: Availability) -> Vec<Arc<Device>> {
        let devices: Vec<_> = {
            let table = self.devices.lock();
            table
                .iter()
                .map(|(_, entry)| Arc::clone(&entry.device))
                .collect()
        };
        devices
            .into_iter()
            .filter(|device| device.status() == status)
            .collect()
    }

    fn snapshot(&self) -> Vec<DeviceInfo> {
        let table = self.devices.lock();
        table.iter().map(|(id, entry)| entry.info(id)).collect()
    }
}

/// Comparison key for pairing: upper-cased, with one `token` removed and,
/// optionally, one trailing digit stripped.
///
/// The last whole-word `token` is removed, so `"Launchpad Mini In"` keeps its
/// `MINI`. Names that only carry the token inside a word, such as
/// `"MIDIIN2 (Pad)"`, lose the first occurrence instead.
pub fn pair_key(name: &str, token: &str, strip_trailing_digit: bool) -> String {
    let mut key = name.to_uppercase();
    if let Some(at) = token_position(&key, token) {
        key.replace_range(at..at + token.len(), "");
    }
    if strip_trailing_digit && key.ends_with(|c: char| c.is_ascii_digit()) {
        key.pop();
    }
    key
}

fn token_position(key: &str, token: &str) -> Option<usize> {
    let alnum = |c: Option<char>| c.is_some_and(char::is_alphanumeric);
    key.rmatch_indices(token)
        .map(|(at, _)| at)
        .find(|&at| {
            !alnum(key[..at].chars().next_back()) && !alnum(key[at + token.len()..].chars().next())
        })
        .or_else(|| key.find(token))
}

/// Pair every input with every output whose name differs only by the
/// `IN`/`OUT` token.
///
/// This is a heuristic over vendor-assigned names, not a hardware
/// identifier.
pub fn pair_ports(
    inputs: &[PortInfo],
    outputs: &[PortInfo],
    strip_trailing_digit: bool,
) -> Vec<(PortInfo, PortInfo)> {
    let mut pairs = Vec::new();
    for input in inputs {
        let key = pair_key(&input.name, "IN", strip_trailing_digit);
        for output in outputs {
            if pair_key(&output.name, "OUT", strip_trailing_digit) == key {
                pairs.push((input.clone(), output.clone()));
            }
        }
    }
    pairs
}
