//! Fixtures shared by the end-to-end tests.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver};
use ctrlhub_midi::backend_virtual::LAUNCHPAD_PRO_IDENTITY;
use ctrlhub_midi::{
    DeviceInfo, DeviceManager, ManagerConfig, PortInfo, Result, VirtualBackend, VirtualPeer,
};

/// How long a test waits for an asynchronous notification.
pub const WAIT: Duration = Duration::from_secs(2);

pub const LAUNCHPAD: &str = "Novation Launchpad Pro";

/// Short timings so debounced notifications and timeouts settle quickly.
pub fn fast_config() -> ManagerConfig {
    ManagerConfig {
        verify_timeout_ms: 200,
        verify_delay_ms: 0,
        debounce_ms: 30,
        hotplug_poll_ms: 10,
        strip_trailing_digit: false,
        ..ManagerConfig::default()
    }
}

pub fn launchpad(name: &str) -> VirtualPeer {
    VirtualPeer::new(name).with_identity(&LAUNCHPAD_PRO_IDENTITY)
}

/// A peer answering with an identity nobody knows.
pub fn stranger(name: &str) -> VirtualPeer {
    VirtualPeer::new(name).with_identity(&[0x00, 0x21, 0x09, 0x01, 0x00])
}

/// A peer that never answers the identity request.
pub fn mute(name: &str) -> VirtualPeer {
    VirtualPeer::new(name)
}

/// A manager over a virtual backend whose hot-plug notifications are
/// delivered by hand.
pub struct Harness {
    pub backend: VirtualBackend,
    pub manager: DeviceManager,
}

impl Harness {
    pub fn new(config: ManagerConfig) -> Result<Self> {
        let backend = VirtualBackend::new();
        let manager = DeviceManager::new(Arc::new(backend.clone()), config)?;
        Ok(Self { backend, manager })
    }

    /// Plug `peer` and announce both of its ports.
    pub fn plug(&self, peer: VirtualPeer) -> (PortInfo, PortInfo) {
        let (input, output) = self.backend.plug(peer);
        self.manager.ports().port_added(input.clone());
        self.manager.ports().port_added(output.clone());
        (input, output)
    }

    /// Unplug the peer called `name` and announce the removal of its ports.
    pub fn unplug(&self, name: &str, ports: &(PortInfo, PortInfo)) {
        self.backend.unplug(name);
        self.manager.ports().port_removed(&ports.0);
        self.manager.ports().port_removed(&ports.1);
    }

    pub fn added(&self) -> Receiver<DeviceInfo> {
        let (tx, rx) = unbounded();
        self.manager.on_device_added(Arc::new(move |info: &DeviceInfo| {
            let _ = tx.send(info.clone());
        }));
        rx
    }

    pub fn removed(&self) -> Receiver<DeviceInfo> {
        let (tx, rx) = unbounded();
        self.manager.on_device_removed(Arc::new(move |info: &DeviceInfo| {
            let _ = tx.send(info.clone());
        }));
        rx
    }

    pub fn refreshed(&self) -> Receiver<Vec<DeviceInfo>> {
        let (tx, rx) = unbounded();
        self.manager
            .on_devices_refresh(Arc::new(move |devices: &[DeviceInfo]| {
                let _ = tx.send(devices.to_vec());
            }));
        rx
    }

    pub fn display_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self
            .manager
            .get_available_devices()
            .into_iter()
            .map(|info| info.display_name)
            .collect();
        names.sort();
        names
    }
}
