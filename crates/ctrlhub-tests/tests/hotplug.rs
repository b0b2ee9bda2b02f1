use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use ctrlhub_midi::{Availability, DeviceManager, PortDirection, VirtualBackend};
use ctrlhub_tests::{fast_config, launchpad, mute, Harness, LAUNCHPAD, WAIT};

#[test]
fn pairs_ports_announced_one_by_one() {
    let harness = Harness::new(fast_config()).unwrap();
    let (input, _) = harness.backend.plug(launchpad("Pad"));
    harness.manager.ports().port_added(input);
    assert!(harness.manager.get_devices().is_empty());

    let output = harness.backend.add_port("Pad Out", PortDirection::Output);
    harness.manager.ports().port_added(output);
    let devices = harness.manager.get_devices();
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].status, Availability::Available);
    assert_eq!(devices[0].display_name, LAUNCHPAD);
}

#[test]
fn unrelated_ports_do_not_pair() {
    let harness = Harness::new(fast_config()).unwrap();
    let input = harness.backend.add_port("Foo In 1", PortDirection::Input);
    let output = harness.backend.add_port("Bar Out 1", PortDirection::Output);
    harness.manager.ports().port_added(input);
    harness.manager.ports().port_added(output);
    assert!(harness.manager.get_devices().is_empty());
}

#[test]
fn unplugging_one_device_keeps_the_others() {
    let harness = Harness::new(fast_config()).unwrap();
    let left = harness.plug(launchpad("Left"));
    harness.plug(launchpad("Right"));
    let before = harness.manager.get_devices();
    assert_eq!(before.len(), 2);
    let right = before
        .iter()
        .find(|info| info.input.name == "Right In")
        .unwrap()
        .clone();

    harness.unplug("Left", &left);
    let after = harness.manager.get_devices();
    assert_eq!(after.len(), 1);
    assert_eq!(after[0].id, right.id);
    assert_eq!(after[0].display_name, right.display_name);
    // The surviving device was not re-verified.
    assert_eq!(harness.backend.sent("Right Out").len(), 1);
}

#[test]
fn removed_device_id_no_longer_resolves() {
    let harness = Harness::new(fast_config()).unwrap();
    let ports = harness.plug(launchpad("Pad"));
    let id = harness.manager.get_devices()[0].id;
    assert_eq!(
        harness.manager.with_device(id, |device| device.status()),
        Some(Availability::Available)
    );

    harness.unplug("Pad", &ports);
    assert!(harness.manager.with_device(id, |device| device.status()).is_none());

    harness.plug(launchpad("Pad"));
    let replugged = harness.manager.get_devices()[0].id;
    assert_ne!(replugged, id);
    assert!(harness.manager.with_device(id, |_| ()).is_none());
}

#[test]
fn burst_of_port_events_yields_one_notification_of_each_kind() {
    let harness = Harness::new(fast_config()).unwrap();
    let added = harness.added();
    let refreshed = harness.refreshed();

    harness.plug(launchpad("A"));
    harness.plug(launchpad("B"));
    harness.plug(launchpad("C"));

    let last_added = added.recv_timeout(WAIT).unwrap();
    assert!(last_added.display_name.starts_with(LAUNCHPAD));
    let devices = refreshed.recv_timeout(WAIT).unwrap();
    assert_eq!(devices.len(), 3);

    assert!(added.recv_timeout(Duration::from_millis(150)).is_err());
    assert!(refreshed.recv_timeout(Duration::from_millis(50)).is_err());
}

#[test]
fn removal_notification_carries_the_removed_device() {
    let harness = Harness::new(fast_config()).unwrap();
    let ports = harness.plug(launchpad("Pad"));
    let removed = harness.removed();

    harness.unplug("Pad", &ports);
    let info = removed.recv_timeout(WAIT).unwrap();
    assert_eq!(info.input.name, "Pad In");
    assert_eq!(info.display_name, LAUNCHPAD);
    assert_eq!(harness.backend.open_connections(), 0);
}

#[test]
fn devices_that_fail_verification_are_never_announced() {
    let harness = Harness::new(fast_config()).unwrap();
    let added = harness.added();
    harness.plug(mute("Mute Box"));

    let deadline = Instant::now() + WAIT;
    while harness.manager.get_devices()[0].status != Availability::TimedOut {
        assert!(Instant::now() < deadline, "device never timed out");
        thread::sleep(Duration::from_millis(10));
    }
    assert!(added.recv_timeout(Duration::from_millis(100)).is_err());
    assert!(harness.manager.get_available_devices().is_empty());
}

#[test]
fn watcher_feeds_the_manager() {
    let backend = VirtualBackend::new();
    let manager = DeviceManager::new(Arc::new(backend.clone()), fast_config()).unwrap();
    let (tx, rx) = crossbeam_channel::unbounded();
    manager.on_device_added(Arc::new(move |info: &ctrlhub_midi::DeviceInfo| {
        let _ = tx.send(info.display_name.clone());
    }));
    manager.start_hotplug().unwrap();

    backend.plug(launchpad("Pad"));
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), LAUNCHPAD);

    backend.unplug("Pad");
    let deadline = Instant::now() + WAIT;
    while !manager.get_devices().is_empty() {
        assert!(Instant::now() < deadline, "device was not removed");
        thread::sleep(Duration::from_millis(10));
    }
    manager.stop_hotplug();
}
