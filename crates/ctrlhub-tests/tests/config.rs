use std::fs;

use anyhow::Result;
use ctrlhub_midi::{Availability, ManagerConfig, VirtualPeer};
use ctrlhub_tests::{Harness, LAUNCHPAD};

#[test]
fn manager_runs_from_a_config_file() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("midi.json");
    fs::write(
        &path,
        r#"{
            "verify_delay_ms": 0,
            "debounce_ms": 10,
            "known_devices": {
                "Acme Grid": { "manufacturer_id": [0, 33, 9], "device_code": [1] }
            }
        }"#,
    )?;

    let config = ManagerConfig::try_load(&path)?;
    let harness = Harness::new(config)?;
    harness.plug(VirtualPeer::new("Grid").with_identity(&[0x00, 0x21, 0x09, 0x01]));
    harness.plug(ctrlhub_tests::launchpad("Pad"));

    let devices = harness.manager.get_devices();
    assert_eq!(devices.len(), 2);
    assert!(devices
        .iter()
        .all(|info| info.status == Availability::Available));
    assert_eq!(harness.display_names(), vec!["Acme Grid".to_owned(), LAUNCHPAD.to_owned()]);
    Ok(())
}

#[test]
fn saved_config_loads_back() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("ctrlhub").join("midi.json");
    let config = ManagerConfig {
        hotplug_poll_ms: 250,
        ..ManagerConfig::default()
    };
    config.save_to(&path)?;
    pretty_assertions::assert_eq!(ManagerConfig::try_load(&path)?, config);
    Ok(())
}
