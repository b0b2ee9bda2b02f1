use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::known::KnownDevices;

/// Tunables of the device manager, persisted as JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// How long a device may take to answer the identity request.
    pub verify_timeout_ms: u64,
    /// Delay between opening a device and sending the identity request.
    pub verify_delay_ms: u64,
    /// Quiet period of added, removed and refreshed notifications.
    pub debounce_ms: u64,
    /// Poll interval of the hot-plug watcher.
    pub hotplug_poll_ms: u64,
    /// Ignore a trailing digit when pairing port names.
    pub strip_trailing_digit: bool,
    /// Extra identities, merged over the built-in table.
    pub known_devices: KnownDevices,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            verify_timeout_ms: 2000,
            verify_delay_ms: 250,
            debounce_ms: 100,
            hotplug_poll_ms: 1000,
            strip_trailing_digit: cfg!(windows),
            known_devices: KnownDevices::empty(),
        }
    }
}

impl ManagerConfig {
    pub fn verify_timeout(&self) -> Duration {
        Duration::from_millis(self.verify_timeout_ms)
    }

    pub fn verify_delay(&self) -> Duration {
        Duration::from_millis(self.verify_delay_ms)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn hotplug_poll(&self) -> Duration {
        Duration::from_millis(self.hotplug_poll_ms)
    }

    /// Built-in identities with the configured ones layered on top.
    pub fn known_devices(&self) -> KnownDevices {
        let mut known = KnownDevices::builtin();
        known.extend(&self.known_devices);
        known
    }

    /// Load the configuration from `path`.
    pub fn try_load(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config = serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(config)
    }

    /// Load the configuration from the user config directory. Returns
    /// defaults if loading fails.
    pub fn load() -> Self {
        let Some(path) = settings_path() else {
            return Self::default();
        };
        if !path.exists() {
            return Self::default();
        }
        match Self::try_load(&path) {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!(?err, "failed to load midi config, using defaults");
                Self::default()
            }
        }
    }

    /// Write the configuration to `path` as pretty JSON.
    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).with_context(|| format!("failed to write {}", path.display()))
    }

    /// Save to the user config directory.
    pub fn save(&self) {
        let Some(path) = settings_path() else {
            return;
        };
        if let Err(err) = self.save_to(&path) {
            tracing::warn!(?err, "failed to write midi config");
        }
    }
}

/// `<config dir>/ctrlhub/midi.json`, if the platform has a config dir.
pub fn settings_path() -> Option<PathBuf> {
    let mut base = dirs::config_dir()?;
    base.push("ctrlhub");
    base.push("midi.json");
    Some(base)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::known::KnownDeviceIdentity;
    use pretty_assertions::assert_eq;

    #[test]
    fn round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("midi.json");
        let mut config = ManagerConfig {
            verify_timeout_ms: 500,
            strip_trailing_digit: true,
            ..ManagerConfig::default()
        };
        config
            .known_devices
            .insert("Acme Pad", KnownDeviceIdentity::new(&[0x7D], &[0x01, 0x02]));

        config.save_to(&path).unwrap();
        let loaded = ManagerConfig::try_load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn missing_fields_take_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("midi.json");
        fs::write(&path, r#"{ "debounce_ms": 5 }"#).unwrap();

        let loaded = ManagerConfig::try_load(&path).unwrap();
        assert_eq!(loaded.debounce(), Duration::from_millis(5));
        assert_eq!(loaded.verify_timeout(), Duration::from_secs(2));
        assert_eq!(loaded.verify_delay(), Duration::from_millis(250));
        assert_eq!(loaded.hotplug_poll(), Duration::from_secs(1));
    }

    #[test]
    fn invalid_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("midi.json");
        fs::write(&path, "not json").unwrap();
        let err = ManagerConfig::try_load(&path).unwrap_err();
        assert!(err.to_string().contains("failed to parse"));
        assert!(ManagerConfig::try_load(&dir.path().join("absent.json")).is_err());
    }

    #[test]
    fn configured_identities_extend_builtin_table() {
        let mut config = ManagerConfig::default();
        config
            .known_devices
            .insert("Acme Pad", KnownDeviceIdentity::new(&[0x7D], &[0x01]));
        let known = config.known_devices();
        assert_eq!(known.len(), 2);
        assert!(known.get("Novation Launchpad Pro").is_some());
        assert!(known.match_payload(&[0x7D, 0x01, 0x00]).is_some());
    }
}
