//! Table of controllers recognised by the identity handshake.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Manufacturer id and device code a controller reports in its identity reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownDeviceIdentity {
    pub manufacturer_id: Vec<u8>,
    pub device_code: Vec<u8>,
}

impl KnownDeviceIdentity {
    pub fn new(manufacturer_id: &[u8], device_code: &[u8]) -> Self {
        Self {
            manufacturer_id: manufacturer_id.to_vec(),
            device_code: device_code.to_vec(),
        }
    }

    /// Whether `payload` starts with the manufacturer id immediately
    /// followed by the device code.
    pub fn matches(&self, payload: &[u8]) -> bool {
        payload
            .strip_prefix(self.manufacturer_id.as_slice())
            .is_some_and(|rest| rest.starts_with(&self.device_code))
    }

    /// Length of the shortest payload this identity can match.
    pub fn min_payload_len(&self) -> usize {
        self.manufacturer_id.len() + self.device_code.len()
    }
}

/// Canonical device name to identity, read-only once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KnownDevices {
    entries: BTreeMap<String, KnownDeviceIdentity>,
}

impl KnownDevices {
    pub fn empty() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Controllers shipped with the library.
    pub fn builtin() -> Self {
        let mut known = Self::empty();
        known.insert(
            "Novation Launchpad Pro",
            KnownDeviceIdentity::new(&[0x00, 0x20, 0x29], &[0x51]),
        );
        known
    }

    pub fn insert(&mut self, name: impl Into<String>, identity: KnownDeviceIdentity) {
        self.entries.insert(name.into(), identity);
    }

    /// Add or override entries from `other`.
    pub fn extend(&mut self, other: &KnownDevices) {
        for (name, identity) in &other.entries {
            self.entries.insert(name.clone(), identity.clone());
        }
    }

    /// First entry, in name order, whose identity prefixes `payload`.
    ///
    /// Overlapping identities resolve to whichever name sorts first.
    pub fn match_payload(&self, payload: &[u8]) -> Option<(&str, &KnownDeviceIdentity)> {
        self.entries
            .iter()
            .find(|(_, identity)| identity.matches(payload))
            .map(|(name, identity)| (name.as_str(), identity))
    }

    /// Shortest payload that any entry could match.
    pub fn min_payload_len(&self) -> usize {
        self.entries
            .values()
            .map(KnownDeviceIdentity::min_payload_len)
            .min()
            .unwrap_or(0)
    }

    pub fn get(&self, name: &str) -> Option<&KnownDeviceIdentity> {
        self.entries.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &KnownDeviceIdentity)> {
        self.entries.iter().map(|(name, id)| (name.as_str(), id))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for KnownDevices {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_manufacturer_then_device_code() {
        let known = KnownDevices::builtin();
        let payload = [0x00, 0x20, 0x29, 0x51, 0x00, 0x00, 0x01];
        let (name, _) = known.match_payload(&payload).unwrap();
        assert_eq!(name, "Novation Launchpad Pro");
    }

    #[test]
    fn rejects_wrong_device_code_or_short_payload() {
        let known = KnownDevices::builtin();
        assert!(known.match_payload(&[0x00, 0x20, 0x29, 0x52]).is_none());
        assert!(known.match_payload(&[0x00, 0x20, 0x29]).is_none());
        assert!(known.match_payload(&[]).is_none());
        assert_eq!(known.min_payload_len(), 4);
    }

    #[test]
    fn extend_overrides_existing_entries() {
        let mut known = KnownDevices::builtin();
        let mut extra = KnownDevices::empty();
        extra.insert(
            "Novation Launchpad Pro",
            KnownDeviceIdentity::new(&[0x00, 0x20, 0x29], &[0x23]),
        );
        extra.insert("Arturia KeyStep", KnownDeviceIdentity::new(&[0x00, 0x20, 0x6B], &[0x02]));
        known.extend(&extra);
        assert_eq!(known.len(), 2);
        assert!(known.match_payload(&[0x00, 0x20, 0x29, 0x51]).is_none());
        assert!(known.match_payload(&[0x00, 0x20, 0x29, 0x23]).is_some());
    }
}
