use std::collections::{BTreeSet, HashMap};

use parking_lot::Mutex;

/// Allocates de-duplicated display names for verified devices.
///
/// Every live device sharing a canonical name holds one slot; slot 0 is shown
/// as the bare name and slot `n` as `"name (n)"`. Released slots are reused
/// lowest-first, so unplugging the first of two identical controllers lets
/// the next one reclaim the bare name.
#[derive(Debug, Default)]
pub struct NameRegistry {
    slots: Mutex<HashMap<String, BTreeSet<usize>>>,
}

/// A display name together with the slot backing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameLease {
    pub canonical: String,
    pub display: String,
    pub slot: usize,
}

impl NameRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the lowest free slot for `canonical`.
    pub fn acquire(&self, canonical: &str) -> NameLease {
        let mut slots = self.slots.lock();
        let taken = slots.entry(canonical.to_owned()).or_default();
        let slot = (0..).find(|n| !taken.contains(n)).unwrap_or(taken.len());
        taken.insert(slot);
        NameLease {
            canonical: canonical.to_owned(),
            display: display_name(canonical, slot),
            slot,
        }
    }

    /// Return a slot. Unknown names or slots are ignored.
    pub fn release(&self, lease: &NameLease) {
        let mut slots = self.slots.lock();
        if let Some(taken) = slots.get_mut(&lease.canonical) {
            taken.remove(&lease.slot);
            if taken.is_empty() {
                slots.remove(&lease.canonical);
            }
        }
    }

    /// Number of live devices holding `canonical`.
    pub fn live_count(&self, canonical: &str) -> usize {
        self.slots
            .lock()
            .get(canonical)
            .map_or(0, BTreeSet::len)
    }
}

fn display_name(canonical: &str, slot: usize) -> String {
    if slot == 0 {
        canonical.to_owned()
    } else {
        format!("{canonical} ({slot})")
    }
}
