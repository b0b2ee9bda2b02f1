use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use parking_lot::Mutex;

use crate::{MessageRecord, MidiTimestamp};

#[derive(Debug)]
struct Log {
    origin: Instant,
    records: Vec<MessageRecord>,
}

/// Captures timestamped messages for one device.
///
/// `add` does not look at the recording flag; the owning device checks
/// [`Recorder::is_recording`] before calling it. Stopping keeps the buffer;
/// only [`Recorder::clear`] empties it.
#[derive(Debug)]
pub struct Recorder {
    recording: AtomicBool,
    log: Mutex<Log>,
}

impl Recorder {
    pub fn new() -> Self {
        Self {
            recording: AtomicBool::new(false),
            log: Mutex::new(Log {
                origin: Instant::now(),
                records: Vec::new(),
            }),
        }
    }

    /// Start recording; timestamps are measured from this call.
    pub fn start(&self) {
        self.log.lock().origin = Instant::now();
        self.recording.store(true, Ordering::Release);
    }

    pub fn stop(&self) {
        self.recording.store(false, Ordering::Release);
    }

    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::Acquire)
    }

    /// Append a message stamped relative to the last `start`.
    pub fn add(&self, bytes: &[u8]) {
        let mut log = self.log.lock();
        let elapsed = log.origin.elapsed().as_millis() as MidiTimestamp;
        log.records.push(MessageRecord::new(bytes, elapsed));
    }

    pub fn clear(&self) {
        self.log.lock().records.clear();
    }

    /// Snapshot of everything recorded so far.
    pub fn recorded(&self) -> Vec<MessageRecord> {
        self.log.lock().records.clone()
    }

    pub fn len(&self) -> usize {
        self.log.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.log.lock().records.is_empty()
    }
}

impl Default for Recorder {
    fn default() -> Self {
        Self::new()
    }
}
