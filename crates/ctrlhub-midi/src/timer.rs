//! Delayed execution on a single background thread.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};

type Job = Box<dyn FnOnce() + Send>;

struct Entry {
    when: Instant,
    seq: u64,
    job: Job,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.when == other.when && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // Reversed so the max-heap pops the earliest deadline first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .when
            .cmp(&self.when)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct Queue {
    entries: BinaryHeap<Entry>,
    next_seq: u64,
    shutdown: bool,
}

struct Shared {
    queue: Mutex<Queue>,
    wake: Condvar,
}

/// Runs scheduled jobs at their deadline.
///
/// Used to delay identity requests after a device is opened (some
/// controllers ignore SysEx for a moment after enumeration) and to sweep
/// verification timeouts for devices that go silent.
pub struct TimerQueue {
    shared: Arc<Shared>,
    worker: Option<thread::JoinHandle<()>>,
}

impl TimerQueue {
    pub fn new() -> std::io::Result<Self> {
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue::default()),
            wake: Condvar::new(),
        });
        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name("ctrlhub-timer".into())
            .spawn(move || run(&worker_shared))?;
        Ok(Self {
            shared,
            worker: Some(worker),
        })
    }

    /// Schedule `job` to run at `when`. Jobs with equal deadlines run in
    /// scheduling order.
    pub fn schedule_at<F>(&self, when: Instant, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut queue = self.shared.queue.lock();
        let seq = queue.next_seq;
        queue.next_seq += 1;
        queue.entries.push(Entry {
            when,
            seq,
            job: Box::new(job),
        });
        self.shared.wake.notify_one();
    }

    pub fn schedule_after<F>(&self, delay: Duration, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule_at(Instant::now() + delay, job);
    }

    /// Number of jobs not yet executed.
    pub fn pending(&self) -> usize {
        self.shared.queue.lock().entries.len()
    }
}

fn run(shared: &Shared) {
    let mut queue = shared.queue.lock();
    loop {
        if queue.shutdown {
            return;
        }
        let next = queue.entries.peek().map(|entry| entry.when);
        match next {
            None => shared.wake.wait(&mut queue),
            Some(when) if Instant::now() >= when => {
                if let Some(entry) = queue.entries.pop() {
                    MutexGuard::unlocked(&mut queue, entry.job);
                }
            }
            Some(when) => {
                shared.wake.wait_until(&mut queue, when);
            }
        }
    }
}

impl Drop for TimerQueue {
    fn drop(&mut self) {
        {
            let mut queue = self.shared.queue.lock();
            queue.shutdown = true;
            queue.entries.clear();
            self.shared.wake.notify_one();
        }
        if let Some(handle) = self.worker.take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}
