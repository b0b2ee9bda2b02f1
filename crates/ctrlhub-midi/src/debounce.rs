//! Delay-coalescing of bursty notifications.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};

struct State<T> {
    pending: Option<T>,
    deadline: Option<Instant>,
    shutdown: bool,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    wake: Condvar,
}

/// Collapses a burst of triggers into one callback carrying the latest value.
///
/// Each trigger restarts the quiet period. The callback runs on the
/// debouncer's own worker thread once no trigger arrived for `delay`.
/// Dropping the debouncer discards a pending value and joins the worker, so
/// no callback fires after drop returns.
pub struct Debouncer<T: Send + 'static> {
    shared: Arc<Shared<T>>,
    delay: Duration,
    worker: Option<thread::JoinHandle<()>>,
}

impl<T: Send + 'static> Debouncer<T> {
    /// Spawn a debouncer delivering to `callback` after `delay` of quiet.
    pub fn new<F>(name: &str, delay: Duration, callback: F) -> std::io::Result<Self>
    where
        F: Fn(T) + Send + 'static,
    {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                pending: None,
                deadline: None,
                shutdown: false,
            }),
            wake: Condvar::new(),
        });
        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name(format!("ctrlhub-debounce-{name}"))
            .spawn(move || run(&worker_shared, callback))?;
        Ok(Self {
            shared,
            delay,
            worker: Some(worker),
        })
    }

    /// Store `value` and restart the quiet period.
    pub fn trigger(&self, value: T) {
        let mut state = self.shared.state.lock();
        state.pending = Some(value);
        state.deadline = Some(Instant::now() + self.delay);
        self.shared.wake.notify_one();
    }

    /// Drop any pending delivery.
    pub fn cancel(&self) {
        let mut state = self.shared.state.lock();
        state.pending = None;
        state.deadline = None;
        self.shared.wake.notify_one();
    }

    pub fn is_pending(&self) -> bool {
        self.shared.state.lock().deadline.is_some()
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }
}

fn run<T, F>(shared: &Shared<T>, callback: F)
where
    F: Fn(T),
{
    let mut state = shared.state.lock();
    loop {
        if state.shutdown {
            return;
        }
        let deadline = state.deadline;
        match deadline {
            None => shared.wake.wait(&mut state),
            Some(deadline) if Instant::now() >= deadline => {
                state.deadline = None;
                if let Some(value) = state.pending.take() {
                    MutexGuard::unlocked(&mut state, || callback(value));
                }
            }
            Some(deadline) => {
                shared.wake.wait_until(&mut state, deadline);
            }
        }
    }
}

impl<T: Send + 'static> Drop for Debouncer<T> {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
            state.pending = None;
            state.deadline = None;
            self.shared.wake.notify_one();
        }
        if let Some(handle) = self.worker.take() {
            // A callback dropping its own debouncer cannot join itself.
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}
