//! Single-subscriber callback slots.
//!
//! Each event kind holds at most one subscriber; registering a new one
//! replaces the previous. Invocation clones the handler out of the slot so
//! it always runs without the slot lock held, which lets a handler call back
//! into the component that fired it.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

pub struct CallbackSlot<F: ?Sized> {
    handler: RwLock<Option<Arc<F>>>,
}

impl<F: ?Sized> CallbackSlot<F> {
    pub fn new() -> Self {
        Self {
            handler: RwLock::new(None),
        }
    }

    /// Replaces the registered handler.
    pub fn set(&self, handler: Arc<F>) {
        *self.handler.write() = Some(handler);
    }

    pub fn clear(&self) {
        self.handler.write().take();
    }

    /// Returns the current handler, if any.
    pub fn get(&self) -> Option<Arc<F>> {
        self.handler.read().clone()
    }

    pub fn is_set(&self) -> bool {
        self.handler.read().is_some()
    }
}

impl<F: ?Sized> Default for CallbackSlot<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: ?Sized> fmt::Debug for CallbackSlot<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackSlot")
            .field("set", &self.is_set())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn set_replaces_previous_handler() {
        let slot: CallbackSlot<dyn Fn(u32) + Send + Sync> = CallbackSlot::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&first);
        slot.set(Arc::new(move |v: u32| {
            counter.fetch_add(v as usize, Ordering::SeqCst);
        }));
        let counter = Arc::clone(&second);
        slot.set(Arc::new(move |v: u32| {
            counter.fetch_add(v as usize, Ordering::SeqCst);
        }));

        if let Some(handler) = slot.get() {
            handler(3);
        }
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 3);

        slot.clear();
        assert!(slot.get().is_none());
    }
}
