use std::sync::Arc;

use crate::callback::CallbackSlot;

/// Handler receiving verified messages of a device.
pub type MessageHandler = dyn Fn(&[u8]) + Send + Sync;

/// Forwards every message it is given to the registered handler.
///
/// Gating on availability and message size happens in the device.
#[derive(Debug, Default)]
pub struct Dispatcher {
    handler: CallbackSlot<MessageHandler>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_message(&self, handler: Arc<MessageHandler>) {
        self.handler.set(handler);
    }

    pub fn dispatch(&self, bytes: &[u8]) {
        if let Some(handler) = self.handler.get() {
            handler(bytes);
        }
    }
}
