use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

/// A characteristic value pushed by a peripheral.
#[derive(Debug, Clone)]
pub struct NotificationEvent {
    pub address: String,
    pub handle: u16,
    pub value: Vec<u8>,
    /// Monotonic arrival timestamp, taken when the owning session
    /// observed the value.
    pub timestamp: Instant,
}

/// Identifies one registered listener, for unregistration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Listener {
    id: ListenerId,
    sender: UnboundedSender<NotificationEvent>,
}

/// Fan-out of notification events to listeners keyed by exact
/// (address, characteristic handle) pair.
///
/// Delivery is push-driven through unbounded channels: publishing never
/// blocks on a slow listener, and one listener cannot delay another.
/// Listeners that need to do long work should hand it off to their own
/// task. Events are delivered in arrival order per pair; a listener
/// registered after an event was published never sees that event.
pub struct NotificationHub {
    listeners: Mutex<HashMap<(String, u16), Vec<Listener>>>,
    next_id: AtomicU64,
}

impl Default for NotificationHub {
    fn default() -> Self {
        NotificationHub::new()
    }
}

impl NotificationHub {
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Register a listener for one (address, handle) pair.
    pub fn register(
        &self,
        address: &str,
        handle: u16,
    ) -> (ListenerId, UnboundedReceiver<NotificationEvent>) {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (sender, receiver) = mpsc::unbounded_channel();

        self.listeners
            .lock()
            .unwrap()
            .entry((address.to_string(), handle))
            .or_default()
            .push(Listener { id, sender });

        (id, receiver)
    }

    /// Remove a listener. Takes effect for subsequent events; events
    /// already queued on the listener's channel remain readable.
    pub fn unregister(&self, address: &str, handle: u16, id: ListenerId) {
        let mut listeners = self.listeners.lock().unwrap();
        let key = (address.to_string(), handle);

        if let Some(registered) = listeners.get_mut(&key) {
            registered.retain(|listener| listener.id != id);
            if registered.is_empty() {
                listeners.remove(&key);
            }
        }
    }

    /// Dispatch an event to all listeners for its exact pair. Closed
    /// receivers are pruned.
    pub fn publish(&self, event: NotificationEvent) {
        let mut listeners = self.listeners.lock().unwrap();
        let key = (event.address.clone(), event.handle);

        if let Some(registered) = listeners.get_mut(&key) {
            registered.retain(|listener| listener.sender.send(event.clone()).is_ok());
            if registered.is_empty() {
                listeners.remove(&key);
            }
        }
    }
}
