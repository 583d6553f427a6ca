// Observer registry used for every outward event stream.
//
// Handlers are invoked synchronously, in registration order, from whichever
// task emits the event. A handler that needs to do async work spawns it.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::debug;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Handle returned by [`EventBus::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

pub struct EventBus<T> {
    next_id: AtomicU64,
    handlers: Mutex<BTreeMap<u64, Handler<T>>>,
}

impl<T> Default for EventBus<T> {
    fn default() -> Self {
        EventBus {
            next_id: AtomicU64::new(1),
            handlers: Mutex::new(BTreeMap::new()),
        }
    }
}

impl<T> EventBus<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        // Ids grow monotonically so BTreeMap order is registration order
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut handlers) = self.handlers.lock() {
            handlers.insert(id, Arc::new(handler));
        }
        SubscriptionId(id)
    }

    /// Returns false if the subscription was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        match self.handlers.lock() {
            Ok(mut handlers) => handlers.remove(&id.0).is_some(),
            Err(_) => false,
        }
    }

    pub fn emit(&self, event: &T) {
        // Snapshot first so handlers may (un)subscribe while being called
        let snapshot: Vec<Handler<T>> = match self.handlers.lock() {
            Ok(handlers) => handlers.values().cloned().collect(),
            Err(_) => return,
        };
        for handler in snapshot {
            handler(event);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.handlers.lock().map(|h| h.len()).unwrap_or(0)
    }

    pub fn clear(&self) {
        if let Ok(mut handlers) = self.handlers.lock() {
            handlers.clear();
        }
    }
}

impl<T: Clone + Send + 'static> EventBus<T> {
    /// Subscribe through a channel instead of a callback. The subscription is
    /// kept until the receiver is dropped and the next event notices it.
    pub fn channel(self: &Arc<Self>) -> mpsc::UnboundedReceiver<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let bus = Arc::downgrade(self);
        let slot: Arc<Mutex<Option<SubscriptionId>>> = Arc::new(Mutex::new(None));
        let slot_in_handler = slot.clone();
        let id = self.subscribe(move |event: &T| {
            if tx.send(event.clone()).is_err() {
                // Receiver is gone, remove ourselves
                let id = slot_in_handler.lock().ok().and_then(|mut s| s.take());
                if let (Some(id), Some(bus)) = (id, bus.upgrade()) {
                    debug!("Dropping closed event channel subscriber");
                    bus.unsubscribe(id);
                }
            }
        });
        if let Ok(mut s) = slot.lock() {
            *s = Some(id);
        }
        rx
    }

    pub fn stream(self: &Arc<Self>) -> UnboundedReceiverStream<T> {
        UnboundedReceiverStream::new(self.channel())
    }
}
