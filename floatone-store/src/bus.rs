use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use serde_json::Value;
use tokio::sync::mpsc;

use crate::backend::lock;
use crate::error::BusError;

/// A message delivered to subscribers of `event`
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub event: String,
    pub payload: Value,
}

/// Publish/subscribe transport between windows.
/// Delivery is in publish order per publisher; there is no replay for late subscribers.
pub trait EventBus: Send + Sync {
    /// Fire-and-forget; never waits for subscribers
    fn publish(&self, event: &str, payload: Value) -> Result<(), BusError>;
    fn subscribe(&self, event: &str) -> Subscription;
}

type Cancel = Box<dyn FnOnce() + Send + Sync>;

/// Receiving side of a subscription. Unsubscribes when dropped.
#[must_use = "dropping a subscription unsubscribes it"]
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<Envelope>,
    cancel: Option<Cancel>,
}

impl Subscription {
    pub fn new(rx: mpsc::UnboundedReceiver<Envelope>, cancel: Cancel) -> Self {
        Self {
            rx,
            cancel: Some(cancel),
        }
    }

    /// Next envelope, or `None` once the bus is gone
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Envelope> {
        self.rx.try_recv().ok()
    }

    pub fn unsubscribe(mut self) {
        self.cancel_now();
    }

    fn cancel_now(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel_now();
    }
}

#[derive(Default)]
struct Topics {
    next_id: u64,
    subscribers: HashMap<String, Vec<(u64, mpsc::UnboundedSender<Envelope>)>>,
}

/// In-process bus. Also the local fan-out behind socket-connected buses.
#[derive(Clone, Default)]
pub struct LocalBus {
    topics: Arc<Mutex<Topics>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver to every current subscriber of `envelope.event`
    pub fn dispatch(&self, envelope: Envelope) {
        let mut topics = lock(&self.topics);
        let Some(subscribers) = topics.subscribers.get_mut(&envelope.event) else {
            return;
        };
        subscribers.retain(|(_, tx)| tx.send(envelope.clone()).is_ok());
    }

    pub fn subscriber_count(&self, event: &str) -> usize {
        lock(&self.topics)
            .subscribers
            .get(event)
            .map_or(0, Vec::len)
    }
}

impl EventBus for LocalBus {
    fn publish(&self, event: &str, payload: Value) -> Result<(), BusError> {
        self.dispatch(Envelope {
            event: event.to_string(),
            payload,
        });
        Ok(())
    }

    fn subscribe(&self, event: &str) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut topics = lock(&self.topics);
            let id = topics.next_id;
            topics.next_id += 1;
            topics
                .subscribers
                .entry(event.to_string())
                .or_default()
                .push((id, tx));
            id
        };

        let topics: Weak<Mutex<Topics>> = Arc::downgrade(&self.topics);
        let event = event.to_string();
        Subscription::new(
            rx,
            Box::new(move || {
                let Some(topics) = topics.upgrade() else {
                    return;
                };
                let mut topics = lock(&topics);
                if let Some(subscribers) = topics.subscribers.get_mut(&event) {
                    subscribers.retain(|(sub_id, _)| *sub_id != id);
                    if subscribers.is_empty() {
                        topics.subscribers.remove(&event);
                    }
                }
            }),
        )
    }
}
