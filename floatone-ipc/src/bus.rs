use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single key's new value, broadcast from the window that set it to every peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub key: String,
    /// Full value of the key after the change (never a diff)
    pub value: Value,
    /// Unique id of the publishing window
    pub origin: String,
    /// Per-window monotonic counter
    pub seq: u64,
    pub timestamp_ms: u64,
}

impl ChangeEvent {
    /// Bus event name carrying changes for `key`
    pub fn event_name(key: &str) -> String {
        format!("{}-update", key)
    }
}

/// Requests sent from a window to the bus hub
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusRequest {
    /// First line of every connection
    Hello {
        window: String,
        /// Event names to receive (empty receives everything)
        #[serde(default)]
        events: Vec<String>,
    },
    Publish {
        event: String,
        payload: Value,
    },
}

impl BusRequest {
    /// Hello that subscribes to every event
    pub fn hello(window: impl Into<String>) -> Self {
        BusRequest::Hello {
            window: window.into(),
            events: Vec::new(),
        }
    }
}

/// Frames sent from the bus hub to a window
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusFrame {
    Event { event: String, payload: Value },
    Error { message: String },
    /// The window fell behind and `missed` events were dropped for it
    Lagged { missed: u64 },
}
