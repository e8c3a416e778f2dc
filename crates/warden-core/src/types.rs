use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// A single telemetry event waiting for delivery to the collector.
///
/// `event_type` is a discriminator interpreted only by the server; `data` is
/// the producer's payload, already serialized to JSON. Events are immutable
/// once created.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub data: serde_json::Value,
}

impl Event {
    /// Create an event stamped with the current time.
    pub fn new(event_type: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            event_type: event_type.into(),
            timestamp: Utc::now(),
            data,
        }
    }

    /// Serialize `payload` and wrap it in an event stamped with the current time.
    pub fn from_payload<T: Serialize + ?Sized>(event_type: &str, payload: &T) -> Result<Self> {
        let data = serde_json::to_value(payload)?;
        Ok(Self::new(event_type, data))
    }
}

/// Wire envelope for a batch of events: `{ "events": [...] }`.
#[derive(Debug, Serialize)]
pub struct EventBatch<'a> {
    pub events: &'a [Event],
}

/// Capability handed to event producers.
///
/// Producers (activity tracker, USB/file/screenshot monitors) only ever call
/// into this trait; how events are queued, persisted and delivered is the
/// implementor's concern.
pub trait EventSink: Send + Sync {
    /// Take ownership of an already-built event.
    fn add_event(&self, event: Event) -> Result<()>;

    /// Serialize `payload` and enqueue it under `event_type`.
    fn add<T: Serialize + ?Sized>(&self, event_type: &str, payload: &T) -> Result<()>
    where
        Self: Sized,
    {
        self.add_event(Event::from_payload(event_type, payload)?)
    }
}
