//! Durable event buffer between telemetry producers and the collector.
//!
//! Events are queued in memory, mirrored to a JSON snapshot on disk when the
//! queue fills up or delivery fails, and shipped in batches through a
//! [`Delivery`] implementation.

pub mod buffer;
pub mod delivery;
pub mod snapshot;

pub use buffer::{EventBuffer, EventBufferConfig, FINAL_FLUSH_TIMEOUT};
pub use delivery::{Delivery, MockDelivery};
pub use snapshot::{Snapshot, SNAPSHOT_FILE};
pub use warden_core::types::{Event, EventSink};
