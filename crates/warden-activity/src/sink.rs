//! Where closed segments go.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use warden_core::error::{Result, WardenError};
use warden_core::types::EventSink;
use warden_delivery::DeliveryClient;

use crate::state::ActivitySegment;

/// Event type used when segments travel through the event buffer.
pub const SEGMENT_EVENT_TYPE: &str = "activity_segment";

pub trait SegmentSink: Send + Sync {
    fn emit(&self, segment: &ActivitySegment) -> impl Future<Output = Result<()>> + Send;
}

/// Queues segments into an [`EventSink`] (normally the event buffer).
pub struct BufferedSink<E: EventSink> {
    events: Arc<E>,
}

impl<E: EventSink> BufferedSink<E> {
    pub fn new(events: Arc<E>) -> Self {
        Self { events }
    }
}

impl<E: EventSink> SegmentSink for BufferedSink<E> {
    async fn emit(&self, segment: &ActivitySegment) -> Result<()> {
        self.events.add(SEGMENT_EVENT_TYPE, segment)
    }
}

/// Posts each segment straight to the collector's activity endpoint.
///
/// Used when no buffer is wired: a segment that cannot be delivered within
/// `timeout` is lost.
pub struct DirectSink {
    client: Arc<DeliveryClient>,
    endpoint: String,
    timeout: Duration,
}

impl DirectSink {
    pub fn new(client: Arc<DeliveryClient>, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            timeout: Duration::from_secs(10),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl SegmentSink for DirectSink {
    async fn emit(&self, segment: &ActivitySegment) -> Result<()> {
        let cancel = CancellationToken::new();
        let post = self.client.post_json(&cancel, &self.endpoint, segment);
        tokio::pin!(post);

        tokio::select! {
            result = &mut post => result.map_err(WardenError::from),
            _ = tokio::time::sleep(self.timeout) => {
                // Let the client wind the request down instead of dropping it.
                cancel.cancel();
                match post.await {
                    Ok(()) => Ok(()),
                    Err(_) => Err(WardenError::Activity(format!(
                        "Segment delivery timed out after {:?}",
                        self.timeout
                    ))),
                }
            }
        }
    }
}

/// Collects segments in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    segments: Mutex<Vec<ActivitySegment>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn segments(&self) -> Vec<ActivitySegment> {
        self.segments.lock().expect("memory sink poisoned").clone()
    }
}

impl SegmentSink for MemorySink {
    async fn emit(&self, segment: &ActivitySegment) -> Result<()> {
        self.segments
            .lock()
            .expect("memory sink poisoned")
            .push(segment.clone());
        Ok(())
    }
}

impl<T: SegmentSink> SegmentSink for Arc<T> {
    fn emit(&self, segment: &ActivitySegment) -> impl Future<Output = Result<()>> + Send {
        (**self).emit(segment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{ActivityState, Sample, SessionIdentity, Segmenter};
    use chrono::{TimeZone, Utc};
    use warden_core::types::Event;

    #[derive(Default)]
    struct VecEvents(Mutex<Vec<Event>>);

    impl EventSink for VecEvents {
        fn add_event(&self, event: Event) -> Result<()> {
            self.0.lock().unwrap().push(event);
            Ok(())
        }
    }

    fn segment() -> ActivitySegment {
        let start = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap();
        let mut s = Segmenter::new(60, SessionIdentity::new("WS-1", "bob", start));
        s.observe(Sample::new(0, "excel.exe", "Budget.xlsx"), start);
        s.close(start + chrono::Duration::seconds(42)).unwrap()
    }

    #[tokio::test]
    async fn test_buffered_sink_wraps_segment_in_event() {
        let events = Arc::new(VecEvents::default());
        let sink = BufferedSink::new(Arc::clone(&events));
        sink.emit(&segment()).await.unwrap();

        let queued = events.0.lock().unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].event_type, "activity_segment");
        assert_eq!(queued[0].data["duration_sec"], 42);
        assert_eq!(queued[0].data["process_name"], "excel.exe");
    }

    #[tokio::test]
    async fn test_memory_sink_through_arc() {
        let sink = Arc::new(MemorySink::new());
        sink.emit(&segment()).await.unwrap();
        let segments = sink.segments();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].state, ActivityState::Active);
    }
}
