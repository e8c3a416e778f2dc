//! Tracker output flowing into the event buffer and to the collector.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use chrono::{TimeZone, Utc};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use warden_activity::{
    ActivitySegment, ActivityTracker, BufferedSink, DirectSink, MockProbe, Sample, SegmentSink,
    Segmenter, SessionIdentity, TrackerConfig, SEGMENT_EVENT_TYPE,
};
use warden_buffer::{EventBuffer, EventBufferConfig, MockDelivery};
use warden_delivery::{BreakerConfig, BreakerState, DeliveryClient, DeliveryConfig};

fn tracker_config() -> TrackerConfig {
    TrackerConfig {
        poll_interval: Duration::from_millis(20),
        idle_threshold_secs: 60,
        computer_name: "WS-9".to_string(),
        username: "dave".to_string(),
        ..TrackerConfig::default()
    }
}

#[tokio::test]
async fn test_final_segment_reaches_buffer_before_flush() {
    let dir = TempDir::new().unwrap();
    let delivery = Arc::new(MockDelivery::succeeding());
    let buffer = Arc::new(
        EventBuffer::new(
            EventBufferConfig {
                dir: dir.path().to_path_buf(),
                ..EventBufferConfig::default()
            },
            Arc::clone(&delivery),
        )
        .unwrap(),
    );

    let tracker = ActivityTracker::new(
        tracker_config(),
        MockProbe::constant(Sample::new(0, "winword.exe", "Report.docx - Word")),
        BufferedSink::new(Arc::clone(&buffer)),
    );
    tracker.poll_once().await.unwrap();
    tokio::time::sleep(Duration::from_millis(1100)).await;

    // Shutdown order: tracker first so its last segment is in the final flush.
    tracker.stop().await;
    assert_eq!(buffer.size(), 1);
    buffer.flush(&CancellationToken::new()).await.unwrap();

    let batches = delivery.batches();
    assert_eq!(batches.len(), 1);
    let event = &batches[0][0];
    assert_eq!(event.event_type, SEGMENT_EVENT_TYPE);
    assert_eq!(event.data["state"], "active");
    assert_eq!(event.data["process_name"], "winword.exe");
    assert_eq!(event.data["computer_name"], "WS-9");
}

#[tokio::test]
async fn test_segments_in_buffer_survive_restart() {
    let dir = TempDir::new().unwrap();
    let config = EventBufferConfig {
        dir: dir.path().to_path_buf(),
        ..EventBufferConfig::default()
    };

    {
        let buffer = Arc::new(
            EventBuffer::new(config.clone(), Arc::new(MockDelivery::failing())).unwrap(),
        );
        let tracker = ActivityTracker::new(
            tracker_config(),
            MockProbe::constant(Sample::new(600, "explorer.exe", "")),
            BufferedSink::new(Arc::clone(&buffer)),
        );
        let running = {
            let buffer = Arc::clone(&buffer);
            tokio::spawn(async move { buffer.start(CancellationToken::new()).await })
        };

        tracker.poll_once().await.unwrap();
        tokio::time::sleep(Duration::from_millis(1100)).await;
        tracker.stop().await;
        buffer.stop();
        running.await.unwrap();
    }

    let delivery = Arc::new(MockDelivery::succeeding());
    let buffer = EventBuffer::new(config, Arc::clone(&delivery)).unwrap();
    assert_eq!(buffer.size(), 1);
    buffer.flush(&CancellationToken::new()).await.unwrap();
    assert_eq!(delivery.batches()[0][0].data["state"], "idle");
}

#[derive(Clone, Default)]
struct Collector {
    segments: Arc<Mutex<Vec<serde_json::Value>>>,
}

async fn ingest(State(c): State<Collector>, Json(body): Json<serde_json::Value>) -> StatusCode {
    c.segments.lock().unwrap().push(body);
    StatusCode::OK
}

async fn spawn_collector(collector: Collector) -> SocketAddr {
    let app = Router::new()
        .route("/api/activity/segment", post(ingest))
        .with_state(collector);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

#[tokio::test]
async fn test_direct_sink_posts_segment_without_envelope() {
    let collector = Collector::default();
    let addr = spawn_collector(collector.clone()).await;
    let client = Arc::new(
        DeliveryClient::new(DeliveryConfig {
            server_url: format!("http://{}", addr),
            ..DeliveryConfig::default()
        })
        .unwrap(),
    );

    let tracker = ActivityTracker::new(
        tracker_config(),
        MockProbe::constant(Sample::new(0, "firefox.exe", "Issues - gitlab.com - Mozilla Firefox")),
        DirectSink::new(client, "/api/activity/segment"),
    );
    tracker.poll_once().await.unwrap();
    tokio::time::sleep(Duration::from_millis(1100)).await;
    tracker.stop().await;

    let segments = collector.segments.lock().unwrap().clone();
    assert_eq!(segments.len(), 1);
    assert_eq!(segments[0]["process_name"], "firefox.exe");
    assert_eq!(segments[0]["window_title"], "Issues — gitlab.com");
    assert_eq!(segments[0]["username"], "dave");
}

/// Answers from a script: `Some(code)` replies, `None` never replies.
#[derive(Clone)]
struct Flaky {
    hits: Arc<AtomicUsize>,
    script: Arc<Mutex<VecDeque<Option<u16>>>>,
}

async fn flaky(State(f): State<Flaky>) -> StatusCode {
    f.hits.fetch_add(1, Ordering::SeqCst);
    let next = f.script.lock().unwrap().pop_front();
    match next {
        Some(None) => {
            tokio::time::sleep(Duration::from_secs(60)).await;
            StatusCode::OK
        }
        Some(Some(code)) => StatusCode::from_u16(code).unwrap(),
        None => StatusCode::OK,
    }
}

fn closed_segment() -> ActivitySegment {
    let start = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap();
    let mut s = Segmenter::new(60, SessionIdentity::new("WS-9", "dave", start));
    s.observe(Sample::new(0, "code.exe", "main.rs"), start);
    s.close(start + chrono::Duration::seconds(5)).unwrap()
}

#[tokio::test]
async fn test_direct_sink_recovers_after_hung_probes() {
    let mut script: VecDeque<Option<u16>> = [Some(503), Some(503), Some(503)].into();
    script.extend([None, None, None]);
    let collector = Flaky {
        hits: Arc::new(AtomicUsize::new(0)),
        script: Arc::new(Mutex::new(script)),
    };
    let app = Router::new()
        .route("/api/activity/segment", post(flaky))
        .with_state(collector.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let client = Arc::new(
        DeliveryClient::new(DeliveryConfig {
            server_url: format!("http://{}", addr),
            retry_attempts: 0,
            breaker: BreakerConfig {
                cooldown: Duration::from_millis(100),
                ..BreakerConfig::default()
            },
            ..DeliveryConfig::default()
        })
        .unwrap(),
    );
    let sink = DirectSink::new(Arc::clone(&client), "/api/activity/segment")
        .with_timeout(Duration::from_millis(200));
    let segment = closed_segment();

    for _ in 0..3 {
        assert!(sink.emit(&segment).await.is_err());
    }
    assert_eq!(client.breaker_state(), BreakerState::Open);

    tokio::time::sleep(Duration::from_millis(150)).await;
    for _ in 0..3 {
        assert!(sink.emit(&segment).await.is_err());
    }
    assert_eq!(collector.hits.load(Ordering::SeqCst), 6);

    // Timed-out probes gave their slots back, so the next one gets through.
    sink.emit(&segment).await.unwrap();
    assert_eq!(collector.hits.load(Ordering::SeqCst), 7);
    assert_eq!(client.breaker_state(), BreakerState::Closed);
}
