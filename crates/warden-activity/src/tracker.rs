//! Poll loop driving the [`Segmenter`] from an [`ActivityProbe`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument, Span};

use warden_core::config::WardenConfig;
use warden_core::error::Result;

use crate::probe::ActivityProbe;
use crate::sink::SegmentSink;
use crate::state::{ActivitySegment, SessionIdentity, Segmenter};
use crate::title::enrich_title;

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub poll_interval: Duration,
    pub idle_threshold_secs: u64,
    pub track_window_titles: bool,
    pub track_process_names: bool,
    pub computer_name: String,
    pub username: String,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            idle_threshold_secs: 300,
            track_window_titles: true,
            track_process_names: true,
            computer_name: "unknown".to_string(),
            username: "unknown".to_string(),
        }
    }
}

impl TrackerConfig {
    pub fn from_config(config: &WardenConfig) -> Self {
        Self {
            poll_interval: config.activity.poll_interval(),
            idle_threshold_secs: config.activity.idle_threshold_secs,
            track_window_titles: config.activity.track_window_titles,
            track_process_names: config.activity.track_process_names,
            computer_name: config.computer_name(),
            username: current_username(),
        }
    }
}

/// Login name of the user running the agent.
pub fn current_username() -> String {
    std::env::var("USERNAME")
        .or_else(|_| std::env::var("USER"))
        .unwrap_or_else(|_| "unknown".to_string())
}

/// Samples the host on a fixed interval and emits closed segments.
pub struct ActivityTracker<P: ActivityProbe, S: SegmentSink> {
    config: TrackerConfig,
    probe: P,
    sink: S,
    segmenter: Mutex<Segmenter>,
    stop: CancellationToken,
    stopped: AtomicBool,
    span: Span,
}

impl<P: ActivityProbe, S: SegmentSink> ActivityTracker<P, S> {
    pub fn new(config: TrackerConfig, probe: P, sink: S) -> Self {
        let identity = SessionIdentity::new(&config.computer_name, &config.username, Utc::now());
        let segmenter = Segmenter::new(config.idle_threshold_secs, identity);
        Self {
            config,
            probe,
            sink,
            segmenter: Mutex::new(segmenter),
            stop: CancellationToken::new(),
            stopped: AtomicBool::new(false),
            span: tracing::info_span!("activity_tracker"),
        }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub async fn session_id(&self) -> String {
        self.segmenter.lock().await.identity().session_id.clone()
    }

    /// Take one sample and advance the state machine.
    ///
    /// Does nothing once the tracker has been stopped.
    pub async fn poll_once(&self) -> Result<()> {
        let sample = self.probe.sample().await?;
        let closed = {
            let mut segmenter = self.segmenter.lock().await;
            if self.stopped.load(Ordering::SeqCst) {
                return Ok(());
            }
            segmenter.observe(sample, Utc::now())
        };
        if let Some(segment) = closed {
            self.emit(segment).await;
        }
        Ok(())
    }

    /// Poll until `cancel` fires or [`stop`](Self::stop) is called, then close
    /// the open segment.
    pub async fn start(&self, cancel: CancellationToken) {
        let span = self.span.clone();
        async move {
            let period = self.config.poll_interval;
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            info!(
                poll_interval_secs = period.as_secs(),
                idle_threshold_secs = self.config.idle_threshold_secs,
                "Activity tracker started"
            );

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = self.stop.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.poll_once().await {
                            warn!(error = %e, "Activity sample failed");
                        }
                    }
                }
            }

            self.finish().await;
        }
        .instrument(span)
        .await
    }

    /// Stop polling and emit the open segment. Safe to call repeatedly; only
    /// the first call emits.
    pub async fn stop(&self) {
        self.stop.cancel();
        self.finish().instrument(self.span.clone()).await;
    }

    async fn finish(&self) {
        let closed = {
            let mut segmenter = self.segmenter.lock().await;
            if self.stopped.swap(true, Ordering::SeqCst) {
                return;
            }
            segmenter.close(Utc::now())
        };
        if let Some(segment) = closed {
            self.emit(segment).await;
        }
        info!("Activity tracker stopped");
    }

    async fn emit(&self, segment: ActivitySegment) {
        let segment = self.redact(segment);
        debug!(
            state = %segment.state,
            duration_sec = segment.duration_sec,
            process = %segment.process_name,
            "Activity segment closed"
        );
        if let Err(e) = self.sink.emit(&segment).await {
            warn!(error = %e, state = %segment.state, "Failed to emit activity segment");
        }
    }

    /// Apply title enrichment and the tracking switches.
    fn redact(&self, mut segment: ActivitySegment) -> ActivitySegment {
        segment.window_title = if self.config.track_window_titles {
            enrich_title(&segment.process_name, &segment.window_title)
        } else {
            String::new()
        };
        if !self.config.track_process_names {
            segment.process_name.clear();
        }
        segment
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::MockProbe;
    use crate::sink::MemorySink;
    use crate::state::{ActivityState, Sample};
    use std::sync::Arc;

    fn config() -> TrackerConfig {
        TrackerConfig {
            poll_interval: Duration::from_millis(20),
            idle_threshold_secs: 60,
            computer_name: "WS-7".to_string(),
            username: "carol".to_string(),
            ..TrackerConfig::default()
        }
    }

    fn tracker(
        config: TrackerConfig,
        probe: MockProbe,
    ) -> (ActivityTracker<MockProbe, Arc<MemorySink>>, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        (ActivityTracker::new(config, probe, Arc::clone(&sink)), sink)
    }

    #[tokio::test]
    async fn test_stop_emits_open_segment_once() {
        let (tracker, sink) = tracker(
            config(),
            MockProbe::constant(Sample::new(0, "chrome.exe", "Docs - docs.rs - Google Chrome")),
        );
        tracker.poll_once().await.unwrap();
        tokio::time::sleep(Duration::from_millis(1100)).await;

        tracker.stop().await;
        tracker.stop().await;

        let segments = sink.segments();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].state, ActivityState::Active);
        assert!(segments[0].duration_sec >= 1);
        assert_eq!(segments[0].window_title, "Docs — docs.rs");
        assert_eq!(segments[0].session_id, tracker.session_id().await);
        assert!(segments[0].session_id.starts_with("WS-7-"));
        assert_eq!(segments[0].username, "carol");
    }

    #[tokio::test]
    async fn test_short_segment_not_emitted_on_stop() {
        let (tracker, sink) = tracker(config(), MockProbe::constant(Sample::new(0, "a.exe", "")));
        tracker.poll_once().await.unwrap();
        tracker.stop().await;
        assert!(sink.segments().is_empty());
    }

    #[tokio::test]
    async fn test_poll_after_stop_is_ignored() {
        let (tracker, sink) = tracker(config(), MockProbe::constant(Sample::new(0, "a.exe", "")));
        tracker.stop().await;
        tracker.poll_once().await.unwrap();
        tokio::time::sleep(Duration::from_millis(1100)).await;
        tracker.stop().await;
        assert!(sink.segments().is_empty());
    }

    #[tokio::test]
    async fn test_tracking_switches_blank_fields() {
        let (tracker, sink) = tracker(
            TrackerConfig {
                track_window_titles: false,
                track_process_names: false,
                ..config()
            },
            MockProbe::constant(Sample::new(0, "outlook.exe", "Inbox - carol@corp")),
        );
        tracker.poll_once().await.unwrap();
        tokio::time::sleep(Duration::from_millis(1100)).await;
        tracker.stop().await;

        let segments = sink.segments();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].process_name, "");
        assert_eq!(segments[0].window_title, "");
    }

    #[tokio::test]
    async fn test_probe_failure_does_not_stop_loop() {
        let (tracker, _sink) = tracker(config(), MockProbe::default());
        let tracker = Arc::new(tracker);
        let running = {
            let tracker = Arc::clone(&tracker);
            tokio::spawn(async move { tracker.start(CancellationToken::new()).await })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!running.is_finished());
        tracker.stop().await;
        tokio::time::timeout(Duration::from_secs(1), running)
            .await
            .expect("loop should exit after stop")
            .unwrap();
    }

    #[tokio::test]
    async fn test_loop_closes_segment_on_cancel() {
        let (tracker, sink) = tracker(
            config(),
            MockProbe::new([
                Sample::new(0, "a.exe", ""),
                Sample::new(0, "a.exe", ""),
            ]),
        );
        let tracker = Arc::new(tracker);
        let cancel = CancellationToken::new();
        let running = {
            let tracker = Arc::clone(&tracker);
            let cancel = cancel.clone();
            tokio::spawn(async move { tracker.start(cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(1200)).await;
        cancel.cancel();
        running.await.unwrap();

        let segments = sink.segments();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].process_name, "a.exe");

        // Already finished by the loop.
        tracker.stop().await;
        assert_eq!(sink.segments().len(), 1);
    }
}
