//! Durable in-process event queue.
//!
//! Producers append with [`EventSink::add_event`]; a single loop started by
//! [`EventBuffer::start`] flushes batches on a timer or when the queue reaches
//! `flush_size`. A flush swaps the pending queue out under the lock, so
//! producers keep appending to a fresh queue while the old one is on the
//! wire. Until the collector acknowledges a batch it stays visible to
//! snapshots as the in-flight batch.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument, Span};

use warden_core::config::WardenConfig;
use warden_core::error::{Result, WardenError};
use warden_core::types::{Event, EventSink};
use warden_delivery::DeliveryClient;

use crate::delivery::Delivery;
use crate::snapshot::Snapshot;

/// Hard bound on the flush attempted while shutting down.
pub const FINAL_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct EventBufferConfig {
    /// Collector path batches are posted to.
    pub endpoint: String,
    /// Directory holding the snapshot file.
    pub dir: PathBuf,
    /// Queue capacity; the oldest events are dropped beyond it. While a
    /// batch is in flight only newer events count against it.
    pub max_size: usize,
    /// Queue length that triggers an early flush.
    pub flush_size: usize,
    pub flush_period: Duration,
}

impl Default for EventBufferConfig {
    fn default() -> Self {
        Self {
            endpoint: "/api/events/batch".to_string(),
            dir: PathBuf::from("buffer"),
            max_size: 1000,
            flush_size: 50,
            flush_period: Duration::from_secs(30),
        }
    }
}

impl EventBufferConfig {
    pub fn from_config(config: &WardenConfig) -> Self {
        Self {
            endpoint: config.server.events_endpoint.clone(),
            dir: config.buffer_dir(),
            max_size: config.buffer.max_size,
            flush_size: config.buffer.flush_size,
            flush_period: config.buffer.flush_period(),
        }
    }
}

#[derive(Default)]
struct Queue {
    pending: VecDeque<Event>,
    in_flight: Option<Arc<Vec<Event>>>,
}

impl Queue {
    fn in_flight_len(&self) -> usize {
        self.in_flight.as_ref().map_or(0, |b| b.len())
    }

    fn len(&self) -> usize {
        self.pending.len() + self.in_flight_len()
    }

    /// Oldest first: the in-flight batch, then everything added since.
    fn undelivered(&self) -> Vec<Event> {
        self.in_flight
            .iter()
            .flat_map(|batch| batch.iter())
            .chain(self.pending.iter())
            .cloned()
            .collect()
    }
}

pub struct EventBuffer<D: Delivery = DeliveryClient> {
    config: EventBufferConfig,
    delivery: Arc<D>,
    snapshot: Snapshot,
    queue: Mutex<Queue>,
    /// Serializes snapshot writes so an older view never lands after a newer one.
    snapshot_lock: Mutex<()>,
    /// Serializes flushes.
    flush_lock: tokio::sync::Mutex<()>,
    trigger: Notify,
    stop: CancellationToken,
    shut_down: AtomicBool,
    dropped: AtomicU64,
    span: Span,
}

impl<D: Delivery> EventBuffer<D> {
    /// Create the buffer directory and recover any snapshot left by a
    /// previous run.
    ///
    /// Failing to create the directory is fatal; an unreadable snapshot is
    /// logged and the buffer starts empty.
    pub fn new(config: EventBufferConfig, delivery: Arc<D>) -> Result<Self> {
        std::fs::create_dir_all(&config.dir).map_err(|e| {
            WardenError::Buffer(format!(
                "Failed to create buffer directory {}: {}",
                config.dir.display(),
                e
            ))
        })?;

        let snapshot = Snapshot::new(&config.dir);
        let mut pending = VecDeque::new();
        match snapshot.load() {
            Ok(events) => {
                let total = events.len();
                let skip = total.saturating_sub(config.max_size);
                pending.extend(events.into_iter().skip(skip));
                if total > 0 {
                    info!(
                        recovered = pending.len(),
                        discarded = skip,
                        path = %snapshot.path().display(),
                        "Recovered buffered events from disk"
                    );
                }
            }
            Err(e) => {
                warn!(path = %snapshot.path().display(), error = %e, "Failed to load snapshot, starting empty");
            }
        }

        Ok(Self {
            config,
            delivery,
            snapshot,
            queue: Mutex::new(Queue {
                pending,
                in_flight: None,
            }),
            snapshot_lock: Mutex::new(()),
            flush_lock: tokio::sync::Mutex::new(()),
            trigger: Notify::new(),
            stop: CancellationToken::new(),
            shut_down: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
            span: tracing::info_span!("event_buffer"),
        })
    }

    /// Replace the span that scopes this buffer's log output.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn config(&self) -> &EventBufferConfig {
        &self.config
    }

    pub fn snapshot_path(&self) -> &Path {
        self.snapshot.path()
    }

    /// Undelivered events, including a batch currently being sent.
    pub fn size(&self) -> usize {
        self.queue.lock().expect("buffer queue poisoned").len()
    }

    /// Events discarded because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Deliver everything currently pending as one batch.
    ///
    /// On failure the batch goes back to the front of the queue and a
    /// snapshot is written before the error is returned.
    pub async fn flush(&self, cancel: &CancellationToken) -> Result<()> {
        self.flush_inner(cancel).instrument(self.span.clone()).await
    }

    async fn flush_inner(&self, cancel: &CancellationToken) -> Result<()> {
        let _flushing = self.flush_lock.lock().await;

        let batch = {
            let mut queue = self.queue.lock().expect("buffer queue poisoned");
            if queue.pending.is_empty() {
                return Ok(());
            }
            let batch = Arc::new(Vec::from(std::mem::take(&mut queue.pending)));
            queue.in_flight = Some(Arc::clone(&batch));
            batch
        };

        let started = Instant::now();
        let result = self
            .delivery
            .send(cancel, &self.config.endpoint, &batch)
            .await;

        match result {
            Ok(()) => {
                {
                    let writing = self.snapshot_lock.lock().expect("snapshot lock poisoned");
                    let remaining = {
                        let mut queue = self.queue.lock().expect("buffer queue poisoned");
                        queue.in_flight = None;
                        queue.pending.len()
                    };
                    // Empty queue: drop the snapshot. Otherwise only refresh one that exists.
                    if remaining == 0 || self.snapshot.exists() {
                        self.write_snapshot(&writing);
                    }
                }
                info!(
                    events = batch.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Flushed events"
                );
                Ok(())
            }
            Err(e) => {
                let sent = batch.len();
                {
                    let mut queue = self.queue.lock().expect("buffer queue poisoned");
                    queue.in_flight = None;
                    let batch = Arc::try_unwrap(batch).unwrap_or_else(|shared| (*shared).clone());
                    let newer = std::mem::take(&mut queue.pending);
                    queue.pending = batch.into_iter().chain(newer).collect();
                    let overflow = queue.pending.len().saturating_sub(self.config.max_size);
                    if overflow > 0 {
                        queue.pending.drain(..overflow);
                        self.record_dropped(overflow);
                    }
                }
                self.persist();
                if e.is_cancelled() {
                    debug!(events = sent, "Flush cancelled, batch kept");
                } else {
                    warn!(events = sent, error = %e, "Flush failed, batch kept for retry");
                }
                Err(e.into())
            }
        }
    }

    /// Run the flush loop until `cancel` fires or [`stop`](Self::stop) is
    /// called, then make one last attempt to deliver or persist the queue.
    pub async fn start(&self, cancel: CancellationToken) {
        let span = self.span.clone();
        async move {
            // Either token ends the loop; in-flight deliveries see the merged one.
            let stop = self.stop.clone();
            let forward = tokio::spawn(async move {
                cancel.cancelled().await;
                stop.cancel();
            });

            let period = self.config.flush_period;
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            info!(
                flush_period_secs = period.as_secs(),
                flush_size = self.config.flush_size,
                max_size = self.config.max_size,
                "Event buffer started"
            );

            loop {
                tokio::select! {
                    _ = self.stop.cancelled() => break,
                    _ = ticker.tick() => self.flush_logged().await,
                    _ = self.trigger.notified() => {
                        debug!("Size trigger fired");
                        self.flush_logged().await;
                    }
                }
            }

            forward.abort();
            self.save_on_shutdown().await;
            info!("Event buffer stopped");
        }
        .instrument(span)
        .await
    }

    /// Ask the loop to exit. Safe to call repeatedly.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    async fn flush_logged(&self) {
        // Errors are logged inside flush; the queue stays intact for the next tick.
        let _ = self.flush_inner(&self.stop).await;
    }

    async fn save_on_shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let size = self.size();
        if size == 0 {
            return;
        }

        info!(events = size, "Attempting final flush before shutdown");
        let deadline = CancellationToken::new();
        let timer = {
            let deadline = deadline.clone();
            tokio::spawn(async move {
                tokio::time::sleep(FINAL_FLUSH_TIMEOUT).await;
                deadline.cancel();
            })
        };
        let result = self.flush_inner(&deadline).await;
        timer.abort();

        match result {
            Ok(()) => info!("Final flush delivered all buffered events"),
            Err(_) => {
                self.persist();
                info!(
                    events = self.size(),
                    path = %self.snapshot.path().display(),
                    "Saved buffered events to disk for next startup"
                );
            }
        }
    }

    /// Write every undelivered event to the snapshot. Failures are logged.
    fn persist(&self) {
        let writing = self.snapshot_lock.lock().expect("snapshot lock poisoned");
        self.write_snapshot(&writing);
    }

    fn write_snapshot(&self, _writing: &MutexGuard<'_, ()>) {
        let events = self.queue.lock().expect("buffer queue poisoned").undelivered();

        let result = if events.is_empty() {
            self.snapshot.remove()
        } else {
            self.snapshot.save(&events)
        };
        match result {
            Ok(()) => debug!(events = events.len(), "Snapshot written"),
            Err(e) => warn!(
                path = %self.snapshot.path().display(),
                error = %e,
                "Failed to write snapshot, continuing in memory"
            ),
        }
    }

    fn record_dropped(&self, count: usize) {
        let total = self.dropped.fetch_add(count as u64, Ordering::Relaxed) + count as u64;
        warn!(dropped = count, total_dropped = total, "Buffer full, dropped oldest events");
    }
}

impl<D: Delivery> EventSink for EventBuffer<D> {
    fn add_event(&self, event: Event) -> Result<()> {
        let len = {
            let mut queue = self.queue.lock().expect("buffer queue poisoned");
            queue.pending.push_back(event);

            // The in-flight batch is not counted here; if it fails, the requeue
            // in flush trims the merged queue oldest-first.
            let overflow = queue.pending.len().saturating_sub(self.config.max_size);
            if overflow > 0 {
                queue.pending.drain(..overflow);
                self.record_dropped(overflow);
            }
            queue.len()
        };

        if len >= self.config.max_size / 2 {
            let _entered = self.span.enter();
            self.persist();
        }
        if len >= self.config.flush_size {
            self.trigger.notify_one();
        }
        Ok(())
    }
}
