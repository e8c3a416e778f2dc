//! Transport seam between the buffer and the collector.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use warden_core::types::{Event, EventBatch};
use warden_delivery::{DeliveryClient, DeliveryError};

/// Something that can ship a batch of events to an endpoint.
pub trait Delivery: Send + Sync + 'static {
    fn send(
        &self,
        cancel: &CancellationToken,
        endpoint: &str,
        events: &[Event],
    ) -> impl Future<Output = Result<(), DeliveryError>> + Send;
}

impl Delivery for DeliveryClient {
    fn send(
        &self,
        cancel: &CancellationToken,
        endpoint: &str,
        events: &[Event],
    ) -> impl Future<Output = Result<(), DeliveryError>> + Send {
        async move { self.post_json(cancel, endpoint, &EventBatch { events }).await }
    }
}

/// Scripted in-memory transport for tests and benchmarks.
///
/// Outcomes are consumed from a script; once it runs dry every call gets the
/// fallback outcome. Every batch handed to `send` is recorded, including
/// batches whose delivery was scripted to fail.
pub struct MockDelivery {
    script: Mutex<VecDeque<bool>>,
    fallback: bool,
    batches: Mutex<Vec<Vec<Event>>>,
    calls: AtomicUsize,
    gate: Option<Gate>,
}

struct Gate {
    entered: Arc<Notify>,
    release: Arc<Notify>,
}

impl MockDelivery {
    /// Every call succeeds.
    pub fn succeeding() -> Self {
        Self::with_fallback(true)
    }

    /// Every call fails with a 503.
    pub fn failing() -> Self {
        Self::with_fallback(false)
    }

    fn with_fallback(fallback: bool) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback,
            batches: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            gate: None,
        }
    }

    /// Queue explicit outcomes ahead of the fallback.
    pub fn then(self, outcomes: &[bool]) -> Self {
        self.script
            .lock()
            .expect("mock script poisoned")
            .extend(outcomes.iter().copied());
        self
    }

    /// Hold every call until `release` is notified.
    ///
    /// `entered` is notified once the call has recorded its batch.
    pub fn gated(mut self, entered: Arc<Notify>, release: Arc<Notify>) -> Self {
        self.gate = Some(Gate { entered, release });
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn batches(&self) -> Vec<Vec<Event>> {
        self.batches.lock().expect("mock batches poisoned").clone()
    }

    fn next_outcome(&self) -> bool {
        self.script
            .lock()
            .expect("mock script poisoned")
            .pop_front()
            .unwrap_or(self.fallback)
    }
}

impl Delivery for MockDelivery {
    fn send(
        &self,
        cancel: &CancellationToken,
        _endpoint: &str,
        events: &[Event],
    ) -> impl Future<Output = Result<(), DeliveryError>> + Send {
        async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.batches
                .lock()
                .expect("mock batches poisoned")
                .push(events.to_vec());

            if let Some(gate) = &self.gate {
                gate.entered.notify_one();
                tokio::select! {
                    _ = cancel.cancelled() => return Err(DeliveryError::Cancelled),
                    _ = gate.release.notified() => {}
                }
            }

            if self.next_outcome() {
                Ok(())
            } else {
                Err(DeliveryError::Server {
                    request_id: "mock".to_string(),
                    status: 503,
                    body: "unavailable".to_string(),
                })
            }
        }
    }
}
