//! Retrying HTTP client for the collector.
//!
//! Each POST is attempted up to `retry_attempts + 1` times. Every individual
//! attempt is gated by the circuit breaker; an open breaker fails the attempt
//! fast and the loop moves on to the next retry slot.

use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use warden_core::config::ServerConfig;

use crate::breaker::{BreakerConfig, BreakerState, CircuitBreaker};
use crate::error::DeliveryError;
use crate::multipart::MultipartForm;

const REQUEST_ID_HEADER: &str = "X-Request-ID";
const API_KEY_HEADER: &str = "X-API-Key";
const HEALTH_PATH: &str = "/health";

/// Configuration for [`DeliveryClient`].
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// Collector base URL, e.g. `https://collector.internal`.
    pub server_url: String,
    /// Optional credential attached as `X-API-Key`.
    pub api_key: Option<String>,
    /// Per-request timeout.
    pub timeout: Duration,
    /// Retries after the first attempt.
    pub retry_attempts: u32,
    /// Wait before each retry.
    pub retry_delay: Duration,
    pub breaker: BreakerConfig,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:8080".to_string(),
            api_key: None,
            timeout: Duration::from_secs(30),
            retry_attempts: 3,
            retry_delay: Duration::from_secs(5),
            breaker: BreakerConfig::default(),
        }
    }
}

impl From<&ServerConfig> for DeliveryConfig {
    fn from(server: &ServerConfig) -> Self {
        Self {
            server_url: server.url.clone(),
            api_key: server.api_key(),
            timeout: server.timeout(),
            retry_attempts: server.retry_attempts,
            retry_delay: server.retry_delay(),
            breaker: BreakerConfig::default(),
        }
    }
}

/// Request body, rebuilt for every attempt.
enum Payload<'a> {
    Bytes {
        body: Vec<u8>,
        content_type: &'a str,
    },
    Form(&'a MultipartForm),
}

/// HTTP client with bounded retries and circuit-breaker protection.
///
/// Knows nothing about buffering or event semantics: it moves bytes to the
/// collector and classifies the answer.
pub struct DeliveryClient {
    config: DeliveryConfig,
    http: reqwest::Client,
    breaker: CircuitBreaker,
}

impl DeliveryClient {
    pub fn new(config: DeliveryConfig) -> Result<Self, DeliveryError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| DeliveryError::Setup(e.to_string()))?;
        let breaker = CircuitBreaker::new("collector", config.breaker.clone());
        Ok(Self {
            config,
            http,
            breaker,
        })
    }

    pub fn config(&self) -> &DeliveryConfig {
        &self.config
    }

    pub fn breaker_state(&self) -> BreakerState {
        self.breaker.state()
    }

    /// Serialize `payload` once and POST it as JSON.
    ///
    /// Serialization failures are returned immediately and never retried.
    pub async fn post_json<T: Serialize + ?Sized>(
        &self,
        cancel: &CancellationToken,
        endpoint: &str,
        payload: &T,
    ) -> Result<(), DeliveryError> {
        let body = serde_json::to_vec(payload)?;
        let payload = Payload::Bytes {
            body,
            content_type: "application/json",
        };
        self.post_with_retry(cancel, endpoint, &payload).await
    }

    /// POST a streamed body (e.g. a multipart screenshot upload).
    ///
    /// The reader is drained once up front so every retry resends the same
    /// bytes.
    pub async fn post_multipart<R: AsyncRead + Unpin>(
        &self,
        cancel: &CancellationToken,
        endpoint: &str,
        mut reader: R,
        content_type: &str,
    ) -> Result<(), DeliveryError> {
        let mut body = Vec::new();
        reader.read_to_end(&mut body).await?;
        let payload = Payload::Bytes { body, content_type };
        self.post_with_retry(cancel, endpoint, &payload).await
    }

    /// POST a [`MultipartForm`], encoded by reqwest afresh on each attempt.
    pub async fn post_form(
        &self,
        cancel: &CancellationToken,
        endpoint: &str,
        form: &MultipartForm,
    ) -> Result<(), DeliveryError> {
        // Surface a bad part before spending any attempts.
        form.to_form()?;
        self.post_with_retry(cancel, endpoint, &Payload::Form(form))
            .await
    }

    /// Single unretried `GET /health`.
    ///
    /// Bypasses the circuit breaker; callers use it for startup logging only.
    pub async fn ping(&self, cancel: &CancellationToken) -> Result<(), DeliveryError> {
        let url = self.url(HEALTH_PATH);
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(DeliveryError::Cancelled),
            r = self.http.get(&url).send() => r,
        };
        let response = response.map_err(|e| DeliveryError::Ping(e.to_string()))?;
        if response.status() != reqwest::StatusCode::OK {
            return Err(DeliveryError::Ping(format!(
                "server returned status {}",
                response.status().as_u16()
            )));
        }
        Ok(())
    }

    async fn post_with_retry(
        &self,
        cancel: &CancellationToken,
        endpoint: &str,
        payload: &Payload<'_>,
    ) -> Result<(), DeliveryError> {
        let url = self.url(endpoint);
        let attempts = self.config.retry_attempts + 1;
        let mut last_err = None;

        for attempt in 0..attempts {
            if attempt > 0 {
                info!(
                    endpoint,
                    attempt,
                    max_retries = self.config.retry_attempts,
                    "Retrying request"
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Err(DeliveryError::Cancelled),
                    _ = tokio::time::sleep(self.config.retry_delay) => {}
                }
            }

            match self.attempt(cancel, &url, endpoint, payload).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() => {
                    warn!(endpoint, attempt, error = %e, "Delivery attempt failed");
                    last_err = Some(e);
                }
                Err(e) => {
                    if !e.is_cancelled() {
                        warn!(endpoint, error = %e, "Delivery rejected, not retrying");
                    }
                    return Err(e);
                }
            }
        }

        Err(DeliveryError::Exhausted {
            attempts,
            last: Box::new(last_err.unwrap_or(DeliveryError::CircuitOpen)),
        })
    }

    async fn attempt(
        &self,
        cancel: &CancellationToken,
        url: &str,
        endpoint: &str,
        payload: &Payload<'_>,
    ) -> Result<(), DeliveryError> {
        let mut request_id = Uuid::new_v4().to_string();
        let ticket = self.breaker.try_acquire()?;

        let mut request = self.http.post(url).header(REQUEST_ID_HEADER, &request_id);
        request = match payload {
            Payload::Bytes { body, content_type } => request
                .header(CONTENT_TYPE, *content_type)
                .body(body.clone()),
            Payload::Form(form) => request.multipart(form.to_form()?),
        };
        if let Some(key) = &self.config.api_key {
            request = request.header(API_KEY_HEADER, key);
        }

        // Dropping the ticket on cancellation frees its breaker slot.
        let start = Instant::now();
        let sent = tokio::select! {
            _ = cancel.cancelled() => return Err(DeliveryError::Cancelled),
            r = request.send() => r,
        };

        let response = match sent {
            Ok(r) => r,
            Err(e) => {
                ticket.record(false);
                return Err(DeliveryError::Transport {
                    request_id,
                    message: format!("after {:?}: {}", start.elapsed(), e),
                });
            }
        };

        let status = response.status();
        ticket.record(!status.is_server_error());

        if let Some(server_id) = response
            .headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
        {
            request_id = server_id.to_string();
        }

        let elapsed_ms = start.elapsed().as_millis() as u64;
        let text = tokio::select! {
            _ = cancel.cancelled() => return Err(DeliveryError::Cancelled),
            t = response.text() => t.unwrap_or_default(),
        };

        if status.is_success() {
            debug!(
                %request_id,
                endpoint,
                status = status.as_u16(),
                elapsed_ms,
                "POST succeeded"
            );
            return Ok(());
        }

        if status.is_server_error() {
            return Err(DeliveryError::Server {
                request_id,
                status: status.as_u16(),
                body: text,
            });
        }

        Err(DeliveryError::Client {
            request_id,
            status: status.as_u16(),
            body: text,
        })
    }

    fn url(&self, endpoint: &str) -> String {
        let base = self.config.server_url.trim_end_matches('/');
        if endpoint.starts_with('/') {
            format!("{}{}", base, endpoint)
        } else {
            format!("{}/{}", base, endpoint)
        }
    }
}
