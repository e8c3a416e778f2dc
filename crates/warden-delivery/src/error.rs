//! Error taxonomy for collector delivery.

use warden_core::error::WardenError;

/// Outcome of a failed delivery attempt or call.
///
/// Variants split into retryable (`Transport`, `Server`, `CircuitOpen`) and
/// terminal ones; see [`DeliveryError::is_retryable`].
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("Failed to serialize payload: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Failed to read request body: {0}")]
    Body(#[from] std::io::Error),

    #[error("Failed to build HTTP client: {0}")]
    Setup(String),

    #[error("Invalid multipart form: {0}")]
    Form(String),

    #[error("[request_id={request_id}] request failed: {message}")]
    Transport { request_id: String, message: String },

    #[error("[request_id={request_id}] server error {status}: {body}")]
    Server {
        request_id: String,
        status: u16,
        body: String,
    },

    #[error("[request_id={request_id}] client error {status}: {body}")]
    Client {
        request_id: String,
        status: u16,
        body: String,
    },

    #[error("Circuit breaker is open")]
    CircuitOpen,

    #[error("Delivery cancelled")]
    Cancelled,

    #[error("Request failed after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        last: Box<DeliveryError>,
    },

    #[error("Ping failed: {0}")]
    Ping(String),
}

impl DeliveryError {
    /// Whether another attempt could succeed.
    ///
    /// Client errors and serialization failures are never retried: the same
    /// request would be rejected again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DeliveryError::Transport { .. }
                | DeliveryError::Server { .. }
                | DeliveryError::CircuitOpen
        )
    }

    /// Whether the failure was caused by cancellation rather than the collector.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, DeliveryError::Cancelled)
    }

    /// HTTP status carried by the error, if the collector answered.
    pub fn status(&self) -> Option<u16> {
        match self {
            DeliveryError::Server { status, .. } | DeliveryError::Client { status, .. } => {
                Some(*status)
            }
            DeliveryError::Exhausted { last, .. } => last.status(),
            _ => None,
        }
    }
}

impl From<DeliveryError> for WardenError {
    fn from(err: DeliveryError) -> Self {
        match err {
            DeliveryError::Cancelled => WardenError::ShuttingDown,
            DeliveryError::Serialize(e) => WardenError::Serialization(e.to_string()),
            other => WardenError::Delivery(other.to_string()),
        }
    }
}
