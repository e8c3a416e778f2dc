//! Warden Delivery crate - reliable transport to the telemetry collector.
//!
//! Provides the retrying [`DeliveryClient`] (JSON and multipart POST, health
//! ping), the [`CircuitBreaker`] state machine gating each request, and
//! [`MultipartForm`] for screenshot uploads.

pub mod breaker;
pub mod client;
pub mod error;
pub mod multipart;

pub use breaker::{BreakerConfig, BreakerState, CircuitBreaker, Ticket};
pub use client::{DeliveryClient, DeliveryConfig};
pub use error::DeliveryError;
pub use multipart::MultipartForm;
