use thiserror::Error;

/// Top-level error type for the Warden agent.
///
/// Subsystem crates define their own error types and implement
/// `From<SubsystemError> for WardenError` so that `?` works across crate
/// boundaries.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WardenError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Delivery error: {0}")]
    Delivery(String),

    #[error("Buffer error: {0}")]
    Buffer(String),

    #[error("Activity error: {0}")]
    Activity(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl From<toml::de::Error> for WardenError {
    fn from(err: toml::de::Error) -> Self {
        WardenError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for WardenError {
    fn from(err: toml::ser::Error) -> Self {
        WardenError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for WardenError {
    fn from(err: serde_json::Error) -> Self {
        WardenError::Serialization(err.to_string())
    }
}

/// A specialized `Result` type for Warden operations.
pub type Result<T> = std::result::Result<T, WardenError>;
