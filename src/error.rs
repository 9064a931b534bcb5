//! Top-level error types for Dispatchbot.

use std::sync::Arc;

/// Crate-wide result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error enum wrapping domain-specific errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Delivery(#[from] DeliveryError),

    #[error(transparent)]
    Event(#[from] EventError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Configuration loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load config from {path}: {source}")]
    Load {
        path: String,
        source: Arc<std::io::Error>,
    },

    #[error("failed to parse config {path}: {message}")]
    Parse { path: String, message: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Instance and provider lookup errors.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("instance {id} not found")]
    InstanceNotFound { id: String },

    #[error("agent provider {id} not found")]
    ProviderNotFound { id: String },

    #[error("storage backend failed: {0}")]
    Backend(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Agent provider call errors. Never retried inside the dispatcher.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("provider {provider_id} timed out after {timeout_ms}ms")]
    Timeout { provider_id: String, timeout_ms: u64 },

    #[error("provider request failed: {message}")]
    Request {
        status: Option<u16>,
        message: String,
    },

    #[error("provider returned an invalid response: {0}")]
    InvalidResponse(String),

    #[error("provider stream failed: {0}")]
    Stream(String),
}

impl ProviderError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ProviderError::Timeout { .. })
    }

    /// Map a transport error from the HTTP client.
    pub fn from_http(error: reqwest::Error, provider_id: &str, timeout_ms: u64) -> Self {
        if error.is_timeout() {
            ProviderError::Timeout {
                provider_id: provider_id.to_string(),
                timeout_ms,
            }
        } else if error.is_connect() {
            ProviderError::Unavailable(error.to_string())
        } else {
            ProviderError::Request {
                status: error.status().map(|status| status.as_u16()),
                message: error.to_string(),
            }
        }
    }
}

/// Outbound delivery errors raised after the provider already replied.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("no connector registered for channel {channel}")]
    ConnectorNotFound { channel: String },

    #[error("connector rejected message for chat {chat_id}: {message}")]
    SendFailed { chat_id: String, message: String },

    #[error("delivery channel closed")]
    Closed,
}

/// Event source errors.
#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("failed to subscribe to {kind}: {message}")]
    SubscribeFailed { kind: String, message: String },

    #[error("event source closed")]
    Closed,

    #[error("event handler failed: {0}")]
    Handler(String),
}
