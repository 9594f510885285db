//! # Error Types
//!
//! Structured error handling for the pub/sub client using thiserror
//! instead of `Box<dyn Error>` patterns.

use thiserror::Error;

/// Errors surfaced by the pub/sub client
#[derive(Error, Debug)]
pub enum PubSubError {
    #[error("Connection error: {message}")]
    Connection { message: String },

    #[error("Not connected to database")]
    NotConnected,

    #[error("Query failed: {operation}: {message}")]
    Query { operation: String, message: String },

    #[error("Connect failed after {retries} retries")]
    RetryExhausted { retries: u32 },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("Database error: {0}")]
    Database(#[from] tokio_postgres::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PubSubError {
    /// Create a connection error
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Create a query error
    pub fn query(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Query {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a retry exhaustion error
    pub fn retry_exhausted(retries: u32) -> Self {
        Self::RetryExhausted { retries }
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a protocol misuse error
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }
}

/// Result type alias for pub/sub operations
pub type Result<T> = std::result::Result<T, PubSubError>;
