//! Error taxonomy for pipeline stages.
//!
//! Stage code classifies every failure so the workers can decide between
//! retrying (transient), dead-lettering (permanent) and stopping (fatal).
//! Application-level flows (CLI, config, startup) use `anyhow` instead.

use std::time::Duration;

use crate::object_store::ObjectStoreError;

/// Result alias for stage operations.
pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

/// How a failure should be handled by the consuming worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Network blips, throttling, timeouts. Retry with backoff.
    Transient,
    /// Bad input for this item. Log and dead-letter; do not retry.
    Permanent,
    /// Misconfiguration or missing permissions. Not recoverable at runtime.
    Fatal,
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("transient failure in {operation}: {message}")]
    Transient { operation: String, message: String },

    #[error("permanent failure in {operation}: {message}")]
    Permanent { operation: String, message: String },

    #[error("{operation} timed out after {elapsed:?}")]
    Timeout {
        operation: String,
        elapsed: Duration,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("failed to decode {what}: {source}")]
    Decode {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    ObjectStore(#[from] ObjectStoreError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl PipelineError {
    pub fn transient(operation: impl Into<String>, message: impl ToString) -> Self {
        Self::Transient {
            operation: operation.into(),
            message: message.to_string(),
        }
    }

    pub fn permanent(operation: impl Into<String>, message: impl ToString) -> Self {
        Self::Permanent {
            operation: operation.into(),
            message: message.to_string(),
        }
    }

    pub fn decode(what: &'static str, source: serde_json::Error) -> Self {
        Self::Decode { what, source }
    }

    /// Classify an HTTP status from an upstream dependency.
    pub fn from_status(operation: impl Into<String>, status: u16, body: &str) -> Self {
        let message = format!(
            "HTTP {}: {}",
            status,
            body.chars().take(300).collect::<String>()
        );
        if status == 408 || status == 429 || status >= 500 {
            Self::transient(operation, message)
        } else {
            Self::permanent(operation, message)
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            PipelineError::Transient { .. } | PipelineError::Timeout { .. } => {
                ErrorClass::Transient
            }
            PipelineError::Permanent { .. } | PipelineError::Decode { .. } => {
                ErrorClass::Permanent
            }
            PipelineError::Config(_) => ErrorClass::Fatal,
            PipelineError::ObjectStore(e) => e.class(),
            PipelineError::Database(e) => match e {
                sqlx::Error::Configuration(_) | sqlx::Error::Migrate(_) => ErrorClass::Fatal,
                sqlx::Error::Decode(_) | sqlx::Error::ColumnDecode { .. } => {
                    ErrorClass::Permanent
                }
                _ => ErrorClass::Transient,
            },
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}
