//! Error types for Mail Autopilot.

use std::time::Duration;

use uuid::Uuid;

/// Configuration-related errors. Fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConfigError {
    pub(crate) fn invalid(key: &str, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            key: key.to_string(),
            message: message.into(),
        }
    }
}

/// Scoring/extraction model errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ModelError {
    #[error("Model {model} unavailable: {reason}")]
    Unavailable { model: String, reason: String },
}

/// Mailbox transport errors. Retryable.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("Mailbox fetch failed: {reason}")]
    Fetch { reason: String },

    #[error("Reply send failed on thread {thread_id}: {reason}")]
    Send { thread_id: String, reason: String },

    #[error("Mailbox fetch gave up after {attempts} attempts (last backoff {backoff:?})")]
    Exhausted { attempts: u32, backoff: Duration },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Calendar errors.
#[derive(Debug, thiserror::Error)]
pub enum CalendarError {
    #[error("Invalid time window: start {start} is not before end {end}")]
    InvalidWindow { start: String, end: String },

    #[error("Calendar event {id} not found")]
    NotFound { id: Uuid },

    #[error("Event {id} conflicts with {} existing event(s)", conflicting.len())]
    Conflict { id: Uuid, conflicting: Vec<Uuid> },

    #[error("Meeting proposal for message {message_id} has no candidate window")]
    NoCandidate { message_id: String },

    #[error("Calendar store error: {0}")]
    Store(#[from] DatabaseError),
}

/// Per-message pipeline errors.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Calendar error: {0}")]
    Calendar(#[from] CalendarError),

    #[error("History store error: {0}")]
    History(#[from] DatabaseError),

    #[error("Message parse failed: {0}")]
    Parse(String),

    #[error("Invalid command: {0}")]
    InvalidCommand(String),
}
