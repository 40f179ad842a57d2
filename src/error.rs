//! Error types for the support agent orchestrator

use crate::capabilities::CapabilityError;
use thiserror::Error;

/// Result type alias for orchestrator operations
pub type Result<T> = std::result::Result<T, OrchestrationError>;

#[derive(Error, Debug)]
pub enum OrchestrationError {

    // =============================
    // Boundary Errors
    // =============================

    /// Malformed or empty knowledge base. Fatal to the build call only.
    #[error("Knowledge graph build error: {0}")]
    Build(String),

    /// Persisted session state could not be deserialized.
    #[error("Session state corrupt for {session_id}: {reason}")]
    SessionCorrupt { session_id: String, reason: String },

    // =============================
    // Recoverable Errors
    // =============================

    #[error("Decision oracle unavailable: {0}")]
    OracleUnavailable(String),

    #[error(transparent)]
    Capability(#[from] CapabilityError),

    #[error("Retrieval error: {0}")]
    Retrieval(String),

    // =============================
    // Infrastructure Errors
    // =============================

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("State persistence error: {0}")]
    State(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // =============================
    // External Library Conversions
    // =============================

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("SQL error: {0}")]
    Sql(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
