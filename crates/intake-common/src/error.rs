//! Error types for Intake

use thiserror::Error;

/// Result type alias for Intake operations
pub type Result<T> = std::result::Result<T, IntakeError>;

/// Main error type for Intake
#[derive(Error, Debug)]
pub enum IntakeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Chunk not found: job {job_id}, index {chunk_index}")]
    ChunkNotFound { job_id: String, chunk_index: i64 },

    #[error("Invalid strategy: {0}")]
    InvalidStrategy(String),

    #[error("Invalid status: {0}")]
    InvalidStatus(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Unknown error: {0}")]
    Unknown(String),
}
