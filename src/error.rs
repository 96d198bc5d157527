//! Error types for mailroom.

use std::time::Duration;

use uuid::Uuid;

use crate::model::{Stage, TaskStatus};

/// Top-level error type for the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Ingest error: {0}")]
    Ingest(#[from] IngestError),

    #[error("Handler error: {0}")]
    Handler(#[from] HandlerError),

    #[error("Executor error: {0}")]
    Executor(#[from] ExecutorError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Task/message store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Failed to open database: {0}")]
    Open(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Message {0} already ingested")]
    AlreadySeen(String),

    #[error("Task {task_id} is {actual}, expected {expected}")]
    StatusConflict {
        task_id: Uuid,
        expected: TaskStatus,
        actual: TaskStatus,
    },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Mail ingestion errors.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("Failed to parse message: {0}")]
    Parse(String),

    #[error("Spool error: {0}")]
    Spool(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Stage handler errors. These are treated as retryable by the executor;
/// handlers signal non-retryable input problems via `HandlerOutcome::Fatal`.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("Stage {stage} request failed: {reason}")]
    RequestFailed { stage: Stage, reason: String },

    #[error("Invalid response for stage {stage}: {reason}")]
    InvalidResponse { stage: Stage, reason: String },

    #[error("SMTP send failed: {0}")]
    Smtp(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Executor errors.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("No handler registered for stage {0}")]
    HandlerNotFound(Stage),

    #[error("Stage {stage} timed out after {timeout:?}")]
    Timeout { stage: Stage, timeout: Duration },

    #[error("Task {task_id} references unknown message {message_id}")]
    OrphanTask { task_id: Uuid, message_id: String },
}

/// Result type alias for the pipeline.
pub type Result<T> = std::result::Result<T, Error>;
