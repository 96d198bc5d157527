//! `TaskStore` trait — single async interface for message and task
//! persistence. The executor and ingestion agent depend only on this,
//! never on the concrete backend.

use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::StoreError;
use crate::model::{MailMessage, ProcessingTask, Stage, TaskStatus};

/// Per-status task counts, for the observability surface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskCounts {
    pub pending: i64,
    pub running: i64,
    pub success: i64,
    pub failed: i64,
    pub dlq: i64,
}

/// Backend-agnostic store covering messages and processing tasks.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), StoreError>;

    // ── Messages ────────────────────────────────────────────────────

    /// Insert a newly ingested message. Fails with
    /// [`StoreError::AlreadySeen`] if the message id was ingested before;
    /// re-delivery of the same message must not create new work.
    async fn insert_message(&self, msg: &MailMessage) -> Result<(), StoreError>;

    /// Get a message by id.
    async fn get_message(&self, id: &str) -> Result<Option<MailMessage>, StoreError>;

    /// Record the classification result on the message.
    async fn set_classification(
        &self,
        id: &str,
        category: &str,
        confidence: f64,
        needs_review: bool,
    ) -> Result<(), StoreError>;

    /// Persist the routed stage plan. `plan` may be empty; an empty plan
    /// is distinct from an unrouted message.
    async fn set_plan(&self, id: &str, plan: &[Stage]) -> Result<(), StoreError>;

    /// Flag (or unflag) a message for human review.
    async fn set_needs_review(&self, id: &str, needs_review: bool) -> Result<(), StoreError>;

    /// Total number of ingested messages.
    async fn count_messages(&self) -> Result<i64, StoreError>;

    // ── Tasks ───────────────────────────────────────────────────────

    /// Create a pending task for (message, stage). At most one task row
    /// exists per pair; if one already exists this is a no-op returning
    /// `None`, which makes plan advancement idempotent.
    async fn create_task(
        &self,
        message_id: &str,
        stage: Stage,
        payload: &serde_json::Value,
        max_attempts: u32,
    ) -> Result<Option<ProcessingTask>, StoreError>;

    /// Atomically claim the oldest claimable pending task (status pending,
    /// `run_after` in the past), flipping it to running. Of any number of
    /// concurrent claimants, exactly one receives a given task.
    async fn claim_next_task(&self) -> Result<Option<ProcessingTask>, StoreError>;

    /// Mark a running task successful and store the handler output.
    async fn complete_task(&self, id: Uuid, output: &serde_json::Value) -> Result<(), StoreError>;

    /// Record a failed execution: the attempt counter goes up, and the
    /// task either becomes pending again (claimable after `retry_delay`)
    /// or moves to the dead-letter queue once the budget is spent.
    /// Returns the resulting status.
    async fn fail_task(
        &self,
        id: Uuid,
        error: &str,
        retry_delay: Duration,
    ) -> Result<TaskStatus, StoreError>;

    /// Dead-letter a running task immediately, skipping the remaining
    /// retry budget. Used for non-retryable input failures.
    async fn fail_task_fatal(&self, id: Uuid, error: &str) -> Result<(), StoreError>;

    /// Return a claimed task to pending without consuming an attempt.
    /// Used when a circuit breaker rejects execution before the handler
    /// ran; `defer` pushes `run_after` forward so workers do not spin on
    /// a task whose dependency is down.
    async fn release_task(&self, id: Uuid, defer: Duration) -> Result<(), StoreError>;

    /// Get a task by id.
    async fn get_task(&self, id: Uuid) -> Result<Option<ProcessingTask>, StoreError>;

    /// All tasks for a message, oldest first.
    async fn get_tasks_for_message(
        &self,
        message_id: &str,
    ) -> Result<Vec<ProcessingTask>, StoreError>;

    /// Dead-lettered tasks, most recent first.
    async fn get_dlq_tasks(&self, limit: usize) -> Result<Vec<ProcessingTask>, StoreError>;

    /// Task counts per status.
    async fn get_task_counts(&self) -> Result<TaskCounts, StoreError>;

    /// Fail running tasks whose last update is older than `older_than`
    /// back into the retry/dead-letter path. The crashed execution counts
    /// as an attempt. Returns the number of tasks released.
    async fn release_stale_running(&self, older_than: Duration) -> Result<usize, StoreError>;
}
