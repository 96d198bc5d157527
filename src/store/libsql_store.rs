//! libSQL backend — async `TaskStore` implementation.
//!
//! Supports local file and in-memory databases. Claiming is a single
//! conditional `UPDATE ... RETURNING` keyed on `status = 'pending'`, so
//! concurrent workers racing for the same task produce exactly one
//! winner; the loser's update matches zero rows.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::StoreError;
use crate::model::{Direction, MailMessage, ProcessingTask, Stage, TaskStatus};
use crate::store::migrations;
use crate::store::traits::{TaskCounts, TaskStore};

/// libSQL store.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Open(format!("Failed to create database directory: {e}")))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StoreError::Open(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| StoreError::Open(format!("Failed to create connection: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
        };
        store.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, StoreError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| StoreError::Open(format!("Failed to create in-memory database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| StoreError::Open(format!("Failed to create connection: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
        };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Build the error for a running-only update that matched no row:
    /// either the task is gone or it is no longer running.
    async fn running_update_missed(&self, id: Uuid) -> StoreError {
        match self.get_task(id).await {
            Ok(Some(task)) => StoreError::StatusConflict {
                task_id: id,
                expected: TaskStatus::Running,
                actual: task.status,
            },
            Ok(None) => StoreError::NotFound {
                entity: "task".into(),
                id: id.to_string(),
            },
            Err(e) => e,
        }
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

/// Convert `Option<String>` to libsql Value.
fn opt_text_owned(s: Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

/// Convert `Option<f64>` to libsql Value.
fn opt_real(v: Option<f64>) -> libsql::Value {
    match v {
        Some(f) => libsql::Value::Real(f),
        None => libsql::Value::Null,
    }
}

/// Map a libsql Row to a ProcessingTask.
///
/// Column order matches TASK_COLUMNS:
/// 0:id, 1:message_id, 2:stage, 3:status, 4:attempts, 5:max_attempts,
/// 6:last_error, 7:payload, 8:output, 9:run_after, 10:created_at, 11:updated_at
fn row_to_task(row: &libsql::Row) -> Result<ProcessingTask, StoreError> {
    let id_str: String = row
        .get(0)
        .map_err(|e| StoreError::Query(format!("task row id: {e}")))?;
    let message_id: String = row
        .get(1)
        .map_err(|e| StoreError::Query(format!("task row message_id: {e}")))?;
    let stage_str: String = row
        .get(2)
        .map_err(|e| StoreError::Query(format!("task row stage: {e}")))?;
    let status_str: String = row
        .get(3)
        .map_err(|e| StoreError::Query(format!("task row status: {e}")))?;
    let attempts: i64 = row.get(4).unwrap_or(0);
    let max_attempts: i64 = row.get(5).unwrap_or(0);
    let last_error: Option<String> = row.get(6).ok();
    let payload_str: Option<String> = row.get(7).ok();
    let output_str: Option<String> = row.get(8).ok();
    let run_after_str: String = row
        .get(9)
        .map_err(|e| StoreError::Query(format!("task row run_after: {e}")))?;
    let created_str: String = row
        .get(10)
        .map_err(|e| StoreError::Query(format!("task row created_at: {e}")))?;
    let updated_str: String = row
        .get(11)
        .map_err(|e| StoreError::Query(format!("task row updated_at: {e}")))?;

    let stage = Stage::parse(&stage_str)
        .ok_or_else(|| StoreError::Query(format!("unknown stage in task row: {stage_str}")))?;
    let status = TaskStatus::parse(&status_str)
        .ok_or_else(|| StoreError::Query(format!("unknown status in task row: {status_str}")))?;

    let payload = payload_str
        .as_deref()
        .and_then(|s| serde_json::from_str(s).ok())
        .unwrap_or(serde_json::Value::Null);
    let output = output_str
        .as_deref()
        .and_then(|s| serde_json::from_str(s).ok());

    Ok(ProcessingTask {
        id: Uuid::parse_str(&id_str).unwrap_or_else(|_| Uuid::nil()),
        message_id,
        stage,
        status,
        attempts: attempts.max(0) as u32,
        max_attempts: max_attempts.max(0) as u32,
        last_error,
        payload,
        output,
        run_after: parse_datetime(&run_after_str),
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

/// Map a libsql Row to a MailMessage.
///
/// Column order matches MESSAGE_COLUMNS:
/// 0:id, 1:thread_id, 2:in_reply_to, 3:references_header, 4:direction,
/// 5:sender, 6:subject, 7:body, 8:category, 9:confidence,
/// 10:has_attachments, 11:attachments, 12:needs_review, 13:plan,
/// 14:received_at, 15:created_at, 16:updated_at
fn row_to_message(row: &libsql::Row) -> Result<MailMessage, StoreError> {
    let id: String = row
        .get(0)
        .map_err(|e| StoreError::Query(format!("message row id: {e}")))?;
    let thread_id: String = row
        .get(1)
        .map_err(|e| StoreError::Query(format!("message row thread_id: {e}")))?;
    let in_reply_to: Option<String> = row.get(2).ok();
    let references: Option<String> = row.get(3).ok();
    let direction_str: String = row.get::<String>(4).unwrap_or_else(|_| "inbound".into());
    let sender: String = row
        .get(5)
        .map_err(|e| StoreError::Query(format!("message row sender: {e}")))?;
    let subject: String = row.get(6).unwrap_or_default();
    let body: String = row.get(7).unwrap_or_default();
    let category: Option<String> = row.get(8).ok();
    let confidence: Option<f64> = row.get(9).ok();
    let has_attachments: i64 = row.get(10).unwrap_or(0);
    let attachments_str: Option<String> = row.get(11).ok();
    let needs_review: i64 = row.get(12).unwrap_or(0);
    let plan_str: Option<String> = row.get(13).ok();
    let received_str: String = row
        .get(14)
        .map_err(|e| StoreError::Query(format!("message row received_at: {e}")))?;
    let created_str: String = row.get(15).unwrap_or_default();
    let updated_str: String = row.get(16).unwrap_or_default();

    let attachments: Vec<String> = attachments_str
        .as_deref()
        .and_then(|s| serde_json::from_str(s).ok())
        .unwrap_or_default();

    let plan: Option<Vec<Stage>> = match plan_str.as_deref() {
        Some(s) => match serde_json::from_str(s) {
            Ok(plan) => Some(plan),
            Err(e) => {
                tracing::warn!(message_id = %id, error = %e, "Unreadable plan column, treating as unrouted");
                None
            }
        },
        None => None,
    };

    Ok(MailMessage {
        id,
        thread_id,
        in_reply_to,
        references,
        direction: Direction::parse(&direction_str).unwrap_or(Direction::Inbound),
        sender,
        subject,
        body,
        category,
        confidence,
        has_attachments: has_attachments != 0,
        attachments,
        needs_review: needs_review != 0,
        plan,
        received_at: parse_datetime(&received_str),
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

// ── Trait implementation ────────────────────────────────────────────

const TASK_COLUMNS: &str =
    "id, message_id, stage, status, attempts, max_attempts, last_error, payload, output, run_after, created_at, updated_at";

const MESSAGE_COLUMNS: &str =
    "id, thread_id, in_reply_to, references_header, direction, sender, subject, body, category, confidence, has_attachments, attachments, needs_review, plan, received_at, created_at, updated_at";

#[async_trait]
impl TaskStore for LibSqlStore {
    async fn run_migrations(&self) -> Result<(), StoreError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Messages ────────────────────────────────────────────────────

    async fn insert_message(&self, msg: &MailMessage) -> Result<(), StoreError> {
        let conn = self.conn();
        let attachments = serde_json::to_string(&msg.attachments)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let plan = match &msg.plan {
            Some(plan) => Some(
                serde_json::to_string(plan)
                    .map_err(|e| StoreError::Serialization(e.to_string()))?,
            ),
            None => None,
        };
        let now = Utc::now().to_rfc3339();

        let result = conn
            .execute(
                "INSERT INTO messages (id, thread_id, in_reply_to, references_header, direction,
                    sender, subject, body, category, confidence, has_attachments, attachments,
                    needs_review, plan, received_at, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?16)",
                params![
                    msg.id.clone(),
                    msg.thread_id.clone(),
                    opt_text(msg.in_reply_to.as_deref()),
                    opt_text(msg.references.as_deref()),
                    msg.direction.as_str(),
                    msg.sender.clone(),
                    msg.subject.clone(),
                    msg.body.clone(),
                    opt_text(msg.category.as_deref()),
                    opt_real(msg.confidence),
                    msg.has_attachments as i64,
                    attachments,
                    msg.needs_review as i64,
                    opt_text_owned(plan),
                    msg.received_at.to_rfc3339(),
                    now,
                ],
            )
            .await;

        match result {
            Ok(_) => {
                debug!(id = %msg.id, thread_id = %msg.thread_id, "Message inserted into DB");
                Ok(())
            }
            Err(e) if e.to_string().contains("UNIQUE constraint failed") => {
                Err(StoreError::AlreadySeen(msg.id.clone()))
            }
            Err(e) => Err(StoreError::Query(format!("insert_message: {e}"))),
        }
    }

    async fn get_message(&self, id: &str) -> Result<Option<MailMessage>, StoreError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(|e| StoreError::Query(format!("get_message: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_message(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(StoreError::Query(format!("get_message: {e}"))),
        }
    }

    async fn set_classification(
        &self,
        id: &str,
        category: &str,
        confidence: f64,
        needs_review: bool,
    ) -> Result<(), StoreError> {
        let conn = self.conn();
        let now = Utc::now().to_rfc3339();
        let n = conn
            .execute(
                "UPDATE messages SET category = ?1, confidence = ?2, needs_review = ?3, updated_at = ?4 WHERE id = ?5",
                params![category, confidence, needs_review as i64, now, id],
            )
            .await
            .map_err(|e| StoreError::Query(format!("set_classification: {e}")))?;

        if n == 0 {
            return Err(StoreError::NotFound {
                entity: "message".into(),
                id: id.to_string(),
            });
        }
        debug!(id = id, category = category, confidence, "Classification recorded");
        Ok(())
    }

    async fn set_plan(&self, id: &str, plan: &[Stage]) -> Result<(), StoreError> {
        let conn = self.conn();
        let plan_json =
            serde_json::to_string(plan).map_err(|e| StoreError::Serialization(e.to_string()))?;
        let now = Utc::now().to_rfc3339();
        let n = conn
            .execute(
                "UPDATE messages SET plan = ?1, updated_at = ?2 WHERE id = ?3",
                params![plan_json, now, id],
            )
            .await
            .map_err(|e| StoreError::Query(format!("set_plan: {e}")))?;

        if n == 0 {
            return Err(StoreError::NotFound {
                entity: "message".into(),
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn set_needs_review(&self, id: &str, needs_review: bool) -> Result<(), StoreError> {
        let conn = self.conn();
        let now = Utc::now().to_rfc3339();
        let n = conn
            .execute(
                "UPDATE messages SET needs_review = ?1, updated_at = ?2 WHERE id = ?3",
                params![needs_review as i64, now, id],
            )
            .await
            .map_err(|e| StoreError::Query(format!("set_needs_review: {e}")))?;

        if n == 0 {
            return Err(StoreError::NotFound {
                entity: "message".into(),
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn count_messages(&self) -> Result<i64, StoreError> {
        let conn = self.conn();
        let mut rows = conn
            .query("SELECT COUNT(*) FROM messages", ())
            .await
            .map_err(|e| StoreError::Query(format!("count_messages: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(row.get(0).unwrap_or(0)),
            _ => Ok(0),
        }
    }

    // ── Tasks ───────────────────────────────────────────────────────

    async fn create_task(
        &self,
        message_id: &str,
        stage: Stage,
        payload: &serde_json::Value,
        max_attempts: u32,
    ) -> Result<Option<ProcessingTask>, StoreError> {
        let conn = self.conn();
        let now = Utc::now();
        let payload_str = serde_json::to_string(payload)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let id = Uuid::new_v4();

        let n = conn
            .execute(
                "INSERT OR IGNORE INTO tasks (id, message_id, stage, status, attempts, max_attempts,
                    payload, run_after, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 'pending', 0, ?4, ?5, ?6, ?6, ?6)",
                params![
                    id.to_string(),
                    message_id,
                    stage.as_str(),
                    max_attempts as i64,
                    payload_str,
                    now.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("create_task: {e}")))?;

        if n == 0 {
            debug!(message_id, stage = %stage, "Task already exists, skipping create");
            return Ok(None);
        }

        debug!(task_id = %id, message_id, stage = %stage, "Task created");
        Ok(Some(ProcessingTask {
            id,
            message_id: message_id.to_string(),
            stage,
            status: TaskStatus::Pending,
            attempts: 0,
            max_attempts,
            last_error: None,
            payload: payload.clone(),
            output: None,
            run_after: now,
            created_at: now,
            updated_at: now,
        }))
    }

    async fn claim_next_task(&self) -> Result<Option<ProcessingTask>, StoreError> {
        let conn = self.conn();
        let now = Utc::now().to_rfc3339();

        // The inner SELECT may race between workers; the outer
        // `status = 'pending'` guard makes the loser match zero rows.
        let mut rows = conn
            .query(
                &format!(
                    "UPDATE tasks SET status = 'running', updated_at = ?1
                     WHERE id = (
                         SELECT id FROM tasks
                         WHERE status = 'pending' AND run_after <= ?1
                         ORDER BY created_at ASC, id ASC
                         LIMIT 1
                     ) AND status = 'pending'
                     RETURNING {TASK_COLUMNS}"
                ),
                params![now],
            )
            .await
            .map_err(|e| StoreError::Query(format!("claim_next_task: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let task = row_to_task(&row)?;
                debug!(task_id = %task.id, stage = %task.stage, "Task claimed");
                Ok(Some(task))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(StoreError::Query(format!("claim_next_task: {e}"))),
        }
    }

    async fn complete_task(&self, id: Uuid, output: &serde_json::Value) -> Result<(), StoreError> {
        let conn = self.conn();
        let output_str = serde_json::to_string(output)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let now = Utc::now().to_rfc3339();
        let n = conn
            .execute(
                "UPDATE tasks SET status = 'success', output = ?1, last_error = NULL, updated_at = ?2
                 WHERE id = ?3 AND status = 'running'",
                params![output_str, now, id.to_string()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("complete_task: {e}")))?;

        if n == 0 {
            return Err(self.running_update_missed(id).await);
        }
        debug!(task_id = %id, "Task completed");
        Ok(())
    }

    async fn fail_task(
        &self,
        id: Uuid,
        error: &str,
        retry_delay: Duration,
    ) -> Result<TaskStatus, StoreError> {
        let conn = self.conn();
        let now = Utc::now();
        let run_after = now + chrono::Duration::milliseconds(retry_delay.as_millis() as i64);

        // CASE arms evaluate against the pre-update attempt count.
        let mut rows = conn
            .query(
                "UPDATE tasks SET
                    attempts = attempts + 1,
                    status = CASE WHEN attempts + 1 >= max_attempts THEN 'dlq' ELSE 'pending' END,
                    last_error = ?2,
                    run_after = CASE WHEN attempts + 1 >= max_attempts THEN run_after ELSE ?3 END,
                    updated_at = ?1
                 WHERE id = ?4 AND status = 'running'
                 RETURNING status",
                params![
                    now.to_rfc3339(),
                    error,
                    run_after.to_rfc3339(),
                    id.to_string(),
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("fail_task: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let status_str: String = row
                    .get(0)
                    .map_err(|e| StoreError::Query(format!("fail_task status: {e}")))?;
                let status = TaskStatus::parse(&status_str).ok_or_else(|| {
                    StoreError::Query(format!("unknown status after fail: {status_str}"))
                })?;
                debug!(task_id = %id, status = %status, "Task failure recorded");
                Ok(status)
            }
            Ok(None) => Err(self.running_update_missed(id).await),
            Err(e) => Err(StoreError::Query(format!("fail_task: {e}"))),
        }
    }

    async fn fail_task_fatal(&self, id: Uuid, error: &str) -> Result<(), StoreError> {
        let conn = self.conn();
        let now = Utc::now().to_rfc3339();
        let n = conn
            .execute(
                "UPDATE tasks SET attempts = attempts + 1, status = 'dlq', last_error = ?1, updated_at = ?2
                 WHERE id = ?3 AND status = 'running'",
                params![error, now, id.to_string()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("fail_task_fatal: {e}")))?;

        if n == 0 {
            return Err(self.running_update_missed(id).await);
        }
        debug!(task_id = %id, "Task dead-lettered (fatal)");
        Ok(())
    }

    async fn release_task(&self, id: Uuid, defer: Duration) -> Result<(), StoreError> {
        let conn = self.conn();
        let now = Utc::now();
        let run_after = now + chrono::Duration::milliseconds(defer.as_millis() as i64);
        let n = conn
            .execute(
                "UPDATE tasks SET status = 'pending', run_after = ?1, updated_at = ?2
                 WHERE id = ?3 AND status = 'running'",
                params![run_after.to_rfc3339(), now.to_rfc3339(), id.to_string()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("release_task: {e}")))?;

        if n == 0 {
            return Err(self.running_update_missed(id).await);
        }
        debug!(task_id = %id, "Task released without attempt");
        Ok(())
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<ProcessingTask>, StoreError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("get_task: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_task(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(StoreError::Query(format!("get_task: {e}"))),
        }
    }

    async fn get_tasks_for_message(
        &self,
        message_id: &str,
    ) -> Result<Vec<ProcessingTask>, StoreError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks WHERE message_id = ?1 ORDER BY created_at ASC, id ASC"
                ),
                params![message_id],
            )
            .await
            .map_err(|e| StoreError::Query(format!("get_tasks_for_message: {e}")))?;

        let mut tasks = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_task(&row) {
                Ok(task) => tasks.push(task),
                Err(e) => {
                    tracing::warn!("Skipping task row: {e}");
                }
            }
        }
        Ok(tasks)
    }

    async fn get_dlq_tasks(&self, limit: usize) -> Result<Vec<ProcessingTask>, StoreError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks WHERE status = 'dlq' ORDER BY updated_at DESC LIMIT ?1"
                ),
                params![limit as i64],
            )
            .await
            .map_err(|e| StoreError::Query(format!("get_dlq_tasks: {e}")))?;

        let mut tasks = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_task(&row) {
                Ok(task) => tasks.push(task),
                Err(e) => {
                    tracing::warn!("Skipping dlq task row: {e}");
                }
            }
        }
        Ok(tasks)
    }

    async fn get_task_counts(&self) -> Result<TaskCounts, StoreError> {
        let conn = self.conn();
        let mut rows = conn
            .query("SELECT status, COUNT(*) FROM tasks GROUP BY status", ())
            .await
            .map_err(|e| StoreError::Query(format!("get_task_counts: {e}")))?;

        let mut counts = TaskCounts::default();
        while let Ok(Some(row)) = rows.next().await {
            let status: String = row.get(0).unwrap_or_default();
            let count: i64 = row.get(1).unwrap_or(0);
            match status.as_str() {
                "pending" => counts.pending = count,
                "running" => counts.running = count,
                "success" => counts.success = count,
                "failed" => counts.failed = count,
                "dlq" => counts.dlq = count,
                _ => {}
            }
        }
        Ok(counts)
    }

    async fn release_stale_running(&self, older_than: Duration) -> Result<usize, StoreError> {
        let conn = self.conn();
        let now = Utc::now();
        let cutoff = now - chrono::Duration::milliseconds(older_than.as_millis() as i64);

        // A lost execution still spent an attempt; tasks out of budget go
        // straight to the dead-letter queue.
        let n = conn
            .execute(
                "UPDATE tasks SET
                    attempts = attempts + 1,
                    status = CASE WHEN attempts + 1 >= max_attempts THEN 'dlq' ELSE 'pending' END,
                    last_error = 'stage execution lost (worker crash or shutdown)',
                    updated_at = ?1
                 WHERE status = 'running' AND updated_at <= ?2",
                params![now.to_rfc3339(), cutoff.to_rfc3339()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("release_stale_running: {e}")))?;

        if n > 0 {
            info!(count = n, "Released stale running tasks");
        }
        Ok(n as usize)
    }
}
