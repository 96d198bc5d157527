//! In-process stage handlers: entry bookkeeping and the terminal
//! review/escalate/archive stages that need no external service.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::error::HandlerError;
use crate::executor::handler::{HandlerOutcome, StageContext, StageHandler};
use crate::model::Stage;
use crate::store::TaskStore;

// ── Ingest ──────────────────────────────────────────────────────────

/// Entry stage. The spool poller has already persisted the message and
/// built the task payload; this stage verifies the two agree and hands
/// the pipeline its first success so classification can be scheduled.
pub struct IngestHandler;

#[async_trait]
impl StageHandler for IngestHandler {
    fn stage(&self) -> Stage {
        Stage::Ingest
    }

    async fn execute(&self, ctx: &StageContext) -> Result<HandlerOutcome, HandlerError> {
        let payload_id = ctx
            .task
            .payload
            .get("message_id")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        if payload_id != ctx.message.id {
            return Ok(HandlerOutcome::Fatal {
                reason: format!(
                    "task payload names message {payload_id:?} but is attached to {:?}",
                    ctx.message.id
                ),
            });
        }

        Ok(HandlerOutcome::Success {
            output: serde_json::json!({
                "ingested": true,
                "thread_id": ctx.message.thread_id,
                "has_attachments": ctx.message.has_attachments,
                "attachment_count": ctx.message.attachments.len(),
            }),
        })
    }
}

// ── Review ──────────────────────────────────────────────────────────

/// Flags the message for a human. Everything after this stage is a
/// person reading a queue, so the handler only has to set the flag.
pub struct ReviewHandler {
    store: Arc<dyn TaskStore>,
}

impl ReviewHandler {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl StageHandler for ReviewHandler {
    fn stage(&self) -> Stage {
        Stage::Review
    }

    async fn execute(&self, ctx: &StageContext) -> Result<HandlerOutcome, HandlerError> {
        if let Err(e) = self.store.set_needs_review(&ctx.message.id, true).await {
            return Ok(HandlerOutcome::Retry {
                reason: format!("failed to flag message for review: {e}"),
            });
        }
        info!(message_id = %ctx.message.id, "Message queued for human review");
        Ok(HandlerOutcome::Success {
            output: serde_json::json!({ "queued_for_review": true }),
        })
    }
}

// ── Escalate ────────────────────────────────────────────────────────

/// Complaint escalation. Surfaces the message loudly in the logs; the
/// notify stage or a human picks it up from there.
pub struct EscalateHandler;

#[async_trait]
impl StageHandler for EscalateHandler {
    fn stage(&self) -> Stage {
        Stage::Escalate
    }

    async fn execute(&self, ctx: &StageContext) -> Result<HandlerOutcome, HandlerError> {
        warn!(
            message_id = %ctx.message.id,
            sender = %ctx.message.sender,
            subject = %ctx.message.subject,
            "Complaint escalated"
        );
        Ok(HandlerOutcome::Success {
            output: serde_json::json!({ "escalated": true }),
        })
    }
}

// ── Archive ─────────────────────────────────────────────────────────

/// Terminal stage for messages nobody needs to act on. The message row
/// itself is the archive; this just closes the plan.
pub struct ArchiveHandler;

#[async_trait]
impl StageHandler for ArchiveHandler {
    fn stage(&self) -> Stage {
        Stage::Archive
    }

    async fn execute(&self, ctx: &StageContext) -> Result<HandlerOutcome, HandlerError> {
        info!(message_id = %ctx.message.id, "Message archived");
        Ok(HandlerOutcome::Success {
            output: serde_json::json!({ "archived": true }),
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use uuid::Uuid;

    use super::*;
    use crate::model::{Direction, MailMessage, ProcessingTask, TaskStatus};
    use crate::store::LibSqlStore;

    fn message(id: &str) -> MailMessage {
        let now = Utc::now();
        MailMessage {
            id: id.to_string(),
            thread_id: id.to_string(),
            in_reply_to: None,
            references: None,
            direction: Direction::Inbound,
            sender: "novak@strojirna.cz".to_string(),
            subject: "Reklamace dodávky".to_string(),
            body: "Dobrý den, dodané díly neodpovídají výkresu.".to_string(),
            category: None,
            confidence: None,
            has_attachments: false,
            attachments: Vec::new(),
            needs_review: false,
            plan: None,
            received_at: now,
            created_at: now,
            updated_at: now,
        }
    }

    fn context(stage: Stage, msg: MailMessage, payload: serde_json::Value) -> StageContext {
        let now = Utc::now();
        StageContext {
            task: ProcessingTask {
                id: Uuid::new_v4(),
                message_id: msg.id.clone(),
                stage,
                status: TaskStatus::Running,
                attempts: 0,
                max_attempts: 3,
                last_error: None,
                payload,
                output: None,
                run_after: now,
                created_at: now,
                updated_at: now,
            },
            message: msg,
        }
    }

    #[tokio::test]
    async fn ingest_reports_message_summary() {
        let msg = message("msg-1@strojirna.cz");
        let ctx = context(
            Stage::Ingest,
            msg,
            serde_json::json!({ "message_id": "msg-1@strojirna.cz" }),
        );

        let outcome = IngestHandler.execute(&ctx).await.unwrap();
        match outcome {
            HandlerOutcome::Success { output } => {
                assert_eq!(output["ingested"], true);
                assert_eq!(output["thread_id"], "msg-1@strojirna.cz");
            }
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn ingest_rejects_mismatched_payload() {
        let msg = message("msg-1@strojirna.cz");
        let ctx = context(
            Stage::Ingest,
            msg,
            serde_json::json!({ "message_id": "someone-else@strojirna.cz" }),
        );

        let outcome = IngestHandler.execute(&ctx).await.unwrap();
        assert!(matches!(outcome, HandlerOutcome::Fatal { .. }));
    }

    #[tokio::test]
    async fn review_flags_the_message() {
        let store = Arc::new(LibSqlStore::new_memory().await.unwrap());
        let msg = message("msg-review@strojirna.cz");
        store.insert_message(&msg).await.unwrap();

        let handler = ReviewHandler::new(store.clone());
        let ctx = context(Stage::Review, msg, serde_json::json!({}));
        let outcome = handler.execute(&ctx).await.unwrap();

        assert!(matches!(outcome, HandlerOutcome::Success { .. }));
        let stored = store
            .get_message("msg-review@strojirna.cz")
            .await
            .unwrap()
            .unwrap();
        assert!(stored.needs_review);
    }

    #[tokio::test]
    async fn escalate_and_archive_always_succeed() {
        let msg = message("msg-terminal@strojirna.cz");
        let ctx = context(Stage::Escalate, msg.clone(), serde_json::json!({}));
        assert!(matches!(
            EscalateHandler.execute(&ctx).await.unwrap(),
            HandlerOutcome::Success { .. }
        ));

        let ctx = context(Stage::Archive, msg, serde_json::json!({}));
        assert!(matches!(
            ArchiveHandler.execute(&ctx).await.unwrap(),
            HandlerOutcome::Success { .. }
        ));
    }
}
