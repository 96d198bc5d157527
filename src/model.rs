//! Core data model — stages, task state machine, message records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Stages ──────────────────────────────────────────────────────────

/// A processing stage. Closed vocabulary — plans are built from these,
/// never from free-form strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Initial intake of a raw message.
    Ingest,
    /// Classification of the message into a business category.
    Classify,
    /// Structured field extraction from the email body.
    ParseEmail,
    /// Text recognition on scanned attachments.
    Ocr,
    /// Content analysis of extracted documents.
    Analyze,
    /// Creation/update of the order record in the accounting system.
    OrchestrateOrder,
    /// Price calculation.
    Calculate,
    /// Offer document preparation.
    Offer,
    /// Attachment extraction and preparation.
    ProcessAttachments,
    /// Automatic price calculation for inquiries.
    AutoCalculate,
    /// Offer generation for inquiries.
    GenerateOffer,
    /// Hand-off to a human reviewer.
    Review,
    /// Escalation to an operator (complaints).
    Escalate,
    /// Archival without further processing.
    Archive,
    /// Outbound notification.
    Notify,
}

impl Stage {
    /// Stable string form, matching the serde representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ingest => "ingest",
            Self::Classify => "classify",
            Self::ParseEmail => "parse_email",
            Self::Ocr => "ocr",
            Self::Analyze => "analyze",
            Self::OrchestrateOrder => "orchestrate_order",
            Self::Calculate => "calculate",
            Self::Offer => "offer",
            Self::ProcessAttachments => "process_attachments",
            Self::AutoCalculate => "auto_calculate",
            Self::GenerateOffer => "generate_offer",
            Self::Review => "review",
            Self::Escalate => "escalate",
            Self::Archive => "archive",
            Self::Notify => "notify",
        }
    }

    /// Parse a stage from its string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ingest" => Some(Self::Ingest),
            "classify" => Some(Self::Classify),
            "parse_email" => Some(Self::ParseEmail),
            "ocr" => Some(Self::Ocr),
            "analyze" => Some(Self::Analyze),
            "orchestrate_order" => Some(Self::OrchestrateOrder),
            "calculate" => Some(Self::Calculate),
            "offer" => Some(Self::Offer),
            "process_attachments" => Some(Self::ProcessAttachments),
            "auto_calculate" => Some(Self::AutoCalculate),
            "generate_offer" => Some(Self::GenerateOffer),
            "review" => Some(Self::Review),
            "escalate" => Some(Self::Escalate),
            "archive" => Some(Self::Archive),
            "notify" => Some(Self::Notify),
            _ => None,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ── Categories ──────────────────────────────────────────────────────

/// Business category assigned by classification.
///
/// Labels come back from the classifier as strings; unknown labels parse
/// to `None` and are kept raw on the message record for audit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    /// Inquiry / request for quotation.
    Poptavka,
    /// Purchase order.
    Objednavka,
    /// Invoice.
    Faktura,
    /// Question about an existing order.
    InformaceZakazka,
    /// Complaint.
    Reklamace,
    /// Commercial bulk mail.
    ObchodniSdeleni,
    /// General question.
    Dotaz,
    /// Attachment-only message.
    Priloha,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Poptavka => "poptavka",
            Self::Objednavka => "objednavka",
            Self::Faktura => "faktura",
            Self::InformaceZakazka => "informace_zakazka",
            Self::Reklamace => "reklamace",
            Self::ObchodniSdeleni => "obchodni_sdeleni",
            Self::Dotaz => "dotaz",
            Self::Priloha => "priloha",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "poptavka" => Some(Self::Poptavka),
            "objednavka" => Some(Self::Objednavka),
            "faktura" => Some(Self::Faktura),
            "informace_zakazka" => Some(Self::InformaceZakazka),
            "reklamace" => Some(Self::Reklamace),
            "obchodni_sdeleni" => Some(Self::ObchodniSdeleni),
            "dotaz" => Some(Self::Dotaz),
            "priloha" => Some(Self::Priloha),
            _ => None,
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ── Task state machine ──────────────────────────────────────────────

/// Status of a processing task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting to be claimed (initial, or re-queued for retry).
    Pending,
    /// Claimed by a worker; execution in flight.
    Running,
    /// Handler completed successfully. Terminal.
    Success,
    /// Last execution failed; retry or dead-letter decision pending.
    Failed,
    /// Retry budget exhausted or fatal input. Terminal, operator-only.
    Dlq,
}

impl TaskStatus {
    /// Check if this status allows transitioning to another status.
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        use TaskStatus::*;

        matches!(
            (self, target),
            // From Pending
            (Pending, Running) |
            // From Running (success, failure, or released back un-attempted)
            (Running, Success) | (Running, Failed) | (Running, Pending) | (Running, Dlq) |
            // From Failed (retry while budget remains, else dead-letter)
            (Failed, Pending) | (Failed, Dlq)
        )
    }

    /// Check if this is a terminal status. Dead-lettered tasks are never
    /// revived automatically; re-queueing them is an operator action.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Dlq)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Dlq => "dlq",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            "dlq" => Some(Self::Dlq),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single unit of pipeline work: one stage applied to one message.
///
/// At most one task row exists per (message, stage) pair; retries reuse
/// the row rather than creating a new one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingTask {
    /// Unique task ID.
    pub id: Uuid,
    /// The message this task operates on.
    pub message_id: String,
    /// The stage to execute.
    pub stage: Stage,
    /// Current status.
    pub status: TaskStatus,
    /// Failed executions so far, counted against `max_attempts`.
    pub attempts: u32,
    /// Retry budget.
    pub max_attempts: u32,
    /// Error from the most recent failed attempt.
    pub last_error: Option<String>,
    /// Handler input.
    pub payload: serde_json::Value,
    /// Handler output, set on success.
    pub output: Option<serde_json::Value>,
    /// Earliest instant the task may be claimed (retry backoff gate).
    pub run_after: DateTime<Utc>,
    /// When the task was created.
    pub created_at: DateTime<Utc>,
    /// When the task was last updated.
    pub updated_at: DateTime<Utc>,
}

// ── Messages ────────────────────────────────────────────────────────

/// Direction of a mail message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "inbound" => Some(Self::Inbound),
            "outbound" => Some(Self::Outbound),
            _ => None,
        }
    }
}

/// A persisted mail message and its pipeline bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailMessage {
    /// RFC 822 Message-ID, or a generated `gen-<uuid>` when absent.
    /// Unique; duplicate ingestion is rejected on this key.
    pub id: String,
    /// Conversation thread this message belongs to. Assigned exactly once
    /// at ingest; a thread root carries its own id here.
    pub thread_id: String,
    /// Raw In-Reply-To header value, if present.
    pub in_reply_to: Option<String>,
    /// Raw References header value, if present.
    pub references: Option<String>,
    pub direction: Direction,
    pub sender: String,
    pub subject: String,
    /// Plain-text body.
    pub body: String,
    /// Raw classification label. `None` until classified; unknown labels
    /// are kept verbatim (see `Category::parse`).
    pub category: Option<String>,
    /// Classifier confidence in [0, 1]. `None` until classified.
    pub confidence: Option<f64>,
    pub has_attachments: bool,
    /// Sanitized attachment filenames.
    pub attachments: Vec<String>,
    /// Set by classification or a reviewer; forces the review route.
    pub needs_review: bool,
    /// Routed stage plan. `None` until routing ran; `Some(vec![])` means
    /// routing ran and produced no stages.
    pub plan: Option<Vec<Stage>>,
    pub received_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MailMessage {
    /// Parsed category, if the stored label is a known one.
    pub fn parsed_category(&self) -> Option<Category> {
        self.category.as_deref().and_then(Category::parse)
    }

    /// Position of `stage` in the routed plan, if routing ran.
    pub fn plan_position(&self, stage: Stage) -> Option<usize> {
        self.plan.as_ref()?.iter().position(|s| *s == stage)
    }

    /// The stage after `stage` in the routed plan, if any.
    pub fn next_stage_after(&self, stage: Stage) -> Option<Stage> {
        let plan = self.plan.as_ref()?;
        let pos = plan.iter().position(|s| *s == stage)?;
        plan.get(pos + 1).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_str_roundtrip() {
        for stage in [
            Stage::Ingest,
            Stage::Classify,
            Stage::ParseEmail,
            Stage::Ocr,
            Stage::Analyze,
            Stage::OrchestrateOrder,
            Stage::Calculate,
            Stage::Offer,
            Stage::ProcessAttachments,
            Stage::AutoCalculate,
            Stage::GenerateOffer,
            Stage::Review,
            Stage::Escalate,
            Stage::Archive,
            Stage::Notify,
        ] {
            assert_eq!(Stage::parse(stage.as_str()), Some(stage));
        }
        assert_eq!(Stage::parse("fulfil"), None);
    }

    #[test]
    fn stage_serde_snake_case() {
        let json = serde_json::to_string(&Stage::ParseEmail).unwrap();
        assert_eq!(json, "\"parse_email\"");
        let parsed: Stage = serde_json::from_str("\"orchestrate_order\"").unwrap();
        assert_eq!(parsed, Stage::OrchestrateOrder);
    }

    #[test]
    fn category_parse_known_and_unknown() {
        assert_eq!(Category::parse("poptavka"), Some(Category::Poptavka));
        assert_eq!(
            Category::parse("obchodni_sdeleni"),
            Some(Category::ObchodniSdeleni)
        );
        assert_eq!(Category::parse("spam"), None);
        assert_eq!(Category::parse(""), None);
    }

    #[test]
    fn status_transitions_valid() {
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Running));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Success));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Failed));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Pending));
        assert!(TaskStatus::Failed.can_transition_to(TaskStatus::Pending));
        assert!(TaskStatus::Failed.can_transition_to(TaskStatus::Dlq));
    }

    #[test]
    fn status_transitions_invalid() {
        assert!(!TaskStatus::Success.can_transition_to(TaskStatus::Pending));
        assert!(!TaskStatus::Success.can_transition_to(TaskStatus::Running));
        assert!(!TaskStatus::Dlq.can_transition_to(TaskStatus::Pending));
        assert!(!TaskStatus::Dlq.can_transition_to(TaskStatus::Running));
        assert!(!TaskStatus::Pending.can_transition_to(TaskStatus::Success));
    }

    #[test]
    fn terminal_statuses() {
        assert!(TaskStatus::Success.is_terminal());
        assert!(TaskStatus::Dlq.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(!TaskStatus::Failed.is_terminal());
    }

    #[test]
    fn plan_navigation() {
        let msg = MailMessage {
            id: "m1".into(),
            thread_id: "m1".into(),
            in_reply_to: None,
            references: None,
            direction: Direction::Inbound,
            sender: "a@example.com".into(),
            subject: "Order".into(),
            body: String::new(),
            category: Some("objednavka".into()),
            confidence: Some(0.9),
            has_attachments: false,
            attachments: vec![],
            needs_review: false,
            plan: Some(vec![Stage::ParseEmail, Stage::OrchestrateOrder]),
            received_at: Utc::now(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        assert_eq!(msg.plan_position(Stage::ParseEmail), Some(0));
        assert_eq!(
            msg.next_stage_after(Stage::ParseEmail),
            Some(Stage::OrchestrateOrder)
        );
        assert_eq!(msg.next_stage_after(Stage::OrchestrateOrder), None);
        assert_eq!(msg.next_stage_after(Stage::Review), None);
        assert_eq!(msg.parsed_category(), Some(Category::Objednavka));
    }

    #[test]
    fn unknown_category_kept_raw() {
        let msg = MailMessage {
            id: "m2".into(),
            thread_id: "m2".into(),
            in_reply_to: None,
            references: None,
            direction: Direction::Inbound,
            sender: "a@example.com".into(),
            subject: "???".into(),
            body: String::new(),
            category: Some("neznama_kategorie".into()),
            confidence: Some(0.8),
            has_attachments: false,
            attachments: vec![],
            needs_review: false,
            plan: None,
            received_at: Utc::now(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        assert_eq!(msg.parsed_category(), None);
        assert_eq!(msg.category.as_deref(), Some("neznama_kategorie"));
    }
}
