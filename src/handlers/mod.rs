//! Stage handler implementations.
//!
//! Remote stages (AI service, accounting bridge) share one HTTP handler
//! type; ingest/review/escalate/archive run in-process; notify goes out
//! over SMTP.

pub mod http;
pub mod local;
pub mod notify;

pub use http::{
    AI_STAGES, ACCOUNTING_STAGES, AccountingConfig, AiServiceConfig, HttpStageHandler,
    register_accounting_handlers, register_ai_handlers,
};
pub use local::{ArchiveHandler, EscalateHandler, IngestHandler, ReviewHandler};
pub use notify::{NotifyHandler, SmtpConfig};
