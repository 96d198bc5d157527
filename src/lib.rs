//! Mailroom — confidence-gated mail processing pipeline.

pub mod breaker;
pub mod config;
pub mod error;
pub mod executor;
pub mod handlers;
pub mod ingest;
pub mod model;
pub mod router;
pub mod sched;
pub mod store;
