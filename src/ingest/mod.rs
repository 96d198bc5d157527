//! Inbound mail ingestion: MIME parsing plus the filesystem spool source.

pub mod agent;
pub mod spool;

pub use agent::{build_ingest_payload, parse_message};
pub use spool::{SpoolConfig, spawn_spool_poller};
