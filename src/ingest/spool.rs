//! Filesystem spool source — feeds raw `.eml` drops into the pipeline.
//!
//! A delivery agent (or an operator) drops raw messages into the spool
//! directory. The poller parses each file, records the message, seeds
//! its `ingest` task, and only then moves the file to `processed/`, so
//! a crash between steps never loses mail. Unparseable files go to
//! `rejected/` instead of wedging the spool.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{IngestError, StoreError};
use crate::ingest::agent;
use crate::model::Stage;
use crate::store::TaskStore;

// ── Configuration ───────────────────────────────────────────────────

/// Spool source configuration, built from environment variables.
#[derive(Debug, Clone)]
pub struct SpoolConfig {
    pub dir: PathBuf,
    pub poll_interval_secs: u64,
}

impl SpoolConfig {
    /// Build config from environment variables.
    /// Returns `None` if `MAILROOM_SPOOL_DIR` is not set (source disabled).
    pub fn from_env() -> Option<Self> {
        let dir = std::env::var("MAILROOM_SPOOL_DIR").ok()?;

        let poll_interval_secs: u64 = std::env::var("MAILROOM_SPOOL_POLL_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(30);

        Some(Self {
            dir: PathBuf::from(dir),
            poll_interval_secs,
        })
    }
}

// ── Poller ──────────────────────────────────────────────────────────

/// Spawn a background task that polls the spool directory and feeds
/// new messages into the store.
///
/// Returns a `JoinHandle` and a shutdown flag. Set the flag to stop polling.
pub fn spawn_spool_poller(
    config: SpoolConfig,
    store: Arc<dyn TaskStore>,
    max_attempts: u32,
) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        info!(
            dir = %config.dir.display(),
            "Spool poller started, polling every {}s",
            config.poll_interval_secs
        );

        let mut tick = tokio::time::interval(Duration::from_secs(config.poll_interval_secs));

        loop {
            tick.tick().await;

            if shutdown.load(Ordering::Relaxed) {
                info!("Spool poller shutting down");
                return;
            }

            poll_once(&config, store.as_ref(), max_attempts).await;
        }
    });

    (handle, shutdown_flag)
}

/// Run a single poll cycle: list → parse → persist → seed task → move aside.
async fn poll_once(config: &SpoolConfig, store: &dyn TaskStore, max_attempts: u32) {
    let files = match list_spool(&config.dir) {
        Ok(files) => files,
        Err(e) => {
            error!(dir = %config.dir.display(), "Spool listing failed: {e}");
            return;
        }
    };

    if files.is_empty() {
        return;
    }
    debug!("Found {} spool file(s)", files.len());

    for path in files {
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) => {
                error!(file = %path.display(), "Failed to read spool file: {e}");
                continue;
            }
        };

        let msg = match agent::parse_message(&raw) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(file = %path.display(), "Rejecting unparseable spool file: {e}");
                if let Err(e) = move_aside(&path, &config.dir, "rejected") {
                    error!(file = %path.display(), "Failed to move rejected file: {e}");
                }
                continue;
            }
        };

        // Insert is keyed on message id; a duplicate drop of the same
        // message is harmless.
        match store.insert_message(&msg).await {
            Ok(()) => {
                info!(id = %msg.id, sender = %msg.sender, "Message ingested from spool");
            }
            Err(StoreError::AlreadySeen(id)) => {
                debug!(id = %id, "Duplicate spool message, skipping insert");
            }
            Err(e) => {
                // Leave the file in place; the next tick retries.
                error!(id = %msg.id, "Failed to persist spool message: {e}");
                continue;
            }
        }

        // Idempotent; also repairs a crash between insert and task creation.
        let payload = agent::build_ingest_payload(&msg);
        if let Err(e) = store
            .create_task(&msg.id, Stage::Ingest, &payload, max_attempts)
            .await
        {
            error!(id = %msg.id, "Failed to seed ingest task: {e}");
            continue;
        }

        if let Err(e) = move_aside(&path, &config.dir, "processed") {
            error!(file = %path.display(), "Failed to move processed file: {e}");
        }
    }
}

/// List `.eml` files in the spool directory, oldest name first.
fn list_spool(dir: &Path) -> Result<Vec<PathBuf>, IngestError> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let is_eml = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("eml"));
        if is_eml {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Move a spool file into a sibling subdirectory (`processed/` or `rejected/`).
fn move_aside(path: &Path, spool_dir: &Path, subdir: &str) -> Result<(), IngestError> {
    let target_dir = spool_dir.join(subdir);
    std::fs::create_dir_all(&target_dir)?;
    let file_name = path.file_name().ok_or_else(|| {
        IngestError::Spool(format!("spool entry has no file name: {}", path.display()))
    })?;
    std::fs::rename(path, target_dir.join(file_name))?;
    Ok(())
}
