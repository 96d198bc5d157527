//! Background maintenance sweep.
//!
//! Runs on a cron schedule: reclaims running tasks whose worker died
//! mid-execution and logs queue depth so an operator can spot a
//! growing backlog or dead-letter queue from the logs alone.

use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::store::TaskStore;

/// Sweep schedule configuration.
#[derive(Debug, Clone)]
pub struct SweepConfig {
    /// Cron expression (seconds field included) for sweep runs.
    pub cron: String,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            // Every five minutes.
            cron: "0 */5 * * * *".to_string(),
        }
    }
}

impl SweepConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(cron) = std::env::var("MAILROOM_SWEEP_CRON") {
            config.cron = cron;
        }
        config
    }
}

/// Parse a cron expression and compute the next fire time from now.
pub fn next_cron_fire(schedule: &str) -> Result<Option<DateTime<Utc>>, String> {
    let cron_schedule =
        cron::Schedule::from_str(schedule).map_err(|e| format!("invalid cron: {e}"))?;
    Ok(cron_schedule.upcoming(Utc).next())
}

/// Spawn the sweeper loop. Returns the task handle and a shutdown flag.
pub fn spawn_sweeper(
    store: Arc<dyn TaskStore>,
    config: SweepConfig,
    stale_running_after: Duration,
) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = shutdown.clone();

    let handle = tokio::spawn(async move {
        info!(cron = %config.cron, "Maintenance sweeper started");

        loop {
            let next = match next_cron_fire(&config.cron) {
                Ok(Some(next)) => next,
                Ok(None) => {
                    warn!(cron = %config.cron, "Cron schedule never fires again, sweeper exiting");
                    return;
                }
                Err(e) => {
                    error!("Sweeper disabled: {e}");
                    return;
                }
            };

            // Sleep in short slices so shutdown stays prompt.
            while Utc::now() < next {
                if flag.load(Ordering::Relaxed) {
                    info!("Maintenance sweeper shutting down");
                    return;
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
            }

            sweep_once(store.as_ref(), stale_running_after).await;
        }
    });

    (handle, shutdown)
}

/// One sweep pass. Errors are logged, never fatal; the next fire retries.
async fn sweep_once(store: &dyn TaskStore, stale_running_after: Duration) {
    match store.release_stale_running(stale_running_after).await {
        Ok(0) => {}
        Ok(n) => warn!(released = n, "Reclaimed stale running tasks"),
        Err(e) => error!("Stale task sweep failed: {e}"),
    }

    match store.get_task_counts().await {
        Ok(counts) => {
            if counts.dlq > 0 {
                warn!(dlq = counts.dlq, "Dead-letter queue needs attention");
            }
            info!(
                pending = counts.pending,
                running = counts.running,
                success = counts.success,
                dlq = counts.dlq,
                "Queue depth"
            );
        }
        Err(e) => error!("Failed to read task counts: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Stage, TaskStatus};
    use crate::store::LibSqlStore;

    #[test]
    fn next_cron_fire_valid() {
        let next = next_cron_fire("* * * * * *").unwrap();
        assert!(next.is_some());
    }

    #[test]
    fn next_cron_fire_invalid() {
        assert!(next_cron_fire("not a cron").is_err());
    }

    #[test]
    fn default_schedule_parses() {
        let config = SweepConfig::default();
        assert!(next_cron_fire(&config.cron).unwrap().is_some());
    }

    #[tokio::test]
    async fn sweep_reclaims_stale_running_tasks() {
        let store = LibSqlStore::new_memory().await.unwrap();
        let msg = crate::ingest::parse_message(
            b"Message-ID: <sweep-1@strojirna.cz>\r\nFrom: novak@strojirna.cz\r\nSubject: Test\r\n\r\nBody\r\n",
        )
        .unwrap();
        store.insert_message(&msg).await.unwrap();
        store
            .create_task(&msg.id, Stage::Ingest, &serde_json::json!({}), 3)
            .await
            .unwrap();
        let claimed = store.claim_next_task().await.unwrap().unwrap();

        // Zero threshold makes the just-claimed task count as stale.
        sweep_once(&store, Duration::ZERO).await;

        let task = store.get_task(claimed.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.attempts, 1);
    }
}
