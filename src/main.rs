use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use mailroom::breaker::BreakerRegistry;
use mailroom::config::PipelineConfig;
use mailroom::executor::{HandlerRegistry, PipelineExecutor};
use mailroom::handlers::{
    AccountingConfig, AiServiceConfig, ArchiveHandler, EscalateHandler, IngestHandler,
    NotifyHandler, ReviewHandler, SmtpConfig, register_accounting_handlers, register_ai_handlers,
};
use mailroom::ingest::{SpoolConfig, spawn_spool_poller};
use mailroom::sched::{SweepConfig, spawn_sweeper};
use mailroom::store::{LibSqlStore, TaskStore};

/// How long shutdown waits for in-flight stages before giving up.
/// Anything still running afterwards is swept back to pending on the
/// next boot.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    // Initialize tracing; logs go to a rolling file when MAILROOM_LOG_DIR is set
    let env_filter = || {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    };
    let _log_guard = match std::env::var("MAILROOM_LOG_DIR") {
        Ok(dir) => {
            let appender = tracing_appender::rolling::daily(&dir, "mailroom.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(env_filter())
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer)
                .init();
            Some(guard)
        }
        Err(_) => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter())
                .with_target(false)
                .init();
            None
        }
    };

    let config = PipelineConfig::from_env();

    eprintln!("📬 Mailroom v{}", env!("CARGO_PKG_VERSION"));

    // ── Database ─────────────────────────────────────────────────────────
    let db_path =
        std::env::var("MAILROOM_DB_PATH").unwrap_or_else(|_| "./data/mailroom.db".to_string());

    let db_path_ref = std::path::Path::new(&db_path);
    let store: Arc<dyn TaskStore> = Arc::new(
        LibSqlStore::new_local(db_path_ref)
            .await
            .unwrap_or_else(|e| {
                eprintln!("Error: Failed to open database at {}: {}", db_path, e);
                std::process::exit(1);
            }),
    );

    eprintln!("   Database: {}", db_path);

    // ── Circuit breakers ─────────────────────────────────────────────────
    let mut breakers = BreakerRegistry::new();
    breakers.register("ai", config.breaker.clone());
    breakers.register("accounting", config.breaker.clone());
    breakers.register("mail", config.breaker.clone());
    let breakers = Arc::new(breakers);

    // ── Stage handlers ───────────────────────────────────────────────────
    let mut handlers = HandlerRegistry::new();
    handlers.register(Arc::new(IngestHandler));
    handlers.register(Arc::new(ReviewHandler::new(Arc::clone(&store))));
    handlers.register(Arc::new(EscalateHandler));
    handlers.register(Arc::new(ArchiveHandler));

    if let Some(ai_config) = AiServiceConfig::from_env() {
        eprintln!("   AI service: {}", ai_config.base_url);
        register_ai_handlers(&mut handlers, &ai_config);
    } else {
        eprintln!("   AI service: disabled (set MAILROOM_AI_URL)");
    }

    if let Some(accounting_config) = AccountingConfig::from_env() {
        eprintln!("   Accounting: {}", accounting_config.base_url);
        register_accounting_handlers(&mut handlers, &accounting_config);
    } else {
        eprintln!("   Accounting: disabled (set MAILROOM_ACCOUNTING_URL)");
    }

    if let Some(smtp_config) = SmtpConfig::from_env() {
        eprintln!(
            "   Notifications: {} -> {}",
            smtp_config.host, smtp_config.notify_to
        );
        handlers.register(Arc::new(NotifyHandler::new(smtp_config)));
    } else {
        eprintln!("   Notifications: disabled (set MAILROOM_SMTP_HOST and MAILROOM_NOTIFY_TO)");
    }

    let stage_names: Vec<&str> = handlers.stages().iter().map(|s| s.as_str()).collect();
    eprintln!("   Stages: {}", stage_names.join(", "));

    let mut handles = Vec::new();
    let mut shutdown_flags = Vec::new();

    // ── Spool poller ─────────────────────────────────────────────────────
    if let Some(spool_config) = SpoolConfig::from_env() {
        eprintln!(
            "   Spool: {} (poll every {}s)",
            spool_config.dir.display(),
            spool_config.poll_interval_secs
        );
        let (handle, flag) =
            spawn_spool_poller(spool_config, Arc::clone(&store), config.max_attempts);
        handles.push(handle);
        shutdown_flags.push(flag);
    } else {
        eprintln!("   Spool: disabled (set MAILROOM_SPOOL_DIR to ingest mail)");
    }

    // ── Executor workers ─────────────────────────────────────────────────
    eprintln!("   Workers: {}\n", config.worker_count);

    let executor = Arc::new(PipelineExecutor::new(
        Arc::clone(&store),
        Arc::new(handlers),
        Arc::clone(&breakers),
        config.clone(),
    ));
    let (worker_handles, workers_flag) = executor.spawn();
    handles.extend(worker_handles);
    shutdown_flags.push(workers_flag);

    // ── Maintenance sweeper ──────────────────────────────────────────────
    let (sweep_handle, sweep_flag) = spawn_sweeper(
        Arc::clone(&store),
        SweepConfig::from_env(),
        config.stale_running_after,
    );
    handles.push(sweep_handle);
    shutdown_flags.push(sweep_flag);

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received, draining workers");

    for flag in &shutdown_flags {
        flag.store(true, Ordering::Relaxed);
    }

    let drain = async {
        for handle in handles {
            let _ = handle.await;
        }
    };
    if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
        tracing::warn!("Drain timed out, exiting with tasks in flight");
    }

    for status in breakers.statuses() {
        tracing::info!(
            breaker = %status.name,
            state = ?status.state,
            "Final breaker state"
        );
    }

    Ok(())
}
