//! Worker pool — claims pending tasks and drives stage handlers.
//!
//! Each worker loops: claim one task, resolve its handler, check the
//! dependency's circuit breaker, run the handler under the per-task
//! time limit, then apply the outcome. An open breaker defers the task
//! without spending an attempt. After a successful `classify` the
//! router materializes the message's stage plan; any other success
//! schedules the plan's next stage. Handler failures never escape this
//! module.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use rand::Rng;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::breaker::BreakerRegistry;
use crate::config::PipelineConfig;
use crate::error::{ExecutorError, Result};
use crate::executor::handler::{HandlerOutcome, HandlerRegistry, StageContext};
use crate::model::{Category, ProcessingTask, Stage};
use crate::router::Router;
use crate::store::TaskStore;

/// The pipeline's scheduling loop. One instance drives all workers.
pub struct PipelineExecutor {
    store: Arc<dyn TaskStore>,
    handlers: Arc<HandlerRegistry>,
    breakers: Arc<BreakerRegistry>,
    router: Router,
    config: PipelineConfig,
}

impl PipelineExecutor {
    pub fn new(
        store: Arc<dyn TaskStore>,
        handlers: Arc<HandlerRegistry>,
        breakers: Arc<BreakerRegistry>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            store,
            handlers,
            breakers,
            router: Router::new(config.review_threshold),
            config,
        }
    }

    /// Spawn the worker pool.
    ///
    /// Returns the worker handles and a shutdown flag. Workers finish
    /// their in-flight task before exiting.
    pub fn spawn(self: Arc<Self>) -> (Vec<JoinHandle<()>>, Arc<AtomicBool>) {
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::with_capacity(self.config.worker_count);

        for worker_id in 0..self.config.worker_count {
            let executor = Arc::clone(&self);
            let flag = Arc::clone(&shutdown);
            handles.push(tokio::spawn(async move {
                executor.worker_loop(worker_id, flag).await;
            }));
        }

        info!(workers = self.config.worker_count, "Pipeline executor started");
        (handles, shutdown)
    }

    async fn worker_loop(&self, worker_id: usize, shutdown: Arc<AtomicBool>) {
        debug!(worker_id, "Pipeline worker started");

        loop {
            if shutdown.load(Ordering::Relaxed) {
                debug!(worker_id, "Pipeline worker shutting down");
                return;
            }

            match self.store.claim_next_task().await {
                Ok(Some(task)) => {
                    if let Err(e) = self.run_task(worker_id, task).await {
                        error!(worker_id, "Task bookkeeping failed: {e}");
                    }
                }
                Ok(None) => {
                    tokio::time::sleep(self.config.claim_idle_sleep).await;
                }
                Err(e) => {
                    error!(worker_id, "Task claim failed: {e}");
                    tokio::time::sleep(self.config.claim_idle_sleep).await;
                }
            }
        }
    }

    /// Execute one claimed task end to end.
    async fn run_task(&self, worker_id: usize, task: ProcessingTask) -> Result<()> {
        let Some(handler) = self.handlers.get(task.stage) else {
            warn!(task_id = %task.id, stage = %task.stage, "No handler registered, dead-lettering");
            self.store
                .fail_task_fatal(
                    task.id,
                    &ExecutorError::HandlerNotFound(task.stage).to_string(),
                )
                .await?;
            return Ok(());
        };

        // Breaker gate. Deferring is not a handler failure and does not
        // spend an attempt.
        let breaker = handler.dependency().and_then(|dep| self.breakers.get(dep));
        if let Some(ref breaker) = breaker
            && !breaker.can_execute()
        {
            debug!(
                task_id = %task.id,
                stage = %task.stage,
                breaker = breaker.name(),
                "Breaker open, deferring task"
            );
            self.store
                .release_task(task.id, self.config.breaker_defer)
                .await?;
            return Ok(());
        }

        let Some(message) = self.store.get_message(&task.message_id).await? else {
            error!(task_id = %task.id, message_id = %task.message_id, "Task references missing message");
            let orphan = ExecutorError::OrphanTask {
                task_id: task.id,
                message_id: task.message_id.clone(),
            };
            self.store.fail_task_fatal(task.id, &orphan.to_string()).await?;
            return Ok(());
        };

        info!(
            worker_id,
            task_id = %task.id,
            message_id = %task.message_id,
            stage = %task.stage,
            attempt = task.attempts + 1,
            "Executing stage"
        );

        let ctx = StageContext {
            task: task.clone(),
            message,
        };
        let started = Instant::now();
        let outcome = match tokio::time::timeout(self.config.task_timeout, handler.execute(&ctx))
            .await
        {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => HandlerOutcome::Retry {
                reason: e.to_string(),
            },
            // The handler future is dropped here; partial side effects
            // must be retry-safe (keyed on message id + stage).
            Err(_) => HandlerOutcome::Retry {
                reason: ExecutorError::Timeout {
                    stage: task.stage,
                    timeout: self.config.task_timeout,
                }
                .to_string(),
            },
        };

        match outcome {
            HandlerOutcome::Success { output } => {
                if let Some(ref breaker) = breaker {
                    breaker.record_success();
                }
                self.store.complete_task(task.id, &output).await?;
                info!(
                    task_id = %task.id,
                    stage = %task.stage,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Stage succeeded"
                );
                self.advance(&task, &output).await?;
            }
            HandlerOutcome::Retry { reason } => {
                if let Some(ref breaker) = breaker {
                    breaker.record_failure();
                }
                let status = self.store.fail_task(task.id, &reason, self.retry_delay()).await?;
                warn!(
                    task_id = %task.id,
                    stage = %task.stage,
                    status = %status,
                    "Stage failed: {reason}"
                );
            }
            HandlerOutcome::Fatal { reason } => {
                // Bad input, not a sick dependency; the breaker stays out
                // of it and the retry budget is not spent further.
                self.store.fail_task_fatal(task.id, &reason).await?;
                warn!(
                    task_id = %task.id,
                    stage = %task.stage,
                    "Stage failed fatally: {reason}"
                );
            }
        }

        Ok(())
    }

    /// Schedule whatever comes after a successful stage.
    async fn advance(&self, task: &ProcessingTask, output: &serde_json::Value) -> Result<()> {
        match task.stage {
            Stage::Ingest => {
                self.create_next(&task.message_id, Stage::Classify, output)
                    .await
            }
            Stage::Classify => self.route_after_classify(task, output).await,
            _ => {
                let Some(message) = self.store.get_message(&task.message_id).await? else {
                    warn!(message_id = %task.message_id, "Message vanished before advancement");
                    return Ok(());
                };
                match message.next_stage_after(task.stage) {
                    Some(next) => self.create_next(&task.message_id, next, output).await,
                    None => {
                        info!(
                            message_id = %task.message_id,
                            stage = %task.stage,
                            "Plan complete"
                        );
                        Ok(())
                    }
                }
            }
        }
    }

    /// Record the classification, route the message, and schedule the
    /// plan's first stage.
    async fn route_after_classify(
        &self,
        task: &ProcessingTask,
        output: &serde_json::Value,
    ) -> Result<()> {
        let category_str = output
            .get("category")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        let confidence = output
            .get("confidence")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0);
        let needs_review = output
            .get("needs_review")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        self.store
            .set_classification(&task.message_id, category_str, confidence, needs_review)
            .await?;

        let Some(message) = self.store.get_message(&task.message_id).await? else {
            warn!(message_id = %task.message_id, "Message vanished before routing");
            return Ok(());
        };

        let plan = self.router.route(
            Category::parse(category_str),
            confidence,
            message.has_attachments,
            message.needs_review,
        );
        self.store.set_plan(&task.message_id, &plan).await?;
        info!(
            message_id = %task.message_id,
            category = category_str,
            confidence,
            stages = plan.len(),
            "Message routed"
        );

        match plan.first() {
            Some(&head) => self.create_next(&task.message_id, head, output).await,
            None => Ok(()),
        }
    }

    /// Create the next stage's task. Safe to call twice; the store
    /// dedupes on (message, stage).
    async fn create_next(
        &self,
        message_id: &str,
        stage: Stage,
        upstream: &serde_json::Value,
    ) -> Result<()> {
        let payload = serde_json::json!({
            "message_id": message_id,
            "upstream": upstream,
        });
        match self
            .store
            .create_task(message_id, stage, &payload, self.config.max_attempts)
            .await?
        {
            Some(next) => {
                debug!(task_id = %next.id, stage = %stage, "Scheduled next stage");
            }
            None => {
                debug!(message_id, stage = %stage, "Next stage already scheduled");
            }
        }
        Ok(())
    }

    /// Retry delay with jitter, so a burst of failures does not thunder
    /// back in lockstep.
    fn retry_delay(&self) -> std::time::Duration {
        let jitter_ms = self.config.retry_jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return self.config.retry_delay;
        }
        let jitter = rand::thread_rng().gen_range(0..=jitter_ms);
        self.config.retry_delay + std::time::Duration::from_millis(jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::result::Result;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::breaker::BreakerConfig;
    use crate::error::HandlerError;
    use crate::executor::handler::StageHandler;
    use crate::model::{Direction, MailMessage, TaskStatus};
    use crate::store::LibSqlStore;

    // Handler that replays a scripted sequence of outcomes.
    struct ScriptedHandler {
        stage: Stage,
        dependency: Option<&'static str>,
        outcomes: Mutex<VecDeque<HandlerOutcome>>,
        calls: AtomicUsize,
    }

    impl ScriptedHandler {
        fn ok(stage: Stage) -> Arc<Self> {
            Self::new(stage, None, vec![])
        }

        fn new(
            stage: Stage,
            dependency: Option<&'static str>,
            outcomes: Vec<HandlerOutcome>,
        ) -> Arc<Self> {
            Arc::new(Self {
                stage,
                dependency,
                outcomes: Mutex::new(outcomes.into()),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl StageHandler for ScriptedHandler {
        fn stage(&self) -> Stage {
            self.stage
        }

        fn dependency(&self) -> Option<&str> {
            self.dependency
        }

        async fn execute(&self, _ctx: &StageContext) -> Result<HandlerOutcome, HandlerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self.outcomes.lock().unwrap().pop_front();
            Ok(next.unwrap_or(HandlerOutcome::Success {
                output: serde_json::json!({}),
            }))
        }
    }

    struct SlowHandler(Stage);

    #[async_trait]
    impl StageHandler for SlowHandler {
        fn stage(&self) -> Stage {
            self.0
        }

        async fn execute(&self, _ctx: &StageContext) -> Result<HandlerOutcome, HandlerError> {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok(HandlerOutcome::Success {
                output: serde_json::json!({}),
            })
        }
    }

    struct FailingHandler(Stage);

    #[async_trait]
    impl StageHandler for FailingHandler {
        fn stage(&self) -> Stage {
            self.0
        }

        async fn execute(&self, _ctx: &StageContext) -> Result<HandlerOutcome, HandlerError> {
            Err(HandlerError::RequestFailed {
                stage: self.0,
                reason: "boom".into(),
            })
        }
    }

    fn success(output: serde_json::Value) -> HandlerOutcome {
        HandlerOutcome::Success { output }
    }

    fn test_config() -> PipelineConfig {
        PipelineConfig {
            worker_count: 1,
            max_attempts: 3,
            retry_delay: Duration::ZERO,
            retry_jitter: Duration::ZERO,
            task_timeout: Duration::from_secs(5),
            review_threshold: 0.7,
            claim_idle_sleep: Duration::from_millis(10),
            breaker_defer: Duration::from_secs(300),
            stale_running_after: Duration::from_secs(600),
            breaker: BreakerConfig::default(),
        }
    }

    fn message(id: &str, has_attachments: bool) -> MailMessage {
        MailMessage {
            id: id.to_string(),
            thread_id: id.to_string(),
            in_reply_to: None,
            references: None,
            direction: Direction::Inbound,
            sender: "novak@example.cz".into(),
            subject: "Poptavka".into(),
            body: "Dobry den.".into(),
            category: None,
            confidence: None,
            has_attachments,
            attachments: if has_attachments {
                vec!["vykres.pdf".into()]
            } else {
                vec![]
            },
            needs_review: false,
            plan: None,
            received_at: chrono::Utc::now(),
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        }
    }

    async fn executor_with(
        handlers: Vec<Arc<dyn StageHandler>>,
        breakers: BreakerRegistry,
        config: PipelineConfig,
    ) -> (PipelineExecutor, Arc<LibSqlStore>) {
        let store = Arc::new(LibSqlStore::new_memory().await.unwrap());
        let mut registry = HandlerRegistry::new();
        for handler in handlers {
            registry.register(handler);
        }
        let executor = PipelineExecutor::new(
            store.clone(),
            Arc::new(registry),
            Arc::new(breakers),
            config,
        );
        (executor, store)
    }

    /// Claim and run a single task. Returns false when nothing was claimable.
    async fn drive_one(executor: &PipelineExecutor) -> bool {
        match executor.store.claim_next_task().await.unwrap() {
            Some(task) => {
                executor.run_task(0, task).await.unwrap();
                true
            }
            None => false,
        }
    }

    async fn drain(executor: &PipelineExecutor) {
        while drive_one(executor).await {}
    }

    #[tokio::test]
    async fn full_chain_ingest_classify_route_execute() {
        let classify = ScriptedHandler::new(
            Stage::Classify,
            Some("ai"),
            vec![success(
                serde_json::json!({"category": "objednavka", "confidence": 0.95}),
            )],
        );
        let parse = ScriptedHandler::ok(Stage::ParseEmail);
        let orchestrate = ScriptedHandler::ok(Stage::OrchestrateOrder);

        let mut breakers = BreakerRegistry::new();
        breakers.register("ai", BreakerConfig::default());

        let (executor, store) = executor_with(
            vec![
                ScriptedHandler::ok(Stage::Ingest),
                classify.clone(),
                parse.clone(),
                orchestrate.clone(),
            ],
            breakers,
            test_config(),
        )
        .await;

        store.insert_message(&message("m1", false)).await.unwrap();
        store
            .create_task("m1", Stage::Ingest, &serde_json::json!({}), 3)
            .await
            .unwrap();

        drain(&executor).await;

        let msg = store.get_message("m1").await.unwrap().unwrap();
        assert_eq!(msg.category.as_deref(), Some("objednavka"));
        assert_eq!(msg.confidence, Some(0.95));
        assert_eq!(
            msg.plan,
            Some(vec![Stage::ParseEmail, Stage::OrchestrateOrder])
        );

        let tasks = store.get_tasks_for_message("m1").await.unwrap();
        assert_eq!(tasks.len(), 4);
        assert!(tasks.iter().all(|t| t.status == TaskStatus::Success));
        assert_eq!(parse.calls(), 1);
        assert_eq!(orchestrate.calls(), 1);
    }

    #[tokio::test]
    async fn low_confidence_routes_to_review_only() {
        let classify = ScriptedHandler::new(
            Stage::Classify,
            None,
            vec![success(
                serde_json::json!({"category": "poptavka", "confidence": 0.4}),
            )],
        );
        let review = ScriptedHandler::ok(Stage::Review);

        let (executor, store) = executor_with(
            vec![classify, review.clone()],
            BreakerRegistry::new(),
            test_config(),
        )
        .await;

        store.insert_message(&message("m1", true)).await.unwrap();
        store
            .create_task("m1", Stage::Classify, &serde_json::json!({}), 3)
            .await
            .unwrap();

        drain(&executor).await;

        let msg = store.get_message("m1").await.unwrap().unwrap();
        // Review overrides everything, attachments included.
        assert_eq!(msg.plan, Some(vec![Stage::Review]));
        assert_eq!(review.calls(), 1);
    }

    #[tokio::test]
    async fn attachments_prepend_processing_stage() {
        let classify = ScriptedHandler::new(
            Stage::Classify,
            None,
            vec![success(
                serde_json::json!({"category": "objednavka", "confidence": 0.9}),
            )],
        );

        let (executor, store) = executor_with(
            vec![
                classify,
                ScriptedHandler::ok(Stage::ProcessAttachments),
                ScriptedHandler::ok(Stage::ParseEmail),
                ScriptedHandler::ok(Stage::OrchestrateOrder),
            ],
            BreakerRegistry::new(),
            test_config(),
        )
        .await;

        store.insert_message(&message("m1", true)).await.unwrap();
        store
            .create_task("m1", Stage::Classify, &serde_json::json!({}), 3)
            .await
            .unwrap();

        drain(&executor).await;

        let msg = store.get_message("m1").await.unwrap().unwrap();
        assert_eq!(
            msg.plan,
            Some(vec![
                Stage::ProcessAttachments,
                Stage::ParseEmail,
                Stage::OrchestrateOrder
            ])
        );
        let tasks = store.get_tasks_for_message("m1").await.unwrap();
        assert!(tasks.iter().all(|t| t.status == TaskStatus::Success));
    }

    #[tokio::test]
    async fn retry_outcome_spends_attempt_then_succeeds() {
        let flaky = ScriptedHandler::new(
            Stage::OrchestrateOrder,
            None,
            vec![
                HandlerOutcome::Retry {
                    reason: "accounting 502".into(),
                },
                success(serde_json::json!({"order": 42})),
            ],
        );

        let (executor, store) = executor_with(
            vec![flaky.clone()],
            BreakerRegistry::new(),
            test_config(),
        )
        .await;

        store.insert_message(&message("m1", false)).await.unwrap();
        let task = store
            .create_task("m1", Stage::OrchestrateOrder, &serde_json::json!({}), 3)
            .await
            .unwrap()
            .unwrap();

        assert!(drive_one(&executor).await);
        let after_first = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(after_first.status, TaskStatus::Pending);
        assert_eq!(after_first.attempts, 1);
        assert_eq!(after_first.last_error.as_deref(), Some("accounting 502"));

        assert!(drive_one(&executor).await);
        let after_second = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(after_second.status, TaskStatus::Success);
        assert_eq!(flaky.calls(), 2);
    }

    #[tokio::test]
    async fn handler_error_is_retryable() {
        let (executor, store) = executor_with(
            vec![Arc::new(FailingHandler(Stage::ParseEmail))],
            BreakerRegistry::new(),
            test_config(),
        )
        .await;

        store.insert_message(&message("m1", false)).await.unwrap();
        let task = store
            .create_task("m1", Stage::ParseEmail, &serde_json::json!({}), 3)
            .await
            .unwrap()
            .unwrap();

        assert!(drive_one(&executor).await);
        let task = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.attempts, 1);
    }

    #[tokio::test]
    async fn fatal_outcome_dead_letters_and_skips_breaker() {
        let fatal = ScriptedHandler::new(
            Stage::ParseEmail,
            Some("ai"),
            vec![HandlerOutcome::Fatal {
                reason: "unsupported encoding".into(),
            }],
        );

        let mut breakers = BreakerRegistry::new();
        breakers.register(
            "ai",
            BreakerConfig {
                failure_threshold: 2,
                recovery_timeout: Duration::from_secs(300),
            },
        );
        let (executor, store) =
            executor_with(vec![fatal], breakers, test_config()).await;

        // One pre-existing dependency failure on the breaker.
        executor.breakers.get("ai").unwrap().record_failure();

        store.insert_message(&message("m1", false)).await.unwrap();
        let task = store
            .create_task("m1", Stage::ParseEmail, &serde_json::json!({}), 3)
            .await
            .unwrap()
            .unwrap();

        assert!(drive_one(&executor).await);
        let task = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Dlq);
        assert_eq!(task.attempts, 1);

        // Fatal outcomes say nothing about dependency health.
        let status = executor.breakers.get("ai").unwrap().status();
        assert_eq!(status.consecutive_failures, 1);
    }

    #[tokio::test]
    async fn open_breaker_defers_without_spending_attempt() {
        let handler = ScriptedHandler::new(Stage::Classify, Some("ai"), vec![]);
        let mut breakers = BreakerRegistry::new();
        breakers.register(
            "ai",
            BreakerConfig {
                failure_threshold: 1,
                recovery_timeout: Duration::from_secs(300),
            },
        );

        let (executor, store) =
            executor_with(vec![handler.clone()], breakers, test_config()).await;
        executor.breakers.get("ai").unwrap().record_failure();

        store.insert_message(&message("m1", false)).await.unwrap();
        let task = store
            .create_task("m1", Stage::Classify, &serde_json::json!({}), 3)
            .await
            .unwrap()
            .unwrap();

        assert!(drive_one(&executor).await);

        let task = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.attempts, 0);
        assert_eq!(handler.calls(), 0);

        // Deferred out of reach until the breaker's next trial window.
        assert!(store.claim_next_task().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn success_closes_half_open_breaker() {
        let handler = ScriptedHandler::new(
            Stage::Classify,
            Some("ai"),
            vec![success(serde_json::json!({"category": "dotaz", "confidence": 0.9}))],
        );
        let mut breakers = BreakerRegistry::new();
        breakers.register(
            "ai",
            BreakerConfig {
                failure_threshold: 1,
                recovery_timeout: Duration::ZERO,
            },
        );

        let (executor, store) = executor_with(
            vec![
                handler,
                ScriptedHandler::ok(Stage::OrchestrateOrder),
                ScriptedHandler::ok(Stage::Notify),
            ],
            breakers,
            test_config(),
        )
        .await;

        // Open, then immediately eligible for a half-open trial.
        executor.breakers.get("ai").unwrap().record_failure();

        store.insert_message(&message("m1", false)).await.unwrap();
        store
            .create_task("m1", Stage::Classify, &serde_json::json!({}), 3)
            .await
            .unwrap();

        drain(&executor).await;

        let status = executor.breakers.get("ai").unwrap().status();
        assert!(status.state.is_closed());
        assert_eq!(status.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn timeout_counts_as_retryable_failure() {
        let mut config = test_config();
        config.task_timeout = Duration::from_millis(50);

        let (executor, store) = executor_with(
            vec![Arc::new(SlowHandler(Stage::Analyze))],
            BreakerRegistry::new(),
            config,
        )
        .await;

        store.insert_message(&message("m1", false)).await.unwrap();
        let task = store
            .create_task("m1", Stage::Analyze, &serde_json::json!({}), 3)
            .await
            .unwrap()
            .unwrap();

        assert!(drive_one(&executor).await);
        let task = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.attempts, 1);
        assert!(task.last_error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn missing_handler_dead_letters() {
        let (executor, store) =
            executor_with(vec![], BreakerRegistry::new(), test_config()).await;

        store.insert_message(&message("m1", false)).await.unwrap();
        let task = store
            .create_task("m1", Stage::Ocr, &serde_json::json!({}), 3)
            .await
            .unwrap()
            .unwrap();

        assert!(drive_one(&executor).await);
        let task = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Dlq);
        assert!(task.last_error.unwrap().contains("handler registered"));
    }

    #[tokio::test]
    async fn unrecognized_category_leaves_message_unplanned() {
        let classify = ScriptedHandler::new(
            Stage::Classify,
            None,
            vec![success(
                serde_json::json!({"category": "spam", "confidence": 0.99}),
            )],
        );

        let (executor, store) =
            executor_with(vec![classify], BreakerRegistry::new(), test_config()).await;

        store.insert_message(&message("m1", false)).await.unwrap();
        store
            .create_task("m1", Stage::Classify, &serde_json::json!({}), 3)
            .await
            .unwrap();

        drain(&executor).await;

        let msg = store.get_message("m1").await.unwrap().unwrap();
        // Routed, but the plan is empty; raw label preserved.
        assert_eq!(msg.plan, Some(vec![]));
        assert_eq!(msg.category.as_deref(), Some("spam"));

        // Only the classify task exists.
        let tasks = store.get_tasks_for_message("m1").await.unwrap();
        assert_eq!(tasks.len(), 1);
    }

    #[tokio::test]
    async fn retry_until_budget_exhausted_dead_letters() {
        let always_down = ScriptedHandler::new(
            Stage::OrchestrateOrder,
            None,
            vec![
                HandlerOutcome::Retry { reason: "down".into() },
                HandlerOutcome::Retry { reason: "down".into() },
                HandlerOutcome::Retry { reason: "down".into() },
            ],
        );

        let (executor, store) = executor_with(
            vec![always_down.clone()],
            BreakerRegistry::new(),
            test_config(),
        )
        .await;

        store.insert_message(&message("m1", false)).await.unwrap();
        let task = store
            .create_task("m1", Stage::OrchestrateOrder, &serde_json::json!({}), 3)
            .await
            .unwrap()
            .unwrap();

        drain(&executor).await;

        let task = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Dlq);
        assert_eq!(task.attempts, 3);
        assert_eq!(always_down.calls(), 3);
    }
}
