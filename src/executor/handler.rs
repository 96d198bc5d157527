//! Stage handler contract and registry.
//!
//! A handler serves exactly one stage. It never talks to the task store;
//! the executor owns all task bookkeeping and treats the handler as a
//! pure `payload in, outcome out` call. Handlers that front an external
//! service declare it via `dependency()` so the executor can gate them
//! behind that dependency's circuit breaker.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::HandlerError;
use crate::model::{MailMessage, ProcessingTask, Stage};

/// What a stage handler produced.
#[derive(Debug, Clone)]
pub enum HandlerOutcome {
    /// Stage completed; `output` is stored on the task and handed to the
    /// next stage in the plan.
    Success { output: serde_json::Value },
    /// Transient failure; the task spends an attempt and re-enters the
    /// retry path.
    Retry { reason: String },
    /// Permanent failure for this input; the task is dead-lettered
    /// without spending the remaining retry budget.
    Fatal { reason: String },
}

/// Everything a handler gets to see for one execution.
pub struct StageContext {
    pub task: ProcessingTask,
    pub message: MailMessage,
}

/// A single pipeline stage implementation.
#[async_trait]
pub trait StageHandler: Send + Sync {
    /// The stage this handler serves.
    fn stage(&self) -> Stage;

    /// External dependency this handler calls, if any. Stages with a
    /// dependency are gated by that dependency's circuit breaker.
    fn dependency(&self) -> Option<&str> {
        None
    }

    /// Run the stage. An `Err` is treated like a retryable failure.
    async fn execute(&self, ctx: &StageContext) -> Result<HandlerOutcome, HandlerError>;
}

/// Registry mapping stages to handlers. Built once at startup.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<Stage, Arc<dyn StageHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler under its own stage. A second registration for
    /// the same stage replaces the first.
    pub fn register(&mut self, handler: Arc<dyn StageHandler>) {
        self.handlers.insert(handler.stage(), handler);
    }

    pub fn get(&self, stage: Stage) -> Option<Arc<dyn StageHandler>> {
        self.handlers.get(&stage).cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Registered stages, for the startup banner.
    pub fn stages(&self) -> Vec<Stage> {
        let mut stages: Vec<Stage> = self.handlers.keys().copied().collect();
        stages.sort_by_key(|s| s.as_str());
        stages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopHandler(Stage);

    #[async_trait]
    impl StageHandler for NoopHandler {
        fn stage(&self) -> Stage {
            self.0
        }

        async fn execute(&self, _ctx: &StageContext) -> Result<HandlerOutcome, HandlerError> {
            Ok(HandlerOutcome::Success {
                output: serde_json::json!({}),
            })
        }
    }

    #[test]
    fn registry_lookup_by_stage() {
        let mut registry = HandlerRegistry::new();
        registry.register(Arc::new(NoopHandler(Stage::Classify)));
        registry.register(Arc::new(NoopHandler(Stage::Archive)));

        assert_eq!(registry.len(), 2);
        assert!(registry.get(Stage::Classify).is_some());
        assert!(registry.get(Stage::Notify).is_none());
    }

    #[test]
    fn registry_replaces_on_duplicate_stage() {
        let mut registry = HandlerRegistry::new();
        registry.register(Arc::new(NoopHandler(Stage::Classify)));
        registry.register(Arc::new(NoopHandler(Stage::Classify)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn default_handler_has_no_dependency() {
        let handler = NoopHandler(Stage::Archive);
        assert_eq!(handler.dependency(), None);
    }
}
