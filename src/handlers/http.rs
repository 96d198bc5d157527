//! HTTP stage handlers — the AI service and the accounting bridge.
//!
//! One handler type serves every remote stage: POST the stage payload
//! to `<base>/<stage>` and map the response onto the outcome contract.
//! 2xx is success and the body is the stage output, 4xx is fatal (the
//! input itself is bad and retrying cannot fix it), anything else is
//! retryable.

use std::sync::Arc;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

use crate::error::HandlerError;
use crate::executor::handler::{HandlerOutcome, HandlerRegistry, StageContext, StageHandler};
use crate::model::Stage;

/// Stages served by the AI service.
pub const AI_STAGES: [Stage; 5] = [
    Stage::Classify,
    Stage::ParseEmail,
    Stage::Ocr,
    Stage::Analyze,
    Stage::ProcessAttachments,
];

/// Stages served by the accounting bridge.
pub const ACCOUNTING_STAGES: [Stage; 5] = [
    Stage::OrchestrateOrder,
    Stage::Calculate,
    Stage::Offer,
    Stage::AutoCalculate,
    Stage::GenerateOffer,
];

// ── Configuration ───────────────────────────────────────────────────

/// Classification/extraction service endpoint.
#[derive(Debug, Clone)]
pub struct AiServiceConfig {
    pub base_url: String,
    pub token: Option<SecretString>,
}

impl AiServiceConfig {
    /// Returns `None` if `MAILROOM_AI_URL` is not set (AI stages disabled).
    pub fn from_env() -> Option<Self> {
        let base_url = std::env::var("MAILROOM_AI_URL").ok()?;
        let token = std::env::var("MAILROOM_AI_TOKEN")
            .ok()
            .map(SecretString::from);
        Some(Self { base_url, token })
    }
}

/// Accounting system bridge endpoint.
#[derive(Debug, Clone)]
pub struct AccountingConfig {
    pub base_url: String,
    pub token: Option<SecretString>,
}

impl AccountingConfig {
    /// Returns `None` if `MAILROOM_ACCOUNTING_URL` is not set.
    pub fn from_env() -> Option<Self> {
        let base_url = std::env::var("MAILROOM_ACCOUNTING_URL").ok()?;
        let token = std::env::var("MAILROOM_ACCOUNTING_TOKEN")
            .ok()
            .map(SecretString::from);
        Some(Self { base_url, token })
    }
}

// ── Handler ─────────────────────────────────────────────────────────

/// A stage backed by a remote HTTP service.
pub struct HttpStageHandler {
    stage: Stage,
    dependency: &'static str,
    client: reqwest::Client,
    url: String,
    token: Option<SecretString>,
}

impl HttpStageHandler {
    pub fn new(
        stage: Stage,
        dependency: &'static str,
        client: reqwest::Client,
        base_url: &str,
        token: Option<SecretString>,
    ) -> Self {
        Self {
            stage,
            dependency,
            client,
            url: endpoint(base_url, stage),
            token,
        }
    }
}

#[async_trait]
impl StageHandler for HttpStageHandler {
    fn stage(&self) -> Stage {
        self.stage
    }

    fn dependency(&self) -> Option<&str> {
        Some(self.dependency)
    }

    async fn execute(&self, ctx: &StageContext) -> Result<HandlerOutcome, HandlerError> {
        let body = serde_json::json!({
            "message_id": ctx.message.id,
            "thread_id": ctx.message.thread_id,
            "stage": self.stage,
            "sender": ctx.message.sender,
            "subject": ctx.message.subject,
            "body": ctx.message.body,
            "attachments": ctx.message.attachments,
            "payload": ctx.task.payload,
        });

        let mut request = self.client.post(&self.url).json(&body);
        if let Some(ref token) = self.token {
            request = request.bearer_auth(token.expose_secret());
        }

        let resp = match request.send().await {
            Ok(resp) => resp,
            Err(e) => {
                return Ok(HandlerOutcome::Retry {
                    reason: format!("{} unreachable: {e}", self.dependency),
                });
            }
        };

        let status = resp.status();
        if status.is_success() {
            let output = resp
                .json::<serde_json::Value>()
                .await
                .map_err(|e| HandlerError::InvalidResponse {
                    stage: self.stage,
                    reason: e.to_string(),
                })?;
            Ok(HandlerOutcome::Success { output })
        } else if status.is_client_error() {
            let detail = resp.text().await.unwrap_or_default();
            Ok(HandlerOutcome::Fatal {
                reason: format!("{} rejected request ({status}): {detail}", self.dependency),
            })
        } else {
            Ok(HandlerOutcome::Retry {
                reason: format!("{} returned {status}", self.dependency),
            })
        }
    }
}

/// Register a handler for every AI-served stage.
pub fn register_ai_handlers(registry: &mut HandlerRegistry, config: &AiServiceConfig) {
    let client = reqwest::Client::new();
    for stage in AI_STAGES {
        registry.register(Arc::new(HttpStageHandler::new(
            stage,
            "ai",
            client.clone(),
            &config.base_url,
            config.token.clone(),
        )));
    }
}

/// Register a handler for every accounting-served stage.
pub fn register_accounting_handlers(registry: &mut HandlerRegistry, config: &AccountingConfig) {
    let client = reqwest::Client::new();
    for stage in ACCOUNTING_STAGES {
        registry.register(Arc::new(HttpStageHandler::new(
            stage,
            "accounting",
            client.clone(),
            &config.base_url,
            config.token.clone(),
        )));
    }
}

/// Endpoint for a stage: `<base>/<stage name>`.
fn endpoint(base_url: &str, stage: Stage) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), stage.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_joins_cleanly() {
        assert_eq!(
            endpoint("http://ai.local:8100", Stage::Classify),
            "http://ai.local:8100/classify"
        );
        assert_eq!(
            endpoint("http://ai.local:8100/", Stage::ParseEmail),
            "http://ai.local:8100/parse_email"
        );
    }

    #[test]
    fn remote_stage_lists_are_disjoint() {
        for stage in AI_STAGES {
            assert!(!ACCOUNTING_STAGES.contains(&stage));
        }
    }

    #[test]
    fn registration_covers_every_remote_stage() {
        let mut registry = HandlerRegistry::new();
        let config = AiServiceConfig {
            base_url: "http://ai.local".into(),
            token: None,
        };
        register_ai_handlers(&mut registry, &config);

        let accounting = AccountingConfig {
            base_url: "http://accounting.local".into(),
            token: None,
        };
        register_accounting_handlers(&mut registry, &accounting);

        assert_eq!(registry.len(), AI_STAGES.len() + ACCOUNTING_STAGES.len());
        for stage in AI_STAGES.into_iter().chain(ACCOUNTING_STAGES) {
            let handler = registry.get(stage).unwrap();
            assert_eq!(handler.stage(), stage);
        }
    }

    #[test]
    fn dependencies_follow_the_serving_service() {
        let client = reqwest::Client::new();
        let ai = HttpStageHandler::new(Stage::Classify, "ai", client.clone(), "http://x", None);
        assert_eq!(ai.dependency(), Some("ai"));

        let acc = HttpStageHandler::new(
            Stage::OrchestrateOrder,
            "accounting",
            client,
            "http://x",
            None,
        );
        assert_eq!(acc.dependency(), Some("accounting"));
    }
}
