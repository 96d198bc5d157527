//! Stage router — turns a classified message into an ordered stage plan.
//!
//! Routing is a pure decision over (category, confidence, attachment flag,
//! review flag). The only side effect is an audit log line per decision;
//! task creation happens in the executor after the plan is persisted.

use tracing::{info, warn};

use crate::model::{Category, Stage};

/// Routing rules, parameterized by the confidence gate.
pub struct Router {
    review_threshold: f64,
}

impl Router {
    pub fn new(review_threshold: f64) -> Self {
        Self { review_threshold }
    }

    /// Compute the stage plan for a classified message.
    ///
    /// Rules, in order:
    /// 1. `needs_review` or `confidence` below the threshold routes to
    ///    review and nothing else, regardless of category or attachments.
    /// 2. Attachments prepend `process_attachments` to the category plan.
    /// 3. The category table supplies the remaining stages. An
    ///    unrecognized category with no attachments yields an empty plan;
    ///    the message stays unrouted and is surfaced via the audit log.
    pub fn route(
        &self,
        category: Option<Category>,
        confidence: f64,
        has_attachments: bool,
        needs_review: bool,
    ) -> Vec<Stage> {
        let stages = if needs_review || confidence < self.review_threshold {
            vec![Stage::Review]
        } else {
            let mut stages = Vec::new();
            if has_attachments {
                stages.push(Stage::ProcessAttachments);
            }
            stages.extend(category_stages(category, has_attachments));
            stages
        };

        if stages.is_empty() {
            warn!(
                category = category.map(|c| c.as_str()).unwrap_or("unrecognized"),
                confidence,
                "Routing produced no stages; message left unrouted"
            );
        } else {
            info!(
                category = category.map(|c| c.as_str()).unwrap_or("unrecognized"),
                confidence,
                has_attachments,
                needs_review,
                stages = %join_stages(&stages),
                "Routing decision"
            );
        }

        stages
    }
}

/// The per-category stage table. Attachment handling is resolved by the
/// caller; this only decides what follows it.
fn category_stages(category: Option<Category>, has_attachments: bool) -> Vec<Stage> {
    match category {
        Some(Category::Poptavka) => vec![
            Stage::ParseEmail,
            Stage::OrchestrateOrder,
            Stage::AutoCalculate,
            Stage::GenerateOffer,
        ],
        Some(Category::Objednavka) | Some(Category::Faktura) | Some(Category::InformaceZakazka) => {
            vec![Stage::ParseEmail, Stage::OrchestrateOrder]
        }
        Some(Category::Reklamace) => vec![Stage::ParseEmail, Stage::Escalate],
        Some(Category::ObchodniSdeleni) => vec![Stage::Archive],
        Some(Category::Dotaz) => vec![Stage::OrchestrateOrder, Stage::Notify],
        // An attachment-only message with no attachments is suspect;
        // hand it to a human. With attachments the prepended
        // process_attachments stage is the whole plan.
        Some(Category::Priloha) => {
            if has_attachments {
                vec![]
            } else {
                vec![Stage::Review]
            }
        }
        None => vec![],
    }
}

fn join_stages(stages: &[Stage]) -> String {
    stages
        .iter()
        .map(Stage::as_str)
        .collect::<Vec<_>>()
        .join(",")
}
