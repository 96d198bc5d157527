//! Notification stage — tells an operator about a message over SMTP.

use async_trait::async_trait;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use secrecy::{ExposeSecret, SecretString};
use tracing::info;

use crate::error::HandlerError;
use crate::executor::handler::{HandlerOutcome, StageContext, StageHandler};
use crate::model::{MailMessage, Stage};

// ── Configuration ───────────────────────────────────────────────────

/// SMTP relay settings, built from environment variables.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    pub from_address: String,
    /// Operator mailbox that receives notifications.
    pub notify_to: String,
}

impl SmtpConfig {
    /// Returns `None` unless `MAILROOM_SMTP_HOST` and `MAILROOM_NOTIFY_TO`
    /// are both set (notifications disabled).
    pub fn from_env() -> Option<Self> {
        let host = std::env::var("MAILROOM_SMTP_HOST").ok()?;
        let notify_to = std::env::var("MAILROOM_NOTIFY_TO").ok()?;

        let port: u16 = std::env::var("MAILROOM_SMTP_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(587);

        let username = std::env::var("MAILROOM_SMTP_USER").unwrap_or_default();
        let password =
            SecretString::from(std::env::var("MAILROOM_SMTP_PASSWORD").unwrap_or_default());
        let from_address =
            std::env::var("MAILROOM_SMTP_FROM").unwrap_or_else(|_| username.clone());

        Some(Self {
            host,
            port,
            username,
            password,
            from_address,
            notify_to,
        })
    }
}

// ── Handler ─────────────────────────────────────────────────────────

/// Sends the operator a plain-text summary of the message.
pub struct NotifyHandler {
    config: SmtpConfig,
}

impl NotifyHandler {
    pub fn new(config: SmtpConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl StageHandler for NotifyHandler {
    fn stage(&self) -> Stage {
        Stage::Notify
    }

    fn dependency(&self) -> Option<&str> {
        Some("mail")
    }

    async fn execute(&self, ctx: &StageContext) -> Result<HandlerOutcome, HandlerError> {
        // Address and body problems are permanent; only delivery retries.
        let email = match build_notification(&self.config, &ctx.message) {
            Ok(email) => email,
            Err(e) => {
                return Ok(HandlerOutcome::Fatal {
                    reason: e.to_string(),
                });
            }
        };

        let config = self.config.clone();
        tokio::task::spawn_blocking(move || deliver(&config, &email))
            .await
            .map_err(|e| HandlerError::Smtp(format!("send task panicked: {e}")))?
            .map_err(|e| HandlerError::Smtp(e.to_string()))?;

        info!(
            message_id = %ctx.message.id,
            to = %self.config.notify_to,
            "Notification sent"
        );
        Ok(HandlerOutcome::Success {
            output: serde_json::json!({ "notified": self.config.notify_to }),
        })
    }
}

fn build_notification(config: &SmtpConfig, msg: &MailMessage) -> anyhow::Result<Message> {
    let (subject, body) = notification_body(msg);
    let from = config
        .from_address
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid from address: {e}"))?;
    let to = config
        .notify_to
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid notify address: {e}"))?;
    Ok(Message::builder().from(from).to(to).subject(subject).body(body)?)
}

/// Blocking SMTP delivery, run on the blocking pool.
fn deliver(config: &SmtpConfig, email: &Message) -> anyhow::Result<()> {
    let creds = Credentials::new(
        config.username.clone(),
        config.password.expose_secret().to_string(),
    );

    let transport = SmtpTransport::relay(&config.host)?
        .port(config.port)
        .credentials(creds)
        .build();

    transport.send(email)?;
    Ok(())
}

/// Subject and body of the operator notification.
pub fn notification_body(msg: &MailMessage) -> (String, String) {
    let category = msg.category.as_deref().unwrap_or("unclassified");
    let subject = format!("[mailroom] {category}: {}", msg.subject);

    let mut body = format!(
        "Message {} from {} needs attention.\n\nCategory: {category}\nSubject: {}\n",
        msg.id, msg.sender, msg.subject
    );
    if let Some(confidence) = msg.confidence {
        body.push_str(&format!("Confidence: {confidence:.2}\n"));
    }
    if msg.has_attachments {
        body.push_str(&format!("Attachments: {}\n", msg.attachments.join(", ")));
    }

    (subject, body)
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::model::Direction;

    fn message() -> MailMessage {
        let now = Utc::now();
        MailMessage {
            id: "msg-77@strojirna.cz".to_string(),
            thread_id: "msg-77@strojirna.cz".to_string(),
            in_reply_to: None,
            references: None,
            direction: Direction::Inbound,
            sender: "novak@strojirna.cz".to_string(),
            subject: "Dotaz na termín dodání".to_string(),
            body: "Dobrý den, kdy dorazí objednané díly?".to_string(),
            category: Some("dotaz".to_string()),
            confidence: Some(0.92),
            has_attachments: true,
            attachments: vec!["vykres.pdf".to_string()],
            needs_review: false,
            plan: None,
            received_at: now,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn notification_subject_carries_category() {
        let (subject, _) = notification_body(&message());
        assert_eq!(subject, "[mailroom] dotaz: Dotaz na termín dodání");
    }

    #[test]
    fn notification_body_lists_details() {
        let (_, body) = notification_body(&message());
        assert!(body.contains("msg-77@strojirna.cz"));
        assert!(body.contains("novak@strojirna.cz"));
        assert!(body.contains("Confidence: 0.92"));
        assert!(body.contains("vykres.pdf"));
    }

    #[test]
    fn unclassified_message_still_renders() {
        let mut msg = message();
        msg.category = None;
        msg.confidence = None;
        let (subject, body) = notification_body(&msg);
        assert!(subject.starts_with("[mailroom] unclassified:"));
        assert!(!body.contains("Confidence"));
    }

    #[test]
    fn bad_notify_address_is_a_build_error() {
        let config = SmtpConfig {
            host: "smtp.strojirna.cz".into(),
            port: 587,
            username: "mailroom".into(),
            password: SecretString::from("hunter2".to_string()),
            from_address: "mailroom@strojirna.cz".into(),
            notify_to: "not an address".into(),
        };
        let err = build_notification(&config, &message()).unwrap_err();
        assert!(err.to_string().contains("invalid notify address"));
    }

    #[test]
    fn valid_addresses_build_a_message() {
        let config = SmtpConfig {
            host: "smtp.strojirna.cz".into(),
            port: 587,
            username: "mailroom".into(),
            password: SecretString::from("hunter2".to_string()),
            from_address: "mailroom@strojirna.cz".into(),
            notify_to: "dispecink@strojirna.cz".into(),
        };
        assert!(build_notification(&config, &message()).is_ok());
    }
}
