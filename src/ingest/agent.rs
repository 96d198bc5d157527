//! Inbound message parsing — identity, thread linkage, attachment names.
//!
//! Turns raw RFC 5322 bytes into a `MailMessage`. The thread id comes
//! from `References` (first entry) or `In-Reply-To`; a message with
//! neither is its own thread root. Attachment filenames are sanitized
//! before they are stored or logged anywhere.

use std::sync::LazyLock;

use mail_parser::{HeaderValue, MessageParser, MimeHeaders};
use regex::Regex;
use uuid::Uuid;

use crate::error::IngestError;
use crate::model::{Direction, MailMessage};

/// Maximum stored filename length, in characters.
const MAX_FILENAME_LEN: usize = 255;

static REPLY_PREFIX: LazyLock<Regex> = LazyLock::new(|| {
    // "Odp:" is the Czech reply prefix, "AW:" the German one.
    Regex::new(r"(?i)^(re|fw|fwd|aw|odp)(\[\d+\])?:\s*").unwrap()
});

/// Parse a raw message into a `MailMessage`.
///
/// A missing `Message-ID` header gets a generated `gen-<uuid>` id so the
/// message can still be stored and deduplicated by content of that id.
pub fn parse_message(raw: &[u8]) -> Result<MailMessage, IngestError> {
    let parsed = MessageParser::default()
        .parse(raw)
        .ok_or_else(|| IngestError::Parse("not a parseable MIME message".into()))?;

    let id = parsed
        .message_id()
        .map(|s| s.to_string())
        .unwrap_or_else(|| format!("gen-{}", Uuid::new_v4()));

    let references = id_list(parsed.references());
    let in_reply_to = id_list(parsed.in_reply_to()).into_iter().next();
    let thread_id = derive_thread_id(&id, in_reply_to.as_deref(), &references);

    let sender = parsed
        .from()
        .and_then(|addr| addr.first())
        .and_then(|a| a.address())
        .map(|s| s.to_string())
        .unwrap_or_else(|| "unknown".into());

    let subject = parsed.subject().unwrap_or("(no subject)").to_string();
    let body = extract_text(&parsed);

    let attachments: Vec<String> = parsed
        .attachments()
        .enumerate()
        .map(|(i, part)| {
            MimeHeaders::attachment_name(part)
                .map(sanitize_filename)
                .unwrap_or_else(|| format!("attachment-{}", i + 1))
        })
        .collect();

    let received_at = parsed
        .date()
        .and_then(|d| chrono::DateTime::from_timestamp(d.to_timestamp(), 0))
        .unwrap_or_else(chrono::Utc::now);

    let now = chrono::Utc::now();
    Ok(MailMessage {
        id,
        thread_id,
        in_reply_to,
        references: (!references.is_empty()).then(|| references.join(" ")),
        direction: Direction::Inbound,
        sender,
        subject,
        body,
        category: None,
        confidence: None,
        has_attachments: !attachments.is_empty(),
        attachments,
        needs_review: false,
        plan: None,
        received_at,
        created_at: now,
        updated_at: now,
    })
}

/// Build the payload for a message's initial `ingest` task.
pub fn build_ingest_payload(msg: &MailMessage) -> serde_json::Value {
    serde_json::json!({
        "message_id": msg.id,
        "thread_id": msg.thread_id,
        "sender": msg.sender,
        "subject": normalize_subject(&msg.subject),
        "has_attachments": msg.has_attachments,
        "attachment_count": msg.attachments.len(),
    })
}

/// Derive the thread id for a message.
///
/// First entry of `References` wins, then `In-Reply-To`, then the
/// message is its own thread root.
pub fn derive_thread_id(
    message_id: &str,
    in_reply_to: Option<&str>,
    references: &[String],
) -> String {
    if let Some(root) = references.first()
        && !root.trim().is_empty()
    {
        return root.trim().to_string();
    }
    if let Some(parent) = in_reply_to
        && !parent.trim().is_empty()
    {
        return parent.trim().to_string();
    }
    message_id.to_string()
}

/// Sanitize an attachment filename for storage.
///
/// Path separators become `_`, null bytes are dropped, and anything
/// longer than 255 characters is truncated from the stem so the
/// extension survives.
pub fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .filter(|&c| c != '\0')
        .map(|c| match c {
            '/' | '\\' => '_',
            c => c,
        })
        .collect();
    let cleaned = cleaned.trim();

    if cleaned.is_empty() {
        return "attachment".into();
    }
    if cleaned.chars().count() <= MAX_FILENAME_LEN {
        return cleaned.to_string();
    }

    // A leading dot is a hidden-file marker, not an extension.
    let (stem, ext) = match cleaned.rfind('.') {
        Some(pos) if pos > 0 && cleaned.len() - pos <= 16 => cleaned.split_at(pos),
        _ => (cleaned, ""),
    };
    let keep = MAX_FILENAME_LEN - ext.chars().count();
    let stem: String = stem.chars().take(keep).collect();
    format!("{stem}{ext}")
}

/// Strip reply/forward prefixes from a subject line, repeatedly.
///
/// `"Re: Odp: Poptávka"` → `"Poptávka"`.
pub fn normalize_subject(subject: &str) -> String {
    let mut s = subject.trim();
    while let Some(m) = REPLY_PREFIX.find(s) {
        s = s[m.end()..].trim_start();
    }
    s.to_string()
}

/// Flatten a Message-ID style header into its individual ids.
fn id_list(value: &HeaderValue<'_>) -> Vec<String> {
    match value {
        HeaderValue::Text(id) => vec![id.to_string()],
        HeaderValue::TextList(ids) => ids.iter().map(|id| id.to_string()).collect(),
        _ => Vec::new(),
    }
}

/// Extract readable text from a parsed message.
fn extract_text(parsed: &mail_parser::Message) -> String {
    if let Some(text) = parsed.body_text(0) {
        return text.to_string();
    }
    if let Some(html) = parsed.body_html(0) {
        return strip_html(html.as_ref());
    }
    "(no readable content)".to_string()
}

/// Strip HTML tags from content (basic).
fn strip_html(html: &str) -> String {
    let mut result = String::new();
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => result.push(ch),
            _ => {}
        }
    }
    result.split_whitespace().collect::<Vec<_>>().join(" ")
}
