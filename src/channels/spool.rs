//! Directory spool mailbox: `.eml` files in, `.eml` files out.
//!
//! Inbound: every `*.eml` in the inbox directory is parsed with mail-parser
//! and moved to `processed/` (or `rejected/` when unparseable), so a restart
//! never hands the same file to the pipeline twice.
//! Outbound: replies are rendered as RFC 5322 messages with lettre's builder
//! and written to the outbox directory for whatever relay picks them up.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lettre::message::header::{Header, HeaderName, HeaderValue};
use lettre::message::{Mailbox, Message as MimeMessage};
use mail_parser::MessageParser;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::error::TransportError;
use crate::pipeline::types::{MailboxProvider, Message, MessageHeaders, OutboundReply};

const PROCESSED_DIR: &str = "processed";
const REJECTED_DIR: &str = "rejected";

// ── Configuration ───────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SpoolConfig {
    pub inbox_dir: PathBuf,
    pub outbox_dir: PathBuf,
    /// Address replies are sent from.
    pub from_address: String,
    pub from_name: Option<String>,
}

impl SpoolConfig {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            inbox_dir: config.inbox_dir.clone(),
            outbox_dir: config.outbox_dir.clone(),
            from_address: config
                .user_address
                .clone()
                .unwrap_or_else(|| "autopilot@localhost".to_string()),
            from_name: Some(config.user_name.clone()).filter(|n| !n.trim().is_empty()),
        }
    }
}

// ── Auto-Submitted header ───────────────────────────────────────────

/// `Auto-Submitted` (RFC 3834). Always `auto-replied` on our replies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutoSubmitted(String);

impl Default for AutoSubmitted {
    fn default() -> Self {
        Self("auto-replied".to_string())
    }
}

impl Header for AutoSubmitted {
    fn name() -> HeaderName {
        HeaderName::new_from_ascii_str("Auto-Submitted")
    }

    fn parse(s: &str) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        Ok(Self(s.trim().to_string()))
    }

    fn display(&self) -> HeaderValue {
        HeaderValue::new(Self::name(), self.0.clone())
    }
}

// ── Mailbox ─────────────────────────────────────────────────────────

pub struct SpoolMailbox {
    config: SpoolConfig,
}

impl SpoolMailbox {
    /// Open the spool, creating its directories.
    pub async fn open(config: SpoolConfig) -> Result<Self, TransportError> {
        for dir in [
            config.inbox_dir.clone(),
            config.inbox_dir.join(PROCESSED_DIR),
            config.inbox_dir.join(REJECTED_DIR),
            config.outbox_dir.clone(),
        ] {
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|e| TransportError::Fetch {
                    reason: format!("cannot create {}: {e}", dir.display()),
                })?;
        }
        info!(
            inbox = %config.inbox_dir.display(),
            outbox = %config.outbox_dir.display(),
            "Spool mailbox opened"
        );
        Ok(Self { config })
    }

    async fn pending_files(&self) -> Result<Vec<PathBuf>, TransportError> {
        let mut entries = tokio::fs::read_dir(&self.config.inbox_dir)
            .await
            .map_err(|e| TransportError::Fetch {
                reason: format!("read inbox: {e}"),
            })?;
        let mut files = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("eml")) {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    async fn move_to(&self, path: &Path, subdir: &str) -> Result<(), TransportError> {
        let Some(name) = path.file_name() else {
            return Ok(());
        };
        let target = self.config.inbox_dir.join(subdir).join(name);
        tokio::fs::rename(path, &target)
            .await
            .map_err(|e| TransportError::Fetch {
                reason: format!("move {}: {e}", path.display()),
            })
    }

    fn render(&self, reply: &OutboundReply) -> Result<MimeMessage, String> {
        let from: Mailbox = match &self.config.from_name {
            Some(name) => format!("{name} <{}>", self.config.from_address),
            None => self.config.from_address.clone(),
        }
        .parse()
        .map_err(|e| format!("Invalid from address: {e}"))?;
        let to: Mailbox = reply
            .to
            .parse()
            .map_err(|e| format!("Invalid to address: {e}"))?;

        let mut builder = MimeMessage::builder()
            .from(from)
            .to(to)
            .subject(reply.subject.clone())
            .in_reply_to(angle(&reply.in_reply_to))
            .header(AutoSubmitted::default());
        if !reply.references.is_empty() {
            let chain = reply
                .references
                .iter()
                .map(|r| angle(r))
                .collect::<Vec<_>>()
                .join(" ");
            builder = builder.references(chain);
        }
        builder
            .body(reply.body.clone())
            .map_err(|e| format!("Failed to build email: {e}"))
    }
}

#[async_trait]
impl MailboxProvider for SpoolMailbox {
    fn name(&self) -> &str {
        "spool"
    }

    async fn fetch_new(&self) -> Result<Vec<Message>, TransportError> {
        let mut messages = Vec::new();
        for path in self.pending_files().await? {
            let bytes = tokio::fs::read(&path)
                .await
                .map_err(|e| TransportError::Fetch {
                    reason: format!("read {}: {e}", path.display()),
                })?;
            let fallback_id = path
                .file_stem()
                .map(|s| format!("spool-{}", s.to_string_lossy()))
                .unwrap_or_else(|| format!("spool-{}", Uuid::new_v4()));

            match parse_eml(&bytes, &fallback_id) {
                Some(message) => {
                    debug!(message_id = %message.id, file = %path.display(), "Spooled message fetched");
                    self.move_to(&path, PROCESSED_DIR).await?;
                    messages.push(message);
                }
                None => {
                    warn!(file = %path.display(), "Unparseable message moved aside");
                    self.move_to(&path, REJECTED_DIR).await?;
                }
            }
        }
        Ok(messages)
    }

    async fn send_reply(&self, reply: &OutboundReply) -> Result<(), TransportError> {
        let send_err = |reason: String| TransportError::Send {
            thread_id: reply.thread_id.clone(),
            reason,
        };
        let email = self.render(reply).map_err(send_err)?;
        let path = self.config.outbox_dir.join(format!(
            "{}-{}.eml",
            Utc::now().format("%Y%m%dT%H%M%S"),
            Uuid::new_v4()
        ));
        tokio::fs::write(&path, email.formatted())
            .await
            .map_err(|e| send_err(format!("write {}: {e}", path.display())))?;
        info!(to = %reply.to, thread_id = %reply.thread_id, file = %path.display(), "Reply written to outbox");
        Ok(())
    }
}

// ── Parsing ─────────────────────────────────────────────────────────

/// Parse a raw RFC 5322 message. `fallback_id` is used when the message
/// carries no Message-ID.
pub fn parse_eml(raw: &[u8], fallback_id: &str) -> Option<Message> {
    let parsed = MessageParser::default().parse(raw)?;

    let sender_entry = parsed.from().and_then(|a| a.first());
    let sender = sender_entry
        .and_then(|a| a.address())
        .map(|s| s.to_string())?;
    let sender_name = sender_entry.and_then(|a| a.name()).map(|s| s.to_string());

    let id = parsed
        .message_id()
        .map(|s| s.to_string())
        .unwrap_or_else(|| fallback_id.to_string());
    let references: Vec<String> = parsed
        .references()
        .as_text_list()
        .map(|list| list.into_iter().map(|s| s.to_string()).collect())
        .unwrap_or_default();
    let in_reply_to = parsed.in_reply_to().as_text().map(|s| s.to_string());
    let thread_id = references
        .first()
        .cloned()
        .or_else(|| in_reply_to.clone())
        .unwrap_or_else(|| id.clone());

    let mut recipients = extract_addresses(parsed.to());
    recipients.extend(extract_addresses(parsed.cc()));

    let received_at = parsed
        .date()
        .and_then(|d| DateTime::<Utc>::from_timestamp(d.to_timestamp(), 0))
        .unwrap_or_else(Utc::now);

    let body = match parsed.body_text(0) {
        Some(text) => text.to_string(),
        None => parsed
            .body_html(0)
            .map(|html| strip_html(html.as_ref()))
            .unwrap_or_default(),
    };

    let headers = MessageHeaders {
        in_reply_to,
        references,
        auto_submitted: header_text(&parsed, "Auto-Submitted"),
        reply_to: parsed
            .reply_to()
            .and_then(|a| a.first())
            .and_then(|a| a.address())
            .map(|s| s.to_string()),
        precedence: header_text(&parsed, "Precedence"),
        list_id: header_text(&parsed, "List-Id"),
        list_unsubscribe: header_text(&parsed, "List-Unsubscribe"),
    };

    Some(Message {
        id,
        thread_id,
        sender,
        sender_name,
        recipients,
        subject: parsed.subject().unwrap_or_default().to_string(),
        body,
        received_at,
        headers,
    })
}

/// Value of a header by name. Structured values fall back to the raw text.
fn header_text(parsed: &mail_parser::Message, name: &str) -> Option<String> {
    let header = parsed
        .headers()
        .iter()
        .find(|h| h.name().eq_ignore_ascii_case(name))?;
    if let Some(text) = header.value().as_text() {
        return Some(text.trim().to_string());
    }
    let raw = parsed
        .raw_message()
        .get(header.offset_start as usize..header.offset_end as usize)?;
    Some(String::from_utf8_lossy(raw).trim().to_string())
}

/// Extract email addresses from an optional mail_parser Address field.
fn extract_addresses(addr: Option<&mail_parser::Address>) -> Vec<String> {
    let Some(addr) = addr else {
        return Vec::new();
    };
    match addr {
        mail_parser::Address::List(addrs) => addrs
            .iter()
            .filter_map(|a| a.address.as_ref().map(|s| s.to_string()))
            .collect(),
        mail_parser::Address::Group(groups) => groups
            .iter()
            .flat_map(|g| {
                g.addresses
                    .iter()
                    .filter_map(|a| a.address.as_ref().map(|s| s.to_string()))
            })
            .collect(),
    }
}

/// Strip HTML tags from content (basic).
pub fn strip_html(html: &str) -> String {
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

fn angle(id: &str) -> String {
    let id = id.trim();
    if id.starts_with('<') {
        id.to_string()
    } else {
        format!("<{id}>")
    }
}
