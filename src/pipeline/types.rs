//! Shared types for the message decision pipeline.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::calendar::model::TimeWindow;
use crate::error::TransportError;

// ── Inbound message ─────────────────────────────────────────────────

/// Header subset the pipeline looks at.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeaders {
    /// `In-Reply-To` message id, angle brackets stripped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<String>,
    /// `References` chain, oldest first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub references: Vec<String>,
    /// Raw `Auto-Submitted` value (RFC 3834).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_submitted: Option<String>,
    /// `Reply-To` address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    /// `Precedence` header (bulk, list, junk, auto_reply).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub precedence: Option<String>,
    /// `List-Id` header.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub list_id: Option<String>,
    /// `List-Unsubscribe` header.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub list_unsubscribe: Option<String>,
}

impl MessageHeaders {
    /// Whether any bulk-sending marker is present.
    pub fn is_bulk(&self) -> bool {
        let bulk_precedence = self.precedence.as_deref().is_some_and(|p| {
            matches!(p.trim().to_ascii_lowercase().as_str(), "bulk" | "list" | "junk")
        });
        bulk_precedence || self.list_id.is_some() || self.list_unsubscribe.is_some()
    }
}

/// An already-fetched mailbox message. Owned by the caller; the pipeline
/// only reads it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Provider-unique id.
    pub id: String,
    /// Conversation thread id.
    pub thread_id: String,
    /// Sender address.
    pub sender: String,
    /// Sender display name (if available).
    #[serde(default)]
    pub sender_name: Option<String>,
    /// To/Cc recipients.
    #[serde(default)]
    pub recipients: Vec<String>,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub body: String,
    pub received_at: DateTime<Utc>,
    #[serde(default)]
    pub headers: MessageHeaders,
}

/// Subject/body phrases that mark vacation responders and other robots
/// that forgot to set `Auto-Submitted`.
const AUTO_REPLY_PHRASES: &[&str] = &[
    "auto-reply",
    "autoreply",
    "automatic reply",
    "out of office",
    "out-of-office",
    "away from the office",
    "réponse automatique",
    "absence du bureau",
];

impl Message {
    /// True when the message was generated by a machine and must never be
    /// answered automatically.
    pub fn is_auto_submitted(&self) -> bool {
        if let Some(value) = self.headers.auto_submitted.as_deref() {
            let value = value.trim().to_ascii_lowercase();
            if !value.is_empty() && value != "no" {
                return true;
            }
        }
        if self
            .headers
            .precedence
            .as_deref()
            .is_some_and(|p| p.trim().eq_ignore_ascii_case("auto_reply"))
        {
            return true;
        }
        let subject = self.subject.to_lowercase();
        AUTO_REPLY_PHRASES.iter().any(|p| subject.contains(p))
    }

    /// Domain part of the sender address, lowercased.
    pub fn sender_domain(&self) -> Option<String> {
        address_domain(&self.sender)
    }

    /// Display name if present, else the local part of the address.
    pub fn sender_display(&self) -> String {
        if let Some(name) = self.sender_name.as_deref().filter(|n| !n.trim().is_empty()) {
            return name.trim().to_string();
        }
        let local = self.sender.split('@').next().unwrap_or(&self.sender);
        local
            .split(['.', '_', '-'])
            .filter(|s| !s.is_empty())
            .map(capitalize)
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// SHA-256 over subject and body. Identifies a content version.
    pub fn content_digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.subject.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.body.as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Lowercased domain of an email address, tolerating `Name <addr>` forms.
pub fn address_domain(address: &str) -> Option<String> {
    let addr = address
        .rsplit_once('<')
        .map(|(_, rest)| rest.trim_end_matches('>'))
        .unwrap_or(address);
    let (_, domain) = addr.rsplit_once('@')?;
    let domain = domain.trim().trim_end_matches('>').to_ascii_lowercase();
    (!domain.is_empty()).then_some(domain)
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

// ── Categories ──────────────────────────────────────────────────────

/// Topical category of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Spam,
    MeetingRequest,
    Invoice,
    Application,
    Support,
    Newsletter,
    Other,
}

impl Category {
    /// Tie-break order for the dominant category, highest priority first.
    pub const PRIORITY: [Category; 7] = [
        Category::Spam,
        Category::MeetingRequest,
        Category::Invoice,
        Category::Application,
        Category::Support,
        Category::Newsletter,
        Category::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Spam => "spam",
            Self::MeetingRequest => "meeting_request",
            Self::Invoice => "invoice",
            Self::Application => "application",
            Self::Support => "support",
            Self::Newsletter => "newsletter",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "spam" => Ok(Self::Spam),
            "meeting_request" | "meeting" | "rdv" => Ok(Self::MeetingRequest),
            "invoice" | "facture" => Ok(Self::Invoice),
            "application" | "cv" => Ok(Self::Application),
            "support" => Ok(Self::Support),
            "newsletter" => Ok(Self::Newsletter),
            "other" | "general" => Ok(Self::Other),
            other => Err(format!("unknown category '{other}'")),
        }
    }
}

// ── Sentiment / urgency ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SentimentLabel {
    Positive,
    Neutral,
    Negative,
}

/// Ordered urgency level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Low,
    Normal,
    High,
    Critical,
}

/// Tone and urgency of a text.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SentimentReading {
    pub label: SentimentLabel,
    /// Polarity in [-1, 1].
    pub polarity: f32,
    pub urgency: Urgency,
}

// ── Classification ──────────────────────────────────────────────────

/// One heuristic's contribution to the spam score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpamSignal {
    pub name: String,
    pub boost: f32,
}

/// Spam score with its breakdown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpamAssessment {
    /// Final score in [0, 1].
    pub score: f32,
    /// Model component before heuristics.
    pub learned: f32,
    /// Heuristic boosts after per-signal capping.
    pub signals: Vec<SpamSignal>,
}

/// Per-message classification. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub message_id: String,
    /// Digest of the content version this result belongs to.
    pub content_digest: String,
    /// Confidence in [0, 1] for every category.
    pub confidences: BTreeMap<Category, f32>,
    pub dominant: Category,
    pub spam: SpamAssessment,
    pub sentiment: SentimentReading,
}

impl ClassificationResult {
    pub fn confidence(&self, category: Category) -> f32 {
        self.confidences.get(&category).copied().unwrap_or(0.0)
    }

    pub fn spam_score(&self) -> f32 {
        self.spam.score
    }

    pub fn urgency(&self) -> Urgency {
        self.sentiment.urgency
    }
}

// ── Entities ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Person,
    Organization,
    Location,
    DateTimeExpression,
}

/// Byte span into the scanned text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

/// A single extracted entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub text: String,
    pub kind: EntityKind,
    pub span: Span,
    /// Absolute window, only for date-time expressions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window: Option<TimeWindow>,
    /// Extraction confidence in [0, 1].
    pub confidence: f32,
}

/// All entities found in a message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractedEntities {
    pub message_id: String,
    pub entities: Vec<Entity>,
}

impl ExtractedEntities {
    pub fn of_kind(&self, kind: EntityKind) -> impl Iterator<Item = &Entity> {
        self.entities.iter().filter(move |e| e.kind == kind)
    }

    /// Date-time entities that resolved to an absolute window.
    pub fn date_times(&self) -> impl Iterator<Item = (&Entity, &TimeWindow)> {
        self.of_kind(EntityKind::DateTimeExpression)
            .filter_map(|e| e.window.as_ref().map(|w| (e, w)))
    }
}

// ── Outbound ────────────────────────────────────────────────────────

/// An automatic reply ready for the mail-sending collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundReply {
    pub thread_id: String,
    /// Message being answered.
    pub in_reply_to: String,
    pub to: String,
    pub subject: String,
    pub body: String,
    /// References chain for threading.
    #[serde(default)]
    pub references: Vec<String>,
}

// ── Mailbox adapter trait ───────────────────────────────────────────

/// Mailbox collaborator: pure I/O, no business logic.
///
/// Fetching and sending are opaque operations that may fail with a
/// transport error. Decisions live in the pipeline.
#[async_trait]
pub trait MailboxProvider: Send + Sync {
    /// Provider name for logging.
    fn name(&self) -> &str;

    /// Fetch messages not yet handed to the pipeline.
    async fn fetch_new(&self) -> Result<Vec<Message>, TransportError>;

    /// Transmit an automatic reply on a thread.
    async fn send_reply(&self, reply: &OutboundReply) -> Result<(), TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_message(subject: &str, headers: MessageHeaders) -> Message {
        Message {
            id: "m1".into(),
            thread_id: "t1".into(),
            sender: "jane.doe@example.com".into(),
            sender_name: None,
            recipients: vec!["me@example.org".into()],
            subject: subject.into(),
            body: "Hello".into(),
            received_at: Utc::now(),
            headers,
        }
    }

    #[test]
    fn auto_submitted_header_detected() {
        let headers = MessageHeaders {
            auto_submitted: Some("auto-replied".into()),
            ..Default::default()
        };
        assert!(make_message("Re: hi", headers).is_auto_submitted());
    }

    #[test]
    fn auto_submitted_no_is_human() {
        let headers = MessageHeaders {
            auto_submitted: Some("no".into()),
            ..Default::default()
        };
        assert!(!make_message("Question", headers).is_auto_submitted());
    }

    #[test]
    fn out_of_office_subject_counts_as_automated() {
        let msg = make_message("Out of Office: back Monday", MessageHeaders::default());
        assert!(msg.is_auto_submitted());
    }

    #[test]
    fn bulk_headers() {
        let headers = MessageHeaders {
            precedence: Some("Bulk".into()),
            ..Default::default()
        };
        assert!(headers.is_bulk());
        assert!(!MessageHeaders::default().is_bulk());
    }

    #[test]
    fn sender_display_falls_back_to_local_part() {
        let msg = make_message("x", MessageHeaders::default());
        assert_eq!(msg.sender_display(), "Jane Doe");
    }

    #[test]
    fn address_domain_handles_display_form() {
        assert_eq!(
            address_domain("Jane <jane@Example.COM>").as_deref(),
            Some("example.com")
        );
        assert_eq!(address_domain("no-at-sign"), None);
    }

    #[test]
    fn digest_changes_with_content() {
        let a = make_message("Hello", MessageHeaders::default());
        let mut b = a.clone();
        assert_eq!(a.content_digest(), b.content_digest());
        b.body.push('!');
        assert_ne!(a.content_digest(), b.content_digest());
    }

    #[test]
    fn category_parsing_accepts_aliases() {
        assert_eq!("cv".parse::<Category>(), Ok(Category::Application));
        assert_eq!("Meeting_Request".parse::<Category>(), Ok(Category::MeetingRequest));
        assert!("bogus".parse::<Category>().is_err());
    }

    #[test]
    fn category_serializes_snake_case() {
        let json = serde_json::to_string(&Category::MeetingRequest).unwrap();
        assert_eq!(json, "\"meeting_request\"");
    }

    #[test]
    fn urgency_is_ordered() {
        assert!(Urgency::Low < Urgency::Normal);
        assert!(Urgency::High < Urgency::Critical);
    }
}
