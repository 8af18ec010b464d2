//! Message classifier.
//!
//! Composes the capability models over a deterministically truncated view of
//! the message and fuses their outputs into one `ClassificationResult`.
//! The spam score is a feature: it lifts the spam confidence and damps the
//! topical ones, and the dominant category is the argmax over all of them
//! with ties going to the higher-priority category.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use tracing::{debug, warn};

use crate::error::ModelError;
use crate::pipeline::models::{ModelSet, truncate_chars};
use crate::pipeline::spam::SpamScorer;
use crate::pipeline::types::{Category, ClassificationResult, ExtractedEntities, Message};

/// How strongly the spam score damps topical confidences.
const SPAM_DAMPING: f32 = 0.5;
/// Boost for newsletter when bulk headers are present.
const BULK_NEWSLETTER_BOOST: f32 = 0.3;
/// Scale for the residual "other" confidence.
const OTHER_SCALE: f32 = 0.5;

/// Message classifier with a per-message result cache.
pub struct Classifier {
    models: ModelSet,
    spam: SpamScorer,
    truncate_chars: usize,
    cache: RwLock<HashMap<String, ClassificationResult>>,
}

impl Classifier {
    pub fn new(models: ModelSet, truncate_chars: usize) -> Self {
        let spam = SpamScorer::new(models.spam.clone());
        Self::with_spam_scorer(models, spam, truncate_chars)
    }

    pub fn with_spam_scorer(models: ModelSet, spam: SpamScorer, truncate_chars: usize) -> Self {
        Self {
            models,
            spam,
            truncate_chars,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Text every model sees: subject, then the bounded body prefix.
    pub fn feature_text(&self, message: &Message) -> String {
        let body = truncate_chars(&message.body, self.truncate_chars);
        if message.subject.is_empty() {
            body.to_string()
        } else {
            format!("{}\n{}", message.subject, body)
        }
    }

    /// Classify a message. Re-classifying the same content returns the
    /// cached result; a changed content version is classified afresh.
    pub fn classify(&self, message: &Message) -> Result<ClassificationResult, ModelError> {
        let digest = message.content_digest();
        if let Some(hit) = self.cached(&message.id)
            && hit.content_digest == digest
        {
            debug!(message_id = %message.id, "Classification cache hit");
            return Ok(hit);
        }

        let result = self.compute(message, digest).inspect_err(|e| {
            warn!(message_id = %message.id, error = %e, "Classification failed");
        })?;

        if let Ok(mut cache) = self.cache.write() {
            cache.insert(message.id.clone(), result.clone());
        }
        debug!(
            message_id = %message.id,
            category = %result.dominant,
            spam = result.spam_score(),
            urgency = ?result.urgency(),
            "Message classified"
        );
        Ok(result)
    }

    /// Previously computed result for a message id.
    pub fn cached(&self, message_id: &str) -> Option<ClassificationResult> {
        self.cache
            .read()
            .ok()
            .and_then(|cache| cache.get(message_id).cloned())
    }

    /// Entities over the same bounded text the classifier sees.
    pub fn extract_entities(&self, message: &Message) -> Result<ExtractedEntities, ModelError> {
        let text = self.feature_text(message);
        let entities = self.models.entities.extract(&text, message.received_at)?;
        Ok(ExtractedEntities {
            message_id: message.id.clone(),
            entities,
        })
    }

    fn compute(&self, message: &Message, digest: String) -> Result<ClassificationResult, ModelError> {
        let text = self.feature_text(message);
        let body = truncate_chars(&message.body, self.truncate_chars);

        let spam = self.spam.score(message, &text)?;
        let sentiment = self.models.sentiment.read(&text)?;
        let raw = self.models.categories.score(&message.subject, body)?;

        let confidences = fuse(&raw, spam.score, message.headers.is_bulk());
        let dominant = dominant_category(&confidences);

        Ok(ClassificationResult {
            message_id: message.id.clone(),
            content_digest: digest,
            confidences,
            dominant,
            spam,
            sentiment,
        })
    }
}

/// Combine topical evidence with the spam score into a confidence for every category.
pub fn fuse(raw: &BTreeMap<Category, f32>, spam_score: f32, bulk: bool) -> BTreeMap<Category, f32> {
    let damp = 1.0 - SPAM_DAMPING * spam_score;
    let mut out = BTreeMap::new();
    out.insert(Category::Spam, spam_score.clamp(0.0, 1.0));

    let mut strongest = 0.0f32;
    for category in Category::PRIORITY {
        if matches!(category, Category::Spam | Category::Other) {
            continue;
        }
        let mut value = raw.get(&category).copied().unwrap_or(0.0).clamp(0.0, 1.0);
        if category == Category::Newsletter && bulk {
            value = (value + BULK_NEWSLETTER_BOOST).min(1.0);
        }
        let value = value * damp;
        strongest = strongest.max(value);
        out.insert(category, value);
    }

    out.insert(Category::Other, (1.0 - strongest) * OTHER_SCALE);
    out
}

/// Argmax in priority order; a later category must be strictly greater to win.
pub fn dominant_category(confidences: &BTreeMap<Category, f32>) -> Category {
    let mut best = Category::Other;
    let mut best_value = f32::NEG_INFINITY;
    for category in Category::PRIORITY {
        let value = confidences.get(&category).copied().unwrap_or(0.0);
        if value > best_value {
            best = category;
            best_value = value;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::{Duration, TimeZone, Utc};
    use chrono_tz::Tz;

    use crate::pipeline::models::testing::OfflineModel;
    use crate::pipeline::types::MessageHeaders;

    fn classifier() -> Classifier {
        Classifier::new(ModelSet::lexical(Tz::UTC, Duration::hours(1)), 10_000)
    }

    fn make_message(id: &str, subject: &str, body: &str) -> Message {
        Message {
            id: id.into(),
            thread_id: "t1".into(),
            sender: "alice@acme.com".into(),
            sender_name: Some("Alice".into()),
            recipients: vec!["me@example.org".into()],
            subject: subject.into(),
            body: body.into(),
            received_at: Utc.with_ymd_and_hms(2026, 3, 9, 8, 0, 0).unwrap(),
            headers: MessageHeaders::default(),
        }
    }

    #[test]
    fn meeting_request_is_dominant() {
        let msg = make_message("m1", "Meeting next week", "Can we meet Tuesday 3-4pm?");
        let result = classifier().classify(&msg).unwrap();
        assert_eq!(result.dominant, Category::MeetingRequest);
        assert!(result.confidence(Category::MeetingRequest) > 0.5);
        assert_eq!(result.confidences.len(), Category::PRIORITY.len());
    }

    #[test]
    fn empty_message_is_other() {
        let msg = make_message("m1", "", "");
        let result = classifier().classify(&msg).unwrap();
        assert_eq!(result.dominant, Category::Other);
    }

    #[test]
    fn classification_is_deterministic() {
        let msg = make_message("m1", "Invoice 42", "Please find the invoice attached; payment due Friday.");
        let a = classifier().classify(&msg).unwrap();
        let b = classifier().classify(&msg).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn cache_tracks_content_version() {
        let c = classifier();
        let mut msg = make_message("m1", "Help", "The app is broken");
        let first = c.classify(&msg).unwrap();
        assert_eq!(c.cached("m1"), Some(first.clone()));

        msg.body = "Never mind, please send the invoice".into();
        let second = c.classify(&msg).unwrap();
        assert_ne!(first.content_digest, second.content_digest);
        assert_eq!(c.cached("m1").unwrap().content_digest, second.content_digest);
    }

    #[test]
    fn truncation_bound_is_respected() {
        let c = Classifier::new(ModelSet::lexical(Tz::UTC, Duration::hours(1)), 5);
        let msg = make_message("m1", "", "hello, here is the invoice");
        let result = c.classify(&msg).unwrap();
        assert_eq!(result.confidence(Category::Invoice), 0.0);
    }

    #[test]
    fn ties_go_to_higher_priority() {
        let mut confidences = BTreeMap::new();
        for category in Category::PRIORITY {
            confidences.insert(category, 0.4);
        }
        assert_eq!(dominant_category(&confidences), Category::Spam);
        confidences.insert(Category::Spam, 0.1);
        assert_eq!(dominant_category(&confidences), Category::MeetingRequest);
    }

    #[test]
    fn spam_damps_topical_confidence() {
        let mut raw = BTreeMap::new();
        raw.insert(Category::MeetingRequest, 0.8);
        let clean = fuse(&raw, 0.0, false);
        let spammy = fuse(&raw, 0.9, false);
        assert!(spammy[&Category::MeetingRequest] < clean[&Category::MeetingRequest]);
        assert_eq!(dominant_category(&spammy), Category::Spam);
    }

    #[test]
    fn lottery_mail_is_spam() {
        let msg = make_message(
            "m1",
            "CONGRATULATIONS WINNER!!!",
            "You won the lottery! Claim your free money now, click here: https://x.example/claim",
        );
        let result = classifier().classify(&msg).unwrap();
        assert_eq!(result.dominant, Category::Spam);
        assert!(result.spam_score() >= 0.7);
    }

    #[test]
    fn model_outage_is_an_error_not_other() {
        let mut models = ModelSet::lexical(Tz::UTC, Duration::hours(1));
        models.categories = Arc::new(OfflineModel);
        let c = Classifier::new(models, 10_000);
        let msg = make_message("m1", "Hello", "World");
        assert!(matches!(c.classify(&msg), Err(ModelError::Unavailable { .. })));
        assert!(c.cached("m1").is_none());
    }
}
