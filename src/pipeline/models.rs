//! Capability interfaces for the scoring and extraction models.
//!
//! Each model is a pure function of text to a typed result. The classifier
//! composes them; any one can be swapped without touching the others.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;

use crate::error::ModelError;
use crate::pipeline::categories::KeywordCategoryModel;
use crate::pipeline::entities::EntityExtractor;
use crate::pipeline::sentiment::LexiconSentimentModel;
use crate::pipeline::spam::KeywordSpamModel;
use crate::pipeline::types::{Category, Entity, SentimentReading};

/// Learned component of the spam score.
pub trait SpamModel: Send + Sync {
    fn name(&self) -> &str;

    /// Probability in [0, 1] that `text` is unsolicited bulk mail.
    fn spam_probability(&self, text: &str) -> Result<f32, ModelError>;
}

/// Tone and urgency.
pub trait SentimentModel: Send + Sync {
    fn name(&self) -> &str;

    fn read(&self, text: &str) -> Result<SentimentReading, ModelError>;
}

/// Topical category scores.
pub trait CategoryModel: Send + Sync {
    fn name(&self) -> &str;

    /// Raw per-category evidence in [0, 1]. Spam and other are not required;
    /// the classifier derives them.
    fn score(&self, subject: &str, body: &str) -> Result<BTreeMap<Category, f32>, ModelError>;
}

/// People, organizations, locations and date-time expressions.
pub trait EntityModel: Send + Sync {
    fn name(&self) -> &str;

    /// Relative dates resolve against `reference`, never the wall clock.
    fn extract(&self, text: &str, reference: DateTime<Utc>) -> Result<Vec<Entity>, ModelError>;
}

/// The set of models one classifier runs with.
#[derive(Clone)]
pub struct ModelSet {
    pub spam: Arc<dyn SpamModel>,
    pub sentiment: Arc<dyn SentimentModel>,
    pub categories: Arc<dyn CategoryModel>,
    pub entities: Arc<dyn EntityModel>,
}

impl ModelSet {
    /// Built-in lexical models.
    pub fn lexical(timezone: Tz, default_meeting_length: Duration) -> Self {
        Self {
            spam: Arc::new(KeywordSpamModel::default()),
            sentiment: Arc::new(LexiconSentimentModel::default()),
            categories: Arc::new(KeywordCategoryModel::default()),
            entities: Arc::new(EntityExtractor::new(timezone, default_meeting_length)),
        }
    }
}

/// Deterministic character-bounded prefix of `text`.
pub fn truncate_chars(text: &str, bound: usize) -> &str {
    match text.char_indices().nth(bound) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncation_is_char_based() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("abc", 10), "abc");
        assert_eq!(truncate_chars("abc", 0), "");
    }
}
