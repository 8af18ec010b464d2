//! Lexicon sentiment and lexical urgency markers.
//!
//! Urgency comes from marker phrases. Polarity only escalates a level that a
//! marker already raised, so an angry message without a deadline stays at
//! `Normal`.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::ModelError;
use crate::pipeline::models::SentimentModel;
use crate::pipeline::types::{SentimentLabel, SentimentReading, Urgency};

/// Polarity above which text reads as positive (and below the negation, negative).
const LABEL_CUTOFF: f32 = 0.25;
/// Negative polarity that promotes a `High` marker to `Critical`.
const ESCALATION_POLARITY: f32 = -0.5;
const NORMALIZATION_ALPHA: f32 = 15.0;

static WORD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\p{L}']+").expect("static regex"));

static CRITICAL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(emergency|critical|outage|production (?:is )?down|immediately|urgence)\b")
        .expect("static regex")
});

static HIGH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(urgent|urgently|asap|deadline|end of (?:the )?day|eod|right away|time[- ]sensitive|as soon as possible|today if possible)\b",
    )
    .expect("static regex")
});

static LOW_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(no rush|no hurry|whenever (?:you can|convenient)|fyi|low priority|not urgent)\b")
        .expect("static regex")
});

const NEGATORS: &[&str] = &[
    "not", "no", "never", "don't", "doesn't", "didn't", "isn't", "wasn't", "aren't", "won't",
    "can't", "cannot", "ne", "pas",
];

const INTENSIFIERS: &[&str] = &[
    "very", "extremely", "really", "so", "totally", "absolutely", "incredibly", "très",
];

/// Word-level lexicon scorer.
pub struct LexiconSentimentModel {
    lexicon: HashMap<&'static str, f32>,
}

impl Default for LexiconSentimentModel {
    fn default() -> Self {
        let positive: &[(&str, f32)] = &[
            ("thanks", 1.5),
            ("thank", 1.5),
            ("great", 2.0),
            ("excellent", 2.5),
            ("happy", 2.0),
            ("glad", 1.5),
            ("pleased", 1.5),
            ("appreciate", 1.5),
            ("wonderful", 2.5),
            ("good", 1.5),
            ("love", 2.5),
            ("perfect", 2.0),
            ("helpful", 1.5),
            ("merci", 1.5),
            ("super", 1.5),
            ("ravi", 2.0),
        ];
        let negative: &[(&str, f32)] = &[
            ("angry", -2.5),
            ("disappointed", -2.0),
            ("unacceptable", -2.5),
            ("terrible", -2.5),
            ("awful", -2.5),
            ("bad", -1.5),
            ("problem", -1.0),
            ("issue", -0.5),
            ("broken", -1.5),
            ("frustrated", -2.0),
            ("frustrating", -2.0),
            ("complaint", -1.5),
            ("poor", -1.5),
            ("worst", -3.0),
            ("failed", -1.5),
            ("error", -1.0),
            ("refund", -0.5),
            ("déçu", -2.0),
            ("inacceptable", -2.5),
        ];
        Self {
            lexicon: positive.iter().chain(negative).copied().collect(),
        }
    }
}

impl LexiconSentimentModel {
    /// Normalized polarity in (-1, 1).
    pub fn polarity(&self, text: &str) -> f32 {
        let tokens: Vec<String> = WORD_RE
            .find_iter(text)
            .map(|m| m.as_str().to_lowercase())
            .collect();

        let mut sum = 0.0f32;
        for (i, token) in tokens.iter().enumerate() {
            let Some(&valence) = self.lexicon.get(token.as_str()) else {
                continue;
            };
            let window = &tokens[i.saturating_sub(3)..i];
            let mut value = valence;
            if window.iter().any(|t| INTENSIFIERS.contains(&t.as_str())) {
                value *= 1.3;
            }
            if window.iter().any(|t| NEGATORS.contains(&t.as_str())) {
                value *= -0.75;
            }
            sum += value;
        }

        let exclamations = text.matches('!').count().min(3) as f32;
        if sum > 0.0 {
            sum += 0.3 * exclamations;
        } else if sum < 0.0 {
            sum -= 0.3 * exclamations;
        }

        sum / (sum * sum + NORMALIZATION_ALPHA).sqrt()
    }
}

/// Urgency from markers, escalated by strongly negative tone.
pub fn urgency_of(text: &str, polarity: f32) -> Urgency {
    if CRITICAL_RE.is_match(text) {
        return Urgency::Critical;
    }
    if HIGH_RE.is_match(text) {
        return if polarity <= ESCALATION_POLARITY {
            Urgency::Critical
        } else {
            Urgency::High
        };
    }
    if LOW_RE.is_match(text) {
        return Urgency::Low;
    }
    Urgency::Normal
}

fn label_of(polarity: f32) -> SentimentLabel {
    if polarity > LABEL_CUTOFF {
        SentimentLabel::Positive
    } else if polarity < -LABEL_CUTOFF {
        SentimentLabel::Negative
    } else {
        SentimentLabel::Neutral
    }
}

impl SentimentModel for LexiconSentimentModel {
    fn name(&self) -> &str {
        "lexicon-sentiment"
    }

    fn read(&self, text: &str) -> Result<SentimentReading, ModelError> {
        let polarity = self.polarity(text);
        Ok(SentimentReading {
            label: label_of(polarity),
            polarity,
            urgency: urgency_of(text, polarity),
        })
    }
}
