//! Spam scoring: a learned probability plus capped heuristic boosts.
//!
//! Heuristics are regex rules over a message field (sender, subject or
//! content) or structural checks on headers. Each boost is capped at
//! [`MAX_SIGNAL_BOOST`] and the sum at [`MAX_TOTAL_BOOST`], so no single rule
//! can carry a message over the configured spam threshold on its own.

use std::sync::{Arc, LazyLock};

use regex::Regex;
use tracing::debug;

use crate::error::ModelError;
use crate::pipeline::models::SpamModel;
use crate::pipeline::types::{Message, SpamAssessment, SpamSignal, address_domain};

/// Ceiling for any single heuristic.
pub const MAX_SIGNAL_BOOST: f32 = 0.2;
/// Ceiling for the sum of all heuristics.
pub const MAX_TOTAL_BOOST: f32 = 0.35;

const LINK_RATIO_LIMIT: f32 = 0.1;

// ── Learned component ───────────────────────────────────────────────

/// Weighted keyword model. Score is `min(1, sum / 3)` over distinct hits.
pub struct KeywordSpamModel {
    keywords: Vec<(&'static str, f32)>,
}

impl Default for KeywordSpamModel {
    fn default() -> Self {
        Self {
            keywords: vec![
                ("viagra", 0.9),
                ("casino", 0.8),
                ("lottery", 0.9),
                ("winner", 0.7),
                ("free money", 0.9),
                ("guarantee", 0.6),
                ("act now", 0.7),
                ("limited time", 0.6),
                ("congratulations", 0.5),
                ("click here", 0.7),
                ("buy now", 0.8),
                ("gratuit", 0.7),
                ("gagnant", 0.8),
                ("félicitations", 0.5),
                ("cliquez ici", 0.7),
            ],
        }
    }
}

impl SpamModel for KeywordSpamModel {
    fn name(&self) -> &str {
        "keyword-spam"
    }

    fn spam_probability(&self, text: &str) -> Result<f32, ModelError> {
        let lower = text.to_lowercase();
        let sum: f32 = self
            .keywords
            .iter()
            .filter(|(kw, _)| lower.contains(kw))
            .map(|(_, w)| w)
            .sum();
        Ok((sum / 3.0).min(1.0))
    }
}

// ── Heuristics ──────────────────────────────────────────────────────

/// Which field a rule matches against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleField {
    Sender,
    Subject,
    Content,
}

/// A regex heuristic with its boost.
#[derive(Debug, Clone)]
pub struct SpamRule {
    pub name: String,
    pub regex: Regex,
    pub field: RuleField,
    pub boost: f32,
}

static URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(?:https?://|www\.)\S+").expect("static regex"));

static WORD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\p{L}\p{N}']+").expect("static regex"));

const DISPOSABLE_DOMAINS: &[&str] = &[
    "temp-mail",
    "guerrillamail",
    "10minutemail",
    "throwaway",
    "mailinator",
    "sharklasers",
];

/// Combines the learned model with heuristics.
pub struct SpamScorer {
    model: Arc<dyn SpamModel>,
    rules: Vec<SpamRule>,
}

impl SpamScorer {
    /// Scorer with the built-in rule set.
    pub fn new(model: Arc<dyn SpamModel>) -> Self {
        let mut scorer = Self::bare(model);
        let defaults: [(&str, &str, RuleField, f32); 4] = [
            (
                "shouting_subject",
                r"(?i)(!!!+|\$\$\$+|(?:fw:\s*){3}|(?:re:\s*){3})",
                RuleField::Subject,
                0.15,
            ),
            (
                "marketing_sender",
                r"(?i)@(marketing|newsletter|promo|campaign)\b",
                RuleField::Sender,
                0.1,
            ),
            (
                "unsubscribe_footer",
                r"(?i)(click here to unsubscribe|manage your subscription|email preferences|opt[- ]?out)",
                RuleField::Content,
                0.1,
            ),
            (
                "money_bait",
                r"(?i)(\b100% free\b|\bno cost\b|\brisk[- ]free\b|\bcash bonus\b|\bwire transfer\b)",
                RuleField::Content,
                0.15,
            ),
        ];
        for (name, pattern, field, boost) in defaults {
            if let Err(e) = scorer.add_rule(name, pattern, field, boost) {
                tracing::warn!(rule = name, error = %e, "Skipping built-in spam rule");
            }
        }
        scorer
    }

    /// Scorer with structural checks only.
    pub fn bare(model: Arc<dyn SpamModel>) -> Self {
        Self {
            model,
            rules: Vec::new(),
        }
    }

    /// Add a regex rule. The boost is capped at [`MAX_SIGNAL_BOOST`].
    pub fn add_rule(
        &mut self,
        name: &str,
        pattern: &str,
        field: RuleField,
        boost: f32,
    ) -> Result<(), regex::Error> {
        self.rules.push(SpamRule {
            name: name.into(),
            regex: Regex::new(pattern)?,
            field,
            boost: boost.clamp(0.0, MAX_SIGNAL_BOOST),
        });
        Ok(())
    }

    /// Score a message. `content` is the (already truncated) text the
    /// learned model and content rules see.
    pub fn score(&self, message: &Message, content: &str) -> Result<SpamAssessment, ModelError> {
        let learned = self.model.spam_probability(content)?.clamp(0.0, 1.0);

        let mut signals = structural_signals(message, content);
        for rule in &self.rules {
            let value = match rule.field {
                RuleField::Sender => message.sender.as_str(),
                RuleField::Subject => message.subject.as_str(),
                RuleField::Content => content,
            };
            if rule.regex.is_match(value) {
                signals.push(SpamSignal {
                    name: rule.name.clone(),
                    boost: rule.boost,
                });
            }
        }
        for signal in &mut signals {
            signal.boost = signal.boost.clamp(0.0, MAX_SIGNAL_BOOST);
        }

        let boost: f32 = signals.iter().map(|s| s.boost).sum::<f32>().min(MAX_TOTAL_BOOST);
        let score = (learned + boost).clamp(0.0, 1.0);

        if !signals.is_empty() {
            debug!(
                message_id = %message.id,
                learned,
                boost,
                score,
                signals = signals.len(),
                "Spam heuristics fired"
            );
        }

        Ok(SpamAssessment {
            score,
            learned,
            signals,
        })
    }
}

fn structural_signals(message: &Message, content: &str) -> Vec<SpamSignal> {
    let mut signals = Vec::new();
    let sender_domain = message.sender_domain();

    if let (Some(reply_to), Some(sender)) = (
        message.headers.reply_to.as_deref().and_then(address_domain),
        sender_domain.as_deref(),
    ) && reply_to != sender
    {
        signals.push(SpamSignal {
            name: "reply_to_mismatch".into(),
            boost: MAX_SIGNAL_BOOST,
        });
    }

    let words = WORD_RE.find_iter(content).count();
    let links = URL_RE.find_iter(content).count();
    if words > 0 && links as f32 / words as f32 > LINK_RATIO_LIMIT {
        signals.push(SpamSignal {
            name: "link_ratio".into(),
            boost: 0.15,
        });
    }

    if message.headers.is_bulk() {
        signals.push(SpamSignal {
            name: "bulk_headers".into(),
            boost: 0.1,
        });
    }

    if sender_domain
        .as_deref()
        .is_some_and(|d| DISPOSABLE_DOMAINS.iter().any(|p| d.contains(p)))
    {
        signals.push(SpamSignal {
            name: "disposable_domain".into(),
            boost: MAX_SIGNAL_BOOST,
        });
    }

    signals
}
