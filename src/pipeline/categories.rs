//! Keyword category model.
//!
//! Counts distinct keyword hits per category; subject hits weigh double.
//! Evidence maps to confidence as `1 - exp(-0.5 * hits)`.

use std::collections::{BTreeMap, BTreeSet};

use regex::Regex;

use crate::error::ModelError;
use crate::pipeline::models::CategoryModel;
use crate::pipeline::types::Category;

const SUBJECT_WEIGHT: f32 = 2.0;
const HIT_RATE: f32 = 0.5;

pub struct KeywordCategoryModel {
    patterns: Vec<(Category, Regex)>,
}

fn keywords(category: Category) -> &'static [&'static str] {
    match category {
        Category::MeetingRequest => &[
            "meeting",
            "meet",
            "call",
            "schedule",
            "reschedule",
            "available",
            "availability",
            "appointment",
            "calendar",
            "slot",
            "catch up",
            "are you free",
            "works for you",
            "rendez-vous",
            "rdv",
            "réunion",
            "disponible",
            "disponibilité",
        ],
        Category::Invoice => &[
            "invoice",
            "payment",
            "bill",
            "billing",
            "amount due",
            "receipt",
            "overdue",
            "purchase order",
            "remittance",
            "facture",
            "paiement",
            "montant",
        ],
        Category::Application => &[
            "resume",
            "résumé",
            "cv",
            "application",
            "applying",
            "apply",
            "position",
            "candidate",
            "cover letter",
            "internship",
            "job",
            "candidature",
            "poste",
            "stage",
        ],
        Category::Support => &[
            "help",
            "issue",
            "problem",
            "error",
            "bug",
            "support",
            "broken",
            "not working",
            "unable",
            "crash",
            "ticket",
            "assistance",
            "aide",
            "problème",
            "erreur",
        ],
        Category::Newsletter => &[
            "newsletter",
            "unsubscribe",
            "digest",
            "weekly",
            "monthly",
            "edition",
            "view in browser",
            "subscription",
            "this week in",
            "désabonner",
            "actualités",
        ],
        Category::Spam | Category::Other => &[],
    }
}

impl Default for KeywordCategoryModel {
    fn default() -> Self {
        let patterns = Category::PRIORITY
            .iter()
            .filter_map(|&category| {
                let words = keywords(category);
                if words.is_empty() {
                    return None;
                }
                let alternation = words
                    .iter()
                    .map(|w| regex::escape(w))
                    .collect::<Vec<_>>()
                    .join("|");
                match Regex::new(&format!(r"(?i)\b(?:{alternation})\b")) {
                    Ok(re) => Some((category, re)),
                    Err(e) => {
                        tracing::warn!(%category, error = %e, "Keyword pattern rejected");
                        None
                    }
                }
            })
            .collect();
        Self { patterns }
    }
}

fn distinct_hits(re: &Regex, text: &str) -> usize {
    re.find_iter(text)
        .map(|m| m.as_str().to_lowercase())
        .collect::<BTreeSet<_>>()
        .len()
}

impl CategoryModel for KeywordCategoryModel {
    fn name(&self) -> &str {
        "keyword-categories"
    }

    fn score(&self, subject: &str, body: &str) -> Result<BTreeMap<Category, f32>, ModelError> {
        Ok(self
            .patterns
            .iter()
            .map(|(category, re)| {
                let hits = SUBJECT_WEIGHT * distinct_hits(re, subject) as f32
                    + distinct_hits(re, body) as f32;
                (*category, 1.0 - (-HIT_RATE * hits).exp())
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn score(subject: &str, body: &str) -> BTreeMap<Category, f32> {
        KeywordCategoryModel::default().score(subject, body).unwrap()
    }

    #[test]
    fn meeting_words_score_meeting() {
        let scores = score("Meeting next week", "Can we meet Tuesday 3-4pm?");
        let meeting = scores[&Category::MeetingRequest];
        assert!((meeting - (1.0 - (-1.5f32).exp())).abs() < 1e-6);
        assert_eq!(scores[&Category::Invoice], 0.0);
    }

    #[test]
    fn repeated_keyword_counts_once() {
        let once = score("", "invoice");
        let many = score("", "invoice invoice INVOICE");
        assert_eq!(once[&Category::Invoice], many[&Category::Invoice]);
    }

    #[test]
    fn word_boundaries_apply() {
        let scores = score("", "recalling the callback");
        assert_eq!(scores[&Category::MeetingRequest], 0.0);
    }

    #[test]
    fn no_spam_or_other_scores() {
        let scores = score("anything", "at all");
        assert!(!scores.contains_key(&Category::Spam));
        assert!(!scores.contains_key(&Category::Other));
    }
}
