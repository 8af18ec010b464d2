//! Meeting proposal extraction.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::calendar::model::TimeWindow;
use crate::pipeline::types::{Category, ClassificationResult, EntityKind, ExtractedEntities, Message};

/// Candidate meeting derived from one message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeetingProposal {
    pub message_id: String,
    pub thread_id: String,
    pub title: String,
    /// Distinct candidate windows, in the order they were mentioned.
    pub candidates: Vec<TimeWindow>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    pub confidence: f32,
    /// Received-at of the source message; nothing is proposed before it.
    pub reference: DateTime<Utc>,
}

impl MeetingProposal {
    /// More than one candidate: needs an explicit choice downstream.
    pub fn is_ambiguous(&self) -> bool {
        self.candidates.len() > 1
    }

    /// The single candidate of an unambiguous proposal.
    pub fn requested(&self) -> Option<&TimeWindow> {
        match self.candidates.as_slice() {
            [only] => Some(only),
            _ => None,
        }
    }
}

/// Builds proposals from classifier output and extracted dates.
#[derive(Debug, Clone, Copy)]
pub struct MeetingExtractor {
    threshold: f32,
}

impl MeetingExtractor {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// A proposal when the meeting signal and every date it relies on are
    /// strong enough. Confidence is the weakest of the two stages.
    pub fn extract_meeting(
        &self,
        message: &Message,
        classification: &ClassificationResult,
        entities: &ExtractedEntities,
    ) -> Option<MeetingProposal> {
        let class_confidence = classification.confidence(Category::MeetingRequest);
        if class_confidence <= self.threshold {
            return None;
        }

        let mut candidates: Vec<TimeWindow> = Vec::new();
        let mut entity_confidence = 1.0f32;
        for (entity, window) in entities.date_times() {
            entity_confidence = entity_confidence.min(entity.confidence);
            if !candidates.contains(window) {
                candidates.push(*window);
            }
        }
        if candidates.is_empty() {
            debug!(message_id = %message.id, "Meeting request without a usable date");
            return None;
        }

        let confidence = class_confidence.min(entity_confidence);
        if confidence <= self.threshold {
            debug!(
                message_id = %message.id,
                confidence,
                "Meeting proposal below threshold"
            );
            return None;
        }

        let location = entities
            .of_kind(EntityKind::Location)
            .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
            .map(|e| e.text.clone());

        Some(MeetingProposal {
            message_id: message.id.clone(),
            thread_id: message.thread_id.clone(),
            title: meeting_title(message),
            candidates,
            location,
            confidence,
            reference: message.received_at,
        })
    }
}

fn meeting_title(message: &Message) -> String {
    let subject = strip_reply_prefixes(&message.subject);
    if subject.is_empty() {
        format!("Meeting with {}", message.sender_display())
    } else {
        format!("{subject} ({})", message.sender_display())
    }
}

/// Subject without any leading `Re:`/`Fwd:` markers.
pub fn strip_reply_prefixes(subject: &str) -> &str {
    let mut rest = subject.trim();
    loop {
        let lower = rest.to_ascii_lowercase();
        let Some(prefix) = ["re:", "fw:", "fwd:", "tr:"]
            .iter()
            .find(|p| lower.starts_with(*p))
        else {
            return rest;
        };
        rest = rest[prefix.len()..].trim_start();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use chrono::{Duration, TimeZone};

    use crate::pipeline::types::{
        Entity, MessageHeaders, SentimentLabel, SentimentReading, Span, SpamAssessment, Urgency,
    };

    fn at(d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, d, h, 0, 0).unwrap()
    }

    fn message() -> Message {
        Message {
            id: "m1".into(),
            thread_id: "t1".into(),
            sender: "bob@acme.com".into(),
            sender_name: Some("Bob".into()),
            recipients: vec![],
            subject: "Re: Sync".into(),
            body: String::new(),
            received_at: at(9, 8),
            headers: MessageHeaders::default(),
        }
    }

    fn classification(meeting: f32) -> ClassificationResult {
        let mut confidences = BTreeMap::new();
        confidences.insert(Category::MeetingRequest, meeting);
        ClassificationResult {
            message_id: "m1".into(),
            content_digest: String::new(),
            confidences,
            dominant: Category::MeetingRequest,
            spam: SpamAssessment {
                score: 0.0,
                learned: 0.0,
                signals: vec![],
            },
            sentiment: SentimentReading {
                label: SentimentLabel::Neutral,
                polarity: 0.0,
                urgency: Urgency::Normal,
            },
        }
    }

    fn dated(day: u32, confidence: f32) -> Entity {
        Entity {
            text: format!("day {day}"),
            kind: EntityKind::DateTimeExpression,
            span: Span { start: 0, end: 1 },
            window: Some(TimeWindow::starting_at(at(day, 15), Duration::hours(1)).unwrap()),
            confidence,
        }
    }

    fn entities(list: Vec<Entity>) -> ExtractedEntities {
        ExtractedEntities {
            message_id: "m1".into(),
            entities: list,
        }
    }

    #[test]
    fn weak_meeting_signal_yields_nothing() {
        let extractor = MeetingExtractor::new(0.5);
        let found = extractor.extract_meeting(&message(), &classification(0.4), &entities(vec![dated(10, 0.9)]));
        assert!(found.is_none());
    }

    #[test]
    fn confidence_is_the_minimum() {
        let extractor = MeetingExtractor::new(0.5);
        let proposal = extractor
            .extract_meeting(&message(), &classification(0.8), &entities(vec![dated(10, 0.6)]))
            .unwrap();
        assert_eq!(proposal.confidence, 0.6);
        assert!(!proposal.is_ambiguous());
        assert_eq!(proposal.title, "Sync (Bob)");
    }

    #[test]
    fn weak_date_drags_proposal_below_threshold() {
        let extractor = MeetingExtractor::new(0.7);
        let found = extractor.extract_meeting(&message(), &classification(0.9), &entities(vec![dated(10, 0.6)]));
        assert!(found.is_none());
    }

    #[test]
    fn multiple_dates_stay_as_candidates() {
        let extractor = MeetingExtractor::new(0.5);
        let proposal = extractor
            .extract_meeting(
                &message(),
                &classification(0.9),
                &entities(vec![dated(16, 0.6), dated(11, 0.6), dated(16, 0.6)]),
            )
            .unwrap();
        assert!(proposal.is_ambiguous());
        assert_eq!(proposal.candidates.len(), 2);
        assert!(proposal.requested().is_none());
    }

    #[test]
    fn strips_nested_prefixes() {
        assert_eq!(strip_reply_prefixes("RE: Fwd: re:  Budget"), "Budget");
        assert_eq!(strip_reply_prefixes("Recruiting"), "Recruiting");
    }
}
