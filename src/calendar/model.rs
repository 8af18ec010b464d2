//! Calendar data model: time windows and events.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CalendarError;

/// Half-open interval `[start, end)` with `start < end`.
///
/// The invariant is checked at construction and on deserialization, so a
/// `TimeWindow` in hand is always well-formed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawWindow")]
pub struct TimeWindow {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

#[derive(Deserialize)]
struct RawWindow {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl TryFrom<RawWindow> for TimeWindow {
    type Error = CalendarError;

    fn try_from(raw: RawWindow) -> Result<Self, Self::Error> {
        TimeWindow::new(raw.start, raw.end)
    }
}

impl TimeWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, CalendarError> {
        if start >= end {
            return Err(CalendarError::InvalidWindow {
                start: start.to_rfc3339(),
                end: end.to_rfc3339(),
            });
        }
        Ok(Self { start, end })
    }

    /// Window of `duration` starting at `start`. Fails for non-positive durations.
    pub fn starting_at(start: DateTime<Utc>, duration: Duration) -> Result<Self, CalendarError> {
        Self::new(start, start + duration)
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    pub fn duration(&self) -> Duration {
        self.end - self.start
    }

    /// Plain interval intersection.
    pub fn overlaps(&self, other: &TimeWindow) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Intersection after widening `other` by `buffer` on both sides.
    pub fn overlaps_with_buffer(&self, other: &TimeWindow, buffer: Duration) -> bool {
        self.start < other.end + buffer && other.start - buffer < self.end
    }
}

/// Where a calendar event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    /// Accepted meeting.
    Confirmed,
    /// Tentative hold derived from a meeting proposal.
    Proposed,
    /// Entered by the user directly.
    Manual,
}

impl EventSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Confirmed => "confirmed",
            Self::Proposed => "proposed",
            Self::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "confirmed" => Self::Confirmed,
            "manual" => Self::Manual,
            _ => Self::Proposed,
        }
    }

    /// Events that must never be double-booked against each other.
    pub fn is_firm(&self) -> bool {
        matches!(self, Self::Confirmed | Self::Manual)
    }
}

/// A calendar entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalendarEvent {
    pub id: Uuid,
    pub title: String,
    pub window: TimeWindow,
    pub source: EventSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    /// Message the event was derived from, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl CalendarEvent {
    pub fn new(title: impl Into<String>, window: TimeWindow, source: EventSource) -> Self {
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            window,
            source,
            location: None,
            message_id: None,
            updated_at: Utc::now(),
        }
    }

    pub fn with_location(mut self, location: Option<String>) -> Self {
        self.location = location;
        self
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.window.start()
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.window.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, h, m, 0).unwrap()
    }

    #[test]
    fn rejects_inverted_window() {
        assert!(TimeWindow::new(at(10, 0), at(9, 0)).is_err());
        assert!(TimeWindow::new(at(10, 0), at(10, 0)).is_err());
    }

    #[test]
    fn back_to_back_windows_do_not_overlap() {
        let a = TimeWindow::new(at(9, 0), at(10, 0)).unwrap();
        let b = TimeWindow::new(at(10, 0), at(11, 0)).unwrap();
        assert!(!a.overlaps(&b));
        assert!(a.overlaps_with_buffer(&b, Duration::minutes(15)));
    }

    #[test]
    fn buffer_gap_is_respected() {
        let a = TimeWindow::new(at(9, 0), at(10, 0)).unwrap();
        let b = TimeWindow::new(at(10, 15), at(11, 0)).unwrap();
        assert!(!a.overlaps_with_buffer(&b, Duration::minutes(15)));
        assert!(a.overlaps_with_buffer(&b, Duration::minutes(16)));
    }

    #[test]
    fn deserialize_rejects_inverted_window() {
        let json = r#"{"start":"2026-03-10T10:00:00Z","end":"2026-03-10T09:00:00Z"}"#;
        assert!(serde_json::from_str::<TimeWindow>(json).is_err());
        let ok = r#"{"start":"2026-03-10T09:00:00Z","end":"2026-03-10T10:00:00Z"}"#;
        let window: TimeWindow = serde_json::from_str(ok).unwrap();
        assert_eq!(window.duration(), Duration::hours(1));
    }

    #[test]
    fn event_source_roundtrip_strings() {
        for source in [EventSource::Confirmed, EventSource::Proposed, EventSource::Manual] {
            assert_eq!(EventSource::parse(source.as_str()), source);
        }
        assert!(EventSource::Manual.is_firm());
        assert!(!EventSource::Proposed.is_firm());
    }
}
