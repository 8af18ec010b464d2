//! Conflict resolution for meeting proposals.
//!
//! Pure: takes a proposal and the events it may collide with, returns a
//! decision. Storage and serialization of calendar writes live in
//! [`crate::calendar::service`].

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::calendar::model::{CalendarEvent, EventSource, TimeWindow};
use crate::config::PipelineConfig;
use crate::error::CalendarError;
use crate::pipeline::meeting::MeetingProposal;

/// Granularity of alternative slot starts.
const SLOT_STEP_MINUTES: i64 = 15;

/// Outcome of resolving one proposal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    /// The requested window is free.
    Confirm { event: CalendarEvent },
    /// The requested window collides; alternatives of the same length follow.
    Conflict {
        requested: TimeWindow,
        overlapping: Vec<CalendarEvent>,
        alternatives: Vec<TimeWindow>,
    },
    /// Several candidates; a person has to pick one first.
    Ambiguous { candidates: Vec<TimeWindow> },
}

impl Decision {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Confirm { .. } => "confirm",
            Self::Conflict { .. } => "conflict",
            Self::Ambiguous { .. } => "ambiguous",
        }
    }
}

/// Resolver settings.
#[derive(Debug, Clone)]
pub struct ResolverSettings {
    pub buffer: Duration,
    pub alternative_count: usize,
    pub lookahead_business_days: u32,
    /// Local `[open, close)` hours.
    pub business_hours: (u32, u32),
    pub timezone: Tz,
}

impl ResolverSettings {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            buffer: config.calendar_buffer(),
            alternative_count: config.alternative_slot_count,
            lookahead_business_days: config.lookahead_business_days,
            business_hours: config.business_hours,
            timezone: config.timezone,
        }
    }
}

impl Default for ResolverSettings {
    fn default() -> Self {
        Self::from_config(&PipelineConfig::default())
    }
}

#[derive(Debug, Clone)]
pub struct ConflictResolver {
    settings: ResolverSettings,
}

impl ConflictResolver {
    pub fn new(settings: ResolverSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &ResolverSettings {
        &self.settings
    }

    /// Does `window` collide with `event` once the buffer is applied?
    pub fn collides(&self, window: &TimeWindow, event: &CalendarEvent) -> bool {
        window.overlaps_with_buffer(&event.window, self.settings.buffer)
    }

    /// Decide a proposal against `existing`. Events derived from the same
    /// message are ignored so re-evaluating a proposal does not trip on its
    /// own hold.
    pub fn resolve(
        &self,
        proposal: &MeetingProposal,
        existing: &[CalendarEvent],
    ) -> Result<Decision, CalendarError> {
        if proposal.is_ambiguous() {
            return Ok(Decision::Ambiguous {
                candidates: proposal.candidates.clone(),
            });
        }
        let requested = *proposal
            .requested()
            .ok_or_else(|| CalendarError::NoCandidate {
                message_id: proposal.message_id.clone(),
            })?;

        let relevant: Vec<&CalendarEvent> = existing
            .iter()
            .filter(|e| e.message_id.as_deref() != Some(proposal.message_id.as_str()))
            .collect();

        let overlapping: Vec<CalendarEvent> = relevant
            .iter()
            .filter(|e| self.collides(&requested, e))
            .map(|e| (*e).clone())
            .collect();

        if overlapping.is_empty() {
            let event = CalendarEvent::new(proposal.title.clone(), requested, EventSource::Proposed)
                .with_location(proposal.location.clone())
                .with_message_id(proposal.message_id.clone());
            return Ok(Decision::Confirm { event });
        }

        let alternatives = self.alternatives(&requested, proposal.reference, &relevant);
        debug!(
            message_id = %proposal.message_id,
            overlapping = overlapping.len(),
            alternatives = alternatives.len(),
            "Requested slot conflicts"
        );
        Ok(Decision::Conflict {
            requested,
            overlapping,
            alternatives,
        })
    }

    /// Up to N free, mutually disjoint slots of the requested length inside
    /// business hours on the requested day and the following business days,
    /// earliest first, never starting before `not_before`.
    pub fn alternatives(
        &self,
        requested: &TimeWindow,
        not_before: DateTime<Utc>,
        existing: &[&CalendarEvent],
    ) -> Vec<TimeWindow> {
        let tz = self.settings.timezone;
        let length = requested.duration();
        let step = Duration::minutes(SLOT_STEP_MINUTES);
        let mut found: Vec<TimeWindow> = Vec::new();

        for day in self.search_days(requested.start().with_timezone(&tz).date_naive()) {
            let (Some(open), Some(close)) = (
                self.local_hour(day, self.settings.business_hours.0),
                self.local_hour(day, self.settings.business_hours.1),
            ) else {
                continue;
            };

            let mut start = open;
            while start + length <= close {
                if found.len() >= self.settings.alternative_count {
                    return found;
                }
                if start >= not_before
                    && let Ok(slot) = TimeWindow::starting_at(start, length)
                    && !existing.iter().any(|e| self.collides(&slot, e))
                    && !found.iter().any(|f| f.overlaps(&slot))
                {
                    found.push(slot);
                }
                start += step;
            }
        }
        found
    }

    /// The requested day, then the configured number of business days after it.
    fn search_days(&self, first: NaiveDate) -> Vec<NaiveDate> {
        let mut days = vec![first];
        let mut day = first;
        while days.len() <= self.settings.lookahead_business_days as usize {
            day += Duration::days(1);
            if !matches!(day.weekday(), Weekday::Sat | Weekday::Sun) {
                days.push(day);
            }
        }
        days
    }

    fn local_hour(&self, day: NaiveDate, hour: u32) -> Option<DateTime<Utc>> {
        if hour >= 24 {
            return self.local_hour(day + Duration::days(1), hour - 24);
        }
        let time = NaiveTime::from_hms_opt(hour, 0, 0)?;
        self.settings
            .timezone
            .from_local_datetime(&day.and_time(time))
            .earliest()
            .map(|dt| dt.with_timezone(&Utc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(d: u32, h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, d, h, m, 0).unwrap()
    }

    fn window(d: u32, h: u32, m: u32, minutes: i64) -> TimeWindow {
        TimeWindow::starting_at(at(d, h, m), Duration::minutes(minutes)).unwrap()
    }

    fn proposal(candidates: Vec<TimeWindow>) -> MeetingProposal {
        MeetingProposal {
            message_id: "m1".into(),
            thread_id: "t1".into(),
            title: "Sync".into(),
            candidates,
            location: None,
            confidence: 0.8,
            reference: at(9, 8, 0),
        }
    }

    fn resolver() -> ConflictResolver {
        ConflictResolver::new(ResolverSettings {
            timezone: Tz::UTC,
            ..ResolverSettings::default()
        })
    }

    fn confirmed(w: TimeWindow) -> CalendarEvent {
        CalendarEvent::new("Existing", w, EventSource::Confirmed)
    }

    #[test]
    fn free_slot_confirms() {
        let decision = resolver()
            .resolve(&proposal(vec![window(10, 15, 0, 60)]), &[])
            .unwrap();
        match decision {
            Decision::Confirm { event } => {
                assert_eq!(event.window, window(10, 15, 0, 60));
                assert_eq!(event.message_id.as_deref(), Some("m1"));
            }
            other => panic!("expected confirm, got {other:?}"),
        }
    }

    #[test]
    fn overlapping_event_conflicts_with_buffered_alternatives() {
        let existing = confirmed(window(10, 15, 30, 60));
        let decision = resolver()
            .resolve(&proposal(vec![window(10, 15, 0, 60)]), &[existing.clone()])
            .unwrap();
        let Decision::Conflict {
            overlapping,
            alternatives,
            ..
        } = decision
        else {
            panic!("expected conflict");
        };
        assert_eq!(overlapping, vec![existing.clone()]);
        assert!(!alternatives.is_empty());
        assert!(alternatives.len() <= 3);
        for alt in &alternatives {
            assert_eq!(alt.duration(), Duration::hours(1));
            assert!(!alt.overlaps_with_buffer(&existing.window, Duration::minutes(15)));
        }
        assert!(alternatives.windows(2).all(|w| w[0].end() <= w[1].start()));
    }

    #[test]
    fn buffer_turns_back_to_back_into_conflict() {
        let existing = confirmed(window(10, 14, 0, 60));
        let decision = resolver()
            .resolve(&proposal(vec![window(10, 15, 0, 60)]), &[existing])
            .unwrap();
        assert_eq!(decision.kind(), "conflict");

        let no_buffer = ConflictResolver::new(ResolverSettings {
            timezone: Tz::UTC,
            buffer: Duration::zero(),
            ..ResolverSettings::default()
        });
        let existing = confirmed(window(10, 14, 0, 60));
        let decision = no_buffer
            .resolve(&proposal(vec![window(10, 15, 0, 60)]), &[existing])
            .unwrap();
        assert_eq!(decision.kind(), "confirm");
    }

    #[test]
    fn multiple_candidates_are_deferred() {
        let decision = resolver()
            .resolve(
                &proposal(vec![window(16, 9, 0, 60), window(11, 9, 0, 60)]),
                &[confirmed(window(16, 9, 0, 60))],
            )
            .unwrap();
        assert!(matches!(decision, Decision::Ambiguous { ref candidates } if candidates.len() == 2));
    }

    #[test]
    fn empty_proposal_is_an_error() {
        let result = resolver().resolve(&proposal(vec![]), &[]);
        assert!(matches!(result, Err(CalendarError::NoCandidate { .. })));
    }

    #[test]
    fn own_hold_does_not_conflict() {
        let hold = confirmed(window(10, 15, 0, 60)).with_message_id("m1");
        let decision = resolver()
            .resolve(&proposal(vec![window(10, 15, 0, 60)]), &[hold])
            .unwrap();
        assert_eq!(decision.kind(), "confirm");
    }

    #[test]
    fn alternatives_skip_the_weekend() {
        // Friday 13th fully booked during business hours.
        let busy = confirmed(TimeWindow::new(at(13, 9, 0), at(13, 18, 0)).unwrap());
        let decision = resolver()
            .resolve(&proposal(vec![window(13, 10, 0, 60)]), &[busy])
            .unwrap();
        let Decision::Conflict { alternatives, .. } = decision else {
            panic!("expected conflict");
        };
        assert_eq!(alternatives.first().map(|w| w.start()), Some(at(16, 9, 0)));
    }

    #[test]
    fn alternatives_never_precede_reference() {
        let mut p = proposal(vec![window(9, 15, 0, 60)]);
        p.reference = at(9, 14, 10);
        let existing = confirmed(window(9, 15, 0, 60));
        let Decision::Conflict { alternatives, .. } = resolver().resolve(&p, &[existing]).unwrap()
        else {
            panic!("expected conflict");
        };
        assert!(alternatives.iter().all(|w| w.start() >= at(9, 14, 10)));
    }
}
