//! Rule-based entity and date extraction.
//!
//! Date-time expressions are resolved to absolute windows against the
//! message's received-at timestamp in the configured time zone, so running
//! the extractor again later yields the same windows.
//!
//! A date mention pairs with the nearest time mention next to it ("Tuesday
//! 3-4pm", "at 10am on Friday"). A time qualifier after a disjunction is
//! shared by the dates before it ("Monday or Tuesday afternoon").

use std::sync::LazyLock;

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Utc, Weekday};
use chrono_tz::Tz;
use regex::{Captures, Regex};

use crate::calendar::model::TimeWindow;
use crate::error::ModelError;
use crate::pipeline::models::EntityModel;
use crate::pipeline::types::{Entity, EntityKind, Span};

const CONF_EXPLICIT_TIMED: f32 = 0.95;
const CONF_RELATIVE_TIMED: f32 = 0.9;
const CONF_SHARED_TIME: f32 = 0.85;
const CONF_PART_OF_DAY: f32 = 0.75;
const CONF_DAY_ONLY: f32 = 0.6;
const CONF_TIME_ONLY: f32 = 0.6;

/// Start of day assumed for a date without a time.
const DAY_START_HOUR: u32 = 9;

fn re(pattern: &str) -> Regex {
    Regex::new(pattern).expect("static regex")
}

const WEEKDAYS: &str =
    "monday|tuesday|wednesday|thursday|friday|saturday|sunday|lundi|mardi|mercredi|jeudi|vendredi|samedi|dimanche";
const MONTHS: &str = "january|february|march|april|may|june|july|august|september|october|november|december|jan|feb|mar|apr|jun|jul|aug|sept|sep|oct|nov|dec";

static RELATIVE_DAY_RE: LazyLock<Regex> = LazyLock::new(|| {
    re(r"(?i)\b(day after tomorrow|tomorrow|today|après-demain|demain|aujourd'hui)\b")
});
static WEEKDAY_RE: LazyLock<Regex> =
    LazyLock::new(|| re(&format!(r"(?i)\b(?:(?:next|this|coming|prochain)\s+)?({WEEKDAYS})\b")));
static IN_DAYS_RE: LazyLock<Regex> = LazyLock::new(|| re(r"(?i)\bin\s+(\d{1,2})\s+days?\b"));
static ISO_DATE_RE: LazyLock<Regex> = LazyLock::new(|| re(r"\b(\d{4})-(\d{1,2})-(\d{1,2})\b"));
static NUMERIC_DATE_RE: LazyLock<Regex> =
    LazyLock::new(|| re(r"\b(\d{1,2})/(\d{1,2})/(\d{4})\b"));
static DAY_MONTH_RE: LazyLock<Regex> = LazyLock::new(|| {
    re(&format!(
        r"(?i)\b(\d{{1,2}})(?:st|nd|rd|th)?\s+({MONTHS})\b(?:,?\s+(\d{{4}}))?"
    ))
});
static MONTH_DAY_RE: LazyLock<Regex> = LazyLock::new(|| {
    re(&format!(
        r"(?i)\b({MONTHS})\s+(\d{{1,2}})(?:st|nd|rd|th)?\b(?:,?\s+(\d{{4}}))?"
    ))
});

static TIME_RANGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    re(r"(?i)\b(\d{1,2})(?::(\d{2}))?\s*(am|pm)?\s*(?:-|–|to|until|and)\s*(\d{1,2})(?::(\d{2}))?\s*(am|pm)?\b")
});
static TIME_MERIDIEM_RE: LazyLock<Regex> =
    LazyLock::new(|| re(r"(?i)\b(\d{1,2})(?::(\d{2}))?\s*(am|pm)\b"));
static TIME_CLOCK_RE: LazyLock<Regex> = LazyLock::new(|| re(r"\b(\d{1,2})(?::|h)(\d{2})\b"));
static TIME_HOUR_H_RE: LazyLock<Regex> = LazyLock::new(|| re(r"\b(\d{1,2})h\b"));
static NOON_RE: LazyLock<Regex> = LazyLock::new(|| re(r"(?i)\b(noon|midday|midi)\b"));
static PART_OF_DAY_RE: LazyLock<Regex> =
    LazyLock::new(|| re(r"(?i)\b(morning|afternoon|evening|matin|après-midi|soir)\b"));

static GAP_RE: LazyLock<Regex> = LazyLock::new(|| {
    re(r"(?i)^[\s,]*(?:(?:at|from|between|around|on|in the|@|à|de)\s*)?[\s,]*$")
});
static DISJUNCTION_RE: LazyLock<Regex> =
    LazyLock::new(|| re(r"(?i)^\s*,?\s*(?:(?:or|and|ou|et)\s*)?$"));

static PERSON_TITLE_RE: LazyLock<Regex> = LazyLock::new(|| {
    re(r"\b(?:Mr|Mrs|Ms|Dr|Prof|Mme)\.?[ \t]+[A-Z][\p{L}'-]+(?:[ \t]+[A-Z][\p{L}'-]+)?")
});
static SIGNOFF_RE: LazyLock<Regex> = LazyLock::new(|| {
    re(r"(?m)^[ \t]*(?i:best regards|kind regards|warm regards|regards|best|thanks|thank you|cheers|sincerely|cordialement|bien à vous)[,.!]?[ \t]*\r?\n[ \t]*([A-Z][\p{L}'-]+(?:[ \t]+[A-Z][\p{L}'-]+)?)[ \t]*\r?$")
});
static ORGANIZATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    re(r"\b(?:(?:[A-Z][\p{L}&'-]*[ \t]+){0,2}[A-Z][\p{L}&'-]*[ \t]+(?:Inc|Ltd|LLC|Corp|Corporation|GmbH|SARL|SAS|Bank|University|Group|Labs)\b\.?|University of [A-Z][\p{L}-]+)")
});
static ROOM_RE: LazyLock<Regex> =
    LazyLock::new(|| re(r"\b(?i:room|salle|office|building)[ \t]+[A-Z0-9][\w-]*"));
static STREET_RE: LazyLock<Regex> = LazyLock::new(|| {
    re(r"\b\d{1,5}[ \t]+(?:[A-Z][\p{L}'-]*[ \t]+){1,3}(?:Street|St|Avenue|Ave|Road|Rd|Boulevard|Blvd|Lane|Way)\b\.?")
});
static VIDEO_RE: LazyLock<Regex> =
    LazyLock::new(|| re(r"\b(?:Zoom|Google Meet|Microsoft Teams|Teams|Skype|Webex)\b"));
static IN_PLACE_RE: LazyLock<Regex> =
    LazyLock::new(|| re(r"\b(?:in|at)[ \t]+([A-Z][\p{L}'-]+(?:[ \t]+[A-Z][\p{L}'-]+)?)"));

/// Capitalized words that follow "in"/"at" without naming a place.
const NOT_PLACES: &[&str] = &[
    "the", "this", "that", "our", "your", "my", "noon", "least", "all", "any", "some", "first",
];

// ── Mentions ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DateBasis {
    Relative,
    Explicit,
}

#[derive(Debug, Clone, Copy)]
struct DateMention {
    start: usize,
    end: usize,
    date: NaiveDate,
    basis: DateBasis,
}

#[derive(Debug, Clone, Copy)]
enum TimeSpec {
    Range(NaiveTime, NaiveTime),
    At(NaiveTime),
    PartOfDay(NaiveTime),
}

#[derive(Debug, Clone, Copy)]
struct TimeMention {
    start: usize,
    end: usize,
    spec: TimeSpec,
}

fn overlaps(a: (usize, usize), b: (usize, usize)) -> bool {
    a.0 < b.1 && b.0 < a.1
}

fn weekday_of(name: &str) -> Option<Weekday> {
    Some(match name.to_lowercase().as_str() {
        "monday" | "lundi" => Weekday::Mon,
        "tuesday" | "mardi" => Weekday::Tue,
        "wednesday" | "mercredi" => Weekday::Wed,
        "thursday" | "jeudi" => Weekday::Thu,
        "friday" | "vendredi" => Weekday::Fri,
        "saturday" | "samedi" => Weekday::Sat,
        "sunday" | "dimanche" => Weekday::Sun,
        _ => return None,
    })
}

fn month_of(name: &str) -> Option<u32> {
    let lower = name.to_lowercase();
    let idx = [
        "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
    ]
    .iter()
    .position(|m| lower.starts_with(m))?;
    Some(idx as u32 + 1)
}

/// First date strictly after `from` falling on `weekday`.
fn next_weekday(from: NaiveDate, weekday: Weekday) -> NaiveDate {
    let ahead = (weekday.num_days_from_monday() as i64 - from.weekday().num_days_from_monday() as i64)
        .rem_euclid(7);
    from + Duration::days(if ahead == 0 { 7 } else { ahead })
}

fn clock(hour: u32, minute: u32, meridiem: Option<&str>) -> Option<NaiveTime> {
    let hour = match meridiem.map(|m| m.to_ascii_lowercase()) {
        Some(m) if (1..=12).contains(&hour) => {
            if m == "pm" {
                hour % 12 + 12
            } else {
                hour % 12
            }
        }
        Some(_) => return None,
        None => hour,
    };
    NaiveTime::from_hms_opt(hour, minute, 0)
}

fn num(caps: &Captures<'_>, idx: usize) -> Option<u32> {
    caps.get(idx).and_then(|m| m.as_str().parse().ok())
}

/// Text of the first participating group among `groups`, else the whole match.
fn group_text<'t>(caps: &Captures<'t>, groups: &[usize]) -> (usize, usize, &'t str) {
    let m = groups
        .iter()
        .find_map(|&i| caps.get(i))
        .or_else(|| caps.get(0));
    match m {
        Some(m) => (m.start(), m.end(), m.as_str()),
        None => (0, 0, ""),
    }
}

// ── Extractor ───────────────────────────────────────────────────────

/// Extracts people, organizations, locations and dated windows.
pub struct EntityExtractor {
    timezone: Tz,
    default_length: Duration,
}

impl EntityExtractor {
    pub fn new(timezone: Tz, default_length: Duration) -> Self {
        Self {
            timezone,
            default_length,
        }
    }

    fn local(&self, date: NaiveDate, time: NaiveTime) -> Option<DateTime<Utc>> {
        self.timezone
            .from_local_datetime(&date.and_time(time))
            .earliest()
            .map(|dt| dt.with_timezone(&Utc))
    }

    fn date_mentions(&self, text: &str, today: NaiveDate) -> Vec<DateMention> {
        let mut found: Vec<DateMention> = Vec::new();
        let mut push = |start: usize, end: usize, date: Option<NaiveDate>, basis: DateBasis| {
            if let Some(date) = date
                && !found.iter().any(|d| overlaps((d.start, d.end), (start, end)))
            {
                found.push(DateMention {
                    start,
                    end,
                    date,
                    basis,
                });
            }
        };

        for caps in ISO_DATE_RE.captures_iter(text) {
            let date = match (num(&caps, 1), num(&caps, 2), num(&caps, 3)) {
                (Some(y), Some(mo), Some(d)) => NaiveDate::from_ymd_opt(y as i32, mo, d),
                _ => None,
            };
            let (start, end, _) = group_text(&caps, &[]);
            push(start, end, date, DateBasis::Explicit);
        }
        for caps in NUMERIC_DATE_RE.captures_iter(text) {
            let date = match (num(&caps, 1), num(&caps, 2), num(&caps, 3)) {
                (Some(d), Some(mo), Some(y)) => NaiveDate::from_ymd_opt(y as i32, mo, d),
                _ => None,
            };
            let (start, end, _) = group_text(&caps, &[]);
            push(start, end, date, DateBasis::Explicit);
        }
        let month_date = |day: Option<u32>, month: Option<u32>, year: Option<u32>| {
            let (day, month) = (day?, month?);
            match year {
                Some(y) => NaiveDate::from_ymd_opt(y as i32, month, day),
                None => {
                    let this_year = NaiveDate::from_ymd_opt(today.year(), month, day)?;
                    if this_year < today {
                        NaiveDate::from_ymd_opt(today.year() + 1, month, day)
                    } else {
                        Some(this_year)
                    }
                }
            }
        };
        for caps in DAY_MONTH_RE.captures_iter(text) {
            let date = month_date(
                num(&caps, 1),
                caps.get(2).and_then(|m| month_of(m.as_str())),
                num(&caps, 3),
            );
            let (start, end, _) = group_text(&caps, &[]);
            push(start, end, date, DateBasis::Explicit);
        }
        for caps in MONTH_DAY_RE.captures_iter(text) {
            let date = month_date(
                num(&caps, 2),
                caps.get(1).and_then(|m| month_of(m.as_str())),
                num(&caps, 3),
            );
            let (start, end, _) = group_text(&caps, &[]);
            push(start, end, date, DateBasis::Explicit);
        }
        for caps in RELATIVE_DAY_RE.captures_iter(text) {
            let (start, end, word) = group_text(&caps, &[1]);
            let offset = match word.to_lowercase().as_str() {
                "today" | "aujourd'hui" => 0,
                "tomorrow" | "demain" => 1,
                _ => 2,
            };
            push(start, end, Some(today + Duration::days(offset)), DateBasis::Relative);
        }
        for caps in WEEKDAY_RE.captures_iter(text) {
            let date = caps
                .get(1)
                .and_then(|m| weekday_of(m.as_str()))
                .map(|wd| next_weekday(today, wd));
            let (start, end, _) = group_text(&caps, &[]);
            push(start, end, date, DateBasis::Relative);
        }
        for caps in IN_DAYS_RE.captures_iter(text) {
            let date = num(&caps, 1).map(|n| today + Duration::days(n as i64));
            let (start, end, _) = group_text(&caps, &[]);
            push(start, end, date, DateBasis::Relative);
        }

        found.sort_by_key(|d| d.start);
        found
    }

    fn time_mentions(&self, text: &str, dates: &[DateMention]) -> Vec<TimeMention> {
        let mut found: Vec<TimeMention> = Vec::new();
        let mut push = |start: usize, end: usize, spec: Option<TimeSpec>| {
            if let Some(spec) = spec
                && !found.iter().any(|t| overlaps((t.start, t.end), (start, end)))
                && !dates.iter().any(|d| overlaps((d.start, d.end), (start, end)))
            {
                found.push(TimeMention { start, end, spec });
            }
        };

        for caps in TIME_RANGE_RE.captures_iter(text) {
            let (start, end, _) = group_text(&caps, &[]);
            push(start, end, range_spec(&caps));
        }
        for caps in TIME_MERIDIEM_RE.captures_iter(text) {
            let time = num(&caps, 1).and_then(|h| {
                clock(h, num(&caps, 2).unwrap_or(0), caps.get(3).map(|m| m.as_str()))
            });
            let (start, end, _) = group_text(&caps, &[]);
            push(start, end, time.map(TimeSpec::At));
        }
        for caps in TIME_CLOCK_RE.captures_iter(text) {
            let time = match (num(&caps, 1), num(&caps, 2)) {
                (Some(h), Some(m)) => clock(h, m, None),
                _ => None,
            };
            let (start, end, _) = group_text(&caps, &[]);
            push(start, end, time.map(TimeSpec::At));
        }
        for caps in TIME_HOUR_H_RE.captures_iter(text) {
            let time = num(&caps, 1).and_then(|h| clock(h, 0, None));
            let (start, end, _) = group_text(&caps, &[]);
            push(start, end, time.map(TimeSpec::At));
        }
        for caps in NOON_RE.captures_iter(text) {
            let (start, end, _) = group_text(&caps, &[]);
            push(start, end, NaiveTime::from_hms_opt(12, 0, 0).map(TimeSpec::At));
        }
        for caps in PART_OF_DAY_RE.captures_iter(text) {
            let (start, end, word) = group_text(&caps, &[1]);
            let hour = match word.to_lowercase().as_str() {
                "morning" | "matin" => 9,
                "evening" | "soir" => 18,
                _ => 14,
            };
            push(
                start,
                end,
                NaiveTime::from_hms_opt(hour, 0, 0).map(TimeSpec::PartOfDay),
            );
        }

        found.sort_by_key(|t| t.start);
        found
    }

    fn window_for(&self, date: NaiveDate, spec: Option<TimeSpec>) -> Option<TimeWindow> {
        let (start, end) = match spec {
            Some(TimeSpec::Range(s, e)) => (self.local(date, s)?, self.local(date, e)?),
            Some(TimeSpec::At(t)) | Some(TimeSpec::PartOfDay(t)) => {
                let start = self.local(date, t)?;
                (start, start + self.default_length)
            }
            None => {
                let start = self.local(date, NaiveTime::from_hms_opt(DAY_START_HOUR, 0, 0)?)?;
                (start, start + self.default_length)
            }
        };
        TimeWindow::new(start, end).ok()
    }

    /// Dated windows mentioned in `text`, resolved against `reference`.
    pub fn date_times(&self, text: &str, reference: DateTime<Utc>) -> Vec<Entity> {
        let today = reference.with_timezone(&self.timezone).date_naive();
        let dates = self.date_mentions(text, today);
        let times = self.time_mentions(text, &dates);

        let mut claimed = vec![false; times.len()];
        let mut pairs: Vec<Option<usize>> = Vec::with_capacity(dates.len());
        for date in &dates {
            let following = times.iter().enumerate().find(|(i, t)| {
                !claimed[*i] && t.start >= date.end && GAP_RE.is_match(&text[date.end..t.start])
            });
            let preceding = || {
                times.iter().enumerate().rev().find(|(i, t)| {
                    !claimed[*i] && t.end <= date.start && GAP_RE.is_match(&text[t.end..date.start])
                })
            };
            let pick = following.or_else(preceding).map(|(i, _)| i);
            if let Some(i) = pick {
                claimed[i] = true;
            }
            pairs.push(pick);
        }

        let mut shared = vec![false; dates.len()];
        for i in (0..dates.len().saturating_sub(1)).rev() {
            if pairs[i].is_none()
                && let Some(next) = pairs[i + 1]
                && DISJUNCTION_RE.is_match(&text[dates[i].end..dates[i + 1].start])
            {
                pairs[i] = Some(next);
                shared[i] = true;
            }
        }

        let mut entities = Vec::new();
        for (i, date) in dates.iter().enumerate() {
            let time = pairs[i].map(|t| times[t]);
            let Some(window) = self.window_for(date.date, time.map(|t| t.spec)) else {
                continue;
            };
            let confidence = match (time.map(|t| t.spec), shared[i]) {
                (None, _) => CONF_DAY_ONLY,
                (Some(TimeSpec::PartOfDay(_)), _) => CONF_PART_OF_DAY,
                (Some(_), true) => CONF_SHARED_TIME,
                (Some(_), false) => match date.basis {
                    DateBasis::Explicit => CONF_EXPLICIT_TIMED,
                    DateBasis::Relative => CONF_RELATIVE_TIMED,
                },
            };
            let (start, end) = match time {
                Some(t) if !shared[i] => (date.start.min(t.start), date.end.max(t.end)),
                _ => (date.start, date.end),
            };
            entities.push(Entity {
                text: text[start..end].to_string(),
                kind: EntityKind::DateTimeExpression,
                span: Span { start, end },
                window: Some(window),
                confidence,
            });
        }

        if dates.is_empty() {
            for time in &times {
                let Some(mut window) = self.window_for(today, Some(time.spec)) else {
                    continue;
                };
                if window.start() <= reference {
                    match self.window_for(today + Duration::days(1), Some(time.spec)) {
                        Some(next) => window = next,
                        None => continue,
                    }
                }
                entities.push(Entity {
                    text: text[time.start..time.end].to_string(),
                    kind: EntityKind::DateTimeExpression,
                    span: Span {
                        start: time.start,
                        end: time.end,
                    },
                    window: Some(window),
                    confidence: CONF_TIME_ONLY,
                });
            }
        }

        entities
    }

    fn named(&self, text: &str) -> Vec<Entity> {
        let mut entities = Vec::new();
        let mut push = |kind: EntityKind, (start, end, found): (usize, usize, &str), confidence: f32| {
            let trimmed = found.trim_end_matches('.');
            if trimmed.is_empty() {
                return;
            }
            entities.push(Entity {
                text: trimmed.to_string(),
                kind,
                span: Span {
                    start,
                    end: start + trimmed.len().min(end - start),
                },
                window: None,
                confidence,
            });
        };

        for caps in PERSON_TITLE_RE.captures_iter(text) {
            push(EntityKind::Person, group_text(&caps, &[]), 0.8);
        }
        for caps in SIGNOFF_RE.captures_iter(text) {
            push(EntityKind::Person, group_text(&caps, &[1]), 0.7);
        }
        for caps in ORGANIZATION_RE.captures_iter(text) {
            push(EntityKind::Organization, group_text(&caps, &[]), 0.75);
        }
        for caps in ROOM_RE.captures_iter(text) {
            push(EntityKind::Location, group_text(&caps, &[]), 0.85);
        }
        for caps in STREET_RE.captures_iter(text) {
            push(EntityKind::Location, group_text(&caps, &[]), 0.85);
        }
        for caps in VIDEO_RE.captures_iter(text) {
            push(EntityKind::Location, group_text(&caps, &[]), 0.8);
        }
        for caps in IN_PLACE_RE.captures_iter(text) {
            let place = group_text(&caps, &[1]);
            let first = place.2.split_whitespace().next().unwrap_or("").to_lowercase();
            if NOT_PLACES.contains(&first.as_str())
                || weekday_of(&first).is_some()
                || MONTHS.split('|').any(|m| m == first)
            {
                continue;
            }
            push(EntityKind::Location, place, 0.55);
        }

        entities
    }
}

fn range_spec(caps: &Captures<'_>) -> Option<TimeSpec> {
    let (sh, sm, smer) = (num(caps, 1)?, num(caps, 2), caps.get(3).map(|m| m.as_str()));
    let (eh, em, emer) = (num(caps, 4)?, num(caps, 5), caps.get(6).map(|m| m.as_str()));

    if smer.is_none() && emer.is_none() && (sm.is_none() || em.is_none()) {
        return None;
    }

    let end = clock(eh, em.unwrap_or(0), emer.or(smer))?;
    let start = match (smer, emer) {
        (Some(m), _) => clock(sh, sm.unwrap_or(0), Some(m))?,
        (None, Some(m)) => {
            let same = clock(sh, sm.unwrap_or(0), Some(m))?;
            if same < end {
                same
            } else {
                clock(sh, sm.unwrap_or(0), Some("am"))?
            }
        }
        (None, None) => clock(sh, sm.unwrap_or(0), None)?,
    };

    (start < end).then_some(TimeSpec::Range(start, end))
}

impl EntityModel for EntityExtractor {
    fn name(&self) -> &str {
        "rule-entities"
    }

    fn extract(&self, text: &str, reference: DateTime<Utc>) -> Result<Vec<Entity>, ModelError> {
        let mut entities = self.date_times(text, reference);
        entities.extend(self.named(text));
        entities.sort_by_key(|e| (e.span.start, e.span.end));
        Ok(entities)
    }
}
