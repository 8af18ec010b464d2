//! Configuration types.
//!
//! `PipelineConfig::load()` starts from defaults, merges an optional JSON file
//! (`MAIL_AUTOPILOT_CONFIG`), applies `MAIL_AUTOPILOT_*` environment
//! overrides and validates the result. Any error is fatal at startup.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use chrono::Duration;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::pipeline::spam::MAX_SIGNAL_BOOST;
use crate::pipeline::types::Category;

const ENV_PREFIX: &str = "MAIL_AUTOPILOT_";

const MAX_REPLY_DELAY_MINUTES: i64 = 7 * 24 * 60;
const MAX_REPLY_INTERVAL_MINUTES: i64 = 365 * 24 * 60;
const MAX_CALENDAR_BUFFER_MINUTES: i64 = 24 * 60;
const MAX_MEETING_MINUTES: i64 = 24 * 60;
const MAX_RETRY_BASE_SECS: i64 = 24 * 60 * 60;
const MAX_TASK_RETENTION_DAYS: i64 = 10 * 365;

/// All recognized options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Master switch for automatic replies.
    pub auto_respond_enabled: bool,
    /// Categories eligible for an automatic reply.
    pub auto_respond_categories: BTreeSet<Category>,
    /// Delay between an eligible inbound message and its reply.
    pub reply_delay_minutes: i64,
    /// Automatic replies allowed per thread over its lifetime.
    pub max_auto_replies_per_thread: u32,
    /// Minimum time between two automatic replies on a thread.
    pub min_reply_interval_minutes: i64,
    /// Spam score at or above which a message is never answered.
    pub spam_threshold: f32,
    /// Meeting-request confidence a proposal must exceed.
    pub meeting_confidence_threshold: f32,
    /// Gap enforced around existing events.
    pub calendar_buffer_minutes: i64,
    /// Alternative slots offered on conflict.
    pub alternative_slot_count: usize,
    /// Business days searched after the requested day.
    pub lookahead_business_days: u32,
    /// Business hours (local), `[open, close)`.
    pub business_hours: (u32, u32),
    /// Meeting length when the message gives no end time.
    pub default_meeting_minutes: i64,
    /// Characters of body text fed to feature extraction.
    pub truncate_chars: usize,
    /// IANA time zone used to read dates in messages.
    pub timezone: Tz,
    /// Concurrent message workers.
    pub workers: usize,
    /// Bounded ingest queue capacity.
    pub queue_capacity: usize,
    /// Seconds between mailbox polls.
    pub poll_interval_secs: u64,
    /// Send attempts before a reply is suppressed.
    pub max_send_attempts: u32,
    /// First retry delay; doubles per attempt.
    pub send_retry_base_secs: i64,
    /// Fetch attempts per poll before giving up until the next tick.
    pub max_fetch_attempts: u32,
    /// Days a thread's finished reply tasks are kept for inspection.
    pub task_retention_days: i64,
    /// The user's own address; mail from it counts as a manual reply.
    pub user_address: Option<String>,
    pub user_name: String,
    pub signature: String,
    /// libSQL database for history and calendar. `None` keeps state in memory.
    pub database_path: Option<PathBuf>,
    /// Spool directories used by the binary's mailbox adapter.
    pub inbox_dir: PathBuf,
    pub outbox_dir: PathBuf,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            auto_respond_enabled: true,
            auto_respond_categories: [
                Category::Application,
                Category::MeetingRequest,
                Category::Support,
            ]
            .into_iter()
            .collect(),
            reply_delay_minutes: 5,
            max_auto_replies_per_thread: 3,
            min_reply_interval_minutes: 24 * 60,
            spam_threshold: 0.7,
            meeting_confidence_threshold: 0.5,
            calendar_buffer_minutes: 15,
            alternative_slot_count: 3,
            lookahead_business_days: 1,
            business_hours: (9, 18),
            default_meeting_minutes: 60,
            truncate_chars: 10_000,
            timezone: Tz::UTC,
            workers: 4,
            queue_capacity: 256,
            poll_interval_secs: 300,
            max_send_attempts: 3,
            send_retry_base_secs: 30,
            max_fetch_attempts: 3,
            task_retention_days: 30,
            user_address: None,
            user_name: String::new(),
            signature: String::new(),
            database_path: None,
            inbox_dir: PathBuf::from("./data/inbox"),
            outbox_dir: PathBuf::from("./data/outbox"),
        }
    }
}

impl PipelineConfig {
    /// Defaults + optional JSON file + environment, validated.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var(format!("{ENV_PREFIX}CONFIG")) {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        config.apply_env(|key| std::env::var(format!("{ENV_PREFIX}{key}")).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a JSON file. Missing keys keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw)
            .map_err(|e| ConfigError::ParseError(format!("{}: {e}", path.display())))
    }

    /// Apply overrides from a key lookup (`REPLY_DELAY_MINUTES`, ...).
    pub fn apply_env(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(v) = lookup("AUTO_RESPOND_ENABLED") {
            self.auto_respond_enabled = parse_value("AUTO_RESPOND_ENABLED", &v)?;
        }
        if let Some(v) = lookup("AUTO_RESPOND_CATEGORIES") {
            self.auto_respond_categories = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| s.parse::<Category>())
                .collect::<Result<_, _>>()
                .map_err(|e| ConfigError::invalid("AUTO_RESPOND_CATEGORIES", e))?;
        }
        if let Some(v) = lookup("REPLY_DELAY_MINUTES") {
            self.reply_delay_minutes = parse_value("REPLY_DELAY_MINUTES", &v)?;
        }
        if let Some(v) = lookup("MAX_AUTO_REPLIES_PER_THREAD") {
            self.max_auto_replies_per_thread = parse_value("MAX_AUTO_REPLIES_PER_THREAD", &v)?;
        }
        if let Some(v) = lookup("MIN_REPLY_INTERVAL_MINUTES") {
            self.min_reply_interval_minutes = parse_value("MIN_REPLY_INTERVAL_MINUTES", &v)?;
        }
        if let Some(v) = lookup("SPAM_THRESHOLD") {
            self.spam_threshold = parse_value("SPAM_THRESHOLD", &v)?;
        }
        if let Some(v) = lookup("MEETING_CONFIDENCE_THRESHOLD") {
            self.meeting_confidence_threshold = parse_value("MEETING_CONFIDENCE_THRESHOLD", &v)?;
        }
        if let Some(v) = lookup("CALENDAR_BUFFER_MINUTES") {
            self.calendar_buffer_minutes = parse_value("CALENDAR_BUFFER_MINUTES", &v)?;
        }
        if let Some(v) = lookup("ALTERNATIVE_SLOT_COUNT") {
            self.alternative_slot_count = parse_value("ALTERNATIVE_SLOT_COUNT", &v)?;
        }
        if let Some(v) = lookup("TRUNCATE_CHARS") {
            self.truncate_chars = parse_value("TRUNCATE_CHARS", &v)?;
        }
        if let Some(v) = lookup("TIMEZONE") {
            self.timezone = v
                .trim()
                .parse()
                .map_err(|e| ConfigError::invalid("TIMEZONE", format!("{e}")))?;
        }
        if let Some(v) = lookup("WORKERS") {
            self.workers = parse_value("WORKERS", &v)?;
        }
        if let Some(v) = lookup("POLL_INTERVAL_SECS") {
            self.poll_interval_secs = parse_value("POLL_INTERVAL_SECS", &v)?;
        }
        if let Some(v) = lookup("SEND_RETRY_BASE_SECS") {
            self.send_retry_base_secs = parse_value("SEND_RETRY_BASE_SECS", &v)?;
        }
        if let Some(v) = lookup("TASK_RETENTION_DAYS") {
            self.task_retention_days = parse_value("TASK_RETENTION_DAYS", &v)?;
        }
        if let Some(v) = lookup("USER_ADDRESS") {
            self.user_address = Some(v.trim().to_string()).filter(|s| !s.is_empty());
        }
        if let Some(v) = lookup("USER_NAME") {
            self.user_name = v;
        }
        if let Some(v) = lookup("SIGNATURE") {
            self.signature = v;
        }
        if let Some(v) = lookup("DB_PATH") {
            self.database_path = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("INBOX_DIR") {
            self.inbox_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("OUTBOX_DIR") {
            self.outbox_dir = PathBuf::from(v);
        }
        Ok(())
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_spam_threshold(self.spam_threshold)?;
        check_unit("meeting_confidence_threshold", self.meeting_confidence_threshold)?;
        check_range(
            "reply_delay_minutes",
            self.reply_delay_minutes,
            0,
            MAX_REPLY_DELAY_MINUTES,
        )?;
        check_range(
            "min_reply_interval_minutes",
            self.min_reply_interval_minutes,
            0,
            MAX_REPLY_INTERVAL_MINUTES,
        )?;
        check_range(
            "calendar_buffer_minutes",
            self.calendar_buffer_minutes,
            0,
            MAX_CALENDAR_BUFFER_MINUTES,
        )?;
        check_range(
            "default_meeting_minutes",
            self.default_meeting_minutes,
            1,
            MAX_MEETING_MINUTES,
        )?;
        check_range(
            "send_retry_base_secs",
            self.send_retry_base_secs,
            1,
            MAX_RETRY_BASE_SECS,
        )?;
        check_range(
            "task_retention_days",
            self.task_retention_days,
            1,
            MAX_TASK_RETENTION_DAYS,
        )?;
        let (open, close) = self.business_hours;
        if open >= close || close > 24 {
            return Err(ConfigError::invalid(
                "business_hours",
                format!("({open}, {close}) is not a valid range"),
            ));
        }
        if self.truncate_chars == 0 {
            return Err(ConfigError::invalid("truncate_chars", "must be positive"));
        }
        if self.workers == 0 || self.queue_capacity == 0 {
            return Err(ConfigError::invalid("workers", "workers and queue capacity must be positive"));
        }
        if self.max_send_attempts == 0 || self.max_fetch_attempts == 0 {
            return Err(ConfigError::invalid("max_send_attempts", "attempt caps must be positive"));
        }
        Ok(())
    }

    // Accessors clamp to the validated ranges.

    pub fn reply_delay(&self) -> Duration {
        Duration::minutes(self.reply_delay_minutes.clamp(0, MAX_REPLY_DELAY_MINUTES))
    }

    pub fn min_reply_interval(&self) -> Duration {
        Duration::minutes(
            self.min_reply_interval_minutes
                .clamp(0, MAX_REPLY_INTERVAL_MINUTES),
        )
    }

    pub fn calendar_buffer(&self) -> Duration {
        Duration::minutes(self.calendar_buffer_minutes.clamp(0, MAX_CALENDAR_BUFFER_MINUTES))
    }

    pub fn default_meeting_length(&self) -> Duration {
        Duration::minutes(self.default_meeting_minutes.clamp(1, MAX_MEETING_MINUTES))
    }

    pub fn send_retry_base(&self) -> Duration {
        Duration::seconds(self.send_retry_base_secs.clamp(1, MAX_RETRY_BASE_SECS))
    }

    pub fn task_retention(&self) -> Duration {
        Duration::days(self.task_retention_days.clamp(1, MAX_TASK_RETENTION_DAYS))
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| ConfigError::invalid(key, format!("'{raw}': {e}")))
}

/// A probability-like threshold in `[0, 1]`.
pub fn check_unit(key: &str, value: f32) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::invalid(key, format!("{value} is outside [0, 1]")))
    }
}

/// A spam threshold no single heuristic signal can reach on its own.
pub fn check_spam_threshold(value: f32) -> Result<(), ConfigError> {
    check_unit("spam_threshold", value)?;
    if value <= MAX_SIGNAL_BOOST {
        return Err(ConfigError::invalid(
            "spam_threshold",
            format!("must exceed the single-heuristic cap {MAX_SIGNAL_BOOST}"),
        ));
    }
    Ok(())
}

fn check_range(key: &str, value: i64, min: i64, max: i64) -> Result<(), ConfigError> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::invalid(
            key,
            format!("{value} is outside [{min}, {max}]"),
        ))
    }
}
