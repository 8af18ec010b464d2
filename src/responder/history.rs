//! Per-thread automatic reply history.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// What the pipeline remembers about automatic replies on one thread.
///
/// `auto_reply_count` only ever grows. Stores expose increments, never writes
/// of an arbitrary count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadReplyHistory {
    pub thread_id: String,
    pub auto_reply_count: u32,
    pub last_auto_reply_at: Option<DateTime<Utc>>,
    /// The user answered by hand after the last automatic reply.
    pub human_replied_since_last: bool,
    pub last_human_reply_at: Option<DateTime<Utc>>,
}

impl ThreadReplyHistory {
    pub fn new(thread_id: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            auto_reply_count: 0,
            last_auto_reply_at: None,
            human_replied_since_last: false,
            last_human_reply_at: None,
        }
    }

    pub fn record_auto_reply(&mut self, at: DateTime<Utc>) {
        self.auto_reply_count = self.auto_reply_count.saturating_add(1);
        self.last_auto_reply_at = Some(at);
        self.human_replied_since_last = false;
    }

    pub fn record_human_reply(&mut self, at: DateTime<Utc>) {
        self.last_human_reply_at = Some(at);
        if self.last_auto_reply_at.is_some() {
            self.human_replied_since_last = true;
        }
    }

    pub fn cap_reached(&self, cap: u32) -> bool {
        self.auto_reply_count >= cap
    }

    /// True while `now` is closer than `min_interval` to the last automatic reply.
    pub fn within_interval(&self, now: DateTime<Utc>, min_interval: Duration) -> bool {
        self.last_auto_reply_at
            .is_some_and(|last| now - last < min_interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_reply_increments_and_clears_human_flag() {
        let now = Utc::now();
        let mut history = ThreadReplyHistory::new("t1");
        history.record_auto_reply(now);
        history.record_human_reply(now + Duration::minutes(1));
        assert!(history.human_replied_since_last);

        history.record_auto_reply(now + Duration::hours(30));
        assert_eq!(history.auto_reply_count, 2);
        assert!(!history.human_replied_since_last);
    }

    #[test]
    fn human_reply_before_any_auto_reply_leaves_flag_unset() {
        let mut history = ThreadReplyHistory::new("t1");
        history.record_human_reply(Utc::now());
        assert!(!history.human_replied_since_last);
        assert!(history.last_human_reply_at.is_some());
    }

    #[test]
    fn interval_and_cap() {
        let now = Utc::now();
        let mut history = ThreadReplyHistory::new("t1");
        assert!(!history.within_interval(now, Duration::hours(24)));
        history.record_auto_reply(now);
        assert!(history.within_interval(now + Duration::hours(23), Duration::hours(24)));
        assert!(!history.within_interval(now + Duration::hours(24), Duration::hours(24)));
        assert!(history.cap_reached(1));
        assert!(!history.cap_reached(2));
    }
}
