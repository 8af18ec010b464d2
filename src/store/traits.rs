//! Storage traits for the pieces of pipeline state that outlive a process.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::calendar::model::CalendarEvent;
use crate::error::DatabaseError;
use crate::responder::history::ThreadReplyHistory;

/// Thread reply history. Must be durable for loop avoidance to survive restarts.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// History for a thread; an empty record if the thread was never seen.
    async fn get_history(&self, thread_id: &str) -> Result<ThreadReplyHistory, DatabaseError>;

    /// Count one automatic reply sent at `at`. Returns the updated record.
    async fn record_auto_reply(
        &self,
        thread_id: &str,
        at: DateTime<Utc>,
    ) -> Result<ThreadReplyHistory, DatabaseError>;

    /// Note a manual reply by the user at `at`. Returns the updated record.
    async fn record_human_reply(
        &self,
        thread_id: &str,
        at: DateTime<Utc>,
    ) -> Result<ThreadReplyHistory, DatabaseError>;
}

/// Calendar event storage.
#[async_trait]
pub trait CalendarStore: Send + Sync {
    async fn get_event(&self, id: Uuid) -> Result<Option<CalendarEvent>, DatabaseError>;

    /// Events intersecting `[from, to)`, ordered by start.
    async fn list_events_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<CalendarEvent>, DatabaseError>;

    /// Events derived from a given message.
    async fn events_for_message(
        &self,
        message_id: &str,
    ) -> Result<Vec<CalendarEvent>, DatabaseError>;

    /// Insert or replace by id.
    async fn upsert_event(&self, event: &CalendarEvent) -> Result<(), DatabaseError>;

    /// Returns whether an event was removed.
    async fn delete_event(&self, id: Uuid) -> Result<bool, DatabaseError>;
}
