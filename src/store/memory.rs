//! In-memory stores for tests and ephemeral runs.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::calendar::model::CalendarEvent;
use crate::error::DatabaseError;
use crate::responder::history::ThreadReplyHistory;
use crate::store::traits::{CalendarStore, HistoryStore};

#[derive(Default)]
pub struct MemoryHistoryStore {
    threads: RwLock<HashMap<String, ThreadReplyHistory>>,
}

impl MemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HistoryStore for MemoryHistoryStore {
    async fn get_history(&self, thread_id: &str) -> Result<ThreadReplyHistory, DatabaseError> {
        let threads = self.threads.read().await;
        Ok(threads
            .get(thread_id)
            .cloned()
            .unwrap_or_else(|| ThreadReplyHistory::new(thread_id)))
    }

    async fn record_auto_reply(
        &self,
        thread_id: &str,
        at: DateTime<Utc>,
    ) -> Result<ThreadReplyHistory, DatabaseError> {
        let mut threads = self.threads.write().await;
        let history = threads
            .entry(thread_id.to_string())
            .or_insert_with(|| ThreadReplyHistory::new(thread_id));
        history.record_auto_reply(at);
        Ok(history.clone())
    }

    async fn record_human_reply(
        &self,
        thread_id: &str,
        at: DateTime<Utc>,
    ) -> Result<ThreadReplyHistory, DatabaseError> {
        let mut threads = self.threads.write().await;
        let history = threads
            .entry(thread_id.to_string())
            .or_insert_with(|| ThreadReplyHistory::new(thread_id));
        history.record_human_reply(at);
        Ok(history.clone())
    }
}

#[derive(Default)]
pub struct MemoryCalendarStore {
    events: RwLock<HashMap<Uuid, CalendarEvent>>,
}

impl MemoryCalendarStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populated store.
    pub fn with_events(events: impl IntoIterator<Item = CalendarEvent>) -> Self {
        Self {
            events: RwLock::new(events.into_iter().map(|e| (e.id, e)).collect()),
        }
    }
}

#[async_trait]
impl CalendarStore for MemoryCalendarStore {
    async fn get_event(&self, id: Uuid) -> Result<Option<CalendarEvent>, DatabaseError> {
        Ok(self.events.read().await.get(&id).cloned())
    }

    async fn list_events_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<CalendarEvent>, DatabaseError> {
        let events = self.events.read().await;
        let mut found: Vec<CalendarEvent> = events
            .values()
            .filter(|e| e.start() < to && from < e.end())
            .cloned()
            .collect();
        found.sort_by_key(|e| (e.start(), e.id));
        Ok(found)
    }

    async fn events_for_message(
        &self,
        message_id: &str,
    ) -> Result<Vec<CalendarEvent>, DatabaseError> {
        let events = self.events.read().await;
        Ok(events
            .values()
            .filter(|e| e.message_id.as_deref() == Some(message_id))
            .cloned()
            .collect())
    }

    async fn upsert_event(&self, event: &CalendarEvent) -> Result<(), DatabaseError> {
        self.events.write().await.insert(event.id, event.clone());
        Ok(())
    }

    async fn delete_event(&self, id: Uuid) -> Result<bool, DatabaseError> {
        Ok(self.events.write().await.remove(&id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::model::{EventSource, TimeWindow};
    use chrono::{Duration, TimeZone};

    #[tokio::test]
    async fn history_defaults_to_empty() {
        let store = MemoryHistoryStore::new();
        let history = store.get_history("t1").await.unwrap();
        assert_eq!(history.auto_reply_count, 0);
        store.record_auto_reply("t1", Utc::now()).await.unwrap();
        assert_eq!(store.get_history("t1").await.unwrap().auto_reply_count, 1);
    }

    #[tokio::test]
    async fn range_query_uses_half_open_intervals() {
        let start = Utc.with_ymd_and_hms(2026, 3, 10, 9, 0, 0).unwrap();
        let window = TimeWindow::starting_at(start, Duration::hours(1)).unwrap();
        let store = MemoryCalendarStore::with_events([CalendarEvent::new(
            "standup",
            window,
            EventSource::Manual,
        )]);

        let hit = store
            .list_events_between(start + Duration::minutes(59), start + Duration::hours(2))
            .await
            .unwrap();
        assert_eq!(hit.len(), 1);

        let miss = store
            .list_events_between(start + Duration::hours(1), start + Duration::hours(2))
            .await
            .unwrap();
        assert!(miss.is_empty());
    }
}
