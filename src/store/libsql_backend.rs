//! libSQL backend for reply history and the calendar.
//!
//! Supports local file and in-memory databases over libsql's native async API.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::calendar::model::{CalendarEvent, EventSource, TimeWindow};
use crate::error::DatabaseError;
use crate::responder::history::ThreadReplyHistory;
use crate::store::migrations;
use crate::store::traits::{CalendarStore, HistoryStore};

/// libSQL database backend.
///
/// Holds one connection reused for all operations.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db)?;
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// In-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let backend = Self::from_database(db)?;
        backend.init_schema().await?;
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    async fn init_schema(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(&self.conn).await
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn fetch_history(&self, thread_id: &str) -> Result<Option<ThreadReplyHistory>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {HISTORY_COLUMNS} FROM thread_reply_history WHERE thread_id = ?1"),
                params![thread_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_history: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row_to_history(&row)
                .map(Some)
                .map_err(|e| DatabaseError::Query(format!("get_history row parse: {e}"))),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_history: {e}"))),
        }
    }

    async fn query_events(
        &self,
        op: &str,
        sql: &str,
        values: impl libsql::params::IntoParams,
    ) -> Result<Vec<CalendarEvent>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, values)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut events = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_event(&row) {
                Ok(event) => events.push(event),
                Err(e) => tracing::warn!("Skipping calendar row: {e}"),
            }
        }
        Ok(events)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string.
fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
        .or_else(|_| chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S"))
        .ok()
        .map(|ndt| ndt.and_utc())
}

fn parse_optional_datetime(s: Option<String>) -> Option<DateTime<Utc>> {
    s.as_deref().and_then(parse_datetime)
}

fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn millis_to_datetime(ms: i64) -> Result<DateTime<Utc>, DatabaseError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| DatabaseError::Serialization(format!("timestamp {ms} out of range")))
}

const HISTORY_COLUMNS: &str =
    "thread_id, auto_reply_count, last_auto_reply_at, human_replied_since_last, last_human_reply_at";

/// Column order matches `HISTORY_COLUMNS`.
fn row_to_history(row: &libsql::Row) -> Result<ThreadReplyHistory, libsql::Error> {
    let thread_id: String = row.get(0)?;
    let count: i64 = row.get(1)?;
    let last_auto: Option<String> = row.get(2).ok();
    let human_flag: i64 = row.get(3)?;
    let last_human: Option<String> = row.get(4).ok();

    Ok(ThreadReplyHistory {
        thread_id,
        auto_reply_count: u32::try_from(count).unwrap_or(u32::MAX),
        last_auto_reply_at: parse_optional_datetime(last_auto),
        human_replied_since_last: human_flag != 0,
        last_human_reply_at: parse_optional_datetime(last_human),
    })
}

const EVENT_COLUMNS: &str = "id, title, starts_at, ends_at, source, location, message_id, updated_at";

/// Column order matches `EVENT_COLUMNS`.
fn row_to_event(row: &libsql::Row) -> Result<CalendarEvent, DatabaseError> {
    let read = |e: libsql::Error| DatabaseError::Query(format!("calendar row: {e}"));

    let id_str: String = row.get(0).map_err(read)?;
    let title: String = row.get(1).map_err(read)?;
    let starts_at: i64 = row.get(2).map_err(read)?;
    let ends_at: i64 = row.get(3).map_err(read)?;
    let source: String = row.get(4).map_err(read)?;
    let location: Option<String> = row.get(5).ok();
    let message_id: Option<String> = row.get(6).ok();
    let updated_str: String = row.get(7).map_err(read)?;

    let id = Uuid::parse_str(&id_str)
        .map_err(|e| DatabaseError::Serialization(format!("event id '{id_str}': {e}")))?;
    let window = TimeWindow::new(millis_to_datetime(starts_at)?, millis_to_datetime(ends_at)?)
        .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

    Ok(CalendarEvent {
        id,
        title,
        window,
        source: EventSource::parse(&source),
        location,
        message_id,
        updated_at: parse_datetime(&updated_str).unwrap_or(DateTime::<Utc>::MIN_UTC),
    })
}

// ── Thread reply history ────────────────────────────────────────────

#[async_trait]
impl HistoryStore for LibSqlBackend {
    async fn get_history(&self, thread_id: &str) -> Result<ThreadReplyHistory, DatabaseError> {
        Ok(self
            .fetch_history(thread_id)
            .await?
            .unwrap_or_else(|| ThreadReplyHistory::new(thread_id)))
    }

    async fn record_auto_reply(
        &self,
        thread_id: &str,
        at: DateTime<Utc>,
    ) -> Result<ThreadReplyHistory, DatabaseError> {
        let now = Utc::now().to_rfc3339();
        self.conn()
            .execute(
                "INSERT INTO thread_reply_history
                    (thread_id, auto_reply_count, last_auto_reply_at, human_replied_since_last, updated_at)
                 VALUES (?1, 1, ?2, 0, ?3)
                 ON CONFLICT(thread_id) DO UPDATE SET
                    auto_reply_count = auto_reply_count + 1,
                    last_auto_reply_at = excluded.last_auto_reply_at,
                    human_replied_since_last = 0,
                    updated_at = excluded.updated_at",
                params![thread_id, at.to_rfc3339(), now],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_auto_reply: {e}")))?;

        debug!(thread_id, "Auto reply recorded in history");
        self.get_history(thread_id).await
    }

    async fn record_human_reply(
        &self,
        thread_id: &str,
        at: DateTime<Utc>,
    ) -> Result<ThreadReplyHistory, DatabaseError> {
        let now = Utc::now().to_rfc3339();
        self.conn()
            .execute(
                "INSERT INTO thread_reply_history
                    (thread_id, auto_reply_count, human_replied_since_last, last_human_reply_at, updated_at)
                 VALUES (?1, 0, 0, ?2, ?3)
                 ON CONFLICT(thread_id) DO UPDATE SET
                    last_human_reply_at = excluded.last_human_reply_at,
                    human_replied_since_last =
                        CASE WHEN last_auto_reply_at IS NULL THEN 0 ELSE 1 END,
                    updated_at = excluded.updated_at",
                params![thread_id, at.to_rfc3339(), now],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_human_reply: {e}")))?;

        self.get_history(thread_id).await
    }
}

// ── Calendar ────────────────────────────────────────────────────────

#[async_trait]
impl CalendarStore for LibSqlBackend {
    async fn get_event(&self, id: Uuid) -> Result<Option<CalendarEvent>, DatabaseError> {
        let mut events = self
            .query_events(
                "get_event",
                &format!("SELECT {EVENT_COLUMNS} FROM calendar_events WHERE id = ?1"),
                params![id.to_string()],
            )
            .await?;
        Ok(events.pop())
    }

    async fn list_events_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<CalendarEvent>, DatabaseError> {
        self.query_events(
            "list_events_between",
            &format!(
                "SELECT {EVENT_COLUMNS} FROM calendar_events
                 WHERE starts_at < ?2 AND ends_at > ?1
                 ORDER BY starts_at ASC, id ASC"
            ),
            params![from.timestamp_millis(), to.timestamp_millis()],
        )
        .await
    }

    async fn events_for_message(
        &self,
        message_id: &str,
    ) -> Result<Vec<CalendarEvent>, DatabaseError> {
        self.query_events(
            "events_for_message",
            &format!(
                "SELECT {EVENT_COLUMNS} FROM calendar_events WHERE message_id = ?1 ORDER BY starts_at ASC"
            ),
            params![message_id],
        )
        .await
    }

    async fn upsert_event(&self, event: &CalendarEvent) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!(
                    "INSERT OR REPLACE INTO calendar_events ({EVENT_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
                ),
                params![
                    event.id.to_string(),
                    event.title.as_str(),
                    event.start().timestamp_millis(),
                    event.end().timestamp_millis(),
                    event.source.as_str(),
                    opt_text(event.location.as_deref()),
                    opt_text(event.message_id.as_deref()),
                    event.updated_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_event: {e}")))?;

        debug!(event_id = %event.id, source = event.source.as_str(), "Calendar event stored");
        Ok(())
    }

    async fn delete_event(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "DELETE FROM calendar_events WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_event: {e}")))?;
        Ok(count > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, h, m, 0).unwrap()
    }

    fn make_event(h: u32, source: EventSource) -> CalendarEvent {
        let window = TimeWindow::starting_at(at(h, 0), Duration::hours(1)).unwrap();
        CalendarEvent::new("Review", window, source)
    }

    // ── History tests ───────────────────────────────────────────────

    #[tokio::test]
    async fn unknown_thread_has_empty_history() {
        let db = test_db().await;
        let history = db.get_history("nope").await.unwrap();
        assert_eq!(history, ThreadReplyHistory::new("nope"));
    }

    #[tokio::test]
    async fn auto_replies_accumulate() {
        let db = test_db().await;
        db.record_auto_reply("t1", at(9, 0)).await.unwrap();
        let history = db.record_auto_reply("t1", at(10, 0)).await.unwrap();
        assert_eq!(history.auto_reply_count, 2);
        assert_eq!(history.last_auto_reply_at, Some(at(10, 0)));
    }

    #[tokio::test]
    async fn human_reply_flag_follows_auto_reply() {
        let db = test_db().await;
        let history = db.record_human_reply("t1", at(8, 0)).await.unwrap();
        assert!(!history.human_replied_since_last);

        db.record_auto_reply("t1", at(9, 0)).await.unwrap();
        let history = db.record_human_reply("t1", at(9, 30)).await.unwrap();
        assert!(history.human_replied_since_last);
        assert_eq!(history.last_human_reply_at, Some(at(9, 30)));

        let history = db.record_auto_reply("t1", at(11, 0)).await.unwrap();
        assert!(!history.human_replied_since_last);
    }

    // ── Calendar tests ──────────────────────────────────────────────

    #[tokio::test]
    async fn upsert_and_get_event() {
        let db = test_db().await;
        let event = make_event(9, EventSource::Proposed)
            .with_location(Some("Room 4".into()))
            .with_message_id("m1");
        db.upsert_event(&event).await.unwrap();

        let fetched = db.get_event(event.id).await.unwrap().unwrap();
        assert_eq!(fetched.window, event.window);
        assert_eq!(fetched.source, EventSource::Proposed);
        assert_eq!(fetched.location.as_deref(), Some("Room 4"));
        assert_eq!(db.events_for_message("m1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn upsert_replaces_existing_row() {
        let db = test_db().await;
        let mut event = make_event(9, EventSource::Proposed);
        db.upsert_event(&event).await.unwrap();
        event.source = EventSource::Confirmed;
        db.upsert_event(&event).await.unwrap();

        let fetched = db.get_event(event.id).await.unwrap().unwrap();
        assert_eq!(fetched.source, EventSource::Confirmed);
    }

    #[tokio::test]
    async fn range_query_orders_by_start() {
        let db = test_db().await;
        db.upsert_event(&make_event(14, EventSource::Manual)).await.unwrap();
        db.upsert_event(&make_event(9, EventSource::Manual)).await.unwrap();
        db.upsert_event(&make_event(20, EventSource::Manual)).await.unwrap();

        let found = db.list_events_between(at(9, 30), at(15, 0)).await.unwrap();
        let starts: Vec<_> = found.iter().map(|e| e.start()).collect();
        assert_eq!(starts, vec![at(9, 0), at(14, 0)]);
    }

    #[tokio::test]
    async fn delete_reports_presence() {
        let db = test_db().await;
        let event = make_event(9, EventSource::Manual);
        db.upsert_event(&event).await.unwrap();
        assert!(db.delete_event(event.id).await.unwrap());
        assert!(!db.delete_event(event.id).await.unwrap());
        assert!(db.get_event(event.id).await.unwrap().is_none());
    }
}
