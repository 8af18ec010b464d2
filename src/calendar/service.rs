//! Calendar service: resolver decisions plus explicit confirm, reschedule
//! and cancel operations over a [`CalendarStore`].
//!
//! All writes go through one async mutex, so a check-then-write against the
//! store never interleaves with another.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::calendar::model::{CalendarEvent, EventSource, TimeWindow};
use crate::calendar::resolver::{ConflictResolver, Decision};
use crate::error::CalendarError;
use crate::pipeline::meeting::MeetingProposal;
use crate::store::traits::CalendarStore;

pub struct Calendar {
    store: Arc<dyn CalendarStore>,
    resolver: ConflictResolver,
    writer: Mutex<()>,
}

impl Calendar {
    pub fn new(store: Arc<dyn CalendarStore>, resolver: ConflictResolver) -> Self {
        Self {
            store,
            resolver,
            writer: Mutex::new(()),
        }
    }

    pub fn resolver(&self) -> &ConflictResolver {
        &self.resolver
    }

    /// Resolve a proposal against stored events. A free slot is held as a
    /// `Proposed` event. Earlier holds from the same message are released
    /// whatever the new decision is.
    pub async fn evaluate(&self, proposal: &MeetingProposal) -> Result<Decision, CalendarError> {
        let _guard = self.writer.lock().await;
        let decision = if proposal.is_ambiguous() {
            self.resolver.resolve(proposal, &[])?
        } else {
            let requested = *proposal
                .requested()
                .ok_or_else(|| CalendarError::NoCandidate {
                    message_id: proposal.message_id.clone(),
                })?;
            let (from, to) = self.search_range(&requested);
            let existing = self.store.list_events_between(from, to).await?;
            self.resolver.resolve(proposal, &existing)?
        };

        for stale in self.store.events_for_message(&proposal.message_id).await? {
            if stale.source == EventSource::Proposed {
                self.store.delete_event(stale.id).await?;
                debug!(
                    event_id = %stale.id,
                    message_id = %proposal.message_id,
                    "Released earlier hold"
                );
            }
        }

        if let Decision::Confirm { event } = &decision {
            self.store.upsert_event(event).await?;
            debug!(
                event_id = %event.id,
                message_id = %proposal.message_id,
                "Held proposed slot"
            );
        }
        Ok(decision)
    }

    /// Promote an event to `Confirmed`. Fails if it would sit within the
    /// buffer of another firm event.
    pub async fn confirm(&self, id: Uuid) -> Result<CalendarEvent, CalendarError> {
        let _guard = self.writer.lock().await;
        let mut event = self.load(id).await?;
        self.ensure_clear(id, &event.window).await?;
        event.source = EventSource::Confirmed;
        event.updated_at = Utc::now();
        self.store.upsert_event(&event).await?;
        info!(event_id = %id, start = %event.start(), "Calendar event confirmed");
        Ok(event)
    }

    /// Move an event. Firm events keep their source and must stay clear of
    /// other firm events.
    pub async fn reschedule(
        &self,
        id: Uuid,
        window: TimeWindow,
    ) -> Result<CalendarEvent, CalendarError> {
        let _guard = self.writer.lock().await;
        let mut event = self.load(id).await?;
        if event.source.is_firm() {
            self.ensure_clear(id, &window).await?;
        }
        event.window = window;
        event.updated_at = Utc::now();
        self.store.upsert_event(&event).await?;
        info!(event_id = %id, start = %window.start(), "Calendar event rescheduled");
        Ok(event)
    }

    /// Remove an event, returning it.
    pub async fn cancel(&self, id: Uuid) -> Result<CalendarEvent, CalendarError> {
        let _guard = self.writer.lock().await;
        let event = self.load(id).await?;
        self.store.delete_event(id).await?;
        info!(event_id = %id, "Calendar event cancelled");
        Ok(event)
    }

    /// Enter an event directly as the user.
    pub async fn add_manual(
        &self,
        title: impl Into<String>,
        window: TimeWindow,
    ) -> Result<CalendarEvent, CalendarError> {
        let _guard = self.writer.lock().await;
        let event = CalendarEvent::new(title, window, EventSource::Manual);
        self.ensure_clear(event.id, &window).await?;
        self.store.upsert_event(&event).await?;
        Ok(event)
    }

    pub async fn events_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<CalendarEvent>, CalendarError> {
        Ok(self.store.list_events_between(from, to).await?)
    }

    async fn load(&self, id: Uuid) -> Result<CalendarEvent, CalendarError> {
        self.store
            .get_event(id)
            .await?
            .ok_or(CalendarError::NotFound { id })
    }

    async fn ensure_clear(&self, id: Uuid, window: &TimeWindow) -> Result<(), CalendarError> {
        let buffer = self.resolver.settings().buffer;
        let nearby = self
            .store
            .list_events_between(window.start() - buffer, window.end() + buffer)
            .await?;
        let conflicting: Vec<Uuid> = nearby
            .iter()
            .filter(|e| e.id != id && e.source.is_firm() && self.resolver.collides(window, e))
            .map(|e| e.id)
            .collect();
        if conflicting.is_empty() {
            Ok(())
        } else {
            Err(CalendarError::Conflict { id, conflicting })
        }
    }

    /// Range wide enough to see every event that can block the requested
    /// slot or any alternative.
    fn search_range(&self, requested: &TimeWindow) -> (DateTime<Utc>, DateTime<Utc>) {
        let settings = self.resolver.settings();
        let days = settings.lookahead_business_days as i64 * 3 + 3;
        (
            requested.start() - Duration::days(1) - settings.buffer,
            requested.end() + Duration::days(days) + settings.buffer,
        )
    }
}
