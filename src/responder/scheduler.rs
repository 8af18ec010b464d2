//! Fire-time schedule for reply tasks and the background loop that drains it.
//!
//! Entries are never removed on cancellation. The orchestrator checks the
//! task state when an entry comes due and drops stale ones.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use crate::responder::orchestrator::AutoResponder;

/// Longest sleep between schedule checks, so shutdown is noticed.
const IDLE_POLL: Duration = Duration::from_secs(1);

/// Time between retention sweeps of finished reply tasks.
const PRUNE_EVERY: Duration = Duration::from_secs(60 * 60);

/// One due-time entry.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ScheduledFire {
    pub fire_at: DateTime<Utc>,
    pub task_id: Uuid,
    pub thread_id: String,
}

/// Min-heap of fire times.
#[derive(Debug, Default)]
pub struct ReplySchedule {
    heap: Mutex<BinaryHeap<Reverse<ScheduledFire>>>,
    wake: Notify,
}

impl ReplySchedule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, fire_at: DateTime<Utc>, task_id: Uuid, thread_id: impl Into<String>) {
        let entry = ScheduledFire {
            fire_at,
            task_id,
            thread_id: thread_id.into(),
        };
        self.heap
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Reverse(entry));
        self.wake.notify_one();
    }

    /// Remove and return every entry due at or before `now`, earliest first.
    pub fn pop_due(&self, now: DateTime<Utc>) -> Vec<ScheduledFire> {
        let mut heap = self.heap.lock().unwrap_or_else(PoisonError::into_inner);
        let mut due = Vec::new();
        while heap.peek().is_some_and(|Reverse(e)| e.fire_at <= now) {
            if let Some(Reverse(entry)) = heap.pop() {
                due.push(entry);
            }
        }
        due
    }

    pub fn next_fire_at(&self) -> Option<DateTime<Utc>> {
        self.heap
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .peek()
            .map(|Reverse(e)| e.fire_at)
    }

    pub fn len(&self) -> usize {
        self.heap.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolves after the next `push`.
    pub async fn changed(&self) {
        self.wake.notified().await;
    }
}

/// Spawn the loop that fires due reply tasks.
///
/// Sleeps until the earliest entry is due or a new entry is pushed, then
/// hands due entries to [`AutoResponder::fire_due`]. Once an hour it also
/// calls [`AutoResponder::prune`].
///
/// Returns a `JoinHandle` and shutdown flag.
pub fn spawn_reply_scheduler(responder: Arc<AutoResponder>) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        info!("Reply scheduler started");
        let schedule = responder.schedule();
        let mut last_prune = Instant::now();

        loop {
            if shutdown.load(Ordering::Relaxed) {
                info!("Reply scheduler shutting down");
                return;
            }

            let outcomes = responder.fire_due(Utc::now()).await;
            if !outcomes.is_empty() {
                debug!(count = outcomes.len(), "Processed due reply tasks");
            }

            if last_prune.elapsed() >= PRUNE_EVERY {
                responder.prune(Utc::now()).await;
                last_prune = Instant::now();
            }

            let wait = schedule
                .next_fire_at()
                .and_then(|at| (at - Utc::now()).to_std().ok())
                .map_or(IDLE_POLL, |d| d.min(IDLE_POLL));

            tokio::select! {
                _ = schedule.changed() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    });

    (handle, shutdown_flag)
}
