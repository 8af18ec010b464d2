//! Auto-response orchestrator.
//!
//! Every thread has its own record behind its own lock, so decisions for one
//! thread are serialized while different threads proceed in parallel. The
//! map of records is only locked long enough to look a record up.
//!
//! A thread is idle when it has no pending task. An eligible inbound message
//! creates a `Pending` task (superseding any earlier one); the task fires
//! from the schedule unless it is cancelled first. Cancellation is a status
//! flip that the fire path checks under the thread lock.
//!
//! Messages can arrive out of order. One received before a message that
//! already has a pending or sent reply is recorded as cancelled and never
//! answered.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Duration, Utc};
use futures::future::join_all;
use tokio::sync::{Mutex, RwLock as AsyncRwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::calendar::resolver::Decision;
use crate::config::PipelineConfig;
use crate::error::{DatabaseError, PipelineError};
use crate::events::{EventBus, PipelineEvent};
use crate::pipeline::types::{Category, ClassificationResult, MailboxProvider, Message};
use crate::responder::history::ThreadReplyHistory;
use crate::responder::scheduler::{ReplySchedule, ScheduledFire};
use crate::responder::state::{ReplyStatus, ReplyTask, TaskReason};
use crate::responder::templates::ReplyComposer;
use crate::store::traits::HistoryStore;

/// Tasks remembered per thread for inspection.
const MAX_TASKS_PER_THREAD: usize = 50;

/// Largest backoff exponent.
const MAX_BACKOFF_SHIFT: u32 = 16;

/// Longest wait between two send attempts.
const MAX_BACKOFF_DAYS: i64 = 7;

/// Auto-respond rules. Editable at runtime.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplyPolicy {
    pub enabled: bool,
    pub categories: BTreeSet<Category>,
    pub delay: Duration,
    pub max_replies_per_thread: u32,
    pub min_interval: Duration,
    pub spam_threshold: f32,
    pub max_send_attempts: u32,
    pub retry_base: Duration,
    /// How long finished tasks stay inspectable.
    pub retention: Duration,
}

impl ReplyPolicy {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            enabled: config.auto_respond_enabled,
            categories: config.auto_respond_categories.clone(),
            delay: config.reply_delay(),
            max_replies_per_thread: config.max_auto_replies_per_thread,
            min_interval: config.min_reply_interval(),
            spam_threshold: config.spam_threshold,
            max_send_attempts: config.max_send_attempts.max(1),
            retry_base: config.send_retry_base(),
            retention: config.task_retention(),
        }
    }

    /// Whether a classified message qualifies for an automatic reply at all.
    pub fn eligibility(&self, classification: &ClassificationResult) -> Result<(), String> {
        if !self.enabled {
            return Err("automatic replies are disabled".into());
        }
        if !self.categories.contains(&classification.dominant) {
            return Err(format!(
                "category {} is not auto-responded",
                classification.dominant
            ));
        }
        let spam = classification.spam_score();
        if spam >= self.spam_threshold {
            return Err(format!(
                "spam score {spam:.2} at or above threshold {:.2}",
                self.spam_threshold
            ));
        }
        Ok(())
    }

    /// Loop-avoidance check for an otherwise eligible message.
    pub fn loop_guard(
        &self,
        message: &Message,
        history: &ThreadReplyHistory,
        now: DateTime<Utc>,
    ) -> Option<TaskReason> {
        if message.is_auto_submitted() {
            return Some(TaskReason::AutoSubmitted);
        }
        if history.cap_reached(self.max_replies_per_thread) {
            return Some(TaskReason::ReplyCapReached {
                count: history.auto_reply_count,
                cap: self.max_replies_per_thread,
            });
        }
        if history.within_interval(now, self.min_interval)
            && let Some(last) = history.last_auto_reply_at
        {
            return Some(TaskReason::MinIntervalNotElapsed {
                last_reply_at: last,
                next_allowed_at: last + self.min_interval,
            });
        }
        None
    }

    /// Wait before retry number `attempts` (1-based): `base * 2^(attempts-1)`.
    pub fn backoff(&self, attempts: u32) -> Duration {
        let shift = attempts.saturating_sub(1).min(MAX_BACKOFF_SHIFT);
        let ceiling = Duration::days(MAX_BACKOFF_DAYS);
        self.retry_base
            .checked_mul(1i32 << shift)
            .map_or(ceiling, |wait| wait.min(ceiling))
    }
}

/// What happened to an inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundOutcome {
    /// A reply is pending; `superseded` is the task it replaced.
    Scheduled {
        task_id: Uuid,
        fire_at: DateTime<Utc>,
        superseded: Option<Uuid>,
    },
    /// Eligible, but withheld by loop avoidance. Recorded as a task.
    Suppressed { task_id: Uuid, reason: TaskReason },
    /// Arrived after a newer message on the thread was already answered or
    /// scheduled. Recorded as a cancelled task.
    Outdated {
        task_id: Uuid,
        newer_message_id: String,
    },
    /// Not a candidate for an automatic reply.
    NotEligible { reason: String },
    /// This message was already decided.
    Duplicate { task_id: Uuid },
}

/// What happened when a schedule entry came due.
#[derive(Debug, Clone, PartialEq)]
pub enum FireOutcome {
    Fired { task_id: Uuid },
    Retrying {
        task_id: Uuid,
        attempt: u32,
        next_at: DateTime<Utc>,
    },
    Suppressed { task_id: Uuid, reason: TaskReason },
    /// The entry no longer matches a pending task.
    Stale { task_id: Uuid },
}

#[derive(Debug, Default)]
struct ThreadRecord {
    tasks: Vec<ReplyTask>,
    pending: Option<Uuid>,
}

impl ThreadRecord {
    fn push(&mut self, task: ReplyTask) {
        self.tasks.push(task);
        if self.tasks.len() > MAX_TASKS_PER_THREAD
            && let Some(pos) = self.tasks.iter().position(|t| t.status.is_terminal())
        {
            self.tasks.remove(pos);
        }
    }

    /// Drop finished tasks last touched before `cutoff`. Returns how many went.
    fn forget_before(&mut self, cutoff: DateTime<Utc>) -> usize {
        let before = self.tasks.len();
        self.tasks
            .retain(|t| !t.status.is_terminal() || t.updated_at >= cutoff);
        before - self.tasks.len()
    }

    /// A pending or sent task answering a message received after `received_at`.
    fn newer_than(&self, received_at: DateTime<Utc>) -> Option<&ReplyTask> {
        self.tasks
            .iter()
            .filter(|t| matches!(t.status, ReplyStatus::Pending | ReplyStatus::Fired))
            .filter(|t| t.received_at > received_at)
            .max_by_key(|t| t.received_at)
    }
}

/// Decides, schedules and fires automatic replies.
pub struct AutoResponder {
    policy: RwLock<ReplyPolicy>,
    composer: ReplyComposer,
    history: Arc<dyn HistoryStore>,
    mailbox: Arc<dyn MailboxProvider>,
    schedule: Arc<ReplySchedule>,
    events: EventBus,
    threads: AsyncRwLock<HashMap<String, Arc<Mutex<ThreadRecord>>>>,
}

impl AutoResponder {
    pub fn new(
        policy: ReplyPolicy,
        composer: ReplyComposer,
        history: Arc<dyn HistoryStore>,
        mailbox: Arc<dyn MailboxProvider>,
        events: EventBus,
    ) -> Self {
        Self {
            policy: RwLock::new(policy),
            composer,
            history,
            mailbox,
            schedule: Arc::new(ReplySchedule::new()),
            events,
            threads: AsyncRwLock::new(HashMap::new()),
        }
    }

    pub fn schedule(&self) -> Arc<ReplySchedule> {
        Arc::clone(&self.schedule)
    }

    /// Snapshot of the current policy.
    pub fn policy(&self) -> ReplyPolicy {
        self.policy
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Edit the policy. Applies to decisions made after the call.
    pub fn update_policy(&self, edit: impl FnOnce(&mut ReplyPolicy)) {
        let mut policy = self.policy.write().unwrap_or_else(PoisonError::into_inner);
        edit(&mut policy);
        info!(
            enabled = policy.enabled,
            spam_threshold = policy.spam_threshold,
            categories = ?policy.categories,
            "Auto-respond policy updated"
        );
    }

    pub async fn history(&self, thread_id: &str) -> Result<ThreadReplyHistory, DatabaseError> {
        self.history.get_history(thread_id).await
    }

    // ── Inbound ─────────────────────────────────────────────────────

    /// Decide what to do about a classified inbound message.
    pub async fn on_inbound(
        &self,
        message: &Message,
        classification: &ClassificationResult,
        decision: Option<&Decision>,
        now: DateTime<Utc>,
    ) -> Result<InboundOutcome, PipelineError> {
        let policy = self.policy();
        let slot = self.thread(&message.thread_id).await;
        let mut record = slot.lock().await;

        if let Some(existing) = record.tasks.iter().find(|t| t.message_id == message.id) {
            return Ok(InboundOutcome::Duplicate {
                task_id: existing.id,
            });
        }

        if let Err(reason) = policy.eligibility(classification) {
            debug!(
                message_id = %message.id,
                thread_id = %message.thread_id,
                %reason,
                "Message not eligible for automatic reply"
            );
            return Ok(InboundOutcome::NotEligible { reason });
        }

        let category = classification.dominant;

        if let Some(newer) = record.newer_than(message.received_at) {
            let newer_message_id = newer.message_id.clone();
            let mut task = ReplyTask::new(
                &message.thread_id,
                &message.id,
                message.received_at,
                category,
                now,
                None,
                now,
            );
            let reason = TaskReason::Superseded {
                by_message_id: newer_message_id.clone(),
            };
            if let Err(e) = task.transition_to(ReplyStatus::Cancelled, Some(reason), now) {
                warn!(task_id = %task.id, error = %e, "Unexpected reply task state");
            }
            info!(
                task_id = %task.id,
                message_id = %message.id,
                thread_id = %message.thread_id,
                newer = %newer_message_id,
                "Out-of-order message not answered"
            );
            let task_id = task.id;
            self.events.publish(PipelineEvent::ReplyTaskUpdated { task: task.clone() });
            record.push(task);
            return Ok(InboundOutcome::Outdated {
                task_id,
                newer_message_id,
            });
        }

        let history = self.history.get_history(&message.thread_id).await?;

        if let Some(reason) = policy.loop_guard(message, &history, now) {
            let mut task = ReplyTask::new(
                &message.thread_id,
                &message.id,
                message.received_at,
                category,
                now,
                None,
                now,
            );
            if let Err(e) = task.transition_to(ReplyStatus::Suppressed, Some(reason.clone()), now) {
                warn!(task_id = %task.id, error = %e, "Unexpected reply task state");
            }
            info!(
                task_id = %task.id,
                message_id = %message.id,
                thread_id = %message.thread_id,
                %reason,
                "Automatic reply suppressed"
            );
            let task_id = task.id;
            self.events.publish(PipelineEvent::ReplyTaskUpdated { task: task.clone() });
            record.push(task);
            return Ok(InboundOutcome::Suppressed { task_id, reason });
        }

        let reply = self.composer.compose(message, category, decision);
        let fire_at = now + policy.delay;
        let task = ReplyTask::new(
            &message.thread_id,
            &message.id,
            message.received_at,
            category,
            fire_at,
            Some(reply),
            now,
        );

        let ThreadRecord { tasks, pending } = &mut *record;
        let mut superseded = None;
        if let Some(previous_id) = pending.take()
            && let Some(previous) = tasks.iter_mut().find(|t| t.id == previous_id)
            && previous.is_pending()
        {
            let reason = TaskReason::Superseded {
                by_message_id: message.id.clone(),
            };
            if previous
                .transition_to(ReplyStatus::Cancelled, Some(reason), now)
                .is_ok()
            {
                info!(
                    task_id = %previous_id,
                    thread_id = %message.thread_id,
                    by = %message.id,
                    "Pending reply superseded"
                );
                self.events.publish(PipelineEvent::ReplyTaskUpdated {
                    task: previous.clone(),
                });
                superseded = Some(previous_id);
            }
        }

        let task_id = task.id;
        *pending = Some(task_id);
        self.schedule.push(fire_at, task_id, &message.thread_id);
        info!(
            task_id = %task_id,
            message_id = %message.id,
            thread_id = %message.thread_id,
            category = %category,
            fire_at = %fire_at,
            "Automatic reply scheduled"
        );
        self.events.publish(PipelineEvent::ReplyTaskUpdated { task: task.clone() });
        record.push(task);

        Ok(InboundOutcome::Scheduled {
            task_id,
            fire_at,
            superseded,
        })
    }

    /// The user replied by hand. Cancels the pending task, if any, and notes
    /// the reply in the thread history.
    pub async fn on_manual_reply(
        &self,
        thread_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<Uuid>, PipelineError> {
        let slot = self.thread(thread_id).await;
        let mut record = slot.lock().await;

        let ThreadRecord { tasks, pending } = &mut *record;
        let mut cancelled = None;
        if let Some(pending_id) = pending.take()
            && let Some(task) = tasks.iter_mut().find(|t| t.id == pending_id)
            && task
                .transition_to(
                    ReplyStatus::Cancelled,
                    Some(TaskReason::HumanReplied { at }),
                    at,
                )
                .is_ok()
        {
            info!(task_id = %pending_id, thread_id, "Pending reply cancelled by manual reply");
            self.events.publish(PipelineEvent::ReplyTaskUpdated { task: task.clone() });
            cancelled = Some(pending_id);
        }

        self.history.record_human_reply(thread_id, at).await?;
        Ok(cancelled)
    }

    // ── Firing ──────────────────────────────────────────────────────

    /// Fire every schedule entry due at `now`. Entries on different threads
    /// run concurrently.
    pub async fn fire_due(&self, now: DateTime<Utc>) -> Vec<FireOutcome> {
        let due = self.schedule.pop_due(now);
        if due.is_empty() {
            return Vec::new();
        }
        join_all(due.into_iter().map(|entry| self.fire(entry, now))).await
    }

    async fn fire(&self, entry: ScheduledFire, now: DateTime<Utc>) -> FireOutcome {
        let policy = self.policy();
        let slot = self.thread(&entry.thread_id).await;
        let mut record = slot.lock().await;
        let ThreadRecord { tasks, pending } = &mut *record;

        let stale = FireOutcome::Stale {
            task_id: entry.task_id,
        };
        if *pending != Some(entry.task_id) {
            return stale;
        }
        let Some(task) = tasks.iter_mut().find(|t| t.id == entry.task_id) else {
            return stale;
        };
        if !task.is_pending() || task.fire_at != entry.fire_at {
            return stale;
        }
        let Some(reply) = task.reply.clone() else {
            return stale;
        };

        // The cap may have been reached since scheduling.
        match self.history.get_history(&entry.thread_id).await {
            Ok(history) if history.cap_reached(policy.max_replies_per_thread) => {
                let reason = TaskReason::ReplyCapReached {
                    count: history.auto_reply_count,
                    cap: policy.max_replies_per_thread,
                };
                return self.suppress(task, pending, reason, now);
            }
            Ok(_) => {}
            Err(e) => {
                task.attempts += 1;
                return self.retry_or_give_up(task, pending, &policy, e.to_string(), now);
            }
        }

        task.attempts += 1;
        match self.mailbox.send_reply(&reply).await {
            Ok(()) => {
                if let Err(e) = task.transition_to(ReplyStatus::Fired, None, now) {
                    warn!(task_id = %task.id, error = %e, "Unexpected reply task state");
                }
                *pending = None;
                info!(
                    task_id = %task.id,
                    thread_id = %task.thread_id,
                    to = %reply.to,
                    attempts = task.attempts,
                    "Automatic reply sent"
                );
                self.events.publish(PipelineEvent::ReplyTaskUpdated { task: task.clone() });

                if let Err(e) = self.history.record_auto_reply(&task.thread_id, now).await {
                    error!(
                        task_id = %task.id,
                        thread_id = %task.thread_id,
                        error = %e,
                        "Failed to record automatic reply in history"
                    );
                    self.events.publish(PipelineEvent::ProcessingFailed {
                        message_id: task.message_id.clone(),
                        error: format!("reply sent but history not updated: {e}"),
                        at: now,
                    });
                }
                FireOutcome::Fired { task_id: task.id }
            }
            Err(e) => {
                warn!(
                    task_id = %task.id,
                    thread_id = %task.thread_id,
                    provider = self.mailbox.name(),
                    attempt = task.attempts,
                    error = %e,
                    "Automatic reply send failed"
                );
                self.retry_or_give_up(task, pending, &policy, e.to_string(), now)
            }
        }
    }

    fn retry_or_give_up(
        &self,
        task: &mut ReplyTask,
        pending: &mut Option<Uuid>,
        policy: &ReplyPolicy,
        error: String,
        now: DateTime<Utc>,
    ) -> FireOutcome {
        if task.attempts >= policy.max_send_attempts {
            let reason = TaskReason::SendFailed {
                attempts: task.attempts,
                error,
            };
            return self.suppress(task, pending, reason, now);
        }

        let next_at = now + policy.backoff(task.attempts);
        task.reschedule(next_at, now);
        self.schedule.push(next_at, task.id, &task.thread_id);
        debug!(task_id = %task.id, next_at = %next_at, "Reply send retry scheduled");
        self.events.publish(PipelineEvent::ReplyTaskUpdated { task: task.clone() });
        FireOutcome::Retrying {
            task_id: task.id,
            attempt: task.attempts,
            next_at,
        }
    }

    fn suppress(
        &self,
        task: &mut ReplyTask,
        pending: &mut Option<Uuid>,
        reason: TaskReason,
        now: DateTime<Utc>,
    ) -> FireOutcome {
        if let Err(e) = task.transition_to(ReplyStatus::Suppressed, Some(reason.clone()), now) {
            warn!(task_id = %task.id, error = %e, "Unexpected reply task state");
        }
        *pending = None;
        warn!(
            task_id = %task.id,
            thread_id = %task.thread_id,
            %reason,
            "Automatic reply suppressed at fire time"
        );
        self.events.publish(PipelineEvent::ReplyTaskUpdated { task: task.clone() });
        FireOutcome::Suppressed {
            task_id: task.id,
            reason,
        }
    }

    // ── Retention ───────────────────────────────────────────────────

    /// Forget finished tasks older than the retention window. A thread whose
    /// record ends up empty is removed; threads with a pending task are kept.
    /// Records another operation holds are skipped until the next sweep.
    /// Returns the number of threads removed.
    pub async fn prune(&self, now: DateTime<Utc>) -> usize {
        let retention = self.policy().retention;
        let Some(cutoff) = now.checked_sub_signed(retention) else {
            return 0;
        };

        let mut threads = self.threads.write().await;
        let before = threads.len();
        let mut forgotten = 0;
        threads.retain(|_, slot| {
            // With the map write-locked, any other handle means the record is in use.
            if Arc::strong_count(slot) > 1 {
                return true;
            }
            let Ok(mut record) = slot.try_lock() else {
                return true;
            };
            forgotten += record.forget_before(cutoff);
            record.pending.is_some() || !record.tasks.is_empty()
        });
        let removed = before - threads.len();
        drop(threads);

        if removed > 0 || forgotten > 0 {
            info!(removed, forgotten, %cutoff, "Old reply tasks pruned");
        }
        removed
    }

    // ── Inspection ──────────────────────────────────────────────────

    /// Tasks recorded for a thread, oldest first.
    pub async fn tasks_for_thread(&self, thread_id: &str) -> Vec<ReplyTask> {
        let slot = self.threads.read().await.get(thread_id).cloned();
        match slot {
            Some(slot) => slot.lock().await.tasks.clone(),
            None => Vec::new(),
        }
    }

    /// The pending task of a thread, if any.
    pub async fn pending_task(&self, thread_id: &str) -> Option<ReplyTask> {
        self.tasks_for_thread(thread_id)
            .await
            .into_iter()
            .find(ReplyTask::is_pending)
    }

    pub async fn task(&self, task_id: Uuid) -> Option<ReplyTask> {
        for slot in self.slots().await {
            if let Some(task) = slot.lock().await.tasks.iter().find(|t| t.id == task_id) {
                return Some(task.clone());
            }
        }
        None
    }

    /// Every recorded task in the given state.
    pub async fn tasks_with_status(&self, status: ReplyStatus) -> Vec<ReplyTask> {
        let mut found = Vec::new();
        for slot in self.slots().await {
            let record = slot.lock().await;
            found.extend(record.tasks.iter().filter(|t| t.status == status).cloned());
        }
        found.sort_by_key(|t| t.updated_at);
        found
    }

    async fn slots(&self) -> Vec<Arc<Mutex<ThreadRecord>>> {
        self.threads.read().await.values().cloned().collect()
    }

    async fn thread(&self, thread_id: &str) -> Arc<Mutex<ThreadRecord>> {
        if let Some(slot) = self.threads.read().await.get(thread_id) {
            return Arc::clone(slot);
        }
        let mut threads = self.threads.write().await;
        Arc::clone(threads.entry(thread_id.to_string()).or_default())
    }
}
