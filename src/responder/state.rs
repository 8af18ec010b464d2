//! Reply task state machine.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::pipeline::types::{Category, OutboundReply};

/// Transition log entries kept per task.
const MAX_TRANSITIONS: usize = 20;

/// State of an automatic reply task.
///
/// A thread with no pending task is idle. Every task starts `Pending` and
/// ends in exactly one of the terminal states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyStatus {
    /// Waiting for its fire time.
    Pending,
    /// Reply handed to the mailbox provider.
    Fired,
    /// Withdrawn before firing (superseded or answered by hand).
    Cancelled,
    /// Withheld by loop avoidance or after repeated send failures.
    Suppressed,
}

impl ReplyStatus {
    pub fn can_transition_to(&self, target: ReplyStatus) -> bool {
        use ReplyStatus::*;

        matches!(
            (self, target),
            (Pending, Fired) | (Pending, Cancelled) | (Pending, Suppressed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for ReplyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Fired => "fired",
            Self::Cancelled => "cancelled",
            Self::Suppressed => "suppressed",
        };
        write!(f, "{}", s)
    }
}

/// Why a task left `Pending` without a normal send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskReason {
    /// The inbound message was itself machine-generated.
    AutoSubmitted,
    /// The thread already received the maximum number of automatic replies.
    ReplyCapReached { count: u32, cap: u32 },
    /// The previous automatic reply is too recent.
    MinIntervalNotElapsed {
        last_reply_at: DateTime<Utc>,
        next_allowed_at: DateTime<Utc>,
    },
    /// A newer eligible message on the thread replaced this task.
    Superseded { by_message_id: String },
    /// The user answered the thread by hand.
    HumanReplied { at: DateTime<Utc> },
    /// Every send attempt failed.
    SendFailed { attempts: u32, error: String },
}

impl fmt::Display for TaskReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AutoSubmitted => write!(f, "inbound message is auto-submitted"),
            Self::ReplyCapReached { count, cap } => {
                write!(f, "reply cap reached ({count}/{cap})")
            }
            Self::MinIntervalNotElapsed {
                next_allowed_at, ..
            } => write!(f, "next automatic reply allowed at {next_allowed_at}"),
            Self::Superseded { by_message_id } => {
                write!(f, "superseded by message {by_message_id}")
            }
            Self::HumanReplied { at } => write!(f, "user replied at {at}"),
            Self::SendFailed { attempts, error } => {
                write!(f, "send failed after {attempts} attempt(s): {error}")
            }
        }
    }
}

/// A status change of a reply task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: ReplyStatus,
    pub to: ReplyStatus,
    pub timestamp: DateTime<Utc>,
    pub reason: Option<String>,
}

/// One automatic reply decision for one inbound message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyTask {
    pub id: Uuid,
    pub thread_id: String,
    /// Inbound message this task answers.
    pub message_id: String,
    /// When that message was received.
    pub received_at: DateTime<Utc>,
    pub category: Category,
    pub status: ReplyStatus,
    pub fire_at: DateTime<Utc>,
    /// Send attempts made so far.
    pub attempts: u32,
    /// Composed reply. `None` for tasks suppressed on arrival.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply: Option<OutboundReply>,
    /// Set once the task leaves `Pending` other than by firing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<TaskReason>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub transitions: Vec<StateTransition>,
}

impl ReplyTask {
    pub fn new(
        thread_id: impl Into<String>,
        message_id: impl Into<String>,
        received_at: DateTime<Utc>,
        category: Category,
        fire_at: DateTime<Utc>,
        reply: Option<OutboundReply>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            thread_id: thread_id.into(),
            message_id: message_id.into(),
            received_at,
            category,
            status: ReplyStatus::Pending,
            fire_at,
            attempts: 0,
            reply,
            reason: None,
            created_at: now,
            updated_at: now,
            transitions: Vec::new(),
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == ReplyStatus::Pending
    }

    /// Move to `new_status`, recording why.
    pub fn transition_to(
        &mut self,
        new_status: ReplyStatus,
        reason: Option<TaskReason>,
        at: DateTime<Utc>,
    ) -> Result<(), String> {
        if !self.status.can_transition_to(new_status) {
            return Err(format!(
                "Cannot transition from {} to {}",
                self.status, new_status
            ));
        }

        self.transitions.push(StateTransition {
            from: self.status,
            to: new_status,
            timestamp: at,
            reason: reason.as_ref().map(ToString::to_string),
        });
        if self.transitions.len() > MAX_TRANSITIONS {
            let excess = self.transitions.len() - MAX_TRANSITIONS;
            self.transitions.drain(..excess);
        }

        self.status = new_status;
        self.reason = reason;
        self.updated_at = at;
        Ok(())
    }

    /// Push the fire time back after a failed attempt.
    pub fn reschedule(&mut self, fire_at: DateTime<Utc>, at: DateTime<Utc>) {
        self.fire_at = fire_at;
        self.updated_at = at;
    }
}
