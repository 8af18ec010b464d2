//! Pipeline notifications and presentation commands.
//!
//! The pipeline publishes read-only events on a broadcast channel; any number
//! of presentation layers subscribe. Commands flow the other way through
//! `MessageProcessor::apply_command`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::calendar::resolver::Decision;
use crate::pipeline::meeting::MeetingProposal;
use crate::pipeline::types::{Category, ClassificationResult};
use crate::responder::state::ReplyTask;

/// Default broadcast channel capacity.
const DEFAULT_BROADCAST_CAPACITY: usize = 256;

/// Notifications emitted by the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    /// A message was classified.
    Classified { result: ClassificationResult },
    /// A meeting proposal was resolved against the calendar.
    MeetingResolved {
        proposal: MeetingProposal,
        decision: Decision,
    },
    /// A reply task was created or changed state.
    ReplyTaskUpdated { task: ReplyTask },
    /// Processing a message failed; nothing was done for it.
    ProcessingFailed {
        message_id: String,
        error: String,
        at: DateTime<Utc>,
    },
}

/// Commands accepted from a presentation layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Command {
    /// The user answered a thread by hand.
    ManualReplySent {
        thread_id: String,
        #[serde(default = "Utc::now")]
        at: DateTime<Utc>,
    },
    /// Add or remove a category from the auto-respond set.
    SetAutoRespondCategory { category: Category, enabled: bool },
    /// Master switch for automatic replies.
    SetAutoRespondEnabled { enabled: bool },
    SetSpamThreshold { value: f32 },
    SetMeetingThreshold { value: f32 },
    /// Promote a held calendar slot to confirmed.
    ConfirmEvent { event_id: Uuid },
    CancelEvent { event_id: Uuid },
}

/// Fan-out of pipeline events.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PipelineEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(DEFAULT_BROADCAST_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: PipelineEvent) {
        // Ok if nobody is listening
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(PipelineEvent::ProcessingFailed {
            message_id: "m1".into(),
            error: "model offline".into(),
            at: Utc::now(),
        });
        match rx.recv().await.unwrap() {
            PipelineEvent::ProcessingFailed { message_id, .. } => assert_eq!(message_id, "m1"),
            other => panic!("Expected ProcessingFailed, got {other:?}"),
        }
    }

    #[test]
    fn publish_without_subscribers_is_fine() {
        EventBus::new().publish(PipelineEvent::ProcessingFailed {
            message_id: "m1".into(),
            error: "x".into(),
            at: Utc::now(),
        });
    }

    #[test]
    fn command_parses_from_json() {
        let cmd: Command = serde_json::from_str(
            r#"{"action":"set_auto_respond_category","category":"invoice","enabled":true}"#,
        )
        .unwrap();
        assert!(matches!(
            cmd,
            Command::SetAutoRespondCategory {
                category: Category::Invoice,
                enabled: true
            }
        ));

        let cmd: Command =
            serde_json::from_str(r#"{"action":"manual_reply_sent","thread_id":"t1"}"#).unwrap();
        assert!(matches!(cmd, Command::ManualReplySent { .. }));
    }
}
