//! Message processor: runs one message end to end.
//!
//! Flow:
//! 1. Messages from the user's own address are manual replies → cancel the
//!    thread's pending automatic reply
//! 2. Classifier → per-category confidences, spam, sentiment
//! 3. Meeting extraction → calendar decision
//! 4. Auto-response orchestrator → schedule, suppress or ignore
//!
//! A failure stops work on that message only; it is recorded against the
//! message id and published.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::calendar::resolver::{ConflictResolver, Decision, ResolverSettings};
use crate::calendar::service::Calendar;
use crate::config::{PipelineConfig, check_spam_threshold, check_unit};
use crate::error::{ConfigError, PipelineError};
use crate::events::{Command, EventBus, PipelineEvent};
use crate::pipeline::classifier::Classifier;
use crate::pipeline::meeting::{MeetingExtractor, MeetingProposal};
use crate::pipeline::models::ModelSet;
use crate::pipeline::types::{Category, ClassificationResult, MailboxProvider, Message};
use crate::responder::orchestrator::{AutoResponder, InboundOutcome, ReplyPolicy};
use crate::responder::templates::ReplyComposer;
use crate::store::traits::{CalendarStore, HistoryStore};

/// Result of processing one message.
#[derive(Debug, Clone)]
pub struct ProcessedMessage {
    pub message_id: String,
    pub thread_id: String,
    /// `None` for the user's own messages, which are not classified.
    pub classification: Option<ClassificationResult>,
    pub proposal: Option<MeetingProposal>,
    pub decision: Option<Decision>,
    pub reply: Option<InboundOutcome>,
    /// The message was the user's manual reply.
    pub manual_reply: bool,
    /// Task cancelled by a manual reply.
    pub cancelled_task: Option<Uuid>,
    pub processed_at: DateTime<Utc>,
}

/// A message the pipeline could not handle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingFailure {
    pub message_id: String,
    pub error: String,
    pub at: DateTime<Utc>,
}

/// Message processor: the core of the pipeline.
pub struct MessageProcessor {
    classifier: Classifier,
    meetings: RwLock<MeetingExtractor>,
    calendar: Arc<Calendar>,
    responder: Arc<AutoResponder>,
    events: EventBus,
    user_address: Option<String>,
    failures: RwLock<HashMap<String, ProcessingFailure>>,
}

impl MessageProcessor {
    pub fn new(
        classifier: Classifier,
        meetings: MeetingExtractor,
        calendar: Arc<Calendar>,
        responder: Arc<AutoResponder>,
        events: EventBus,
        user_address: Option<String>,
    ) -> Self {
        Self {
            classifier,
            meetings: RwLock::new(meetings),
            calendar,
            responder,
            events,
            user_address,
            failures: RwLock::new(HashMap::new()),
        }
    }

    /// Wire the lexical models, calendar and responder from configuration.
    pub fn from_config(
        config: &PipelineConfig,
        calendar_store: Arc<dyn CalendarStore>,
        history_store: Arc<dyn HistoryStore>,
        mailbox: Arc<dyn MailboxProvider>,
        events: EventBus,
    ) -> Self {
        let models = ModelSet::lexical(config.timezone, config.default_meeting_length());
        let classifier = Classifier::new(models, config.truncate_chars);
        let calendar = Arc::new(Calendar::new(
            calendar_store,
            ConflictResolver::new(ResolverSettings::from_config(config)),
        ));
        let responder = Arc::new(AutoResponder::new(
            ReplyPolicy::from_config(config),
            ReplyComposer::from_config(config),
            history_store,
            mailbox,
            events.clone(),
        ));
        Self::new(
            classifier,
            MeetingExtractor::new(config.meeting_confidence_threshold),
            calendar,
            responder,
            events,
            config.user_address.clone(),
        )
    }

    pub fn classifier(&self) -> &Classifier {
        &self.classifier
    }

    pub fn calendar(&self) -> Arc<Calendar> {
        Arc::clone(&self.calendar)
    }

    pub fn responder(&self) -> Arc<AutoResponder> {
        Arc::clone(&self.responder)
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Process a single message through the full pipeline.
    pub async fn process(
        &self,
        message: &Message,
        now: DateTime<Utc>,
    ) -> Result<ProcessedMessage, PipelineError> {
        info!(
            message_id = %message.id,
            thread_id = %message.thread_id,
            sender = %message.sender,
            "Processing inbound message"
        );

        let result = if self.is_own(message) {
            self.handle_manual_reply(message, now).await
        } else {
            self.decide(message, now).await
        };

        match &result {
            Ok(_) => {
                self.failures
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&message.id);
            }
            Err(e) => self.record_failure(&message.id, e, now),
        }
        result
    }

    /// Process a batch of messages.
    ///
    /// Processes each message independently. Failures on individual messages
    /// are recorded but don't fail the entire batch.
    pub async fn process_batch(
        &self,
        messages: &[Message],
        now: DateTime<Utc>,
    ) -> Vec<ProcessedMessage> {
        let count = messages.len();
        info!(count, "Processing message batch");

        let mut results = Vec::with_capacity(count);
        for message in messages {
            if let Ok(processed) = self.process(message, now).await {
                results.push(processed);
            }
        }

        info!(
            processed = results.len(),
            total = count,
            "Batch processing complete"
        );
        results
    }

    /// Apply a presentation command.
    pub async fn apply_command(&self, command: Command) -> Result<(), PipelineError> {
        debug!(?command, "Applying command");
        match command {
            Command::ManualReplySent { thread_id, at } => {
                self.responder.on_manual_reply(&thread_id, at).await?;
            }
            Command::SetAutoRespondCategory { category, enabled } => {
                self.responder.update_policy(|p| {
                    if enabled {
                        p.categories.insert(category);
                    } else {
                        p.categories.remove(&category);
                    }
                });
            }
            Command::SetAutoRespondEnabled { enabled } => {
                self.responder.update_policy(|p| p.enabled = enabled);
            }
            Command::SetSpamThreshold { value } => {
                check_spam_threshold(value).map_err(invalid_command)?;
                self.responder.update_policy(|p| p.spam_threshold = value);
            }
            Command::SetMeetingThreshold { value } => {
                check_unit("meeting_confidence_threshold", value).map_err(invalid_command)?;
                *self.meetings.write().unwrap_or_else(PoisonError::into_inner) =
                    MeetingExtractor::new(value);
                info!(threshold = value, "Meeting confidence threshold updated");
            }
            Command::ConfirmEvent { event_id } => {
                self.calendar.confirm(event_id).await?;
            }
            Command::CancelEvent { event_id } => {
                self.calendar.cancel(event_id).await?;
            }
        }
        Ok(())
    }

    /// Failure recorded for a message, if its last attempt failed.
    pub fn failure(&self, message_id: &str) -> Option<ProcessingFailure> {
        self.failures
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(message_id)
            .cloned()
    }

    /// All recorded failures, oldest first.
    pub fn failures(&self) -> Vec<ProcessingFailure> {
        let mut all: Vec<ProcessingFailure> = self
            .failures
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        all.sort_by_key(|f| f.at);
        all
    }

    fn is_own(&self, message: &Message) -> bool {
        self.user_address
            .as_deref()
            .is_some_and(|me| me.trim().eq_ignore_ascii_case(message.sender.trim()))
    }

    async fn handle_manual_reply(
        &self,
        message: &Message,
        now: DateTime<Utc>,
    ) -> Result<ProcessedMessage, PipelineError> {
        let cancelled = self
            .responder
            .on_manual_reply(&message.thread_id, message.received_at)
            .await?;
        debug!(
            message_id = %message.id,
            thread_id = %message.thread_id,
            cancelled = ?cancelled,
            "Own message treated as manual reply"
        );
        Ok(ProcessedMessage {
            message_id: message.id.clone(),
            thread_id: message.thread_id.clone(),
            classification: None,
            proposal: None,
            decision: None,
            reply: None,
            manual_reply: true,
            cancelled_task: cancelled,
            processed_at: now,
        })
    }

    async fn decide(
        &self,
        message: &Message,
        now: DateTime<Utc>,
    ) -> Result<ProcessedMessage, PipelineError> {
        let classification = self.classifier.classify(message)?;
        self.events.publish(PipelineEvent::Classified {
            result: classification.clone(),
        });

        let meetings = *self.meetings.read().unwrap_or_else(PoisonError::into_inner);
        let proposal = if classification.confidence(Category::MeetingRequest) > meetings.threshold() {
            let entities = self.classifier.extract_entities(message)?;
            meetings.extract_meeting(message, &classification, &entities)
        } else {
            None
        };

        let decision = match &proposal {
            Some(proposal) => {
                let decision = self.calendar.evaluate(proposal).await?;
                info!(
                    message_id = %message.id,
                    decision = decision.kind(),
                    candidates = proposal.candidates.len(),
                    "Meeting proposal resolved"
                );
                self.events.publish(PipelineEvent::MeetingResolved {
                    proposal: proposal.clone(),
                    decision: decision.clone(),
                });
                Some(decision)
            }
            None => None,
        };

        let reply = self
            .responder
            .on_inbound(message, &classification, decision.as_ref(), now)
            .await?;

        Ok(ProcessedMessage {
            message_id: message.id.clone(),
            thread_id: message.thread_id.clone(),
            classification: Some(classification),
            proposal,
            decision,
            reply: Some(reply),
            manual_reply: false,
            cancelled_task: None,
            processed_at: now,
        })
    }

    fn record_failure(&self, message_id: &str, err: &PipelineError, at: DateTime<Utc>) {
        error!(message_id, error = %err, "Failed to process message");
        let failure = ProcessingFailure {
            message_id: message_id.to_string(),
            error: err.to_string(),
            at,
        };
        self.failures
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(message_id.to_string(), failure.clone());
        self.events.publish(PipelineEvent::ProcessingFailed {
            message_id: failure.message_id,
            error: failure.error,
            at,
        });
    }
}

fn invalid_command(e: ConfigError) -> PipelineError {
    PipelineError::InvalidCommand(e.to_string())
}
