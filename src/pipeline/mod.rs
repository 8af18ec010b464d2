//! Message decision pipeline.
//!
//! Every fetched message flows through:
//! 1. `Classifier::classify()`: category confidences, spam, sentiment
//! 2. `MeetingExtractor::extract_meeting()`: dated meeting proposals
//! 3. `Calendar::evaluate()`: confirm, conflict or ambiguous
//! 4. `AutoResponder::on_inbound()`: delayed, loop-safe automatic replies
//!
//! Capability models sit behind traits in [`models`]; the lexical
//! implementations need no network access.

pub mod categories;
pub mod classifier;
pub mod entities;
pub mod ingest;
pub mod meeting;
pub mod models;
pub mod processor;
pub mod sentiment;
pub mod spam;
pub mod types;

pub use classifier::Classifier;
pub use ingest::{IngestSettings, spawn_ingest};
pub use meeting::{MeetingExtractor, MeetingProposal};
pub use processor::{MessageProcessor, ProcessedMessage, ProcessingFailure};
pub use types::{Category, ClassificationResult, MailboxProvider, Message, OutboundReply};
