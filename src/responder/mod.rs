//! Automatic replies: per-thread decisions, delayed firing, loop avoidance.

pub mod history;
pub mod orchestrator;
pub mod scheduler;
pub mod state;
pub mod templates;

pub use history::ThreadReplyHistory;
pub use orchestrator::{AutoResponder, FireOutcome, InboundOutcome, ReplyPolicy};
pub use scheduler::{ReplySchedule, spawn_reply_scheduler};
pub use state::{ReplyStatus, ReplyTask, TaskReason};
pub use templates::ReplyComposer;
