//! Mail Autopilot: classification, meeting scheduling and loop-safe
//! automatic replies for a mailbox.

pub mod calendar;
pub mod channels;
pub mod config;
pub mod error;
pub mod events;
pub mod pipeline;
pub mod responder;
pub mod store;
