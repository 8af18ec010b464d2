//! Mailbox adapters and the console presentation surface.

pub mod console;
pub mod spool;

pub use spool::{SpoolConfig, SpoolMailbox};
