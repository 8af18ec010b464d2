//! Persistence: reply history and calendar stores.

pub mod libsql_backend;
pub mod memory;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use memory::{MemoryCalendarStore, MemoryHistoryStore};
pub use traits::{CalendarStore, HistoryStore};
