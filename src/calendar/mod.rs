//! Calendar model, conflict resolution and the calendar service.

pub mod model;
pub mod resolver;
pub mod service;

pub use model::{CalendarEvent, EventSource, TimeWindow};
pub use resolver::{ConflictResolver, Decision, ResolverSettings};
pub use service::Calendar;
