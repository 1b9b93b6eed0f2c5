pub mod consumer;
pub mod dlq;

pub use consumer::{is_event_processed, mark_event_processed};
