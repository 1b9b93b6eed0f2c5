//! # Event Envelope
//!
//! Envelope specification for all events crossing the identity/portfolio
//! boundary.
//!
//! ## Envelope Fields
//!
//! - `event_id`: Unique identifier per emission, used by consumers to
//!   deduplicate redeliveries
//! - `occurred_at`: timestamp when the event was generated
//! - `source_module`: module that produced the event
//! - `source_version`: semantic version of the source module
//! - `trace_id` / `span_id`: distributed tracing context, propagated but
//!   never interpreted
//! - `payload`: event-specific data (generic type parameter)
//!
//! `event_id` is generated exactly once, when the envelope is constructed.
//! Retries and redeliveries carry the same id, which is what makes
//! consumer-side deduplication possible.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Standard event envelope wrapping every cross-module event.
///
/// # Examples
///
/// ```rust
/// use event_bus::EventEnvelope;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Serialize, Deserialize)]
/// struct UserRegistered {
///     username: String,
///     email: String,
/// }
///
/// let envelope = EventEnvelope::new(
///     "identity".to_string(),
///     UserRegistered {
///         username: "alice".to_string(),
///         email: "alice@example.com".to_string(),
///     },
/// )
/// .with_trace_id(Some("trace-456".to_string()));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope<T> {
    /// Unique event identifier (idempotency key)
    pub event_id: Uuid,

    /// Timestamp when the event was generated
    pub occurred_at: DateTime<Utc>,

    /// Module that generated the event (e.g. "identity", "portfolio")
    pub source_module: String,

    /// Semantic version of the source module
    pub source_version: String,

    /// Distributed trace the event belongs to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,

    /// Span within the trace that emitted the event
    #[serde(skip_serializing_if = "Option::is_none")]
    pub span_id: Option<String>,

    /// Event-specific payload
    pub payload: T,
}

impl<T> EventEnvelope<T> {
    /// Create a new envelope with a freshly generated event_id.
    ///
    /// The source_version defaults to "1.0.0"; module crates override it
    /// with their own CARGO_PKG_VERSION.
    pub fn new(source_module: String, payload: T) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            occurred_at: Utc::now(),
            source_module,
            source_version: "1.0.0".to_string(),
            trace_id: None,
            span_id: None,
            payload,
        }
    }

    /// Create an envelope with an explicit event_id (useful for testing)
    pub fn with_event_id(event_id: Uuid, source_module: String, payload: T) -> Self {
        Self {
            event_id,
            occurred_at: Utc::now(),
            source_module,
            source_version: "1.0.0".to_string(),
            trace_id: None,
            span_id: None,
            payload,
        }
    }

    pub fn with_source_version(mut self, version: String) -> Self {
        self.source_version = version;
        self
    }

    pub fn with_trace_id(mut self, trace_id: Option<String>) -> Self {
        self.trace_id = trace_id;
        self
    }

    pub fn with_span_id(mut self, span_id: Option<String>) -> Self {
        self.span_id = span_id;
        self
    }
}
