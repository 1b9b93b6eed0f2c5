//! # EventBus Abstraction
//!
//! A shared abstraction for event-driven messaging between the identity and
//! portfolio modules.
//!
//! ## Implementations
//!
//! - **NatsBus**: Production implementation using NATS JetStream
//! - **InMemoryBus**: Test/dev implementation using in-memory channels
//!
//! ## Usage
//!
//! ```rust,no_run
//! use event_bus::{EventBus, NatsBus, InMemoryBus};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // Production: NATS
//! let nats_client = async_nats::connect("nats://localhost:4222").await?;
//! let bus: Arc<dyn EventBus> = Arc::new(NatsBus::new(nats_client));
//!
//! // Dev/Test: In-Memory
//! let bus: Arc<dyn EventBus> = Arc::new(InMemoryBus::new());
//!
//! // Publish an event
//! let payload = serde_json::to_vec(&serde_json::json!({
//!     "event_id": "...",
//!     "payload": { "username": "alice" }
//! }))?;
//! bus.publish("identity.events.user.registered", payload).await?;
//!
//! // Subscribe to events
//! let mut stream = bus.subscribe("identity.events.>").await?;
//! while let Some(msg) = futures::StreamExt::next(&mut stream).await {
//!     println!("Received: {} bytes on {}", msg.payload.len(), msg.subject);
//! }
//! # Ok(())
//! # }
//! ```

pub mod consumer_retry;
mod envelope;
mod inmemory_bus;
mod nats_bus;
pub mod topology;

pub use envelope::EventEnvelope;
pub use inmemory_bus::InMemoryBus;
pub use nats_bus::NatsBus;
pub use topology::FlowTopology;

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::fmt;

/// Transport header carrying the originating trace id.
pub const HEADER_TRACE_ID: &str = "trace-id";
/// Transport header carrying the originating span id.
pub const HEADER_SPAN_ID: &str = "span-id";
/// Transport header that forces downstream tracing to retain (not sample
/// away) the propagated trace.
pub const HEADER_SAMPLED: &str = "sampled";

/// A message received from the event bus
#[derive(Debug, Clone)]
pub struct BusMessage {
    /// The subject this message was published to
    pub subject: String,
    /// The message payload (raw bytes)
    pub payload: Vec<u8>,
    /// Transport headers (trace context and the like)
    pub headers: Option<HashMap<String, String>>,
}

impl BusMessage {
    pub fn new(subject: String, payload: Vec<u8>) -> Self {
        Self {
            subject,
            payload,
            headers: None,
        }
    }

    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = Some(headers);
        self
    }

    /// Look up a single transport header.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .as_ref()
            .and_then(|h| h.get(name))
            .map(String::as_str)
    }
}

/// Errors that can occur when using the event bus
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("failed to publish message: {0}")]
    PublishError(String),

    #[error("failed to subscribe to subject: {0}")]
    SubscribeError(String),

    #[error("connection error: {0}")]
    ConnectionError(String),

    #[error("topology declaration failed: {0}")]
    TopologyError(String),
}

/// Result type for event bus operations
pub type BusResult<T> = Result<T, BusError>;

/// Core event bus abstraction for publish-subscribe messaging
///
/// The broker delivers at-least-once to bound subscribers; consumers must be
/// redelivery-safe.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish a message to a subject
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> BusResult<()>;

    /// Publish a message with transport headers attached
    ///
    /// Used by the outbox relayer to propagate trace context
    /// (`trace-id`/`span-id`/`sampled`) without touching the payload.
    async fn publish_with_headers(
        &self,
        subject: &str,
        headers: HashMap<String, String>,
        payload: Vec<u8>,
    ) -> BusResult<()>;

    /// Subscribe to messages matching a subject pattern
    ///
    /// Patterns support NATS wildcards: `*` matches a single token,
    /// `>` matches one or more trailing tokens.
    async fn subscribe(&self, subject: &str) -> BusResult<BoxStream<'static, BusMessage>>;
}

impl fmt::Debug for dyn EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventBus")
    }
}
