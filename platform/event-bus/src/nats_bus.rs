//! NATS-based implementation of the EventBus trait

use crate::{BusError, BusMessage, BusResult, EventBus, FlowTopology};
use async_nats::Client;
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use std::collections::HashMap;

/// EventBus implementation using NATS JetStream
///
/// Production implementation wrapping an `async_nats::Client`.
///
/// # Example
/// ```rust,no_run
/// use event_bus::{EventBus, NatsBus, topology};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let nats_client = async_nats::connect("nats://localhost:4222").await?;
/// let bus = NatsBus::new(nats_client);
///
/// // Declare streams once at startup, then publish.
/// bus.ensure_topology(&topology::ALL_FLOWS).await?;
/// bus.publish("identity.events.user.registered", b"hello".to_vec()).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct NatsBus {
    client: Client,
}

impl NatsBus {
    /// Create a new NatsBus from an already-connected NATS client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Get a reference to the underlying NATS client
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Declare the JetStream streams backing each flow.
    ///
    /// Idempotent; called once at process startup. Each stream retains the
    /// flow's live subject and its dead-letter subject, so rejected
    /// messages stay durably available to operators.
    pub async fn ensure_topology(&self, flows: &[FlowTopology]) -> BusResult<()> {
        let jetstream = async_nats::jetstream::new(self.client.clone());

        for flow in flows {
            jetstream
                .get_or_create_stream(async_nats::jetstream::stream::Config {
                    name: flow.stream.to_string(),
                    subjects: flow.subjects(),
                    ..Default::default()
                })
                .await
                .map_err(|e| {
                    BusError::TopologyError(format!("stream {}: {}", flow.stream, e))
                })?;

            tracing::info!(
                stream = flow.stream,
                subject = flow.subject,
                dlq_subject = flow.dlq_subject,
                "Flow topology declared"
            );
        }

        Ok(())
    }
}

#[async_trait]
impl EventBus for NatsBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> BusResult<()> {
        self.client
            .publish(subject.to_string(), payload.into())
            .await
            .map_err(|e| BusError::PublishError(e.to_string()))?;

        Ok(())
    }

    async fn publish_with_headers(
        &self,
        subject: &str,
        headers: HashMap<String, String>,
        payload: Vec<u8>,
    ) -> BusResult<()> {
        let mut nats_headers = async_nats::HeaderMap::new();
        for (key, value) in &headers {
            nats_headers.insert(key.as_str(), value.as_str());
        }

        self.client
            .publish_with_headers(subject.to_string(), nats_headers, payload.into())
            .await
            .map_err(|e| BusError::PublishError(e.to_string()))?;

        Ok(())
    }

    async fn subscribe(&self, subject: &str) -> BusResult<BoxStream<'static, BusMessage>> {
        let subscriber = self
            .client
            .subscribe(subject.to_string())
            .await
            .map_err(|e| BusError::SubscribeError(e.to_string()))?;

        let stream = subscriber.map(|nats_msg| {
            let mut msg = BusMessage::new(nats_msg.subject.to_string(), nats_msg.payload.to_vec());

            if let Some(nats_headers) = nats_msg.headers {
                let mut headers = HashMap::new();
                for (key, values) in nats_headers.iter() {
                    if let Some(value) = values.first() {
                        headers.insert(key.to_string(), value.to_string());
                    }
                }
                if !headers.is_empty() {
                    msg = msg.with_headers(headers);
                }
            }

            msg
        });

        Ok(stream.boxed())
    }
}
