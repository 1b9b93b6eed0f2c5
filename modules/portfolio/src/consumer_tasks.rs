use event_bus::consumer_retry::{retry_with_backoff, RetryConfig};
use event_bus::{
    topology, BusMessage, EventBus, EventEnvelope, HEADER_SPAN_ID, HEADER_TRACE_ID,
};
use futures::StreamExt;
use sqlx::PgPool;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::Instrument;

use crate::events::consumer::{is_event_processed, mark_event_processed};
use crate::events::dlq;
use crate::models::{ProfileCreationFailedPayload, UserRegisteredPayload};
use crate::projection::create_profile;

/// Errors from the outcome dispatch itself. An error here means the
/// rejection did NOT happen and the message awaits redelivery.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("failed to publish compensation event: {0}")]
    CompensationPublish(#[from] event_bus::BusError),

    #[error("failed to serialize compensation event: {0}")]
    CompensationSerialize(#[from] serde_json::Error),
}

/// Result of projecting one registration event. A single dispatch point
/// turns this into done / retry / compensate-and-dead-letter, so rejection
/// mechanics never leak into projection code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Profile created.
    Projected,
    /// Projection already existed (duplicate delivery) — no-op success.
    AlreadyProjected,
    /// Recoverable failure (connectivity, timeouts): safe to retry in
    /// place, the write may yet succeed.
    Transient(String),
    /// Unrecoverable failure (business-invalid input): retrying cannot
    /// converge, the registration must be compensated.
    Permanent(String),
}

/// Start the forward consumer for user registration events.
pub async fn start_registration_consumer(
    bus: Arc<dyn EventBus>,
    pool: PgPool,
    mut shutdown: broadcast::Receiver<()>,
) {
    tokio::spawn(async move {
        tracing::info!("Starting registration consumer");

        let subject = topology::USER_REGISTRATION.subject;
        let mut stream = match bus.subscribe(subject).await {
            Ok(s) => s,
            Err(e) => {
                tracing::error!("Failed to subscribe to {}: {}", subject, e);
                return;
            }
        };

        tracing::info!("Subscribed to {}", subject);

        let retry_config = RetryConfig::default();

        loop {
            let msg = tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("Registration consumer shutting down");
                    break;
                }
                msg = stream.next() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
            };

            process_message(&pool, &bus, &msg, &retry_config).await;
        }

        tracing::warn!("Registration consumer stopped");
    });
}

async fn process_message(
    pool: &PgPool,
    bus: &Arc<dyn EventBus>,
    msg: &BusMessage,
    retry_config: &RetryConfig,
) {
    let envelope: EventEnvelope<UserRegisteredPayload> = match serde_json::from_slice(&msg.payload)
    {
        Ok(e) => e,
        Err(e) => {
            // No parsable aggregate id means no compensation target; the
            // message can only be dead-lettered for operator inspection.
            tracing::error!(
                subject = %msg.subject,
                error = %e,
                "Registration consumer: failed to parse event envelope"
            );
            dlq::handle_processing_error(pool, msg, &format!("malformed envelope: {e}"), 0).await;
            let _ = bus
                .publish(topology::USER_REGISTRATION.dlq_subject, msg.payload.clone())
                .await;
            return;
        }
    };

    // Correlation comes from transport headers first, envelope second; it
    // never affects control flow.
    let trace_id = msg
        .header(HEADER_TRACE_ID)
        .map(str::to_string)
        .or_else(|| envelope.trace_id.clone());
    let span_id = msg
        .header(HEADER_SPAN_ID)
        .map(str::to_string)
        .or_else(|| envelope.span_id.clone());

    let span = tracing::info_span!(
        "project_registration",
        event_id = %envelope.event_id,
        username = %envelope.payload.username,
        subject = %msg.subject,
        trace_id = %trace_id.as_deref().unwrap_or("none"),
    );

    async {
        // Transient outcomes retry in place with backoff; anything else
        // passes straight through to the dispatch point.
        let result = retry_with_backoff(
            || async {
                match project_registration(pool, &envelope).await {
                    Outcome::Transient(reason) => Err(reason),
                    other => Ok(other),
                }
            },
            retry_config,
            "registration_consumer",
        )
        .await;

        match result {
            Ok(outcome) => {
                if let Err(e) = dispatch_outcome(
                    pool,
                    bus,
                    msg,
                    &envelope,
                    trace_id.clone(),
                    outcome,
                )
                .await
                {
                    // The compensation publish failed: leave the message
                    // un-dead-lettered so redelivery re-runs the whole path
                    // and the compensation trigger is never lost.
                    tracing::error!(
                        event_id = %envelope.event_id,
                        error = %e,
                        "Registration consumer: dispatch failed, message left for redelivery"
                    );
                }
            }
            Err(error) => {
                tracing::error!(
                    error = %error,
                    retry_count = retry_config.max_attempts,
                    "Registration consumer: transient failure persisted after retries, dead-lettering"
                );
                dlq::handle_processing_error(pool, msg, &error, retry_config.max_attempts as i32)
                    .await;
                let _ = bus
                    .publish(topology::USER_REGISTRATION.dlq_subject, msg.payload.clone())
                    .await;
            }
        }
    }
    .instrument(span)
    .await;
}

/// Project one registration event into the profile store.
///
/// Classification is explicit per failure kind: business-invalid input is
/// `Permanent`, store errors are `Transient`, a pre-existing projection is
/// the no-op success path. The projection uses only fields carried by the
/// event; the identity store is never consulted.
pub async fn project_registration(
    pool: &PgPool,
    envelope: &EventEnvelope<UserRegisteredPayload>,
) -> Outcome {
    let payload = &envelope.payload;
    let username = payload.username.trim().to_lowercase();

    if username.is_empty() || payload.email.trim().is_empty() {
        return Outcome::Permanent(format!(
            "registration event for '{}' is missing username or email",
            payload.username
        ));
    }

    // End-to-end hook for exercising the compensation path.
    if username == "fail_test" {
        return Outcome::Permanent(format!("simulated saga failure for user: {username}"));
    }

    match is_event_processed(pool, envelope.event_id).await {
        Ok(true) => {
            tracing::info!(
                event_id = %envelope.event_id,
                "Duplicate registration event ignored (already processed)"
            );
            return Outcome::AlreadyProjected;
        }
        Ok(false) => {}
        Err(e) => return Outcome::Transient(e.to_string()),
    }

    match create_profile(pool, payload).await {
        Ok(true) => Outcome::Projected,
        Ok(false) => Outcome::AlreadyProjected,
        Err(e) => Outcome::Transient(e.to_string()),
    }
}

/// The single point deciding what happens to a message after projection.
///
/// Permanent failures publish the compensation event BEFORE the original
/// message is dead-lettered: a crash between the two steps must leave the
/// compensation trigger durably published, not silently lost. An error
/// return means the rejection did not happen and the message awaits
/// redelivery.
pub async fn dispatch_outcome(
    pool: &PgPool,
    bus: &Arc<dyn EventBus>,
    msg: &BusMessage,
    envelope: &EventEnvelope<UserRegisteredPayload>,
    trace_id: Option<String>,
    outcome: Outcome,
) -> Result<(), DispatchError> {
    match outcome {
        Outcome::Projected | Outcome::AlreadyProjected => {
            if let Err(e) = mark_event_processed(pool, envelope.event_id, &msg.subject).await {
                tracing::warn!(
                    event_id = %envelope.event_id,
                    error = %e,
                    "Failed to mark event processed; redelivery stays a no-op via the store constraint"
                );
            }
            Ok(())
        }
        Outcome::Transient(reason) => {
            // Transient outcomes are retried upstream; reaching this arm
            // means the caller opted out of retrying.
            tracing::warn!(reason = %reason, "Transient outcome dispatched without retry");
            Ok(())
        }
        Outcome::Permanent(reason) => {
            let username = envelope.payload.username.trim().to_lowercase();
            tracing::error!(
                username = %username,
                reason = %reason,
                "Projection failed permanently, triggering compensation"
            );

            let compensation = EventEnvelope::new(
                "portfolio".to_string(),
                ProfileCreationFailedPayload {
                    username,
                    reason: reason.clone(),
                },
            )
            .with_source_version(env!("CARGO_PKG_VERSION").to_string())
            .with_trace_id(trace_id);

            let payload = serde_json::to_vec(&compensation)?;

            // Must be durably published before the original is discarded.
            bus.publish(topology::PROFILE_FAILURE.subject, payload).await?;

            tracing::info!(
                compensation_event_id = %compensation.event_id,
                "Compensation event published"
            );

            // Reject without requeue: audit row + dead-letter subject.
            dlq::handle_processing_error(pool, msg, &reason, 0).await;
            if let Err(e) = bus
                .publish(topology::USER_REGISTRATION.dlq_subject, msg.payload.clone())
                .await
            {
                tracing::error!(
                    subject = topology::USER_REGISTRATION.dlq_subject,
                    error = %e,
                    "Failed to publish rejected message to dead-letter subject"
                );
            }

            Ok(())
        }
    }
}
