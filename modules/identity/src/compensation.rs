use event_bus::consumer_retry::{retry_with_backoff, RetryConfig};
use event_bus::{topology, BusMessage, EventBus, EventEnvelope, HEADER_TRACE_ID};
use futures::StreamExt;
use sqlx::PgPool;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::Instrument;

use crate::events::dlq;
use crate::models::ProfileCreationFailedPayload;
use crate::registration::reverse_registration;

/// Start the saga compensation consumer.
///
/// Listens on the compensation flow's MAIN subject only — the dead-letter
/// subject exists for operator recovery and alerts, never for automatic
/// logic, so a compensation-of-compensation cycle cannot form.
pub async fn start_compensation_consumer(
    bus: Arc<dyn EventBus>,
    pool: PgPool,
    mut shutdown: broadcast::Receiver<()>,
) {
    tokio::spawn(async move {
        tracing::info!("Starting compensation consumer");

        let subject = topology::PROFILE_FAILURE.subject;
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
                    tracing::info!("Compensation consumer shutting down");
                    break;
                }
                msg = stream.next() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
            };

            process_message(&pool, &bus, &msg, &retry_config).await;
        }

        tracing::warn!("Compensation consumer stopped");
    });
}

async fn process_message(
    pool: &PgPool,
    bus: &Arc<dyn EventBus>,
    msg: &BusMessage,
    retry_config: &RetryConfig,
) {
    let envelope: EventEnvelope<ProfileCreationFailedPayload> =
        match serde_json::from_slice(&msg.payload) {
            Ok(e) => e,
            Err(e) => {
                // A malformed compensation event can never be reversed
                // automatically; dead-letter it for operator inspection.
                tracing::error!(
                    subject = %msg.subject,
                    error = %e,
                    "Compensation: failed to parse event envelope"
                );
                dead_letter(pool, bus, msg, &format!("malformed envelope: {e}"), 0).await;
                return;
            }
        };

    let trace_id = msg
        .header(HEADER_TRACE_ID)
        .map(str::to_string)
        .or_else(|| envelope.trace_id.clone());

    let span = tracing::info_span!(
        "compensate_registration",
        event_id = %envelope.event_id,
        username = %envelope.payload.username,
        trace_id = %trace_id.as_deref().unwrap_or("none"),
    );

    async {
        tracing::info!(
            reason = %envelope.payload.reason,
            "Compensation: received profile-creation failure"
        );

        // Reversal failures must not be swallowed: retry with backoff, and
        // surface exhaustion on the flow's dead-letter path.
        let result = retry_with_backoff(
            || {
                let pool = pool.clone();
                let payload = envelope.payload.clone();
                async move {
                    reverse_registration(&pool, &payload.username, &payload.reason)
                        .await
                        .map_err(|e| format!("{e}"))
                }
            },
            retry_config,
            "compensation_consumer",
        )
        .await;

        match result {
            Ok(true) => {
                tracing::info!("Compensation: registration reversed");
            }
            Ok(false) => {
                // Target already gone: reported by reverse_registration,
                // nothing left to converge on.
            }
            Err(error) => {
                tracing::error!(
                    error = %error,
                    retry_count = retry_config.max_attempts,
                    "Compensation: reversal failed after retries, dead-lettering"
                );
                dead_letter(pool, bus, msg, &error, retry_config.max_attempts as i32).await;
            }
        }
    }
    .instrument(span)
    .await;
}

/// Redirect a rejected compensation message to the flow's dead-letter
/// subject and record it in the failed_events table.
async fn dead_letter(
    pool: &PgPool,
    bus: &Arc<dyn EventBus>,
    msg: &BusMessage,
    error: &str,
    retry_count: i32,
) {
    dlq::handle_processing_error(pool, msg, error, retry_count).await;

    if let Err(e) = bus
        .publish(topology::PROFILE_FAILURE.dlq_subject, msg.payload.clone())
        .await
    {
        tracing::error!(
            subject = topology::PROFILE_FAILURE.dlq_subject,
            error = %e,
            "Compensation: failed to publish to dead-letter subject"
        );
    }
}
