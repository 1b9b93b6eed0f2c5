use crate::events::outbox::{
    self, fetch_pending, mark_processed, record_publish_failure,
};
use chrono::Utc;
use event_bus::{EventBus, EventEnvelope, HEADER_SAMPLED, HEADER_SPAN_ID, HEADER_TRACE_ID};
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

#[derive(Debug, Clone)]
pub struct RelayerConfig {
    /// Poll interval between ticks.
    pub interval: Duration,
    /// Publish attempts before a record is excluded as poison.
    pub max_retries: i32,
    /// Records fetched per tick.
    pub batch_size: i64,
}

impl Default for RelayerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            max_retries: 10,
            batch_size: 100,
        }
    }
}

/// Outbox relayer worker.
///
/// A single long-lived task owns the interval, so ticks are serialized by
/// construction and two ticks can never double-process the same records.
/// Errors are logged per tick and never escape the loop.
pub async fn run_relayer(
    pool: PgPool,
    bus: Arc<dyn EventBus>,
    config: RelayerConfig,
    mut shutdown: broadcast::Receiver<()>,
) {
    tracing::info!(
        interval_ms = config.interval.as_millis() as u64,
        max_retries = config.max_retries,
        "Starting outbox relayer"
    );

    let mut interval = tokio::time::interval(config.interval);
    let mut tick_count: u64 = 0;

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!("Outbox relayer shutting down");
                break;
            }
            _ = interval.tick() => {
                tick_count += 1;
                match relay_pending(&pool, &bus, &config).await {
                    Ok(count) if count > 0 => {
                        tracing::info!("Relayer tick {}: published {} records", tick_count, count);
                    }
                    Ok(_) => {
                        if tick_count <= 3 || tick_count % 60 == 0 {
                            tracing::debug!("Relayer tick {}: no pending records", tick_count);
                        }
                    }
                    Err(e) => {
                        tracing::error!("Relayer tick {}: error relaying records: {}", tick_count, e);
                    }
                }
            }
        }
    }
}

/// One relayer tick: fetch pending records oldest-first and publish each.
///
/// Records are marked processed one by one, immediately after their publish
/// is acknowledged — a partial batch failure never rolls back the records
/// already published, and a crash between publish and mark causes a
/// retransmit that consumers must absorb idempotently.
pub async fn relay_pending(
    pool: &PgPool,
    bus: &Arc<dyn EventBus>,
    config: &RelayerConfig,
) -> Result<usize, sqlx::Error> {
    let pending = fetch_pending(pool, config.max_retries, config.batch_size).await?;
    if pending.is_empty() {
        return Ok(0);
    }

    tracing::debug!("Relayer: found {} pending records", pending.len());

    let mut published = 0;

    for record in pending {
        let subject = format!("identity.events.{}", record.event_type);

        // Round-trip through the envelope type so a corrupt payload is
        // caught here, not on the consumer side.
        let payload = match serde_json::from_value::<EventEnvelope<serde_json::Value>>(
            record.payload.clone(),
        )
        .and_then(|envelope| serde_json::to_vec(&envelope))
        {
            Ok(bytes) => bytes,
            Err(e) => {
                // A payload that does not parse cannot succeed on a later
                // tick either; count the attempt so the poison threshold
                // catches it.
                tracing::error!(
                    outbox_id = record.id,
                    error = %e,
                    "Relayer: outbox payload does not parse as an event envelope"
                );
                record_publish_failure(pool, record.id).await?;
                continue;
            }
        };

        let publish_result = match &record.trace_id {
            Some(trace_id) => {
                // Propagate tracing context, forcing the consumer side to
                // retain the trace rather than sample it away.
                let mut headers = HashMap::new();
                headers.insert(HEADER_TRACE_ID.to_string(), trace_id.clone());
                if let Some(span_id) = &record.span_id {
                    headers.insert(HEADER_SPAN_ID.to_string(), span_id.clone());
                }
                headers.insert(HEADER_SAMPLED.to_string(), "1".to_string());
                bus.publish_with_headers(&subject, headers, payload).await
            }
            None => bus.publish(&subject, payload).await,
        };

        match publish_result {
            Ok(()) => {
                mark_processed(pool, record.id).await?;
                published += 1;
                tracing::info!(
                    outbox_id = record.id,
                    aggregate_id = %record.aggregate_id,
                    subject = %subject,
                    "Relayer: record published"
                );
            }
            Err(e) => {
                let retry_count = record_publish_failure(pool, record.id).await?;
                if retry_count >= config.max_retries {
                    tracing::warn!(
                        outbox_id = record.id,
                        aggregate_id = %record.aggregate_id,
                        retry_count,
                        "Relayer: record exceeded retry threshold, flagged for manual inspection"
                    );
                } else {
                    tracing::error!(
                        outbox_id = record.id,
                        aggregate_id = %record.aggregate_id,
                        retry_count,
                        error = %e,
                        "Relayer: publish failed, will retry next tick"
                    );
                }
            }
        }
    }

    Ok(published)
}

#[derive(Debug, Clone)]
pub struct SweepConfig {
    /// How often the sweep runs.
    pub interval: Duration,
    /// Age past which processed records are purged.
    pub retention: Duration,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(86_400),
            retention: Duration::from_secs(24 * 3600),
        }
    }
}

/// Retention sweep worker: purges processed outbox records older than the
/// retention window. Housekeeping, not correctness-critical.
pub async fn run_retention_sweep(
    pool: PgPool,
    config: SweepConfig,
    mut shutdown: broadcast::Receiver<()>,
) {
    tracing::info!(
        retention_secs = config.retention.as_secs(),
        "Starting outbox retention sweep"
    );

    let mut interval = tokio::time::interval(config.interval);

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!("Outbox retention sweep shutting down");
                break;
            }
            _ = interval.tick() => {
                let cutoff = Utc::now()
                    - chrono::Duration::from_std(config.retention)
                        .unwrap_or_else(|_| chrono::Duration::hours(24));

                match outbox::purge_processed_before(&pool, cutoff).await {
                    Ok(0) => {}
                    Ok(purged) => {
                        tracing::info!(purged, %cutoff, "Outbox sweep: purged processed records");
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Outbox sweep: purge failed");
                    }
                }
            }
        }
    }
}
