use chrono::{DateTime, Utc};
use event_bus::EventEnvelope;
use serde::Serialize;
use sqlx::{FromRow, PgPool, Postgres, Transaction};

/// Event type recorded for registrations; the relayer routes it to
/// `identity.events.user.registered`.
pub const EVENT_USER_REGISTERED: &str = "user.registered";

/// One row of the transactional outbox.
///
/// Rows are created only inside the domain-write transaction, mutated only
/// by the relayer (processed flag, processed_at, retry_count), and deleted
/// only by the retention sweep.
#[derive(Debug, Clone, FromRow)]
pub struct OutboxMessage {
    pub id: i64,
    pub aggregate_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub trace_id: Option<String>,
    pub span_id: Option<String>,
    pub processed: bool,
    pub retry_count: i32,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

/// Record an event in the outbox as part of the caller's open transaction.
///
/// This is the write-path contract: the domain mutation and the outbox row
/// commit or roll back together, so either both exist or neither does. No
/// network I/O happens here. A serialization failure is a programmer error
/// and surfaces as `sqlx::Error::Encode` (fatal, never retried).
pub async fn record_event<T: Serialize>(
    tx: &mut Transaction<'_, Postgres>,
    aggregate_id: &str,
    event_type: &str,
    envelope: &EventEnvelope<T>,
) -> Result<(), sqlx::Error> {
    let payload = serde_json::to_value(envelope).map_err(|e| sqlx::Error::Encode(Box::new(e)))?;

    sqlx::query(
        r#"
        INSERT INTO outbox_messages
            (aggregate_id, event_type, payload, trace_id, span_id)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(aggregate_id)
    .bind(event_type)
    .bind(payload)
    .bind(&envelope.trace_id)
    .bind(&envelope.span_id)
    .execute(&mut **tx)
    .await?;

    tracing::debug!(
        event_id = %envelope.event_id,
        aggregate_id = %aggregate_id,
        event_type = %event_type,
        "Event recorded in outbox"
    );

    Ok(())
}

/// Fetch pending records in creation order, excluding poison rows whose
/// retry_count has reached the threshold.
pub async fn fetch_pending(
    pool: &PgPool,
    max_retries: i32,
    limit: i64,
) -> Result<Vec<OutboxMessage>, sqlx::Error> {
    sqlx::query_as::<_, OutboxMessage>(
        r#"
        SELECT id, aggregate_id, event_type, payload, trace_id, span_id,
               processed, retry_count, created_at, processed_at
        FROM outbox_messages
        WHERE processed = FALSE AND retry_count < $1
        ORDER BY created_at ASC, id ASC
        LIMIT $2
        "#,
    )
    .bind(max_retries)
    .bind(limit)
    .fetch_all(pool)
    .await
}

/// Mark a record as published. A processed record is never re-published.
pub async fn mark_processed(pool: &PgPool, id: i64) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE outbox_messages
        SET processed = TRUE, processed_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(id)
    .execute(pool)
    .await?;

    Ok(())
}

/// Bump the retry counter after a failed publish; returns the new count so
/// the relayer can flag records that just crossed the poison threshold.
pub async fn record_publish_failure(pool: &PgPool, id: i64) -> Result<i32, sqlx::Error> {
    let (retry_count,): (i32,) = sqlx::query_as(
        r#"
        UPDATE outbox_messages
        SET retry_count = retry_count + 1
        WHERE id = $1
        RETURNING retry_count
        "#,
    )
    .bind(id)
    .fetch_one(pool)
    .await?;

    Ok(retry_count)
}

/// Records stuck past the retry threshold. Operator surface: these are
/// excluded from relaying and need manual inspection.
pub async fn fetch_poisoned(
    pool: &PgPool,
    max_retries: i32,
) -> Result<Vec<OutboxMessage>, sqlx::Error> {
    sqlx::query_as::<_, OutboxMessage>(
        r#"
        SELECT id, aggregate_id, event_type, payload, trace_id, span_id,
               processed, retry_count, created_at, processed_at
        FROM outbox_messages
        WHERE processed = FALSE AND retry_count >= $1
        ORDER BY created_at ASC
        "#,
    )
    .bind(max_retries)
    .fetch_all(pool)
    .await
}

/// Delete processed records older than the cutoff. Housekeeping only; never
/// touches pending rows.
pub async fn purge_processed_before(
    pool: &PgPool,
    cutoff: DateTime<Utc>,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        r#"
        DELETE FROM outbox_messages
        WHERE processed = TRUE AND processed_at < $1
        "#,
    )
    .bind(cutoff)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}
