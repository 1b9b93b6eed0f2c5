use sqlx::PgPool;
use uuid::Uuid;

/// Check if an event has already been processed (idempotency check)
///
/// Deduplicates redeliveries of the same emission: the relayer retransmits
/// when it crashes between publish and mark-processed, and the broker
/// delivers at-least-once.
pub async fn is_event_processed(pool: &PgPool, event_id: Uuid) -> Result<bool, sqlx::Error> {
    let result: Option<(Uuid,)> = sqlx::query_as(
        r#"
        SELECT event_id
        FROM processed_events
        WHERE event_id = $1
        "#,
    )
    .bind(event_id)
    .fetch_optional(pool)
    .await?;

    Ok(result.is_some())
}

/// Mark an event as processed so later redeliveries are ignored.
pub async fn mark_event_processed(
    pool: &PgPool,
    event_id: Uuid,
    subject: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO processed_events (event_id, subject)
        VALUES ($1, $2)
        ON CONFLICT (event_id) DO NOTHING
        "#,
    )
    .bind(event_id)
    .bind(subject)
    .execute(pool)
    .await?;

    tracing::debug!(event_id = %event_id, "Event marked as processed");

    Ok(())
}
