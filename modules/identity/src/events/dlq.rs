use event_bus::BusMessage;
use sqlx::PgPool;
use uuid::Uuid;

/// Insert a failed event into the dead-letter table.
///
/// This is the durable, operator-visible record of a message the
/// compensation consumer gave up on. Nothing reads it automatically.
pub async fn insert_failed_event(
    pool: &PgPool,
    event_id: Uuid,
    subject: &str,
    envelope_json: &serde_json::Value,
    error: &str,
    retry_count: i32,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO failed_events (event_id, subject, envelope_json, error, retry_count)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (event_id) DO UPDATE
        SET retry_count = EXCLUDED.retry_count,
            error = EXCLUDED.error,
            failed_at = NOW()
        "#,
    )
    .bind(event_id)
    .bind(subject)
    .bind(envelope_json)
    .bind(error)
    .bind(retry_count)
    .execute(pool)
    .await?;

    tracing::error!(
        event_id = %event_id,
        subject = %subject,
        error = %error,
        "Event moved to dead-letter table after failure"
    );

    Ok(())
}

/// Best-effort dead-lettering of a bus message whose processing exhausted
/// its retries. Extraction or insert problems are logged, never propagated;
/// the consumer loop must keep draining.
pub async fn handle_processing_error(
    pool: &PgPool,
    msg: &BusMessage,
    error: &str,
    retry_count: i32,
) {
    let envelope_json: serde_json::Value = match serde_json::from_slice(&msg.payload) {
        Ok(v) => v,
        Err(e) => {
            tracing::error!(
                subject = %msg.subject,
                error = %e,
                "Dead-letter: message payload is not valid JSON"
            );
            serde_json::json!({ "raw": String::from_utf8_lossy(&msg.payload) })
        }
    };

    let event_id = envelope_json
        .get("event_id")
        .and_then(|v| v.as_str())
        .and_then(|s| Uuid::parse_str(s).ok())
        .unwrap_or_else(Uuid::new_v4);

    if let Err(e) =
        insert_failed_event(pool, event_id, &msg.subject, &envelope_json, error, retry_count).await
    {
        tracing::error!(
            event_id = %event_id,
            subject = %msg.subject,
            error = %e,
            "Dead-letter: failed to persist failed event"
        );
    }
}
