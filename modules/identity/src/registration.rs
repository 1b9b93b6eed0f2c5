use event_bus::EventEnvelope;
use sqlx::PgPool;
use uuid::Uuid;

use crate::events::outbox::{record_event, EVENT_USER_REGISTERED};
use crate::models::{NewUser, UserCredential, UserRegisteredPayload};

#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("user '{0}' already exists")]
    UserAlreadyExists(String),
}

/// Register a user: insert the credential row and the outbox record in one
/// local transaction, so either both exist or neither does.
///
/// The request succeeds as soon as this transaction commits; propagation to
/// the profile store is asynchronous and eventually consistent. No network
/// I/O happens here.
pub async fn register_user(
    pool: &PgPool,
    new_user: NewUser,
    trace_id: Option<String>,
    span_id: Option<String>,
) -> Result<UserCredential, RegistrationError> {
    let username = new_user.username.to_lowercase().trim().to_string();
    let trace_id = trace_id.unwrap_or_else(|| format!("internal-{}", Uuid::new_v4()));

    let mut tx = pool.begin().await?;

    let credential = sqlx::query_as::<_, UserCredential>(
        r#"
        INSERT INTO user_credentials (username, email, full_name, role)
        VALUES ($1, $2, $3, $4)
        RETURNING id, username, email, full_name, role, created_at
        "#,
    )
    .bind(&username)
    .bind(&new_user.email)
    .bind(&new_user.full_name)
    .bind(&new_user.role)
    .fetch_one(&mut *tx)
    .await
    .map_err(|e| match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            RegistrationError::UserAlreadyExists(username.clone())
        }
        _ => RegistrationError::Database(e),
    })?;

    let envelope = EventEnvelope::new(
        "identity".to_string(),
        UserRegisteredPayload {
            username: credential.username.clone(),
            email: credential.email.clone(),
            full_name: credential.full_name.clone(),
            role: credential.role.clone(),
        },
    )
    .with_source_version(env!("CARGO_PKG_VERSION").to_string())
    .with_trace_id(Some(trace_id.clone()))
    .with_span_id(span_id);

    record_event(&mut tx, &credential.username, EVENT_USER_REGISTERED, &envelope).await?;

    tx.commit().await?;

    tracing::info!(
        username = %credential.username,
        trace_id = %trace_id,
        "Registered user"
    );

    Ok(credential)
}

/// Saga compensation: remove the credential row for a registration whose
/// downstream projection permanently failed.
///
/// Returns true when a row was deleted. A missing row is reported, not
/// retried — retrying a missing-aggregate reversal cannot converge.
pub async fn reverse_registration(
    pool: &PgPool,
    username: &str,
    reason: &str,
) -> Result<bool, sqlx::Error> {
    tracing::warn!(
        username = %username,
        reason = %reason,
        "Saga compensation: reversing registration"
    );

    let result = sqlx::query("DELETE FROM user_credentials WHERE username = $1")
        .bind(username)
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        tracing::error!(
            username = %username,
            "Saga compensation: user not found for reversal"
        );
        return Ok(false);
    }

    tracing::info!(
        username = %username,
        reason = %reason,
        "Saga compensation: user removed from identity store"
    );

    Ok(true)
}

/// Look up a stored credential. Used by tests and operator tooling.
pub async fn find_user(
    pool: &PgPool,
    username: &str,
) -> Result<Option<UserCredential>, sqlx::Error> {
    sqlx::query_as::<_, UserCredential>(
        r#"
        SELECT id, username, email, full_name, role, created_at
        FROM user_credentials
        WHERE username = $1
        "#,
    )
    .bind(username)
    .fetch_optional(pool)
    .await
}
