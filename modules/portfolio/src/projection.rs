use sqlx::PgPool;

use crate::models::{Profile, UserRegisteredPayload};

/// Create a profile from a registration event, idempotently.
///
/// Uniqueness is enforced by the store: `profiles.username` carries a UNIQUE
/// constraint and the insert is `ON CONFLICT DO NOTHING`, so two concurrent
/// deliveries for the same aggregate cannot both insert — a prior
/// check-then-insert read would race. Returns true when a row was inserted,
/// false when the profile already existed (the no-op success path).
pub async fn create_profile(
    pool: &PgPool,
    payload: &UserRegisteredPayload,
) -> Result<bool, sqlx::Error> {
    let username = payload.username.to_lowercase().trim().to_string();

    let result = sqlx::query(
        r#"
        INSERT INTO profiles (username, email, full_name)
        VALUES ($1, $2, $3)
        ON CONFLICT (username) DO NOTHING
        "#,
    )
    .bind(&username)
    .bind(&payload.email)
    .bind(&payload.full_name)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        tracing::info!(
            username = %username,
            "Profile already exists, treating as no-op success"
        );
        return Ok(false);
    }

    tracing::info!(username = %username, "Profile created");
    Ok(true)
}

pub async fn profile_exists(pool: &PgPool, username: &str) -> Result<bool, sqlx::Error> {
    let result: Option<(i64,)> = sqlx::query_as(
        r#"
        SELECT id FROM profiles WHERE username = $1
        "#,
    )
    .bind(username)
    .fetch_optional(pool)
    .await?;

    Ok(result.is_some())
}

pub async fn find_profile(pool: &PgPool, username: &str) -> Result<Option<Profile>, sqlx::Error> {
    sqlx::query_as::<_, Profile>(
        r#"
        SELECT id, username, email, full_name, created_at
        FROM profiles
        WHERE username = $1
        "#,
    )
    .bind(username)
    .fetch_optional(pool)
    .await
}
