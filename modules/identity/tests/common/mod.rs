use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

/// Connect to the test database, or None when `DATABASE_URL` is unset so
/// the suite stays green without infrastructure.
///
/// Tables are created directly (not via the migrator) so identity and
/// portfolio suites can share one scratch database without fighting over
/// migration bookkeeping.
pub async fn try_pool() -> Option<PgPool> {
    let url = match std::env::var("DATABASE_URL") {
        Ok(url) => url,
        Err(_) => {
            eprintln!("DATABASE_URL not set, skipping Postgres-backed test");
            return None;
        }
    };

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&url)
        .await
        .expect("Failed to connect to test database");

    for ddl in [
        r#"
        CREATE TABLE IF NOT EXISTS user_credentials (
            id BIGSERIAL PRIMARY KEY,
            username TEXT NOT NULL UNIQUE,
            email TEXT NOT NULL UNIQUE,
            full_name TEXT NOT NULL,
            role TEXT NOT NULL DEFAULT 'user',
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS outbox_messages (
            id BIGSERIAL PRIMARY KEY,
            aggregate_id TEXT NOT NULL,
            event_type TEXT NOT NULL,
            payload JSONB NOT NULL,
            trace_id TEXT,
            span_id TEXT,
            processed BOOLEAN NOT NULL DEFAULT FALSE,
            retry_count INT NOT NULL DEFAULT 0,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            processed_at TIMESTAMPTZ
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS failed_events (
            event_id UUID PRIMARY KEY,
            subject TEXT NOT NULL,
            envelope_json JSONB NOT NULL,
            error TEXT NOT NULL,
            retry_count INT NOT NULL DEFAULT 0,
            failed_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    ] {
        sqlx::query(ddl)
            .execute(&pool)
            .await
            .expect("Failed to create test tables");
    }

    Some(pool)
}

/// Remove rows the identity tests create.
pub async fn cleanup(pool: &PgPool) {
    sqlx::query("DELETE FROM outbox_messages").execute(pool).await.ok();
    sqlx::query("DELETE FROM user_credentials").execute(pool).await.ok();
    sqlx::query("DELETE FROM failed_events").execute(pool).await.ok();
}
