mod common;

use async_trait::async_trait;
use event_bus::{topology, BusError, BusMessage, BusResult, EventBus, InMemoryBus};
use futures::stream::BoxStream;
use futures::StreamExt;
use identity_rs::events::outbox::{
    self, fetch_pending, fetch_poisoned, mark_processed, record_event, record_publish_failure,
    EVENT_USER_REGISTERED,
};
use identity_rs::events::relayer::{relay_pending, RelayerConfig};
use identity_rs::models::{NewUser, UserRegisteredPayload};
use identity_rs::registration::{register_user, RegistrationError};
use serial_test::serial;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// A bus whose publishes always fail — the unreachable-broker case.
struct FailingBus;

#[async_trait]
impl EventBus for FailingBus {
    async fn publish(&self, _subject: &str, _payload: Vec<u8>) -> BusResult<()> {
        Err(BusError::PublishError("connection refused".to_string()))
    }

    async fn publish_with_headers(
        &self,
        _subject: &str,
        _headers: HashMap<String, String>,
        _payload: Vec<u8>,
    ) -> BusResult<()> {
        Err(BusError::PublishError("connection refused".to_string()))
    }

    async fn subscribe(&self, _subject: &str) -> BusResult<BoxStream<'static, BusMessage>> {
        Err(BusError::SubscribeError("connection refused".to_string()))
    }
}

fn new_user(username: &str) -> NewUser {
    NewUser {
        username: username.to_string(),
        email: format!("{username}@example.com"),
        full_name: format!("Test {username}"),
        role: "user".to_string(),
    }
}

#[tokio::test]
#[serial]
async fn test_register_user_writes_credential_and_outbox_atomically() {
    let Some(pool) = common::try_pool().await else { return };
    common::cleanup(&pool).await;

    let credential = register_user(&pool, new_user("alice"), Some("trace-1".to_string()), None)
        .await
        .expect("registration should succeed");

    assert_eq!(credential.username, "alice");

    let pending = fetch_pending(&pool, 10, 100).await.expect("fetch pending");
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].aggregate_id, "alice");
    assert_eq!(pending[0].event_type, EVENT_USER_REGISTERED);
    assert_eq!(pending[0].trace_id.as_deref(), Some("trace-1"));
    assert!(!pending[0].processed);
    assert_eq!(pending[0].retry_count, 0);

    common::cleanup(&pool).await;
}

#[tokio::test]
#[serial]
async fn test_duplicate_registration_fails_and_leaves_no_orphan_outbox_row() {
    let Some(pool) = common::try_pool().await else { return };
    common::cleanup(&pool).await;

    register_user(&pool, new_user("bob"), None, None)
        .await
        .expect("first registration should succeed");

    let result = register_user(&pool, new_user("bob"), None, None).await;
    assert!(matches!(result, Err(RegistrationError::UserAlreadyExists(_))));

    // The failed transaction must not have persisted a second outbox row.
    let pending = fetch_pending(&pool, 10, 100).await.expect("fetch pending");
    assert_eq!(pending.len(), 1);

    common::cleanup(&pool).await;
}

#[tokio::test]
#[serial]
async fn test_relayer_tick_publishes_and_marks_processed() {
    let Some(pool) = common::try_pool().await else { return };
    common::cleanup(&pool).await;

    let bus: Arc<dyn EventBus> = Arc::new(InMemoryBus::new());
    let mut stream = bus.subscribe("identity.events.>").await.unwrap();

    register_user(&pool, new_user("alice"), Some("trace-42".to_string()), None)
        .await
        .expect("registration should succeed");

    let config = RelayerConfig::default();
    let published = relay_pending(&pool, &bus, &config).await.expect("relay tick");
    assert_eq!(published, 1);

    // Row flipped to processed.
    let pending = fetch_pending(&pool, config.max_retries, 100).await.unwrap();
    assert!(pending.is_empty(), "published record must not be re-relayed");

    // The message landed on the registration flow subject with trace headers.
    let msg = tokio::time::timeout(Duration::from_secs(1), stream.next())
        .await
        .expect("timeout")
        .expect("stream ended");
    assert_eq!(msg.subject, topology::USER_REGISTRATION.subject);
    assert_eq!(msg.header(event_bus::HEADER_TRACE_ID), Some("trace-42"));
    assert_eq!(msg.header(event_bus::HEADER_SAMPLED), Some("1"));

    let envelope: event_bus::EventEnvelope<UserRegisteredPayload> =
        serde_json::from_slice(&msg.payload).expect("published payload parses");
    assert_eq!(envelope.payload.username, "alice");

    // A second tick is a no-op: processed records are never re-published.
    let published = relay_pending(&pool, &bus, &config).await.expect("relay tick");
    assert_eq!(published, 0);

    common::cleanup(&pool).await;
}

#[tokio::test]
#[serial]
async fn test_relayer_preserves_creation_order_within_a_tick() {
    let Some(pool) = common::try_pool().await else { return };
    common::cleanup(&pool).await;

    let bus: Arc<dyn EventBus> = Arc::new(InMemoryBus::new());
    let mut stream = bus.subscribe("identity.events.>").await.unwrap();

    for name in ["first", "second", "third"] {
        register_user(&pool, new_user(name), None, None)
            .await
            .expect("registration should succeed");
    }

    relay_pending(&pool, &bus, &RelayerConfig::default())
        .await
        .expect("relay tick");

    for expected in ["first", "second", "third"] {
        let msg = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("timeout")
            .expect("stream ended");
        let envelope: event_bus::EventEnvelope<UserRegisteredPayload> =
            serde_json::from_slice(&msg.payload).unwrap();
        assert_eq!(envelope.payload.username, expected);
    }

    common::cleanup(&pool).await;
}

#[tokio::test]
#[serial]
async fn test_unreachable_broker_leaves_record_pending_and_counts_retry() {
    let Some(pool) = common::try_pool().await else { return };
    common::cleanup(&pool).await;

    register_user(&pool, new_user("alice"), None, None)
        .await
        .expect("registration should succeed");

    let bus: Arc<dyn EventBus> = Arc::new(FailingBus);
    let config = RelayerConfig::default();

    // The tick must not propagate the publish failure.
    let published = relay_pending(&pool, &bus, &config).await.expect("relay tick");
    assert_eq!(published, 0);

    let pending = fetch_pending(&pool, config.max_retries, 100).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert!(!pending[0].processed);
    assert_eq!(pending[0].retry_count, 1);

    common::cleanup(&pool).await;
}

#[tokio::test]
#[serial]
async fn test_poisoned_records_are_excluded_from_polls() {
    let Some(pool) = common::try_pool().await else { return };
    common::cleanup(&pool).await;

    register_user(&pool, new_user("stuck"), None, None)
        .await
        .expect("registration should succeed");

    let config = RelayerConfig {
        max_retries: 3,
        ..RelayerConfig::default()
    };
    let bus: Arc<dyn EventBus> = Arc::new(FailingBus);

    // Every outbox record eventually reaches processed or the poison state;
    // after max_retries failing ticks this one must be flagged, not retried
    // forever.
    for _ in 0..config.max_retries {
        relay_pending(&pool, &bus, &config).await.expect("relay tick");
    }

    let pending = fetch_pending(&pool, config.max_retries, 100).await.unwrap();
    assert!(pending.is_empty(), "poisoned record must not be polled again");

    let poisoned = fetch_poisoned(&pool, config.max_retries).await.unwrap();
    assert_eq!(poisoned.len(), 1);
    assert_eq!(poisoned[0].aggregate_id, "stuck");
    assert_eq!(poisoned[0].retry_count, config.max_retries);

    common::cleanup(&pool).await;
}

#[tokio::test]
#[serial]
async fn test_retention_purge_removes_only_old_processed_records() {
    let Some(pool) = common::try_pool().await else { return };
    common::cleanup(&pool).await;

    register_user(&pool, new_user("old"), None, None).await.unwrap();
    register_user(&pool, new_user("fresh"), None, None).await.unwrap();

    let pending = fetch_pending(&pool, 10, 100).await.unwrap();
    let old_id = pending
        .iter()
        .find(|r| r.aggregate_id == "old")
        .map(|r| r.id)
        .expect("old record present");

    // Process the old record and backdate it past the retention window.
    mark_processed(&pool, old_id).await.unwrap();
    sqlx::query("UPDATE outbox_messages SET processed_at = NOW() - INTERVAL '2 days' WHERE id = $1")
        .bind(old_id)
        .execute(&pool)
        .await
        .unwrap();

    let purged = outbox::purge_processed_before(&pool, chrono::Utc::now() - chrono::Duration::hours(24))
        .await
        .unwrap();
    assert_eq!(purged, 1);

    // The pending record survives the sweep.
    let pending = fetch_pending(&pool, 10, 100).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].aggregate_id, "fresh");

    common::cleanup(&pool).await;
}

#[tokio::test]
#[serial]
async fn test_corrupt_payload_counts_toward_poison_threshold() {
    let Some(pool) = common::try_pool().await else { return };
    common::cleanup(&pool).await;

    // Only the relayer ever reads the payload back; a row that does not
    // parse as an envelope can never publish and must burn down its
    // retries instead of looping forever.
    sqlx::query(
        r#"
        INSERT INTO outbox_messages (aggregate_id, event_type, payload)
        VALUES ('broken', 'user.registered', '{"not": "an envelope"}'::jsonb)
        "#,
    )
    .execute(&pool)
    .await
    .unwrap();

    let bus: Arc<dyn EventBus> = Arc::new(InMemoryBus::new());
    let mut stream = bus.subscribe("identity.events.>").await.unwrap();

    let published = relay_pending(&pool, &bus, &RelayerConfig::default())
        .await
        .expect("relay tick");
    assert_eq!(published, 0);

    let pending = fetch_pending(&pool, 10, 100).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].retry_count, 1);

    let nothing = tokio::time::timeout(Duration::from_millis(100), stream.next()).await;
    assert!(nothing.is_err(), "corrupt payload must not reach the bus");

    common::cleanup(&pool).await;
}

#[tokio::test]
#[serial]
async fn test_record_event_rolls_back_with_its_transaction() {
    let Some(pool) = common::try_pool().await else { return };
    common::cleanup(&pool).await;

    let envelope = event_bus::EventEnvelope::new(
        "identity".to_string(),
        UserRegisteredPayload {
            username: "ghost".to_string(),
            email: "ghost@example.com".to_string(),
            full_name: "Ghost".to_string(),
            role: "user".to_string(),
        },
    );

    let mut tx = pool.begin().await.unwrap();
    record_event(&mut tx, "ghost", EVENT_USER_REGISTERED, &envelope)
        .await
        .unwrap();
    tx.rollback().await.unwrap();

    // Either both the mutation and the record exist, or neither does.
    let pending = fetch_pending(&pool, 10, 100).await.unwrap();
    assert!(pending.is_empty());

    common::cleanup(&pool).await;
}

#[tokio::test]
#[serial]
async fn test_publish_failure_counter_round_trips() {
    let Some(pool) = common::try_pool().await else { return };
    common::cleanup(&pool).await;

    register_user(&pool, new_user("alice"), None, None).await.unwrap();
    let record = &fetch_pending(&pool, 10, 100).await.unwrap()[0];

    assert_eq!(record_publish_failure(&pool, record.id).await.unwrap(), 1);
    assert_eq!(record_publish_failure(&pool, record.id).await.unwrap(), 2);

    common::cleanup(&pool).await;
}
