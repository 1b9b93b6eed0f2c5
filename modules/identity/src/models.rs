use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A stored identity record.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct UserCredential {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub full_name: String,
    pub role: String,
    pub created_at: DateTime<Utc>,
}

/// Input for a new registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewUser {
    pub username: String,
    pub email: String,
    pub full_name: String,
    #[serde(default = "default_role")]
    pub role: String,
}

fn default_role() -> String {
    "user".to_string()
}

// ============================================================================
// Events
// ============================================================================

/// Payload published when a user registers. This is the whole contract
/// between identity and portfolio; the consumer never reads our store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRegisteredPayload {
    pub username: String,
    pub email: String,
    pub full_name: String,
    pub role: String,
}

/// Inbound payload on the compensation flow: portfolio failed to create the
/// profile and asks us to reverse the registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileCreationFailedPayload {
    pub username: String,
    pub reason: String,
}
