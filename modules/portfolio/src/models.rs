use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A projected profile record. Created exclusively from registration
/// events; the identity store is never read directly.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Profile {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub full_name: String,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Events
// ============================================================================

/// Inbound payload on the registration flow. The event JSON is the
/// contract; this mirrors what the identity side publishes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRegisteredPayload {
    pub username: String,
    pub email: String,
    pub full_name: String,
    #[serde(default)]
    pub role: String,
}

/// Outbound payload on the compensation flow: tells the identity side to
/// reverse a registration whose projection permanently failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileCreationFailedPayload {
    pub username: String,
    pub reason: String,
}
