//! Portfolio module: projects user registrations from the identity side
//! into the profile store, idempotently, and publishes compensation events
//! when a projection fails permanently.

pub mod config;
pub mod consumer_tasks;
pub mod events;
pub mod models;
pub mod projection;
