pub mod dlq;
pub mod outbox;
pub mod relayer;

pub use outbox::{record_event, OutboxMessage, EVENT_USER_REGISTERED};
pub use relayer::{run_relayer, run_retention_sweep, RelayerConfig, SweepConfig};
