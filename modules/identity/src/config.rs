use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub enum BusType {
    Nats,
    InMemory,
}

impl BusType {
    pub fn from_env() -> Self {
        match env::var("BUS_TYPE")
            .unwrap_or_else(|_| "inmemory".to_string())
            .to_lowercase()
            .as_str()
        {
            "nats" => BusType::Nats,
            "inmemory" => BusType::InMemory,
            _ => {
                tracing::warn!("Unknown BUS_TYPE, defaulting to inmemory");
                BusType::InMemory
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bus_type: BusType,
    pub database_url: String,
    pub nats_url: Option<String>,
    /// How often the relayer polls the outbox for pending records.
    pub relay_interval: Duration,
    /// Publish attempts before a record is flagged as poison and excluded
    /// from future polls.
    pub outbox_max_retries: i32,
    /// How long processed records are kept before the sweep deletes them.
    pub retention_window: Duration,
    /// How often the retention sweep runs.
    pub sweep_interval: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        let bus_type = BusType::from_env();
        let database_url =
            env::var("DATABASE_URL").map_err(|_| "DATABASE_URL must be set".to_string())?;

        let nats_url = match bus_type {
            BusType::Nats => Some(
                env::var("NATS_URL").unwrap_or_else(|_| "nats://localhost:4222".to_string()),
            ),
            BusType::InMemory => None,
        };

        let relay_interval_ms: u64 = parse_env("RELAY_INTERVAL_MS", 5000)?;
        let outbox_max_retries: i32 = parse_env("OUTBOX_MAX_RETRIES", 10)?;
        let retention_hours: u64 = parse_env("OUTBOX_RETENTION_HOURS", 24)?;
        let sweep_interval_secs: u64 = parse_env("OUTBOX_SWEEP_INTERVAL_SECS", 86_400)?;

        Ok(Self {
            bus_type,
            database_url,
            nats_url,
            relay_interval: Duration::from_millis(relay_interval_ms),
            outbox_max_retries,
            retention_window: Duration::from_secs(retention_hours * 3600),
            sweep_interval: Duration::from_secs(sweep_interval_secs),
        })
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, default: T) -> Result<T, String> {
    match env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| format!("{name} must be a valid number")),
        Err(_) => Ok(default),
    }
}
