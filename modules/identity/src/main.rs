use event_bus::{topology, EventBus, InMemoryBus, NatsBus};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

use identity_rs::compensation::start_compensation_consumer;
use identity_rs::config::{BusType, Config};
use identity_rs::events::{run_relayer, run_retention_sweep, RelayerConfig, SweepConfig};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::from_env().expect("Failed to load configuration");
    tracing::info!("Configuration loaded: {:?}", config.bus_type);

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await
        .expect("Failed to connect to database");

    sqlx::migrate!("./db/migrations")
        .run(&pool)
        .await
        .expect("Failed to run migrations");

    tracing::info!("Database migrations completed");

    let bus: Arc<dyn EventBus> = match config.bus_type {
        BusType::Nats => {
            let nats_url = config.nats_url.as_ref().expect("NATS_URL required for NATS bus");
            tracing::info!("Connecting to NATS at {}", nats_url);
            let nats_client = async_nats::connect(nats_url)
                .await
                .expect("Failed to connect to NATS");
            let nats_bus = NatsBus::new(nats_client);
            nats_bus
                .ensure_topology(&topology::ALL_FLOWS)
                .await
                .expect("Failed to declare broker topology");
            Arc::new(nats_bus)
        }
        BusType::InMemory => {
            tracing::info!("Using in-memory event bus");
            Arc::new(InMemoryBus::new())
        }
    };

    // One shutdown signal fans out to every worker.
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let relayer_config = RelayerConfig {
        interval: config.relay_interval,
        max_retries: config.outbox_max_retries,
        ..RelayerConfig::default()
    };
    tokio::spawn(run_relayer(
        pool.clone(),
        bus.clone(),
        relayer_config,
        shutdown_tx.subscribe(),
    ));

    let sweep_config = SweepConfig {
        interval: config.sweep_interval,
        retention: config.retention_window,
    };
    tokio::spawn(run_retention_sweep(
        pool.clone(),
        sweep_config,
        shutdown_tx.subscribe(),
    ));

    start_compensation_consumer(bus.clone(), pool.clone(), shutdown_tx.subscribe()).await;

    tracing::info!("Identity workers started");

    tokio::signal::ctrl_c()
        .await
        .expect("Failed to listen for shutdown signal");

    tracing::info!("Shutdown signal received, stopping workers");
    let _ = shutdown_tx.send(());

    // Give workers a moment to finish their current tick.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
}
