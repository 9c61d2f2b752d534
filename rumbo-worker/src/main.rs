use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use rumbo_core::clock::SystemClock;
use rumbo_engine::{Engine, EngineStores};
use rumbo_store::app_config::Config;
use rumbo_store::{
    BroadcastNotificationSink, DbClient, PgHistoryStore, PgReservationLedger, PgReservationStore,
    PgTripStore, PgViolationStore,
};
use rumbo_worker::worker::{spawn_notification_logger, spawn_sweep_worker, SweepKind};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rumbo_worker=debug,rumbo_engine=info,rumbo_store=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load().context("Failed to load config")?;
    tracing::info!("Starting Rumbo worker");

    // Postgres
    let db = DbClient::new(&config.database.url, config.database.max_connections)
        .await
        .context("Failed to connect to Postgres")?;
    db.migrate().await.context("Failed to run migrations")?;

    let rules = db
        .fetch_engine_rules(config.rules.clone())
        .await
        .context("Failed to load engine rule overrides")?;

    let pool = db.pool.clone();
    let stores = EngineStores {
        trips: Arc::new(PgTripStore::new(pool.clone())),
        reservations: Arc::new(PgReservationStore::new(pool.clone())),
        history: Arc::new(PgHistoryStore::new(pool.clone())),
        violations: Arc::new(PgViolationStore::new(pool.clone())),
        ledger: Arc::new(PgReservationLedger::new(pool)),
    };

    // Notification intents go out on a broadcast channel
    let sink = BroadcastNotificationSink::new(config.notifications.channel_capacity);
    let logger = spawn_notification_logger(sink.subscribe());

    let engine = Engine::new(stores, Arc::new(sink), Arc::new(SystemClock), rules)
        .context("Invalid engine rules")?;

    let scheduler = &config.scheduler;
    let workers = vec![
        spawn_sweep_worker(
            engine.sweeper.clone(),
            SweepKind::NoShows,
            Duration::from_secs(scheduler.no_show_interval_secs),
        ),
        spawn_sweep_worker(
            engine.sweeper.clone(),
            SweepKind::ForgottenClosures,
            Duration::from_secs(scheduler.forgotten_closure_interval_secs),
        ),
        spawn_sweep_worker(
            engine.sweeper.clone(),
            SweepKind::ViolationExpiry,
            Duration::from_secs(scheduler.violation_expiry_interval_secs),
        ),
    ];

    tokio::signal::ctrl_c().await.context("Failed to listen for shutdown")?;
    tracing::info!("Shutting down");

    for worker in workers {
        worker.abort();
    }
    logger.abort();
    Ok(())
}
