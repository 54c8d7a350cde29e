use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use envconfig::Envconfig;
use sqlx::postgres::PgPoolOptions;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use merge_committer::checkpoint::FileCheckpointStore;
use merge_committer::config::Config;
use merge_committer::controller::Controller;
use merge_committer::lock::PgLockService;
use merge_committer::server::{router, serve, setup_metrics_recorder, ControllerHealth};
use merge_committer::source::KafkaStreamSource;
use merge_committer::store::PgTableStore;

async fn shutdown(cancel: CancellationToken) -> Result<()> {
    let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())
        .context("failed to register SIGTERM handler")?;
    let mut interrupt = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .context("failed to register SIGINT handler")?;

    tokio::select! {
        _ = term.recv() => {},
        _ = interrupt.recv() => {},
        _ = cancel.cancelled() => return Ok(()),
    };

    info!("Shutting down gracefully...");
    cancel.cancel();
    Ok(())
}

fn init_tracing(json: bool) {
    let log_layer = if json {
        fmt::layer()
            .json()
            .with_filter(EnvFilter::from_default_env())
            .boxed()
    } else {
        fmt::layer()
            .with_target(true)
            .with_filter(EnvFilter::from_default_env())
            .boxed()
    };

    tracing_subscriber::registry().with(log_layer).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::init_with_defaults()
        .context("Failed to load configuration from environment variables")?;
    init_tracing(config.log_json);

    let controller_config = config
        .controller_config()
        .context("Invalid controller configuration")?;
    let decoder = config.event_decoder().context("Invalid event configuration")?;
    info!(
        table = %controller_config.table,
        controller_id = %controller_config.controller_id,
        topic = %config.kafka_topic,
        "starting merge committer"
    );

    let health = ControllerHealth::new();
    let recorder = setup_metrics_recorder().context("Failed to install metrics recorder")?;
    let app = router(health.clone(), recorder);
    let bind = config.bind_address();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = serve(app, &bind).await {
            error!(error = ?e, "metrics server exited");
        }
    });

    let pool = PgPoolOptions::new()
        .max_connections(config.max_pg_connections)
        .acquire_timeout(Duration::from_secs(10))
        .connect(&config.database_url)
        .await
        .context("Failed to connect to Postgres")?;

    let locks = PgLockService::new(pool.clone(), &config.lock_table_name)
        .context("Invalid LOCK_TABLE_NAME")?;
    locks
        .ensure_table()
        .await
        .context("Failed to create lock table")?;

    let source = KafkaStreamSource::new(config.kafka_source_config(), decoder)
        .context("Failed to create Kafka consumer")?;

    let mut controller = Controller::new(
        controller_config,
        source,
        Arc::new(locks),
        Arc::new(PgTableStore::new(pool)),
        Arc::new(FileCheckpointStore::new(&config.checkpoint_path)),
    )
    .with_health(health);

    let cancel = CancellationToken::new();
    let shutdown_handle = tokio::spawn(shutdown(cancel.clone()));

    let result = controller.run(&cancel).await;

    cancel.cancel();
    drop(shutdown_handle.await);
    server_handle.abort();

    let summary = result.context("Controller halted")?;
    info!(
        batches = summary.batches,
        committed = summary.committed,
        rows = summary.rows,
        "merge committer stopped"
    );
    Ok(())
}
