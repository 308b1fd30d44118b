use anyhow::Context;
use processing_state::{PgProcessingStateStore, ProcessingStateStore};
use profile_service::{
    config::{LogFormat, ServiceMode},
    jobs::{RebuildJob, StateSweeperJob},
    services::CoordinatorSettings,
    storage::{
        EmbeddingProvider, OpenAiEmbeddingProvider, PgObservationStore, QdrantVectorStore,
        VectorStore,
    },
    CategoryClassifier, Config, IngestionCoordinator, ShardRouter, UserLockRegistry,
};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env().context("Failed to load config")?;

    init_tracing(config.log_format);

    info!(
        service = %config.service_name,
        mode = ?config.mode,
        shards = config.ingestion.shard_count,
        "Starting"
    );

    match config.mode {
        ServiceMode::Worker => run_worker(&config).await,
        ServiceMode::SetupCategories => run_setup_categories(&config).await,
        ServiceMode::Rebuild => run_rebuild(&config).await,
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
        LogFormat::Text => registry.with(fmt::layer()).init(),
    }
}

async fn connect_database(config: &Config) -> anyhow::Result<sqlx::PgPool> {
    PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect(&config.database.url)
        .await
        .context("Failed to connect to PostgreSQL")
}

async fn processing_state_store(
    config: &Config,
    pool: sqlx::PgPool,
) -> anyhow::Result<Arc<PgProcessingStateStore>> {
    let store = PgProcessingStateStore::new(pool, config.ingestion.processing_timeout());
    store
        .ensure_schema()
        .await
        .context("Failed to prepare processing_history")?;
    Ok(Arc::new(store))
}

async fn vector_store(
    config: &Config,
    dimension: usize,
) -> anyhow::Result<Arc<QdrantVectorStore>> {
    let store = QdrantVectorStore::new(&config.qdrant)?;
    store
        .ensure_collection(&config.qdrant.log_collection, dimension)
        .await?;
    store
        .ensure_collection(&config.qdrant.profile_collection, dimension)
        .await?;
    Ok(Arc::new(store))
}

async fn run_worker(config: &Config) -> anyhow::Result<()> {
    let pool = connect_database(config).await?;
    let states = processing_state_store(config, pool.clone()).await?;

    let observations = PgObservationStore::new(pool, ShardRouter::new(config.ingestion.shard_count));
    observations
        .ensure_schema()
        .await
        .context("Failed to prepare observation tables")?;

    let sweeper = StateSweeperJob::new(states, Duration::from_secs(config.sweeper.interval_secs));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(async move { sweeper.run(shutdown_rx).await });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    // The receiver may already be gone if the sweeper exited on its own
    let _ = shutdown_tx.send(true);
    handle.await.context("Sweeper task panicked")?;

    Ok(())
}

async fn run_setup_categories(config: &Config) -> anyhow::Result<()> {
    let embedder = OpenAiEmbeddingProvider::new(&config.embedding)?;
    let vectors = vector_store(config, embedder.dimension()).await?;

    let seeded =
        CategoryClassifier::seed(vectors.as_ref(), &embedder, &config.qdrant.log_collection)
            .await?;

    let verification =
        CategoryClassifier::verify(vectors.as_ref(), &config.qdrant.log_collection).await?;
    if verification.is_complete() {
        info!(seeded, found = verification.found, "Category setup complete");
    } else {
        warn!(
            seeded,
            found = verification.found,
            missing = ?verification.missing,
            "Category setup incomplete"
        );
    }

    Ok(())
}

async fn run_rebuild(config: &Config) -> anyhow::Result<()> {
    let user_ids = config.rebuild_users();
    if user_ids.is_empty() {
        warn!("REBUILD_USER_IDS is empty, nothing to do");
        return Ok(());
    }

    let pool = connect_database(config).await?;
    let states: Arc<dyn ProcessingStateStore> = processing_state_store(config, pool.clone()).await?;

    let observations = PgObservationStore::new(pool, ShardRouter::new(config.ingestion.shard_count));
    observations
        .ensure_schema()
        .await
        .context("Failed to prepare observation tables")?;

    let embedder: Arc<dyn EmbeddingProvider> =
        Arc::new(OpenAiEmbeddingProvider::new(&config.embedding)?);
    let vectors = vector_store(config, embedder.dimension()).await?;

    let classifier =
        CategoryClassifier::load(vectors.as_ref(), &config.qdrant.log_collection).await?;
    if classifier.is_empty() {
        warn!("No category vectors found; run MODE=setup-categories to enable tagging");
    }

    let coordinator = Arc::new(IngestionCoordinator::new(
        states,
        Arc::new(observations),
        vectors,
        embedder,
        Arc::new(classifier),
        Arc::new(UserLockRegistry::new(
            Duration::from_secs(config.locks.max_idle_secs),
            config.locks.capacity,
        )),
        CoordinatorSettings::from_config(config),
    ));

    let stats = RebuildJob::new(coordinator).run(&user_ids).await;
    if stats.users_failed > 0 {
        anyhow::bail!("{} of {} rebuilds failed", stats.users_failed, stats.users_processed);
    }

    Ok(())
}
