use sea_orm::Database;
use sea_orm_migration::MigratorTrait;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use transfer_analytics::config::IndexerConfig;
use transfer_analytics::jobs::summary_rollup::start_summary_rollup_job;
use transfer_analytics::jobs::till_date_snapshot::start_till_date_snapshot_job;
use transfer_analytics::services::alloy_transport::{AlloyWsTransport, TransferContract};
use transfer_analytics::services::chain_listener::ChainListener;
use transfer_analytics::services::result_cache::{MokaResultCache, RedisResultCache, ResultCache};
use transfer_analytics::services::transaction_store::{SeaOrmTransactionStore, TransactionStore};
use transfer_analytics::services::transfer_analytics::TransferAnalytics;
use transfer_analytics::AppState;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,transfer_analytics=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load environment variables
    dotenvy::dotenv().ok();
    let config = IndexerConfig::from_env()?;

    tracing::info!("Connecting to database...");
    let db = Database::connect(&config.database_url).await?;

    tracing::info!("Running migrations...");
    migration::Migrator::up(&db, None).await?;

    let cache: Arc<dyn ResultCache> = match &config.redis {
        Some(redis) => {
            tracing::info!(host = %redis.host, port = redis.port, "Using redis result cache");
            Arc::new(RedisResultCache::connect(&redis.host, redis.port).await?)
        }
        None => {
            tracing::info!("REDIS_HOST not set, using in-process result cache");
            Arc::new(MokaResultCache::new())
        }
    };

    let store: Arc<dyn TransactionStore> = Arc::new(SeaOrmTransactionStore::new(db));
    let analytics = Arc::new(TransferAnalytics::new(
        store.clone(),
        cache,
        config.analytics_settings(),
    ));
    let state = AppState {
        analytics: analytics.clone(),
    };

    // Startup-fatal: no retry until the first subscription is live
    let contract = TransferContract::from_config(
        &config.token_contract_address,
        config.token_abi.as_deref(),
    )?;
    let transport = AlloyWsTransport::new(&config.chain_ws_url, contract)?;
    let listener = ChainListener::new(transport, store, config.token_decimals, config.reconnect)
        .start()
        .await?;

    let summary_job = start_summary_rollup_job(state.analytics.clone(), config.summary_interval).await;
    let snapshot_job =
        start_till_date_snapshot_job(state.analytics.clone(), config.snapshot_hour_utc).await;

    tracing::info!("Transfer analytics indexer running");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");

    listener.abort();
    let _ = tokio::join!(summary_job, snapshot_job);

    Ok(())
}
