//! Courier notification worker binary entrypoint.

use std::sync::Arc;
use std::time::Duration;

use courier_common::config::AppConfig;
use courier_common::db;
use courier_common::redis_pool::create_redis_pool;

use courier_notifier::batch::{BatchConfig, BatchProcessor};
use courier_notifier::channels::ProviderRegistry;
use courier_notifier::dispatch::{DispatchConfig, DispatchService};
use courier_notifier::queue::JobQueue;
use courier_notifier::store::PgNotificationStore;
use courier_notifier::worker::NotificationWorker;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "courier_notifier=info,courier_common=info".into()),
        )
        .json()
        .init();

    tracing::info!("Courier worker starting...");

    let config = AppConfig::from_env()?;

    let pool = db::create_pool(&config.database_url, config.db_max_connections).await?;
    db::migrate(&pool).await?;

    let redis = create_redis_pool(&config.redis_url).await?;
    // Dedicated connection for blocking pops.
    let blocking = create_redis_pool(&config.redis_url).await?;

    let store = Arc::new(PgNotificationStore::new(pool));
    let providers = ProviderRegistry::from_config(&config, redis.clone())?;

    let dispatcher = DispatchService::new(
        store.clone(),
        store,
        providers,
        DispatchConfig::from(&config),
    );
    let batch = BatchProcessor::new(dispatcher.clone(), BatchConfig::from(&config));

    let worker = NotificationWorker::new(
        JobQueue::new(redis, blocking),
        dispatcher,
        batch,
        config.worker_concurrency,
        Duration::from_secs(config.batch_timeout_secs),
    );

    // Run with graceful shutdown on Ctrl+C
    tokio::select! {
        result = worker.run() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Worker exited with error");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal, stopping gracefully...");
        }
    }

    tracing::info!("Courier worker stopped.");
    Ok(())
}
