use redis::Client;
use redis::aio::ConnectionManager;

/// Create a Redis connection manager shared by the job queue and the in-app
/// publisher, verifying the server answers before workers start.
pub async fn create_redis_pool(redis_url: &str) -> anyhow::Result<ConnectionManager> {
    let client = Client::open(redis_url)?;
    let mut manager = ConnectionManager::new(client).await?;

    let pong: String = redis::cmd("PING").query_async(&mut manager).await?;
    tracing::info!(reply = %pong, "Connected to Redis");
    Ok(manager)
}
