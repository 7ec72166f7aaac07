use redis::Client;
use redis::aio::ConnectionManager;

/// Connect to the Redis instance backing the counter store, the delivery
/// queues and the socket broadcast channel.
///
/// A `PING` is issued up front so a misconfigured URL fails at startup rather
/// than on the first counter update.
pub async fn create_redis_pool(redis_url: &str) -> anyhow::Result<ConnectionManager> {
    let client = Client::open(redis_url)?;
    let mut manager = ConnectionManager::new(client).await?;

    let pong: String = redis::cmd("PING").query_async(&mut manager).await?;
    tracing::info!(reply = %pong, "Connected to Redis");
    Ok(manager)
}
