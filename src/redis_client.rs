use anyhow::{Context, Result};
use redis::aio::ConnectionManager;
use redis::Client;

/// Shared redis handles.
///
/// The `ConnectionManager` multiplexes commands (SET/GET/INCR/XADD/...);
/// pub/sub needs dedicated connections, so the raw `Client` is kept for
/// opening those on demand.
#[derive(Clone)]
pub struct RedisHandle {
    pub client: Client,
    pub manager: ConnectionManager,
}

pub async fn init_redis(redis_url: &str) -> Result<RedisHandle> {
    let client = Client::open(redis_url).context("invalid redis URL")?;
    let manager = ConnectionManager::new(client.clone())
        .await
        .context("failed to connect to redis")?;

    log::info!("Redis connection established");

    Ok(RedisHandle { client, manager })
}
