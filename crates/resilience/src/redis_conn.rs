use crate::error::InfraError;
use crate::pool::Connector;
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use tracing::info;

/// Opens multiplexed Redis connections. The connection is cloned per query.
pub struct RedisConnector {
    client: redis::Client,
    url: String,
}

impl RedisConnector {
    pub fn new(url: &str) -> Result<Self, InfraError> {
        let client = redis::Client::open(url)?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl Connector for RedisConnector {
    type Conn = MultiplexedConnection;

    fn name(&self) -> &str {
        "redis"
    }

    async fn connect(&self) -> Result<MultiplexedConnection, InfraError> {
        info!(url = %self.url, "Connecting to Redis");
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        // Verify connectivity
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        info!(response = %pong, "Redis connection established");
        Ok(conn)
    }
}
