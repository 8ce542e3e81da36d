use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;

#[derive(Debug, Clone)]
pub struct KvConfig {
    pub host: String,
    pub port: u16,
    pub db: i64,
    pub password: Option<String>,
}

impl Default for KvConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            db: 0,
            password: None,
        }
    }
}

/// Shared KV-store handle. All cross-replica coordination (rate windows, the spend
/// queue and its lease, the deployment cache) goes through here.
#[derive(Clone)]
pub struct Kv {
    client: redis::Client,
}

impl Kv {
    pub fn connect(config: &KvConfig) -> Result<Self, redis::RedisError> {
        let url = match &config.password {
            Some(password) => format!(
                "redis://:{password}@{}:{}/{}",
                config.host, config.port, config.db
            ),
            None => format!("redis://{}:{}/{}", config.host, config.port, config.db),
        };
        Ok(Self {
            client: redis::Client::open(url)?,
        })
    }

    pub async fn connection(&self) -> Result<MultiplexedConnection, redis::RedisError> {
        self.client.get_multiplexed_async_connection().await
    }

    pub async fn ping(&self) -> Result<(), redis::RedisError> {
        let mut conn = self.connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    /// SCAN-based wildcard delete; returns how many keys were removed.
    pub async fn delete_pattern(&self, pattern: &str) -> Result<u64, redis::RedisError> {
        let mut conn = self.connection().await?;
        let mut deleted = 0u64;
        let mut cursor: u64 = 0;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await?;
            if !keys.is_empty() {
                let removed: u64 = conn.del(&keys).await?;
                deleted += removed;
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(deleted)
    }
}
