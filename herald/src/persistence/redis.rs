use anyhow::Context;
use async_trait::async_trait;
use ::redis::aio::ConnectionManager;
use ::redis::{
    AsyncCommands, ConnectionAddr, ConnectionInfo, IntoConnectionInfo,
    RedisConnectionInfo,
};
use tracing::debug;

use crate::config::StoreConfig;
use crate::job::{DueEntry, DueTime, JobId};
use crate::queue::{DueQueue, KeySpace, PayloadStore};

/// Redis-backed due-time queue and payload store.
///
/// The queue is a sorted set scored by due time in Unix seconds; payloads are
/// plain string keys. Claiming is a single `ZREM`, which Redis executes
/// atomically, so concurrent workers never both observe a removal.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    keys: KeySpace,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").field("keys", &self.keys).finish()
    }
}

impl RedisStore {
    /// Open a managed connection to `url`.
    pub async fn connect(url: &str, keys: KeySpace) -> anyhow::Result<Self> {
        let info = url
            .into_connection_info()
            .with_context(|| format!("invalid redis url {url}"))?;
        Self::connect_with(info, keys).await
    }

    pub async fn from_config(
        config: &StoreConfig,
        keys: KeySpace,
    ) -> anyhow::Result<Self> {
        match config.url() {
            Some(url) => Self::connect(url, keys).await,
            None => Self::connect_with(connection_info(config), keys).await,
        }
    }

    async fn connect_with(
        info: ConnectionInfo,
        keys: KeySpace,
    ) -> anyhow::Result<Self> {
        let client = ::redis::Client::open(info)
            .context("invalid redis connection settings")?;
        let conn = ConnectionManager::new(client)
            .await
            .context("failed to connect to redis")?;
        Ok(Self { conn, keys })
    }

    pub fn keys(&self) -> &KeySpace {
        &self.keys
    }

    /// Round-trip a `PING`.
    pub async fn ping(&self) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let reply: String = ::redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .context("redis ping failed")?;
        debug!(reply = %reply, "redis ping");
        Ok(())
    }
}

/// Connection settings from discrete host, port, password and database
/// fields.
fn connection_info(config: &StoreConfig) -> ConnectionInfo {
    ConnectionInfo {
        addr: ConnectionAddr::Tcp(config.host.clone(), config.port),
        redis: RedisConnectionInfo {
            db: i64::from(config.database),
            password: config.password().map(str::to_string),
            ..RedisConnectionInfo::default()
        },
    }
}

#[async_trait]
impl DueQueue for RedisStore {
    async fn due(
        &self,
        now: DueTime,
        limit: usize,
    ) -> anyhow::Result<Vec<DueEntry>> {
        let mut conn = self.conn.clone();
        let count = isize::try_from(limit).unwrap_or(isize::MAX);
        let rows: Vec<(String, f64)> = conn
            .zrangebyscore_limit_withscores(
                self.keys.queue_key(),
                "-inf",
                now.as_secs(),
                0,
                count,
            )
            .await
            .context("ZRANGEBYSCORE failed")?;

        Ok(rows
            .into_iter()
            .map(|(id, score)| DueEntry::new(id, DueTime(score)))
            .collect())
    }

    async fn claim(&self, job_id: &JobId) -> anyhow::Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn
            .zrem(self.keys.queue_key(), job_id.as_str())
            .await
            .with_context(|| format!("ZREM failed for job {job_id}"))?;
        Ok(removed == 1)
    }

    async fn schedule(
        &self,
        job_id: &JobId,
        due_time: DueTime,
    ) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .zadd(self.keys.queue_key(), job_id.as_str(), due_time.as_secs())
            .await
            .with_context(|| format!("ZADD failed for job {job_id}"))?;
        Ok(())
    }

    async fn depth(&self) -> anyhow::Result<usize> {
        let mut conn = self.conn.clone();
        let depth: usize = conn
            .zcard(self.keys.queue_key())
            .await
            .context("ZCARD failed")?;
        Ok(depth)
    }
}

#[async_trait]
impl PayloadStore for RedisStore {
    async fn fetch(&self, key: &str) -> anyhow::Result<Option<String>> {
        let mut conn = self.conn.clone();
        conn.get(key)
            .await
            .with_context(|| format!("GET failed for {key}"))
    }

    async fn put(&self, key: &str, value: &str) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .set(key, value)
            .await
            .with_context(|| format!("SET failed for {key}"))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .del(key)
            .await
            .with_context(|| format!("DEL failed for {key}"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_rejects_invalid_url() {
        let err = RedisStore::connect("not a url", KeySpace::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("invalid redis url"));
    }

    #[test]
    fn test_connection_info_passes_password_unescaped() {
        let config = StoreConfig {
            host: "cache.internal".to_string(),
            port: 6380,
            password: Some("p@ss/w#rd:%2F".to_string()),
            database: 3,
        };
        let info = connection_info(&config);
        match &info.addr {
            ConnectionAddr::Tcp(host, port) => {
                assert_eq!(host, "cache.internal");
                assert_eq!(*port, 6380);
            }
            other => panic!("unexpected address {other:?}"),
        }
        assert_eq!(info.redis.password.as_deref(), Some("p@ss/w#rd:%2F"));
        assert_eq!(info.redis.db, 3);
        assert!(::redis::Client::open(info).is_ok());
    }

    #[test]
    fn test_connection_info_omits_empty_password() {
        let config = StoreConfig {
            password: Some(String::new()),
            ..StoreConfig::default()
        };
        assert_eq!(connection_info(&config).redis.password, None);
    }

    /// Requires a local Redis; run with `cargo test -- --ignored`.
    #[tokio::test]
    #[ignore]
    async fn test_claim_is_exclusive_against_live_redis() {
        let keys = KeySpace::new("herald_test_queue", "herald_test:data:");
        let store = RedisStore::connect("redis://127.0.0.1:6379", keys)
            .await
            .unwrap();
        store.ping().await.unwrap();

        let job_id = JobId::generate();
        store.schedule(&job_id, DueTime(1.0)).await.unwrap();
        assert!(store
            .due(DueTime(2.0), 100)
            .await
            .unwrap()
            .iter()
            .any(|entry| entry.job_id == job_id));

        let (a, b) = tokio::join!(store.claim(&job_id), store.claim(&job_id));
        assert!(a.unwrap() ^ b.unwrap());
    }
}
