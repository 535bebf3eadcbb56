use std::{future::Future, time::Duration};

use anyhow::Context;
use async_trait::async_trait;
use deadpool_redis::{Config, Connection, Pool, PoolConfig, Runtime, Timeouts};
use redis::AsyncCommands;

use super::CacheStore;
use crate::config::RedisConfig;

const SCAN_BATCH: usize = 200;

/// Redis-backed cache over a `deadpool-redis` pool.
#[derive(Clone)]
pub struct RedisCache {
    pool: Pool,
    op_timeout: Duration,
}

impl RedisCache {
    pub fn new(cfg: &RedisConfig) -> anyhow::Result<Self> {
        let op_timeout = Duration::from_millis(cfg.timeout_ms);
        let mut pool_cfg = PoolConfig::new(cfg.max_connections);
        pool_cfg.timeouts = Timeouts {
            wait: Some(op_timeout),
            create: Some(op_timeout),
            recycle: Some(op_timeout),
        };

        let mut redis_cfg = Config::from_url(cfg.url.clone());
        redis_cfg.pool = Some(pool_cfg);
        let pool = redis_cfg
            .create_pool(Some(Runtime::Tokio1))
            .context("create redis pool")?;

        Ok(Self { pool, op_timeout })
    }

    pub fn close(&self) {
        self.pool.close();
    }

    async fn conn(&self) -> anyhow::Result<Connection> {
        self.pool.get().await.context("acquire redis connection")
    }

    async fn bounded<T, F>(&self, op: &'static str, fut: F) -> anyhow::Result<T>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        tokio::time::timeout(self.op_timeout, fut)
            .await
            .with_context(|| format!("redis {op} timed out"))?
    }
}

#[async_trait]
impl CacheStore for RedisCache {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        self.bounded("GET", async {
            let mut conn = self.conn().await?;
            let value: Option<String> = conn.get(key).await.context("redis GET")?;
            Ok(value)
        })
        .await
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> anyhow::Result<()> {
        self.bounded("SETEX", async {
            let mut conn = self.conn().await?;
            let _: () = conn
                .set_ex(key, value, ttl.as_secs().max(1))
                .await
                .context("redis SETEX")?;
            Ok(())
        })
        .await
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        self.bounded("DEL", async {
            let mut conn = self.conn().await?;
            let _: () = conn.del(key).await.context("redis DEL")?;
            Ok(())
        })
        .await
    }

    async fn delete_by_pattern(&self, prefix: &str) -> anyhow::Result<u64> {
        let pattern = format!("{prefix}*");
        let mut conn = self.conn().await?;
        let mut cursor: u64 = 0;
        let mut removed = 0u64;
        loop {
            let (next, keys): (u64, Vec<String>) = self
                .bounded("SCAN", async {
                    redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(&pattern)
                        .arg("COUNT")
                        .arg(SCAN_BATCH)
                        .query_async(&mut conn)
                        .await
                        .context("redis SCAN")
                })
                .await?;
            if !keys.is_empty() {
                let n: u64 = self
                    .bounded("DEL", async { conn.del(&keys).await.context("redis DEL") })
                    .await?;
                removed += n;
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(removed)
    }

    async fn ping(&self) -> anyhow::Result<()> {
        self.bounded("PING", async {
            let mut conn = self.conn().await?;
            let _: String = redis::cmd("PING")
                .query_async(&mut conn)
                .await
                .context("redis PING")?;
            Ok(())
        })
        .await
    }
}
