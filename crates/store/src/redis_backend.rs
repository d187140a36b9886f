//! Redis backend. Multi-key atomicity comes from Lua scripts, each a single
//! round trip through the resilient pool.

use crate::backend::{KvBackend, ReadSet, WriteSet};
use async_trait::async_trait;
use redis::{AsyncCommands, Script};
use std::sync::Arc;
use tracker_core::{TrackerError, TrackerResult};
use tracker_resilience::{InfraError, RedisConnector, ResilientPool};

const CURSOR_SCRIPT: &str = r"
local len = tonumber(ARGV[1])
local cur = tonumber(redis.call('GET', KEYS[1]) or '0')
local nxt = (cur + 1) % len
redis.call('SET', KEYS[1], nxt)
return nxt
";

// KEYS[1..n] are read keys, KEYS[n+1..] write keys; ARGV[i+1] pairs with KEYS[i].
// An absent read key is expected as ''.
const COMMIT_SCRIPT: &str = r"
local n = tonumber(ARGV[1])
for i = 1, n do
  local cur = redis.call('GET', KEYS[i])
  if not cur then cur = '' end
  if cur ~= ARGV[i + 1] then return 0 end
end
for i = n + 1, #KEYS do
  redis.call('SET', KEYS[i], ARGV[i + 1])
end
return 1
";

pub struct RedisBackend {
    pool: Arc<ResilientPool<RedisConnector>>,
    cursor_script: Script,
    commit_script: Script,
}

impl RedisBackend {
    pub fn new(pool: Arc<ResilientPool<RedisConnector>>) -> Self {
        Self {
            pool,
            cursor_script: Script::new(CURSOR_SCRIPT),
            commit_script: Script::new(COMMIT_SCRIPT),
        }
    }

    pub fn pool(&self) -> &Arc<ResilientPool<RedisConnector>> {
        &self.pool
    }
}

#[async_trait]
impl KvBackend for RedisBackend {
    async fn get(&self, key: &str) -> TrackerResult<Option<String>> {
        let value = self
            .pool
            .query(|mut conn| async move { conn.get::<_, Option<String>>(key).await.map_err(InfraError::from) })
            .await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str) -> TrackerResult<()> {
        self.pool
            .query(|mut conn| async move { conn.set::<_, _, ()>(key, value).await.map_err(InfraError::from) })
            .await?;
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str) -> TrackerResult<bool> {
        let reply = self
            .pool
            .query(|mut conn| async move {
                redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("NX")
                    .query_async::<_, Option<String>>(&mut conn)
                    .await
                    .map_err(InfraError::from)
            })
            .await?;
        Ok(reply.is_some())
    }

    async fn advance_cursor(&self, key: &str, len: usize) -> TrackerResult<usize> {
        if len == 0 {
            return Err(TrackerError::Validation("cursor over empty list".into()));
        }
        let script = &self.cursor_script;
        let next = self
            .pool
            .query(|mut conn| async move {
                script
                    .key(key)
                    .arg(len)
                    .invoke_async::<_, usize>(&mut conn)
                    .await
                    .map_err(InfraError::from)
            })
            .await?;
        Ok(next)
    }

    async fn commit(&self, reads: &ReadSet, writes: &WriteSet) -> TrackerResult<bool> {
        let script = &self.commit_script;
        let applied = self
            .pool
            .query(|mut conn| async move {
                let mut invocation = script.prepare_invoke();
                invocation.arg(reads.len());
                for (key, seen) in reads {
                    invocation.key(key).arg(seen.as_deref().unwrap_or(""));
                }
                for (key, value) in writes {
                    invocation.key(key).arg(value);
                }
                invocation
                    .invoke_async::<_, i64>(&mut conn)
                    .await
                    .map_err(InfraError::from)
            })
            .await?;
        metrics::counter!("store.commits", "applied" => if applied == 1 { "yes" } else { "no" }).increment(1);
        Ok(applied == 1)
    }
}
