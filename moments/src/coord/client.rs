//! Typed accessor over the coordination store primitives.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{
    StreamAutoClaimOptions, StreamAutoClaimReply, StreamReadOptions, StreamReadReply,
};
use redis::{AsyncCommands, Script};
use tracing::debug;

use crate::Result;

/// One entry read from a stream, with its fields flattened to strings.
#[derive(Debug, Clone)]
pub struct StreamEntry {
    pub id: String,
    pub fields: HashMap<String, String>,
}

/// The primitives the coordination store must offer.
///
/// Production uses the Redis backend; unit tests exercise the same contracts
/// against [`crate::coord::memory::MemoryCoord`].
#[async_trait]
pub trait CoordBackend: Send + Sync {
    async fn set_nx_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<bool>;
    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()>;
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn del(&self, key: &str) -> Result<()>;
    async fn exists(&self, key: &str) -> Result<bool>;
    async fn expire_if_matches(&self, key: &str, expected: &str, ttl_secs: u64) -> Result<bool>;
    async fn del_if_matches(&self, key: &str, expected: &str) -> Result<bool>;
    async fn set_if_matches(
        &self,
        key: &str,
        expected: &str,
        value: &str,
        ttl_secs: u64,
    ) -> Result<bool>;

    async fn hset_multiple(&self, key: &str, fields: &[(String, String)]) -> Result<()>;
    async fn hdel(&self, key: &str, fields: &[String]) -> Result<()>;
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>>;
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>>;
    async fn hincrby(&self, key: &str, field: &str, delta: i64) -> Result<i64>;
    async fn expire(&self, key: &str, ttl_secs: i64) -> Result<()>;

    async fn sadd(&self, key: &str, member: &str) -> Result<()>;
    async fn smembers(&self, key: &str) -> Result<Vec<String>>;
    async fn scard(&self, key: &str) -> Result<u64>;

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()>;
    async fn zrev_by_score(&self, key: &str, limit: isize) -> Result<Vec<String>>;

    async fn xadd(&self, stream: &str, fields: &[(String, String)]) -> Result<String>;
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<()>;
    async fn xread_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<StreamEntry>>;
    async fn xautoclaim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        count: usize,
    ) -> Result<Vec<StreamEntry>>;
    async fn xack(&self, stream: &str, group: &str, entry_id: &str) -> Result<()>;
}

/// Shared client over the coordination store. Cheap to clone.
#[derive(Clone)]
pub struct CoordStore {
    backend: Arc<dyn CoordBackend>,
}

impl CoordStore {
    /// Connect to a Redis coordination store.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        debug!(url = %url, "Connected to coordination store");
        Ok(Self {
            backend: Arc::new(RedisCoord { conn }),
        })
    }

    /// In-process backend for tests.
    pub fn memory() -> Self {
        Self {
            backend: Arc::new(super::memory::MemoryCoord::new()),
        }
    }

    pub fn from_backend(backend: Arc<dyn CoordBackend>) -> Self {
        Self { backend }
    }

    /// Atomic set-if-absent with TTL. Returns true when the key was set.
    pub async fn set_nx_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<bool> {
        self.backend.set_nx_ex(key, value, ttl_secs).await
    }

    pub async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()> {
        self.backend.set_ex(key, value, ttl_secs).await
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        self.backend.get(key).await
    }

    pub async fn del(&self, key: &str) -> Result<()> {
        self.backend.del(key).await
    }

    pub async fn exists(&self, key: &str) -> Result<bool> {
        self.backend.exists(key).await
    }

    /// Extend a key's TTL iff its value still matches `expected` (fencing).
    pub async fn expire_if_matches(
        &self,
        key: &str,
        expected: &str,
        ttl_secs: u64,
    ) -> Result<bool> {
        self.backend.expire_if_matches(key, expected, ttl_secs).await
    }

    /// Delete a key iff its value still matches `expected` (compare-and-delete).
    pub async fn del_if_matches(&self, key: &str, expected: &str) -> Result<bool> {
        self.backend.del_if_matches(key, expected).await
    }

    /// Replace a key's value iff it still matches `expected` (compare-and-swap).
    pub async fn set_if_matches(
        &self,
        key: &str,
        expected: &str,
        value: &str,
        ttl_secs: u64,
    ) -> Result<bool> {
        self.backend.set_if_matches(key, expected, value, ttl_secs).await
    }

    pub async fn hset_multiple(&self, key: &str, fields: &[(String, String)]) -> Result<()> {
        self.backend.hset_multiple(key, fields).await
    }

    pub async fn hdel(&self, key: &str, fields: &[String]) -> Result<()> {
        self.backend.hdel(key, fields).await
    }

    pub async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        self.backend.hget(key, field).await
    }

    pub async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        self.backend.hgetall(key).await
    }

    pub async fn hincrby(&self, key: &str, field: &str, delta: i64) -> Result<i64> {
        self.backend.hincrby(key, field, delta).await
    }

    pub async fn expire(&self, key: &str, ttl_secs: i64) -> Result<()> {
        self.backend.expire(key, ttl_secs).await
    }

    pub async fn sadd(&self, key: &str, member: &str) -> Result<()> {
        self.backend.sadd(key, member).await
    }

    pub async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        self.backend.smembers(key).await
    }

    pub async fn scard(&self, key: &str) -> Result<u64> {
        self.backend.scard(key).await
    }

    pub async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()> {
        self.backend.zadd(key, member, score).await
    }

    /// Highest-scored members first, up to `limit`.
    pub async fn zrev_by_score(&self, key: &str, limit: isize) -> Result<Vec<String>> {
        self.backend.zrev_by_score(key, limit).await
    }

    pub async fn xadd(&self, stream: &str, fields: &[(String, String)]) -> Result<String> {
        self.backend.xadd(stream, fields).await
    }

    /// Idempotently create a consumer group at the stream tail.
    pub async fn ensure_group(&self, stream: &str, group: &str) -> Result<()> {
        self.backend.ensure_group(stream, group).await
    }

    /// Blocking consumer-group read of new entries.
    pub async fn xread_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<StreamEntry>> {
        self.backend
            .xread_group(stream, group, consumer, count, block_ms)
            .await
    }

    /// Claim pending entries idle longer than `min_idle_ms` for `consumer`.
    pub async fn xautoclaim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        count: usize,
    ) -> Result<Vec<StreamEntry>> {
        self.backend
            .xautoclaim(stream, group, consumer, min_idle_ms, count)
            .await
    }

    pub async fn xack(&self, stream: &str, group: &str, entry_id: &str) -> Result<()> {
        self.backend.xack(stream, group, entry_id).await
    }
}

struct RedisCoord {
    conn: ConnectionManager,
}

#[async_trait]
impl CoordBackend for RedisCoord {
    async fn set_nx_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.set_ex(key, value, ttl_secs).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.get(key).await?)
    }

    async fn del(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(key).await?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        Ok(conn.exists(key).await?)
    }

    async fn expire_if_matches(&self, key: &str, expected: &str, ttl_secs: u64) -> Result<bool> {
        const LUA: &str = r#"
            if redis.call('GET', KEYS[1]) == ARGV[1] then
                return redis.call('EXPIRE', KEYS[1], ARGV[2])
            end
            return 0
        "#;
        let mut conn = self.conn.clone();
        let updated: i64 = Script::new(LUA)
            .key(key)
            .arg(expected)
            .arg(ttl_secs)
            .invoke_async(&mut conn)
            .await?;
        Ok(updated == 1)
    }

    async fn del_if_matches(&self, key: &str, expected: &str) -> Result<bool> {
        const LUA: &str = r#"
            if redis.call('GET', KEYS[1]) == ARGV[1] then
                return redis.call('DEL', KEYS[1])
            end
            return 0
        "#;
        let mut conn = self.conn.clone();
        let deleted: i64 = Script::new(LUA)
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted == 1)
    }

    async fn set_if_matches(
        &self,
        key: &str,
        expected: &str,
        value: &str,
        ttl_secs: u64,
    ) -> Result<bool> {
        const LUA: &str = r#"
            if redis.call('GET', KEYS[1]) == ARGV[1] then
                redis.call('SET', KEYS[1], ARGV[2], 'EX', ARGV[3])
                return 1
            end
            return 0
        "#;
        let mut conn = self.conn.clone();
        let swapped: i64 = Script::new(LUA)
            .key(key)
            .arg(expected)
            .arg(value)
            .arg(ttl_secs)
            .invoke_async(&mut conn)
            .await?;
        Ok(swapped == 1)
    }

    async fn hset_multiple(&self, key: &str, fields: &[(String, String)]) -> Result<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let _: () = conn.hset_multiple(key, fields).await?;
        Ok(())
    }

    async fn hdel(&self, key: &str, fields: &[String]) -> Result<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let _: () = conn.hdel(key, fields).await?;
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.hget(key, field).await?)
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        let mut conn = self.conn.clone();
        Ok(conn.hgetall(key).await?)
    }

    async fn hincrby(&self, key: &str, field: &str, delta: i64) -> Result<i64> {
        let mut conn = self.conn.clone();
        Ok(conn.hincr(key, field, delta).await?)
    }

    async fn expire(&self, key: &str, ttl_secs: i64) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.expire(key, ttl_secs).await?;
        Ok(())
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.sadd(key, member).await?;
        Ok(())
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.smembers(key).await?)
    }

    async fn scard(&self, key: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        Ok(conn.scard(key).await?)
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.zadd(key, member, score).await?;
        Ok(())
    }

    async fn zrev_by_score(&self, key: &str, limit: isize) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        Ok(conn
            .zrevrangebyscore_limit(key, "+inf", "-inf", 0, limit)
            .await?)
    }

    async fn xadd(&self, stream: &str, fields: &[(String, String)]) -> Result<String> {
        let mut conn = self.conn.clone();
        Ok(conn.xadd(stream, "*", fields).await?)
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let created: redis::RedisResult<()> =
            conn.xgroup_create_mkstream(stream, group, "$").await;
        match created {
            Ok(()) => Ok(()),
            // BUSYGROUP: the group already exists, which is fine.
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn xread_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<StreamEntry>> {
        let mut conn = self.conn.clone();
        let opts = StreamReadOptions::default()
            .group(group, consumer)
            .count(count)
            .block(block_ms as usize);
        let reply: StreamReadReply = conn.xread_options(&[stream], &[">"], &opts).await?;

        let mut entries = Vec::new();
        for key in reply.keys {
            for id in key.ids {
                entries.push(StreamEntry {
                    id: id.id.clone(),
                    fields: flatten_fields(&id.map),
                });
            }
        }
        Ok(entries)
    }

    async fn xautoclaim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        count: usize,
    ) -> Result<Vec<StreamEntry>> {
        let mut conn = self.conn.clone();
        let opts = StreamAutoClaimOptions::default().count(count);
        let reply: StreamAutoClaimReply = conn
            .xautoclaim_options(stream, group, consumer, min_idle_ms as usize, "0-0", opts)
            .await?;

        Ok(reply
            .claimed
            .iter()
            .map(|id| StreamEntry {
                id: id.id.clone(),
                fields: flatten_fields(&id.map),
            })
            .collect())
    }

    async fn xack(&self, stream: &str, group: &str, entry_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.xack(stream, group, &[entry_id]).await?;
        Ok(())
    }
}

fn flatten_fields(map: &HashMap<String, redis::Value>) -> HashMap<String, String> {
    map.iter()
        .filter_map(|(k, v)| {
            redis::from_redis_value::<String>(v)
                .ok()
                .map(|s| (k.clone(), s))
        })
        .collect()
}
