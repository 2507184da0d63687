//! In-process coordination store backend.
//!
//! Implements the same contracts as the Redis backend against process-local
//! state, so the lock/status/queue/orchestrator machinery can be exercised in
//! unit tests without a server. Expiry is wall-clock based and purged lazily
//! on access.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::client::{CoordBackend, StreamEntry};
use crate::Result;

#[derive(Default)]
struct StreamGroup {
    /// Index into the stream entry log of the next entry to deliver.
    next_index: usize,
    /// Pending (delivered, unacknowledged) entries: id -> (consumer, delivered_at).
    pending: HashMap<String, (String, Instant)>,
}

#[derive(Default)]
struct StreamState {
    entries: Vec<(String, Vec<(String, String)>)>,
    seq: u64,
    groups: HashMap<String, StreamGroup>,
}

#[derive(Default)]
struct State {
    strings: HashMap<String, String>,
    hashes: HashMap<String, HashMap<String, String>>,
    sets: HashMap<String, HashSet<String>>,
    zsets: HashMap<String, Vec<(String, f64)>>,
    streams: HashMap<String, StreamState>,
    expiry: HashMap<String, Instant>,
}

impl State {
    fn purge(&mut self, key: &str) {
        if let Some(deadline) = self.expiry.get(key)
            && Instant::now() >= *deadline
        {
            self.expiry.remove(key);
            self.strings.remove(key);
            self.hashes.remove(key);
            self.sets.remove(key);
            self.zsets.remove(key);
        }
    }
}

/// Process-local [`CoordBackend`].
pub struct MemoryCoord {
    state: Mutex<State>,
}

impl MemoryCoord {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
        }
    }

    /// Force-expire a key, as if its TTL elapsed.
    pub fn expire_now(&self, key: &str) {
        let mut state = self.state.lock();
        state.strings.remove(key);
        state.hashes.remove(key);
        state.sets.remove(key);
        state.zsets.remove(key);
        state.expiry.remove(key);
    }
}

impl Default for MemoryCoord {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoordBackend for MemoryCoord {
    async fn set_nx_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<bool> {
        let mut state = self.state.lock();
        state.purge(key);
        if state.strings.contains_key(key) {
            return Ok(false);
        }
        state.strings.insert(key.to_string(), value.to_string());
        state
            .expiry
            .insert(key.to_string(), Instant::now() + Duration::from_secs(ttl_secs));
        Ok(true)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()> {
        let mut state = self.state.lock();
        state.strings.insert(key.to_string(), value.to_string());
        state
            .expiry
            .insert(key.to_string(), Instant::now() + Duration::from_secs(ttl_secs));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut state = self.state.lock();
        state.purge(key);
        Ok(state.strings.get(key).cloned())
    }

    async fn del(&self, key: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.strings.remove(key);
        state.hashes.remove(key);
        state.sets.remove(key);
        state.zsets.remove(key);
        state.expiry.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut state = self.state.lock();
        state.purge(key);
        Ok(state.strings.contains_key(key) || state.hashes.contains_key(key))
    }

    async fn expire_if_matches(&self, key: &str, expected: &str, ttl_secs: u64) -> Result<bool> {
        let mut state = self.state.lock();
        state.purge(key);
        if state.strings.get(key).map(|v| v.as_str()) == Some(expected) {
            state
                .expiry
                .insert(key.to_string(), Instant::now() + Duration::from_secs(ttl_secs));
            return Ok(true);
        }
        Ok(false)
    }

    async fn del_if_matches(&self, key: &str, expected: &str) -> Result<bool> {
        let mut state = self.state.lock();
        state.purge(key);
        if state.strings.get(key).map(|v| v.as_str()) == Some(expected) {
            state.strings.remove(key);
            state.expiry.remove(key);
            return Ok(true);
        }
        Ok(false)
    }

    async fn set_if_matches(
        &self,
        key: &str,
        expected: &str,
        value: &str,
        ttl_secs: u64,
    ) -> Result<bool> {
        let mut state = self.state.lock();
        state.purge(key);
        if state.strings.get(key).map(|v| v.as_str()) == Some(expected) {
            state.strings.insert(key.to_string(), value.to_string());
            state
                .expiry
                .insert(key.to_string(), Instant::now() + Duration::from_secs(ttl_secs));
            return Ok(true);
        }
        Ok(false)
    }

    async fn hset_multiple(&self, key: &str, fields: &[(String, String)]) -> Result<()> {
        let mut state = self.state.lock();
        state.purge(key);
        let hash = state.hashes.entry(key.to_string()).or_default();
        for (field, value) in fields {
            hash.insert(field.clone(), value.clone());
        }
        Ok(())
    }

    async fn hdel(&self, key: &str, fields: &[String]) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(hash) = state.hashes.get_mut(key) {
            for field in fields {
                hash.remove(field);
            }
        }
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        let mut state = self.state.lock();
        state.purge(key);
        Ok(state.hashes.get(key).and_then(|h| h.get(field)).cloned())
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        let mut state = self.state.lock();
        state.purge(key);
        Ok(state.hashes.get(key).cloned().unwrap_or_default())
    }

    async fn hincrby(&self, key: &str, field: &str, delta: i64) -> Result<i64> {
        let mut state = self.state.lock();
        state.purge(key);
        let hash = state.hashes.entry(key.to_string()).or_default();
        let current: i64 = hash.get(field).and_then(|v| v.parse().ok()).unwrap_or(0);
        let next = current + delta;
        hash.insert(field.to_string(), next.to_string());
        Ok(next)
    }

    async fn expire(&self, key: &str, ttl_secs: i64) -> Result<()> {
        let mut state = self.state.lock();
        state.expiry.insert(
            key.to_string(),
            Instant::now() + Duration::from_secs(ttl_secs.max(0) as u64),
        );
        Ok(())
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<()> {
        let mut state = self.state.lock();
        state
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let state = self.state.lock();
        Ok(state
            .sets
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn scard(&self, key: &str) -> Result<u64> {
        let state = self.state.lock();
        Ok(state.sets.get(key).map(|s| s.len() as u64).unwrap_or(0))
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()> {
        let mut state = self.state.lock();
        let zset = state.zsets.entry(key.to_string()).or_default();
        zset.retain(|(m, _)| m != member);
        zset.push((member.to_string(), score));
        Ok(())
    }

    async fn zrev_by_score(&self, key: &str, limit: isize) -> Result<Vec<String>> {
        let state = self.state.lock();
        let mut members = state.zsets.get(key).cloned().unwrap_or_default();
        members.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        Ok(members
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|(m, _)| m)
            .collect())
    }

    async fn xadd(&self, stream: &str, fields: &[(String, String)]) -> Result<String> {
        let mut state = self.state.lock();
        let stream_state = state.streams.entry(stream.to_string()).or_default();
        stream_state.seq += 1;
        let id = format!("{}-0", stream_state.seq);
        stream_state.entries.push((id.clone(), fields.to_vec()));
        Ok(id)
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> Result<()> {
        let mut state = self.state.lock();
        let stream_state = state.streams.entry(stream.to_string()).or_default();
        let tail = stream_state.entries.len();
        stream_state
            .groups
            .entry(group.to_string())
            .or_insert_with(|| StreamGroup {
                next_index: tail,
                pending: HashMap::new(),
            });
        Ok(())
    }

    async fn xread_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<StreamEntry>> {
        let deadline = Instant::now() + Duration::from_millis(block_ms);
        loop {
            {
                let mut state = self.state.lock();
                if let Some(stream_state) = state.streams.get_mut(stream)
                    && let Some(group_state) = stream_state.groups.get_mut(group)
                    && group_state.next_index < stream_state.entries.len()
                {
                    let end = (group_state.next_index + count).min(stream_state.entries.len());
                    let slice = &stream_state.entries[group_state.next_index..end];
                    let entries: Vec<StreamEntry> = slice
                        .iter()
                        .map(|(id, fields)| StreamEntry {
                            id: id.clone(),
                            fields: fields.iter().cloned().collect(),
                        })
                        .collect();
                    for entry in &entries {
                        group_state
                            .pending
                            .insert(entry.id.clone(), (consumer.to_string(), Instant::now()));
                    }
                    group_state.next_index = end;
                    return Ok(entries);
                }
            }
            if Instant::now() >= deadline {
                return Ok(Vec::new());
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn xautoclaim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        count: usize,
    ) -> Result<Vec<StreamEntry>> {
        let mut state = self.state.lock();
        let Some(stream_state) = state.streams.get_mut(stream) else {
            return Ok(Vec::new());
        };
        let Some(group_state) = stream_state.groups.get_mut(group) else {
            return Ok(Vec::new());
        };

        let idle_cutoff = Duration::from_millis(min_idle_ms);
        let mut claimable: Vec<String> = group_state
            .pending
            .iter()
            .filter(|(_, (_, delivered_at))| delivered_at.elapsed() >= idle_cutoff)
            .map(|(id, _)| id.clone())
            .collect();
        claimable.sort();
        claimable.truncate(count);

        let mut claimed = Vec::new();
        for id in claimable {
            group_state
                .pending
                .insert(id.clone(), (consumer.to_string(), Instant::now()));
            if let Some((_, fields)) = stream_state.entries.iter().find(|(eid, _)| *eid == id) {
                claimed.push(StreamEntry {
                    id,
                    fields: fields.iter().cloned().collect(),
                });
            }
        }
        Ok(claimed)
    }

    async fn xack(&self, stream: &str, group: &str, entry_id: &str) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(stream_state) = state.streams.get_mut(stream)
            && let Some(group_state) = stream_state.groups.get_mut(group)
        {
            group_state.pending.remove(entry_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::CoordStore;

    #[tokio::test]
    async fn test_set_nx_is_exclusive() {
        let coord = CoordStore::memory();
        assert!(coord.set_nx_ex("k", "a", 60).await.unwrap());
        assert!(!coord.set_nx_ex("k", "b", 60).await.unwrap());
        assert_eq!(coord.get("k").await.unwrap().as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_compare_and_delete() {
        let coord = CoordStore::memory();
        coord.set_nx_ex("k", "tok", 60).await.unwrap();
        assert!(!coord.del_if_matches("k", "other").await.unwrap());
        assert!(coord.del_if_matches("k", "tok").await.unwrap());
        assert!(!coord.del_if_matches("k", "tok").await.unwrap());
    }

    #[tokio::test]
    async fn test_stream_group_read_and_ack() {
        let coord = CoordStore::memory();
        coord.ensure_group("s", "g").await.unwrap();
        coord
            .xadd("s", &[("a".to_string(), "1".to_string())])
            .await
            .unwrap();

        let entries = coord.xread_group("s", "g", "c1", 10, 100).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].fields.get("a").unwrap(), "1");

        // Not redelivered to the same group.
        let again = coord.xread_group("s", "g", "c1", 10, 10).await.unwrap();
        assert!(again.is_empty());

        // Pending until acked, then not claimable.
        let claimed = coord.xautoclaim("s", "g", "c2", 0, 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        coord.xack("s", "g", &claimed[0].id).await.unwrap();
        let claimed = coord.xautoclaim("s", "g", "c2", 0, 10).await.unwrap();
        assert!(claimed.is_empty());
    }

    #[tokio::test]
    async fn test_group_created_at_tail_skips_backlog() {
        let coord = CoordStore::memory();
        coord
            .xadd("s", &[("a".to_string(), "old".to_string())])
            .await
            .unwrap();
        coord.ensure_group("s", "g").await.unwrap();
        let entries = coord.xread_group("s", "g", "c1", 10, 10).await.unwrap();
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn test_zrev_by_score_orders_descending() {
        let coord = CoordStore::memory();
        coord.zadd("z", "first", 1.0).await.unwrap();
        coord.zadd("z", "third", 3.0).await.unwrap();
        coord.zadd("z", "second", 2.0).await.unwrap();
        let members = coord.zrev_by_score("z", 2).await.unwrap();
        assert_eq!(members, vec!["third".to_string(), "second".to_string()]);
    }
}
