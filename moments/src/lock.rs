//! Per-subject mutual-exclusion lock with TTL and fencing.
//!
//! The enqueue adapter takes the lock at submit time to reject duplicate
//! runs; the worker adopts the token from the active-status hash and the
//! orchestrator refreshes it at every stage boundary. Expiry releases the
//! lock so a crashed worker's subject becomes claimable after reclaim.

use rand::Rng;
use rand::distr::Alphanumeric;
use tracing::{debug, warn};

use crate::coord::{CoordStore, keys};
use crate::{Error, Result};

/// Default lock TTL (30 minutes).
pub const DEFAULT_LOCK_TTL_SECS: u64 = 1800;

const TOKEN_LEN: usize = 32;

/// Proof of lock ownership. Carries the fencing token; every refresh and
/// release compares it against the stored value.
#[derive(Debug, Clone)]
pub struct LockHandle {
    pub subject_id: String,
    pub token: String,
    pub ttl_secs: u64,
}

/// Acquires and releases subject locks in the coordination store.
pub struct LockManager {
    coord: CoordStore,
    default_ttl_secs: u64,
}

impl LockManager {
    pub fn new(coord: CoordStore) -> Self {
        Self::with_ttl(coord, DEFAULT_LOCK_TTL_SECS)
    }

    pub fn with_ttl(coord: CoordStore, default_ttl_secs: u64) -> Self {
        Self {
            coord,
            default_ttl_secs,
        }
    }

    /// Atomically acquire the subject lock with a fresh random token.
    /// Fails with [`Error::Conflict`] when another holder exists.
    pub async fn acquire(&self, subject_id: &str) -> Result<LockHandle> {
        self.acquire_with_ttl(subject_id, self.default_ttl_secs).await
    }

    pub async fn acquire_with_ttl(&self, subject_id: &str, ttl_secs: u64) -> Result<LockHandle> {
        let token: String = rand::rng()
            .sample_iter(&Alphanumeric)
            .take(TOKEN_LEN)
            .map(char::from)
            .collect();

        let acquired = self
            .coord
            .set_nx_ex(&keys::lock(subject_id), &token, ttl_secs)
            .await?;
        if !acquired {
            return Err(Error::Conflict(subject_id.to_string()));
        }

        debug!(subject_id = %subject_id, "Acquired subject lock");
        Ok(LockHandle {
            subject_id: subject_id.to_string(),
            token,
            ttl_secs,
        })
    }

    /// Atomically rotate an enqueue-time claim token into a fresh
    /// worker-owned token (compare-and-swap on the stored value).
    ///
    /// Returns `None` when the stored token no longer matches (the lock
    /// expired, or another worker already took the subject over). The
    /// rotation is what keeps a reclaiming worker from hijacking a live run:
    /// after it, the token recorded at submit time can never claim the lock
    /// again.
    pub async fn take_over(
        &self,
        subject_id: &str,
        claim_token: &str,
    ) -> Result<Option<LockHandle>> {
        let token: String = rand::rng()
            .sample_iter(&Alphanumeric)
            .take(TOKEN_LEN)
            .map(char::from)
            .collect();

        let swapped = self
            .coord
            .set_if_matches(
                &keys::lock(subject_id),
                claim_token,
                &token,
                self.default_ttl_secs,
            )
            .await?;
        if !swapped {
            return Ok(None);
        }

        debug!(subject_id = %subject_id, "Took over subject lock");
        Ok(Some(LockHandle {
            subject_id: subject_id.to_string(),
            token,
            ttl_secs: self.default_ttl_secs,
        }))
    }

    /// Extend the TTL iff the stored token still matches (fencing).
    pub async fn refresh(&self, handle: &LockHandle) -> Result<()> {
        let refreshed = self
            .coord
            .expire_if_matches(&keys::lock(&handle.subject_id), &handle.token, handle.ttl_secs)
            .await?;
        if !refreshed {
            return Err(Error::LockLost(handle.subject_id.clone()));
        }
        Ok(())
    }

    /// Compare-and-delete release. Already-released or expired locks are
    /// ignored; releasing never fails the caller's shutdown path.
    pub async fn release(&self, handle: &LockHandle) -> Result<()> {
        let deleted = self
            .coord
            .del_if_matches(&keys::lock(&handle.subject_id), &handle.token)
            .await?;
        if deleted {
            debug!(subject_id = %handle.subject_id, "Released subject lock");
        } else {
            warn!(
                subject_id = %handle.subject_id,
                "Lock already released or held by another token"
            );
        }
        Ok(())
    }

    pub async fn is_held(&self, subject_id: &str) -> Result<bool> {
        self.coord.exists(&keys::lock(subject_id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::CoordStore;

    #[tokio::test]
    async fn test_acquire_is_exclusive_until_release() {
        let locks = LockManager::new(CoordStore::memory());

        let handle = locks.acquire("s").await.unwrap();
        assert!(locks.is_held("s").await.unwrap());
        assert!(matches!(locks.acquire("s").await, Err(Error::Conflict(_))));

        locks.release(&handle).await.unwrap();
        assert!(!locks.is_held("s").await.unwrap());
        locks.acquire("s").await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_acquires_admit_exactly_one() {
        let coord = CoordStore::memory();
        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..8 {
            let locks = LockManager::new(coord.clone());
            tasks.spawn(async move { locks.acquire("s").await.is_ok() });
        }

        let mut admitted = 0;
        while let Some(result) = tasks.join_next().await {
            if result.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 1);
    }

    #[tokio::test]
    async fn test_refresh_fences_on_token_mismatch() {
        let coord = CoordStore::memory();
        let locks = LockManager::new(coord.clone());
        let handle = locks.acquire("s").await.unwrap();

        locks.refresh(&handle).await.unwrap();

        // Another holder's token invalidates ours.
        coord.del(&keys::lock("s")).await.unwrap();
        coord.set_nx_ex(&keys::lock("s"), "other", 60).await.unwrap();
        assert!(matches!(
            locks.refresh(&handle).await,
            Err(Error::LockLost(_))
        ));
    }

    #[tokio::test]
    async fn test_release_ignores_foreign_token() {
        let coord = CoordStore::memory();
        let locks = LockManager::new(coord.clone());
        let stale = locks.acquire("s").await.unwrap();
        coord.del(&keys::lock("s")).await.unwrap();
        let _current = locks.acquire("s").await.unwrap();

        // Releasing with the stale token must not free the current holder.
        stale_release_is_noop(&locks, &stale).await;
        assert!(locks.is_held("s").await.unwrap());
    }

    async fn stale_release_is_noop(locks: &LockManager, handle: &LockHandle) {
        locks.release(handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_take_over_rotates_token_once() {
        let locks = LockManager::new(CoordStore::memory());
        let submit_handle = locks.acquire("s").await.unwrap();

        let worker_one = locks
            .take_over("s", &submit_handle.token)
            .await
            .unwrap()
            .expect("first takeover succeeds");
        assert_ne!(worker_one.token, submit_handle.token);

        // The submit-time token can never claim the lock again.
        assert!(locks.take_over("s", &submit_handle.token).await.unwrap().is_none());
        // And the new owner's fencing still works.
        locks.refresh(&worker_one).await.unwrap();
    }
}
