//! Process-global concurrency limits.
//!
//! Counting semaphores shared by every run on this worker. Acquires are
//! waiter-fair (tokio semaphores queue FIFO) and cancellation-aware: a waiter
//! whose run is cancelled unblocks with [`Error::Cancelled`] without ever
//! holding a permit.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::pipeline::probe::CancelProbe;
use crate::{Error, Result};

/// Resources governed across all runs on this worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GovernedResource {
    /// Whole-run slots.
    Runs,
    /// Codec subprocess CPU.
    AudioExtract,
    /// Remote ASR capacity.
    Transcription,
    /// Remote GPU memory.
    MomentGeneration,
    /// I/O-bound codec fan-out.
    ClipExtract,
    /// Strict GPU serialization.
    Refinement,
}

/// Per-resource capacities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GovernorConfig {
    pub max_concurrent_runs: usize,
    pub audio_extract: usize,
    pub transcription: usize,
    pub moment_generation: usize,
    pub clip_extract: usize,
    pub refinement: usize,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_runs: 2,
            audio_extract: 2,
            transcription: 2,
            moment_generation: 2,
            clip_extract: 4,
            refinement: 1,
        }
    }
}

/// Global counting semaphores for this worker process.
pub struct ConcurrencyGovernor {
    runs: Arc<Semaphore>,
    audio_extract: Arc<Semaphore>,
    transcription: Arc<Semaphore>,
    moment_generation: Arc<Semaphore>,
    clip_extract: Arc<Semaphore>,
    refinement: Arc<Semaphore>,
}

impl ConcurrencyGovernor {
    pub fn new(config: &GovernorConfig) -> Self {
        Self {
            runs: Arc::new(Semaphore::new(config.max_concurrent_runs)),
            audio_extract: Arc::new(Semaphore::new(config.audio_extract)),
            transcription: Arc::new(Semaphore::new(config.transcription)),
            moment_generation: Arc::new(Semaphore::new(config.moment_generation)),
            clip_extract: Arc::new(Semaphore::new(config.clip_extract)),
            refinement: Arc::new(Semaphore::new(config.refinement)),
        }
    }

    fn semaphore(&self, resource: GovernedResource) -> &Arc<Semaphore> {
        match resource {
            GovernedResource::Runs => &self.runs,
            GovernedResource::AudioExtract => &self.audio_extract,
            GovernedResource::Transcription => &self.transcription,
            GovernedResource::MomentGeneration => &self.moment_generation,
            GovernedResource::ClipExtract => &self.clip_extract,
            GovernedResource::Refinement => &self.refinement,
        }
    }

    /// Acquire a permit, unblocking with `Cancelled` if the owning run is
    /// cancelled while waiting.
    pub async fn acquire(
        &self,
        resource: GovernedResource,
        probe: &CancelProbe,
    ) -> Result<OwnedSemaphorePermit> {
        let semaphore = self.semaphore(resource).clone();
        tokio::select! {
            permit = semaphore.acquire_owned() => {
                permit.map_err(|_| Error::Other("governor semaphore closed".to_string()))
            }
            _ = probe.wait_cancelled() => Err(Error::Cancelled),
        }
    }

    /// Acquire a permit, unblocking on worker shutdown. Used for run slots
    /// before any subject context exists.
    pub async fn acquire_until_shutdown(
        &self,
        resource: GovernedResource,
        shutdown: &CancellationToken,
    ) -> Result<OwnedSemaphorePermit> {
        let semaphore = self.semaphore(resource).clone();
        tokio::select! {
            permit = semaphore.acquire_owned() => {
                permit.map_err(|_| Error::Other("governor semaphore closed".to_string()))
            }
            _ = shutdown.cancelled() => Err(Error::Cancelled),
        }
    }

    pub fn available(&self, resource: GovernedResource) -> usize {
        self.semaphore(resource).available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::CoordStore;
    use crate::status::StatusManager;

    fn probe(coord: &CoordStore, subject: &str, token: &CancellationToken) -> CancelProbe {
        CancelProbe::new(StatusManager::new(coord.clone()), subject, token.clone())
    }

    #[tokio::test]
    async fn test_acquire_and_release_restores_capacity() {
        let governor = ConcurrencyGovernor::new(&GovernorConfig::default());
        let coord = CoordStore::memory();
        let token = CancellationToken::new();
        let probe = probe(&coord, "s", &token);

        assert_eq!(governor.available(GovernedResource::Refinement), 1);
        let permit = governor
            .acquire(GovernedResource::Refinement, &probe)
            .await
            .unwrap();
        assert_eq!(governor.available(GovernedResource::Refinement), 0);
        drop(permit);
        assert_eq!(governor.available(GovernedResource::Refinement), 1);
    }

    #[tokio::test]
    async fn test_waiting_acquire_unblocks_on_cancel_without_permit() {
        let governor = Arc::new(ConcurrencyGovernor::new(&GovernorConfig {
            refinement: 1,
            ..Default::default()
        }));
        let coord = CoordStore::memory();
        let token = CancellationToken::new();
        let probe = probe(&coord, "s", &token);

        let _held = governor
            .acquire(GovernedResource::Refinement, &probe)
            .await
            .unwrap();

        let waiter_governor = governor.clone();
        let waiter_probe = probe.clone();
        let waiter = tokio::spawn(async move {
            waiter_governor
                .acquire(GovernedResource::Refinement, &waiter_probe)
                .await
        });

        token.cancel();
        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(Error::Cancelled)));
        // The held permit is still the only one out.
        assert_eq!(governor.available(GovernedResource::Refinement), 0);
    }

    #[tokio::test]
    async fn test_acquire_until_shutdown_observes_token() {
        let governor = ConcurrencyGovernor::new(&GovernorConfig {
            max_concurrent_runs: 0,
            ..Default::default()
        });
        let token = CancellationToken::new();
        token.cancel();
        let result = governor
            .acquire_until_shutdown(GovernedResource::Runs, &token)
            .await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }
}
