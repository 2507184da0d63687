//! Cooperative cancellation probe for one run.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::status::StatusManager;
use crate::{Error, Result};

/// Interval between coordination-store polls while waiting on a permit or a
/// long in-stage operation.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Observes both the worker shutdown token and the subject's cancel flag.
///
/// Stages call [`CancelProbe::check`] at designated checkpoints; anything that
/// parks a run (permit waits, readiness probes) selects on
/// [`CancelProbe::wait_cancelled`].
#[derive(Clone)]
pub struct CancelProbe {
    status: StatusManager,
    subject_id: String,
    shutdown: CancellationToken,
}

impl CancelProbe {
    pub fn new(status: StatusManager, subject_id: &str, shutdown: CancellationToken) -> Self {
        Self {
            status,
            subject_id: subject_id.to_string(),
            shutdown,
        }
    }

    pub fn subject_id(&self) -> &str {
        &self.subject_id
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Whether a stop has been requested, either by worker shutdown or by the
    /// subject's cancel flag. Store errors are treated as "not cancelled" so a
    /// flaky read cannot abort a healthy run.
    pub async fn is_cancelled(&self) -> bool {
        if self.shutdown.is_cancelled() {
            return true;
        }
        match self.status.is_cancel_requested(&self.subject_id).await {
            Ok(requested) => requested,
            Err(e) => {
                warn!(subject_id = %self.subject_id, error = %e, "Cancel flag read failed");
                false
            }
        }
    }

    /// Fails with [`Error::Cancelled`] when a stop has been requested.
    pub async fn check(&self) -> Result<()> {
        if self.is_cancelled().await {
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    /// Completes once a stop is requested. Intended for `tokio::select!`
    /// against an interruptible wait.
    pub async fn wait_cancelled(&self) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(POLL_INTERVAL) => {
                    if self.is_cancelled().await {
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::CoordStore;

    #[tokio::test]
    async fn test_check_passes_then_fails_after_cancel_flag() {
        let coord = CoordStore::memory();
        let status = StatusManager::new(coord.clone());
        let probe = CancelProbe::new(status.clone(), "subj", CancellationToken::new());

        probe.check().await.unwrap();
        status.request_cancel("subj").await.unwrap();
        assert!(matches!(probe.check().await, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn test_shutdown_token_cancels_immediately() {
        let coord = CoordStore::memory();
        let token = CancellationToken::new();
        let probe = CancelProbe::new(StatusManager::new(coord), "subj", token.clone());
        token.cancel();
        assert!(probe.is_cancelled().await);
    }
}
