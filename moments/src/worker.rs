//! Worker process: pulls submissions from the consumer group, claims the
//! subject lock, runs the orchestrator, and acknowledges entries on terminal
//! outcomes only.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::WorkerArgs;
use crate::container::ServiceContainer;
use crate::domain::RunRequest;
use crate::governor::GovernedResource;
use crate::lock::LockHandle;
use crate::pipeline::probe::CancelProbe;
use crate::pipeline::stage::RunState;
use crate::pipeline::{ExecuteOptions, RunContext};
use crate::queue::QueuedRun;
use crate::{Error, Result};

/// Blocking read window per poll.
const READ_BLOCK_MS: u64 = 5_000;

/// Cadence of the idle-entry reclaim sweep.
const RECLAIM_INTERVAL: Duration = Duration::from_secs(60);

/// What a worker decided about a claimed stream entry.
enum Claim {
    /// The entry refers to a run that is already archived or superseded;
    /// acknowledge and move on.
    Stale,
    /// Another live worker owns the subject; leave the entry pending for a
    /// later reclaim sweep.
    Busy,
    /// We own the subject lock. `restart` is set when a previous attempt
    /// left progress behind (worker crash) and statuses must be reset.
    Owned { lock: LockHandle, restart: bool },
}

pub struct Worker {
    container: Arc<ServiceContainer>,
    args: WorkerArgs,
    shutdown: CancellationToken,
}

impl Worker {
    pub fn new(container: Arc<ServiceContainer>, args: WorkerArgs, shutdown: CancellationToken) -> Self {
        Self {
            container,
            args,
            shutdown,
        }
    }

    /// Main loop: ensure the group, sweep reclaims, dispatch handlers, and
    /// drain gracefully on shutdown.
    pub async fn run(&self) -> Result<()> {
        let consumer = self.args.consumer_name();
        self.container.queue.ensure_group().await?;
        info!(
            consumer = %consumer,
            stream = %self.args.stream,
            group = %self.args.group,
            max_concurrent = self.args.max_concurrent,
            "Worker started"
        );

        let mut reclaim = tokio::time::interval(RECLAIM_INTERVAL);
        reclaim.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut handlers: JoinSet<()> = JoinSet::new();

        loop {
            // Reap finished handlers; panics are logged, never fatal.
            while let Some(joined) = handlers.try_join_next() {
                if let Err(e) = joined {
                    error!(error = %e, "Run handler panicked");
                }
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => break,

                _ = reclaim.tick() => {
                    match self
                        .container
                        .queue
                        .reclaim_idle(&consumer, self.args.reclaim_idle_ms)
                        .await
                    {
                        Ok(runs) => {
                            if !self.dispatch_all(runs, &mut handlers).await {
                                break;
                            }
                        }
                        Err(e) => warn!(error = %e, "Reclaim sweep failed"),
                    }
                }

                read = self.container.queue.read(&consumer, READ_BLOCK_MS) => {
                    match read {
                        Ok(runs) => {
                            if !self.dispatch_all(runs, &mut handlers).await {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "Stream read failed; backing off");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
            }
        }

        info!("Shutdown requested; draining in-flight runs");
        let grace = Duration::from_secs(self.args.shutdown_grace_seconds);
        let drained = tokio::time::timeout(grace, async {
            while handlers.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                grace_secs = self.args.shutdown_grace_seconds,
                "Grace window expired; aborting remaining runs"
            );
            handlers.shutdown().await;
        }
        info!("Worker stopped");
        Ok(())
    }

    /// Returns false when shutdown interrupted dispatching; undispatched
    /// entries stay pending and will be reclaimed.
    async fn dispatch_all(&self, runs: Vec<QueuedRun>, handlers: &mut JoinSet<()>) -> bool {
        for run in runs {
            let permit = match self
                .container
                .governor
                .acquire_until_shutdown(GovernedResource::Runs, &self.shutdown)
                .await
            {
                Ok(permit) => permit,
                Err(_) => return false,
            };

            let container = self.container.clone();
            let shutdown = self.shutdown.clone();
            handlers.spawn(async move {
                let _permit = permit;
                handle_run(container, run, shutdown).await;
            });
        }
        true
    }
}

async fn handle_run(container: Arc<ServiceContainer>, queued: QueuedRun, shutdown: CancellationToken) {
    let run_id = queued.request.run_id.clone();
    let subject_id = queued.request.subject_id.clone();

    match process_run(&container, &queued.request, shutdown).await {
        Ok(true) => {
            if let Err(e) = container.queue.ack(&queued.entry_id).await {
                // The run is archived; a lost ack only means a future
                // reclaim will observe the archive and re-ack.
                error!(run_id = %run_id, error = %e, "Failed to acknowledge entry");
            }
        }
        Ok(false) => {
            info!(run_id = %run_id, subject_id = %subject_id, "Subject busy; entry left pending");
        }
        Err(e) => {
            // Infrastructure failure before a terminal outcome: leave the
            // entry unacknowledged so another worker reclaims it.
            error!(run_id = %run_id, subject_id = %subject_id, error = %e, "Run handling failed");
        }
    }
}

/// Process one stream entry end to end. `Ok(true)` means the run reached a
/// terminal, archived outcome (or was stale) and the entry may be acked.
async fn process_run(
    container: &Arc<ServiceContainer>,
    request: &RunRequest,
    shutdown: CancellationToken,
) -> Result<bool> {
    let subject_id = &request.subject_id;

    let claim = claim_subject(container, request).await?;
    let (lock, restart) = match claim {
        Claim::Stale => {
            info!(run_id = %request.run_id, "Entry already terminal; acknowledging");
            return Ok(true);
        }
        Claim::Busy => return Ok(false),
        Claim::Owned { lock, restart } => (lock, restart),
    };

    if restart {
        info!(run_id = %request.run_id, subject_id = %subject_id, "Restarting reclaimed run");
        container.status.reset_for_restart(subject_id).await?;
    }

    // Validate that the payload's model keys still resolve; a registry miss
    // here is terminal for the run, not a redelivery case.
    for model_key in [&request.config.generation_model, &request.config.refinement_model] {
        match container.registry.get(model_key).await {
            Ok(_) => {}
            Err(Error::ModelNotRegistered(key)) => {
                let ctx = RunContext::new(&request.run_id, subject_id, request.config.clone())?;
                container
                    .orchestrator
                    .abort(&lock, &ctx, &format!("model not registered: {key}"))
                    .await?;
                return Ok(true);
            }
            Err(e) => return Err(e),
        }
    }

    let mut ctx = RunContext::new(&request.run_id, subject_id, request.config.clone())?;
    let probe = CancelProbe::new(container.status.clone(), subject_id, shutdown);
    let outcome = container
        .orchestrator
        .execute(&lock, &mut ctx, &probe, ExecuteOptions::default())
        .await?;

    if outcome.state == RunState::Completed {
        info!(run_id = %request.run_id, subject_id = %subject_id, "Run completed");
    } else {
        warn!(
            run_id = %request.run_id,
            subject_id = %subject_id,
            state = %outcome.state,
            error_stage = ?outcome.error_stage,
            "Run ended in non-completed terminal state"
        );
    }
    Ok(true)
}

/// Decide ownership of the subject for this entry.
async fn claim_subject(container: &Arc<ServiceContainer>, request: &RunRequest) -> Result<Claim> {
    let subject_id = &request.subject_id;

    let Some(active) = container.status.get_active(subject_id).await? else {
        return Ok(Claim::Stale);
    };
    if active.get("run_id").map(String::as_str) != Some(request.run_id.as_str()) {
        return Ok(Claim::Stale);
    }
    let restart = active.get("state").map(String::as_str) != Some(RunState::Queued.as_str());

    // First pickup: rotate the submit-time claim token into a worker-owned
    // one. After rotation that token can never claim the lock again, so a
    // reclaim sweep cannot hijack a live run.
    if let Some(claim_token) = active.get("lock_token")
        && !claim_token.is_empty()
        && let Some(lock) = container.locks.take_over(subject_id, claim_token).await?
    {
        return Ok(Claim::Owned { lock, restart });
    }

    // Rotation failed: either a worker owns the subject (lock alive with its
    // token) or the owner crashed and the lock expired.
    match container.locks.acquire(subject_id).await {
        Ok(lock) => Ok(Claim::Owned { lock, restart: true }),
        Err(Error::Conflict(_)) => Ok(Claim::Busy),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{ContainerConfig, ServiceContainer};
    use crate::coord::{CoordStore, keys};
    use crate::domain::{GenerationParams, PipelineType, RunConfig};
    use crate::governor::GovernorConfig;
    use crate::inference::InferenceConfig;
    use crate::media::MockMediaCodec;
    use crate::storage::memory::in_memory_repositories;
    use crate::storage::object_store::MockObjectStore;
    use crate::tunnel::TunnelConfig;

    fn config() -> RunConfig {
        RunConfig {
            generation_model: "vl".to_string(),
            refinement_model: "text".to_string(),
            generation_params: GenerationParams::default(),
            padding_left_seconds: 0.0,
            padding_right_seconds: 0.0,
            min_moments: None,
            max_moments: None,
            min_moment_length: None,
            max_moment_length: None,
            source_url: None,
            force_download: false,
            pipeline_type: PipelineType::Full,
        }
    }

    async fn container() -> (Arc<ServiceContainer>, CoordStore) {
        let coord = CoordStore::memory();
        let container = ServiceContainer::wire(
            ContainerConfig {
                redis_url: String::new(),
                stream: keys::REQUESTS_STREAM.to_string(),
                group: keys::WORKERS_GROUP.to_string(),
                lock_ttl_seconds: 1800,
                transcription_model: "whisper".to_string(),
                governor: GovernorConfig::default(),
                inference: InferenceConfig::default(),
                tunnel: TunnelConfig::default(),
            },
            coord.clone(),
            in_memory_repositories(),
            Arc::new(MockObjectStore::new()),
            Arc::new(MockMediaCodec::new()),
        )
        .unwrap();
        container.registry.seed_defaults().await.unwrap();
        (container, coord)
    }

    #[tokio::test]
    async fn test_claim_rotates_submit_token_once() {
        let (container, _coord) = container().await;
        let accepted = container.enqueue.submit("s", config()).await.unwrap();
        let request = RunRequest {
            run_id: accepted.run_id,
            subject_id: "s".to_string(),
            config: config(),
            requested_at: chrono::Utc::now(),
        };

        // First claim rotates the token and owns the subject.
        let first = claim_subject(&container, &request).await.unwrap();
        assert!(matches!(first, Claim::Owned { restart: false, .. }));

        // A concurrent reclaimer cannot rotate again nor acquire the lock.
        let second = claim_subject(&container, &request).await.unwrap();
        assert!(matches!(second, Claim::Busy));
    }

    #[tokio::test]
    async fn test_claim_after_lock_expiry_restarts_run() {
        let (container, coord) = container().await;
        let accepted = container.enqueue.submit("s", config()).await.unwrap();
        let request = RunRequest {
            run_id: accepted.run_id,
            subject_id: "s".to_string(),
            config: config(),
            requested_at: chrono::Utc::now(),
        };

        // Worker-1 claims, marks the run running, then dies; its lock
        // eventually expires.
        let first = claim_subject(&container, &request).await.unwrap();
        let Claim::Owned { .. } = first else {
            panic!("expected ownership");
        };
        container
            .status
            .set_state("s", RunState::Running)
            .await
            .unwrap();
        coord.del(&keys::lock("s")).await.unwrap();

        // Worker-2 acquires the expired lock fresh and restarts.
        let second = claim_subject(&container, &request).await.unwrap();
        assert!(matches!(second, Claim::Owned { restart: true, .. }));
    }

    #[tokio::test]
    async fn test_claim_of_archived_run_is_stale() {
        let (container, _coord) = container().await;
        let request = RunRequest {
            run_id: "r-gone".to_string(),
            subject_id: "s".to_string(),
            config: config(),
            requested_at: chrono::Utc::now(),
        };
        // No active hash at all.
        let claim = claim_subject(&container, &request).await.unwrap();
        assert!(matches!(claim, Claim::Stale));
    }

    #[tokio::test]
    async fn test_process_run_aborts_on_unregistered_model() {
        let (container, coord) = container().await;

        // Registry drift: the submission referenced a key that no longer
        // resolves at pickup time, so enqueue-side validation never saw it.
        let mut drifted = config();
        drifted.generation_model = "retired".to_string();
        let request = RunRequest::new("s", drifted);
        let lock = container.locks.acquire("s").await.unwrap();
        container
            .status
            .init_active("s", &request.run_id, &lock.token)
            .await
            .unwrap();

        let acked = process_run(&container, &request, CancellationToken::new())
            .await
            .unwrap();
        assert!(acked, "terminal abort must allow the entry to be acknowledged");

        // Aborted like any terminal run: archived failed snapshot with the
        // error message, active hash gone, lock released.
        let snapshot = coord.hgetall(&keys::run(&request.run_id)).await.unwrap();
        assert_eq!(snapshot.get("state").unwrap(), "failed");
        assert!(snapshot.get("error_message").unwrap().contains("retired"));
        assert!(container.status.get_active("s").await.unwrap().is_none());
        assert!(!container.locks.is_held("s").await.unwrap());
    }

    #[tokio::test]
    async fn test_reset_for_restart_clears_progress() {
        let (container, _coord) = container().await;
        container.enqueue.submit("s", config()).await.unwrap();
        container.status.set_state("s", RunState::Running).await.unwrap();
        container
            .status
            .mark_stage_started("s", crate::pipeline::StageId::Download)
            .await
            .unwrap();

        container.status.reset_for_restart("s").await.unwrap();
        let active = container.status.get_active("s").await.unwrap().unwrap();
        assert_eq!(active.get("state").unwrap(), "queued");
        assert_eq!(active.get("download_state").unwrap(), "pending");
        assert!(!active.contains_key("current_stage"));
        assert!(!active.contains_key("download_started_at"));
    }
}
