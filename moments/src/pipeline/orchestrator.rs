//! Ordered stage execution for one run.
//!
//! The orchestrator owns every cross-cutting concern at stage boundaries:
//! cancellation checks, skip evaluation, governor permits, status
//! transitions, lock refresh, and the single terminal archive point. Stages
//! only transform the context.

use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info, warn};

use crate::coord::{CoordStore, keys};
use crate::governor::ConcurrencyGovernor;
use crate::lock::{LockHandle, LockManager};
use crate::pipeline::context::RunContext;
use crate::pipeline::probe::CancelProbe;
use crate::pipeline::stage::{PipelineStage, RunState, StageId, StageState};
use crate::status::StatusManager;
use crate::storage::{HistoryRepository, NewHistory};
use crate::{Error, Result};

/// TTL of the archived run snapshot hash (24 h).
const RUN_SNAPSHOT_TTL_SECS: i64 = 86_400;

/// Per-run execution options.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecuteOptions {
    /// Skip stages recorded `completed` in the subject's latest archived run.
    /// Off by default.
    pub resume: bool,
}

/// Terminal description of one run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub state: RunState,
    pub error_stage: Option<StageId>,
    pub error_message: Option<String>,
    pub recoverable_failures: u32,
    pub total_moments: u32,
}

/// Executes the ordered stage list for one run.
pub struct Orchestrator {
    stages: Vec<Arc<dyn PipelineStage>>,
    status: StatusManager,
    locks: Arc<LockManager>,
    governor: Arc<ConcurrencyGovernor>,
    coord: CoordStore,
    history: Arc<dyn HistoryRepository>,
}

impl Orchestrator {
    pub fn new(
        stages: Vec<Arc<dyn PipelineStage>>,
        status: StatusManager,
        locks: Arc<LockManager>,
        governor: Arc<ConcurrencyGovernor>,
        coord: CoordStore,
        history: Arc<dyn HistoryRepository>,
    ) -> Self {
        Self {
            stages,
            status,
            locks,
            governor,
            coord,
            history,
        }
    }

    /// Run all stages and archive the terminal outcome.
    ///
    /// Returns `Ok` once the run reached a terminal state AND the archive
    /// succeeded; only then may the caller acknowledge the stream entry. The
    /// lock is released on every exit path.
    pub async fn execute(
        &self,
        lock: &LockHandle,
        ctx: &mut RunContext,
        probe: &CancelProbe,
        options: ExecuteOptions,
    ) -> Result<RunOutcome> {
        let result = self.execute_inner(lock, ctx, probe, options).await;

        // Release regardless of how execution ended; TTL expiry is the
        // backstop if even this fails.
        if let Err(e) = self.locks.release(lock).await {
            error!(subject_id = %ctx.subject_id, error = %e, "Failed to release subject lock");
        }

        result
    }

    /// Terminate a run as `failed` without executing any stage (payload
    /// validation failures observed by the worker). Archives and releases
    /// like a normal terminal path so the entry may be acknowledged.
    pub async fn abort(
        &self,
        lock: &LockHandle,
        ctx: &RunContext,
        message: &str,
    ) -> Result<RunOutcome> {
        let subject_id = ctx.subject_id.clone();
        error!(run_id = %ctx.run_id, subject_id = %subject_id, error = %message, "Run aborted");

        let result = async {
            self.status.set_error_message(&subject_id, message).await?;
            self.status.set_state(&subject_id, RunState::Failed).await?;
            let outcome = RunOutcome {
                state: RunState::Failed,
                error_stage: None,
                error_message: Some(message.to_string()),
                recoverable_failures: 0,
                total_moments: 0,
            };
            self.archive(ctx, &outcome).await?;
            Ok(outcome)
        }
        .await;

        if let Err(e) = self.locks.release(lock).await {
            error!(subject_id = %subject_id, error = %e, "Failed to release subject lock");
        }
        result
    }

    async fn execute_inner(
        &self,
        lock: &LockHandle,
        ctx: &mut RunContext,
        probe: &CancelProbe,
        options: ExecuteOptions,
    ) -> Result<RunOutcome> {
        let subject_id = ctx.subject_id.clone();

        // Assert ownership before writing anything.
        self.locks.refresh(lock).await?;
        self.status.set_state(&subject_id, RunState::Running).await?;
        info!(run_id = %ctx.run_id, subject_id = %subject_id, "Run started");

        let resumable = if options.resume {
            self.previously_completed_stages(&subject_id).await?
        } else {
            Vec::new()
        };

        let mut cancelled = false;
        let mut error_stage: Option<StageId> = None;
        let mut error_message: Option<String> = None;
        let mut recoverable_failures: u32 = 0;

        for stage in &self.stages {
            let stage_id = stage.id();

            if probe.is_cancelled().await {
                cancelled = true;
                break;
            }

            if resumable.contains(&stage_id) {
                self.status
                    .mark_stage_skipped(&subject_id, stage_id, "completed in previous run")
                    .await?;
                continue;
            }

            match stage.should_skip(ctx).await {
                Ok(Some(reason)) => {
                    self.status
                        .mark_stage_skipped(&subject_id, stage_id, &reason)
                        .await?;
                    continue;
                }
                Ok(None) => {}
                Err(e) => {
                    let message = e.to_string();
                    self.status
                        .mark_stage_failed(&subject_id, stage_id, &message)
                        .await?;
                    error_stage = Some(stage_id);
                    error_message = Some(message);
                    break;
                }
            }

            let _permit = match stage.resource() {
                Some(resource) => match self.governor.acquire(resource, probe).await {
                    Ok(permit) => Some(permit),
                    Err(Error::Cancelled) => {
                        cancelled = true;
                        break;
                    }
                    Err(e) => {
                        let message = e.to_string();
                        self.status
                            .mark_stage_failed(&subject_id, stage_id, &message)
                            .await?;
                        error_stage = Some(stage_id);
                        error_message = Some(message);
                        break;
                    }
                },
                None => None,
            };

            self.status.mark_stage_started(&subject_id, stage_id).await?;
            if let Err(e) = self.locks.refresh(lock).await {
                // Fencing failed: we no longer own the subject. Abort the
                // stage; a release attempt is still made by the caller.
                let message = e.to_string();
                self.status
                    .mark_stage_failed(&subject_id, stage_id, &message)
                    .await?;
                error_stage = Some(stage_id);
                error_message = Some(message);
                break;
            }

            info!(run_id = %ctx.run_id, stage = %stage_id, "Stage started");
            match stage.run(ctx, probe).await {
                Ok(outcome) => {
                    recoverable_failures += outcome.recoverable_failures;
                    self.status
                        .mark_stage_completed(&subject_id, stage_id)
                        .await?;
                    info!(
                        run_id = %ctx.run_id,
                        stage = %stage_id,
                        recoverable_failures = outcome.recoverable_failures,
                        "Stage completed"
                    );
                }
                Err(Error::Cancelled) => {
                    // Leave the stage record as running; the run-level state
                    // says why it never finished.
                    cancelled = true;
                    break;
                }
                Err(e) if e.is_recoverable() => {
                    warn!(run_id = %ctx.run_id, stage = %stage_id, error = %e, "Recoverable stage error");
                    recoverable_failures += 1;
                    self.status
                        .mark_stage_completed(&subject_id, stage_id)
                        .await?;
                }
                Err(e) => {
                    let message = e.to_string();
                    error!(run_id = %ctx.run_id, stage = %stage_id, error = %message, "Stage failed");
                    self.status
                        .mark_stage_failed(&subject_id, stage_id, &message)
                        .await?;
                    error_stage = Some(stage_id);
                    error_message = Some(message);
                    break;
                }
            }
        }

        let state = if cancelled {
            RunState::Cancelled
        } else if error_stage.is_some() {
            RunState::Failed
        } else if recoverable_failures > 0 {
            RunState::Partial
        } else {
            RunState::Completed
        };

        let outcome = RunOutcome {
            state,
            error_stage,
            error_message,
            recoverable_failures,
            total_moments: ctx.moments.len() as u32,
        };

        self.status.set_state(&subject_id, state).await?;
        self.archive(ctx, &outcome).await?;
        info!(run_id = %ctx.run_id, subject_id = %subject_id, state = %state, "Run archived");

        Ok(outcome)
    }

    /// The single terminal archive point: snapshot hash, history index entry,
    /// active hash removal, durable history row.
    async fn archive(&self, ctx: &RunContext, outcome: &RunOutcome) -> Result<()> {
        let subject_id = &ctx.subject_id;
        let active = self.coord.hgetall(&keys::active(subject_id)).await?;

        let mut snapshot: Vec<(String, String)> = active
            .into_iter()
            .filter(|(field, _)| field != "lock_token")
            .collect();
        snapshot.push(("subject_id".to_string(), subject_id.clone()));
        snapshot.push((
            "total_moments".to_string(),
            outcome.total_moments.to_string(),
        ));
        snapshot.push((
            "recoverable_failures".to_string(),
            outcome.recoverable_failures.to_string(),
        ));

        let run_key = keys::run(&ctx.run_id);
        self.coord.hset_multiple(&run_key, &snapshot).await?;
        self.coord.expire(&run_key, RUN_SNAPSHOT_TTL_SECS).await?;

        let completed_at = Utc::now();
        self.coord
            .zadd(
                &keys::history(subject_id),
                &ctx.run_id,
                completed_at.timestamp_millis() as f64,
            )
            .await?;
        self.coord.del(&keys::active(subject_id)).await?;

        // The relational history row is durable bookkeeping; losing it does
        // not justify a queue-level redelivery once the coordination-store
        // archive above succeeded.
        let row = NewHistory {
            run_id: ctx.run_id.clone(),
            subject_id: subject_id.clone(),
            state: outcome.state.as_str().to_string(),
            error_stage: outcome.error_stage.map(|s| s.as_str().to_string()),
            error_message: outcome.error_message.clone(),
            total_moments: outcome.total_moments,
            recoverable_failures: outcome.recoverable_failures,
            completed_at,
        };
        if let Err(e) = self.history.create(row).await {
            warn!(run_id = %ctx.run_id, error = %e, "Failed to persist history row");
        }

        Ok(())
    }

    /// Stage ids recorded `completed` in the subject's most recent archived
    /// run.
    async fn previously_completed_stages(&self, subject_id: &str) -> Result<Vec<StageId>> {
        let recent = self.coord.zrev_by_score(&keys::history(subject_id), 1).await?;
        let Some(run_id) = recent.first() else {
            return Ok(Vec::new());
        };
        let snapshot = self.coord.hgetall(&keys::run(run_id)).await?;

        let mut completed = Vec::new();
        for stage in crate::pipeline::stage::STAGE_ORDER {
            if snapshot
                .get(&format!("{}_state", stage.as_str()))
                .and_then(|raw| StageState::parse(raw))
                == Some(StageState::Completed)
            {
                completed.push(stage);
            }
        }
        Ok(completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::CoordStore;
    use crate::domain::{GenerationParams, PipelineType, RunConfig};
    use crate::governor::GovernorConfig;
    use crate::pipeline::stage::{STAGE_ORDER, StageOutcome};
    use crate::storage::memory::InMemoryHistoryRepository;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tokio_util::sync::CancellationToken;

    #[derive(Clone)]
    enum Behavior {
        Ok,
        OkWithFailures(u32),
        Skip(String),
        Fail(String),
        Recoverable,
    }

    struct FakeStage {
        id: StageId,
        behavior: Behavior,
        ran: Arc<Mutex<Vec<StageId>>>,
    }

    #[async_trait]
    impl PipelineStage for FakeStage {
        fn id(&self) -> StageId {
            self.id
        }

        async fn should_skip(&self, _ctx: &RunContext) -> Result<Option<String>> {
            match &self.behavior {
                Behavior::Skip(reason) => Ok(Some(reason.clone())),
                _ => Ok(None),
            }
        }

        async fn run(&self, _ctx: &mut RunContext, _probe: &CancelProbe) -> Result<StageOutcome> {
            self.ran.lock().push(self.id);
            match &self.behavior {
                Behavior::Ok | Behavior::Skip(_) => Ok(StageOutcome::completed()),
                Behavior::OkWithFailures(count) => Ok(StageOutcome::with_failures(*count)),
                Behavior::Fail(message) => Err(Error::Pipeline(message.clone())),
                Behavior::Recoverable => Err(Error::recoverable(self.id, "item", "one item failed")),
            }
        }
    }

    struct Harness {
        coord: CoordStore,
        status: StatusManager,
        locks: Arc<LockManager>,
        governor: Arc<ConcurrencyGovernor>,
        history: Arc<InMemoryHistoryRepository>,
        ran: Arc<Mutex<Vec<StageId>>>,
    }

    impl Harness {
        fn new() -> Self {
            let coord = CoordStore::memory();
            Self {
                status: StatusManager::new(coord.clone()),
                locks: Arc::new(LockManager::new(coord.clone())),
                governor: Arc::new(ConcurrencyGovernor::new(&GovernorConfig::default())),
                history: Arc::new(InMemoryHistoryRepository::default()),
                ran: Arc::new(Mutex::new(Vec::new())),
                coord,
            }
        }

        fn orchestrator(&self, behaviors: Vec<(StageId, Behavior)>) -> Orchestrator {
            let stages: Vec<Arc<dyn PipelineStage>> = behaviors
                .into_iter()
                .map(|(id, behavior)| {
                    Arc::new(FakeStage {
                        id,
                        behavior,
                        ran: self.ran.clone(),
                    }) as Arc<dyn PipelineStage>
                })
                .collect();
            Orchestrator::new(
                stages,
                self.status.clone(),
                self.locks.clone(),
                self.governor.clone(),
                self.coord.clone(),
                self.history.clone(),
            )
        }

        fn all_ok(&self) -> Orchestrator {
            self.orchestrator(STAGE_ORDER.iter().map(|s| (*s, Behavior::Ok)).collect())
        }

        async fn start_run(&self, subject: &str) -> (LockHandle, RunContext, CancelProbe) {
            let lock = self.locks.acquire(subject).await.unwrap();
            let run_id = format!("run-{subject}");
            self.status
                .init_active(subject, &run_id, &lock.token)
                .await
                .unwrap();
            let config = RunConfig {
                generation_model: "vl".to_string(),
                refinement_model: "vl".to_string(),
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
            };
            let work_dir = std::env::temp_dir();
            let ctx = RunContext::with_work_dir(&run_id, subject, config, work_dir);
            let probe = CancelProbe::new(self.status.clone(), subject, CancellationToken::new());
            (lock, ctx, probe)
        }
    }

    #[tokio::test]
    async fn test_happy_path_completes_and_archives_once() {
        let harness = Harness::new();
        let orchestrator = harness.all_ok();
        let (lock, mut ctx, probe) = harness.start_run("a").await;

        let outcome = orchestrator
            .execute(&lock, &mut ctx, &probe, ExecuteOptions::default())
            .await
            .unwrap();

        assert_eq!(outcome.state, RunState::Completed);
        assert_eq!(harness.ran.lock().len(), STAGE_ORDER.len());

        // Active hash deleted, archive hash written, history has one entry.
        assert!(harness.status.get_active("a").await.unwrap().is_none());
        let snapshot = harness.coord.hgetall(&keys::run("run-a")).await.unwrap();
        assert_eq!(snapshot.get("state").unwrap(), "completed");
        assert!(!snapshot.contains_key("lock_token"));
        let history = harness.coord.zrev_by_score(&keys::history("a"), 10).await.unwrap();
        assert_eq!(history, vec!["run-a".to_string()]);

        // Lock released.
        assert!(!harness.locks.is_held("a").await.unwrap());
    }

    #[tokio::test]
    async fn test_failing_stage_stops_the_run() {
        let harness = Harness::new();
        let orchestrator = harness.orchestrator(vec![
            (StageId::Download, Behavior::Ok),
            (StageId::AudioExtract, Behavior::Fail("boom".to_string())),
            (StageId::AudioUpload, Behavior::Ok),
        ]);
        let (lock, mut ctx, probe) = harness.start_run("b").await;

        let outcome = orchestrator
            .execute(&lock, &mut ctx, &probe, ExecuteOptions::default())
            .await
            .unwrap();

        assert_eq!(outcome.state, RunState::Failed);
        assert_eq!(outcome.error_stage, Some(StageId::AudioExtract));
        assert!(outcome.error_message.unwrap().contains("boom"));
        // AudioUpload never ran.
        assert_eq!(
            harness.ran.lock().clone(),
            vec![StageId::Download, StageId::AudioExtract]
        );

        let snapshot = harness.coord.hgetall(&keys::run("run-b")).await.unwrap();
        assert_eq!(snapshot.get("state").unwrap(), "failed");
        assert_eq!(snapshot.get("error_stage").unwrap(), "audio_extract");
        assert!(!harness.locks.is_held("b").await.unwrap());
    }

    #[tokio::test]
    async fn test_recoverable_failures_yield_partial() {
        let harness = Harness::new();
        let orchestrator = harness.orchestrator(vec![
            (StageId::Download, Behavior::Ok),
            (StageId::ClipExtract, Behavior::OkWithFailures(1)),
            (StageId::Refinement, Behavior::Recoverable),
        ]);
        let (lock, mut ctx, probe) = harness.start_run("c").await;

        let outcome = orchestrator
            .execute(&lock, &mut ctx, &probe, ExecuteOptions::default())
            .await
            .unwrap();

        assert_eq!(outcome.state, RunState::Partial);
        assert_eq!(outcome.recoverable_failures, 2);
        // All stages ran despite per-item failures.
        assert_eq!(harness.ran.lock().len(), 3);
    }

    #[tokio::test]
    async fn test_cancel_flag_stops_before_next_stage() {
        let harness = Harness::new();
        let orchestrator = harness.all_ok();
        let (lock, mut ctx, probe) = harness.start_run("d").await;

        // Cancel before execution begins: first boundary check trips.
        harness.status.request_cancel("d").await.unwrap();
        let outcome = orchestrator
            .execute(&lock, &mut ctx, &probe, ExecuteOptions::default())
            .await
            .unwrap();

        assert_eq!(outcome.state, RunState::Cancelled);
        assert!(harness.ran.lock().is_empty());
        let snapshot = harness.coord.hgetall(&keys::run("run-d")).await.unwrap();
        assert_eq!(snapshot.get("state").unwrap(), "cancelled");
        assert!(!harness.locks.is_held("d").await.unwrap());
    }

    #[tokio::test]
    async fn test_skip_rule_marks_stage_skipped_and_continues() {
        let harness = Harness::new();
        let orchestrator = harness.orchestrator(vec![
            (StageId::Download, Behavior::Ok),
            (StageId::ClipExtract, Behavior::Skip("no video capability".to_string())),
            (StageId::Refinement, Behavior::Ok),
        ]);
        let (lock, mut ctx, probe) = harness.start_run("e").await;

        let outcome = orchestrator
            .execute(&lock, &mut ctx, &probe, ExecuteOptions::default())
            .await
            .unwrap();

        assert_eq!(outcome.state, RunState::Completed);
        assert_eq!(
            harness.ran.lock().clone(),
            vec![StageId::Download, StageId::Refinement]
        );
        let snapshot = harness.coord.hgetall(&keys::run("run-e")).await.unwrap();
        assert_eq!(snapshot.get("clip_extract_state").unwrap(), "skipped");
        assert_eq!(
            snapshot.get("clip_extract_skip_reason").unwrap(),
            "no video capability"
        );
    }

    #[tokio::test]
    async fn test_lost_lock_fails_the_run() {
        let harness = Harness::new();
        let orchestrator = harness.all_ok();
        let (lock, mut ctx, probe) = harness.start_run("f").await;

        // Simulate TTL expiry plus takeover by another worker.
        harness.coord.del(&keys::lock("f")).await.unwrap();
        harness
            .coord
            .set_nx_ex(&keys::lock("f"), "other-token", 60)
            .await
            .unwrap();

        let result = orchestrator
            .execute(&lock, &mut ctx, &probe, ExecuteOptions::default())
            .await;
        // The initial ownership assertion fails before any status write.
        assert!(matches!(result, Err(Error::LockLost(_))));
    }

    #[tokio::test]
    async fn test_abort_archives_failed_run_without_running_stages() {
        let harness = Harness::new();
        let orchestrator = harness.all_ok();
        let (lock, ctx, _probe) = harness.start_run("h").await;

        let outcome = orchestrator
            .abort(&lock, &ctx, "model not registered: vl")
            .await
            .unwrap();

        assert_eq!(outcome.state, RunState::Failed);
        assert_eq!(
            outcome.error_message.as_deref(),
            Some("model not registered: vl")
        );
        assert!(harness.ran.lock().is_empty());

        // Archived like any terminal run: snapshot hash with the error,
        // history entry, active hash gone, lock released.
        let snapshot = harness.coord.hgetall(&keys::run("run-h")).await.unwrap();
        assert_eq!(snapshot.get("state").unwrap(), "failed");
        assert_eq!(
            snapshot.get("error_message").unwrap(),
            "model not registered: vl"
        );
        let history = harness.coord.zrev_by_score(&keys::history("h"), 10).await.unwrap();
        assert_eq!(history, vec!["run-h".to_string()]);
        assert!(harness.status.get_active("h").await.unwrap().is_none());
        assert!(!harness.locks.is_held("h").await.unwrap());
    }

    #[tokio::test]
    async fn test_resume_skips_previously_completed_stages() {
        let harness = Harness::new();

        // First run: Download completes, AudioExtract fails.
        let orchestrator = harness.orchestrator(vec![
            (StageId::Download, Behavior::Ok),
            (StageId::AudioExtract, Behavior::Fail("disk full".to_string())),
        ]);
        let (lock, mut ctx, probe) = harness.start_run("g").await;
        orchestrator
            .execute(&lock, &mut ctx, &probe, ExecuteOptions::default())
            .await
            .unwrap();

        // Second run in resume mode skips the completed Download.
        let orchestrator = harness.orchestrator(vec![
            (StageId::Download, Behavior::Ok),
            (StageId::AudioExtract, Behavior::Ok),
        ]);
        harness.ran.lock().clear();
        let lock = harness.locks.acquire("g").await.unwrap();
        harness
            .status
            .init_active("g", "run-g2", &lock.token)
            .await
            .unwrap();
        let mut ctx = RunContext::with_work_dir(
            "run-g2",
            "g",
            ctx.config.clone(),
            std::env::temp_dir(),
        );
        let probe = CancelProbe::new(harness.status.clone(), "g", CancellationToken::new());

        let outcome = orchestrator
            .execute(&lock, &mut ctx, &probe, ExecuteOptions { resume: true })
            .await
            .unwrap();

        assert_eq!(outcome.state, RunState::Completed);
        assert_eq!(harness.ran.lock().clone(), vec![StageId::AudioExtract]);
    }
}
