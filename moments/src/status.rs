//! Active-run status hash and cancellation flags.
//!
//! The lock-holding worker is the sole writer of a subject's active hash;
//! transitions here assert the monotonic per-stage state machine rather than
//! trusting callers.

use std::collections::{BTreeMap, HashMap};

use chrono::Utc;
use serde::Serialize;
use tracing::debug;

use crate::coord::{CoordStore, keys};
use crate::pipeline::stage::{RunState, STAGE_ORDER, StageId, StageState};
use crate::{Error, Result};

/// TTL for the cancellation request flag (5 minutes).
pub const CANCEL_TTL_SECS: u64 = 300;

fn stage_field(stage: StageId, suffix: &str) -> String {
    format!("{}_{}", stage.as_str(), suffix)
}

/// One stage's slice of a status snapshot.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StageSnapshot {
    pub state: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub error: Option<String>,
    pub skip_reason: Option<String>,
}

/// A readable view of an active or archived run hash. This is the shape the
/// web layer polls and the history API returns.
#[derive(Debug, Clone, Serialize)]
pub struct RunSnapshot {
    pub run_id: String,
    pub state: String,
    pub current_stage: Option<String>,
    pub queued_at: Option<String>,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub error_stage: Option<String>,
    pub error_message: Option<String>,
    pub total_moments: Option<u32>,
    pub recoverable_failures: Option<u32>,
    pub stages: BTreeMap<String, StageSnapshot>,
}

impl RunSnapshot {
    /// Parse a snapshot out of hash fields. The lock token is internal and
    /// never surfaces here.
    pub fn from_fields(fields: &HashMap<String, String>) -> Self {
        let mut stages = BTreeMap::new();
        for stage in STAGE_ORDER {
            let snapshot = StageSnapshot {
                state: fields
                    .get(&stage_field(stage, "state"))
                    .cloned()
                    .unwrap_or_else(|| StageState::Pending.as_str().to_string()),
                started_at: fields.get(&stage_field(stage, "started_at")).cloned(),
                completed_at: fields.get(&stage_field(stage, "completed_at")).cloned(),
                error: fields.get(&stage_field(stage, "error")).cloned(),
                skip_reason: fields.get(&stage_field(stage, "skip_reason")).cloned(),
            };
            stages.insert(stage.as_str().to_string(), snapshot);
        }

        Self {
            run_id: fields.get("run_id").cloned().unwrap_or_default(),
            state: fields.get("state").cloned().unwrap_or_default(),
            current_stage: fields.get("current_stage").cloned(),
            queued_at: fields.get("queued_at").cloned(),
            started_at: fields.get("started_at").cloned(),
            completed_at: fields.get("completed_at").cloned(),
            error_stage: fields.get("error_stage").cloned(),
            error_message: fields.get("error_message").cloned(),
            total_moments: fields.get("total_moments").and_then(|v| v.parse().ok()),
            recoverable_failures: fields
                .get("recoverable_failures")
                .and_then(|v| v.parse().ok()),
            stages,
        }
    }
}

/// Writer for the `pipeline:{subject}:active` hash and cancel flags.
#[derive(Clone)]
pub struct StatusManager {
    coord: CoordStore,
}

impl StatusManager {
    pub fn new(coord: CoordStore) -> Self {
        Self { coord }
    }

    /// Initialize the active hash for a freshly accepted run: run id, queued
    /// state, lock token for worker adoption, and every stage pending.
    pub async fn init_active(
        &self,
        subject_id: &str,
        run_id: &str,
        lock_token: &str,
    ) -> Result<()> {
        let mut fields = vec![
            ("run_id".to_string(), run_id.to_string()),
            ("state".to_string(), RunState::Queued.as_str().to_string()),
            ("queued_at".to_string(), Utc::now().to_rfc3339()),
            ("lock_token".to_string(), lock_token.to_string()),
        ];
        for stage in STAGE_ORDER {
            fields.push((
                stage_field(stage, "state"),
                StageState::Pending.as_str().to_string(),
            ));
        }
        self.coord
            .hset_multiple(&keys::active(subject_id), &fields)
            .await
    }

    /// Transition the run-level state. Terminal states are absorbing: a
    /// second terminal transition is an [`Error::InvalidStateTransition`].
    pub async fn set_state(&self, subject_id: &str, state: RunState) -> Result<()> {
        let key = keys::active(subject_id);
        let current = self
            .coord
            .hget(&key, "state")
            .await?
            .and_then(|raw| RunState::parse(&raw));

        if let Some(current) = current
            && current.is_terminal()
        {
            return Err(Error::InvalidStateTransition {
                from: current.as_str().to_string(),
                to: state.as_str().to_string(),
            });
        }

        let mut fields = vec![("state".to_string(), state.as_str().to_string())];
        match state {
            RunState::Running => fields.push(("started_at".to_string(), Utc::now().to_rfc3339())),
            s if s.is_terminal() => {
                fields.push(("completed_at".to_string(), Utc::now().to_rfc3339()))
            }
            _ => {}
        }
        self.coord.hset_multiple(&key, &fields).await
    }

    pub async fn set_error(&self, subject_id: &str, stage: StageId, message: &str) -> Result<()> {
        self.coord
            .hset_multiple(
                &keys::active(subject_id),
                &[
                    ("error_stage".to_string(), stage.as_str().to_string()),
                    ("error_message".to_string(), message.to_string()),
                ],
            )
            .await
    }

    /// Reset an active hash for a restarted run (a reclaim after a worker
    /// crash): stage states back to pending, progress and error fields
    /// cleared, run state back to queued. Bypasses the monotonic guards on
    /// purpose; only the lock holder may call it.
    pub async fn reset_for_restart(&self, subject_id: &str) -> Result<()> {
        let key = keys::active(subject_id);

        let mut stale: Vec<String> = vec![
            "current_stage".to_string(),
            "started_at".to_string(),
            "completed_at".to_string(),
            "error_stage".to_string(),
            "error_message".to_string(),
        ];
        let mut fields = vec![("state".to_string(), RunState::Queued.as_str().to_string())];
        for stage in STAGE_ORDER {
            fields.push((
                stage_field(stage, "state"),
                StageState::Pending.as_str().to_string(),
            ));
            for suffix in ["started_at", "completed_at", "error", "skip_reason"] {
                stale.push(stage_field(stage, suffix));
            }
        }

        self.coord.hdel(&key, &stale).await?;
        self.coord.hset_multiple(&key, &fields).await
    }

    /// Record a run-level failure that is not attributable to a stage
    /// (e.g. payload validation before execution).
    pub async fn set_error_message(&self, subject_id: &str, message: &str) -> Result<()> {
        self.coord
            .hset_multiple(
                &keys::active(subject_id),
                &[("error_message".to_string(), message.to_string())],
            )
            .await
    }

    pub async fn mark_stage_started(&self, subject_id: &str, stage: StageId) -> Result<()> {
        self.transition_stage(subject_id, stage, StageState::Running, None)
            .await?;
        self.coord
            .hset_multiple(
                &keys::active(subject_id),
                &[
                    ("current_stage".to_string(), stage.as_str().to_string()),
                    (stage_field(stage, "started_at"), Utc::now().to_rfc3339()),
                ],
            )
            .await
    }

    pub async fn mark_stage_completed(&self, subject_id: &str, stage: StageId) -> Result<()> {
        self.transition_stage(subject_id, stage, StageState::Completed, None)
            .await
    }

    pub async fn mark_stage_skipped(
        &self,
        subject_id: &str,
        stage: StageId,
        reason: &str,
    ) -> Result<()> {
        debug!(subject_id = %subject_id, stage = %stage, reason = %reason, "Stage skipped");
        self.transition_stage(
            subject_id,
            stage,
            StageState::Skipped,
            Some((stage_field(stage, "skip_reason"), reason.to_string())),
        )
        .await
    }

    pub async fn mark_stage_failed(
        &self,
        subject_id: &str,
        stage: StageId,
        error: &str,
    ) -> Result<()> {
        self.transition_stage(
            subject_id,
            stage,
            StageState::Failed,
            Some((stage_field(stage, "error"), error.to_string())),
        )
        .await?;
        self.set_error(subject_id, stage, error).await
    }

    async fn transition_stage(
        &self,
        subject_id: &str,
        stage: StageId,
        to: StageState,
        extra: Option<(String, String)>,
    ) -> Result<()> {
        let key = keys::active(subject_id);
        let state_field = stage_field(stage, "state");
        let current = self
            .coord
            .hget(&key, &state_field)
            .await?
            .and_then(|raw| StageState::parse(&raw))
            .unwrap_or(StageState::Pending);

        if to.rank() <= current.rank() {
            return Err(Error::InvalidStateTransition {
                from: format!("{}:{}", stage, current.as_str()),
                to: format!("{}:{}", stage, to.as_str()),
            });
        }

        let mut fields = vec![(state_field, to.as_str().to_string())];
        if to.is_terminal() {
            fields.push((stage_field(stage, "completed_at"), Utc::now().to_rfc3339()));
        }
        if let Some(extra) = extra {
            fields.push(extra);
        }
        self.coord.hset_multiple(&key, &fields).await
    }

    /// Read the active hash; `None` when no run is active.
    pub async fn get_active(
        &self,
        subject_id: &str,
    ) -> Result<Option<std::collections::HashMap<String, String>>> {
        let fields = self.coord.hgetall(&keys::active(subject_id)).await?;
        Ok(if fields.is_empty() { None } else { Some(fields) })
    }

    pub async fn delete_active(&self, subject_id: &str) -> Result<()> {
        self.coord.del(&keys::active(subject_id)).await
    }

    // ---- cancellation ----

    /// Request a graceful stop of the subject's active run. Idempotent; the
    /// flag expires on its own if no worker observes it.
    pub async fn request_cancel(&self, subject_id: &str) -> Result<()> {
        self.coord
            .set_ex(&keys::cancel(subject_id), "1", CANCEL_TTL_SECS)
            .await
    }

    /// Checked at every stage boundary and in-stage checkpoint.
    pub async fn is_cancel_requested(&self, subject_id: &str) -> Result<bool> {
        self.coord.exists(&keys::cancel(subject_id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn manager() -> StatusManager {
        let status = StatusManager::new(CoordStore::memory());
        status.init_active("s", "r-1", "tok").await.unwrap();
        status
    }

    #[tokio::test]
    async fn test_init_active_marks_every_stage_pending() {
        let status = manager().await;
        let active = status.get_active("s").await.unwrap().unwrap();
        assert_eq!(active.get("state").unwrap(), "queued");
        assert_eq!(active.get("run_id").unwrap(), "r-1");
        assert_eq!(active.get("lock_token").unwrap(), "tok");
        for stage in STAGE_ORDER {
            assert_eq!(
                active.get(&format!("{}_state", stage.as_str())).unwrap(),
                "pending"
            );
        }
    }

    #[tokio::test]
    async fn test_stage_transitions_are_monotonic() {
        let status = manager().await;
        status.mark_stage_started("s", StageId::Download).await.unwrap();
        status.mark_stage_completed("s", StageId::Download).await.unwrap();

        // completed -> running is backwards.
        let err = status
            .mark_stage_started("s", StageId::Download)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidStateTransition { .. }));

        // completed -> failed is a second terminal transition.
        let err = status
            .mark_stage_failed("s", StageId::Download, "late error")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidStateTransition { .. }));
    }

    #[tokio::test]
    async fn test_run_terminal_state_is_absorbing() {
        let status = manager().await;
        status.set_state("s", RunState::Running).await.unwrap();
        status.set_state("s", RunState::Completed).await.unwrap();

        for next in [RunState::Running, RunState::Failed, RunState::Cancelled] {
            let err = status.set_state("s", next).await.unwrap_err();
            assert!(matches!(err, Error::InvalidStateTransition { .. }));
        }
    }

    #[tokio::test]
    async fn test_failed_stage_records_error_fields() {
        let status = manager().await;
        status.mark_stage_started("s", StageId::Transcribe).await.unwrap();
        status
            .mark_stage_failed("s", StageId::Transcribe, "asr unreachable")
            .await
            .unwrap();

        let active = status.get_active("s").await.unwrap().unwrap();
        assert_eq!(active.get("transcribe_state").unwrap(), "failed");
        assert_eq!(active.get("transcribe_error").unwrap(), "asr unreachable");
        assert_eq!(active.get("error_stage").unwrap(), "transcribe");
        assert_eq!(active.get("error_message").unwrap(), "asr unreachable");
    }

    #[tokio::test]
    async fn test_set_error_message_without_stage() {
        let status = manager().await;
        status
            .set_error_message("s", "model not registered: vl")
            .await
            .unwrap();

        let active = status.get_active("s").await.unwrap().unwrap();
        assert_eq!(
            active.get("error_message").unwrap(),
            "model not registered: vl"
        );
        assert!(!active.contains_key("error_stage"));
    }

    #[tokio::test]
    async fn test_cancel_flag_round_trip() {
        let status = manager().await;
        assert!(!status.is_cancel_requested("s").await.unwrap());
        status.request_cancel("s").await.unwrap();
        assert!(status.is_cancel_requested("s").await.unwrap());
    }

    #[tokio::test]
    async fn test_snapshot_exposes_stage_map_without_lock_token() {
        let status = manager().await;
        status.mark_stage_started("s", StageId::Download).await.unwrap();
        status
            .mark_stage_skipped("s", StageId::ClipExtract, "no video capability")
            .await
            .unwrap();

        let fields = status.get_active("s").await.unwrap().unwrap();
        let snapshot = RunSnapshot::from_fields(&fields);
        assert_eq!(snapshot.run_id, "r-1");
        assert_eq!(snapshot.stages.get("download").unwrap().state, "running");
        assert_eq!(
            snapshot
                .stages
                .get("clip_extract")
                .unwrap()
                .skip_reason
                .as_deref(),
            Some("no video capability")
        );
        assert_eq!(snapshot.current_stage.as_deref(), Some("download"));
    }
}
