//! Stage abstraction and run/stage state machines.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::Result;
use crate::governor::GovernedResource;
use crate::pipeline::context::RunContext;
use crate::pipeline::probe::CancelProbe;

/// The fixed set of pipeline stages, in no particular order here;
/// [`STAGE_ORDER`] defines execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageId {
    Download,
    AudioExtract,
    AudioUpload,
    Transcribe,
    MomentGeneration,
    ClipExtract,
    ClipUpload,
    Refinement,
}

/// Execution order of the stages within one run.
pub const STAGE_ORDER: [StageId; 8] = [
    StageId::Download,
    StageId::AudioExtract,
    StageId::AudioUpload,
    StageId::Transcribe,
    StageId::MomentGeneration,
    StageId::ClipExtract,
    StageId::ClipUpload,
    StageId::Refinement,
];

impl StageId {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Download => "download",
            Self::AudioExtract => "audio_extract",
            Self::AudioUpload => "audio_upload",
            Self::Transcribe => "transcribe",
            Self::MomentGeneration => "moment_generation",
            Self::ClipExtract => "clip_extract",
            Self::ClipUpload => "clip_upload",
            Self::Refinement => "refinement",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        STAGE_ORDER.iter().copied().find(|s| s.as_str() == raw)
    }

    /// Declared predecessors. The orchestrator enforces total order anyway;
    /// this documents the data dependencies between stages.
    pub fn requires(&self) -> &'static [StageId] {
        match self {
            Self::Download => &[],
            Self::AudioExtract => &[StageId::Download],
            Self::AudioUpload => &[StageId::AudioExtract],
            Self::Transcribe => &[StageId::AudioUpload],
            Self::MomentGeneration => &[StageId::Transcribe],
            Self::ClipExtract => &[StageId::MomentGeneration],
            Self::ClipUpload => &[StageId::ClipExtract],
            Self::Refinement => &[StageId::MomentGeneration],
        }
    }
}

impl std::fmt::Display for StageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-stage state. Transitions are monotonic:
/// pending -> running -> {completed | skipped | failed}.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    Pending,
    Running,
    Completed,
    Skipped,
    Failed,
}

impl StageState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "skipped" => Some(Self::Skipped),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Position in the monotonic transition order.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Running => 1,
            Self::Completed | Self::Skipped | Self::Failed => 2,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.rank() == 2
    }
}

/// Run-level state. Terminal states are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
    Partial,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Partial => "partial",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            "partial" => Some(Self::Partial),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled | Self::Partial)
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Successful stage result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StageOutcome {
    /// Per-item failures the stage absorbed (one clip, one refinement).
    /// Any non-zero count makes the run end as `partial`.
    pub recoverable_failures: u32,
}

impl StageOutcome {
    pub fn completed() -> Self {
        Self::default()
    }

    pub fn with_failures(recoverable_failures: u32) -> Self {
        Self {
            recoverable_failures,
        }
    }
}

/// A unit of work within a run.
///
/// Stages receive the run context mutably and communicate forward exclusively
/// through it; the orchestrator owns ordering, status reporting, permits and
/// cancellation checks at the boundaries.
#[async_trait]
pub trait PipelineStage: Send + Sync {
    fn id(&self) -> StageId;

    /// Governor resource the orchestrator must hold while the stage runs.
    /// `None` for stages that are pure I/O glue or manage permits internally
    /// (clip extraction fans out under its own per-clip permits).
    fn resource(&self) -> Option<GovernedResource> {
        None
    }

    /// Evaluated before any resource acquisition; `Some(reason)` skips the
    /// stage.
    async fn should_skip(&self, ctx: &RunContext) -> Result<Option<String>>;

    /// Perform the work. Long stages must call `probe.check()` at designated
    /// checkpoints (per-clip, per-moment iterations).
    async fn run(&self, ctx: &mut RunContext, probe: &CancelProbe) -> Result<StageOutcome>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_order_is_fixed() {
        assert_eq!(STAGE_ORDER[0], StageId::Download);
        assert_eq!(STAGE_ORDER[7], StageId::Refinement);
        assert_eq!(STAGE_ORDER.len(), 8);
    }

    #[test]
    fn test_stage_requires_precede_in_order() {
        for (idx, stage) in STAGE_ORDER.iter().enumerate() {
            for dep in stage.requires() {
                let dep_idx = STAGE_ORDER.iter().position(|s| s == dep).unwrap();
                assert!(dep_idx < idx, "{dep} must precede {stage}");
            }
        }
    }

    #[test]
    fn test_stage_state_monotonic_ranks() {
        assert!(StageState::Pending.rank() < StageState::Running.rank());
        assert!(StageState::Running.rank() < StageState::Completed.rank());
        assert_eq!(StageState::Completed.rank(), StageState::Skipped.rank());
        assert!(StageState::Failed.is_terminal());
        assert!(!StageState::Running.is_terminal());
    }

    #[test]
    fn test_run_state_terminal_set() {
        for state in [RunState::Completed, RunState::Failed, RunState::Cancelled, RunState::Partial] {
            assert!(state.is_terminal());
        }
        assert!(!RunState::Queued.is_terminal());
        assert!(!RunState::Running.is_terminal());
    }

    #[test]
    fn test_stage_id_parse_round_trip() {
        for stage in STAGE_ORDER {
            assert_eq!(StageId::parse(stage.as_str()), Some(stage));
        }
        assert_eq!(StageId::parse("bogus"), None);
    }
}
