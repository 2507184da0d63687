//! Stage runtime and run orchestration.

pub mod context;
pub mod orchestrator;
pub mod probe;
pub mod stage;
pub mod stages;

pub use context::{MomentEntry, RunContext};
pub use orchestrator::{ExecuteOptions, Orchestrator, RunOutcome};
pub use probe::CancelProbe;
pub use stage::{PipelineStage, RunState, STAGE_ORDER, StageId, StageOutcome, StageState};
