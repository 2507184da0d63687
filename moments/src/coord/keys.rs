//! Coordination store key layout.
//!
//! Single source of truth for every key the engine reads or writes.

/// Stream of pending run submissions.
pub const REQUESTS_STREAM: &str = "pipeline:requests";

/// Default consumer group on [`REQUESTS_STREAM`].
pub const WORKERS_GROUP: &str = "pipeline_workers";

/// Set of registered model keys.
pub const MODEL_KEYS: &str = "model:config:_keys";

/// Per-subject mutex holder token. TTL-bound, refreshable.
pub fn lock(subject_id: &str) -> String {
    format!("pipeline:{subject_id}:lock")
}

/// Per-subject cancellation request flag. Short TTL.
pub fn cancel(subject_id: &str) -> String {
    format!("pipeline:{subject_id}:cancel")
}

/// Live run status hash for the subject's active run.
pub fn active(subject_id: &str) -> String {
    format!("pipeline:{subject_id}:active")
}

/// Archived run snapshot hash.
pub fn run(run_id: &str) -> String {
    format!("pipeline:run:{run_id}")
}

/// Per-subject sorted set of archived run ids, scored by completion epoch ms.
pub fn history(subject_id: &str) -> String {
    format!("pipeline:{subject_id}:history")
}

/// Model descriptor hash.
pub fn model_config(model_key: &str) -> String {
    format!("model:config:{model_key}")
}
