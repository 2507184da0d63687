//! Enqueue adapter: the interface the web layer calls to submit jobs, read
//! status, cancel, and page history.

use std::sync::Arc;

use tracing::{info, warn};

use crate::coord::{CoordStore, keys};
use crate::domain::{RunConfig, RunRequest};
use crate::lock::LockManager;
use crate::queue::RequestQueue;
use crate::registry::ModelRegistry;
use crate::status::{RunSnapshot, StatusManager};
use crate::{Error, Result};

/// A freshly accepted submission.
#[derive(Debug, Clone)]
pub struct RunAccepted {
    pub run_id: String,
}

/// Library seam the web layer drives.
pub struct EnqueueService {
    coord: CoordStore,
    locks: Arc<LockManager>,
    status: StatusManager,
    registry: Arc<ModelRegistry>,
    queue: RequestQueue,
}

impl EnqueueService {
    pub fn new(
        coord: CoordStore,
        locks: Arc<LockManager>,
        status: StatusManager,
        registry: Arc<ModelRegistry>,
        queue: RequestQueue,
    ) -> Self {
        Self {
            coord,
            locks,
            status,
            registry,
            queue,
        }
    }

    /// Validate, lock, initialize status and append to the stream.
    ///
    /// Errors map to API responses: [`Error::Validation`] is a 400-class
    /// rejection, [`Error::Conflict`] a 409 while a prior run is active.
    pub async fn submit(&self, subject_id: &str, config: RunConfig) -> Result<RunAccepted> {
        if subject_id.trim().is_empty() {
            return Err(Error::validation("subject_id must not be empty"));
        }
        config.validate()?;
        self.require_model(&config.generation_model).await?;
        self.require_model(&config.refinement_model).await?;

        let lock = self.locks.acquire(subject_id).await?;

        // Anything failing past this point must not leave a dangling lock.
        let request = RunRequest::new(subject_id, config);
        let enqueued = async {
            self.status
                .init_active(subject_id, &request.run_id, &lock.token)
                .await?;
            self.queue.submit(&request).await?;
            Ok::<_, Error>(())
        }
        .await;

        if let Err(e) = enqueued {
            warn!(subject_id = %subject_id, error = %e, "Submit failed after lock; rolling back");
            let _ = self.coord.del(&keys::active(subject_id)).await;
            let _ = self.locks.release(&lock).await;
            return Err(e);
        }

        info!(subject_id = %subject_id, run_id = %request.run_id, "Run accepted");
        Ok(RunAccepted {
            run_id: request.run_id,
        })
    }

    /// Active run status, or the latest archived run when none is active.
    pub async fn status(&self, subject_id: &str) -> Result<RunSnapshot> {
        if let Some(fields) = self.status.get_active(subject_id).await? {
            return Ok(RunSnapshot::from_fields(&fields));
        }

        let recent = self
            .coord
            .zrev_by_score(&keys::history(subject_id), 1)
            .await?;
        let Some(run_id) = recent.first() else {
            return Err(Error::not_found("PipelineRun", subject_id));
        };
        let fields = self.coord.hgetall(&keys::run(run_id)).await?;
        if fields.is_empty() {
            // Snapshot hash expired; only the history index remains.
            return Err(Error::not_found("PipelineRun", run_id));
        }
        Ok(RunSnapshot::from_fields(&fields))
    }

    /// Request a graceful stop. Idempotent.
    pub async fn cancel(&self, subject_id: &str) -> Result<()> {
        self.status.request_cancel(subject_id).await
    }

    /// Most recent archived runs, newest first. Runs whose snapshot hash
    /// already expired are skipped.
    pub async fn history(&self, subject_id: &str, limit: usize) -> Result<Vec<RunSnapshot>> {
        let run_ids = self
            .coord
            .zrev_by_score(&keys::history(subject_id), limit as isize)
            .await?;

        let mut snapshots = Vec::with_capacity(run_ids.len());
        for run_id in run_ids {
            let fields = self.coord.hgetall(&keys::run(&run_id)).await?;
            if !fields.is_empty() {
                snapshots.push(RunSnapshot::from_fields(&fields));
            }
        }
        Ok(snapshots)
    }

    async fn require_model(&self, model_key: &str) -> Result<()> {
        match self.registry.get(model_key).await {
            Ok(_) => Ok(()),
            Err(Error::ModelNotRegistered(key)) => Err(Error::validation(format!(
                "unknown model key: {key}"
            ))),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{GenerationParams, PipelineType};
    use crate::pipeline::stage::RunState;

    fn config() -> RunConfig {
        RunConfig {
            generation_model: "vl".to_string(),
            refinement_model: "text".to_string(),
            generation_params: GenerationParams::default(),
            padding_left_seconds: 1.0,
            padding_right_seconds: 1.0,
            min_moments: None,
            max_moments: None,
            min_moment_length: None,
            max_moment_length: None,
            source_url: Some("https://media.example/v.mp4".to_string()),
            force_download: false,
            pipeline_type: PipelineType::Full,
        }
    }

    async fn service() -> (EnqueueService, CoordStore) {
        let coord = CoordStore::memory();
        let registry = Arc::new(ModelRegistry::new(coord.clone()));
        registry.seed_defaults().await.unwrap();
        let queue = RequestQueue::new(coord.clone(), keys::REQUESTS_STREAM, keys::WORKERS_GROUP);
        queue.ensure_group().await.unwrap();
        let service = EnqueueService::new(
            coord.clone(),
            Arc::new(LockManager::new(coord.clone())),
            StatusManager::new(coord.clone()),
            registry,
            queue,
        );
        (service, coord)
    }

    #[tokio::test]
    async fn test_submit_initializes_status_and_appends_entry() {
        let (service, coord) = service().await;
        let accepted = service.submit("subj", config()).await.unwrap();

        let snapshot = service.status("subj").await.unwrap();
        assert_eq!(snapshot.run_id, accepted.run_id);
        assert_eq!(snapshot.state, RunState::Queued.as_str());
        assert_eq!(snapshot.stages.get("download").unwrap().state, "pending");

        let queue = RequestQueue::new(coord, keys::REQUESTS_STREAM, keys::WORKERS_GROUP);
        let runs = queue.read("w", 100).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].request.run_id, accepted.run_id);
    }

    #[tokio::test]
    async fn test_duplicate_submit_conflicts_with_single_entry() {
        let (service, coord) = service().await;
        let first = service.submit("subj", config()).await;
        let second = service.submit("subj", config()).await;

        assert!(first.is_ok());
        assert!(matches!(second, Err(Error::Conflict(_))));

        // Exactly one stream entry was appended.
        let queue = RequestQueue::new(coord, keys::REQUESTS_STREAM, keys::WORKERS_GROUP);
        let runs = queue.read("w", 100).await.unwrap();
        assert_eq!(runs.len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_config_rejected_without_lock() {
        let (service, coord) = service().await;
        let mut bad = config();
        bad.padding_left_seconds = -1.0;

        let result = service.submit("subj", bad).await;
        assert!(matches!(result, Err(Error::Validation(_))));
        assert!(!coord.exists(&keys::lock("subj")).await.unwrap());
    }

    #[tokio::test]
    async fn test_unknown_model_key_is_validation_error() {
        let (service, _coord) = service().await;
        let mut bad = config();
        bad.generation_model = "does-not-exist".to_string();
        let result = service.submit("subj", bad).await;
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn test_status_missing_subject_is_not_found() {
        let (service, _coord) = service().await;
        assert!(matches!(
            service.status("ghost").await,
            Err(Error::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_status_falls_back_to_archived_run() {
        let (service, coord) = service().await;

        // Simulate an archived run: history entry plus snapshot hash, no
        // active hash.
        coord
            .hset_multiple(
                &keys::run("r-9"),
                &[
                    ("run_id".to_string(), "r-9".to_string()),
                    ("state".to_string(), "completed".to_string()),
                ],
            )
            .await
            .unwrap();
        coord
            .zadd(&keys::history("subj"), "r-9", 1_000.0)
            .await
            .unwrap();

        let snapshot = service.status("subj").await.unwrap();
        assert_eq!(snapshot.run_id, "r-9");
        assert_eq!(snapshot.state, "completed");
    }

    #[tokio::test]
    async fn test_history_orders_newest_first() {
        let (service, coord) = service().await;
        for (run_id, score) in [("r-1", 1_000.0), ("r-2", 2_000.0), ("r-3", 3_000.0)] {
            coord
                .hset_multiple(
                    &keys::run(run_id),
                    &[
                        ("run_id".to_string(), run_id.to_string()),
                        ("state".to_string(), "completed".to_string()),
                    ],
                )
                .await
                .unwrap();
            coord
                .zadd(&keys::history("subj"), run_id, score)
                .await
                .unwrap();
        }

        let history = service.history("subj", 2).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].run_id, "r-3");
        assert_eq!(history[1].run_id, "r-2");
    }

    #[tokio::test]
    async fn test_cancel_sets_flag_idempotently() {
        let (service, coord) = service().await;
        service.cancel("subj").await.unwrap();
        service.cancel("subj").await.unwrap();
        assert!(coord.exists(&keys::cancel("subj")).await.unwrap());
    }
}
