//! Clip upload stage: put each extracted clip in the object store and persist
//! its record. Per-clip failures are recoverable.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::pipeline::context::RunContext;
use crate::pipeline::probe::CancelProbe;
use crate::pipeline::stage::{PipelineStage, StageId, StageOutcome};
use crate::registry::ModelRegistry;
use crate::storage::object_store::{DEFAULT_SIGN_EXPIRY_SECS, ObjectStore, key_from_url};
use crate::storage::{ClipRepository, NewClip};
use crate::Result;

pub struct ClipUploadStage {
    registry: Arc<ModelRegistry>,
    object_store: Arc<dyn ObjectStore>,
    clips: Arc<dyn ClipRepository>,
}

impl ClipUploadStage {
    pub fn new(
        registry: Arc<ModelRegistry>,
        object_store: Arc<dyn ObjectStore>,
        clips: Arc<dyn ClipRepository>,
    ) -> Self {
        Self {
            registry,
            object_store,
            clips,
        }
    }
}

#[async_trait]
impl PipelineStage for ClipUploadStage {
    fn id(&self) -> StageId {
        StageId::ClipUpload
    }

    async fn should_skip(&self, ctx: &RunContext) -> Result<Option<String>> {
        let descriptor = self.registry.get(&ctx.config.refinement_model).await?;
        if !descriptor.supports_video {
            return Ok(Some(format!(
                "refinement model {} does not accept video",
                descriptor.key
            )));
        }
        Ok(None)
    }

    async fn run(&self, ctx: &mut RunContext, probe: &CancelProbe) -> Result<StageOutcome> {
        let mut failures = 0u32;
        let mut uploaded = 0usize;
        let pad_left = ctx.config.padding_left_seconds;
        let pad_right = ctx.config.padding_right_seconds;
        let subject_id = ctx.subject_id.clone();
        let run_id = ctx.run_id.clone();

        for entry in ctx.moments.iter_mut() {
            probe.check().await?;

            // Moments whose extraction failed carry no clip to upload.
            let Some(clip_path) = entry.clip_path.clone() else {
                continue;
            };

            let key = format!("clips/{}/{}/{}.mp4", subject_id, run_id, entry.record.id);
            let upload = async {
                let url = self
                    .object_store
                    .put_file(&key, &clip_path, "video/mp4")
                    .await?;
                let signed = self
                    .object_store
                    .signed_url(key_from_url(&url), DEFAULT_SIGN_EXPIRY_SECS)
                    .await?;
                self.clips
                    .create(NewClip {
                        moment_id: entry.record.id,
                        cloud_url: url,
                        padding_left_seconds: pad_left,
                        padding_right_seconds: pad_right,
                    })
                    .await?;
                Ok::<_, crate::Error>(signed)
            };

            match upload.await {
                Ok(signed) => {
                    entry.clip_key = Some(key);
                    entry.clip_url = Some(signed);
                    uploaded += 1;
                }
                Err(e) => {
                    warn!(
                        subject_id = %subject_id,
                        moment_id = entry.record.id,
                        error = %e,
                        "Clip upload failed for one moment"
                    );
                    entry.clip_failed = true;
                    failures += 1;
                }
            }
        }

        info!(subject_id = %subject_id, uploaded, failures, "Clip upload finished");
        Ok(StageOutcome::with_failures(failures))
    }
}
