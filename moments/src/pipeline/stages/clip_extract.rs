//! Clip extraction stage: one codec subprocess per moment, fanned out under
//! the clip-extraction semaphore, with padding clamped to media bounds.
//!
//! A single failed clip is recoverable: the moment is marked clip-failed and
//! later stages tolerate the missing clip.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinSet;
use tracing::{info, warn};

use super::ensure_local_media;
use crate::governor::{ConcurrencyGovernor, GovernedResource};
use crate::media::{MediaCodec, clamp_window};
use crate::pipeline::context::RunContext;
use crate::pipeline::probe::CancelProbe;
use crate::pipeline::stage::{PipelineStage, StageId, StageOutcome};
use crate::registry::ModelRegistry;
use crate::storage::{ObjectStore, VideoRepository};
use crate::Result;

pub struct ClipExtractStage {
    registry: Arc<ModelRegistry>,
    codec: Arc<dyn MediaCodec>,
    object_store: Arc<dyn ObjectStore>,
    videos: Arc<dyn VideoRepository>,
    governor: Arc<ConcurrencyGovernor>,
}

impl ClipExtractStage {
    pub fn new(
        registry: Arc<ModelRegistry>,
        codec: Arc<dyn MediaCodec>,
        object_store: Arc<dyn ObjectStore>,
        videos: Arc<dyn VideoRepository>,
        governor: Arc<ConcurrencyGovernor>,
    ) -> Self {
        Self {
            registry,
            codec,
            object_store,
            videos,
            governor,
        }
    }
}

#[async_trait]
impl PipelineStage for ClipExtractStage {
    fn id(&self) -> StageId {
        StageId::ClipExtract
    }

    // Permits are taken per clip inside the fan-out, not per stage.

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
        if ctx.moments.is_empty() {
            return Ok(StageOutcome::completed());
        }

        ensure_local_media(ctx, &self.videos, &self.object_store, &self.codec).await?;
        let media_path = ctx.require_local_media()?.to_path_buf();
        let duration = ctx.require_media_info()?.duration_seconds;
        let pad_left = ctx.config.padding_left_seconds;
        let pad_right = ctx.config.padding_right_seconds;

        let mut tasks: JoinSet<(usize, Result<PathBuf>)> = JoinSet::new();
        for (idx, entry) in ctx.moments.iter().enumerate() {
            // Checkpoint per clip iteration.
            probe.check().await?;

            let permit = self
                .governor
                .acquire(GovernedResource::ClipExtract, probe)
                .await?;

            let (start, end) = clamp_window(
                entry.record.start_time,
                entry.record.end_time,
                pad_left,
                pad_right,
                duration,
            );
            let codec = self.codec.clone();
            let input = media_path.clone();
            let output = ctx.scratch_path(&format!("clip_{}.mp4", entry.record.id));

            tasks.spawn(async move {
                let _permit = permit;
                let result = codec
                    .cut_clip(&input, &output, start, end)
                    .await
                    .map(|()| output);
                (idx, result)
            });
        }

        let mut failures = 0u32;
        while let Some(joined) = tasks.join_next().await {
            let (idx, result) = joined
                .map_err(|e| crate::Error::Pipeline(format!("clip task panicked: {e}")))?;
            match result {
                Ok(path) => {
                    ctx.moments[idx].clip_path = Some(path);
                }
                Err(e) => {
                    warn!(
                        subject_id = %ctx.subject_id,
                        moment_id = ctx.moments[idx].record.id,
                        error = %e,
                        "Clip extraction failed for one moment"
                    );
                    ctx.moments[idx].clip_failed = true;
                    failures += 1;
                }
            }
        }

        info!(
            subject_id = %ctx.subject_id,
            clips = ctx.moments.iter().filter(|m| m.clip_path.is_some()).count(),
            failures,
            "Clip extraction finished"
        );
        Ok(StageOutcome::with_failures(failures))
    }
}
