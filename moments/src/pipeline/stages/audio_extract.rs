//! Audio extraction stage: codec subprocess produces an mp3 from the source
//! media in the run's scratch directory.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use super::ensure_local_media;
use crate::governor::GovernedResource;
use crate::media::MediaCodec;
use crate::pipeline::context::RunContext;
use crate::pipeline::probe::CancelProbe;
use crate::pipeline::stage::{PipelineStage, StageId, StageOutcome};
use crate::storage::{ObjectStore, VideoRepository};
use crate::Result;

pub struct AudioExtractStage {
    codec: Arc<dyn MediaCodec>,
    object_store: Arc<dyn ObjectStore>,
    videos: Arc<dyn VideoRepository>,
}

impl AudioExtractStage {
    pub fn new(
        codec: Arc<dyn MediaCodec>,
        object_store: Arc<dyn ObjectStore>,
        videos: Arc<dyn VideoRepository>,
    ) -> Self {
        Self {
            codec,
            object_store,
            videos,
        }
    }
}

#[async_trait]
impl PipelineStage for AudioExtractStage {
    fn id(&self) -> StageId {
        StageId::AudioExtract
    }

    fn resource(&self) -> Option<GovernedResource> {
        Some(GovernedResource::AudioExtract)
    }

    async fn should_skip(&self, _ctx: &RunContext) -> Result<Option<String>> {
        Ok(None)
    }

    async fn run(&self, ctx: &mut RunContext, probe: &CancelProbe) -> Result<StageOutcome> {
        // Covers the skipped-download path by pulling the cloud copy first.
        ensure_local_media(ctx, &self.videos, &self.object_store, &self.codec).await?;
        probe.check().await?;

        let input = ctx.require_local_media()?.to_path_buf();
        let output = ctx.scratch_path("audio.mp3");
        self.codec.extract_audio(&input, &output).await?;

        info!(subject_id = %ctx.subject_id, output = %output.display(), "Audio extracted");
        ctx.local_audio_path = Some(output);
        Ok(StageOutcome::completed())
    }
}
