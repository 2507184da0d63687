//! Download stage: fetch the source media, probe it, upload the full-length
//! copy to the object store, and register subject metadata.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use super::{download_to_file, hydrate_video};
use crate::media::MediaCodec;
use crate::pipeline::context::RunContext;
use crate::pipeline::probe::CancelProbe;
use crate::pipeline::stage::{PipelineStage, StageId, StageOutcome};
use crate::storage::{NewVideo, ObjectStore, VideoRepository};
use crate::{Error, Result};

pub struct DownloadStage {
    http: reqwest::Client,
    codec: Arc<dyn MediaCodec>,
    object_store: Arc<dyn ObjectStore>,
    videos: Arc<dyn VideoRepository>,
}

impl DownloadStage {
    pub fn new(
        http: reqwest::Client,
        codec: Arc<dyn MediaCodec>,
        object_store: Arc<dyn ObjectStore>,
        videos: Arc<dyn VideoRepository>,
    ) -> Self {
        Self {
            http,
            codec,
            object_store,
            videos,
        }
    }

    fn source_url(&self, ctx: &RunContext) -> Result<String> {
        if let Some(video) = &ctx.video {
            return Ok(video.source_url.clone());
        }
        ctx.config.source_url.clone().ok_or_else(|| {
            Error::validation(format!(
                "subject {} is not registered and no source_url was provided",
                ctx.subject_id
            ))
        })
    }
}

#[async_trait]
impl PipelineStage for DownloadStage {
    fn id(&self) -> StageId {
        StageId::Download
    }

    async fn should_skip(&self, ctx: &RunContext) -> Result<Option<String>> {
        if ctx.config.force_download {
            return Ok(None);
        }
        let registered = self.videos.get_by_subject(&ctx.subject_id).await?;
        match registered {
            Some(video) if video.cloud_url.is_some() => Ok(Some(
                "subject already has a registered cloud copy".to_string(),
            )),
            _ => Ok(None),
        }
    }

    async fn run(&self, ctx: &mut RunContext, probe: &CancelProbe) -> Result<StageOutcome> {
        // Re-download of a registered subject reuses its stored source URL.
        match hydrate_video(ctx, &self.videos).await {
            Ok(()) | Err(Error::NotFound { .. }) => {}
            Err(e) => return Err(e),
        }
        let source_url = self.source_url(ctx)?;

        let local_path = ctx.scratch_path("source.mp4");
        let bytes = download_to_file(&self.http, &source_url, &local_path, probe).await?;
        info!(subject_id = %ctx.subject_id, bytes, "Source media downloaded");

        let info = self.codec.probe(&local_path).await?;

        let key = format!("media/{}/{}.mp4", ctx.subject_id, ctx.run_id);
        let cloud_url = self
            .object_store
            .put_file(&key, &local_path, "video/mp4")
            .await?;

        match &ctx.video {
            Some(video) => {
                self.videos.set_cloud_url(video.id, &cloud_url).await?;
                let mut updated = video.clone();
                updated.cloud_url = Some(cloud_url);
                ctx.video = Some(updated);
            }
            None => {
                let record = self
                    .videos
                    .create(NewVideo {
                        subject_id: ctx.subject_id.clone(),
                        source_url,
                        cloud_url: Some(cloud_url),
                        duration_seconds: info.duration_seconds,
                        width: info.width,
                        height: info.height,
                        fps: info.fps,
                        video_codec: info.video_codec.clone(),
                        audio_codec: info.audio_codec.clone(),
                        size_bytes: info.size_bytes,
                    })
                    .await?;
                ctx.video = Some(record);
            }
        }

        ctx.media_info = Some(info);
        ctx.local_media_path = Some(local_path);
        Ok(StageOutcome::completed())
    }
}
