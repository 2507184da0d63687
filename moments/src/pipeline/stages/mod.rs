//! The eight pipeline stages, in their fixed order.

mod audio_extract;
mod audio_upload;
mod clip_extract;
mod clip_upload;
mod download;
mod moment_generation;
mod refinement;
mod transcribe;

pub use audio_extract::AudioExtractStage;
pub use audio_upload::AudioUploadStage;
pub use clip_extract::ClipExtractStage;
pub use clip_upload::ClipUploadStage;
pub use download::DownloadStage;
pub use moment_generation::MomentGenerationStage;
pub use refinement::RefinementStage;
pub use transcribe::TranscribeStage;

use std::path::Path;
use std::sync::Arc;

use futures::StreamExt;
use tokio::io::AsyncWriteExt;

use crate::media::MediaCodec;
use crate::pipeline::context::RunContext;
use crate::pipeline::probe::CancelProbe;
use crate::storage::{ObjectStore, VideoRepository, object_store::key_from_url};
use crate::{Error, Result};

/// How many download chunks to write between cancellation checks.
const CANCEL_CHECK_CHUNKS: usize = 64;

/// Load the subject's video record into the context if it is not there yet.
pub(crate) async fn hydrate_video(
    ctx: &mut RunContext,
    videos: &Arc<dyn VideoRepository>,
) -> Result<()> {
    if ctx.video.is_some() {
        return Ok(());
    }
    let record = videos
        .get_by_subject(&ctx.subject_id)
        .await?
        .ok_or_else(|| Error::not_found("Video", &ctx.subject_id))?;
    ctx.video = Some(record);
    Ok(())
}

/// Make sure the source media exists locally and its metadata is known.
///
/// When the download stage was skipped (the subject already had a cloud
/// copy), this pulls the object down and probes it.
pub(crate) async fn ensure_local_media(
    ctx: &mut RunContext,
    videos: &Arc<dyn VideoRepository>,
    object_store: &Arc<dyn ObjectStore>,
    codec: &Arc<dyn MediaCodec>,
) -> Result<()> {
    if ctx.local_media_path.is_none() {
        hydrate_video(ctx, videos).await?;
        let cloud_url = ctx
            .require_video()?
            .cloud_url
            .clone()
            .ok_or_else(|| Error::Pipeline("subject has neither local nor cloud media".to_string()))?;
        let dest = ctx.scratch_path("source.mp4");
        object_store
            .fetch_to_file(key_from_url(&cloud_url), &dest)
            .await?;
        ctx.local_media_path = Some(dest);
    }

    if ctx.media_info.is_none() {
        let path = ctx.require_local_media()?.to_path_buf();
        ctx.media_info = Some(codec.probe(&path).await?);
    }
    Ok(())
}

/// Stream an HTTP resource to a local file, observing cancellation between
/// chunk batches.
pub(crate) async fn download_to_file(
    http: &reqwest::Client,
    url: &str,
    dest: &Path,
    probe: &CancelProbe,
) -> Result<u64> {
    let response = http.get(url).send().await?.error_for_status()?;
    let mut stream = response.bytes_stream();
    let mut file = tokio::fs::File::create(dest).await?;

    let mut written: u64 = 0;
    let mut chunks_since_check = 0usize;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;

        chunks_since_check += 1;
        if chunks_since_check >= CANCEL_CHECK_CHUNKS {
            chunks_since_check = 0;
            probe.check().await?;
        }
    }
    file.flush().await?;
    Ok(written)
}
