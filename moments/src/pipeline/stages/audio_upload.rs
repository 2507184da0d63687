//! Audio upload stage: put the extracted audio in the object store and keep a
//! signed read URL in the context.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::pipeline::context::RunContext;
use crate::pipeline::probe::CancelProbe;
use crate::pipeline::stage::{PipelineStage, StageId, StageOutcome};
use crate::storage::object_store::{DEFAULT_SIGN_EXPIRY_SECS, ObjectStore, key_from_url};
use crate::Result;

pub struct AudioUploadStage {
    object_store: Arc<dyn ObjectStore>,
}

impl AudioUploadStage {
    pub fn new(object_store: Arc<dyn ObjectStore>) -> Self {
        Self { object_store }
    }
}

#[async_trait]
impl PipelineStage for AudioUploadStage {
    fn id(&self) -> StageId {
        StageId::AudioUpload
    }

    async fn should_skip(&self, _ctx: &RunContext) -> Result<Option<String>> {
        Ok(None)
    }

    async fn run(&self, ctx: &mut RunContext, probe: &CancelProbe) -> Result<StageOutcome> {
        probe.check().await?;
        let audio_path = ctx.require_local_audio()?.to_path_buf();

        let key = format!("audio/{}/{}.mp3", ctx.subject_id, ctx.run_id);
        let url = self
            .object_store
            .put_file(&key, &audio_path, "audio/mpeg")
            .await?;
        let signed = self
            .object_store
            .signed_url(key_from_url(&url), DEFAULT_SIGN_EXPIRY_SECS)
            .await?;

        info!(subject_id = %ctx.subject_id, key = %key, "Audio uploaded");
        ctx.audio_key = Some(key);
        ctx.audio_url = Some(signed);
        Ok(StageOutcome::completed())
    }
}
