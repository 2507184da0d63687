//! Transcription stage: call the ASR service through its tunnel and persist
//! the transcript record.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::governor::GovernedResource;
use crate::inference::InferenceClient;
use crate::pipeline::context::RunContext;
use crate::pipeline::probe::CancelProbe;
use crate::pipeline::stage::{PipelineStage, StageId, StageOutcome};
use crate::registry::ModelRegistry;
use crate::storage::{NewTranscript, TranscriptRepository};
use crate::tunnel::TunnelManager;
use crate::Result;

pub struct TranscribeStage {
    tunnels: Arc<TunnelManager>,
    registry: Arc<ModelRegistry>,
    inference: Arc<InferenceClient>,
    transcripts: Arc<dyn TranscriptRepository>,
    /// Registry key of the transcription service.
    model_key: String,
}

impl TranscribeStage {
    pub fn new(
        tunnels: Arc<TunnelManager>,
        registry: Arc<ModelRegistry>,
        inference: Arc<InferenceClient>,
        transcripts: Arc<dyn TranscriptRepository>,
        model_key: impl Into<String>,
    ) -> Self {
        Self {
            tunnels,
            registry,
            inference,
            transcripts,
            model_key: model_key.into(),
        }
    }
}

#[async_trait]
impl PipelineStage for TranscribeStage {
    fn id(&self) -> StageId {
        StageId::Transcribe
    }

    fn resource(&self) -> Option<GovernedResource> {
        Some(GovernedResource::Transcription)
    }

    async fn should_skip(&self, _ctx: &RunContext) -> Result<Option<String>> {
        Ok(None)
    }

    async fn run(&self, ctx: &mut RunContext, probe: &CancelProbe) -> Result<StageOutcome> {
        let audio_path = ctx.require_local_audio()?.to_path_buf();
        let video_id = ctx.require_video()?.id;

        let descriptor = self.registry.get(&self.model_key).await?;
        let tunnel = self.tunnels.acquire(&self.model_key, probe).await?;
        let result = self
            .inference
            .transcribe(&tunnel, &descriptor, &audio_path, probe)
            .await?;

        // An empty transcript is a valid outcome; generation still runs.
        info!(
            subject_id = %ctx.subject_id,
            segments = result.segment_timestamps.len(),
            processing_time = result.processing_time,
            "Transcription finished"
        );

        let record = self
            .transcripts
            .create(NewTranscript {
                video_id,
                text: result.transcription,
                word_timestamps: result.word_timestamps,
                segment_timestamps: result.segment_timestamps,
                processing_time: result.processing_time,
            })
            .await?;

        ctx.transcript = Some(record);
        Ok(StageOutcome::completed())
    }
}
