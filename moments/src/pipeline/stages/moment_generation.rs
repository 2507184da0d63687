//! Moment generation stage: prompt the generation model over the transcript,
//! parse the moment list, and persist prompt, generation config and moments.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::governor::GovernedResource;
use crate::inference::prompts::{build_generation_prompt, generation_system_prompt};
use crate::inference::{ChatMessage, InferenceClient, parse};
use crate::pipeline::context::{MomentEntry, RunContext};
use crate::pipeline::probe::CancelProbe;
use crate::pipeline::stage::{PipelineStage, StageId, StageOutcome};
use crate::registry::ModelRegistry;
use crate::storage::{
    GenerationConfigRepository, MomentRepository, NewGenerationConfig, NewMoment, NewPrompt,
    PromptKind, PromptRepository,
};
use crate::tunnel::TunnelManager;
use crate::Result;

pub struct MomentGenerationStage {
    tunnels: Arc<TunnelManager>,
    registry: Arc<ModelRegistry>,
    inference: Arc<InferenceClient>,
    moments: Arc<dyn MomentRepository>,
    prompts: Arc<dyn PromptRepository>,
    generation_configs: Arc<dyn GenerationConfigRepository>,
}

impl MomentGenerationStage {
    pub fn new(
        tunnels: Arc<TunnelManager>,
        registry: Arc<ModelRegistry>,
        inference: Arc<InferenceClient>,
        moments: Arc<dyn MomentRepository>,
        prompts: Arc<dyn PromptRepository>,
        generation_configs: Arc<dyn GenerationConfigRepository>,
    ) -> Self {
        Self {
            tunnels,
            registry,
            inference,
            moments,
            prompts,
            generation_configs,
        }
    }
}

#[async_trait]
impl PipelineStage for MomentGenerationStage {
    fn id(&self) -> StageId {
        StageId::MomentGeneration
    }

    fn resource(&self) -> Option<GovernedResource> {
        Some(GovernedResource::MomentGeneration)
    }

    async fn should_skip(&self, _ctx: &RunContext) -> Result<Option<String>> {
        Ok(None)
    }

    async fn run(&self, ctx: &mut RunContext, probe: &CancelProbe) -> Result<StageOutcome> {
        let video_id = ctx.require_video()?.id;
        let duration = ctx.require_media_info()?.duration_seconds;
        let transcript = ctx.require_transcript()?.clone();

        let model_key = ctx.config.generation_model.clone();
        let descriptor = self.registry.get(&model_key).await?;
        let sampling = ctx
            .config
            .generation_params
            .apply_to(&descriptor.default_sampling);

        let prompt_body = build_generation_prompt(&transcript, &ctx.config, duration);
        self.prompts
            .create(NewPrompt {
                video_id,
                kind: PromptKind::Generation,
                body: prompt_body.clone(),
            })
            .await?;

        let generation_config = self
            .generation_configs
            .create(NewGenerationConfig {
                video_id,
                run_id: ctx.run_id.clone(),
                model_key: model_key.clone(),
                sampling_json: serde_json::to_string(&sampling)?,
                min_moments: ctx.config.min_moments,
                max_moments: ctx.config.max_moments,
            })
            .await?;
        ctx.generation_config_id = Some(generation_config.id);

        let tunnel = self.tunnels.acquire(&model_key, probe).await?;
        let result = self
            .inference
            .chat_complete(
                &tunnel,
                &descriptor,
                vec![
                    ChatMessage::system(generation_system_prompt()),
                    ChatMessage::user(prompt_body),
                ],
                &sampling,
                probe,
            )
            .await?;

        let mut candidates = parse::extract_moment_array(&result.content)?;
        if let Some(max) = ctx.config.max_moments {
            candidates.truncate(max as usize);
        }

        // Zero moments is a completed stage; downstream stages iterate an
        // empty set.
        let new_moments: Vec<NewMoment> = candidates
            .into_iter()
            .enumerate()
            .map(|(idx, candidate)| NewMoment {
                video_id,
                identifier: format!("{}:{}", ctx.run_id, idx),
                title: candidate.title,
                start_time: candidate.start_time,
                end_time: candidate.end_time,
                is_refined: false,
                parent_id: None,
            })
            .collect();

        let records = self.moments.create_bulk(new_moments).await?;
        info!(
            subject_id = %ctx.subject_id,
            moments = records.len(),
            model_key = %model_key,
            "Moments generated"
        );

        ctx.moments = records.into_iter().map(MomentEntry::new).collect();
        Ok(StageOutcome::completed())
    }
}
