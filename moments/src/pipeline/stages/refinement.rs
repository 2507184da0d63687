//! Refinement stage: ask the refinement model for tightened boundaries, one
//! moment at a time, and persist refined moments pointing at their originals.
//!
//! Per-moment failures are recoverable; the original moment stays intact.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::governor::GovernedResource;
use crate::inference::prompts::{build_refinement_prompt, refinement_system_prompt};
use crate::inference::{ChatMessage, InferenceClient, parse};
use crate::pipeline::context::{MomentEntry, RunContext};
use crate::pipeline::probe::CancelProbe;
use crate::pipeline::stage::{PipelineStage, StageId, StageOutcome};
use crate::registry::ModelRegistry;
use crate::storage::{MomentRepository, NewMoment};
use crate::tunnel::TunnelManager;
use crate::{Error, Result};

pub struct RefinementStage {
    tunnels: Arc<TunnelManager>,
    registry: Arc<ModelRegistry>,
    inference: Arc<InferenceClient>,
    moments: Arc<dyn MomentRepository>,
}

impl RefinementStage {
    pub fn new(
        tunnels: Arc<TunnelManager>,
        registry: Arc<ModelRegistry>,
        inference: Arc<InferenceClient>,
        moments: Arc<dyn MomentRepository>,
    ) -> Self {
        Self {
            tunnels,
            registry,
            inference,
            moments,
        }
    }
}

#[async_trait]
impl PipelineStage for RefinementStage {
    fn id(&self) -> StageId {
        StageId::Refinement
    }

    fn resource(&self) -> Option<GovernedResource> {
        Some(GovernedResource::Refinement)
    }

    async fn should_skip(&self, _ctx: &RunContext) -> Result<Option<String>> {
        Ok(None)
    }

    async fn run(&self, ctx: &mut RunContext, probe: &CancelProbe) -> Result<StageOutcome> {
        if ctx.moments.is_empty() {
            return Ok(StageOutcome::completed());
        }

        let video_id = ctx.require_video()?.id;
        let model_key = ctx.config.refinement_model.clone();
        let descriptor = self.registry.get(&model_key).await?;
        let sampling = descriptor.default_sampling.clone();

        // One tunnel for the whole stage; failing to establish it at all is
        // fatal, unlike per-moment call failures below.
        let tunnel = self.tunnels.acquire(&model_key, probe).await?;

        let mut failures = 0u32;
        let mut refined_entries: Vec<MomentEntry> = Vec::new();

        let originals: Vec<_> = ctx
            .moments
            .iter()
            .filter(|entry| !entry.record.is_refined)
            .cloned()
            .collect();

        for entry in originals {
            // Checkpoint per refinement iteration.
            probe.check().await?;

            let use_video = descriptor.supports_video && !entry.clip_failed;
            let clip_url = entry.clip_url.as_ref().filter(|_| use_video);
            let prompt = build_refinement_prompt(&entry.record, clip_url.is_some());
            let user_message = match clip_url {
                Some(signed) => ChatMessage::user_with_video(prompt, signed.url.clone()),
                None => ChatMessage::user(prompt),
            };

            let refined = async {
                let result = self
                    .inference
                    .chat_complete(
                        &tunnel,
                        &descriptor,
                        vec![
                            ChatMessage::system(refinement_system_prompt()),
                            user_message,
                        ],
                        &sampling,
                        probe,
                    )
                    .await?;
                parse::parse_refinement(&result.content)
            };

            match refined.await {
                Ok(window) => {
                    let record = self
                        .moments
                        .create(NewMoment {
                            video_id,
                            identifier: format!("{}:refined", entry.record.identifier),
                            title: entry.record.title.clone(),
                            start_time: window.start_time,
                            end_time: window.end_time,
                            is_refined: true,
                            parent_id: Some(entry.record.id),
                        })
                        .await?;
                    refined_entries.push(MomentEntry::new(record));
                }
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => {
                    warn!(
                        subject_id = %ctx.subject_id,
                        moment_id = entry.record.id,
                        error = %e,
                        "Refinement failed for one moment; keeping the original"
                    );
                    failures += 1;
                }
            }
        }

        info!(
            subject_id = %ctx.subject_id,
            refined = refined_entries.len(),
            failures,
            "Refinement finished"
        );
        ctx.moments.extend(refined_entries);
        Ok(StageOutcome::with_failures(failures))
    }
}
