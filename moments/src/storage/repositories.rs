//! Repository traits the core consumes.
//!
//! Foreign keys and cascades belong to the relational store; the core only
//! relies on transaction scope where stated (moment bulk insert within one
//! stage).

use async_trait::async_trait;

use super::models::*;
use crate::Result;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VideoRepository: Send + Sync {
    async fn create(&self, video: NewVideo) -> Result<VideoRecord>;
    async fn get_by_subject(&self, subject_id: &str) -> Result<Option<VideoRecord>>;
    async fn set_cloud_url(&self, video_id: i64, cloud_url: &str) -> Result<()>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TranscriptRepository: Send + Sync {
    async fn create(&self, transcript: NewTranscript) -> Result<TranscriptRecord>;
    async fn get(&self, id: i64) -> Result<Option<TranscriptRecord>>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MomentRepository: Send + Sync {
    /// Insert a batch atomically; idempotent on `identifier`.
    async fn create_bulk(&self, moments: Vec<NewMoment>) -> Result<Vec<MomentRecord>>;
    async fn create(&self, moment: NewMoment) -> Result<MomentRecord>;
    async fn list_for_video(&self, video_id: i64) -> Result<Vec<MomentRecord>>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ClipRepository: Send + Sync {
    /// Idempotent on `moment_id`.
    async fn create(&self, clip: NewClip) -> Result<ClipRecord>;
    async fn list_for_moments(&self, moment_ids: &[i64]) -> Result<Vec<ClipRecord>>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PromptRepository: Send + Sync {
    async fn create(&self, prompt: NewPrompt) -> Result<PromptRecord>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GenerationConfigRepository: Send + Sync {
    async fn create(&self, config: NewGenerationConfig) -> Result<GenerationConfigRecord>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HistoryRepository: Send + Sync {
    async fn create(&self, history: NewHistory) -> Result<HistoryRecord>;
    async fn list_for_subject(&self, subject_id: &str, limit: usize) -> Result<Vec<HistoryRecord>>;
}

/// Bundle of repositories threaded through the container.
#[derive(Clone)]
pub struct Repositories {
    pub videos: std::sync::Arc<dyn VideoRepository>,
    pub transcripts: std::sync::Arc<dyn TranscriptRepository>,
    pub moments: std::sync::Arc<dyn MomentRepository>,
    pub clips: std::sync::Arc<dyn ClipRepository>,
    pub prompts: std::sync::Arc<dyn PromptRepository>,
    pub generation_configs: std::sync::Arc<dyn GenerationConfigRepository>,
    pub history: std::sync::Arc<dyn HistoryRepository>,
}
