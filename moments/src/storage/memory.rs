//! In-memory repository implementations.
//!
//! Used by unit tests and by single-node development runs without a relational
//! store; ids are assigned from a per-repository counter and bulk inserts are
//! idempotent on natural keys, matching the store contract.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use super::models::*;
use super::repositories::*;
use crate::Result;

#[derive(Default)]
pub struct InMemoryVideoRepository {
    next_id: AtomicI64,
    rows: Mutex<Vec<VideoRecord>>,
}

#[async_trait]
impl VideoRepository for InMemoryVideoRepository {
    async fn create(&self, video: NewVideo) -> Result<VideoRecord> {
        let mut rows = self.rows.lock();
        // Idempotent on subject_id.
        if let Some(existing) = rows.iter().find(|r| r.subject_id == video.subject_id) {
            return Ok(existing.clone());
        }
        let record = VideoRecord {
            id: self.next_id.fetch_add(1, Ordering::SeqCst) + 1,
            subject_id: video.subject_id,
            source_url: video.source_url,
            cloud_url: video.cloud_url,
            duration_seconds: video.duration_seconds,
            width: video.width,
            height: video.height,
            fps: video.fps,
            video_codec: video.video_codec,
            audio_codec: video.audio_codec,
            size_bytes: video.size_bytes,
            created_at: Utc::now(),
        };
        rows.push(record.clone());
        Ok(record)
    }

    async fn get_by_subject(&self, subject_id: &str) -> Result<Option<VideoRecord>> {
        Ok(self
            .rows
            .lock()
            .iter()
            .find(|r| r.subject_id == subject_id)
            .cloned())
    }

    async fn set_cloud_url(&self, video_id: i64, cloud_url: &str) -> Result<()> {
        let mut rows = self.rows.lock();
        if let Some(row) = rows.iter_mut().find(|r| r.id == video_id) {
            row.cloud_url = Some(cloud_url.to_string());
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryTranscriptRepository {
    next_id: AtomicI64,
    rows: Mutex<Vec<TranscriptRecord>>,
}

#[async_trait]
impl TranscriptRepository for InMemoryTranscriptRepository {
    async fn create(&self, transcript: NewTranscript) -> Result<TranscriptRecord> {
        let record = TranscriptRecord {
            id: self.next_id.fetch_add(1, Ordering::SeqCst) + 1,
            video_id: transcript.video_id,
            text: transcript.text,
            word_timestamps: transcript.word_timestamps,
            segment_timestamps: transcript.segment_timestamps,
            processing_time: transcript.processing_time,
        };
        self.rows.lock().push(record.clone());
        Ok(record)
    }

    async fn get(&self, id: i64) -> Result<Option<TranscriptRecord>> {
        Ok(self.rows.lock().iter().find(|r| r.id == id).cloned())
    }
}

#[derive(Default)]
pub struct InMemoryMomentRepository {
    next_id: AtomicI64,
    rows: Mutex<Vec<MomentRecord>>,
}

#[async_trait]
impl MomentRepository for InMemoryMomentRepository {
    async fn create_bulk(&self, moments: Vec<NewMoment>) -> Result<Vec<MomentRecord>> {
        let mut created = Vec::with_capacity(moments.len());
        for moment in moments {
            created.push(self.create(moment).await?);
        }
        Ok(created)
    }

    async fn create(&self, moment: NewMoment) -> Result<MomentRecord> {
        let mut rows = self.rows.lock();
        if let Some(existing) = rows.iter().find(|r| r.identifier == moment.identifier) {
            return Ok(existing.clone());
        }
        let record = MomentRecord {
            id: self.next_id.fetch_add(1, Ordering::SeqCst) + 1,
            video_id: moment.video_id,
            identifier: moment.identifier,
            title: moment.title,
            start_time: moment.start_time,
            end_time: moment.end_time,
            is_refined: moment.is_refined,
            parent_id: moment.parent_id,
        };
        rows.push(record.clone());
        Ok(record)
    }

    async fn list_for_video(&self, video_id: i64) -> Result<Vec<MomentRecord>> {
        Ok(self
            .rows
            .lock()
            .iter()
            .filter(|r| r.video_id == video_id)
            .cloned()
            .collect())
    }
}

#[derive(Default)]
pub struct InMemoryClipRepository {
    next_id: AtomicI64,
    rows: Mutex<Vec<ClipRecord>>,
}

#[async_trait]
impl ClipRepository for InMemoryClipRepository {
    async fn create(&self, clip: NewClip) -> Result<ClipRecord> {
        let mut rows = self.rows.lock();
        if let Some(existing) = rows.iter().find(|r| r.moment_id == clip.moment_id) {
            return Ok(existing.clone());
        }
        let record = ClipRecord {
            id: self.next_id.fetch_add(1, Ordering::SeqCst) + 1,
            moment_id: clip.moment_id,
            cloud_url: clip.cloud_url,
            padding_left_seconds: clip.padding_left_seconds,
            padding_right_seconds: clip.padding_right_seconds,
        };
        rows.push(record.clone());
        Ok(record)
    }

    async fn list_for_moments(&self, moment_ids: &[i64]) -> Result<Vec<ClipRecord>> {
        Ok(self
            .rows
            .lock()
            .iter()
            .filter(|r| moment_ids.contains(&r.moment_id))
            .cloned()
            .collect())
    }
}

#[derive(Default)]
pub struct InMemoryPromptRepository {
    next_id: AtomicI64,
    rows: Mutex<Vec<PromptRecord>>,
}

#[async_trait]
impl PromptRepository for InMemoryPromptRepository {
    async fn create(&self, prompt: NewPrompt) -> Result<PromptRecord> {
        let record = PromptRecord {
            id: self.next_id.fetch_add(1, Ordering::SeqCst) + 1,
            video_id: prompt.video_id,
            kind: prompt.kind,
            body: prompt.body,
        };
        self.rows.lock().push(record.clone());
        Ok(record)
    }
}

#[derive(Default)]
pub struct InMemoryGenerationConfigRepository {
    next_id: AtomicI64,
    rows: Mutex<Vec<GenerationConfigRecord>>,
}

#[async_trait]
impl GenerationConfigRepository for InMemoryGenerationConfigRepository {
    async fn create(&self, config: NewGenerationConfig) -> Result<GenerationConfigRecord> {
        let record = GenerationConfigRecord {
            id: self.next_id.fetch_add(1, Ordering::SeqCst) + 1,
            video_id: config.video_id,
            run_id: config.run_id,
            model_key: config.model_key,
            sampling_json: config.sampling_json,
            min_moments: config.min_moments,
            max_moments: config.max_moments,
        };
        self.rows.lock().push(record.clone());
        Ok(record)
    }
}

#[derive(Default)]
pub struct InMemoryHistoryRepository {
    next_id: AtomicI64,
    rows: Mutex<Vec<HistoryRecord>>,
}

#[async_trait]
impl HistoryRepository for InMemoryHistoryRepository {
    async fn create(&self, history: NewHistory) -> Result<HistoryRecord> {
        let record = HistoryRecord {
            id: self.next_id.fetch_add(1, Ordering::SeqCst) + 1,
            run_id: history.run_id,
            subject_id: history.subject_id,
            state: history.state,
            error_stage: history.error_stage,
            error_message: history.error_message,
            total_moments: history.total_moments,
            recoverable_failures: history.recoverable_failures,
            completed_at: history.completed_at,
        };
        self.rows.lock().push(record.clone());
        Ok(record)
    }

    async fn list_for_subject(&self, subject_id: &str, limit: usize) -> Result<Vec<HistoryRecord>> {
        let mut rows: Vec<_> = self
            .rows
            .lock()
            .iter()
            .filter(|r| r.subject_id == subject_id)
            .cloned()
            .collect();
        rows.sort_by_key(|r| std::cmp::Reverse(r.completed_at));
        rows.truncate(limit);
        Ok(rows)
    }
}

/// Full in-memory repository bundle.
pub fn in_memory_repositories() -> Repositories {
    Repositories {
        videos: Arc::new(InMemoryVideoRepository::default()),
        transcripts: Arc::new(InMemoryTranscriptRepository::default()),
        moments: Arc::new(InMemoryMomentRepository::default()),
        clips: Arc::new(InMemoryClipRepository::default()),
        prompts: Arc::new(InMemoryPromptRepository::default()),
        generation_configs: Arc::new(InMemoryGenerationConfigRepository::default()),
        history: Arc::new(InMemoryHistoryRepository::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_moment_bulk_insert_is_idempotent_on_identifier() {
        let repo = InMemoryMomentRepository::default();
        let moment = NewMoment {
            video_id: 1,
            identifier: "1:0:1000-2000".to_string(),
            title: "t".to_string(),
            start_time: 1.0,
            end_time: 2.0,
            is_refined: false,
            parent_id: None,
        };
        let first = repo.create_bulk(vec![moment.clone()]).await.unwrap();
        let second = repo.create_bulk(vec![moment]).await.unwrap();
        assert_eq!(first[0].id, second[0].id);
        assert_eq!(repo.list_for_video(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_clip_create_is_idempotent_on_moment_id() {
        let repo = InMemoryClipRepository::default();
        let clip = NewClip {
            moment_id: 7,
            cloud_url: "obj://clips/7.mp4".to_string(),
            padding_left_seconds: 1.0,
            padding_right_seconds: 1.0,
        };
        let first = repo.create(clip.clone()).await.unwrap();
        let second = repo.create(clip).await.unwrap();
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn test_video_create_returns_existing_subject_row() {
        let repo = InMemoryVideoRepository::default();
        let new = NewVideo {
            subject_id: "s".to_string(),
            source_url: "https://media.example/v.mp4".to_string(),
            cloud_url: None,
            duration_seconds: 10.0,
            width: 1920,
            height: 1080,
            fps: 30.0,
            video_codec: "h264".to_string(),
            audio_codec: Some("aac".to_string()),
            size_bytes: 1024,
        };
        let first = repo.create(new.clone()).await.unwrap();
        let second = repo.create(new).await.unwrap();
        assert_eq!(first.id, second.id);
    }
}
