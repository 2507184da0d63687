//! Typed context threaded through the stages of one run.
//!
//! Context is the only medium by which stage outputs flow forward; stages
//! never share state through globals.

use std::path::{Path, PathBuf};

use tempfile::TempDir;

use crate::domain::RunConfig;
use crate::media::MediaInfo;
use crate::storage::{MomentRecord, SignedUrl, TranscriptRecord, VideoRecord};
use crate::{Error, Result};

/// One moment being carried through clip extraction, upload and refinement.
#[derive(Debug, Clone)]
pub struct MomentEntry {
    pub record: MomentRecord,
    /// Local clip file, once extracted.
    pub clip_path: Option<PathBuf>,
    /// Object-store key of the uploaded clip.
    pub clip_key: Option<String>,
    /// Signed read URL handed to vision-capable refinement.
    pub clip_url: Option<SignedUrl>,
    /// Set when clip extraction or upload failed for this moment; later
    /// stages must tolerate the missing clip.
    pub clip_failed: bool,
}

impl MomentEntry {
    pub fn new(record: MomentRecord) -> Self {
        Self {
            record,
            clip_path: None,
            clip_key: None,
            clip_url: None,
            clip_failed: false,
        }
    }
}

/// Everything a stage may read or extend during one run.
pub struct RunContext {
    pub run_id: String,
    pub subject_id: String,
    pub config: RunConfig,

    /// Scratch directory for this run; removed when the context drops.
    work_dir: WorkDir,

    pub video: Option<VideoRecord>,
    pub media_info: Option<MediaInfo>,
    pub local_media_path: Option<PathBuf>,
    pub local_audio_path: Option<PathBuf>,
    pub audio_key: Option<String>,
    pub audio_url: Option<SignedUrl>,
    pub transcript: Option<TranscriptRecord>,
    pub generation_config_id: Option<i64>,
    pub moments: Vec<MomentEntry>,
}

enum WorkDir {
    Owned(TempDir),
    Borrowed(PathBuf),
}

impl RunContext {
    pub fn new(run_id: &str, subject_id: &str, config: RunConfig) -> Result<Self> {
        let temp = tempfile::Builder::new()
            .prefix(&format!("moments-{subject_id}-"))
            .tempdir()?;
        Ok(Self::build(run_id, subject_id, config, WorkDir::Owned(temp)))
    }

    /// Context over a caller-owned scratch directory (tests).
    pub fn with_work_dir(
        run_id: &str,
        subject_id: &str,
        config: RunConfig,
        work_dir: impl Into<PathBuf>,
    ) -> Self {
        Self::build(run_id, subject_id, config, WorkDir::Borrowed(work_dir.into()))
    }

    fn build(run_id: &str, subject_id: &str, config: RunConfig, work_dir: WorkDir) -> Self {
        Self {
            run_id: run_id.to_string(),
            subject_id: subject_id.to_string(),
            config,
            work_dir,
            video: None,
            media_info: None,
            local_media_path: None,
            local_audio_path: None,
            audio_key: None,
            audio_url: None,
            transcript: None,
            generation_config_id: None,
            moments: Vec::new(),
        }
    }

    pub fn work_dir(&self) -> &Path {
        match &self.work_dir {
            WorkDir::Owned(temp) => temp.path(),
            WorkDir::Borrowed(path) => path,
        }
    }

    pub fn scratch_path(&self, file_name: &str) -> PathBuf {
        self.work_dir().join(file_name)
    }

    // Stages past a dependency boundary may rely on these; a missing value is
    // an ordering bug surfaced as a pipeline error, not a panic.

    pub fn require_video(&self) -> Result<&VideoRecord> {
        self.video
            .as_ref()
            .ok_or_else(|| Error::Pipeline("no video record in context".to_string()))
    }

    pub fn require_media_info(&self) -> Result<&MediaInfo> {
        self.media_info
            .as_ref()
            .ok_or_else(|| Error::Pipeline("no media metadata in context".to_string()))
    }

    pub fn require_local_media(&self) -> Result<&Path> {
        self.local_media_path
            .as_deref()
            .ok_or_else(|| Error::Pipeline("no local media file in context".to_string()))
    }

    pub fn require_local_audio(&self) -> Result<&Path> {
        self.local_audio_path
            .as_deref()
            .ok_or_else(|| Error::Pipeline("no local audio file in context".to_string()))
    }

    pub fn require_transcript(&self) -> Result<&TranscriptRecord> {
        self.transcript
            .as_ref()
            .ok_or_else(|| Error::Pipeline("no transcript in context".to_string()))
    }
}
