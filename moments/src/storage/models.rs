//! Record shapes exchanged with the relational store.
//!
//! Rows are identified by stable integer ids assigned by the store; `New*`
//! structs carry the insert payloads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A registered video subject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoRecord {
    pub id: i64,
    /// Stable subject identifier used across the coordination store.
    pub subject_id: String,
    pub source_url: String,
    /// Object-store location of the full-length media, once uploaded.
    pub cloud_url: Option<String>,
    pub duration_seconds: f64,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub video_codec: String,
    pub audio_codec: Option<String>,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewVideo {
    pub subject_id: String,
    pub source_url: String,
    pub cloud_url: Option<String>,
    pub duration_seconds: f64,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub video_codec: String,
    pub audio_codec: Option<String>,
    pub size_bytes: u64,
}

/// Word-level timestamp from the transcription service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WordTimestamp {
    pub word: String,
    pub start: f64,
    pub end: f64,
}

/// Segment-level timestamp from the transcription service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentTimestamp {
    pub text: String,
    pub start: f64,
    pub end: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptRecord {
    pub id: i64,
    pub video_id: i64,
    pub text: String,
    pub word_timestamps: Vec<WordTimestamp>,
    pub segment_timestamps: Vec<SegmentTimestamp>,
    pub processing_time: f64,
}

#[derive(Debug, Clone)]
pub struct NewTranscript {
    pub video_id: i64,
    pub text: String,
    pub word_timestamps: Vec<WordTimestamp>,
    pub segment_timestamps: Vec<SegmentTimestamp>,
    pub processing_time: f64,
}

/// A detected moment within a video. Refined moments point at their original
/// via `parent_id` and carry `is_refined = true`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MomentRecord {
    pub id: i64,
    pub video_id: i64,
    /// Natural key; bulk inserts are idempotent on it.
    pub identifier: String,
    pub title: String,
    pub start_time: f64,
    pub end_time: f64,
    pub is_refined: bool,
    pub parent_id: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct NewMoment {
    pub video_id: i64,
    pub identifier: String,
    pub title: String,
    pub start_time: f64,
    pub end_time: f64,
    pub is_refined: bool,
    pub parent_id: Option<i64>,
}

/// An extracted clip for one moment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClipRecord {
    pub id: i64,
    pub moment_id: i64,
    pub cloud_url: String,
    pub padding_left_seconds: f64,
    pub padding_right_seconds: f64,
}

#[derive(Debug, Clone)]
pub struct NewClip {
    pub moment_id: i64,
    pub cloud_url: String,
    pub padding_left_seconds: f64,
    pub padding_right_seconds: f64,
}

/// Kind of prompt sent to an inference endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptKind {
    Generation,
    Refinement,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptRecord {
    pub id: i64,
    pub video_id: i64,
    pub kind: PromptKind,
    pub body: String,
}

#[derive(Debug, Clone)]
pub struct NewPrompt {
    pub video_id: i64,
    pub kind: PromptKind,
    pub body: String,
}

/// The effective generation settings of one run, persisted for audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfigRecord {
    pub id: i64,
    pub video_id: i64,
    pub run_id: String,
    pub model_key: String,
    pub sampling_json: String,
    pub min_moments: Option<u32>,
    pub max_moments: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct NewGenerationConfig {
    pub video_id: i64,
    pub run_id: String,
    pub model_key: String,
    pub sampling_json: String,
    pub min_moments: Option<u32>,
    pub max_moments: Option<u32>,
}

/// Durable summary of one finished run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub id: i64,
    pub run_id: String,
    pub subject_id: String,
    pub state: String,
    pub error_stage: Option<String>,
    pub error_message: Option<String>,
    pub total_moments: u32,
    pub recoverable_failures: u32,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewHistory {
    pub run_id: String,
    pub subject_id: String,
    pub state: String,
    pub error_stage: Option<String>,
    pub error_message: Option<String>,
    pub total_moments: u32,
    pub recoverable_failures: u32,
    pub completed_at: DateTime<Utc>,
}
