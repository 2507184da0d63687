//! Wire types for the OpenAI-compatible chat endpoint and the transcription
//! service.

use serde::{Deserialize, Serialize};

use crate::registry::SamplingParams;
use crate::storage::{SegmentTimestamp, WordTimestamp};

/// A chat message; content is either plain text or typed parts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: MessageContent,
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: MessageContent::Text(text.into()),
        }
    }

    /// User message with a text part plus a referenced video.
    pub fn user_with_video(text: impl Into<String>, video_url: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: MessageContent::Parts(vec![
                ContentPart::Text { text: text.into() },
                ContentPart::VideoUrl {
                    video_url: VideoUrlRef {
                        url: video_url.into(),
                    },
                },
            ]),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    VideoUrl { video_url: VideoUrlRef },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoUrlRef {
    pub url: String,
}

/// Request body for the chat endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f64,
    pub top_p: f64,
    pub top_k: u32,
    pub max_tokens: u32,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>, sampling: &SamplingParams) -> Self {
        Self {
            model: model.into(),
            messages,
            temperature: sampling.temperature,
            top_p: sampling.top_p,
            top_k: sampling.top_k,
            max_tokens: sampling.max_tokens,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatResponse {
    pub choices: Vec<ChatChoice>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatChoice {
    pub message: AssistantMessage,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssistantMessage {
    pub content: String,
}

/// Assistant output of one chat completion.
#[derive(Debug, Clone)]
pub struct ChatResult {
    pub content: String,
}

/// Response of the transcription service.
#[derive(Debug, Clone, Deserialize)]
pub struct TranscriptResult {
    pub transcription: String,
    #[serde(default)]
    pub word_timestamps: Vec<WordTimestamp>,
    #[serde(default)]
    pub segment_timestamps: Vec<SegmentTimestamp>,
    #[serde(default)]
    pub processing_time: f64,
}

/// One `{start_time, end_time, title}` object from a generation response.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MomentCandidate {
    pub start_time: f64,
    pub end_time: f64,
    pub title: String,
}

/// A refinement response: tightened boundaries for one moment.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RefinementWindow {
    pub start_time: f64,
    pub end_time: f64,
}
