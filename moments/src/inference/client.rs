//! HTTP client for chat-completion and transcription calls through a tunnel.

use std::path::Path;
use std::time::Duration;

use reqwest::multipart;
use tracing::{debug, warn};

use super::types::{ChatMessage, ChatRequest, ChatResponse, ChatResult, TranscriptResult};
use crate::pipeline::probe::CancelProbe;
use crate::registry::{ModelDescriptor, SamplingParams};
use crate::tunnel::TunnelHandle;
use crate::{Error, Result};

/// Timeouts for inference calls. All configurable; defaults per operation.
#[derive(Debug, Clone)]
pub struct InferenceConfig {
    pub chat_timeout: Duration,
    pub transcribe_timeout: Duration,
    pub connect_timeout: Duration,
    /// Backoff before the single transport-level retry.
    pub retry_backoff: Duration,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            chat_timeout: Duration::from_secs(600),
            transcribe_timeout: Duration::from_secs(1800),
            connect_timeout: Duration::from_secs(15),
            retry_backoff: Duration::from_secs(1),
        }
    }
}

/// Client for the tunneled inference endpoints.
pub struct InferenceClient {
    http: reqwest::Client,
    config: InferenceConfig,
}

impl InferenceClient {
    pub fn new(config: InferenceConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()?;
        Ok(Self { http, config })
    }

    /// POST an OpenAI-compatible chat completion through the tunnel and
    /// return the assistant content.
    pub async fn chat_complete(
        &self,
        handle: &TunnelHandle,
        descriptor: &ModelDescriptor,
        messages: Vec<ChatMessage>,
        sampling: &SamplingParams,
        probe: &CancelProbe,
    ) -> Result<ChatResult> {
        let url = format!("{}{}", handle.base_url(), descriptor.endpoint_path);
        let body = ChatRequest::new(descriptor.model_id.clone(), messages, sampling);

        let response = self
            .send_with_retry(probe, || {
                self.http
                    .post(&url)
                    .timeout(self.config.chat_timeout)
                    .json(&body)
            })
            .await?;

        let parsed: ChatResponse = response.json().await?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| Error::InferenceParse("chat response has no choices".to_string()))?;
        Ok(ChatResult { content })
    }

    /// Multipart-upload an audio file to the transcription endpoint.
    pub async fn transcribe(
        &self,
        handle: &TunnelHandle,
        descriptor: &ModelDescriptor,
        audio_path: &Path,
        probe: &CancelProbe,
    ) -> Result<TranscriptResult> {
        let url = format!("{}{}", handle.base_url(), descriptor.endpoint_path);
        let file_name = audio_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "audio.mp3".to_string());
        let bytes = tokio::fs::read(audio_path).await?;

        let response = self
            .send_with_retry(probe, || {
                let part = multipart::Part::bytes(bytes.clone()).file_name(file_name.clone());
                let form = multipart::Form::new().part("file", part);
                self.http
                    .post(&url)
                    .timeout(self.config.transcribe_timeout)
                    .multipart(form)
            })
            .await?;

        Ok(response.json().await?)
    }

    /// Send a request with a single transport-level retry on connection
    /// failures or 5xx responses. No retries on 4xx, and cancellation aborts
    /// at the first interruptible wait.
    async fn send_with_retry(
        &self,
        probe: &CancelProbe,
        build: impl Fn() -> reqwest::RequestBuilder,
    ) -> Result<reqwest::Response> {
        let mut attempt = 0;
        loop {
            probe.check().await?;

            let outcome = tokio::select! {
                result = build().send() => result,
                _ = probe.wait_cancelled() => return Err(Error::Cancelled),
            };

            match outcome {
                Ok(response) if response.status().is_server_error() && attempt == 0 => {
                    warn!(status = %response.status(), "Inference endpoint 5xx; retrying once");
                }
                Ok(response) => return response.error_for_status().map_err(Error::from),
                Err(e) if e.is_connect() && attempt == 0 => {
                    warn!(error = %e, "Inference transport failure; retrying once");
                }
                Err(e) => return Err(e.into()),
            }

            attempt += 1;
            debug!(backoff_ms = self.config.retry_backoff.as_millis() as u64, "Retry backoff");
            tokio::select! {
                _ = tokio::time::sleep(self.config.retry_backoff) => {}
                _ = probe.wait_cancelled() => return Err(Error::Cancelled),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_timeouts_match_contract() {
        let config = InferenceConfig::default();
        assert_eq!(config.chat_timeout, Duration::from_secs(600));
        assert_eq!(config.transcribe_timeout, Duration::from_secs(1800));
        assert_eq!(config.connect_timeout, Duration::from_secs(15));
    }
}
