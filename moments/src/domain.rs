//! Run-level domain types shared by the enqueue adapter, the queue and the
//! stages.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::registry::SamplingParams;
use crate::{Error, Result};

/// Whether a run executes the whole stage list or a resumed subset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineType {
    #[default]
    Full,
    Partial,
}

impl PipelineType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Partial => "partial",
        }
    }
}

/// Sampling overrides carried in a run config; unset fields fall back to the
/// model descriptor's defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub top_k: Option<u32>,
    pub max_tokens: Option<u32>,
}

impl GenerationParams {
    pub fn apply_to(&self, base: &SamplingParams) -> SamplingParams {
        SamplingParams {
            temperature: self.temperature.unwrap_or(base.temperature),
            top_p: self.top_p.unwrap_or(base.top_p),
            top_k: self.top_k.unwrap_or(base.top_k),
            max_tokens: self.max_tokens.unwrap_or(base.max_tokens),
        }
    }
}

/// Configuration of one pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub generation_model: String,
    pub refinement_model: String,
    #[serde(default)]
    pub generation_params: GenerationParams,
    #[serde(default)]
    pub padding_left_seconds: f64,
    #[serde(default)]
    pub padding_right_seconds: f64,
    #[serde(default)]
    pub min_moments: Option<u32>,
    #[serde(default)]
    pub max_moments: Option<u32>,
    #[serde(default)]
    pub min_moment_length: Option<f64>,
    #[serde(default)]
    pub max_moment_length: Option<f64>,
    /// Source media URL; required for subjects not yet registered.
    #[serde(default)]
    pub source_url: Option<String>,
    /// Re-download even when the subject already has a cloud copy.
    #[serde(default)]
    pub force_download: bool,
    #[serde(default)]
    pub pipeline_type: PipelineType,
}

impl RunConfig {
    /// Numeric sanity checks; model keys are validated against the registry by
    /// the enqueue adapter.
    pub fn validate(&self) -> Result<()> {
        if self.generation_model.trim().is_empty() {
            return Err(Error::validation("generation_model must not be empty"));
        }
        if self.refinement_model.trim().is_empty() {
            return Err(Error::validation("refinement_model must not be empty"));
        }
        if self.padding_left_seconds < 0.0 || self.padding_right_seconds < 0.0 {
            return Err(Error::validation("padding must not be negative"));
        }
        if let (Some(min), Some(max)) = (self.min_moments, self.max_moments)
            && min > max
        {
            return Err(Error::validation(format!(
                "min_moments ({min}) exceeds max_moments ({max})"
            )));
        }
        if let Some(min_len) = self.min_moment_length
            && min_len <= 0.0
        {
            return Err(Error::validation("min_moment_length must be positive"));
        }
        if let (Some(min_len), Some(max_len)) = (self.min_moment_length, self.max_moment_length)
            && min_len > max_len
        {
            return Err(Error::validation(format!(
                "min_moment_length ({min_len}) exceeds max_moment_length ({max_len})"
            )));
        }
        Ok(())
    }
}

/// One submission on the request stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRequest {
    pub run_id: String,
    pub subject_id: String,
    pub config: RunConfig,
    pub requested_at: DateTime<Utc>,
}

impl RunRequest {
    pub fn new(subject_id: &str, config: RunConfig) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            subject_id: subject_id.to_string(),
            config,
            requested_at: Utc::now(),
        }
    }

    /// Flatten to stream fields; `config` travels as a JSON document.
    pub fn to_fields(&self) -> Result<Vec<(String, String)>> {
        Ok(vec![
            ("run_id".to_string(), self.run_id.clone()),
            ("subject_id".to_string(), self.subject_id.clone()),
            ("config".to_string(), serde_json::to_string(&self.config)?),
            ("requested_at".to_string(), self.requested_at.to_rfc3339()),
        ])
    }

    pub fn from_fields(fields: &std::collections::HashMap<String, String>) -> Result<Self> {
        let run_id = fields
            .get("run_id")
            .ok_or_else(|| Error::validation("stream entry missing run_id"))?
            .clone();
        let subject_id = fields
            .get("subject_id")
            .ok_or_else(|| Error::validation("stream entry missing subject_id"))?
            .clone();
        let config: RunConfig = serde_json::from_str(
            fields
                .get("config")
                .ok_or_else(|| Error::validation("stream entry missing config"))?,
        )?;
        let requested_at = fields
            .get("requested_at")
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);
        Ok(Self {
            run_id,
            subject_id,
            config,
            requested_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RunConfig {
        RunConfig {
            generation_model: "vl".to_string(),
            refinement_model: "vl".to_string(),
            generation_params: GenerationParams::default(),
            padding_left_seconds: 1.0,
            padding_right_seconds: 2.0,
            min_moments: Some(3),
            max_moments: Some(10),
            min_moment_length: Some(5.0),
            max_moment_length: Some(90.0),
            source_url: Some("https://media.example/v.mp4".to_string()),
            force_download: false,
            pipeline_type: PipelineType::Full,
        }
    }

    #[test]
    fn test_validate_accepts_sane_config() {
        config().validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_negative_padding() {
        let mut cfg = config();
        cfg.padding_left_seconds = -0.5;
        assert!(matches!(cfg.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn test_validate_rejects_inverted_bounds() {
        let mut cfg = config();
        cfg.min_moments = Some(10);
        cfg.max_moments = Some(3);
        assert!(matches!(cfg.validate(), Err(Error::Validation(_))));

        let mut cfg = config();
        cfg.min_moment_length = Some(120.0);
        cfg.max_moment_length = Some(30.0);
        assert!(matches!(cfg.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn test_request_field_round_trip() {
        let request = RunRequest::new("subj-1", config());
        let fields: std::collections::HashMap<String, String> =
            request.to_fields().unwrap().into_iter().collect();
        let parsed = RunRequest::from_fields(&fields).unwrap();
        assert_eq!(parsed.run_id, request.run_id);
        assert_eq!(parsed.subject_id, "subj-1");
        assert_eq!(parsed.config, request.config);
    }

    #[test]
    fn test_generation_params_override_defaults() {
        let base = SamplingParams::default();
        let params = GenerationParams {
            temperature: Some(0.2),
            max_tokens: Some(512),
            ..Default::default()
        };
        let effective = params.apply_to(&base);
        assert_eq!(effective.temperature, 0.2);
        assert_eq!(effective.max_tokens, 512);
        assert_eq!(effective.top_p, base.top_p);
    }
}
