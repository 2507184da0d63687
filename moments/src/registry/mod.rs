//! Model registry.
//!
//! Persists per-model connection descriptors in the coordination store and
//! seeds defaults on first start. The orchestrator consults descriptor
//! capabilities (`supports_video`) for stage skip decisions; the tunnel
//! manager consumes the ssh/port fields.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::coord::{CoordStore, keys};
use crate::{Error, Result};

/// Sampling parameters sent with chat-completion requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    pub temperature: f64,
    pub top_p: f64,
    pub top_k: u32,
    pub max_tokens: u32,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 0.9,
            top_k: 40,
            max_tokens: 4096,
        }
    }
}

/// Connection and capability descriptor for one model endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    /// Registry key this descriptor is stored under.
    pub key: String,
    pub ssh_host: String,
    pub ssh_user: String,
    /// Local end of the forward on this worker.
    pub local_port: u16,
    /// Host the remote end forwards to, as seen from the ssh host.
    pub remote_host: String,
    pub remote_port: u16,
    /// Path appended to the tunnel base URL for requests.
    pub endpoint_path: String,
    /// Whether the endpoint accepts `video_url` content parts.
    pub supports_video: bool,
    /// Model identifier placed in request bodies.
    pub model_id: String,
    pub default_sampling: SamplingParams,
}

impl ModelDescriptor {
    fn to_fields(&self) -> Vec<(String, String)> {
        vec![
            ("ssh_host".into(), self.ssh_host.clone()),
            ("ssh_user".into(), self.ssh_user.clone()),
            ("local_port".into(), self.local_port.to_string()),
            ("remote_host".into(), self.remote_host.clone()),
            ("remote_port".into(), self.remote_port.to_string()),
            ("endpoint_path".into(), self.endpoint_path.clone()),
            ("supports_video".into(), self.supports_video.to_string()),
            ("model_id".into(), self.model_id.clone()),
            ("temperature".into(), self.default_sampling.temperature.to_string()),
            ("top_p".into(), self.default_sampling.top_p.to_string()),
            ("top_k".into(), self.default_sampling.top_k.to_string()),
            ("max_tokens".into(), self.default_sampling.max_tokens.to_string()),
        ]
    }

    fn from_fields(key: &str, fields: &std::collections::HashMap<String, String>) -> Result<Self> {
        fn req<'a>(
            fields: &'a std::collections::HashMap<String, String>,
            name: &str,
            key: &str,
        ) -> Result<&'a str> {
            fields
                .get(name)
                .map(|s| s.as_str())
                .ok_or_else(|| Error::config(format!("model {key}: missing field {name}")))
        }
        fn num<T: std::str::FromStr>(raw: &str, name: &str, key: &str) -> Result<T> {
            raw.parse()
                .map_err(|_| Error::config(format!("model {key}: invalid {name}: {raw}")))
        }

        let defaults = SamplingParams::default();
        Ok(Self {
            key: key.to_string(),
            ssh_host: req(fields, "ssh_host", key)?.to_string(),
            ssh_user: req(fields, "ssh_user", key)?.to_string(),
            local_port: num(req(fields, "local_port", key)?, "local_port", key)?,
            remote_host: req(fields, "remote_host", key)?.to_string(),
            remote_port: num(req(fields, "remote_port", key)?, "remote_port", key)?,
            endpoint_path: req(fields, "endpoint_path", key)?.to_string(),
            supports_video: req(fields, "supports_video", key)? == "true",
            model_id: req(fields, "model_id", key)?.to_string(),
            default_sampling: SamplingParams {
                temperature: fields
                    .get("temperature")
                    .map(|v| num(v, "temperature", key))
                    .transpose()?
                    .unwrap_or(defaults.temperature),
                top_p: fields
                    .get("top_p")
                    .map(|v| num(v, "top_p", key))
                    .transpose()?
                    .unwrap_or(defaults.top_p),
                top_k: fields
                    .get("top_k")
                    .map(|v| num(v, "top_k", key))
                    .transpose()?
                    .unwrap_or(defaults.top_k),
                max_tokens: fields
                    .get("max_tokens")
                    .map(|v| num(v, "max_tokens", key))
                    .transpose()?
                    .unwrap_or(defaults.max_tokens),
            },
        })
    }
}

/// Partial descriptor update; `None` fields are left untouched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelDescriptorUpdate {
    pub ssh_host: Option<String>,
    pub ssh_user: Option<String>,
    pub local_port: Option<u16>,
    pub remote_host: Option<String>,
    pub remote_port: Option<u16>,
    pub endpoint_path: Option<String>,
    pub supports_video: Option<bool>,
    pub model_id: Option<String>,
}

/// Registry of model descriptors backed by the coordination store.
pub struct ModelRegistry {
    coord: CoordStore,
}

impl ModelRegistry {
    pub fn new(coord: CoordStore) -> Self {
        Self { coord }
    }

    /// Seed default descriptors when no model keys are registered yet.
    pub async fn seed_defaults(&self) -> Result<()> {
        if self.coord.scard(keys::MODEL_KEYS).await? > 0 {
            return Ok(());
        }
        for descriptor in default_descriptors() {
            self.put(&descriptor).await?;
        }
        info!("Seeded default model descriptors");
        Ok(())
    }

    /// Fetch a descriptor; fails with [`Error::ModelNotRegistered`] when absent.
    pub async fn get(&self, model_key: &str) -> Result<ModelDescriptor> {
        let fields = self.coord.hgetall(&keys::model_config(model_key)).await?;
        if fields.is_empty() {
            return Err(Error::ModelNotRegistered(model_key.to_string()));
        }
        ModelDescriptor::from_fields(model_key, &fields)
    }

    /// All registered descriptors, sorted by key for stable output.
    pub async fn list(&self) -> Result<Vec<ModelDescriptor>> {
        let mut model_keys = self.coord.smembers(keys::MODEL_KEYS).await?;
        model_keys.sort();
        let mut descriptors = Vec::with_capacity(model_keys.len());
        for key in model_keys {
            descriptors.push(self.get(&key).await?);
        }
        Ok(descriptors)
    }

    /// Write a full descriptor and register its key.
    pub async fn put(&self, descriptor: &ModelDescriptor) -> Result<()> {
        self.coord
            .hset_multiple(&keys::model_config(&descriptor.key), &descriptor.to_fields())
            .await?;
        self.coord.sadd(keys::MODEL_KEYS, &descriptor.key).await?;
        Ok(())
    }

    /// Apply a partial update to an existing descriptor.
    pub async fn update(&self, model_key: &str, update: ModelDescriptorUpdate) -> Result<ModelDescriptor> {
        let mut descriptor = self.get(model_key).await?;
        if let Some(v) = update.ssh_host {
            descriptor.ssh_host = v;
        }
        if let Some(v) = update.ssh_user {
            descriptor.ssh_user = v;
        }
        if let Some(v) = update.local_port {
            descriptor.local_port = v;
        }
        if let Some(v) = update.remote_host {
            descriptor.remote_host = v;
        }
        if let Some(v) = update.remote_port {
            descriptor.remote_port = v;
        }
        if let Some(v) = update.endpoint_path {
            descriptor.endpoint_path = v;
        }
        if let Some(v) = update.supports_video {
            descriptor.supports_video = v;
        }
        if let Some(v) = update.model_id {
            descriptor.model_id = v;
        }
        self.put(&descriptor).await?;
        Ok(descriptor)
    }
}

fn default_descriptors() -> Vec<ModelDescriptor> {
    vec![
        ModelDescriptor {
            key: "vl".to_string(),
            ssh_host: "gpu-a".to_string(),
            ssh_user: "inference".to_string(),
            local_port: 18000,
            remote_host: "localhost".to_string(),
            remote_port: 8000,
            endpoint_path: "/v1/chat/completions".to_string(),
            supports_video: true,
            model_id: "qwen2.5-vl-32b-instruct".to_string(),
            default_sampling: SamplingParams::default(),
        },
        ModelDescriptor {
            key: "text".to_string(),
            ssh_host: "gpu-a".to_string(),
            ssh_user: "inference".to_string(),
            local_port: 18001,
            remote_host: "localhost".to_string(),
            remote_port: 8001,
            endpoint_path: "/v1/chat/completions".to_string(),
            supports_video: false,
            model_id: "qwen2.5-32b-instruct".to_string(),
            default_sampling: SamplingParams::default(),
        },
        ModelDescriptor {
            key: "whisper".to_string(),
            ssh_host: "gpu-b".to_string(),
            ssh_user: "inference".to_string(),
            local_port: 18002,
            remote_host: "localhost".to_string(),
            remote_port: 8002,
            endpoint_path: "/transcribe".to_string(),
            supports_video: false,
            model_id: "whisper-large-v3".to_string(),
            default_sampling: SamplingParams::default(),
        },
    ]
}
