//! Object store seam.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Result;

/// Default signed-URL validity (1 hour).
pub const DEFAULT_SIGN_EXPIRY_SECS: u64 = 3600;

/// A read URL with its expiry. Refreshable without rewriting the object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedUrl {
    pub url: String,
    pub expires_at: DateTime<Utc>,
}

/// Write-by-key blob storage with signed-URL reads.
///
/// Objects are write-once per key; stages that might repeat a write include a
/// unique suffix in the key.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Upload a local file under `key`; returns the canonical object URL.
    async fn put_file(&self, key: &str, path: &Path, content_type: &str) -> Result<String>;

    /// Produce a time-limited read URL for an existing object.
    async fn signed_url(&self, key: &str, expiry_secs: u64) -> Result<SignedUrl>;

    /// Fetch an object to a local file (used when a stage needs media that an
    /// earlier, skipped stage would normally have left on disk).
    async fn fetch_to_file(&self, key: &str, dest: &Path) -> Result<()>;
}

/// Derive the store key from a canonical object URL produced by `put_file`.
pub fn key_from_url(url: &str) -> &str {
    url.rsplit_once("://").map(|(_, rest)| rest).unwrap_or(url)
}
