//! Filesystem object store.
//!
//! Development and test stand-in for the real blob store: objects live under
//! a root directory, canonical URLs use the `obj://` scheme, and "signed"
//! read URLs are `file://` paths carrying the requested expiry.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use tracing::debug;

use super::object_store::{ObjectStore, SignedUrl, key_from_url};
use crate::{Error, Result};

pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn object_path(&self, key: &str) -> Result<PathBuf> {
        // Keys are store-internal, but reject traversal outright.
        if key.split('/').any(|part| part == "..") || key.starts_with('/') {
            return Err(Error::storage(format!("invalid object key: {key}")));
        }
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put_file(&self, key: &str, path: &Path, _content_type: &str) -> Result<String> {
        let dest = self.object_path(key)?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(path, &dest).await?;
        debug!(key = %key, "Stored object");
        Ok(format!("obj://{key}"))
    }

    async fn signed_url(&self, key: &str, expiry_secs: u64) -> Result<SignedUrl> {
        let path = self.object_path(key)?;
        if !path.exists() {
            return Err(Error::storage(format!("no such object: {key}")));
        }
        Ok(SignedUrl {
            url: format!("file://{}", path.display()),
            expires_at: Utc::now() + ChronoDuration::seconds(expiry_secs as i64),
        })
    }

    async fn fetch_to_file(&self, key: &str, dest: &Path) -> Result<()> {
        let src = self.object_path(key)?;
        if !src.exists() {
            return Err(Error::storage(format!("no such object: {key}")));
        }
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(&src, dest).await?;
        Ok(())
    }
}
