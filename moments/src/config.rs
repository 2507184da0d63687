//! Worker process configuration.

use std::path::PathBuf;

use clap::Parser;

use crate::coord::keys;
use crate::{Error, Result};

/// Command-line arguments of the worker binary. Environment variables are
/// loaded from `.env` first (dotenvy) and act as fallbacks where noted.
#[derive(Debug, Clone, Parser)]
#[command(name = "moments-worker", about = "Video moment-extraction pipeline worker")]
pub struct WorkerArgs {
    /// Request stream key.
    #[arg(long, default_value = keys::REQUESTS_STREAM)]
    pub stream: String,

    /// Consumer group name.
    #[arg(long, default_value = keys::WORKERS_GROUP)]
    pub group: String,

    /// Consumer name; defaults to a stable host-pid derived name.
    #[arg(long)]
    pub consumer: Option<String>,

    /// Parallel runs on this worker.
    #[arg(long, default_value_t = 2)]
    pub max_concurrent: usize,

    /// Idle threshold before pending entries are reclaimed.
    #[arg(long, default_value_t = 60_000)]
    pub reclaim_idle_ms: u64,

    /// Subject lock TTL.
    #[arg(long, default_value_t = 1800)]
    pub lock_ttl_seconds: u64,

    /// Coordination store endpoint.
    #[arg(long, env = "REDIS_URL", default_value = "redis://localhost:6379")]
    pub redis_url: String,

    /// Root directory for the local object store.
    #[arg(long, env = "MOMENTS_DATA_DIR", default_value = "./data")]
    pub data_dir: PathBuf,

    /// Directory for rotated log files; console-only when unset.
    #[arg(long, env = "MOMENTS_LOG_DIR")]
    pub log_dir: Option<PathBuf>,

    /// Registry key of the transcription service.
    #[arg(long, default_value = "whisper")]
    pub transcription_model: String,

    /// Grace window for in-flight runs on shutdown.
    #[arg(long, default_value_t = 60)]
    pub shutdown_grace_seconds: u64,
}

impl WorkerArgs {
    /// Stable consumer name: `worker-{pid}-{host}`.
    pub fn consumer_name(&self) -> String {
        if let Some(name) = &self.consumer {
            return name.clone();
        }
        let host = sysinfo::System::host_name().unwrap_or_else(|| "unknown".to_string());
        format!("worker-{}-{}", std::process::id(), host)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent == 0 {
            return Err(Error::config("--max-concurrent must be at least 1"));
        }
        if self.lock_ttl_seconds == 0 {
            return Err(Error::config("--lock-ttl-seconds must be positive"));
        }
        if self.reclaim_idle_ms < 1000 {
            return Err(Error::config("--reclaim-idle-ms must be at least 1000"));
        }
        if self.stream.trim().is_empty() || self.group.trim().is_empty() {
            return Err(Error::config("stream and group must not be empty"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args() -> WorkerArgs {
        WorkerArgs::parse_from(["moments-worker"])
    }

    #[test]
    fn test_defaults_match_contract() {
        let args = args();
        assert_eq!(args.stream, "pipeline:requests");
        assert_eq!(args.group, "pipeline_workers");
        assert_eq!(args.max_concurrent, 2);
        assert_eq!(args.reclaim_idle_ms, 60_000);
        assert_eq!(args.lock_ttl_seconds, 1800);
        args.validate().unwrap();
    }

    #[test]
    fn test_consumer_name_is_host_pid_derived() {
        let name = args().consumer_name();
        assert!(name.starts_with("worker-"));
        assert!(name.contains(&std::process::id().to_string()));
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let args = WorkerArgs::parse_from(["moments-worker", "--max-concurrent", "0"]);
        assert!(args.validate().is_err());
    }
}
