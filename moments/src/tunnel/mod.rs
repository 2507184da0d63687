//! On-demand network forwards to remote inference endpoints.
//!
//! `acquire` resolves the model descriptor, starts an ssh local port-forward,
//! probes the local endpoint until it accepts TCP connections, and returns a
//! scoped handle. Dropping the handle terminates the forwarder; release is
//! idempotent and never panics. Acquires for the same model key are
//! serialized on this worker; different keys proceed in parallel.

use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::pipeline::probe::CancelProbe;
use crate::registry::{ModelDescriptor, ModelRegistry};
use crate::{Error, Result};

/// Default readiness probe timeout (30 s).
pub const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 30;

/// Default probe interval (500 ms).
pub const DEFAULT_PROBE_INTERVAL_MS: u64 = 500;

#[derive(Debug, Clone)]
pub struct TunnelConfig {
    pub probe_timeout: Duration,
    pub probe_interval: Duration,
    pub ssh_path: String,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            probe_timeout: Duration::from_secs(DEFAULT_PROBE_TIMEOUT_SECS),
            probe_interval: Duration::from_millis(DEFAULT_PROBE_INTERVAL_MS),
            ssh_path: std::env::var("SSH_PATH").unwrap_or_else(|_| "ssh".to_string()),
        }
    }
}

/// A live forward. The local endpoint stays up until the handle is released
/// or dropped.
#[derive(Debug)]
pub struct TunnelHandle {
    model_key: String,
    base_url: String,
    child: Option<Child>,
    /// Held for the handle's lifetime to serialize same-key acquires.
    _key_guard: OwnedMutexGuard<()>,
}

impl TunnelHandle {
    /// Local base URL of the forwarded endpoint.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn model_key(&self) -> &str {
        &self.model_key
    }

    /// Terminate the forwarder. Safe to call more than once; errors from an
    /// already-exited process are ignored.
    pub fn release(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.start_kill() {
                debug!(model_key = %self.model_key, error = %e, "Forwarder already gone");
            }
            debug!(model_key = %self.model_key, "Tunnel released");
        }
    }
}

impl Drop for TunnelHandle {
    fn drop(&mut self) {
        self.release();
    }
}

/// Scoped acquisition of forwards, one serialization slot per model key.
pub struct TunnelManager {
    registry: Arc<ModelRegistry>,
    config: TunnelConfig,
    key_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl TunnelManager {
    pub fn new(registry: Arc<ModelRegistry>) -> Self {
        Self::with_config(registry, TunnelConfig::default())
    }

    pub fn with_config(registry: Arc<ModelRegistry>, config: TunnelConfig) -> Self {
        Self {
            registry,
            config,
            key_locks: DashMap::new(),
        }
    }

    /// Acquire a ready forward to `model_key`'s endpoint.
    pub async fn acquire(&self, model_key: &str, probe: &CancelProbe) -> Result<TunnelHandle> {
        let descriptor = self.registry.get(model_key).await?;

        let slot = self
            .key_locks
            .entry(model_key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let key_guard = tokio::select! {
            guard = slot.lock_owned() => guard,
            _ = probe.wait_cancelled() => return Err(Error::Cancelled),
        };

        self.clear_port(&descriptor).await?;

        let mut child = self.spawn_forwarder(&descriptor)?;
        info!(
            model_key = %model_key,
            local_port = descriptor.local_port,
            remote = %format!("{}:{}", descriptor.remote_host, descriptor.remote_port),
            "Forwarder started"
        );

        match self.wait_ready(&descriptor, &mut child, probe).await {
            Ok(()) => Ok(TunnelHandle {
                model_key: model_key.to_string(),
                base_url: format!("http://127.0.0.1:{}", descriptor.local_port),
                child: Some(child),
                _key_guard: key_guard,
            }),
            Err(e) => {
                let _ = child.start_kill();
                Err(e)
            }
        }
    }

    /// If the configured local port is already taken, terminate forwarders we
    /// can attribute to ourselves and re-check once.
    async fn clear_port(&self, descriptor: &ModelDescriptor) -> Result<()> {
        if !port_listening(descriptor.local_port).await {
            return Ok(());
        }

        let killed = kill_attributed_forwarders(descriptor);
        if killed > 0 {
            warn!(
                local_port = descriptor.local_port,
                killed, "Terminated orphaned forwarders on contended port"
            );
            tokio::time::sleep(Duration::from_millis(250)).await;
        }

        if port_listening(descriptor.local_port).await {
            return Err(Error::LocalPortInUse(descriptor.local_port));
        }
        Ok(())
    }

    fn spawn_forwarder(&self, descriptor: &ModelDescriptor) -> Result<Child> {
        let mut cmd = Command::new(&self.config.ssh_path);
        cmd.args([
            "-N",
            "-o",
            "BatchMode=yes",
            "-o",
            "StrictHostKeyChecking=accept-new",
            "-o",
            "ServerAliveInterval=30",
            "-o",
            "ExitOnForwardFailure=yes",
            "-L",
            &forward_spec(descriptor),
        ])
        .arg(format!("{}@{}", descriptor.ssh_user, descriptor.ssh_host))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);

        cmd.spawn()
            .map_err(|e| Error::Other(format!("failed to spawn ssh forwarder: {e}")))
    }

    async fn wait_ready(
        &self,
        descriptor: &ModelDescriptor,
        child: &mut Child,
        probe: &CancelProbe,
    ) -> Result<()> {
        let started = Instant::now();
        let deadline = started + self.config.probe_timeout;

        loop {
            if probe.is_cancelled().await {
                return Err(Error::Cancelled);
            }

            if port_listening(descriptor.local_port).await {
                debug!(
                    model_key = %descriptor.key,
                    waited_ms = started.elapsed().as_millis() as u64,
                    "Tunnel ready"
                );
                return Ok(());
            }

            if let Ok(Some(status)) = child.try_wait() {
                // The forwarder died before the port came up; usually a
                // forward failure surfaced through ExitOnForwardFailure.
                return Err(Error::Other(format!(
                    "ssh forwarder for {} exited early with {status}",
                    descriptor.key
                )));
            }

            if Instant::now() >= deadline {
                return Err(Error::TunnelReadinessTimeout {
                    model_key: descriptor.key.clone(),
                    waited_secs: self.config.probe_timeout.as_secs(),
                });
            }

            tokio::time::sleep(self.config.probe_interval).await;
        }
    }
}

/// The `-L` argument for a descriptor; also what we match against when
/// attributing orphaned forwarders to ourselves.
fn forward_spec(descriptor: &ModelDescriptor) -> String {
    format!(
        "{}:{}:{}",
        descriptor.local_port, descriptor.remote_host, descriptor.remote_port
    )
}

async fn port_listening(port: u16) -> bool {
    matches!(
        tokio::time::timeout(
            Duration::from_millis(250),
            TcpStream::connect(("127.0.0.1", port)),
        )
        .await,
        Ok(Ok(_))
    )
}

/// Kill ssh processes carrying our exact forward spec. Returns the number of
/// processes signalled.
fn kill_attributed_forwarders(descriptor: &ModelDescriptor) -> usize {
    let spec = forward_spec(descriptor);
    let system = sysinfo::System::new_all();
    let mut killed = 0;

    for process in system.processes().values() {
        let name = process.name().to_string_lossy();
        if !name.contains("ssh") {
            continue;
        }
        let is_ours = process
            .cmd()
            .iter()
            .any(|arg| arg.to_string_lossy() == spec);
        if is_ours && process.kill() {
            killed += 1;
        }
    }
    killed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::CoordStore;
    use crate::status::StatusManager;
    use tokio_util::sync::CancellationToken;

    fn test_probe(coord: &CoordStore) -> CancelProbe {
        CancelProbe::new(
            StatusManager::new(coord.clone()),
            "subj",
            CancellationToken::new(),
        )
    }

    fn descriptor(local_port: u16) -> ModelDescriptor {
        ModelDescriptor {
            key: "vl".to_string(),
            ssh_host: "gpu-a".to_string(),
            ssh_user: "inference".to_string(),
            local_port,
            remote_host: "localhost".to_string(),
            remote_port: 8000,
            endpoint_path: "/v1/chat/completions".to_string(),
            supports_video: true,
            model_id: "m".to_string(),
            default_sampling: Default::default(),
        }
    }

    #[test]
    fn test_forward_spec_format() {
        assert_eq!(forward_spec(&descriptor(18000)), "18000:localhost:8000");
    }

    #[tokio::test]
    async fn test_acquire_unknown_model_fails_before_spawning() {
        let coord = CoordStore::memory();
        let registry = Arc::new(ModelRegistry::new(coord.clone()));
        let manager = TunnelManager::new(registry);
        let probe = test_probe(&coord);

        let err = manager.acquire("nope", &probe).await.unwrap_err();
        assert!(matches!(err, Error::ModelNotRegistered(_)));
    }

    #[tokio::test]
    async fn test_port_listening_detects_bound_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(port_listening(port).await);
        drop(listener);
    }

    #[tokio::test]
    async fn test_clear_port_fails_for_unattributable_occupant() {
        // A plain listener is not an ssh forwarder of ours, so the manager
        // must refuse the port rather than kill a stranger.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let coord = CoordStore::memory();
        let registry = Arc::new(ModelRegistry::new(coord.clone()));
        let manager = TunnelManager::new(registry);

        let err = manager.clear_port(&descriptor(port)).await.unwrap_err();
        assert!(matches!(err, Error::LocalPortInUse(p) if p == port));
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        // A handle with no child simulates an already-released tunnel.
        let slot = Arc::new(Mutex::new(()));
        let mut handle = TunnelHandle {
            model_key: "vl".to_string(),
            base_url: "http://127.0.0.1:18000".to_string(),
            child: None,
            _key_guard: slot.lock_owned().await,
        };
        handle.release();
        handle.release();
    }
}
