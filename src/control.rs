use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::config::ProxyConfig;
use crate::error::{ProxyError, ProxyResult};
use crate::hosts::HostsFileManager;
use crate::logging::{LogRecord, LogRing};
use crate::server::{self, ServerHandle};
use crate::trust_anchor::{CertificateBundle, TrustAnchor};

/// Monotonic counters. Atomic scalars; readers see non-decreasing values but
/// no composite snapshot across fields is needed by any consumer.
#[derive(Debug, Default)]
pub struct Counters {
    pub requests_proxied: AtomicU64,
    pub beatmaps_downloaded: AtomicU64,
    /// Shared directly with `bancho::BanchoSplicer`, which increments it
    /// itself on every packet it mutates rather than the server loop having
    /// to inspect the splicer's output after the fact.
    pub bancho_packets_injected: Arc<AtomicU64>,
}

/// A point-in-time read of [`Counters`], for `getCounters`/`status`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct CountersSnapshot {
    pub requests_proxied: u64,
    pub beatmaps_downloaded: u64,
    pub bancho_packets_injected: u64,
}

impl Counters {
    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            requests_proxied: self.requests_proxied.load(Ordering::Relaxed),
            beatmaps_downloaded: self.beatmaps_downloaded.load(Ordering::Relaxed),
            bancho_packets_injected: self.bancho_packets_injected.load(Ordering::Relaxed),
        }
    }
}

/// The control-plane state machine: `Stopped -> Starting -> Running ->
/// Stopping -> Stopped`, with `Failed` reachable from `Starting` or
/// `Running`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "state", content = "reason")]
pub enum ProxyState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Failed(String),
}

/// The JSON-shaped status read by `status()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Status {
    pub state: ProxyState,
    pub counters: CountersSnapshot,
    pub last_error: Option<String>,
}

/// The control API consumed by the UI collaborator: `start`, `stop`,
/// `status`, `getCounters`, `getLogs(since)`, `clearLogs`. Message shapes are
/// plain JSON-serializable structs; no streaming transport is defined here —
/// callers poll.
pub struct ControlPlane {
    data_dir: PathBuf,
    state: RwLock<ProxyState>,
    counters: Arc<Counters>,
    log_ring: Arc<LogRing>,
    last_error: Mutex<Option<String>>,
    running: Mutex<Option<RunningProxy>>,
}

struct RunningProxy {
    config: ProxyConfig,
    handle: ServerHandle,
    trust_anchor: TrustAnchor,
    bundle: CertificateBundle,
}

impl ControlPlane {
    pub fn new(data_dir: impl Into<PathBuf>, log_ring: Arc<LogRing>) -> Self {
        Self {
            data_dir: data_dir.into(),
            state: RwLock::new(ProxyState::Stopped),
            counters: Arc::new(Counters::default()),
            log_ring,
            last_error: Mutex::new(None),
            running: Mutex::new(None),
        }
    }

    /// Performs, in order: certificate ensure, best-effort trust-store
    /// install, hosts-file aliasing, socket bind, accept-loop spawn.
    pub async fn start(&self, config: ProxyConfig) -> ProxyResult<()> {
        if self.running.lock().await.is_some() {
            return Err(ProxyError::internal("proxy is already running"));
        }
        *self.state.write().await = ProxyState::Starting;

        match self.try_start(&config).await {
            Ok(handle) => {
                let trust_anchor = TrustAnchor::new(&self.data_dir);
                let bundle = handle.bundle.clone();
                *self.running.lock().await = Some(RunningProxy {
                    config,
                    handle: handle.server,
                    trust_anchor,
                    bundle,
                });
                *self.state.write().await = ProxyState::Running;
                info!("proxy started");
                Ok(())
            }
            Err(err) => {
                let reason = err.to_string();
                *self.last_error.lock().await = Some(reason.clone());
                *self.state.write().await = ProxyState::Failed(reason);
                warn!(error = %err, "proxy failed to start");
                Err(err)
            }
        }
    }

    async fn try_start(&self, config: &ProxyConfig) -> ProxyResult<StartedServer> {
        let aliases = config.aliases();
        let trust_anchor = TrustAnchor::new(&self.data_dir);
        let bundle = trust_anchor.ensure(&aliases).await?;

        if let Err(e) = trust_anchor.install_to_system_trust(&bundle) {
            warn!(error = %e, "trust-store install failed, continuing without it");
        }

        let hosts_manager = HostsFileManager::system_default();
        hosts_manager.ensure_aliases(&aliases).await?;

        let server = server::spawn(config.clone(), bundle.clone(), self.counters.clone()).await?;

        Ok(StartedServer { server, bundle })
    }

    /// Closes the listener, waits up to 5s for in-flight connections, then
    /// forces closure; removes the hosts block. The certificate is left
    /// installed — uninstalling it is a separate, explicit action.
    pub async fn stop(&self) -> ProxyResult<()> {
        *self.state.write().await = ProxyState::Stopping;

        let running = self.running.lock().await.take();
        if let Some(running) = running {
            running.handle.shutdown().await;
            let hosts_manager = HostsFileManager::system_default();
            if let Err(e) = hosts_manager.remove_block().await {
                warn!(error = %e, "failed to remove hosts file block during stop");
            }
            let _ = running.config;
            let _ = running.trust_anchor;
            let _ = running.bundle;
        }

        *self.state.write().await = ProxyState::Stopped;
        info!("proxy stopped");
        Ok(())
    }

    /// Explicit, separate action: remove the certificate from the system
    /// trust store. Not performed automatically on `stop`.
    pub async fn uninstall_certificate(&self) -> ProxyResult<()> {
        let trust_anchor = TrustAnchor::new(&self.data_dir);
        match trust_anchor.load_existing().await? {
            Some(bundle) => trust_anchor.uninstall_from_system_trust(&bundle),
            None => Ok(()),
        }
    }

    pub async fn status(&self) -> Status {
        Status {
            state: self.state.read().await.clone(),
            counters: self.counters.snapshot(),
            last_error: self.last_error.lock().await.clone(),
        }
    }

    pub fn get_counters(&self) -> CountersSnapshot {
        self.counters.snapshot()
    }

    pub fn get_logs(&self, since_millis: u128) -> Vec<LogRecord> {
        self.log_ring.since(since_millis)
    }

    pub fn clear_logs(&self) {
        self.log_ring.clear();
    }
}

struct StartedServer {
    server: ServerHandle,
    bundle: CertificateBundle,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_snapshot_reflects_fetch_add() {
        let counters = Counters::default();
        counters.requests_proxied.fetch_add(3, Ordering::Relaxed);
        counters.bancho_packets_injected.fetch_add(1, Ordering::Relaxed);

        let snap = counters.snapshot();
        assert_eq!(snap.requests_proxied, 3);
        assert_eq!(snap.bancho_packets_injected, 1);
        assert_eq!(snap.beatmaps_downloaded, 0);
    }
}
