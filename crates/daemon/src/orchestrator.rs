//! Daemon orchestrator for wiring together all components.
//!
//! The `DaemonOrchestrator` owns the device identity and the session
//! registry, runs the peer server and the cleanup task, and connects to the
//! configured peers. One cancellation token stops all of them.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use protocol::DeviceIdentity;
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{parse_peer_addr, Config};
use crate::registry::SessionRegistry;
use crate::remote::PeerServer;

/// Name of the identity key file inside the data directory.
pub const IDENTITY_FILE: &str = "identity.key";

/// Daemon orchestrator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    /// Initial state, not started.
    Stopped,
    /// Starting up, initializing components.
    Starting,
    /// Running and accepting connections.
    Running,
    /// Shutting down gracefully.
    ShuttingDown,
}

/// Events emitted by the orchestrator.
#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    StateChanged(OrchestratorState),
    /// A configured peer was connected.
    PeerConnected { addr: String, device_name: String },
    /// A configured peer could not be reached.
    PeerUnreachable { addr: String, reason: String },
}

/// Daemon orchestrator that manages all subsystems.
pub struct DaemonOrchestrator {
    config: Config,
    identity: Arc<DeviceIdentity>,
    state: Arc<RwLock<OrchestratorState>>,
    registry: Arc<SessionRegistry>,
    local_addr: Option<SocketAddr>,
    shutdown_token: CancellationToken,
    event_tx: broadcast::Sender<OrchestratorEvent>,
}

impl DaemonOrchestrator {
    /// Creates a new daemon orchestrator.
    ///
    /// Loads the identity from the data directory, generating it on first run.
    pub fn new(config: Config) -> Result<Self> {
        config.validate().context("Invalid configuration")?;

        let identity_path = config.daemon.data_dir.join(IDENTITY_FILE);
        let identity = Arc::new(load_or_generate_identity(&identity_path)?);
        info!(device_id = %identity.fingerprint(), "Daemon identity loaded");

        let registry = Arc::new(SessionRegistry::new(&config, Arc::clone(&identity)));
        let (event_tx, _) = broadcast::channel(64);

        Ok(Self {
            config,
            identity,
            state: Arc::new(RwLock::new(OrchestratorState::Stopped)),
            registry,
            local_addr: None,
            shutdown_token: CancellationToken::new(),
            event_tx,
        })
    }

    pub fn device_id_fingerprint(&self) -> String {
        self.identity.fingerprint()
    }

    pub async fn state(&self) -> OrchestratorState {
        *self.state.read().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.event_tx.subscribe()
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Address the peer server is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Starts the daemon orchestrator.
    pub async fn start(&mut self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state != OrchestratorState::Stopped {
                anyhow::bail!("Orchestrator is already running");
            }
            *state = OrchestratorState::Starting;
        }
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Starting));

        info!("Starting daemon orchestrator...");

        for agent in self.config.missing_agents() {
            warn!(agent = %agent, "Agent program not found, sessions for it will fail to start");
        }

        let bind_addr = self.config.remote.bind_addr();
        let server = match PeerServer::bind(&bind_addr, Arc::clone(&self.registry)).await {
            Ok(server) => server,
            Err(e) => {
                *self.state.write().await = OrchestratorState::Stopped;
                return Err(e).with_context(|| format!("Failed to bind peer server to {}", bind_addr));
            }
        };
        self.local_addr = server.local_addr().ok();
        tokio::spawn(server.run(self.shutdown_token.child_token()));

        self.registry.start_cleanup_task(self.shutdown_token.child_token());
        debug!("Started session cleanup task");

        if !self.config.remote.peers.is_empty() {
            tokio::spawn(connect_peers(
                Arc::clone(&self.registry),
                self.config.remote.peers.clone(),
                self.config.remote.port,
                self.event_tx.clone(),
                self.shutdown_token.clone(),
            ));
        }

        *self.state.write().await = OrchestratorState::Running;
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Running));

        info!(addr = ?self.local_addr, "Daemon orchestrator started successfully");
        Ok(())
    }

    /// Stops the daemon orchestrator gracefully.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state == OrchestratorState::Stopped {
                return Ok(());
            }
            if *state == OrchestratorState::ShuttingDown {
                anyhow::bail!("Orchestrator is already shutting down");
            }
            *state = OrchestratorState::ShuttingDown;
        }
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::ShuttingDown));

        info!("Stopping daemon orchestrator...");
        self.shutdown_token.cancel();
        self.registry.shutdown().await;

        *self.state.write().await = OrchestratorState::Stopped;
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Stopped));

        info!("Daemon orchestrator stopped");
        Ok(())
    }

    fn emit_event(&self, event: OrchestratorEvent) {
        let _ = self.event_tx.send(event);
    }
}

/// Connect to every configured peer, logging the ones that fail.
async fn connect_peers(
    registry: Arc<SessionRegistry>,
    peers: Vec<String>,
    default_port: u16,
    event_tx: broadcast::Sender<OrchestratorEvent>,
    shutdown: CancellationToken,
) {
    for peer in peers {
        let (host, port) = match parse_peer_addr(&peer, default_port) {
            Ok(addr) => addr,
            Err(e) => {
                warn!(peer = %peer, error = %e, "Skipping invalid peer address");
                continue;
            }
        };

        let result = tokio::select! {
            _ = shutdown.cancelled() => return,
            result = registry.connect_to_remote(&host, port) => result,
        };

        let event = match result {
            Ok(connection) => OrchestratorEvent::PeerConnected {
                addr: connection.addr().to_string(),
                device_name: connection.device_name().to_string(),
            },
            Err(e) => {
                warn!(peer = %peer, error = %e, "Failed to connect to configured peer");
                OrchestratorEvent::PeerUnreachable {
                    addr: e.addr,
                    reason: e.reason.to_string(),
                }
            }
        };
        let _ = event_tx.send(event);
    }
}

/// Loads the device identity from `path`, or generates and saves a new one.
pub fn load_or_generate_identity(path: &Path) -> Result<DeviceIdentity> {
    if path.exists() {
        let bytes = std::fs::read(path)
            .with_context(|| format!("Failed to read identity file: {}", path.display()))?;
        let key: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
            anyhow::anyhow!(
                "Invalid identity file {}: expected 32 bytes, got {}",
                path.display(),
                bytes.len()
            )
        })?;
        return Ok(DeviceIdentity::from_secret_key_bytes(&key));
    }

    let identity = DeviceIdentity::generate();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    std::fs::write(path, identity.secret_key_bytes())
        .with_context(|| format!("Failed to write identity file: {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .with_context(|| format!("Failed to restrict identity file: {}", path.display()))?;
    }

    info!(path = %path.display(), "Generated new device identity");
    Ok(identity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_config(temp_dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.daemon.data_dir = temp_dir.path().to_path_buf();
        config.remote.listen_addr = "127.0.0.1".to_string();
        config.remote.port = 0;
        config
    }

    #[tokio::test]
    async fn test_orchestrator_creation() {
        let temp_dir = TempDir::new().unwrap();
        let orchestrator = DaemonOrchestrator::new(create_test_config(&temp_dir)).unwrap();
        assert_eq!(orchestrator.state().await, OrchestratorState::Stopped);
        assert!(orchestrator.local_addr().is_none());
        assert!(temp_dir.path().join(IDENTITY_FILE).exists());
    }

    #[test]
    fn test_identity_is_stable_across_loads() {
        let temp_dir = TempDir::new().unwrap();
        let identity_path = temp_dir.path().join("nested").join(IDENTITY_FILE);

        let first = load_or_generate_identity(&identity_path).unwrap();
        assert!(identity_path.exists());
        let second = load_or_generate_identity(&identity_path).unwrap();
        assert_eq!(first.device_id(), second.device_id());
    }

    #[test]
    fn test_corrupt_identity_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let identity_path = temp_dir.path().join(IDENTITY_FILE);
        std::fs::write(&identity_path, b"short").unwrap();

        let err = load_or_generate_identity(&identity_path).unwrap_err();
        assert!(err.to_string().contains("expected 32 bytes"));
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let temp_dir = TempDir::new().unwrap();
        let mut orchestrator = DaemonOrchestrator::new(create_test_config(&temp_dir)).unwrap();
        let mut events = orchestrator.subscribe();

        orchestrator.start().await.unwrap();
        assert_eq!(orchestrator.state().await, OrchestratorState::Running);
        let addr = orchestrator.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
        assert!(orchestrator.start().await.is_err());

        orchestrator.stop().await.unwrap();
        assert_eq!(orchestrator.state().await, OrchestratorState::Stopped);
        assert!(orchestrator.shutdown_token().is_cancelled());

        let mut states = Vec::new();
        while let Ok(OrchestratorEvent::StateChanged(state)) = events.try_recv() {
            states.push(state);
        }
        assert_eq!(
            states,
            vec![
                OrchestratorState::Starting,
                OrchestratorState::Running,
                OrchestratorState::ShuttingDown,
                OrchestratorState::Stopped,
            ]
        );
    }

    #[tokio::test]
    async fn test_unreachable_peer_is_reported() {
        let temp_dir = TempDir::new().unwrap();
        let closed = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = closed.local_addr().unwrap().port();
        drop(closed);

        let mut config = create_test_config(&temp_dir);
        config.remote.peers = vec![format!("127.0.0.1:{}", port)];
        let mut orchestrator = DaemonOrchestrator::new(config).unwrap();
        let mut events = orchestrator.subscribe();
        orchestrator.start().await.unwrap();

        let reason = tokio::time::timeout(std::time::Duration::from_secs(10), async {
            loop {
                if let Ok(OrchestratorEvent::PeerUnreachable { reason, .. }) = events.recv().await {
                    return reason;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(reason, "refused");
        orchestrator.stop().await.unwrap();
    }
}
