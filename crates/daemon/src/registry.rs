//! Session registry.
//!
//! Owns every local session and the connections to remote devices, and is
//! the single place commands resolve a session id to a handle.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use futures_util::future::join_all;
use protocol::{CreateSessionRequest, DeviceIdentity, DeviceSession, SessionInfo};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, SessionConfig};
use crate::remote::client::format_addr;
use crate::remote::{ConnectionError, RemoteConnection};
use crate::session::{LocalSession, ProcessSpec, SessionError, SessionHandle, SessionRef};

/// Identity of a device as shown next to its sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub device_id: String,
    pub device_name: String,
}

/// Local sessions plus connections to peers.
pub struct SessionRegistry {
    identity: Arc<DeviceIdentity>,
    device_name: String,
    config: SessionConfig,
    connect_timeout: Duration,
    list_timeout: Duration,
    sessions: DashMap<String, Arc<LocalSession>>,
    remotes: RwLock<HashMap<String, Arc<RemoteConnection>>>,
    /// Serializes the limit check with the insert.
    create_lock: Mutex<()>,
}

impl SessionRegistry {
    pub fn new(config: &Config, identity: Arc<DeviceIdentity>) -> Self {
        Self {
            identity,
            device_name: config.daemon.device_name.clone(),
            config: config.session.clone(),
            connect_timeout: config.remote.connect_timeout(),
            list_timeout: config.remote.list_timeout(),
            sessions: DashMap::new(),
            remotes: RwLock::new(HashMap::new()),
            create_lock: Mutex::new(()),
        }
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn local_device(&self) -> DeviceInfo {
        DeviceInfo {
            device_id: self.identity.fingerprint(),
            device_name: self.device_name.clone(),
        }
    }

    /// Start a new local session for `request.cli`.
    ///
    /// A session whose process fails to spawn stays registered in `Failed`
    /// state so its single `Exit(-1)` event can still be read.
    pub fn create_session(
        &self,
        request: CreateSessionRequest,
    ) -> Result<Arc<LocalSession>, SessionError> {
        let agent = self
            .config
            .agents
            .get(&request.cli)
            .ok_or_else(|| SessionError::UnknownAgent(request.cli.clone()))?;

        let mut spec = ProcessSpec::new(agent.program.clone())
            .args(agent.args.iter().chain(request.args.iter()).cloned())
            .mode(self.config.process_mode);
        if let Some(cwd) = &request.cwd {
            spec = spec.cwd(cwd);
        }

        let session = {
            let _guard = self.create_lock.lock().unwrap_or_else(PoisonError::into_inner);
            let active = self.active_count();
            if active >= self.config.max_sessions {
                tracing::warn!(active, max = self.config.max_sessions, "Session limit reached");
                return Err(SessionError::LimitReached(active));
            }

            let session = LocalSession::new(
                uuid::Uuid::new_v4().to_string(),
                request.task_id,
                request.cli,
                self.config.terminate_grace(),
            );
            self.sessions
                .insert(session.id().to_string(), Arc::clone(&session));
            session
        };

        tracing::info!(
            session_id = %session.id(),
            task_id = %session.info().task_id,
            cli = %session.info().cli,
            "Created session"
        );

        session.start(&spec)?;
        Ok(session)
    }

    fn active_count(&self) -> usize {
        self.sessions
            .iter()
            .filter(|entry| !entry.value().status().is_terminal())
            .count()
    }

    pub fn get_local(&self, session_id: &str) -> Option<Arc<LocalSession>> {
        self.sessions.get(session_id).map(|entry| Arc::clone(entry.value()))
    }

    /// Local sessions, oldest first.
    pub fn list_local(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> =
            self.sessions.iter().map(|entry| entry.value().info()).collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        sessions
    }

    /// Resolve a session id, local sessions first.
    ///
    /// Remote sessions are looked up in the connections' last listings; a
    /// miss refreshes each live connection once.
    pub async fn get_session(&self, session_id: &str) -> Option<SessionRef> {
        if let Some(session) = self.get_local(session_id) {
            return Some(SessionRef::Local(session));
        }

        let remotes = self.remotes().await;
        if let Some(proxy) = remotes.iter().find_map(|remote| remote.session(session_id)) {
            return Some(SessionRef::Remote(proxy));
        }

        for remote in remotes.iter().filter(|remote| remote.is_alive()) {
            if tokio::time::timeout(self.list_timeout, remote.list_sessions())
                .await
                .is_ok_and(|listed| listed.is_ok())
            {
                if let Some(proxy) = remote.session(session_id) {
                    return Some(SessionRef::Remote(proxy));
                }
            }
        }
        None
    }

    /// This device's sessions followed by every reachable remote's.
    ///
    /// Remotes that fail or exceed the list timeout are skipped.
    pub async fn list_all_sessions(&self) -> Vec<DeviceSession> {
        let local = self.local_device();
        let mut all: Vec<DeviceSession> = self
            .list_local()
            .into_iter()
            .map(|info| DeviceSession {
                info,
                device_id: local.device_id.clone(),
                device_name: local.device_name.clone(),
                is_local: true,
            })
            .collect();

        let remotes = self.remotes().await;
        let probes = remotes.iter().map(|remote| async move {
            match tokio::time::timeout(self.list_timeout, remote.device_sessions()).await {
                Ok(Ok(sessions)) => Some(sessions),
                Ok(Err(e)) => {
                    tracing::warn!(addr = %remote.addr(), error = %e, "RemoteUnreachable");
                    None
                }
                Err(_) => {
                    tracing::warn!(
                        addr = %remote.addr(),
                        timeout = ?self.list_timeout,
                        "RemoteUnreachable: listing timed out"
                    );
                    None
                }
            }
        });

        for sessions in join_all(probes).await.into_iter().flatten() {
            all.extend(sessions);
        }
        all
    }

    /// Connect to a remote device, reusing a live connection to it.
    pub async fn connect_to_remote(
        &self,
        host: &str,
        port: u16,
    ) -> Result<Arc<RemoteConnection>, ConnectionError> {
        let addr = format_addr(host, port);
        if let Some(existing) = self.remotes.read().await.get(&addr) {
            if existing.is_alive() {
                return Ok(Arc::clone(existing));
            }
        }

        let connection = Arc::new(
            RemoteConnection::connect(
                host,
                port,
                &self.identity,
                &self.device_name,
                self.connect_timeout,
            )
            .await?,
        );

        let mut remotes = self.remotes.write().await;
        if let Some(existing) = remotes.get(&addr) {
            if existing.is_alive() {
                connection.close();
                return Ok(Arc::clone(existing));
            }
        }
        remotes.insert(addr, Arc::clone(&connection));
        Ok(connection)
    }

    /// Close and forget the connection to `addr`.
    pub async fn disconnect_remote(&self, addr: &str) -> bool {
        match self.remotes.write().await.remove(addr) {
            Some(connection) => {
                connection.close();
                true
            }
            None => false,
        }
    }

    /// Current remote connections, dead ones included.
    pub async fn remotes(&self) -> Vec<Arc<RemoteConnection>> {
        self.remotes.read().await.values().cloned().collect()
    }

    /// Terminate a session by id, local or remote.
    pub async fn terminate(&self, session_id: &str) -> Result<(), SessionError> {
        match self.get_session(session_id).await {
            Some(session) => session.terminate().await,
            None => Err(SessionError::NotFound(session_id.to_string())),
        }
    }

    /// Remove a local session, terminating it first if it is still live.
    pub async fn evict(&self, session_id: &str) -> bool {
        let Some((_, session)) = self.sessions.remove(session_id) else {
            return false;
        };
        if !session.status().is_terminal() {
            let _ = session.terminate().await;
        }
        tracing::info!(session_id = %session_id, "Evicted session");
        true
    }

    /// Evict terminal sessions older than the retention period.
    pub async fn cleanup(&self) -> usize {
        let retention = self.config.retention();
        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| {
                entry
                    .value()
                    .finished_at()
                    .is_some_and(|finished| finished.elapsed() >= retention)
            })
            .map(|entry| entry.key().clone())
            .collect();

        let mut evicted = 0;
        for id in expired {
            if self.evict(&id).await {
                evicted += 1;
            }
        }

        let dead: Vec<String> = self
            .remotes
            .read()
            .await
            .iter()
            .filter(|(_, connection)| !connection.is_alive())
            .map(|(addr, _)| addr.clone())
            .collect();
        if !dead.is_empty() {
            let mut remotes = self.remotes.write().await;
            for addr in dead {
                if remotes.get(&addr).is_some_and(|c| !c.is_alive()) {
                    remotes.remove(&addr);
                    tracing::debug!(addr = %addr, "Dropped closed remote connection");
                }
            }
        }

        if evicted > 0 {
            tracing::info!(evicted, "Cleaned up expired sessions");
        }
        evicted
    }

    /// Run [`SessionRegistry::cleanup`] every `cleanup_interval` until `cancel`.
    pub fn start_cleanup_task(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        let interval = self.config.cleanup_interval();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        registry.cleanup().await;
                    }
                }
            }
            tracing::debug!("Cleanup task stopped");
        })
    }

    /// Terminate every live local session and close all connections.
    pub async fn shutdown(&self) {
        let live: Vec<Arc<LocalSession>> = self
            .sessions
            .iter()
            .filter(|entry| !entry.value().status().is_terminal())
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for session in &live {
            let _ = session.terminate().await;
        }

        let remotes: Vec<_> = self.remotes.write().await.drain().map(|(_, c)| c).collect();
        for connection in &remotes {
            connection.close();
        }

        tracing::info!(
            terminated = live.len(),
            disconnected = remotes.len(),
            "Session registry shut down"
        );
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("device_name", &self.device_name)
            .field("sessions", &self.sessions.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;
    use protocol::{OutputEvent, SessionStatus};

    const WAIT: Duration = Duration::from_secs(10);

    fn config() -> Config {
        let mut config = Config::default();
        config.daemon.device_name = "test-device".to_string();
        config.session.max_sessions = 2;
        config.session.retention_secs = 0;
        config.session.terminate_grace_ms = 200;
        config.session.agents.insert(
            "sh".to_string(),
            AgentConfig::new("/bin/sh").with_args(["-c"]),
        );
        config.session.agents.insert(
            "missing".to_string(),
            AgentConfig::new("/nonexistent/envoy-agent"),
        );
        config
    }

    fn registry() -> SessionRegistry {
        SessionRegistry::new(&config(), Arc::new(DeviceIdentity::generate()))
    }

    fn request(cli: &str, args: &[&str]) -> CreateSessionRequest {
        CreateSessionRequest {
            task_id: "task-1234567890".to_string(),
            cli: cli.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            cwd: None,
        }
    }

    #[tokio::test]
    async fn test_create_and_get_session() {
        let registry = registry();
        let session = registry.create_session(request("sh", &["echo hi"])).unwrap();

        let info = tokio::time::timeout(WAIT, session.wait()).await.unwrap();
        assert_eq!(info.status, SessionStatus::Completed);
        assert_eq!(session.output_buffer().await, b"hi\n");

        let found = registry.get_session(session.id()).await.unwrap();
        assert!(found.is_local());
        assert_eq!(found.id(), session.id());
        assert!(registry.get_session("nope").await.is_none());
    }

    #[tokio::test]
    async fn test_unknown_agent() {
        let registry = registry();
        let err = registry.create_session(request("vim", &[])).unwrap_err();
        assert_eq!(err, SessionError::UnknownAgent("vim".to_string()));
        assert!(registry.list_local().is_empty());
    }

    #[tokio::test]
    async fn test_spawn_failure_stays_listed() {
        let registry = registry();
        let err = registry.create_session(request("missing", &[])).unwrap_err();
        assert!(matches!(err, SessionError::ProcessSpawnFailed { .. }));

        let listed = registry.list_local();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].status, SessionStatus::Failed);
        assert_eq!(listed[0].exit_code, Some(-1));
    }

    #[tokio::test]
    async fn test_limit_counts_only_active_sessions() {
        let registry = registry();
        let a = registry.create_session(request("sh", &["sleep 5"])).unwrap();
        let _b = registry.create_session(request("sh", &["sleep 5"])).unwrap();

        let err = registry.create_session(request("sh", &["true"])).unwrap_err();
        assert_eq!(err, SessionError::LimitReached(2));

        a.terminate().await.unwrap();
        registry.create_session(request("sh", &["true"])).unwrap();
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_terminate_unknown_is_not_found() {
        let registry = registry();
        assert_eq!(
            registry.terminate("ghost").await,
            Err(SessionError::NotFound("ghost".to_string()))
        );
    }

    #[tokio::test]
    async fn test_evict_terminates_live_session() {
        let registry = registry();
        let session = registry.create_session(request("sh", &["sleep 5"])).unwrap();

        assert!(registry.evict(session.id()).await);
        assert_eq!(session.status(), SessionStatus::Terminated);
        assert!(registry.get_local(session.id()).is_none());
        assert!(!registry.evict(session.id()).await);
    }

    #[tokio::test]
    async fn test_cleanup_evicts_expired_terminal_sessions() {
        let registry = registry();
        let done = registry.create_session(request("sh", &["exit 0"])).unwrap();
        let running = registry.create_session(request("sh", &["sleep 5"])).unwrap();
        tokio::time::timeout(WAIT, done.wait()).await.unwrap();

        assert_eq!(registry.cleanup().await, 1);
        assert!(registry.get_local(done.id()).is_none());
        assert!(registry.get_local(running.id()).is_some());
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_list_all_without_remotes_is_local_only() {
        let registry = registry();
        let session = registry.create_session(request("sh", &["true"])).unwrap();

        let all = registry.list_all_sessions().await;
        assert_eq!(all.len(), 1);
        assert!(all[0].is_local);
        assert_eq!(all[0].info.id, session.id());
        assert_eq!(all[0].device_name, "test-device");
        assert_eq!(all[0].device_id, registry.local_device().device_id);
    }

    #[tokio::test]
    async fn test_shutdown_terminates_running_sessions() {
        let registry = registry();
        let session = registry.create_session(request("sh", &["sleep 5"])).unwrap();

        registry.shutdown().await;
        let events = session.log().events();
        assert_eq!(events.last(), Some(&OutputEvent::Terminated));
    }
}
