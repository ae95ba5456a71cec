//! Local stand-in for a session hosted by a peer.

use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use protocol::{Message, OutputEvent, SessionId, SessionInfo, SessionStatus};

use super::client::{unexpected, ConnectionInner};
use crate::session::{OutputLog, OutputStream, SessionError, SessionHandle};

/// A remote session driven through its device's [`super::RemoteConnection`].
///
/// Output arrives as pushed events and is kept in a mirror log shared by every
/// proxy of the same session, so late readers still get a full replay. If the
/// connection drops, the mirror ends with `Terminated`.
pub struct RemoteSession {
    id: SessionId,
    connection: Arc<ConnectionInner>,
    info: Mutex<SessionInfo>,
    /// Held once used, so pruning the connection's table cannot orphan it.
    mirror: OnceLock<Arc<OutputLog>>,
    subscribed: tokio::sync::Mutex<bool>,
}

impl RemoteSession {
    pub(crate) fn new(info: SessionInfo, connection: Arc<ConnectionInner>) -> Self {
        Self {
            id: info.id.clone(),
            connection,
            info: Mutex::new(info),
            mirror: OnceLock::new(),
            subscribed: tokio::sync::Mutex::new(false),
        }
    }

    fn cached(&self) -> MutexGuard<'_, SessionInfo> {
        self.info.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Address of the hosting device.
    pub fn addr(&self) -> &str {
        self.connection.addr()
    }

    /// Replace the cached metadata with a fresher listing.
    pub(crate) fn update_info(&self, info: SessionInfo) {
        let mut cached = self.cached();
        // A terminal status learned from the stream is never rolled back.
        if cached.status.is_terminal() && !info.status.is_terminal() {
            return;
        }
        *cached = info;
    }

    fn mirror(&self) -> Arc<OutputLog> {
        Arc::clone(self.mirror.get_or_init(|| self.connection.mirror(&self.id)))
    }

    /// Ask the peer to push this session's events, once per session.
    async fn ensure_subscribed(&self) -> Arc<OutputLog> {
        let mirror = self.mirror();
        let mut subscribed = self.subscribed.lock().await;
        if *subscribed || mirror.is_sealed() {
            return mirror;
        }

        let request = Message::Subscribe {
            session_id: self.id.clone(),
        };
        match self.connection.request(request).await {
            Ok(Message::Ack) => *subscribed = true,
            Ok(other) => self.end_mirror(&mirror, &unexpected(&other)),
            Err(e) => self.end_mirror(&mirror, &e),
        }
        mirror
    }

    fn end_mirror(&self, mirror: &OutputLog, error: &SessionError) {
        tracing::warn!(
            session_id = %self.id,
            addr = %self.addr(),
            error = %error,
            "Remote subscription failed, ending stream"
        );
        mirror.append(OutputEvent::Terminated);
    }
}

impl SessionHandle for RemoteSession {
    fn id(&self) -> &str {
        &self.id
    }

    fn info(&self) -> SessionInfo {
        let mut info = self.cached().clone();
        let mirror = self
            .mirror
            .get()
            .cloned()
            .or_else(|| self.connection.existing_mirror(&self.id));
        if let Some(mirror) = mirror {
            info.output_size = info.output_size.max(mirror.byte_len());
            if !info.status.is_terminal() {
                match mirror.terminal_event() {
                    Some(OutputEvent::Exit(code)) => {
                        info.status = SessionStatus::from_exit_code(code);
                        info.exit_code = Some(code);
                    }
                    Some(OutputEvent::Terminated) => info.status = SessionStatus::Terminated,
                    _ => {}
                }
            }
        }
        info
    }

    async fn output_buffer(&self) -> Vec<u8> {
        let request = Message::GetBuffer {
            session_id: self.id.clone(),
        };
        match self.connection.request(request).await {
            Ok(Message::Buffer { data, .. }) => data,
            Ok(other) => {
                tracing::debug!(session_id = %self.id, kind = other.kind(), "Unexpected buffer response");
                self.mirror().buffer()
            }
            Err(e) => {
                tracing::debug!(session_id = %self.id, error = %e, "Falling back to mirrored output");
                self.mirror().buffer()
            }
        }
    }

    async fn output_stream(&self) -> OutputStream {
        self.ensure_subscribed().await.stream()
    }

    async fn send_input(&self, data: &[u8]) -> Result<(), SessionError> {
        if self.info().status.is_terminal() {
            return Err(SessionError::NotInteractive(self.id.clone()));
        }

        let request = Message::Input {
            session_id: self.id.clone(),
            data: data.to_vec(),
        };
        match self.connection.request(request).await? {
            Message::Ack => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    async fn terminate(&self) -> Result<(), SessionError> {
        if self.info().status.is_terminal() {
            return Ok(());
        }

        let request = Message::Terminate {
            session_id: self.id.clone(),
        };
        match self.connection.request(request).await? {
            Message::Ack => {
                let mut cached = self.cached();
                if cached.status.can_transition_to(SessionStatus::Terminated) {
                    cached.status = SessionStatus::Terminated;
                }
                Ok(())
            }
            other => Err(unexpected(&other)),
        }
    }

    async fn wait(&self) -> SessionInfo {
        if !self.cached().status.is_terminal() {
            self.ensure_subscribed().await.sealed().await;
        }
        self.info()
    }
}

impl std::fmt::Debug for RemoteSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteSession")
            .field("id", &self.id)
            .field("addr", &self.addr())
            .field("status", &self.info().status)
            .finish()
    }
}
