//! Outgoing connection to a peer daemon.
//!
//! A [`RemoteConnection`] owns one TCP stream. Requests are matched to
//! responses by sequence number; pushed session output is appended to a local
//! mirror log per remote session. When the stream ends for any reason every
//! unfinished mirror receives `Terminated`, so nobody waits on a dead peer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use protocol::{
    generate_nonce, CreateSessionRequest, DeviceId, DeviceIdentity, DeviceSession, Envelope,
    ErrorCode, Hello, Message, OutputEvent, PeerIdentity, ProtocolError, SessionId, SessionInfo,
    PROTOCOL_VERSION,
};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::proxy::RemoteSession;
use super::transport::{EnvelopeReader, EnvelopeWriter};
use super::{ConnectionError, ConnectionFailure};
use crate::session::{now_millis, OutputLog, SessionError};

/// Sequence number of the `Hello` request.
const HANDSHAKE_SEQUENCE: u64 = 1;

/// Outgoing messages queued per connection.
const OUTGOING_CAPACITY: usize = 256;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// `host:port`, with IPv6 literals bracketed.
pub fn format_addr(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// State shared between a connection, its I/O tasks and its proxies.
pub(crate) struct ConnectionInner {
    addr: String,
    peer: PeerIdentity,
    device_name: String,
    outgoing: mpsc::Sender<Envelope>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Message>>>,
    mirrors: Mutex<HashMap<SessionId, Arc<OutputLog>>>,
    next_sequence: AtomicU64,
    closed: CancellationToken,
    request_timeout: Duration,
}

impl ConnectionInner {
    pub(crate) fn addr(&self) -> &str {
        &self.addr
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    fn closed_error(&self) -> SessionError {
        SessionError::Remote(format!("connection to {} is closed", self.addr))
    }

    /// Send a request and wait for its response.
    ///
    /// An `Error` response is returned as the matching [`SessionError`].
    pub(crate) async fn request(&self, message: Message) -> Result<Message, SessionError> {
        if self.is_closed() {
            return Err(self.closed_error());
        }

        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(sequence, tx);
        // Removed on every exit, including a caller dropping this future.
        let _pending = PendingRequest {
            inner: self,
            sequence,
        };

        // Shutdown cancels before it clears `pending`; re-checking here means
        // no request can be left waiting on a cleared map.
        if self.is_closed() || self.outgoing.send(Envelope::new(sequence, message)).await.is_err() {
            return Err(self.closed_error());
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Err(_) => Err(SessionError::Remote(format!(
                "request to {} timed out after {:?}",
                self.addr, self.request_timeout
            ))),
            Ok(Err(_)) => Err(self.closed_error()),
            Ok(Ok(Message::Error(error))) => Err(SessionError::from_error_message(error)),
            Ok(Ok(response)) => Ok(response),
        }
    }

    /// The mirror log of a remote session, created on first use.
    ///
    /// A mirror created after the connection closed is terminated at once.
    pub(crate) fn mirror(&self, session_id: &str) -> Arc<OutputLog> {
        let mirror = Arc::clone(
            lock(&self.mirrors)
                .entry(session_id.to_string())
                .or_insert_with(|| Arc::new(OutputLog::new(session_id))),
        );
        if self.is_closed() && !mirror.is_sealed() {
            mirror.append(OutputEvent::Terminated);
        }
        mirror
    }

    pub(crate) fn existing_mirror(&self, session_id: &str) -> Option<Arc<OutputLog>> {
        lock(&self.mirrors).get(session_id).cloned()
    }

    /// Forget finished mirrors of sessions the peer no longer lists.
    ///
    /// Proxies that already hold such a mirror keep it alive for themselves.
    fn prune_mirrors(&self, listed: &[SessionInfo]) {
        let mut mirrors = lock(&self.mirrors);
        let before = mirrors.len();
        mirrors.retain(|id, mirror| {
            !mirror.is_sealed() || listed.iter().any(|info| &info.id == id)
        });
        let pruned = before - mirrors.len();
        if pruned > 0 {
            tracing::debug!(addr = %self.addr, pruned, "Dropped mirrors of departed sessions");
        }
    }

    fn dispatch(&self, envelope: Envelope) {
        match envelope.payload {
            Message::SessionOutput { session_id, event } => {
                self.mirror(&session_id).append(event);
            }
            response => {
                let waiter = lock(&self.pending).remove(&envelope.sequence);
                match waiter {
                    Some(waiter) => {
                        let _ = waiter.send(response);
                    }
                    None => tracing::debug!(
                        addr = %self.addr,
                        sequence = envelope.sequence,
                        kind = response.kind(),
                        "Dropping response nobody waits for"
                    ),
                }
            }
        }
    }

    /// Mark the connection closed and release everything waiting on it.
    fn shutdown(&self, reason: &str) {
        self.closed.cancel();
        lock(&self.pending).clear();

        let mirrors: Vec<_> = lock(&self.mirrors).values().cloned().collect();
        let mut terminated = 0;
        for mirror in mirrors {
            if !mirror.is_sealed() && mirror.append(OutputEvent::Terminated) {
                terminated += 1;
            }
        }

        tracing::info!(
            addr = %self.addr,
            device_name = %self.device_name,
            reason,
            terminated_streams = terminated,
            "Remote connection closed"
        );
    }
}

/// Removes a request's `pending` entry however the request ends.
struct PendingRequest<'a> {
    inner: &'a ConnectionInner,
    sequence: u64,
}

impl Drop for PendingRequest<'_> {
    fn drop(&mut self) {
        lock(&self.inner.pending).remove(&self.sequence);
    }
}

/// A live connection to another Envoy daemon.
pub struct RemoteConnection {
    inner: Arc<ConnectionInner>,
    sessions: Mutex<HashMap<SessionId, Arc<RemoteSession>>>,
}

impl RemoteConnection {
    /// Connect to `host:port` and run the handshake, all within `timeout`.
    ///
    /// # Errors
    ///
    /// - [`ConnectionFailure::Timeout`] if connect plus handshake exceed `timeout`
    /// - [`ConnectionFailure::Refused`] if the TCP connection cannot be made
    /// - [`ConnectionFailure::ProtocolMismatch`] if the peer does not complete
    ///   a valid handshake, including a version mismatch
    pub async fn connect(
        host: &str,
        port: u16,
        identity: &DeviceIdentity,
        device_name: &str,
        timeout: Duration,
    ) -> Result<Self, ConnectionError> {
        let addr = format_addr(host, port);
        let attempt = async {
            let stream = TcpStream::connect((host, port)).await.map_err(|e| {
                let reason = if e.kind() == std::io::ErrorKind::TimedOut {
                    ConnectionFailure::Timeout
                } else {
                    ConnectionFailure::Refused
                };
                ConnectionError::new(addr.clone(), reason, e.to_string())
            })?;
            let _ = stream.set_nodelay(true);

            let (read_half, write_half) = stream.into_split();
            let mut reader = EnvelopeReader::new(read_half);
            let mut writer = EnvelopeWriter::new(write_half);
            let (peer, peer_name) =
                client_handshake(&addr, identity, device_name, &mut reader, &mut writer).await?;
            Ok::<_, ConnectionError>((reader, writer, peer, peer_name))
        };

        let (reader, writer, peer, peer_name) = tokio::time::timeout(timeout, attempt)
            .await
            .map_err(|_| {
                ConnectionError::new(
                    addr.clone(),
                    ConnectionFailure::Timeout,
                    format!("no handshake within {:?}", timeout),
                )
            })??;

        let (tx, rx) = mpsc::channel(OUTGOING_CAPACITY);
        let inner = Arc::new(ConnectionInner {
            addr,
            peer,
            device_name: peer_name,
            outgoing: tx,
            pending: Mutex::new(HashMap::new()),
            mirrors: Mutex::new(HashMap::new()),
            next_sequence: AtomicU64::new(HANDSHAKE_SEQUENCE + 1),
            closed: CancellationToken::new(),
            request_timeout: timeout,
        });

        tokio::spawn(write_loop(writer, rx, inner.closed.clone()));
        tokio::spawn(read_loop(reader, Arc::clone(&inner)));

        tracing::info!(
            addr = %inner.addr,
            device_id = %inner.peer.device_id(),
            device_name = %inner.device_name,
            "Connected to remote device"
        );

        Ok(Self {
            inner,
            sessions: Mutex::new(HashMap::new()),
        })
    }

    pub fn addr(&self) -> &str {
        &self.inner.addr
    }

    pub fn device_id(&self) -> &DeviceId {
        self.inner.peer.device_id()
    }

    pub fn device_name(&self) -> &str {
        &self.inner.device_name
    }

    pub fn is_alive(&self) -> bool {
        !self.inner.is_closed()
    }

    /// Close the connection. Open streams end with `Terminated`.
    pub fn close(&self) {
        self.inner.closed.cancel();
    }

    /// Resolve once the connection has closed.
    pub async fn closed(&self) {
        self.inner.closed.cancelled().await
    }

    /// Round-trip time of a ping.
    pub async fn ping(&self) -> Result<Duration, SessionError> {
        let started = Instant::now();
        let timestamp = now_millis();
        match self.inner.request(Message::Ping { timestamp }).await? {
            Message::Pong { timestamp: echoed } if echoed == timestamp => Ok(started.elapsed()),
            other => Err(unexpected(&other)),
        }
    }

    /// Fetch the remote device's sessions and refresh the proxy cache.
    pub async fn list_sessions(&self) -> Result<Vec<SessionInfo>, SessionError> {
        let sessions = match self.inner.request(Message::ListSessions).await? {
            Message::SessionList { sessions } => sessions,
            other => return Err(unexpected(&other)),
        };

        self.inner.prune_mirrors(&sessions);
        let mut cache = lock(&self.sessions);
        cache.retain(|id, _| sessions.iter().any(|info| &info.id == id));
        for info in &sessions {
            match cache.get(&info.id) {
                Some(proxy) => proxy.update_info(info.clone()),
                None => {
                    cache.insert(
                        info.id.clone(),
                        Arc::new(RemoteSession::new(info.clone(), Arc::clone(&self.inner))),
                    );
                }
            }
        }
        Ok(sessions)
    }

    /// [`RemoteConnection::list_sessions`] tagged with this device.
    pub async fn device_sessions(&self) -> Result<Vec<DeviceSession>, SessionError> {
        let device_id = self.device_id().fingerprint();
        Ok(self
            .list_sessions()
            .await?
            .into_iter()
            .map(|info| DeviceSession {
                info,
                device_id: device_id.clone(),
                device_name: self.device_name().to_string(),
                is_local: false,
            })
            .collect())
    }

    /// Start an agent on the remote device.
    pub async fn create_session(
        &self,
        request: CreateSessionRequest,
    ) -> Result<Arc<RemoteSession>, SessionError> {
        let info = match self.inner.request(Message::CreateSession(request)).await? {
            Message::SessionCreated { info } => info,
            other => return Err(unexpected(&other)),
        };

        let proxy = Arc::new(RemoteSession::new(info.clone(), Arc::clone(&self.inner)));
        lock(&self.sessions).insert(info.id, Arc::clone(&proxy));
        Ok(proxy)
    }

    /// Proxy for a session seen in the last listing or created here.
    pub fn session(&self, session_id: &str) -> Option<Arc<RemoteSession>> {
        lock(&self.sessions).get(session_id).cloned()
    }

    /// Proxies known from the last listing.
    pub fn cached_sessions(&self) -> Vec<Arc<RemoteSession>> {
        lock(&self.sessions).values().cloned().collect()
    }
}

impl Drop for RemoteConnection {
    fn drop(&mut self) {
        self.inner.closed.cancel();
    }
}

impl std::fmt::Debug for RemoteConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteConnection")
            .field("addr", &self.inner.addr)
            .field("device_name", &self.inner.device_name)
            .field("alive", &self.is_alive())
            .finish()
    }
}

pub(crate) fn unexpected(message: &Message) -> SessionError {
    SessionError::Remote(format!("unexpected {} response", message.kind()))
}

async fn client_handshake(
    addr: &str,
    identity: &DeviceIdentity,
    device_name: &str,
    reader: &mut EnvelopeReader<OwnedReadHalf>,
    writer: &mut EnvelopeWriter<OwnedWriteHalf>,
) -> Result<(PeerIdentity, String), ConnectionError> {
    let mismatch = |detail: String| {
        ConnectionError::new(addr, ConnectionFailure::ProtocolMismatch, detail)
    };

    let nonce = generate_nonce();
    let hello = Hello {
        version: PROTOCOL_VERSION,
        public_key: identity.public_key_bytes().to_vec(),
        device_name: device_name.to_string(),
        nonce: nonce.to_vec(),
    };
    writer
        .write_envelope(&Envelope::new(HANDSHAKE_SEQUENCE, Message::Hello(hello)))
        .await
        .map_err(|e| ConnectionError::new(addr, ConnectionFailure::Refused, e.to_string()))?;

    let envelope = match reader.read_envelope().await {
        Ok(Some(envelope)) => envelope,
        Ok(None) => return Err(mismatch("peer closed the connection during handshake".to_string())),
        Err(e) => return Err(mismatch(e.to_string())),
    };

    if envelope.version != PROTOCOL_VERSION {
        let error = ProtocolError::VersionMismatch {
            local: PROTOCOL_VERSION,
            remote: envelope.version,
        };
        return Err(mismatch(error.to_string()));
    }

    match envelope.payload {
        Message::HelloAck(ack) => {
            let peer = PeerIdentity::from_public_key_slice(&ack.public_key)
                .map_err(|e| mismatch(e.to_string()))?;
            peer.verify(&nonce, &ack.signature)
                .map_err(|e| mismatch(format!("handshake signature rejected: {}", e)))?;
            Ok((peer, ack.device_name))
        }
        Message::Error(error) if error.code == ErrorCode::VersionMismatch => Err(mismatch(error.message)),
        Message::Error(error) => Err(mismatch(format!("handshake refused: {}", error.message))),
        other => Err(mismatch(format!("expected hello ack, got {}", other.kind()))),
    }
}

async fn write_loop(
    mut writer: EnvelopeWriter<OwnedWriteHalf>,
    mut rx: mpsc::Receiver<Envelope>,
    closed: CancellationToken,
) {
    loop {
        let envelope = tokio::select! {
            _ = closed.cancelled() => break,
            envelope = rx.recv() => envelope,
        };
        let Some(envelope) = envelope else { break };
        if let Err(e) = writer.write_envelope(&envelope).await {
            tracing::debug!(error = %e, "Remote write failed");
            closed.cancel();
            return;
        }
    }
    let _ = writer.shutdown().await;
}

async fn read_loop(mut reader: EnvelopeReader<OwnedReadHalf>, inner: Arc<ConnectionInner>) {
    let reason = loop {
        let envelope = tokio::select! {
            _ = inner.closed.cancelled() => break "closed locally".to_string(),
            envelope = reader.read_envelope() => envelope,
        };
        match envelope {
            Ok(Some(envelope)) => inner.dispatch(envelope),
            Ok(None) => break "peer closed the connection".to_string(),
            Err(e) => break e.to_string(),
        }
    };
    inner.shutdown(&reason);
}
