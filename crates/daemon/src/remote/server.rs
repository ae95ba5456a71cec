//! Peer server: serves this daemon's local sessions over TCP.
//!
//! Every connection starts with a `Hello` from the client. The server proves
//! its identity by signing the client's nonce in `HelloAck`, then answers
//! requests until the client disconnects. Subscriptions push
//! `SessionOutput` messages (sequence 0) from one forwarding task each.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use protocol::{
    Envelope, ErrorCode, ErrorMessage, HelloAck, Message, PeerIdentity, SessionId, NONCE_LENGTH,
    PROTOCOL_VERSION,
};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::transport::{EnvelopeReader, EnvelopeWriter};
use crate::registry::SessionRegistry;
use crate::session::{LocalSession, SessionError, SessionHandle};

/// How long a new connection may take to send its `Hello`.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Outgoing messages queued per connection.
const OUTGOING_CAPACITY: usize = 256;

/// TCP server exposing the registry's local sessions to peers.
pub struct PeerServer {
    listener: TcpListener,
    registry: Arc<SessionRegistry>,
}

impl PeerServer {
    /// Bind the server to `addr` (`host:port`; port 0 picks a free port).
    pub async fn bind(addr: &str, registry: Arc<SessionRegistry>) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, registry })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        if let Ok(addr) = self.local_addr() {
            tracing::info!(addr = %addr, "Peer server listening");
        }

        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer_addr)) => {
                    let _ = stream.set_nodelay(true);
                    tokio::spawn(serve_connection(
                        stream,
                        peer_addr,
                        Arc::clone(&self.registry),
                        cancel.child_token(),
                    ));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to accept peer connection");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }

        tracing::info!("Peer server stopped");
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    registry: Arc<SessionRegistry>,
    cancel: CancellationToken,
) {
    let (read_half, write_half) = stream.into_split();
    let mut reader = EnvelopeReader::new(read_half);
    let mut writer = EnvelopeWriter::new(write_half);

    let peer = match tokio::time::timeout(
        HANDSHAKE_TIMEOUT,
        accept_handshake(&registry, &mut reader, &mut writer),
    )
    .await
    {
        Ok(Ok(peer)) => peer,
        Ok(Err(reason)) => {
            tracing::debug!(peer = %peer_addr, reason = %reason, "Handshake rejected");
            let _ = writer.shutdown().await;
            return;
        }
        Err(_) => {
            tracing::debug!(peer = %peer_addr, "Handshake timed out");
            return;
        }
    };

    tracing::info!(
        peer = %peer_addr,
        device_id = %peer.device_id,
        device_name = %peer.device_name,
        "Peer connected"
    );

    let (tx, rx) = mpsc::channel(OUTGOING_CAPACITY);
    let writer_task = tokio::spawn(write_loop(writer, rx));

    let mut connection = PeerConnection {
        registry,
        outgoing: tx,
        subscriptions: HashMap::new(),
        cancel: cancel.clone(),
    };

    loop {
        let envelope = tokio::select! {
            _ = cancel.cancelled() => break,
            envelope = reader.read_envelope() => envelope,
        };

        match envelope {
            Ok(Some(envelope)) => {
                if !connection.handle(envelope).await {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(peer = %peer_addr, error = %e, "Dropping peer after read error");
                break;
            }
        }
    }

    // Ends every subscription forwarder of this connection.
    cancel.cancel();
    drop(connection);
    let _ = writer_task.await;

    tracing::info!(peer = %peer_addr, device_id = %peer.device_id, "Peer disconnected");
}

struct ConnectedPeer {
    device_id: String,
    device_name: String,
}

/// Read the client's `Hello` and answer it.
///
/// Returns a description of the failure if the handshake is refused; the
/// client has been sent an error response where that is possible.
async fn accept_handshake(
    registry: &SessionRegistry,
    reader: &mut EnvelopeReader<OwnedReadHalf>,
    writer: &mut EnvelopeWriter<OwnedWriteHalf>,
) -> Result<ConnectedPeer, String> {
    let envelope = match reader.read_envelope().await {
        Ok(Some(envelope)) => envelope,
        Ok(None) => return Err("closed before hello".to_string()),
        Err(e) => return Err(e.to_string()),
    };
    let sequence = envelope.sequence;

    let reject = |code: ErrorCode, message: String| {
        Envelope::new(sequence, Message::Error(ErrorMessage::new(code, message)))
    };

    let hello = match envelope.payload {
        Message::Hello(hello) => hello,
        other => {
            let message = format!("expected hello, got {}", other.kind());
            let _ = writer
                .write_envelope(&reject(ErrorCode::InvalidRequest, message.clone()))
                .await;
            return Err(message);
        }
    };

    if envelope.version != PROTOCOL_VERSION || hello.version != PROTOCOL_VERSION {
        let message = format!(
            "protocol version {} is not supported, server speaks {}",
            hello.version, PROTOCOL_VERSION
        );
        let _ = writer
            .write_envelope(&reject(ErrorCode::VersionMismatch, message.clone()))
            .await;
        return Err(message);
    }

    let peer = match PeerIdentity::from_public_key_slice(&hello.public_key) {
        Ok(peer) => peer,
        Err(e) => {
            let _ = writer
                .write_envelope(&reject(ErrorCode::InvalidRequest, e.to_string()))
                .await;
            return Err(e.to_string());
        }
    };

    if hello.nonce.len() != NONCE_LENGTH {
        let message = format!("nonce must be {} bytes, got {}", NONCE_LENGTH, hello.nonce.len());
        let _ = writer
            .write_envelope(&reject(ErrorCode::InvalidRequest, message.clone()))
            .await;
        return Err(message);
    }

    let identity = registry.identity();
    let ack = HelloAck {
        public_key: identity.public_key_bytes().to_vec(),
        device_name: registry.device_name().to_string(),
        signature: identity.sign(&hello.nonce),
    };
    writer
        .write_envelope(&Envelope::new(sequence, Message::HelloAck(ack)))
        .await
        .map_err(|e| e.to_string())?;

    Ok(ConnectedPeer {
        device_id: peer.device_id().fingerprint(),
        device_name: hello.device_name,
    })
}

async fn write_loop(mut writer: EnvelopeWriter<OwnedWriteHalf>, mut rx: mpsc::Receiver<Envelope>) {
    while let Some(envelope) = rx.recv().await {
        if let Err(e) = writer.write_envelope(&envelope).await {
            tracing::debug!(error = %e, "Peer write failed");
            return;
        }
    }
    let _ = writer.shutdown().await;
}

/// Request handling state of one authenticated connection.
struct PeerConnection {
    registry: Arc<SessionRegistry>,
    outgoing: mpsc::Sender<Envelope>,
    subscriptions: HashMap<SessionId, CancellationToken>,
    cancel: CancellationToken,
}

impl PeerConnection {
    /// Handle one request. Returns `false` once the connection cannot send.
    async fn handle(&mut self, envelope: Envelope) -> bool {
        let sequence = envelope.sequence;
        tracing::trace!(sequence, kind = envelope.payload.kind(), "Peer request");

        let response = match envelope.payload {
            Message::Ping { timestamp } => Message::Pong { timestamp },
            Message::ListSessions => Message::SessionList {
                sessions: self.registry.list_local(),
            },
            Message::CreateSession(request) => match self.registry.create_session(request) {
                Ok(session) => Message::SessionCreated {
                    info: session.info(),
                },
                Err(e) => error_response(&e),
            },
            Message::Subscribe { session_id } => match self.registry.get_local(&session_id) {
                Some(session) => {
                    // The ack must precede the first pushed event.
                    if self.send(Envelope::new(sequence, Message::Ack)).await.is_err() {
                        return false;
                    }
                    self.subscribe(session);
                    return true;
                }
                None => error_response(&SessionError::NotFound(session_id)),
            },
            Message::Unsubscribe { session_id } => {
                if let Some(token) = self.subscriptions.remove(&session_id) {
                    token.cancel();
                }
                Message::Ack
            }
            Message::Input { session_id, data } => match self.registry.get_local(&session_id) {
                Some(session) => match session.send_input(&data).await {
                    Ok(()) => Message::Ack,
                    Err(e) => error_response(&e),
                },
                None => error_response(&SessionError::NotFound(session_id)),
            },
            Message::Terminate { session_id } => match self.registry.get_local(&session_id) {
                Some(session) => match session.terminate().await {
                    Ok(()) => Message::Ack,
                    Err(e) => error_response(&e),
                },
                None => error_response(&SessionError::NotFound(session_id)),
            },
            Message::GetBuffer { session_id } => match self.registry.get_local(&session_id) {
                Some(session) => Message::Buffer {
                    data: session.output_buffer().await,
                    session_id,
                },
                None => error_response(&SessionError::NotFound(session_id)),
            },
            other => Message::Error(ErrorMessage::new(
                ErrorCode::InvalidRequest,
                format!("unexpected {} request", other.kind()),
            )),
        };

        self.send(Envelope::new(sequence, response)).await.is_ok()
    }

    async fn send(&self, envelope: Envelope) -> Result<(), mpsc::error::SendError<Envelope>> {
        self.outgoing.send(envelope).await
    }

    /// Start forwarding a session's output, replayed from its first event.
    fn subscribe(&mut self, session: Arc<LocalSession>) {
        let session_id = session.id().to_string();
        if let Some(token) = self.subscriptions.get(&session_id) {
            if !token.is_cancelled() {
                tracing::debug!(session_id = %session_id, "Already subscribed");
                return;
            }
        }

        let token = self.cancel.child_token();
        self.subscriptions.insert(session_id.clone(), token.clone());

        let outgoing = self.outgoing.clone();
        tokio::spawn(async move {
            let mut stream = session.output_stream().await;
            loop {
                let event = tokio::select! {
                    _ = token.cancelled() => break,
                    event = stream.next() => event,
                };
                let Some(event) = event else { break };

                let push = Envelope::push(Message::SessionOutput {
                    session_id: session_id.clone(),
                    event,
                });
                if outgoing.send(push).await.is_err() {
                    break;
                }
            }
            tracing::debug!(session_id = %session_id, "Subscription ended");
        });
    }
}

fn error_response(error: &SessionError) -> Message {
    Message::Error(error.to_error_message())
}
