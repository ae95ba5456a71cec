//! Protocol messages exchanged between Envoy peers.
//!
//! Every frame carries one MessagePack-encoded [`Envelope`]. Requests carry a
//! client-chosen sequence number which the response echoes; output pushed for
//! a subscription uses sequence `0`.

use serde::{Deserialize, Serialize};

use crate::crypto::Signature;
use crate::error::Result;
use crate::session::{OutputEvent, SessionId, SessionInfo};

/// Protocol version spoken by this build.
pub const PROTOCOL_VERSION: u8 = 1;

/// Sequence number used for unsolicited pushes.
pub const PUSH_SEQUENCE: u64 = 0;

/// Wrapper for all protocol messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub version: u8,
    pub sequence: u64,
    pub payload: Message,
}

impl Envelope {
    pub fn new(sequence: u64, payload: Message) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            sequence,
            payload,
        }
    }

    /// An unsolicited message, such as session output.
    pub fn push(payload: Message) -> Self {
        Self::new(PUSH_SEQUENCE, payload)
    }

    pub fn to_msgpack(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    pub fn from_msgpack(bytes: &[u8]) -> Result<Self> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

/// All protocol message types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Message {
    // Handshake
    Hello(Hello),
    HelloAck(HelloAck),

    // Session requests
    ListSessions,
    SessionList { sessions: Vec<SessionInfo> },
    CreateSession(CreateSessionRequest),
    SessionCreated { info: SessionInfo },
    Subscribe { session_id: SessionId },
    Unsubscribe { session_id: SessionId },
    Input {
        session_id: SessionId,
        #[serde(with = "serde_bytes")]
        data: Vec<u8>,
    },
    Terminate { session_id: SessionId },
    GetBuffer { session_id: SessionId },
    Buffer {
        session_id: SessionId,
        #[serde(with = "serde_bytes")]
        data: Vec<u8>,
    },

    /// Output pushed for an active subscription.
    SessionOutput {
        session_id: SessionId,
        event: OutputEvent,
    },

    // Control
    Ack,
    Ping { timestamp: u64 },
    Pong { timestamp: u64 },
    Error(ErrorMessage),
}

impl Message {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Hello(_) => "hello",
            Message::HelloAck(_) => "hello_ack",
            Message::ListSessions => "list_sessions",
            Message::SessionList { .. } => "session_list",
            Message::CreateSession(_) => "create_session",
            Message::SessionCreated { .. } => "session_created",
            Message::Subscribe { .. } => "subscribe",
            Message::Unsubscribe { .. } => "unsubscribe",
            Message::Input { .. } => "input",
            Message::Terminate { .. } => "terminate",
            Message::GetBuffer { .. } => "get_buffer",
            Message::Buffer { .. } => "buffer",
            Message::SessionOutput { .. } => "session_output",
            Message::Ack => "ack",
            Message::Ping { .. } => "ping",
            Message::Pong { .. } => "pong",
            Message::Error(_) => "error",
        }
    }
}

/// First message on every connection, sent by the connecting side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub version: u8,
    #[serde(with = "serde_bytes")]
    pub public_key: Vec<u8>,
    pub device_name: String,
    /// Challenge the server must sign.
    #[serde(with = "serde_bytes")]
    pub nonce: Vec<u8>,
}

/// Server reply to [`Hello`], proving ownership of its device id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloAck {
    #[serde(with = "serde_bytes")]
    pub public_key: Vec<u8>,
    pub device_name: String,
    /// Signature over the client's nonce.
    pub signature: Signature,
}

/// Request to start an agent on the receiving device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    pub task_id: String,
    /// Agent kind, resolved to a command by the receiving daemon.
    pub cli: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub cwd: Option<String>,
}

/// Error response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub code: ErrorCode,
    pub message: String,
    /// Session the error relates to, if any.
    #[serde(default)]
    pub session_id: Option<SessionId>,
}

impl ErrorMessage {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            session_id: None,
        }
    }

    pub fn for_session(code: ErrorCode, session_id: &str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            session_id: Some(session_id.to_string()),
        }
    }
}

impl std::fmt::Display for ErrorMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

/// Error codes carried in [`ErrorMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    NotFound,
    NotInteractive,
    SpawnFailed,
    LimitReached,
    UnknownAgent,
    VersionMismatch,
    InvalidRequest,
    InternalError,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionStatus;

    fn roundtrip(msg: Message) -> Message {
        let envelope = Envelope::new(42, msg);
        let bytes = envelope.to_msgpack().unwrap();
        let decoded = Envelope::from_msgpack(&bytes).unwrap();
        assert_eq!(decoded.version, PROTOCOL_VERSION);
        assert_eq!(decoded.sequence, 42);
        decoded.payload
    }

    fn sample_info() -> SessionInfo {
        SessionInfo {
            id: "0d9f3c6e-1111-4c4c-8f8f-000000000001".to_string(),
            task_id: "task-1234567890".to_string(),
            cli: "claude".to_string(),
            status: SessionStatus::Completed,
            created_at: 1_700_000_000_000,
            output_size: 12,
            exit_code: Some(0),
        }
    }

    #[test]
    fn test_session_list_roundtrip() {
        let msg = Message::SessionList {
            sessions: vec![sample_info()],
        };
        assert_eq!(roundtrip(msg.clone()), msg);
    }

    #[test]
    fn test_unit_variants_roundtrip() {
        assert_eq!(roundtrip(Message::ListSessions), Message::ListSessions);
        assert_eq!(roundtrip(Message::Ack), Message::Ack);
    }

    #[test]
    fn test_session_output_keeps_binary_payload() {
        let payload: Vec<u8> = (0..=255).collect();
        let msg = Message::SessionOutput {
            session_id: "s".to_string(),
            event: OutputEvent::Stderr(payload.clone()),
        };
        match roundtrip(msg) {
            Message::SessionOutput {
                event: OutputEvent::Stderr(data),
                ..
            } => assert_eq!(data, payload),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_terminal_events_roundtrip() {
        for event in [OutputEvent::Exit(-1), OutputEvent::Terminated] {
            let msg = Message::SessionOutput {
                session_id: "s".to_string(),
                event: event.clone(),
            };
            assert_eq!(roundtrip(msg.clone()), msg);
        }
    }

    #[test]
    fn test_create_session_defaults() {
        #[derive(Serialize)]
        struct Minimal {
            task_id: String,
            cli: String,
        }
        let bytes = rmp_serde::to_vec_named(&Minimal {
            task_id: "t".to_string(),
            cli: "codex".to_string(),
        })
        .unwrap();
        let request: CreateSessionRequest = rmp_serde::from_slice(&bytes).unwrap();
        assert!(request.args.is_empty());
        assert!(request.cwd.is_none());
    }

    #[test]
    fn test_error_message_roundtrip() {
        let msg = Message::Error(ErrorMessage::for_session(
            ErrorCode::NotInteractive,
            "abc",
            "session is not running",
        ));
        assert_eq!(roundtrip(msg.clone()), msg);
    }

    #[test]
    fn test_push_uses_sequence_zero() {
        let envelope = Envelope::push(Message::Ack);
        assert_eq!(envelope.sequence, PUSH_SEQUENCE);
    }

    #[test]
    fn test_garbage_fails_to_decode() {
        assert!(Envelope::from_msgpack(&[0xc1, 0x00, 0x13]).is_err());
    }

    #[test]
    fn test_message_kind() {
        assert_eq!(Message::Ping { timestamp: 1 }.kind(), "ping");
        assert_eq!(
            Message::Terminate {
                session_id: "x".to_string()
            }
            .kind(),
            "terminate"
        );
    }
}
