//! Peer-to-peer session access.
//!
//! A daemon serves its local sessions with [`PeerServer`]. Another daemon (or
//! the CLI) opens a [`RemoteConnection`] to it and drives those sessions
//! through [`RemoteSession`] proxies, which behave like local sessions over
//! the network.

pub mod client;
pub mod proxy;
pub mod server;
pub mod transport;

use protocol::{ErrorCode, ErrorMessage};
use thiserror::Error;

use crate::session::SessionError;

pub use client::RemoteConnection;
pub use proxy::RemoteSession;
pub use server::PeerServer;

/// Why a connection attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionFailure {
    /// Connect or handshake did not finish in time.
    Timeout,
    /// The peer could not be reached or refused the connection.
    Refused,
    /// The peer answered, but not with a compatible handshake.
    ProtocolMismatch,
}

impl std::fmt::Display for ConnectionFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ConnectionFailure::Timeout => "timed out",
            ConnectionFailure::Refused => "refused",
            ConnectionFailure::ProtocolMismatch => "protocol mismatch",
        })
    }
}

/// Failure to connect to a remote device.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("connection to {addr} {reason}: {detail}")]
pub struct ConnectionError {
    pub addr: String,
    pub reason: ConnectionFailure,
    pub detail: String,
}

impl ConnectionError {
    pub fn new(addr: impl Into<String>, reason: ConnectionFailure, detail: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            reason,
            detail: detail.into(),
        }
    }
}

impl SessionError {
    /// Convert to a wire error response.
    pub fn to_error_message(&self) -> ErrorMessage {
        match self {
            SessionError::NotFound(id) => ErrorMessage::for_session(ErrorCode::NotFound, id, self.to_string()),
            SessionError::NotInteractive(id) => {
                ErrorMessage::for_session(ErrorCode::NotInteractive, id, self.to_string())
            }
            SessionError::ProcessSpawnFailed { session_id, reason } => {
                ErrorMessage::for_session(ErrorCode::SpawnFailed, session_id, reason.clone())
            }
            SessionError::LimitReached(_) => ErrorMessage::new(ErrorCode::LimitReached, self.to_string()),
            SessionError::UnknownAgent(_) => ErrorMessage::new(ErrorCode::UnknownAgent, self.to_string()),
            SessionError::InputFailed { session_id, .. } => {
                ErrorMessage::for_session(ErrorCode::InternalError, session_id, self.to_string())
            }
            SessionError::Remote(_) => ErrorMessage::new(ErrorCode::InternalError, self.to_string()),
        }
    }

    /// Rebuild a session error from a peer's error response.
    ///
    /// Codes without a matching variant become [`SessionError::Remote`].
    pub fn from_error_message(error: ErrorMessage) -> Self {
        match (error.code, error.session_id) {
            (ErrorCode::NotFound, Some(id)) => SessionError::NotFound(id),
            (ErrorCode::NotInteractive, Some(id)) => SessionError::NotInteractive(id),
            (ErrorCode::SpawnFailed, Some(session_id)) => SessionError::ProcessSpawnFailed {
                session_id,
                reason: error.message,
            },
            _ => SessionError::Remote(error.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_error_display() {
        let err = ConnectionError::new("10.0.0.2:8080", ConnectionFailure::Refused, "connection refused");
        assert_eq!(
            err.to_string(),
            "connection to 10.0.0.2:8080 refused: connection refused"
        );
    }

    #[test]
    fn test_session_errors_survive_the_wire() {
        let errors = [
            SessionError::NotFound("a".to_string()),
            SessionError::NotInteractive("b".to_string()),
            SessionError::ProcessSpawnFailed {
                session_id: "c".to_string(),
                reason: "No such file or directory".to_string(),
            },
        ];
        for err in errors {
            let wire = err.to_error_message();
            assert_eq!(SessionError::from_error_message(wire), err);
        }
    }

    #[test]
    fn test_other_errors_become_remote() {
        let wire = SessionError::LimitReached(4).to_error_message();
        assert_eq!(wire.code, ErrorCode::LimitReached);
        assert_eq!(
            SessionError::from_error_message(wire),
            SessionError::Remote("session limit reached (4 active)".to_string())
        );
    }
}
