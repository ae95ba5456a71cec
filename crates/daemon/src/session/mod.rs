//! Session management module.
//!
//! A session is one run of a CLI agent. [`LocalSession`] drives a process on
//! this machine; [`crate::remote::RemoteSession`] proxies one hosted by a
//! peer. Both implement [`SessionHandle`], and [`SessionRef`] lets callers
//! hold either without caring which.

pub mod local;
pub mod output;
pub mod process;

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use protocol::{SessionId, SessionInfo};
use thiserror::Error;

use crate::remote::RemoteSession;

pub use local::LocalSession;
pub use output::{OutputLog, OutputStream, OutputSubscriber};
pub use process::{ProcessSpec, SpawnedProcess};

/// Errors that can occur during session operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// No session with this id.
    #[error("session not found: {0}")]
    NotFound(SessionId),

    /// Input was sent to a session that is not running.
    #[error("session {0} is not running")]
    NotInteractive(SessionId),

    /// The agent process could not be started.
    #[error("failed to start process for session {session_id}: {reason}")]
    ProcessSpawnFailed { session_id: SessionId, reason: String },

    /// Too many sessions are still active.
    #[error("session limit reached ({0} active)")]
    LimitReached(usize),

    /// No agent with this name is configured.
    #[error("unknown agent: {0}")]
    UnknownAgent(String),

    /// Writing to the process stdin failed.
    #[error("failed to write input to session {session_id}: {reason}")]
    InputFailed { session_id: SessionId, reason: String },

    /// The peer hosting the session failed the request.
    #[error("remote error: {0}")]
    Remote(String),
}

/// Operations shared by local and remote sessions.
#[allow(async_fn_in_trait)]
pub trait SessionHandle {
    fn id(&self) -> &str;

    /// Current metadata snapshot.
    fn info(&self) -> SessionInfo;

    /// All stdout and stderr bytes captured so far, in arrival order.
    async fn output_buffer(&self) -> Vec<u8>;

    /// Full event sequence from the first event, then live events.
    ///
    /// The stream ends after the terminal event.
    async fn output_stream(&self) -> OutputStream;

    /// Forward bytes to the process stdin. Fails with
    /// [`SessionError::NotInteractive`] unless the session is running.
    async fn send_input(&self, data: &[u8]) -> Result<(), SessionError>;

    /// Stop the session. Stopping a finished session does nothing.
    async fn terminate(&self) -> Result<(), SessionError>;

    /// Resolve with the final metadata once the session is terminal.
    async fn wait(&self) -> SessionInfo;
}

/// A session handle that is either local or remote.
#[derive(Clone)]
pub enum SessionRef {
    Local(Arc<LocalSession>),
    Remote(Arc<RemoteSession>),
}

impl SessionRef {
    pub fn is_local(&self) -> bool {
        matches!(self, SessionRef::Local(_))
    }
}

impl std::fmt::Debug for SessionRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionRef::Local(s) => f.debug_tuple("Local").field(&s.id()).finish(),
            SessionRef::Remote(s) => f.debug_tuple("Remote").field(&s.id()).finish(),
        }
    }
}

impl SessionHandle for SessionRef {
    fn id(&self) -> &str {
        match self {
            SessionRef::Local(s) => s.id(),
            SessionRef::Remote(s) => s.id(),
        }
    }

    fn info(&self) -> SessionInfo {
        match self {
            SessionRef::Local(s) => s.info(),
            SessionRef::Remote(s) => s.info(),
        }
    }

    async fn output_buffer(&self) -> Vec<u8> {
        match self {
            SessionRef::Local(s) => s.output_buffer().await,
            SessionRef::Remote(s) => s.output_buffer().await,
        }
    }

    async fn output_stream(&self) -> OutputStream {
        match self {
            SessionRef::Local(s) => s.output_stream().await,
            SessionRef::Remote(s) => s.output_stream().await,
        }
    }

    async fn send_input(&self, data: &[u8]) -> Result<(), SessionError> {
        match self {
            SessionRef::Local(s) => s.send_input(data).await,
            SessionRef::Remote(s) => s.send_input(data).await,
        }
    }

    async fn terminate(&self) -> Result<(), SessionError> {
        match self {
            SessionRef::Local(s) => s.terminate().await,
            SessionRef::Remote(s) => s.terminate().await,
        }
    }

    async fn wait(&self) -> SessionInfo {
        match self {
            SessionRef::Local(s) => s.wait().await,
            SessionRef::Remote(s) => s.wait().await,
        }
    }
}

/// Get current time in milliseconds since UNIX epoch.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages_are_readable() {
        assert_eq!(
            SessionError::NotInteractive("s1".to_string()).to_string(),
            "session s1 is not running"
        );
        assert_eq!(
            SessionError::ProcessSpawnFailed {
                session_id: "s1".to_string(),
                reason: "No such file or directory".to_string(),
            }
            .to_string(),
            "failed to start process for session s1: No such file or directory"
        );
        assert_eq!(
            SessionError::LimitReached(16).to_string(),
            "session limit reached (16 active)"
        );
    }

    #[test]
    fn test_now_millis_is_recent() {
        // 2020-01-01 in ms
        assert!(now_millis() > 1_577_836_800_000);
    }
}
