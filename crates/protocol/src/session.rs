//! Session data model shared by the daemon, its peers and UI clients.
//!
//! These are owned snapshots. A [`SessionInfo`] handed out by a registry is
//! never updated in place; callers re-fetch to observe progress.

use serde::{Deserialize, Serialize};

/// Opaque session identifier, unique within one device's registry.
pub type SessionId = String;

/// Number of characters of a task id shown in listings.
pub const SHORT_TASK_ID_LEN: usize = 8;

/// Lifecycle status of a session.
///
/// ```text
/// Pending ──► Running ──► Completed | Failed | Terminated
///    │
///    └──────► Failed | Terminated
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Terminated,
}

impl SessionStatus {
    /// Whether no further transition can happen.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Failed | SessionStatus::Terminated
        )
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        match (self, next) {
            (Pending, Running) => true,
            (Pending, Failed | Terminated) => true,
            (Running, Completed | Failed | Terminated) => true,
            _ => false,
        }
    }

    /// Terminal status for a process that exited on its own.
    pub fn from_exit_code(code: i32) -> Self {
        if code == 0 {
            SessionStatus::Completed
        } else {
            SessionStatus::Failed
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Running => "running",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::Terminated => "terminated",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata of one agent run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: SessionId,
    /// Task this run belongs to.
    pub task_id: String,
    /// Agent kind, e.g. `claude` or `codex`.
    pub cli: String,
    pub status: SessionStatus,
    /// Creation time in Unix epoch milliseconds.
    pub created_at: u64,
    /// Bytes of stdout + stderr captured so far.
    pub output_size: u64,
    /// Set iff `status` is `Completed` or `Failed`.
    pub exit_code: Option<i32>,
}

impl SessionInfo {
    /// First [`SHORT_TASK_ID_LEN`] characters of the task id.
    pub fn short_task_id(&self) -> &str {
        short_task_id(&self.task_id)
    }
}

/// Truncate a task id for display. Never used for identity.
pub fn short_task_id(task_id: &str) -> &str {
    match task_id.char_indices().nth(SHORT_TASK_ID_LEN) {
        Some((idx, _)) => &task_id[..idx],
        None => task_id,
    }
}

/// A session together with the device that hosts it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSession {
    pub info: SessionInfo,
    /// Fingerprint of the hosting device.
    pub device_id: String,
    pub device_name: String,
    pub is_local: bool,
}

/// One unit of session output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputEvent {
    Stdout(#[serde(with = "serde_bytes")] Vec<u8>),
    Stderr(#[serde(with = "serde_bytes")] Vec<u8>),
    /// The process exited on its own with this code.
    Exit(i32),
    /// The session was stopped by request or its connection was lost.
    Terminated,
}

impl OutputEvent {
    /// Whether this event ends the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, OutputEvent::Exit(_) | OutputEvent::Terminated)
    }

    /// Output bytes carried by a data event.
    pub fn payload(&self) -> Option<&[u8]> {
        match self {
            OutputEvent::Stdout(data) | OutputEvent::Stderr(data) => Some(data),
            OutputEvent::Exit(_) | OutputEvent::Terminated => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(!SessionStatus::Pending.is_terminal());
        assert!(!SessionStatus::Running.is_terminal());
        assert!(SessionStatus::Completed.is_terminal());
        assert!(SessionStatus::Failed.is_terminal());
        assert!(SessionStatus::Terminated.is_terminal());
    }

    #[test]
    fn test_no_transition_leaves_terminal_state() {
        let all = [
            SessionStatus::Pending,
            SessionStatus::Running,
            SessionStatus::Completed,
            SessionStatus::Failed,
            SessionStatus::Terminated,
        ];
        for from in all.iter().filter(|s| s.is_terminal()) {
            for to in all {
                assert!(!from.can_transition_to(to), "{} -> {}", from, to);
            }
        }
    }

    #[test]
    fn test_allowed_transitions() {
        use SessionStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Pending.can_transition_to(Failed));
        assert!(!Pending.can_transition_to(Completed));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Terminated));
        assert!(!Running.can_transition_to(Pending));
        assert!(!Running.can_transition_to(Running));
    }

    #[test]
    fn test_status_from_exit_code() {
        assert_eq!(SessionStatus::from_exit_code(0), SessionStatus::Completed);
        assert_eq!(SessionStatus::from_exit_code(2), SessionStatus::Failed);
        assert_eq!(SessionStatus::from_exit_code(-1), SessionStatus::Failed);
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let json = serde_json::to_string(&SessionStatus::Terminated).unwrap();
        assert_eq!(json, r#""terminated""#);
    }

    #[test]
    fn test_short_task_id() {
        assert_eq!(short_task_id("0123456789abcdef"), "01234567");
        assert_eq!(short_task_id("abc"), "abc");
        assert_eq!(short_task_id(""), "");
        assert_eq!(short_task_id("ééééééééé"), "éééééééé");
    }

    #[test]
    fn test_output_event_payload() {
        assert_eq!(OutputEvent::Stdout(b"hi".to_vec()).payload(), Some(&b"hi"[..]));
        assert_eq!(OutputEvent::Stderr(b"no".to_vec()).payload(), Some(&b"no"[..]));
        assert_eq!(OutputEvent::Exit(0).payload(), None);
        assert!(OutputEvent::Exit(3).is_terminal());
        assert!(OutputEvent::Terminated.is_terminal());
        assert!(!OutputEvent::Stdout(vec![]).is_terminal());
    }
}
