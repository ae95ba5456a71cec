//! A session backed by a process on this machine.
//!
//! One pump task per session owns the process: it is the only producer into
//! the session's [`OutputLog`] and it reaps the child. Status transitions go
//! through a single lock, and only the caller that wins the transition into a
//! terminal state appends the terminal event.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use nix::sys::signal::Signal;
use protocol::{OutputEvent, SessionId, SessionInfo, SessionStatus};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::output::{OutputLog, OutputStream};
use super::process::{self, ProcessExit, ProcessInput, ProcessSpec};
use super::{now_millis, SessionError, SessionHandle};

/// Exit code reported when the process never started.
pub const SPAWN_FAILURE_EXIT_CODE: i32 = -1;

/// How long output still queued at exit is collected before `Exit` is logged.
const EXIT_DRAIN_TIMEOUT: Duration = Duration::from_millis(200);

struct State {
    status: SessionStatus,
    exit_code: Option<i32>,
    pid: Option<u32>,
    finished_at: Option<Instant>,
}

/// A locally running agent session.
pub struct LocalSession {
    id: SessionId,
    task_id: String,
    cli: String,
    created_at: u64,
    state: Mutex<State>,
    log: Arc<OutputLog>,
    input: tokio::sync::Mutex<Option<ProcessInput>>,
    terminate_grace: Duration,
    /// Cancelled once the child has been reaped.
    exited: CancellationToken,
}

impl LocalSession {
    /// A new session in `Pending` state. Nothing runs until [`start`].
    ///
    /// [`start`]: LocalSession::start
    pub fn new(
        id: impl Into<SessionId>,
        task_id: impl Into<String>,
        cli: impl Into<String>,
        terminate_grace: Duration,
    ) -> Arc<Self> {
        let id = id.into();
        Arc::new(Self {
            log: Arc::new(OutputLog::new(id.clone())),
            id,
            task_id: task_id.into(),
            cli: cli.into(),
            created_at: now_millis(),
            state: Mutex::new(State {
                status: SessionStatus::Pending,
                exit_code: None,
                pid: None,
                finished_at: None,
            }),
            input: tokio::sync::Mutex::new(None),
            terminate_grace,
            exited: CancellationToken::new(),
        })
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn status(&self) -> SessionStatus {
        self.state().status
    }

    pub fn pid(&self) -> Option<u32> {
        self.state().pid
    }

    /// The session's output log.
    pub fn log(&self) -> &Arc<OutputLog> {
        &self.log
    }

    /// When the session became terminal.
    pub fn finished_at(&self) -> Option<Instant> {
        self.state().finished_at
    }

    /// Move to `next` if the state machine allows it.
    fn transition(&self, next: SessionStatus, exit_code: Option<i32>) -> bool {
        let mut state = self.state();
        if !state.status.can_transition_to(next) {
            return false;
        }
        state.status = next;
        state.exit_code = exit_code;
        if next.is_terminal() {
            state.finished_at = Some(Instant::now());
        }
        true
    }

    /// Spawn the process and start pumping its output.
    ///
    /// On failure the session is left `Failed` with exit code `-1` and a
    /// single `Exit(-1)` event.
    pub fn start(self: &Arc<Self>, spec: &ProcessSpec) -> Result<(), SessionError> {
        let spawned = match process::spawn(spec) {
            Ok(spawned) => spawned,
            Err(e) => {
                let reason = e.to_string();
                tracing::warn!(
                    session_id = %self.id,
                    command = %spec.command_line(),
                    error = %reason,
                    "Failed to start agent process"
                );
                if self.transition(SessionStatus::Failed, Some(SPAWN_FAILURE_EXIT_CODE)) {
                    self.log.append(OutputEvent::Exit(SPAWN_FAILURE_EXIT_CODE));
                }
                self.exited.cancel();
                return Err(SessionError::ProcessSpawnFailed {
                    session_id: self.id.clone(),
                    reason,
                });
            }
        };

        let process::SpawnedProcess {
            pid,
            input,
            output,
            mut exit,
        } = spawned;

        // Nobody writes input before the session is running, so the slot is free.
        if let Ok(mut slot) = self.input.try_lock() {
            *slot = Some(input);
        }

        {
            let mut state = self.state();
            if !state.status.can_transition_to(SessionStatus::Running) {
                drop(state);
                // Terminated while still pending.
                tracing::debug!(session_id = %self.id, "Session ended before start, killing process");
                if let Ok(mut slot) = self.input.try_lock() {
                    slot.take();
                }
                let _ = exit.kill();
                self.exited.cancel();
                return Ok(());
            }
            state.status = SessionStatus::Running;
            state.pid = pid;
        }

        tracing::info!(
            session_id = %self.id,
            task_id = %self.task_id,
            cli = %self.cli,
            pid = ?pid,
            command = %spec.command_line(),
            "Session started"
        );

        tokio::spawn(Arc::clone(self).pump(output, exit));
        Ok(())
    }

    /// Move process output into the log until the child exits.
    ///
    /// Reaping does not wait for end-of-file: helpers the agent leaves behind
    /// may keep its pipes open. Output still in flight when the child exits
    /// is drained for at most [`EXIT_DRAIN_TIMEOUT`].
    async fn pump(self: Arc<Self>, mut output: mpsc::Receiver<OutputEvent>, exit: ProcessExit) {
        let wait = exit.wait();
        tokio::pin!(wait);

        let mut output_open = true;
        let reaped = loop {
            tokio::select! {
                biased;
                event = output.recv(), if output_open => match event {
                    Some(event) => {
                        self.log.append(event);
                    }
                    None => output_open = false,
                },
                reaped = &mut wait => break reaped,
            }
        };

        if output_open {
            let deadline = tokio::time::Instant::now() + EXIT_DRAIN_TIMEOUT;
            while let Ok(Some(event)) = tokio::time::timeout_at(deadline, output.recv()).await {
                self.log.append(event);
            }
        }

        let code = match reaped {
            Ok(code) => code,
            Err(e) => {
                tracing::error!(session_id = %self.id, error = %e, "Failed to reap process");
                SPAWN_FAILURE_EXIT_CODE
            }
        };
        self.exited.cancel();
        self.input.lock().await.take();

        let status = SessionStatus::from_exit_code(code);
        if self.transition(status, Some(code)) {
            self.log.append(OutputEvent::Exit(code));
            tracing::info!(
                session_id = %self.id,
                exit_code = code,
                status = %status,
                output_size = self.log.byte_len(),
                "Session exited"
            );
        } else {
            tracing::debug!(session_id = %self.id, exit_code = code, "Process reaped after termination");
        }
    }

    /// SIGTERM to the agent's process group now, SIGKILL after the grace period.
    ///
    /// The group is killed even if the agent was reaped in between: helpers
    /// it started may ignore SIGTERM and would otherwise outlive the session.
    fn escalate(&self, pid: u32) {
        if let Err(e) = process::send_signal(pid, Signal::SIGTERM) {
            tracing::warn!(session_id = %self.id, pid, error = %e, "Failed to send SIGTERM");
        }

        let exited = self.exited.clone();
        let grace = self.terminate_grace;
        let session_id = self.id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if exited.is_cancelled() {
                tracing::debug!(session_id = %session_id, pid, "Killing what is left of the process group");
            } else {
                tracing::info!(session_id = %session_id, pid, "Grace period elapsed, sending SIGKILL");
            }
            if let Err(e) = process::send_signal(pid, Signal::SIGKILL) {
                tracing::warn!(session_id = %session_id, pid, error = %e, "Failed to send SIGKILL");
            }
        });
    }
}

impl SessionHandle for LocalSession {
    fn id(&self) -> &str {
        &self.id
    }

    fn info(&self) -> SessionInfo {
        let state = self.state();
        SessionInfo {
            id: self.id.clone(),
            task_id: self.task_id.clone(),
            cli: self.cli.clone(),
            status: state.status,
            created_at: self.created_at,
            output_size: self.log.byte_len(),
            exit_code: state.exit_code,
        }
    }

    async fn output_buffer(&self) -> Vec<u8> {
        self.log.buffer()
    }

    async fn output_stream(&self) -> OutputStream {
        self.log.stream()
    }

    async fn send_input(&self, data: &[u8]) -> Result<(), SessionError> {
        if self.status() != SessionStatus::Running {
            return Err(SessionError::NotInteractive(self.id.clone()));
        }

        let mut input = self.input.lock().await;
        let writer = input
            .as_mut()
            .ok_or_else(|| SessionError::NotInteractive(self.id.clone()))?;
        writer
            .write(data)
            .await
            .map_err(|e| SessionError::InputFailed {
                session_id: self.id.clone(),
                reason: e.to_string(),
            })
    }

    async fn terminate(&self) -> Result<(), SessionError> {
        if !self.transition(SessionStatus::Terminated, None) {
            tracing::debug!(session_id = %self.id, status = %self.status(), "Terminate ignored");
            return Ok(());
        }

        self.log.append(OutputEvent::Terminated);
        tracing::info!(session_id = %self.id, "Session terminated");

        if let Some(pid) = self.pid() {
            if !self.exited.is_cancelled() {
                self.escalate(pid);
            }
        }
        Ok(())
    }

    async fn wait(&self) -> SessionInfo {
        self.log.sealed().await;
        self.info()
    }
}

impl std::fmt::Debug for LocalSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalSession")
            .field("id", &self.id)
            .field("cli", &self.cli)
            .field("status", &self.status())
            .finish()
    }
}
