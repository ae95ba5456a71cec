//! Agent process spawning.
//!
//! An agent runs either on plain pipes (stdout and stderr captured separately)
//! or inside a pseudo-terminal for tools that refuse to run without a TTY.
//! Either way the caller gets the same three pieces: a writer for stdin, a
//! channel of output chunks, and an exit handle.

use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::Stdio;

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use protocol::OutputEvent;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;

use crate::config::ProcessMode;

/// Buffer size for reading process output.
const READ_BUFFER_SIZE: usize = 4096;

/// Capacity of the chunk channel between readers and the session pump.
const CHUNK_CHANNEL_CAPACITY: usize = 256;

/// Default PTY geometry.
const PTY_COLS: u16 = 120;
const PTY_ROWS: u16 = 40;

/// Everything needed to launch one agent process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub mode: ProcessMode,
}

impl ProcessSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
            mode: ProcessMode::Pipes,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn mode(mut self, mode: ProcessMode) -> Self {
        self.mode = mode;
        self
    }

    /// Program and arguments as one line, for logs.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// A freshly started process.
pub struct SpawnedProcess {
    pub pid: Option<u32>,
    pub input: ProcessInput,
    /// Data events in arrival order; closes once all output is drained.
    pub output: mpsc::Receiver<OutputEvent>,
    pub exit: ProcessExit,
}

/// Start a process as described by `spec`.
///
/// Must be called from within a tokio runtime: reader tasks are spawned
/// before this returns.
pub fn spawn(spec: &ProcessSpec) -> std::io::Result<SpawnedProcess> {
    match spec.mode {
        ProcessMode::Pipes => spawn_piped(spec),
        ProcessMode::Pty => spawn_pty(spec),
    }
}

fn spawn_piped(spec: &ProcessSpec) -> std::io::Result<SpawnedProcess> {
    let mut command = Command::new(&spec.program);
    command
        .args(&spec.args)
        .envs(spec.env.iter().map(|(k, v)| (k, v)))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true);
    if let Some(cwd) = &spec.cwd {
        command.current_dir(cwd);
    }

    let mut child = command.spawn()?;
    let pid = child.id();

    let missing = |name: &str| std::io::Error::other(format!("child {} was not captured", name));
    let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
    let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
    let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;

    let (tx, rx) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);
    tokio::spawn(forward_pipe(stdout, tx.clone(), OutputEvent::Stdout));
    tokio::spawn(forward_pipe(stderr, tx, OutputEvent::Stderr));

    Ok(SpawnedProcess {
        pid,
        input: ProcessInput::Pipe(stdin),
        output: rx,
        exit: ProcessExit::Pipe(child),
    })
}

async fn forward_pipe<R>(
    mut reader: R,
    tx: mpsc::Sender<OutputEvent>,
    wrap: fn(Vec<u8>) -> OutputEvent,
) where
    R: AsyncRead + Unpin,
{
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    loop {
        match reader.read(&mut buffer).await {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(wrap(buffer[..n].to_vec())).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "Process pipe read failed");
                break;
            }
        }
    }
}

fn spawn_pty(spec: &ProcessSpec) -> std::io::Result<SpawnedProcess> {
    let pty_error = |e: anyhow::Error| std::io::Error::other(e.to_string());

    let pair = native_pty_system()
        .openpty(PtySize {
            rows: PTY_ROWS,
            cols: PTY_COLS,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(pty_error)?;

    let mut command = CommandBuilder::new(&spec.program);
    command.args(&spec.args);
    for (key, value) in &spec.env {
        command.env(key, value);
    }
    match &spec.cwd {
        Some(cwd) => command.cwd(cwd),
        None => {
            if let Ok(cwd) = std::env::current_dir() {
                command.cwd(cwd);
            }
        }
    }

    let child = pair.slave.spawn_command(command).map_err(pty_error)?;
    // The slave end belongs to the child now; keeping it open would hide EOF.
    drop(pair.slave);

    let pid = child.process_id();
    let writer = pair.master.take_writer().map_err(pty_error)?;
    let reader = pair.master.try_clone_reader().map_err(pty_error)?;

    let (tx, rx) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);
    tokio::task::spawn_blocking(move || read_pty(reader, tx));

    Ok(SpawnedProcess {
        pid,
        input: ProcessInput::Pty(writer),
        output: rx,
        exit: ProcessExit::Pty {
            child,
            _master: pair.master,
        },
    })
}

fn read_pty(mut reader: Box<dyn Read + Send>, tx: mpsc::Sender<OutputEvent>) {
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    loop {
        match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => {
                if tx
                    .blocking_send(OutputEvent::Stdout(buffer[..n].to_vec()))
                    .is_err()
                {
                    break;
                }
            }
            // Linux reports EIO on the master once the child side is gone.
            Err(e) => {
                tracing::trace!(error = %e, "PTY read ended");
                break;
            }
        }
    }
}

/// Writer for a process's stdin.
pub enum ProcessInput {
    Pipe(ChildStdin),
    Pty(Box<dyn Write + Send>),
}

impl ProcessInput {
    pub async fn write(&mut self, data: &[u8]) -> std::io::Result<()> {
        match self {
            ProcessInput::Pipe(stdin) => {
                stdin.write_all(data).await?;
                stdin.flush().await
            }
            ProcessInput::Pty(writer) => {
                writer.write_all(data)?;
                writer.flush()
            }
        }
    }
}

/// Handle used to reap a process.
pub enum ProcessExit {
    Pipe(Child),
    Pty {
        child: Box<dyn portable_pty::Child + Send + Sync>,
        _master: Box<dyn MasterPty + Send>,
    },
}

impl ProcessExit {
    /// Wait for the process to exit and return its exit code.
    ///
    /// A process killed by a signal reports `128 + signal`.
    pub async fn wait(self) -> std::io::Result<i32> {
        match self {
            ProcessExit::Pipe(mut child) => {
                let status = child.wait().await?;
                Ok(exit_code_of(status))
            }
            ProcessExit::Pty { mut child, _master } => {
                let status = tokio::task::spawn_blocking(move || {
                    let status = child.wait();
                    drop(_master);
                    status
                })
                .await
                .map_err(std::io::Error::other)??;
                Ok(status.exit_code() as i32)
            }
        }
    }

    /// Kill the process immediately.
    pub fn kill(&mut self) -> std::io::Result<()> {
        match self {
            ProcessExit::Pipe(child) => child.start_kill(),
            ProcessExit::Pty { child, .. } => child.kill(),
        }
    }
}

fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    match status.code() {
        Some(code) => code,
        None => status.signal().map(|s| 128 + s).unwrap_or(-1),
    }
}

/// Send `signal` to the process group led by `pid`.
///
/// Agents are spawned as group leaders (pipes mode via `process_group(0)`,
/// PTY mode as session leaders), so helpers they start get the signal too.
/// A group that is already gone is not an error.
pub fn send_signal(pid: u32, signal: Signal) -> nix::Result<()> {
    match killpg(Pid::from_raw(pid as i32), signal) {
        Err(nix::errno::Errno::ESRCH) => Ok(()),
        other => other,
    }
}
