//! Envoy daemon and command line client.
//!
//! `envoy start` runs the daemon. Every other command talks to a running
//! daemon over the peer protocol, the same way one daemon talks to another.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use envoy_daemon::config::{parse_peer_addr, Config};
use envoy_daemon::orchestrator::{DaemonOrchestrator, OrchestratorEvent};
use envoy_daemon::protocol::{CreateSessionRequest, DeviceIdentity, DeviceSession, OutputEvent};
use envoy_daemon::registry::SessionRegistry;
use envoy_daemon::remote::RemoteConnection;
use envoy_daemon::session::{SessionHandle, SessionRef};
use futures_util::StreamExt;
use tokio::io::AsyncReadExt;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Envoy - run CLI coding agents and follow their sessions across devices.
#[derive(Parser, Debug)]
#[command(name = "envoy")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Daemon host for client commands
    #[arg(long, global = true, default_value = "127.0.0.1")]
    pub host: String,

    /// Daemon port for client commands (defaults to the configured port)
    #[arg(long, global = true)]
    pub port: Option<u16>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run the daemon until SIGINT or SIGTERM
    Start,

    /// Inspect and control sessions
    #[command(subcommand)]
    Sessions(SessionsCommands),

    /// Start an agent on the daemon and stream its output
    Run {
        /// Agent name from the configuration, e.g. claude
        agent: String,

        /// Task the session belongs to (a fresh id if omitted)
        #[arg(long = "task", value_name = "ID")]
        task_id: Option<String>,

        /// Working directory of the agent on the daemon's machine
        #[arg(long, value_name = "DIR")]
        cwd: Option<String>,

        /// Forward this terminal's stdin to the agent
        #[arg(long, short)]
        interactive: bool,

        /// Extra arguments appended to the agent's command line
        #[arg(last = true)]
        args: Vec<String>,
    },
}

#[derive(Subcommand, Debug, Clone)]
pub enum SessionsCommands {
    /// List sessions of the daemon and any extra devices
    List {
        /// Output in JSON format
        #[arg(long)]
        json: bool,

        /// Additional device to include, as HOST or HOST:PORT
        #[arg(long = "remote", value_name = "HOST[:PORT]")]
        remotes: Vec<String>,
    },

    /// Stream a session's output from the beginning
    Tail {
        session_id: String,
    },

    /// Terminate a session
    Kill {
        session_id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };
    config.apply_env_overrides();
    config.validate()?;

    let _log_guard = init_tracing(&cli, &config, matches!(cli.command, Commands::Start))?;

    match cli.command.clone() {
        Commands::Start => run_daemon(config).await,
        Commands::Sessions(SessionsCommands::List { json, remotes }) => {
            let client = Client::connect(&cli, &config).await?;
            list_sessions(&client, &remotes, config.remote.port, json).await
        }
        Commands::Sessions(SessionsCommands::Tail { session_id }) => {
            let client = Client::connect(&cli, &config).await?;
            let session = client.session(&session_id).await?;
            let code = stream_session(&session).await?;
            std::process::exit(code);
        }
        Commands::Sessions(SessionsCommands::Kill { session_id }) => {
            let client = Client::connect(&cli, &config).await?;
            client.registry.terminate(&session_id).await?;
            println!("Session {} terminated", session_id);
            Ok(())
        }
        Commands::Run {
            agent,
            task_id,
            cwd,
            interactive,
            args,
        } => {
            let client = Client::connect(&cli, &config).await?;
            let request = CreateSessionRequest {
                task_id: task_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
                cli: agent,
                args,
                cwd,
            };
            let code = run_agent(&client, request, interactive).await?;
            std::process::exit(code);
        }
    }
}

/// Console logging, plus a daily log file for the daemon when configured.
fn init_tracing(
    cli: &Cli,
    config: &Config,
    daemon: bool,
) -> anyhow::Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let level = if cli.verbose {
        "debug".to_string()
    } else if daemon {
        config.daemon.log_level.to_lowercase()
    } else {
        "warn".to_string()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&level));

    let (file_layer, guard) = if daemon && config.daemon.log_file {
        let dir = config.daemon.data_dir.join("logs");
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
        let appender = tracing_appender::rolling::daily(&dir, "envoy.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        (
            Some(fmt::layer().with_writer(writer).with_ansi(false)),
            Some(guard),
        )
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();

    Ok(guard)
}

async fn run_daemon(config: Config) -> anyhow::Result<()> {
    let mut orchestrator = DaemonOrchestrator::new(config)?;
    tracing::info!(device_id = %orchestrator.device_id_fingerprint(), "Starting Envoy daemon");

    let mut events = orchestrator.subscribe();
    orchestrator.start().await?;

    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                OrchestratorEvent::StateChanged(state) => {
                    tracing::debug!(state = ?state, "Orchestrator state changed");
                }
                OrchestratorEvent::PeerConnected { addr, device_name } => {
                    tracing::info!(addr = %addr, device_name = %device_name, "Peer connected");
                }
                OrchestratorEvent::PeerUnreachable { addr, reason } => {
                    tracing::warn!(addr = %addr, reason = %reason, "Peer unreachable");
                }
            }
        }
    });

    wait_for_shutdown_signal().await?;
    orchestrator.stop().await
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => tracing::info!("Received SIGTERM"),
        _ = sigint.recv() => tracing::info!("Received SIGINT"),
    }
    Ok(())
}

/// A client-side registry connected to the daemon.
///
/// The client has no local sessions; the daemon and any extra devices are
/// its remotes. It uses a throwaway identity.
struct Client {
    registry: SessionRegistry,
    daemon: Arc<RemoteConnection>,
}

impl Client {
    async fn connect(cli: &Cli, config: &Config) -> anyhow::Result<Self> {
        let registry = SessionRegistry::new(config, Arc::new(DeviceIdentity::generate()));
        let port = cli.port.unwrap_or(config.remote.port);
        let daemon = registry
            .connect_to_remote(&cli.host, port)
            .await
            .context("Is the daemon running? Start it with `envoy start`")?;
        Ok(Self { registry, daemon })
    }

    async fn session(&self, session_id: &str) -> anyhow::Result<SessionRef> {
        self.registry
            .get_session(session_id)
            .await
            .with_context(|| format!("No session {} on {}", session_id, self.daemon.device_name()))
    }
}

async fn list_sessions(
    client: &Client,
    remotes: &[String],
    default_port: u16,
    json: bool,
) -> anyhow::Result<()> {
    for remote in remotes {
        let (host, port) = parse_peer_addr(remote, default_port)?;
        if let Err(e) = client.registry.connect_to_remote(&host, port).await {
            eprintln!("Skipping {}: {}", remote, e);
        }
    }

    let sessions = client.registry.list_all_sessions().await;
    if json {
        println!("{}", serde_json::to_string_pretty(&sessions)?);
    } else {
        print_sessions_table(&sessions);
    }
    Ok(())
}

/// Print sessions in a formatted ASCII table.
fn print_sessions_table(sessions: &[DeviceSession]) {
    if sessions.is_empty() {
        println!("No sessions.");
        return;
    }

    let device_width = sessions
        .iter()
        .map(|s| s.device_name.len())
        .max()
        .unwrap_or(6)
        .clamp(6, 24);

    println!(
        "{:<36}  {:<device_width$}  {:<8}  {:<8}  {:<10}  {:>9}  {:>9}",
        "ID", "DEVICE", "TASK", "AGENT", "STATUS", "OUTPUT", "CREATED",
    );
    println!("{}", "-".repeat(36 + device_width + 8 + 8 + 10 + 9 + 9 + 12));

    for session in sessions {
        let info = &session.info;
        let status = match info.exit_code {
            Some(code) if code != 0 => format!("{} ({})", info.status, code),
            _ => info.status.to_string(),
        };
        println!(
            "{:<36}  {:<device_width$}  {:<8}  {:<8}  {:<10}  {:>9}  {:>9}",
            info.id,
            truncate_str(&session.device_name, device_width),
            info.short_task_id(),
            truncate_str(&info.cli, 8),
            status,
            format_bytes(info.output_size),
            format_relative_time(info.created_at / 1000),
        );
    }

    println!();
    println!("Total: {} session(s)", sessions.len());
}

/// Format a Unix timestamp as relative time (e.g., "5m ago").
fn format_relative_time(timestamp: u64) -> String {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let elapsed = now.saturating_sub(timestamp);

    if elapsed < 60 {
        format!("{}s ago", elapsed)
    } else if elapsed < 3600 {
        format!("{}m ago", elapsed / 60)
    } else if elapsed < 86400 {
        format!("{}h ago", elapsed / 3600)
    } else {
        format!("{}d ago", elapsed / 86400)
    }
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KiB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MiB", bytes as f64 / (1024.0 * 1024.0))
    }
}

/// Truncate a string to at most `max_len` characters, marking the cut with "...".
fn truncate_str(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

/// Copy a session's output to this terminal until it ends.
///
/// Returns the exit code to report: the process's own code, or 130 if the
/// session was terminated.
async fn stream_session(session: &SessionRef) -> anyhow::Result<i32> {
    let mut stream = session.output_stream().await;
    let mut stdout = std::io::stdout();
    let mut stderr = std::io::stderr();

    while let Some(event) = stream.next().await {
        match event {
            OutputEvent::Stdout(data) => {
                stdout.write_all(&data)?;
                stdout.flush()?;
            }
            OutputEvent::Stderr(data) => {
                stderr.write_all(&data)?;
                stderr.flush()?;
            }
            OutputEvent::Exit(code) => return Ok(code),
            OutputEvent::Terminated => {
                eprintln!("[envoy] session {} terminated", session.id());
                return Ok(130);
            }
        }
    }
    Ok(session.info().exit_code.unwrap_or(130))
}

async fn run_agent(
    client: &Client,
    request: CreateSessionRequest,
    interactive: bool,
) -> anyhow::Result<i32> {
    let session = SessionRef::Remote(client.daemon.create_session(request).await?);
    eprintln!(
        "[envoy] session {} started on {}",
        session.id(),
        client.daemon.device_name()
    );

    if interactive {
        let input = session.clone();
        tokio::spawn(async move {
            let mut stdin = tokio::io::stdin();
            let mut buf = vec![0u8; 4096];
            loop {
                match stdin.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if let Err(e) = input.send_input(&buf[..n]).await {
                            tracing::debug!(error = %e, "Stopped forwarding stdin");
                            break;
                        }
                    }
                }
            }
        });
    }

    tokio::select! {
        code = stream_session(&session) => code,
        _ = tokio::signal::ctrl_c() => {
            session.terminate().await?;
            eprintln!("[envoy] session {} terminated", session.id());
            Ok(130)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_debug_assert() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_start_command() {
        let cli = Cli::try_parse_from(["envoy", "start"]).unwrap();
        assert!(matches!(cli.command, Commands::Start));
        assert_eq!(cli.host, "127.0.0.1");
        assert_eq!(cli.port, None);
    }

    #[test]
    fn test_sessions_list_with_remotes() {
        let cli = Cli::try_parse_from([
            "envoy", "sessions", "list", "--json", "--remote", "laptop", "--remote", "10.0.0.2:9000",
        ])
        .unwrap();
        match cli.command {
            Commands::Sessions(SessionsCommands::List { json, remotes }) => {
                assert!(json);
                assert_eq!(remotes, vec!["laptop", "10.0.0.2:9000"]);
            }
            other => panic!("Expected sessions list, got {:?}", other),
        }
    }

    #[test]
    fn test_sessions_tail_and_kill() {
        let cli = Cli::try_parse_from(["envoy", "sessions", "tail", "abc"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Sessions(SessionsCommands::Tail { ref session_id }) if session_id == "abc"
        ));

        let cli = Cli::try_parse_from(["envoy", "--port", "9000", "sessions", "kill", "abc"]).unwrap();
        assert_eq!(cli.port, Some(9000));
        assert!(matches!(cli.command, Commands::Sessions(SessionsCommands::Kill { .. })));
    }

    #[test]
    fn test_run_with_trailing_args() {
        let cli = Cli::try_parse_from([
            "envoy", "run", "claude", "--task", "task-42", "--cwd", "/tmp", "--", "-p", "fix the build",
        ])
        .unwrap();
        match cli.command {
            Commands::Run {
                agent,
                task_id,
                cwd,
                interactive,
                args,
            } => {
                assert_eq!(agent, "claude");
                assert_eq!(task_id.as_deref(), Some("task-42"));
                assert_eq!(cwd.as_deref(), Some("/tmp"));
                assert!(!interactive);
                assert_eq!(args, vec!["-p", "fix the build"]);
            }
            other => panic!("Expected run, got {:?}", other),
        }
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["envoy", "sessions", "list", "--verbose", "--host", "pi.local"]).unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.host, "pi.local");
    }

    #[test]
    fn test_truncate_str() {
        assert_eq!(truncate_str("short", 10), "short");
        assert_eq!(truncate_str("a-very-long-device-name", 10), "a-very-...");
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KiB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.0 MiB");
    }
}
