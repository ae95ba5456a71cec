//! Configuration management for the Envoy daemon.
//!
//! Configuration is a TOML file, by default `~/.config/envoy/config.toml`.
//! Every section is optional; missing keys fall back to their defaults.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default port of the peer server.
pub const DEFAULT_PORT: u16 = 8080;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("max_sessions must be between 1 and 1000, got {0}")]
    InvalidMaxSessions(usize),

    #[error("{name} must be greater than 0")]
    ZeroDuration { name: &'static str },

    #[error("terminate_grace_ms must be at most 60000, got {0}")]
    InvalidGracePeriod(u64),

    #[error("agent '{0}' has an empty program")]
    EmptyAgentProgram(String),

    #[error("invalid peer address '{0}': expected HOST or HOST:PORT")]
    InvalidPeerAddress(String),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the Envoy daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General daemon configuration.
    pub daemon: DaemonConfig,

    /// Session management configuration.
    pub session: SessionConfig,

    /// Peer server and remote connection configuration.
    pub remote: RemoteConfig,
}

/// General daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Directory for the identity key and log files.
    pub data_dir: PathBuf,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Also write logs to a daily-rolling file under `data_dir/logs`.
    pub log_file: bool,

    /// Name announced to peers.
    pub device_name: String,
}

/// How an agent process is attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessMode {
    /// Separate stdout and stderr pipes.
    #[default]
    Pipes,
    /// A pseudo-terminal; all output is reported as stdout.
    Pty,
}

/// Command line used to launch one kind of agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentConfig {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl AgentConfig {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Whether the program can be found, either as a path or on `PATH`.
    pub fn is_installed(&self) -> bool {
        let path = Path::new(&self.program);
        if path.is_absolute() {
            path.exists()
        } else {
            which::which(&self.program).is_ok()
        }
    }
}

/// Session management configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Maximum number of sessions that are not yet terminal.
    pub max_sessions: usize,

    /// How long terminal sessions are kept before cleanup evicts them.
    pub retention_secs: u64,

    /// Interval of the cleanup task.
    pub cleanup_interval_secs: u64,

    /// Time between SIGTERM and SIGKILL when terminating.
    pub terminate_grace_ms: u64,

    pub process_mode: ProcessMode,

    /// Known agent kinds, keyed by the name used in `SessionInfo::cli`.
    pub agents: BTreeMap<String, AgentConfig>,
}

/// Peer server and outgoing connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RemoteConfig {
    /// Address the peer server binds to.
    pub listen_addr: String,

    /// Port of the peer server. `0` picks a free port.
    pub port: u16,

    /// Bound on TCP connect plus handshake.
    pub connect_timeout_ms: u64,

    /// Bound on listing one remote device's sessions.
    pub list_timeout_ms: u64,

    /// Peers connected at daemon start, as `HOST` or `HOST:PORT`.
    pub peers: Vec<String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: "info".to_string(),
            log_file: false,
            device_name: default_device_name(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_sessions: 16,
            retention_secs: 3600,
            cleanup_interval_secs: 60,
            terminate_grace_ms: 3000,
            process_mode: ProcessMode::Pipes,
            agents: default_agents(),
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            connect_timeout_ms: 5000,
            list_timeout_ms: 3000,
            peers: Vec::new(),
        }
    }
}

impl SessionConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn terminate_grace(&self) -> Duration {
        Duration::from_millis(self.terminate_grace_ms)
    }
}

impl RemoteConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn list_timeout(&self) -> Duration {
        Duration::from_millis(self.list_timeout_ms)
    }

    /// `listen_addr:port`, ready for binding.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.listen_addr, self.port)
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("envoy")
        .join("config.toml")
}

/// Returns the default data directory path.
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("envoy")
}

/// The machine's hostname, or "envoy" when it cannot be read.
fn default_device_name() -> String {
    let name = gethostname::gethostname().to_string_lossy().trim().to_string();
    if name.is_empty() {
        "envoy".to_string()
    } else {
        name
    }
}

fn default_agents() -> BTreeMap<String, AgentConfig> {
    let mut agents = BTreeMap::new();
    agents.insert(
        "claude".to_string(),
        AgentConfig::new("claude").with_args(["--print"]),
    );
    agents.insert(
        "codex".to_string(),
        AgentConfig::new("codex").with_args(["exec"]),
    );
    agents.insert("gemini".to_string(), AgentConfig::new("gemini"));
    agents
}

/// Split `HOST` or `HOST:PORT` into its parts, using `default_port` when the
/// port is omitted. Bracketed IPv6 literals (`[::1]:8080`) are accepted.
pub fn parse_peer_addr(addr: &str, default_port: u16) -> Result<(String, u16), ConfigError> {
    let invalid = || ConfigError::InvalidPeerAddress(addr.to_string());
    let addr = addr.trim();
    if addr.is_empty() {
        return Err(invalid());
    }

    if let Some(rest) = addr.strip_prefix('[') {
        let (host, tail) = rest.split_once(']').ok_or_else(invalid)?;
        let port = match tail.strip_prefix(':') {
            Some(port) => port.parse().map_err(|_| invalid())?,
            None if tail.is_empty() => default_port,
            None => return Err(invalid()),
        };
        return Ok((host.to_string(), port));
    }

    match addr.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && !host.contains(':') => {
            let port = port.parse().map_err(|_| invalid())?;
            Ok((host.to_string(), port))
        }
        Some(_) => Err(invalid()),
        None => Ok((addr.to_string(), default_port)),
    }
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - ENVOY_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - ENVOY_PORT: Override the peer server port
    /// - ENVOY_LISTEN_ADDR: Override the peer server bind address
    pub fn apply_env_overrides(&mut self) {
        if let Some(level) = non_empty_env("ENVOY_LOG_LEVEL") {
            tracing::info!("Overriding log_level from environment: {}", level);
            self.daemon.log_level = level;
        }

        if let Some(port) = non_empty_env("ENVOY_PORT") {
            match port.parse::<u16>() {
                Ok(port) => {
                    tracing::info!("Overriding port from environment: {}", port);
                    self.remote.port = port;
                }
                Err(_) => tracing::warn!("Ignoring invalid ENVOY_PORT value: {}", port),
            }
        }

        if let Some(addr) = non_empty_env("ENVOY_LISTEN_ADDR") {
            tracing::info!("Overriding listen_addr from environment: {}", addr);
            self.remote.listen_addr = addr;
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let session = &self.session;
        if session.max_sessions < 1 || session.max_sessions > 1000 {
            return Err(ConfigError::InvalidMaxSessions(session.max_sessions));
        }

        if session.cleanup_interval_secs == 0 {
            return Err(ConfigError::ZeroDuration {
                name: "cleanup_interval_secs",
            });
        }

        if session.terminate_grace_ms > 60_000 {
            return Err(ConfigError::InvalidGracePeriod(session.terminate_grace_ms));
        }

        if let Some((name, _)) = session
            .agents
            .iter()
            .find(|(_, agent)| agent.program.trim().is_empty())
        {
            return Err(ConfigError::EmptyAgentProgram(name.clone()));
        }

        if self.remote.connect_timeout_ms == 0 {
            return Err(ConfigError::ZeroDuration {
                name: "connect_timeout_ms",
            });
        }

        if self.remote.list_timeout_ms == 0 {
            return Err(ConfigError::ZeroDuration {
                name: "list_timeout_ms",
            });
        }

        for peer in &self.remote.peers {
            parse_peer_addr(peer, DEFAULT_PORT)?;
        }

        let level = self.daemon.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.daemon.log_level.clone()));
        }

        Ok(())
    }

    /// Names of configured agents whose program cannot be found.
    pub fn missing_agents(&self) -> Vec<String> {
        self.session
            .agents
            .iter()
            .filter(|(_, agent)| !agent.is_installed())
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
