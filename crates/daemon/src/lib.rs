//! # Envoy Daemon Library
//!
//! Runs CLI coding agents as sessions and lets other devices follow them.
//!
//! ## Overview
//!
//! - **Sessions**: each agent run is a process whose output is kept in an
//!   append-only log; any number of subscribers replay it from the start.
//! - **Registry**: owns the local sessions and the connections to remote
//!   devices, and lists them all together.
//! - **Remote access**: a peer server exposes local sessions over TCP;
//!   remote sessions are driven through proxies that mirror their output.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                  Daemon Orchestrator                   │
//! ├────────────────────────────────────────────────────────┤
//! │  ┌──────────────────────────┐   ┌──────────────────┐   │
//! │  │     Session Registry     │◄──│   Peer Server    │   │
//! │  │  local ─► LocalSession   │   └──────────────────┘   │
//! │  │  remote ─► RemoteSession │──► RemoteConnection      │
//! │  └──────────────────────────┘                          │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use envoy_daemon::{Config, DaemonOrchestrator};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!
//!     let mut orchestrator = DaemonOrchestrator::new(config)?;
//!     orchestrator.start().await?;
//!
//!     // Serve until asked to stop...
//!
//!     orchestrator.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`session`]: Local sessions, output logs and process spawning
//! - [`registry`]: Session registry across devices
//! - [`remote`]: Peer server, remote connections and session proxies
//! - [`collaborators`]: Contracts of chat and indexing services
//! - [`orchestrator`]: Main daemon coordinator

pub mod collaborators;
pub mod config;
pub mod orchestrator;
pub mod registry;
pub mod remote;
pub mod session;

// Re-export protocol for convenience
pub use protocol;

pub use config::Config;
pub use orchestrator::{DaemonOrchestrator, OrchestratorEvent, OrchestratorState};
pub use registry::{DeviceInfo, SessionRegistry};
pub use remote::{ConnectionError, ConnectionFailure, PeerServer, RemoteConnection, RemoteSession};
pub use protocol::{DeviceSession, OutputEvent, SessionInfo, SessionStatus};
pub use session::{LocalSession, SessionError, SessionHandle, SessionRef};
