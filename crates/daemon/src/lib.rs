//! # Nomacode Daemon Library
//!
//! This crate provides the daemon side of Nomacode: a terminal session
//! multiplexer that hosts long-running shells and coding CLIs and relays
//! their output to remote viewers.
//!
//! ## Overview
//!
//! - **Process Backends**: native pseudo-terminal, `script` wrapper or plain
//!   pipes, picked once at startup
//! - **Sessions**: bounded output replay, detach/reattach, resize, restart
//! - **Gateway**: WebSocket endpoint speaking the [`protocol`] messages
//! - **Tools**: catalogue of supported CLIs with cached availability probing
//! - **Control Socket**: Unix socket used by the `nomacode-daemon` CLI
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     Daemon Orchestrator                      │
//! ├──────────────────────────────────────────────────────────────┤
//! │                                                              │
//! │  ┌───────────────┐   ┌───────────────┐   ┌───────────────┐   │
//! │  │    Gateway    │   │ Control (IPC) │   │ Tool Registry │   │
//! │  └───────┬───────┘   └───────┬───────┘   └───────┬───────┘   │
//! │          │                   │                   │           │
//! │  ┌───────┴───────────────────┴───────────────────┴───────┐   │
//! │  │                   Session Registry                    │   │
//! │  └───────────────────────────┬───────────────────────────┘   │
//! │                              │                               │
//! │  ┌───────────────────────────┴───────────────────────────┐   │
//! │  │         Process Backend (pty | script | pipe)         │   │
//! │  └───────────────────────────────────────────────────────┘   │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use daemon::{Config, DaemonOrchestrator};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!
//!     let mut orchestrator = DaemonOrchestrator::new(config).await?;
//!     orchestrator.start().await?;
//!
//!     // Wait for shutdown signal...
//!
//!     orchestrator.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`session`]: Process backends, sessions and the registry
//! - [`gateway`]: Viewer protocol handling over WebSocket
//! - [`tools`]: Tool catalogue and availability detection
//! - [`ipc`]: Control socket for the CLI
//! - [`logging`]: Tracing subscriber setup
//! - [`orchestrator`]: Main daemon coordinator

pub mod config;
pub mod gateway;
pub mod ipc;
pub mod logging;
pub mod orchestrator;
pub mod session;
pub mod tools;

// Re-export protocol for convenience
pub use protocol;

pub use config::{Config, ConfigError};

pub use session::{
    BackendKind, BackendPreference, Session, SessionError, SessionId, SessionRegistry,
    SessionSettings, SpawnParams,
};

pub use gateway::{GatewayConnection, GatewayServer};

pub use tools::{Availability, ToolRegistry, ToolStatus};

pub use orchestrator::{DaemonOrchestrator, OrchestratorEvent, OrchestratorState};
