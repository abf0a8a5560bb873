//! Daemon orchestrator for wiring together all components.
//!
//! This module provides the `DaemonOrchestrator` that initializes and coordinates
//! the daemon subsystems: the session registry with its process backend, the
//! viewer gateway and the control socket.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::gateway::GatewayServer;
use crate::ipc::{ControlHandler, IpcServer};
use crate::session::{detect_backend, ProcessBackend, SessionRegistry};
use crate::tools::ToolRegistry;

/// Daemon orchestrator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    /// Initial state, not started.
    Stopped,
    /// Starting up, binding listeners.
    Starting,
    /// Running and accepting connections.
    Running,
    /// Shutting down gracefully.
    ShuttingDown,
}

/// Events emitted by the orchestrator.
#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    /// Orchestrator state changed.
    StateChanged(OrchestratorState),
    /// Sessions were terminated during shutdown.
    SessionsTerminated {
        /// False if some sessions had to be force-killed.
        graceful: bool,
    },
}

/// Daemon orchestrator that manages all subsystems.
pub struct DaemonOrchestrator {
    config: Config,
    state: Arc<RwLock<OrchestratorState>>,
    registry: Arc<SessionRegistry>,
    /// Where to bind the control socket, if anywhere.
    control_socket: Option<PathBuf>,
    gateway_addr: Option<SocketAddr>,
    connections: Arc<AtomicUsize>,
    /// Cancelled to stop the listeners.
    shutdown_token: CancellationToken,
    /// Cancelled when a control client asks the daemon to stop.
    stop_requested: CancellationToken,
    event_tx: broadcast::Sender<OrchestratorEvent>,
}

impl DaemonOrchestrator {
    /// Creates an orchestrator, probing for the best process backend
    /// allowed by the configuration.
    pub async fn new(config: Config) -> Result<Self> {
        let kind = detect_backend(config.session.backend).await;
        Ok(Self::with_backend(config, kind.create()))
    }

    /// Creates an orchestrator that spawns through `backend`.
    pub fn with_backend(config: Config, backend: Arc<dyn ProcessBackend>) -> Self {
        let tools = Arc::new(ToolRegistry::new(
            config.session.default_shell.clone(),
            config.tools.cache_ttl(),
        ));
        let registry = Arc::new(SessionRegistry::new(
            backend,
            tools,
            config.session.settings(),
        ));

        let (event_tx, _) = broadcast::channel(64);

        Self {
            config,
            state: Arc::new(RwLock::new(OrchestratorState::Stopped)),
            registry,
            control_socket: None,
            gateway_addr: None,
            connections: Arc::new(AtomicUsize::new(0)),
            shutdown_token: CancellationToken::new(),
            stop_requested: CancellationToken::new(),
            event_tx,
        }
    }

    /// Serve the control socket at `path` once started.
    pub fn with_control_socket(mut self, path: impl Into<PathBuf>) -> Self {
        self.control_socket = Some(path.into());
        self
    }

    /// Returns the current state.
    pub async fn state(&self) -> OrchestratorState {
        *self.state.read().await
    }

    /// Returns a receiver for orchestrator events.
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.event_tx.subscribe()
    }

    /// Starts the gateway and, if configured, the control socket.
    pub async fn start(&mut self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state != OrchestratorState::Stopped {
                anyhow::bail!("Orchestrator is already running");
            }
            if self.shutdown_token.is_cancelled() {
                anyhow::bail!("Orchestrator cannot be restarted after stop");
            }
            *state = OrchestratorState::Starting;
        }
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Starting));

        info!(backend = %self.registry.backend_kind(), "Starting daemon orchestrator...");

        if let Err(e) = self.spawn_listeners().await {
            *self.state.write().await = OrchestratorState::Stopped;
            self.shutdown_token.cancel();
            self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Stopped));
            return Err(e);
        }

        *self.state.write().await = OrchestratorState::Running;
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Running));

        info!("Daemon orchestrator started successfully");
        Ok(())
    }

    async fn spawn_listeners(&mut self) -> Result<()> {
        let gateway =
            GatewayServer::bind(self.config.gateway.socket_addr(), Arc::clone(&self.registry))
                .await?;
        let gateway_addr = gateway.local_addr()?;
        self.connections = gateway.active_connections();
        self.gateway_addr = Some(gateway_addr);

        let control = match &self.control_socket {
            Some(path) => Some(IpcServer::bind(path).await.with_context(|| {
                format!("Failed to bind control socket: {}", path.display())
            })?),
            None => None,
        };

        tokio::spawn(gateway.run(self.shutdown_token.child_token()));

        if let Some(control) = control {
            let handler = Arc::new(ControlHandler::new(
                Arc::clone(&self.registry),
                Arc::clone(&self.connections),
                gateway_addr,
                self.stop_requested.clone(),
            ));
            tokio::spawn(control.run(handler, self.shutdown_token.child_token()));
        }

        Ok(())
    }

    /// Stops the daemon orchestrator gracefully.
    ///
    /// Listeners close first, then every session gets the configured grace
    /// period to exit before it is killed.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state == OrchestratorState::Stopped {
                return Ok(());
            }
            if *state == OrchestratorState::ShuttingDown {
                anyhow::bail!("Orchestrator is already shutting down");
            }
            *state = OrchestratorState::ShuttingDown;
        }
        self.emit_event(OrchestratorEvent::StateChanged(
            OrchestratorState::ShuttingDown,
        ));

        info!("Stopping daemon orchestrator...");

        self.shutdown_token.cancel();

        let graceful = self
            .registry
            .shutdown(self.config.shutdown.grace_period())
            .await;
        if !graceful {
            warn!("Some sessions were killed after the grace period");
        }
        self.emit_event(OrchestratorEvent::SessionsTerminated { graceful });

        *self.state.write().await = OrchestratorState::Stopped;
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Stopped));

        info!("Daemon orchestrator stopped");
        Ok(())
    }

    fn emit_event(&self, event: OrchestratorEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Returns the session registry.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// The bound gateway address, once started.
    pub fn gateway_addr(&self) -> Option<SocketAddr> {
        self.gateway_addr
    }

    /// Returns the number of open viewer connections.
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Cancelled when a control client sends `Stop`.
    pub fn stop_requested(&self) -> CancellationToken {
        self.stop_requested.clone()
    }

    /// Returns the shutdown token for external tasks to observe shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }
}
