//! Request dispatch for the control socket.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::messages::{IpcRequest, IpcResponse};
use crate::session::{KillSignal, SessionError, SessionRegistry, SpawnParams};

/// Answers control requests against the live session registry.
pub struct ControlHandler {
    registry: Arc<SessionRegistry>,
    started: Instant,
    connections: Arc<AtomicUsize>,
    gateway_addr: SocketAddr,
    /// Cancelled when a client asks the daemon to stop.
    stop_requested: CancellationToken,
}

impl ControlHandler {
    pub fn new(
        registry: Arc<SessionRegistry>,
        connections: Arc<AtomicUsize>,
        gateway_addr: SocketAddr,
        stop_requested: CancellationToken,
    ) -> Self {
        Self {
            registry,
            started: Instant::now(),
            connections,
            gateway_addr,
            stop_requested,
        }
    }

    /// Executes one request. Failures become [`IpcResponse::Error`].
    pub async fn handle(&self, request: IpcRequest) -> IpcResponse {
        match request {
            IpcRequest::Ping => IpcResponse::Pong,
            IpcRequest::Status => IpcResponse::Status {
                running: !self.stop_requested.is_cancelled(),
                uptime_secs: self.started.elapsed().as_secs(),
                session_count: self.registry.count(),
                running_sessions: self.registry.running_count(),
                connection_count: self.connections.load(Ordering::SeqCst),
                backend: self.registry.backend_kind(),
                gateway_addr: self.gateway_addr.to_string(),
            },
            IpcRequest::Stop => {
                tracing::info!("Stop requested over control socket");
                self.stop_requested.cancel();
                IpcResponse::Stopping
            }
            IpcRequest::ListSessions => IpcResponse::Sessions {
                sessions: self.registry.list(),
            },
            IpcRequest::GetSession { session_id } => self
                .registry
                .require(&session_id)
                .map(|session| IpcResponse::Session {
                    session: session.summary(),
                })
                .unwrap_or_else(error_response),
            IpcRequest::CreateSession {
                working_directory,
                tool,
                cols,
                rows,
            } => {
                let params = SpawnParams {
                    working_directory,
                    tool,
                    cols,
                    rows,
                    env: Vec::new(),
                };
                self.registry
                    .create(Uuid::new_v4().to_string(), params)
                    .map(|session| IpcResponse::Session {
                        session: session.summary(),
                    })
                    .unwrap_or_else(error_response)
            }
            IpcRequest::KillSession { session_id, force } => {
                let signal = if force {
                    KillSignal::Force
                } else {
                    KillSignal::Terminate
                };
                self.registry
                    .kill(&session_id, signal)
                    .map(|()| IpcResponse::SessionKilled { session_id })
                    .unwrap_or_else(error_response)
            }
            IpcRequest::CloseSession { session_id } => match self.registry.delete(&session_id) {
                Some(_) => IpcResponse::SessionClosed { session_id },
                None => error_response(SessionError::NotFound(session_id)),
            },
            IpcRequest::RestartSession { session_id } => self
                .registry
                .restart(&session_id)
                .map(|session| IpcResponse::Session {
                    session: session.summary(),
                })
                .unwrap_or_else(error_response),
            IpcRequest::ListTools => IpcResponse::Tools {
                tools: self.registry.tools().detect().await,
            },
        }
    }
}

fn error_response(error: SessionError) -> IpcResponse {
    IpcResponse::Error {
        message: error.to_string(),
    }
}
