//! WebSocket transport for the gateway.
//!
//! Each accepted TCP connection is upgraded to a WebSocket and served by its
//! own task. Text frames carry JSON, binary frames carry MessagePack; replies
//! use the encoding of the most recent inbound frame.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use protocol::{codec, ClientMessage, ServerMessage, TextEncoder};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;

use super::connection::GatewayConnection;
use crate::session::SessionRegistry;

/// Accepts viewer connections.
pub struct GatewayServer {
    listener: TcpListener,
    registry: Arc<SessionRegistry>,
    active: Arc<AtomicUsize>,
}

impl GatewayServer {
    /// Binds the listening socket.
    pub async fn bind(addr: SocketAddr, registry: Arc<SessionRegistry>) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind gateway to {}", addr))?;
        Ok(Self {
            listener,
            registry,
            active: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// The address actually bound, useful with port 0.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("failed to read gateway address")
    }

    /// Shared counter of open viewer connections.
    pub fn active_connections(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.active)
    }

    /// Accepts connections until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) {
        if let Ok(addr) = self.listener.local_addr() {
            tracing::info!(addr = %addr, "Gateway listening");
        }

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let registry = Arc::clone(&self.registry);
                            let active = Arc::clone(&self.active);
                            let shutdown = shutdown.clone();
                            tokio::spawn(async move {
                                active.fetch_add(1, Ordering::SeqCst);
                                if let Err(e) = serve_connection(stream, peer, registry, shutdown).await {
                                    tracing::debug!(peer = %peer, error = %e, "Viewer connection ended with error");
                                }
                                active.fetch_sub(1, Ordering::SeqCst);
                            });
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Failed to accept viewer connection");
                        }
                    }
                }
                _ = shutdown.cancelled() => {
                    tracing::info!("Gateway stopped accepting connections");
                    break;
                }
            }
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    registry: Arc<SessionRegistry>,
    shutdown: CancellationToken,
) -> Result<()> {
    let ws = tokio_tungstenite::accept_async(stream)
        .await
        .context("WebSocket handshake failed")?;
    let (mut ws_tx, mut ws_rx) = ws.split();

    let (mut connection, mut outbound) = GatewayConnection::new(registry);
    let mut encoder = TextEncoder::new();
    let mut binary = false;

    tracing::info!(peer = %peer, connection = %connection.id(), "Viewer connected");

    let result = loop {
        tokio::select! {
            frame = ws_rx.next() => {
                let decoded = match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        binary = false;
                        codec::decode_text(&text)
                    }
                    Some(Ok(WsMessage::Binary(bytes))) => {
                        binary = true;
                        codec::decode_binary(&bytes)
                    }
                    // pongs to pings are queued by tungstenite itself
                    Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_))) => continue,
                    Some(Ok(WsMessage::Close(_))) | None => break Ok(()),
                    Some(Err(e)) => break Err(anyhow::Error::new(e).context("WebSocket read failed")),
                };
                match decoded {
                    Ok(message) => {
                        if matches!(message, ClientMessage::Attach { .. }) {
                            encoder.reset();
                        }
                        connection.handle(message);
                    }
                    Err(e) => connection.handle_decode_error(&e),
                }
            }
            Some(message) = outbound.recv() => {
                let Some(frame) = encode(&mut encoder, message, binary)? else {
                    continue;
                };
                if let Err(e) = ws_tx.send(frame).await {
                    break Err(anyhow::Error::new(e).context("WebSocket write failed"));
                }
            }
            _ = shutdown.cancelled() => {
                let _ = ws_tx.send(WsMessage::Close(None)).await;
                break Ok(());
            }
        }
    };

    connection.close();
    tracing::info!(peer = %peer, connection = %connection.id(), "Viewer disconnected");
    result
}

fn encode(
    encoder: &mut TextEncoder,
    message: ServerMessage,
    binary: bool,
) -> Result<Option<WsMessage>> {
    if binary {
        let bytes = codec::encode_binary(&message).context("failed to encode binary frame")?;
        Ok(Some(WsMessage::Binary(bytes)))
    } else {
        let text = encoder
            .encode(message)
            .context("failed to encode text frame")?;
        Ok(text.map(WsMessage::Text))
    }
}
