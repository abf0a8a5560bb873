//! Output delivery target for an attached viewer.
//!
//! A sink is the sending half of one gateway connection's outbound queue.
//! The queue is bounded and never awaited: a viewer that stops reading fills
//! it, and the session then drops the sink with a final `detached` notice.
//! The viewer catches up by attaching again and receiving the replay buffer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use protocol::ServerMessage;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Unique identifier for a gateway connection.
pub type ConnectionId = String;

/// Messages a viewer may have pending before it counts as stalled.
pub const DEFAULT_SINK_CAPACITY: usize = 1024;

/// What happened to a queued message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The message is in the connection's queue.
    Queued,
    /// The viewer is not keeping up; the message was dropped.
    Full,
    /// The connection has gone away.
    Closed,
}

/// A handle that delivers server messages to one connection.
///
/// Clones share the same queue and counters.
#[derive(Debug, Clone)]
pub struct Sink {
    /// Connection this sink delivers to.
    connection: ConnectionId,
    /// Sender for the connection's outbound queue.
    tx: mpsc::Sender<ServerMessage>,
    /// Messages accepted by the queue.
    sent: Arc<AtomicU64>,
}

impl Sink {
    /// Creates a sink and the receiver the connection drains.
    pub fn new(connection: ConnectionId) -> (Self, mpsc::Receiver<ServerMessage>) {
        Self::with_capacity(connection, DEFAULT_SINK_CAPACITY)
    }

    /// Creates a sink whose queue holds at most `capacity` messages.
    pub fn with_capacity(
        connection: ConnectionId,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<ServerMessage>) {
        // one slot stays reserved for `send_final`
        let (tx, rx) = mpsc::channel(capacity.max(2));
        let sink = Sink {
            connection,
            tx,
            sent: Arc::new(AtomicU64::new(0)),
        };
        (sink, rx)
    }

    /// Returns the connection ID.
    pub fn connection(&self) -> &ConnectionId {
        &self.connection
    }

    /// Queues a message for the connection without waiting.
    ///
    /// The last free slot is left for [`Sink::send_final`]; when only that
    /// slot remains the message is refused with [`Delivery::Full`].
    pub fn send(&self, message: ServerMessage) -> Delivery {
        if self.tx.is_closed() {
            return Delivery::Closed;
        }
        if self.tx.capacity() <= 1 {
            return Delivery::Full;
        }
        self.push(message)
    }

    /// Queues the last message this sink will carry for a session, using
    /// the reserved slot if needed.
    pub fn send_final(&self, message: ServerMessage) -> Delivery {
        self.push(message)
    }

    fn push(&self, message: ServerMessage) -> Delivery {
        match self.tx.try_send(message) {
            Ok(()) => {
                self.sent.fetch_add(1, Ordering::Relaxed);
                Delivery::Queued
            }
            Err(TrySendError::Full(_)) => Delivery::Full,
            Err(TrySendError::Closed(_)) => {
                tracing::debug!(connection = %self.connection, "Sink channel closed");
                Delivery::Closed
            }
        }
    }

    /// Checks if the connection has stopped receiving.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Total messages queued through this sink and its clones.
    pub fn messages_sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }
}
