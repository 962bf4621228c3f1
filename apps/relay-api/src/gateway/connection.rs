//! Handle to a single live subscriber connection.
//!
//! The socket itself is owned by the per-connection task in `server.rs`. Every
//! other component talks to it through a `ConnectionHandle`, which pushes
//! frames onto a bounded queue that the socket's writer task drains.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Identity of a connection. Registry set membership is keyed by this.
pub type ConnectionId = String;

/// Capacity of each connection's outbound queue. A subscriber that falls this
/// far behind starts losing frames.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// A frame waiting to be written to the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Close { code: u16, reason: &'static str },
}

pub struct ConnectionHandle {
    id: ConnectionId,
    tx: mpsc::Sender<Outbound>,
    open: AtomicBool,
}

impl ConnectionHandle {
    pub fn new(id: ConnectionId, tx: mpsc::Sender<Outbound>) -> Arc<Self> {
        Arc::new(Self {
            id,
            tx,
            open: AtomicBool::new(true),
        })
    }

    /// Create a handle together with the receiving end of its outbound queue.
    pub fn channel(id: impl Into<ConnectionId>) -> (Arc<Self>, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        (Self::new(id.into(), tx), rx)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// True until the connection is marked closed or its writer goes away.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire) && !self.tx.is_closed()
    }

    pub fn mark_closed(&self) {
        self.open.store(false, Ordering::Release);
    }

    /// Queue a text frame. Never blocks and never fails loudly: a frame that
    /// cannot be queued is logged and dropped. Returns whether it was queued.
    pub fn send_text(&self, text: String) -> bool {
        if !self.is_open() {
            tracing::debug!(connection_id = %self.id, "dropping frame for closed connection");
            return false;
        }

        match self.tx.try_send(Outbound::Text(text)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::warn!(
                    connection_id = %self.id,
                    capacity = OUTBOUND_QUEUE_CAPACITY,
                    "outbound queue full, dropping frame"
                );
                false
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!(connection_id = %self.id, "peer gone, dropping frame");
                self.mark_closed();
                false
            }
        }
    }

    /// Ask the writer to send a close frame, then mark the handle closed.
    pub fn close(&self, code: u16, reason: &'static str) {
        if self.open.swap(false, Ordering::AcqRel) {
            let _ = self.tx.try_send(Outbound::Close { code, reason });
        }
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("open", &self.is_open())
            .finish()
    }
}
