//! A live transport session bound to one peer node
//!
//! All outbound frames for a connection funnel through one mpsc channel and
//! are drained by a single writer task, so frames are never interleaved
//! mid-write. The transport driver (WebSocket or an in-memory test pump)
//! owns the receiving end.

use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;
use tokio::sync::{mpsc, Notify};

use crate::frame::{EncodeError, Frame};
use crate::types::{NodeId, WireFormat};

/// An encoded frame ready for the wire
#[derive(Debug, Clone, PartialEq)]
pub enum WirePayload {
    Text(String),
    Binary(Vec<u8>),
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("connection closed")]
    Closed,

    #[error("encode error: {0}")]
    Encode(#[from] EncodeError),
}

/// One transport session. Held in the [`ConnectionRegistry`] under the peer
/// node id; a reconnect for the same peer supersedes and closes the old one.
///
/// [`ConnectionRegistry`]: crate::registry::ConnectionRegistry
pub struct Connection {
    peer: NodeId,
    seq: u64,
    format: WireFormat,
    outbound: mpsc::Sender<WirePayload>,
    closed: AtomicBool,
    close_signal: Notify,
}

impl Connection {
    pub(crate) fn new(
        peer: NodeId,
        seq: u64,
        format: WireFormat,
        outbound: mpsc::Sender<WirePayload>,
    ) -> Self {
        Self {
            peer,
            seq,
            format,
            outbound,
            closed: AtomicBool::new(false),
            close_signal: Notify::new(),
        }
    }

    /// Node id of the peer on the other end
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Registry-global sequence number; identifies this session uniquely,
    /// including across reconnects of the same peer
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn format(&self) -> WireFormat {
        self.format
    }

    /// Encode a frame for this connection's negotiated format and queue it
    /// for the writer task.
    pub async fn write(&self, frame: &Frame) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }
        let wire = match self.format {
            WireFormat::Json => WirePayload::Text(frame.to_json_string()?),
            WireFormat::Binary => WirePayload::Binary(frame.to_binary_bytes()?),
        };
        self.outbound
            .send(wire)
            .await
            .map_err(|_| ConnectionError::Closed)
    }

    /// Mark the session closed and wake anything waiting on [`closed`].
    ///
    /// [`closed`]: Connection::closed
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.close_signal.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Resolves once the session is closed (shutdown or supersession)
    pub async fn closed(&self) {
        loop {
            let notified = self.close_signal.notified();
            if self.is_closed() {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer)
            .field("seq", &self.seq)
            .field("format", &self.format)
            .field("closed", &self.is_closed())
            .finish()
    }
}
