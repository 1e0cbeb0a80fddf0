//! # Message Protocol
//!
//! A minimal, async interface for moving whole messages between two peers.
//!
//! - **Byte-Oriented**: The protocol knows nothing about frames or values.
//!   It moves opaque buffers, in order, without loss.
//! - **Duplex**: Either side may send at any time; `recv` yields the peer's
//!   messages until the pipe closes.

use std::fmt;
use std::sync::Mutex;

use tokio::sync::mpsc;

/// Errors that occur at the message pipe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The peer is gone or the pipe was closed locally.
    ConnectionLost(String),
    /// Generic I/O error or internal transport failure.
    Io(String),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionLost(msg) => write!(f, "Connection lost: {}", msg),
            Self::Io(msg) => write!(f, "I/O error: {}", msg),
        }
    }
}

impl std::error::Error for ProtocolError {}

pub type Result<T> = std::result::Result<T, ProtocolError>;

/// A duplex pipe of whole messages.
///
/// Object-safe, so a connection can own it as `Arc<dyn Protocol>`.
#[async_trait::async_trait]
pub trait Protocol: Send + Sync + 'static {
    /// Sends one message to the peer.
    async fn send(&self, payload: &[u8]) -> Result<()>;

    /// Waits for the next message from the peer.
    ///
    /// Returns `Ok(None)` once the pipe is closed. Only one task reads at a time.
    async fn recv(&self) -> Result<Option<Vec<u8>>>;

    /// Closes the sending half; the peer's `recv` then yields `None`.
    fn close(&self) {}
}

/// An in-process protocol over a pair of tokio channels.
///
/// Messages sent on one end appear on the other end's `recv`, and vice versa.
pub struct MemoryProtocol {
    tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

impl MemoryProtocol {
    /// Creates two protocols connected to each other.
    pub fn pair() -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();

        let a = Self {
            tx: Mutex::new(Some(tx_a)),
            rx: tokio::sync::Mutex::new(rx_b),
        };
        let b = Self {
            tx: Mutex::new(Some(tx_b)),
            rx: tokio::sync::Mutex::new(rx_a),
        };
        (a, b)
    }

    fn sender(&self) -> Option<mpsc::UnboundedSender<Vec<u8>>> {
        self.tx.lock().ok().and_then(|tx| tx.clone())
    }
}

#[async_trait::async_trait]
impl Protocol for MemoryProtocol {
    async fn send(&self, payload: &[u8]) -> Result<()> {
        let Some(tx) = self.sender() else {
            return Err(ProtocolError::ConnectionLost("Protocol closed".into()));
        };
        tx.send(payload.to_vec())
            .map_err(|_| ProtocolError::ConnectionLost("Peer dropped".into()))
    }

    async fn recv(&self) -> Result<Option<Vec<u8>>> {
        let mut rx = self.rx.lock().await;
        Ok(rx.recv().await)
    }

    fn close(&self) {
        if let Ok(mut tx) = self.tx.lock() {
            tx.take();
        }
    }
}
