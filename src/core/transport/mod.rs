//! Byte-channel transports
//!
//! The protocol engine only needs a duplex byte channel: a way to write
//! request bytes, a stream of received bytes, and open/close/error signals.
//! [`serial`] provides the real UART link; [`emulator`] provides a
//! deterministic in-process TinyBMS for tests and demos.

pub mod emulator;
pub mod serial;

pub use emulator::EmulatorLink;
pub use serial::SerialLink;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::broadcast;

/// Transport error types
#[derive(Error, Debug)]
pub enum TransportError {
    /// Opening the channel failed
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Named port does not exist
    #[error("port not found: {0}")]
    PortNotFound(String),

    /// Insufficient permissions on the port
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Operation attempted on a closed channel
    #[error("not connected")]
    NotConnected,

    /// Peer or OS closed the channel
    #[error("disconnected")]
    Disconnected,

    /// Underlying I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Signals emitted by a transport
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Bytes arrived on the channel
    Data(Bytes),
    /// Channel was closed (locally or by the peer)
    Closed,
    /// Channel failed; a `Closed` event follows
    Error(String),
}

/// Byte-level transport statistics
#[derive(Debug, Clone, Copy, Default)]
pub struct TransportStats {
    /// Bytes written to the channel
    pub bytes_sent: u64,
    /// Bytes received from the channel
    pub bytes_received: u64,
    /// Write calls completed
    pub writes: u64,
    /// Read events delivered
    pub reads: u64,
}

/// Duplex byte channel used by the protocol engine
///
/// Received bytes and open/close/error signals are delivered through the
/// broadcast channel returned by [`subscribe`](BmsTransport::subscribe);
/// sending is an explicit async call. The engine owns the transport
/// exclusively — nothing else may write to it.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BmsTransport: Send + Sync {
    /// Open the channel
    async fn open(&mut self) -> Result<(), TransportError>;

    /// Close the channel; outstanding subscribers observe `Closed`
    async fn close(&mut self) -> Result<(), TransportError>;

    /// Whether the channel is currently open
    fn is_open(&self) -> bool;

    /// Write bytes; resolves when the transport has accepted them
    async fn send(&mut self, data: &[u8]) -> Result<usize, TransportError>;

    /// Subscribe to received bytes and lifecycle signals
    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;

    /// Byte-level counters
    fn stats(&self) -> TransportStats;

    /// Human-readable channel description
    fn connection_info(&self) -> String;
}
