//! Transport abstraction for the backhaul tunnel
//!
//! The tunnel core speaks to a proxy server through a pair of object-safe
//! halves (a packet sink and a packet source) so that sending and receiving
//! can be locked independently, and so the reconnect machinery can swap both
//! halves in place without callers noticing.
//!
//! A transport connection is opened by a [`PacketConnector`], which performs
//! the handshake (agent identity plus optional bearer token) and returns the
//! server's replica identity and believed fleet size alongside the transport.

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use thiserror::Error;

use backhaul_proto::{CodecError, Packet};

pub mod tcp;

pub use tcp::TcpConnector;

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Failed to read token file {path}: {source}")]
    Credential {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Connection closed")]
    Closed,
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Handshake metadata reported by the server when a connection is accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    /// Opaque identity of the replica this connection reached
    pub server_id: String,
    /// Fleet size as believed by that replica (0 = unknown)
    pub server_count: usize,
}

/// Sending half of a transport connection.
///
/// Implementations are not required to tolerate concurrent callers; the
/// tunnel core serializes access with its own send lock.
#[async_trait]
pub trait PacketSink: Send {
    /// Send one packet
    async fn send(&mut self, packet: &Packet) -> TransportResult<()>;

    /// Close the sending side. Safe to call more than once.
    async fn close(&mut self) -> TransportResult<()>;
}

/// Receiving half of a transport connection.
#[async_trait]
pub trait PacketSource: Send {
    /// Receive the next packet
    ///
    /// Returns `Ok(None)` when the remote peer closed the stream gracefully.
    async fn recv(&mut self) -> TransportResult<Option<Packet>>;
}

/// One transport connection, ready to carry packets.
///
/// The `ready` flag is owned by the implementation and flipped to false when
/// either direction observes an error or EOF; health probes read it without
/// touching the halves.
pub struct PacketTransport {
    pub sink: Box<dyn PacketSink>,
    pub source: Box<dyn PacketSource>,
    pub ready: Arc<AtomicBool>,
}

impl PacketTransport {
    pub fn new(
        sink: Box<dyn PacketSink>,
        source: Box<dyn PacketSource>,
        ready: Arc<AtomicBool>,
    ) -> Self {
        Self {
            sink,
            source,
            ready,
        }
    }
}

impl std::fmt::Debug for PacketTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketTransport")
            .field("ready", &self.ready)
            .finish_non_exhaustive()
    }
}

/// Establishes outgoing transport connections to the proxy server fleet.
///
/// Each call dials afresh and performs the handshake; which replica answers
/// is up to whatever load balancing sits in front of the fleet.
#[async_trait]
pub trait PacketConnector: Send + Sync {
    async fn connect(&self) -> TransportResult<(PacketTransport, ServerInfo)>;
}
