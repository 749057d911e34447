//! Connection multiplexer
//!
//! Translates between the packet protocol and real local TCP sockets: one
//! [`PacketMux`] serves one stream wrapper, owning the ConnID map and the
//! pair of per-connection tasks (socket reader, queue drainer) for every
//! live logical connection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use backhaul_proto::Packet;

use crate::error::{ReconnectOutcome, TunnelError};
use crate::stream::ReconnectingStream;

/// Inbound queue depth per logical connection. A full queue blocks the
/// dispatch loop, which is the backpressure path toward the proxy.
const CONN_QUEUE_CAPACITY: usize = 5;

/// Read chunk size for local sockets
const DATA_CHUNK_SIZE: usize = 4096;

/// Close error reported for a ConnID with no context
const UNKNOWN_CONN_ID: &str = "Unknown connectID";

/// One live logical connection
struct ConnContext {
    /// Bounded inbound byte-chunk queue, drained by the connection's drainer
    data_tx: mpsc::Sender<Vec<u8>>,
    /// Stops the socket reader
    cancel: CancellationToken,
}

/// Multiplexes logical TCP connections over one reconnectable stream.
pub struct PacketMux {
    stream: Arc<ReconnectingStream>,
    conns: RwLock<HashMap<i64, ConnContext>>,
    next_conn_id: AtomicI64,
}

impl PacketMux {
    pub fn new(stream: Arc<ReconnectingStream>) -> Self {
        Self {
            stream,
            conns: RwLock::new(HashMap::new()),
            next_conn_id: AtomicI64::new(0),
        }
    }

    /// Number of live logical connections
    pub async fn active_connections(&self) -> usize {
        self.conns.read().await.len()
    }

    /// Dispatch loop: runs until the stream's shutdown signal fires, the
    /// server closes the stream (EOF), or a reconnect fails terminally.
    pub async fn serve(self: Arc<Self>) {
        let shutdown = self.stream.shutdown_token();
        info!(server_id = %self.stream.server_id(), "Serving");

        loop {
            let received = tokio::select! {
                _ = shutdown.cancelled() => break,
                r = self.stream.recv() => r,
            };

            match received {
                Ok(Some(packet)) => self.dispatch(packet).await,
                Ok(None) => {
                    info!(server_id = %self.stream.server_id(), "Stream closed by server");
                    break;
                }
                Err(TunnelError::ReconnectNeeded(handle)) => {
                    match handle.wait().await {
                        ReconnectOutcome::Recovered => continue,
                        ReconnectOutcome::Failed => {
                            warn!(
                                server_id = %self.stream.server_id(),
                                "Reconnect failed, stopping serve loop"
                            );
                            break;
                        }
                    }
                }
                Err(e) => {
                    error!(server_id = %self.stream.server_id(), error = %e, "Recv failed");
                    break;
                }
            }
        }

        self.shutdown_conns().await;
        info!(server_id = %self.stream.server_id(), "Serve loop stopped");
    }

    async fn dispatch(self: &Arc<Self>, packet: Packet) {
        match packet {
            Packet::DialRequest {
                protocol,
                address,
                random,
            } => self.handle_dial(protocol, address, random).await,
            Packet::Data { conn_id, data } => self.handle_data(conn_id, data).await,
            Packet::CloseRequest { conn_id } => self.handle_close(conn_id).await,
            other => {
                warn!(packet = ?other, "Unexpected packet from server");
            }
        }
    }

    async fn handle_dial(self: &Arc<Self>, protocol: String, address: String, random: i64) {
        if protocol != "tcp" {
            let _ = self
                .stream
                .retry_send(Packet::DialResponse {
                    conn_id: 0,
                    random,
                    error: format!("unsupported protocol: {}", protocol),
                })
                .await;
            return;
        }

        let socket = match TcpStream::connect(&address).await {
            Ok(socket) => socket,
            Err(e) => {
                warn!(address = %address, error = %e, "Local dial failed");
                let _ = self
                    .stream
                    .retry_send(Packet::DialResponse {
                        conn_id: 0,
                        random,
                        error: e.to_string(),
                    })
                    .await;
                return;
            }
        };

        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (data_tx, data_rx) = mpsc::channel(CONN_QUEUE_CAPACITY);
        let cancel = CancellationToken::new();

        self.conns.write().await.insert(
            conn_id,
            ConnContext {
                data_tx,
                cancel: cancel.clone(),
            },
        );
        debug!(conn_id, address = %address, "Dial succeeded");

        if self
            .stream
            .retry_send(Packet::DialResponse {
                conn_id,
                random,
                error: String::new(),
            })
            .await
            .is_err()
        {
            // The proxy never learns this ConnID; don't keep the socket
            error!(conn_id, "Failed to send dial response, dropping connection");
            self.conns.write().await.remove(&conn_id);
            return;
        }

        let (read_half, write_half) = socket.into_split();
        tokio::spawn(Arc::clone(self).run_socket_reader(conn_id, read_half, cancel));
        tokio::spawn(Arc::clone(self).run_queue_drainer(conn_id, write_half, data_rx));
    }

    async fn handle_data(&self, conn_id: i64, data: Vec<u8>) {
        let data_tx = {
            let conns = self.conns.read().await;
            conns.get(&conn_id).map(|ctx| ctx.data_tx.clone())
        };

        match data_tx {
            Some(tx) => {
                // Blocks when the queue is full until the drainer catches up
                if tx.send(data).await.is_err() {
                    debug!(conn_id, "Connection tearing down, dropping data");
                }
            }
            None => {
                // Already torn down on this side
                trace!(conn_id, "Data for unknown connection, dropping");
            }
        }
    }

    async fn handle_close(&self, conn_id: i64) {
        if !self.teardown(conn_id).await {
            debug!(conn_id, "Close request for unknown connection");
            let _ = self
                .stream
                .retry_send(Packet::CloseResponse {
                    conn_id,
                    error: UNKNOWN_CONN_ID.to_string(),
                })
                .await;
        }
    }

    /// Idempotent cleanup for one logical connection. Removal from the map
    /// is the run-once guard: whichever of the reader, the drainer, or a
    /// CloseRequest gets there first sends the single CloseResponse; later
    /// callers see no entry and do nothing.
    async fn teardown(&self, conn_id: i64) -> bool {
        let removed = self.conns.write().await.remove(&conn_id);
        match removed {
            Some(ctx) => {
                ctx.cancel.cancel();
                // Dropping ctx closes the inbound queue, which stops the
                // drainer and shuts the socket's write half down.
                drop(ctx);
                debug!(conn_id, "Connection closed");
                let _ = self
                    .stream
                    .retry_send(Packet::CloseResponse {
                        conn_id,
                        error: String::new(),
                    })
                    .await;
                true
            }
            None => false,
        }
    }

    /// Read the local socket in fixed-size chunks and forward each chunk
    /// upstream as a Data packet, until read error/EOF or cancellation.
    async fn run_socket_reader(
        self: Arc<Self>,
        conn_id: i64,
        mut read_half: OwnedReadHalf,
        cancel: CancellationToken,
    ) {
        let mut buf = vec![0u8; DATA_CHUNK_SIZE];

        loop {
            let n = tokio::select! {
                _ = cancel.cancelled() => break,
                r = read_half.read(&mut buf) => match r {
                    Ok(0) => {
                        debug!(conn_id, "Local socket EOF");
                        break;
                    }
                    Ok(n) => n,
                    Err(e) => {
                        debug!(conn_id, error = %e, "Local read failed");
                        break;
                    }
                },
            };

            let packet = Packet::Data {
                conn_id,
                data: buf[..n].to_vec(),
            };
            if let Err(e) = self.stream.retry_send(packet).await {
                warn!(conn_id, error = %e, "Failed to forward data upstream");
                break;
            }
        }

        self.teardown(conn_id).await;
    }

    /// Drain the inbound queue, writing each chunk fully to the local
    /// socket, until the queue closes or a write fails.
    async fn run_queue_drainer(
        self: Arc<Self>,
        conn_id: i64,
        mut write_half: OwnedWriteHalf,
        mut data_rx: mpsc::Receiver<Vec<u8>>,
    ) {
        while let Some(chunk) = data_rx.recv().await {
            // write_all retries partial writes
            if let Err(e) = write_half.write_all(&chunk).await {
                debug!(conn_id, error = %e, "Local write failed");
                break;
            }
        }

        let _ = write_half.shutdown().await;
        self.teardown(conn_id).await;
    }

    async fn shutdown_conns(&self) {
        let mut conns = self.conns.write().await;
        for (_, ctx) in conns.drain() {
            ctx.cancel.cancel();
        }
    }
}
