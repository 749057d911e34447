//! Reconnectable stream wrapper
//!
//! [`ReconnectingStream`] presents a stable send/recv contract to the
//! multiplexer while the underlying transport connection may be replaced at
//! any time. Transport failures are surfaced as
//! [`TunnelError::ReconnectNeeded`] carrying a wait handle; however many
//! callers hit the failure, exactly one background worker runs the reconnect
//! and every waiter learns its single outcome.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use backhaul_proto::Packet;
use backhaul_transport::{PacketConnector, PacketTransport, ServerInfo};

use crate::clientset::ClientSetState;
use crate::error::{ReconnectHandle, ReconnectOutcome, TunnelError};

/// Retry budget for one reconnect, derived from the known fleet size.
///
/// With more replicas behind the load balancer, a redial is less likely to
/// land on the replica being repaired by chance, so more attempts are
/// budgeted. A count of 0 means the fleet size is unknown.
pub fn retry_limit(server_count: usize) -> usize {
    match server_count {
        1 => 3,
        2 => 10,
        3 => 15,
        4 => 20,
        // Five or more replicas, or an unknown fleet size
        _ => 24,
    }
}

#[derive(Default)]
struct ReconnectState {
    /// Whether a reconnect worker is currently running
    ongoing: bool,
    /// Callers waiting on the in-flight attempt's outcome
    waiters: Vec<oneshot::Sender<ReconnectOutcome>>,
}

/// The transport a wrapper is currently speaking through.
///
/// Replaced wholesale on reconnect. The swap never touches the old halves'
/// locks: on a half-open connection a receiver can be parked inside
/// `source.recv()` holding the recv lock indefinitely, so installing a
/// replacement must not queue behind it. Parked callers are woken through
/// `replaced` and re-fetch the current transport instead.
struct ActiveTransport {
    /// Send lock: the transport forbids concurrent senders
    sink: Mutex<Box<dyn backhaul_transport::PacketSink>>,
    /// Recv lock: likewise for receivers
    source: Mutex<Box<dyn backhaul_transport::PacketSource>>,
    /// Readiness flag shared with the transport halves
    ready: Arc<std::sync::atomic::AtomicBool>,
    /// Cancelled when this transport has been swapped out
    replaced: CancellationToken,
}

impl ActiveTransport {
    fn new(transport: PacketTransport) -> Arc<Self> {
        let PacketTransport {
            sink,
            source,
            ready,
        } = transport;

        Arc::new(Self {
            sink: Mutex::new(sink),
            source: Mutex::new(source),
            ready,
            replaced: CancellationToken::new(),
        })
    }
}

/// One stream to one proxy server replica, transparently repaired on
/// transport failure.
pub struct ReconnectingStream {
    server_id: String,
    server_count: usize,
    /// Current transport; callers clone the handle, never hold this lock
    /// across an await
    active: StdMutex<Arc<ActiveTransport>>,
    reconnect: StdMutex<ReconnectState>,
    connector: Arc<dyn PacketConnector>,
    clients: Weak<ClientSetState>,
    reconnect_interval: Duration,
    /// Cancelled exactly once, only when the reconnect budget is exhausted
    shutdown: CancellationToken,
}

impl ReconnectingStream {
    pub(crate) fn new(
        transport: PacketTransport,
        info: &ServerInfo,
        connector: Arc<dyn PacketConnector>,
        clients: Weak<ClientSetState>,
        reconnect_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            server_id: info.server_id.clone(),
            server_count: info.server_count,
            active: StdMutex::new(ActiveTransport::new(transport)),
            reconnect: StdMutex::new(ReconnectState::default()),
            connector,
            clients,
            reconnect_interval,
            shutdown: CancellationToken::new(),
        })
    }

    fn active(&self) -> Arc<ActiveTransport> {
        self.active.lock().unwrap().clone()
    }

    /// Identity of the replica this stream is (or was last) connected to
    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// Whether the current transport looks healthy
    pub fn is_ready(&self) -> bool {
        self.active().ready.load(Ordering::SeqCst)
    }

    /// Token cancelled when this stream shuts down for good
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Send one packet. A transport failure does not surface the raw error;
    /// it returns [`TunnelError::ReconnectNeeded`] with a handle the caller
    /// can block on to learn the reconnect's outcome.
    pub async fn send(self: &Arc<Self>, packet: &Packet) -> Result<(), TunnelError> {
        loop {
            let active = self.active();
            let attempt = async {
                let mut sink = active.sink.lock().await;
                sink.send(packet).await
            };

            tokio::select! {
                // Transport swapped while this send was queued on a stale
                // half; retry on the replacement.
                _ = active.replaced.cancelled() => continue,
                result = attempt => match result {
                    Ok(()) => return Ok(()),
                    Err(e) => {
                        warn!(server_id = %self.server_id, error = %e, "Send failed, triggering reconnect");
                        return Err(TunnelError::ReconnectNeeded(self.trigger_reconnect()));
                    }
                },
            }
        }
    }

    /// Receive the next packet. `Ok(None)` is an orderly EOF from the server
    /// and ends this stream's session without any reconnect.
    pub async fn recv(self: &Arc<Self>) -> Result<Option<Packet>, TunnelError> {
        loop {
            let active = self.active();
            let attempt = async {
                let mut source = active.source.lock().await;
                source.recv().await
            };

            tokio::select! {
                // A receiver parked on a half-open connection picks up the
                // replacement transport here.
                _ = active.replaced.cancelled() => continue,
                result = attempt => match result {
                    Ok(packet) => return Ok(packet),
                    Err(e) => {
                        warn!(server_id = %self.server_id, error = %e, "Recv failed, triggering reconnect");
                        return Err(TunnelError::ReconnectNeeded(self.trigger_reconnect()));
                    }
                },
            }
        }
    }

    /// Send a packet, riding out one reconnect if needed. The packet is
    /// either handed to a transport successfully or explicitly reported as
    /// undeliverable; it is never silently lost.
    pub async fn retry_send(self: &Arc<Self>, packet: Packet) -> Result<(), TunnelError> {
        match self.send(&packet).await {
            Err(TunnelError::ReconnectNeeded(handle)) => match handle.wait().await {
                ReconnectOutcome::Recovered => self.send(&packet).await,
                ReconnectOutcome::Failed => Err(TunnelError::Exhausted(self.server_id.clone())),
            },
            result => result,
        }
    }

    /// Register interest in a reconnect, starting the worker only if none is
    /// in flight. N concurrent callers produce one attempt and N
    /// notifications of its single outcome.
    pub fn trigger_reconnect(self: &Arc<Self>) -> ReconnectHandle {
        let (tx, rx) = oneshot::channel();

        let start_worker = {
            let mut state = self.reconnect.lock().unwrap();
            state.waiters.push(tx);
            if state.ongoing {
                false
            } else {
                state.ongoing = true;
                true
            }
        };

        if start_worker {
            let this = Arc::clone(self);
            tokio::spawn(async move { this.run_reconnect().await });
        }

        ReconnectHandle::new(rx)
    }

    /// Health probe loop: runs until shutdown, redialing whenever the
    /// transport is observed not ready.
    pub async fn probe_loop(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // First tick completes immediately

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if !self.is_ready() {
                        info!(server_id = %self.server_id, "Transport not ready, reconnecting");
                        let handle = self.trigger_reconnect();
                        if handle.wait().await == ReconnectOutcome::Failed {
                            warn!(server_id = %self.server_id, "Probe-initiated reconnect failed");
                        }
                    }
                }
            }
        }

        debug!(server_id = %self.server_id, "Probe loop stopped");
    }

    async fn run_reconnect(self: Arc<Self>) {
        let outcome = self.reconnect_once().await;

        let waiters = {
            let mut state = self.reconnect.lock().unwrap();
            state.ongoing = false;
            std::mem::take(&mut state.waiters)
        };

        debug!(
            server_id = %self.server_id,
            ?outcome,
            waiters = waiters.len(),
            "Reconnect resolved"
        );

        for waiter in waiters {
            let _ = waiter.send(outcome);
        }
    }

    async fn reconnect_once(&self) -> ReconnectOutcome {
        let budget = retry_limit(self.server_count);
        info!(server_id = %self.server_id, budget, "Reconnecting");

        for attempt in 1..=budget {
            sleep(self.reconnect_interval).await;

            let (transport, info) = match self.connector.connect().await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(
                        server_id = %self.server_id,
                        attempt,
                        error = %e,
                        "Reconnect attempt failed"
                    );
                    continue;
                }
            };

            if info.server_id == self.server_id {
                self.install_transport(transport);
                info!(server_id = %self.server_id, attempt, "Reconnected");
                return ReconnectOutcome::Recovered;
            }

            // The redial landed on a different replica.
            match self.clients.upgrade() {
                Some(clients) if !clients.contains(&info.server_id) => {
                    // Not the connection being repaired, but the fleet gained
                    // a usable one; adopt it and keep retrying for ours.
                    info!(
                        server_id = %self.server_id,
                        new_server = %info.server_id,
                        "Redial reached a new server, adding it to the client set"
                    );
                    if let Err(e) = clients.register(transport, &info).await {
                        warn!(new_server = %info.server_id, error = %e, "Failed to add redialed server");
                    }
                }
                Some(_) => {
                    debug!(
                        server_id = %self.server_id,
                        reached = %info.server_id,
                        "Redial reached an already-connected server, discarding"
                    );
                    close_discarded(transport).await;
                }
                None => {
                    debug!("Client set gone, discarding redialed connection");
                    close_discarded(transport).await;
                }
            }
        }

        warn!(server_id = %self.server_id, "Reconnect budget exhausted, shutting down this stream");
        if let Some(clients) = self.clients.upgrade() {
            clients.remove(&self.server_id);
        }
        self.shutdown.cancel();
        ReconnectOutcome::Failed
    }

    /// Swap the transport wholesale. Does not acquire the old halves' locks,
    /// so a caller parked on a dead half cannot block the swap; cancelling
    /// the old `replaced` token makes every such caller re-fetch.
    fn install_transport(&self, transport: PacketTransport) {
        let fresh = ActiveTransport::new(transport);
        let old = std::mem::replace(&mut *self.active.lock().unwrap(), fresh);
        old.replaced.cancel();
    }

    /// Explicitly close this stream's transport (used when registration in
    /// the client set is refused).
    pub(crate) async fn close_transport(&self) {
        let active = self.active();
        let mut sink = active.sink.lock().await;
        let _ = sink.close().await;
    }
}

/// A freshly dialed connection we cannot use must not leak its socket
async fn close_discarded(mut transport: PacketTransport) {
    let _ = transport.sink.close().await;
}
