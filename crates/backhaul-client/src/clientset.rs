//! Client set
//!
//! Keeps one [`TunnelClient`] per known proxy-server replica. A periodic
//! sync loop redials until every replica the fleet reports is covered;
//! each client repairs its own stream independently.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use backhaul_transport::{PacketConnector, PacketTransport, ServerInfo};

use crate::backoff::{Backoff, BackoffConfig};
use crate::error::TunnelError;
use crate::mux::PacketMux;
use crate::stream::ReconnectingStream;

/// Timing knobs for the client set and the streams it owns.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Pause between sync dials when the fleet is fully covered
    pub sync_interval: Duration,
    /// Pause between transport health probes
    pub probe_interval: Duration,
    /// Pause between reconnect attempts of a broken stream
    pub reconnect_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            sync_interval: Duration::from_secs(5),
            probe_interval: Duration::from_secs(5),
            reconnect_interval: Duration::from_secs(5),
        }
    }
}

/// Shared interior of the client set. Streams hold a weak reference to
/// this so that a redial landing on a new replica can adopt it.
pub(crate) struct ClientSetState {
    clients: StdMutex<HashMap<String, TunnelClient>>,
    /// Server count learned from the most recent handshake
    last_server_count: AtomicUsize,
    connector: Arc<dyn PacketConnector>,
    cfg: ClientConfig,
}

impl ClientSetState {
    pub(crate) fn contains(&self, server_id: &str) -> bool {
        self.clients.lock().unwrap().contains_key(server_id)
    }

    pub(crate) fn remove(&self, server_id: &str) {
        if self.clients.lock().unwrap().remove(server_id).is_some() {
            info!(server_id = %server_id, "Removed client");
        }
    }

    /// Wrap a freshly dialed transport in a client and adopt it. Refuses
    /// (and closes the transport of) a replica that is already covered.
    pub(crate) async fn register(
        self: &Arc<Self>,
        transport: PacketTransport,
        info: &ServerInfo,
    ) -> Result<TunnelClient, TunnelError> {
        self.last_server_count
            .store(info.server_count, Ordering::SeqCst);

        let stream = ReconnectingStream::new(
            transport,
            info,
            Arc::clone(&self.connector),
            Arc::downgrade(self),
            self.cfg.reconnect_interval,
        );
        let client = TunnelClient::new(stream);

        let inserted = {
            let mut clients = self.clients.lock().unwrap();
            match clients.entry(info.server_id.clone()) {
                Entry::Occupied(_) => false,
                Entry::Vacant(slot) => {
                    slot.insert(client.clone());
                    true
                }
            }
        };

        if !inserted {
            client.close_transport().await;
            return Err(TunnelError::DuplicateServer(info.server_id.clone()));
        }

        info!(
            server_id = %info.server_id,
            server_count = info.server_count,
            "Connected to server"
        );
        client.start(self.cfg.probe_interval);
        Ok(client)
    }

    fn client_count(&self) -> usize {
        self.clients.lock().unwrap().len()
    }

    fn healthy_count(&self) -> usize {
        self.clients
            .lock()
            .unwrap()
            .values()
            .filter(|c| c.is_ready())
            .count()
    }

    fn desired_count(&self) -> usize {
        self.last_server_count.load(Ordering::SeqCst).max(1)
    }
}

/// One client per proxy-server replica, kept in sync with the fleet.
pub struct ClientSet {
    state: Arc<ClientSetState>,
}

impl ClientSet {
    pub fn new(connector: Arc<dyn PacketConnector>, cfg: ClientConfig) -> Self {
        Self {
            state: Arc::new(ClientSetState {
                clients: StdMutex::new(HashMap::new()),
                last_server_count: AtomicUsize::new(0),
                connector,
                cfg,
            }),
        }
    }

    pub fn client_count(&self) -> usize {
        self.state.client_count()
    }

    /// Clients whose transport is currently usable
    pub fn healthy_count(&self) -> usize {
        self.state.healthy_count()
    }

    /// Replica count the fleet last reported, never less than one
    pub fn desired_count(&self) -> usize {
        self.state.desired_count()
    }

    /// Dial once and adopt whichever replica answers. A no-op when the set
    /// already covers the desired count.
    pub async fn sync_once(&self) -> Result<(), TunnelError> {
        if self.state.client_count() >= self.state.desired_count() {
            return Ok(());
        }

        let (transport, info) = self.state.connector.connect().await?;
        self.state.register(transport, &info).await?;
        Ok(())
    }

    /// Sync forever: dial until every replica is covered, backing off on
    /// failure. Runs until the surrounding task is dropped or aborted.
    pub async fn run(&self) {
        let mut backoff = Backoff::new(BackoffConfig {
            initial: self.state.cfg.sync_interval,
            max: Duration::from_secs(60),
            ..BackoffConfig::default()
        });

        loop {
            match self.sync_once().await {
                Ok(()) => {
                    backoff.reset();
                    debug!(
                        clients = self.client_count(),
                        desired = self.desired_count(),
                        "Sync ok"
                    );
                }
                Err(TunnelError::DuplicateServer(server_id)) => {
                    // Dial landed on a replica we already cover; back off so
                    // a fully-covered fleet is not hammered with dials.
                    debug!(server_id = %server_id, "Sync reached an already-connected server");
                }
                Err(e) => {
                    warn!(error = %e, "Sync failed");
                }
            }

            sleep(backoff.next_delay()).await;
        }
    }
}

/// One stream wrapper plus the multiplexer serving it.
#[derive(Clone)]
pub struct TunnelClient {
    stream: Arc<ReconnectingStream>,
    mux: Arc<PacketMux>,
}

impl TunnelClient {
    pub(crate) fn new(stream: Arc<ReconnectingStream>) -> Self {
        let mux = Arc::new(PacketMux::new(Arc::clone(&stream)));
        Self { stream, mux }
    }

    pub fn server_id(&self) -> &str {
        self.stream.server_id()
    }

    pub fn is_ready(&self) -> bool {
        self.stream.is_ready()
    }

    /// Spawn the dispatch loop and the health probe.
    pub(crate) fn start(&self, probe_interval: Duration) {
        tokio::spawn(Arc::clone(&self.mux).serve());
        tokio::spawn(Arc::clone(&self.stream).probe_loop(probe_interval));
    }

    pub(crate) async fn close_transport(&self) {
        self.stream.close_transport().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ReconnectOutcome;
    use crate::test_support::{
        broken_transport, channel_transport, info, FailingConnector, QueueConnector,
    };
    use std::sync::atomic::AtomicUsize;

    fn quick_config() -> ClientConfig {
        ClientConfig {
            sync_interval: Duration::from_millis(10),
            probe_interval: Duration::from_millis(10),
            reconnect_interval: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn test_sync_once_adopts_a_server_and_learns_the_count() {
        let (t1, _peer1) = channel_transport();
        let connector = Arc::new(QueueConnector::new(vec![(t1, info("s1", 3))]));
        let set = ClientSet::new(connector, quick_config());

        assert_eq!(set.client_count(), 0);
        assert_eq!(set.desired_count(), 1);

        set.sync_once().await.unwrap();

        assert_eq!(set.client_count(), 1);
        assert_eq!(set.healthy_count(), 1);
        assert_eq!(set.desired_count(), 3);
        assert!(set.state.contains("s1"));
    }

    #[tokio::test]
    async fn test_duplicate_server_is_refused_and_its_transport_closed() {
        let (t1, _peer1) = channel_transport();
        let (t2, peer2) = channel_transport();
        let connector = Arc::new(QueueConnector::new(vec![
            (t1, info("s1", 2)),
            (t2, info("s1", 2)),
        ]));
        let set = ClientSet::new(connector, quick_config());

        set.sync_once().await.unwrap();
        match set.sync_once().await {
            Err(TunnelError::DuplicateServer(id)) => assert_eq!(id, "s1"),
            other => panic!("Expected DuplicateServer, got {:?}", other),
        }

        assert_eq!(set.client_count(), 1);
        // The refused transport was closed, not leaked
        assert!(!peer2.ready.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_sync_once_is_a_noop_when_fleet_is_covered() {
        let (t1, _peer1) = channel_transport();
        let connector = Arc::new(QueueConnector::new(vec![(t1, info("s1", 1))]));
        let set = ClientSet::new(Arc::clone(&connector) as Arc<dyn PacketConnector>, quick_config());

        set.sync_once().await.unwrap();
        assert_eq!(connector.calls(), 1);

        // Desired count is 1 and we have one client; no further dial
        set.sync_once().await.unwrap();
        assert_eq!(connector.calls(), 1);
    }

    #[tokio::test]
    async fn test_sync_once_propagates_dial_failure() {
        let calls = Arc::new(AtomicUsize::new(0));
        let connector = Arc::new(FailingConnector::new(Arc::clone(&calls)));
        let set = ClientSet::new(connector, quick_config());

        match set.sync_once().await {
            Err(TunnelError::Transport(_)) => {}
            other => panic!("Expected transport error, got {:?}", other),
        }
        assert_eq!(set.client_count(), 0);
    }

    #[tokio::test]
    async fn test_redial_onto_tracked_server_is_closed_and_retried() {
        let set = ClientSet::new(
            Arc::new(FailingConnector::new(Arc::new(AtomicUsize::new(0)))),
            quick_config(),
        );

        // The set already covers s2
        let (t2, _peer2) = channel_transport();
        set.state.register(t2, &info("s2", 2)).await.unwrap();

        // A broken s1 stream whose redials land on s2 first, then s1
        let (discard, discard_peer) = channel_transport();
        let (fresh, _fresh_peer) = channel_transport();
        let connector = Arc::new(QueueConnector::new(vec![
            (discard, info("s2", 2)),
            (fresh, info("s1", 2)),
        ]));
        let stream = ReconnectingStream::new(
            broken_transport(),
            &info("s1", 2),
            connector,
            Arc::downgrade(&set.state),
            Duration::from_millis(1),
        );

        let outcome = stream.trigger_reconnect().wait().await;
        assert_eq!(outcome, ReconnectOutcome::Recovered);

        // The redial that reached the already-covered replica was closed,
        // not leaked, and did not displace the existing client
        assert!(!discard_peer.ready.load(Ordering::SeqCst));
        assert_eq!(set.client_count(), 1);
        assert!(stream.is_ready());
    }

    #[tokio::test]
    async fn test_redial_onto_new_server_joins_the_set() {
        let set = ClientSet::new(
            Arc::new(FailingConnector::new(Arc::new(AtomicUsize::new(0)))),
            quick_config(),
        );

        // A broken s1 stream whose redials reach an unknown replica first
        let (adopted, adopted_peer) = channel_transport();
        let (fresh, _fresh_peer) = channel_transport();
        let connector = Arc::new(QueueConnector::new(vec![
            (adopted, info("s2", 2)),
            (fresh, info("s1", 2)),
        ]));
        let stream = ReconnectingStream::new(
            broken_transport(),
            &info("s1", 2),
            connector,
            Arc::downgrade(&set.state),
            Duration::from_millis(1),
        );

        let outcome = stream.trigger_reconnect().wait().await;
        assert_eq!(outcome, ReconnectOutcome::Recovered);

        // The unknown replica was adopted with its transport intact, and
        // the worker kept retrying until it reached its own replica again
        assert!(set.state.contains("s2"));
        assert_eq!(set.client_count(), 1);
        assert_eq!(set.desired_count(), 2);
        assert!(adopted_peer.ready.load(Ordering::SeqCst));
        assert!(stream.is_ready());
    }

    #[tokio::test]
    async fn test_removed_client_frees_its_slot() {
        let (t1, _peer1) = channel_transport();
        let connector = Arc::new(QueueConnector::new(vec![(t1, info("s1", 2))]));
        let set = ClientSet::new(connector, quick_config());

        set.sync_once().await.unwrap();
        assert!(set.state.contains("s1"));

        set.state.remove("s1");
        assert!(!set.state.contains("s1"));
        assert_eq!(set.client_count(), 0);
    }
}
