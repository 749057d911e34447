//! In-memory transport mocks shared by the unit tests

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

use backhaul_proto::Packet;
use backhaul_transport::{
    PacketConnector, PacketSink, PacketSource, PacketTransport, ServerInfo, TransportError,
    TransportResult,
};

pub fn info(server_id: &str, server_count: usize) -> ServerInfo {
    ServerInfo {
        server_id: server_id.to_string(),
        server_count,
    }
}

/// What the proxy-server side of a [`channel_transport`] sees.
pub struct TestPeer {
    /// Feed packets (or injected errors) to the agent's source
    pub to_agent: mpsc::UnboundedSender<TransportResult<Packet>>,
    /// Observe packets the agent sent
    pub from_agent: mpsc::UnboundedReceiver<Packet>,
    /// The transport's readiness flag
    pub ready: Arc<AtomicBool>,
}

impl TestPeer {
    pub fn send(&self, packet: Packet) {
        self.to_agent.send(Ok(packet)).unwrap();
    }

    /// Make the agent's next recv fail with a transport error
    pub fn fail_recv(&self) {
        self.ready.store(false, Ordering::SeqCst);
        self.to_agent.send(Err(TransportError::Closed)).unwrap();
    }

    /// Next packet the agent sent, with a test-friendly timeout
    pub async fn expect(&mut self) -> Packet {
        timeout(Duration::from_secs(5), self.from_agent.recv())
            .await
            .expect("timed out waiting for a packet from the agent")
            .expect("agent closed its sink")
    }

    /// Non-blocking peek at the agent's output
    pub fn try_expect(&mut self) -> Option<Packet> {
        self.from_agent.try_recv().ok()
    }
}

/// A working in-memory transport and its peer handle.
pub fn channel_transport() -> (PacketTransport, TestPeer) {
    let (agent_tx, peer_rx) = mpsc::unbounded_channel();
    let (peer_tx, agent_rx) = mpsc::unbounded_channel();
    let ready = Arc::new(AtomicBool::new(true));

    let sink = ChannelSink {
        tx: agent_tx,
        ready: ready.clone(),
    };
    let source = ChannelSource { rx: agent_rx };

    (
        PacketTransport::new(Box::new(sink), Box::new(source), ready.clone()),
        TestPeer {
            to_agent: peer_tx,
            from_agent: peer_rx,
            ready,
        },
    )
}

struct ChannelSink {
    tx: mpsc::UnboundedSender<Packet>,
    ready: Arc<AtomicBool>,
}

#[async_trait]
impl PacketSink for ChannelSink {
    async fn send(&mut self, packet: &Packet) -> TransportResult<()> {
        if self.tx.send(packet.clone()).is_err() {
            self.ready.store(false, Ordering::SeqCst);
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    async fn close(&mut self) -> TransportResult<()> {
        self.ready.store(false, Ordering::SeqCst);
        Ok(())
    }
}

struct ChannelSource {
    rx: mpsc::UnboundedReceiver<TransportResult<Packet>>,
}

#[async_trait]
impl PacketSource for ChannelSource {
    async fn recv(&mut self) -> TransportResult<Option<Packet>> {
        match self.rx.recv().await {
            Some(Ok(packet)) => Ok(Some(packet)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }
}

/// A transport whose sink always errors, whose source never yields, and
/// which reports not-ready from the start.
pub fn broken_transport() -> PacketTransport {
    struct BrokenSink;

    #[async_trait]
    impl PacketSink for BrokenSink {
        async fn send(&mut self, _packet: &Packet) -> TransportResult<()> {
            Err(TransportError::Closed)
        }

        async fn close(&mut self) -> TransportResult<()> {
            Ok(())
        }
    }

    struct PendingSource;

    #[async_trait]
    impl PacketSource for PendingSource {
        async fn recv(&mut self) -> TransportResult<Option<Packet>> {
            std::future::pending().await
        }
    }

    PacketTransport::new(
        Box::new(BrokenSink),
        Box::new(PendingSource),
        Arc::new(AtomicBool::new(false)),
    )
}

/// Connector that refuses every attempt, counting the calls.
pub struct FailingConnector {
    calls: Arc<AtomicUsize>,
}

impl FailingConnector {
    pub fn new(calls: Arc<AtomicUsize>) -> Self {
        Self { calls }
    }
}

#[async_trait]
impl PacketConnector for FailingConnector {
    async fn connect(&self) -> TransportResult<(PacketTransport, ServerInfo)> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(TransportError::Handshake("test connector refuses".to_string()))
    }
}

/// Connector that hands out prepared transports in order, then refuses.
pub struct QueueConnector {
    queue: Mutex<VecDeque<(PacketTransport, ServerInfo)>>,
    calls: Arc<AtomicUsize>,
}

impl QueueConnector {
    pub fn new(items: Vec<(PacketTransport, ServerInfo)>) -> Self {
        Self {
            queue: Mutex::new(items.into()),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PacketConnector for QueueConnector {
    async fn connect(&self) -> TransportResult<(PacketTransport, ServerInfo)> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.queue
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| TransportError::Handshake("queue empty".to_string()))
    }
}
