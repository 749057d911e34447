//! Framed TCP transport
//!
//! Packets and handshake messages are carried as length-prefixed bincode
//! frames over a plain TCP connection. The socket is split into owned halves
//! after the handshake so the sink and source can be driven independently.

use async_trait::async_trait;
use bytes::BytesMut;
use serde::de::DeserializeOwned;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::debug;

use backhaul_proto::{Handshake, Packet, WireCodec};

use crate::{
    PacketConnector, PacketSink, PacketSource, PacketTransport, ServerInfo, TransportError,
    TransportResult,
};

/// Connector that dials the proxy server over TCP and performs the
/// `Hello`/`Welcome` handshake.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    proxy_addr: String,
    agent_id: String,
    token_file: Option<PathBuf>,
}

impl TcpConnector {
    pub fn new(proxy_addr: impl Into<String>, agent_id: impl Into<String>) -> Self {
        Self {
            proxy_addr: proxy_addr.into(),
            agent_id: agent_id.into(),
            token_file: None,
        }
    }

    /// Read the bearer token from this file path at every connect, so a
    /// rotated credential is picked up without restarting the agent.
    pub fn with_token_file(mut self, path: PathBuf) -> Self {
        self.token_file = Some(path);
        self
    }

    /// Load the bearer token, if one is configured. Trailing whitespace is
    /// stripped since mounted credential files usually end with a newline.
    fn load_token(&self) -> TransportResult<String> {
        match &self.token_file {
            Some(path) => {
                let raw =
                    std::fs::read_to_string(path).map_err(|source| TransportError::Credential {
                        path: path.clone(),
                        source,
                    })?;
                Ok(raw.trim_end().to_string())
            }
            None => Ok(String::new()),
        }
    }
}

#[async_trait]
impl PacketConnector for TcpConnector {
    async fn connect(&self) -> TransportResult<(PacketTransport, ServerInfo)> {
        let auth_token = self.load_token()?;

        debug!(proxy_addr = %self.proxy_addr, "Connecting to proxy server");
        let mut stream = TcpStream::connect(&self.proxy_addr).await?;
        stream.set_nodelay(true)?;

        let hello = Handshake::Hello {
            agent_id: self.agent_id.clone(),
            auth_token,
        };
        stream.write_all(&WireCodec::encode(&hello)?).await?;

        let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
        let reply: Handshake = match read_frame(&mut stream, &mut buf).await? {
            Some(reply) => reply,
            None => {
                return Err(TransportError::Handshake(
                    "connection closed during handshake".to_string(),
                ))
            }
        };

        match reply {
            Handshake::Welcome {
                server_id,
                server_count,
            } => {
                debug!(server_id = %server_id, server_count, "Handshake complete");
                let (read_half, write_half) = stream.into_split();
                let ready = Arc::new(AtomicBool::new(true));

                let sink = TcpPacketSink {
                    writer: write_half,
                    ready: ready.clone(),
                };
                let source = TcpPacketSource {
                    reader: read_half,
                    buf,
                    ready: ready.clone(),
                };
                let info = ServerInfo {
                    server_id,
                    server_count: server_count as usize,
                };

                Ok((
                    PacketTransport::new(Box::new(sink), Box::new(source), ready),
                    info,
                ))
            }
            Handshake::Rejected { reason } => Err(TransportError::Handshake(reason)),
            other => Err(TransportError::Handshake(format!(
                "unexpected handshake reply: {:?}",
                other
            ))),
        }
    }
}

const READ_BUFFER_SIZE: usize = 16 * 1024;

struct TcpPacketSink {
    writer: OwnedWriteHalf,
    ready: Arc<AtomicBool>,
}

#[async_trait]
impl PacketSink for TcpPacketSink {
    async fn send(&mut self, packet: &Packet) -> TransportResult<()> {
        let frame = WireCodec::encode(packet)?;
        if let Err(e) = self.writer.write_all(&frame).await {
            self.ready.store(false, Ordering::SeqCst);
            return Err(e.into());
        }
        Ok(())
    }

    async fn close(&mut self) -> TransportResult<()> {
        self.ready.store(false, Ordering::SeqCst);
        let _ = self.writer.shutdown().await;
        Ok(())
    }
}

struct TcpPacketSource {
    reader: OwnedReadHalf,
    buf: BytesMut,
    ready: Arc<AtomicBool>,
}

#[async_trait]
impl PacketSource for TcpPacketSource {
    async fn recv(&mut self) -> TransportResult<Option<Packet>> {
        match read_frame(&mut self.reader, &mut self.buf).await {
            Ok(Some(pkt)) => Ok(Some(pkt)),
            Ok(None) => {
                self.ready.store(false, Ordering::SeqCst);
                Ok(None)
            }
            Err(e) => {
                self.ready.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }
}

/// Read one complete frame, returning `Ok(None)` on a clean EOF at a frame
/// boundary. An EOF mid-frame is reported as an error.
async fn read_frame<T: DeserializeOwned, R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut BytesMut,
) -> TransportResult<Option<T>> {
    loop {
        if let Some(msg) = WireCodec::decode(buf)? {
            return Ok(Some(msg));
        }

        let n = reader.read_buf(buf).await?;
        if n == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(TransportError::Closed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Minimal proxy-side handshake for exercising the connector: accepts one
    /// connection, validates the Hello, replies, and echoes packets back.
    async fn spawn_test_server(
        reply: Handshake,
        expect_token: Option<String>,
    ) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = BytesMut::new();

            let hello: Handshake = read_frame(&mut socket, &mut buf).await.unwrap().unwrap();
            if let Handshake::Hello {
                agent_id,
                auth_token,
            } = hello
            {
                assert!(!agent_id.is_empty());
                if let Some(expected) = expect_token {
                    assert_eq!(auth_token, expected);
                }
            } else {
                panic!("Expected Hello");
            }

            socket
                .write_all(&WireCodec::encode(&reply).unwrap())
                .await
                .unwrap();

            if matches!(reply, Handshake::Welcome { .. }) {
                // Echo packets until the agent hangs up
                while let Ok(Some(pkt)) = read_frame::<Packet, _>(&mut socket, &mut buf).await {
                    socket
                        .write_all(&WireCodec::encode(&pkt).unwrap())
                        .await
                        .unwrap();
                }
            }
        });

        addr
    }

    #[tokio::test]
    async fn test_connect_and_roundtrip() {
        let addr = spawn_test_server(
            Handshake::Welcome {
                server_id: "server-a".to_string(),
                server_count: 3,
            },
            None,
        )
        .await;

        let connector = TcpConnector::new(addr.to_string(), "agent-1");
        let (mut transport, info) = connector.connect().await.unwrap();

        assert_eq!(info.server_id, "server-a");
        assert_eq!(info.server_count, 3);
        assert!(transport.ready.load(Ordering::SeqCst));

        let pkt = Packet::CloseRequest { conn_id: 7 };
        transport.sink.send(&pkt).await.unwrap();
        let echoed = transport.source.recv().await.unwrap();
        assert_eq!(echoed, Some(pkt));
    }

    #[tokio::test]
    async fn test_eof_clears_ready() {
        let addr = spawn_test_server(
            Handshake::Welcome {
                server_id: "server-a".to_string(),
                server_count: 1,
            },
            None,
        )
        .await;

        let connector = TcpConnector::new(addr.to_string(), "agent-1");
        let (mut transport, _info) = connector.connect().await.unwrap();

        // Closing our sink makes the echo server hang up, which the source
        // observes as a clean EOF.
        transport.sink.close().await.unwrap();
        let got = transport.source.recv().await.unwrap();
        assert_eq!(got, None);
        assert!(!transport.ready.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_rejected_handshake() {
        let addr = spawn_test_server(
            Handshake::Rejected {
                reason: "bad token".to_string(),
            },
            None,
        )
        .await;

        let connector = TcpConnector::new(addr.to_string(), "agent-1");
        let result = connector.connect().await;
        match result {
            Err(TransportError::Handshake(reason)) => assert_eq!(reason, "bad token"),
            _ => panic!("Expected handshake error"),
        }
    }

    #[tokio::test]
    async fn test_token_file_read_at_connect() {
        let path = std::env::temp_dir().join(format!("backhaul-token-{}", std::process::id()));
        std::fs::write(&path, "secret-token\n").unwrap();

        let addr = spawn_test_server(
            Handshake::Welcome {
                server_id: "server-a".to_string(),
                server_count: 1,
            },
            Some("secret-token".to_string()),
        )
        .await;

        let connector =
            TcpConnector::new(addr.to_string(), "agent-1").with_token_file(path.clone());
        let result = connector.connect().await;
        std::fs::remove_file(&path).ok();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_missing_token_file_is_credential_error() {
        let connector = TcpConnector::new("127.0.0.1:1", "agent-1")
            .with_token_file(PathBuf::from("/nonexistent/backhaul-token"));
        let result = connector.connect().await;
        assert!(matches!(result, Err(TransportError::Credential { .. })));
    }
}
