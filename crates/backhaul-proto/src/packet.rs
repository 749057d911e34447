//! Protocol message types

use serde::{Deserialize, Serialize};

/// A single tunnel packet, carried over the shared stream between the agent
/// and one proxy server replica.
///
/// Error fields use the empty string for "no error" so that responses always
/// have the same shape on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Packet {
    /// Proxy asks the agent to open a local socket.
    DialRequest {
        protocol: String,
        address: String,
        random: i64,
    },
    /// Agent's answer to a DialRequest; `random` echoes the request so the
    /// proxy can correlate responses.
    DialResponse {
        conn_id: i64,
        random: i64,
        error: String,
    },
    /// Payload bytes for one logical connection.
    Data {
        conn_id: i64,
        #[serde(with = "serde_bytes")]
        data: Vec<u8>,
    },
    /// Proxy asks the agent to tear down one logical connection.
    CloseRequest { conn_id: i64 },
    /// Agent confirms a close (or reports an unknown conn_id).
    CloseResponse { conn_id: i64, error: String },
}

/// Handshake messages exchanged once per transport connection, before any
/// `Packet` flows.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Handshake {
    /// Agent identifies itself. The token may be empty when no credential is
    /// configured.
    Hello {
        agent_id: String,
        auth_token: String,
    },
    /// Server accepts and reports its replica identity plus the believed
    /// fleet size.
    Welcome {
        server_id: String,
        server_count: u64,
    },
    /// Server refuses the connection.
    Rejected { reason: String },
}

// Custom serde helper so Data payloads serialize as a byte string rather
// than an element sequence.
mod serde_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(data)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Vec::<u8>::deserialize(deserializer)
    }
}
