//! Wire protocol for the backhaul tunnel: packet types and framing codec.

pub mod codec;
pub mod packet;

pub use codec::{CodecError, WireCodec};
pub use packet::{Handshake, Packet};
