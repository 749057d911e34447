//! Agent-side tunnel client
//!
//! A process behind a NAT or firewall uses this crate to expose outbound TCP
//! connectivity to a fleet of proxy servers it cannot otherwise reach. Each
//! proxy replica gets one long-lived packet stream; [`mux::PacketMux`]
//! multiplexes many logical TCP connections over it,
//! [`stream::ReconnectingStream`] transparently repairs the stream when the
//! transport breaks, and [`clientset::ClientSet`] keeps one healthy stream
//! per known replica.

pub mod backoff;
pub mod clientset;
pub mod error;
pub mod mux;
pub mod stream;

#[cfg(test)]
mod test_support;

pub use backoff::{Backoff, BackoffConfig};
pub use clientset::{ClientConfig, ClientSet, TunnelClient};
pub use error::{ReconnectHandle, ReconnectOutcome, TunnelError};
pub use mux::PacketMux;
pub use stream::{retry_limit, ReconnectingStream};
