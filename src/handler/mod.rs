//! Per-connection handlers
//!
//! One handler per mode. The accept loop owns nothing mode-specific; it hands
//! each accepted socket to the handler through [`ConnectionHandler`].

mod client;
mod echo;
mod local;

pub use client::TunnelClient;
pub use echo::EchoHandler;
pub use local::LocalForwarder;

use async_trait::async_trait;
use std::net::SocketAddr;
use tokio::net::TcpStream;

use crate::core::RelayOutcome;
use crate::logger::log;

/// Serve one accepted connection
///
/// Implementations own all per-connection error handling; nothing is
/// reported back to the accept loop.
#[async_trait]
pub trait ConnectionHandler: Send + Sync + 'static {
    async fn handle(&self, stream: TcpStream, peer_addr: SocketAddr);
}

/// Log how a relay ended
fn log_relay_outcome(peer: &str, outcome: &RelayOutcome) {
    log::leg_finished(peer, "upstream", outcome.sent);
    log::leg_finished(peer, "downstream", outcome.received);
    match outcome.error() {
        Some(e) => log::debug!(
            peer = %peer,
            sent = outcome.sent,
            received = outcome.received,
            error = %e,
            "Relay error"
        ),
        None => log::trace!(
            peer = %peer,
            sent = outcome.sent,
            received = outcome.received,
            "Relay completed"
        ),
    }
}
