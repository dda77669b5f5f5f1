//! Tunnel client
//!
//! A single upstream connection to the tunnel server is opened at startup and
//! shared by all local connections. Each local connection gets the upstream
//! to itself for the whole of its relay; the rest queue in arrival order.
//! There is no framing, so this is the only way to keep their byte streams
//! apart.

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::{log_relay_outcome, ConnectionHandler};
use crate::config::ConnConfig;
use crate::core::{relay_reclaim, LegEnd, RelayOptions, RelayOutcome, Stats, Teardown};
use crate::error::Result;
use crate::logger::log;
use crate::runner::dial;

/// Bridges local connections onto one upstream tunnel connection
pub struct TunnelClient {
    server_addr: String,
    upstream: Mutex<Option<TcpStream>>,
    lost: AtomicBool,
    relay_linger: Duration,
    stats: Arc<Stats>,
    shutdown: CancellationToken,
}

impl TunnelClient {
    /// Dial the tunnel server; failure here is fatal to client mode
    pub async fn connect(
        server_addr: String,
        conn_config: &ConnConfig,
        stats: Arc<Stats>,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let upstream = dial(
            &server_addr,
            conn_config.connect_timeout,
            conn_config.tcp_nodelay,
        )
        .await?;
        log::info!(server = %server_addr, "Connected to tunnel server");
        Ok(Self::from_stream(
            server_addr,
            upstream,
            conn_config.relay_linger,
            stats,
            shutdown,
        ))
    }

    /// Wrap an already established upstream connection
    pub fn from_stream(
        server_addr: String,
        upstream: TcpStream,
        relay_linger: Duration,
        stats: Arc<Stats>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            server_addr,
            upstream: Mutex::new(Some(upstream)),
            lost: AtomicBool::new(false),
            relay_linger,
            stats,
            shutdown,
        }
    }

    pub fn server_addr(&self) -> &str {
        &self.server_addr
    }

    /// Whether the upstream connection has been lost
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }

    fn mark_lost(&self) {
        if !self.lost.swap(true, Ordering::AcqRel) {
            log::warn!(server = %self.server_addr, "Tunnel connection lost, shutting down");
            self.shutdown.cancel();
        }
    }
}

/// The upstream is unusable once its read side ends or a write to it fails
fn tunnel_broken(outcome: &RelayOutcome) -> bool {
    matches!(outcome.downstream, LegEnd::Eof | LegEnd::ReadFailed(_))
        || matches!(outcome.upstream, LegEnd::WriteFailed(_))
}

#[async_trait]
impl ConnectionHandler for TunnelClient {
    async fn handle(&self, stream: TcpStream, peer_addr: SocketAddr) {
        let peer = peer_addr.to_string();
        let _counted = self.stats.connection_guard();

        if self.is_lost() {
            log::debug!(peer = %peer, "Tunnel is down, dropping connection");
            return;
        }

        let mut slot = tokio::select! {
            guard = self.upstream.lock() => guard,
            _ = self.shutdown.cancelled() => return,
        };

        let Some(upstream) = slot.take() else {
            log::debug!(peer = %peer, "Tunnel is down, dropping connection");
            return;
        };

        log::debug!(peer = %peer, server = %self.server_addr, "Bridging connection onto tunnel");

        // The upstream write side stays open for the next connection. After
        // the local side stops sending, replies keep flowing until the tunnel
        // has been quiet for the linger period.
        let options = RelayOptions::new(Teardown::KeepOutbound, self.relay_linger);
        let (outcome, upstream) =
            relay_reclaim(stream, upstream, &self.stats, options, &self.shutdown).await;
        log_relay_outcome(&peer, &outcome);

        match upstream {
            Some(upstream) if !tunnel_broken(&outcome) => *slot = Some(upstream),
            // Dropping the stream closes the upstream socket
            _ => self.mark_lost(),
        }
    }
}
