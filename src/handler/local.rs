//! Direct port forwarding

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use super::{log_relay_outcome, ConnectionHandler};
use crate::config::ConnConfig;
use crate::core::{relay, RelayOptions, Stats, Teardown};
use crate::logger::log;
use crate::runner::dial;

/// Forwards every accepted connection to a fixed remote target
pub struct LocalForwarder {
    target: String,
    conn_config: ConnConfig,
    stats: Arc<Stats>,
    shutdown: CancellationToken,
}

impl LocalForwarder {
    pub fn new(
        target: String,
        conn_config: ConnConfig,
        stats: Arc<Stats>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            target,
            conn_config,
            stats,
            shutdown,
        }
    }
}

#[async_trait]
impl ConnectionHandler for LocalForwarder {
    async fn handle(&self, stream: TcpStream, peer_addr: SocketAddr) {
        let peer = peer_addr.to_string();
        let _counted = self.stats.connection_guard();

        log::debug!(peer = %peer, target = %self.target, "Connecting to target");

        let remote = tokio::select! {
            res = dial(
                &self.target,
                self.conn_config.connect_timeout,
                self.conn_config.tcp_nodelay,
            ) => match res {
                Ok(remote) => remote,
                Err(e) => {
                    // Only the inbound socket is closed (dropped here)
                    log::debug!(peer = %peer, target = %self.target, error = %e, "Failed to connect to remote");
                    return;
                }
            },
            _ = self.shutdown.cancelled() => return,
        };

        let outcome = relay(
            stream,
            remote,
            &self.stats,
            RelayOptions::new(Teardown::HalfClose, self.conn_config.relay_linger),
            &self.shutdown,
        )
        .await;
        log_relay_outcome(&peer, &outcome);
    }
}
