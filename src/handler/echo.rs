//! Tunnel server connection loop
//!
//! The server has no framing protocol: whatever a tunnel client sends is
//! written straight back on the same connection.

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use super::ConnectionHandler;
use crate::core::{SessionRegistry, Stats};
use crate::logger::log;

/// Echoes every chunk back to its sender
pub struct EchoHandler {
    registry: SessionRegistry,
    stats: Arc<Stats>,
    buffer_size: usize,
    shutdown: CancellationToken,
}

impl EchoHandler {
    pub fn new(
        registry: SessionRegistry,
        stats: Arc<Stats>,
        buffer_size: usize,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            registry,
            stats,
            buffer_size,
            shutdown,
        }
    }

    /// Read-echo loop; returns bytes echoed
    async fn echo(&self, stream: &mut TcpStream, peer: &str, session: &CancellationToken) -> u64 {
        let mut buf = vec![0u8; self.buffer_size];
        let mut echoed = 0u64;

        loop {
            let n = tokio::select! {
                res = stream.read(&mut buf) => match res {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) => {
                        log::debug!(peer = %peer, error = %e, "Read error");
                        break;
                    }
                },
                _ = session.cancelled() => {
                    log::debug!(peer = %peer, "Session closed by shutdown");
                    break;
                }
            };
            self.stats.add_bytes(0, n as u64);

            tokio::select! {
                res = stream.write_all(&buf[..n]) => {
                    if let Err(e) = res {
                        log::debug!(peer = %peer, error = %e, "Write error");
                        break;
                    }
                }
                _ = session.cancelled() => break,
            }
            self.stats.add_bytes(n as u64, 0);
            echoed += n as u64;
        }

        echoed
    }
}

#[async_trait]
impl ConnectionHandler for EchoHandler {
    async fn handle(&self, mut stream: TcpStream, peer_addr: SocketAddr) {
        let peer = peer_addr.to_string();
        let (session_id, session) = self.registry.register(peer.clone(), &self.shutdown);

        // Ensure the session is unregistered when done
        let _guard = scopeguard::guard((), |_| {
            if let Some(duration) = self.registry.unregister(&peer, session_id) {
                log::debug!(
                    peer = %peer,
                    session_id = session_id,
                    duration = ?duration,
                    "Tunnel client disconnected"
                );
            }
        });

        let _counted = self.stats.connection_guard();
        log::debug!(
            peer = %peer,
            session_id = session_id,
            sessions = self.registry.len(),
            "New tunnel client connected"
        );

        let echoed = self.echo(&mut stream, &peer, &session).await;
        log::trace!(peer = %peer, bytes = echoed, "Echo loop finished");
    }
}
