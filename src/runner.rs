//! Listener setup, outbound dialing and the accept loop
//!
//! Every mode shares one accept loop: bind, apply socket options, take a
//! connection permit, hand the socket to the mode's handler on a tracked task.

use socket2::{SockRef, TcpKeepalive};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::ConnConfig;
use crate::error::{Result, TerracottaError};
use crate::handler::ConnectionHandler;
use crate::logger::log;

/// TCP keepalive interval; a dead peer is noticed after about 45s (3 missed checks of 15s)
const TCP_KEEPALIVE_SECS: u64 = 15;

/// Bind a TCP listener with SO_REUSEADDR for fast restarts
pub fn bind_listener(addr: SocketAddr, backlog: i32) -> Result<TcpListener> {
    let bind = || -> std::io::Result<TcpListener> {
        let socket = socket2::Socket::new(
            socket2::Domain::for_address(addr),
            socket2::Type::STREAM,
            Some(socket2::Protocol::TCP),
        )?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(backlog)?;
        TcpListener::from_std(socket.into())
    };

    bind().map_err(|source| TerracottaError::Bind {
        addr: addr.to_string(),
        source,
    })
}

/// Apply TCP_NODELAY and keepalive; failures are ignored
pub fn tune_stream(stream: &TcpStream, nodelay: bool) {
    if nodelay {
        let _ = stream.set_nodelay(true);
    }
    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(TCP_KEEPALIVE_SECS))
        .with_interval(Duration::from_secs(TCP_KEEPALIVE_SECS));
    let _ = SockRef::from(stream).set_tcp_keepalive(&keepalive);
}

/// Connect to `addr` with a timeout
pub async fn dial(addr: &str, timeout: Duration, nodelay: bool) -> Result<TcpStream> {
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => {
            tune_stream(&stream, nodelay);
            Ok(stream)
        }
        Ok(Err(source)) => Err(TerracottaError::Connect {
            addr: addr.to_string(),
            source,
        }),
        Err(_) => Err(TerracottaError::ConnectTimeout(addr.to_string())),
    }
}

/// Accept connections until `shutdown` fires
///
/// The listener is dropped (closed) on return. Handler tasks are spawned on
/// `tracker` so the caller can wait for them.
pub async fn run_accept_loop(
    listener: TcpListener,
    handler: Arc<dyn ConnectionHandler>,
    conn_config: &ConnConfig,
    tracker: &TaskTracker,
    shutdown: &CancellationToken,
) {
    // Connection limiter: 0 = unlimited
    let conn_limiter = if conn_config.max_connections > 0 {
        Some(Arc::new(Semaphore::new(conn_config.max_connections)))
    } else {
        None
    };

    if let Ok(local_addr) = listener.local_addr() {
        log::info!(
            address = %local_addr,
            max_connections = conn_config.max_connections,
            "Accept loop started"
        );
    }

    loop {
        let accepted = tokio::select! {
            res = listener.accept() => res,
            _ = shutdown.cancelled() => break,
        };

        let (stream, addr) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                log::debug!(error = %e, "Accept error");
                continue;
            }
        };

        // Acquire connection permit (backpressure when at limit)
        let permit = match conn_limiter {
            Some(ref limiter) => {
                let acquired = tokio::select! {
                    res = Arc::clone(limiter).acquire_owned() => res,
                    _ = shutdown.cancelled() => break,
                };
                match acquired {
                    Ok(permit) => Some(permit),
                    Err(_) => break,
                }
            }
            None => None,
        };

        tune_stream(&stream, conn_config.tcp_nodelay);

        let handler = Arc::clone(&handler);
        tracker.spawn(async move {
            // Hold permit for the lifetime of this connection
            let _permit = permit;
            let peer_addr = addr.to_string();
            log::connection(&peer_addr, "new");
            handler.handle(stream, addr).await;
            log::connection(&peer_addr, "closed");
        });
    }

    log::debug!("Accept loop stopped");
}
