//! Mode wiring
//!
//! [`App::start`] performs every fallible startup step (dial, bind) and prints
//! the mode's status lines; [`App::run`] serves until shutdown and drains.

use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::{Config, Mode};
use crate::core::{SessionRegistry, Stats};
use crate::error::TerracottaError;
use crate::handler::{ConnectionHandler, EchoHandler, LocalForwarder, TunnelClient};
use crate::lifecycle::{self, STATS_INTERVAL};
use crate::logger::log;
use crate::runner::{bind_listener, run_accept_loop};

const BANNER: &str = r"
████████╗███████╗██████╗ ██████╗  █████╗  ██████╗ ██████╗ ████████╗████████╗ █████╗ 
╚══██╔══╝██╔════╝██╔══██╗██╔══██╗██╔══██╗██╔════╝██╔═══██╗╚══██╔══╝╚══██╔══╝██╔══██╗
   ██║   █████╗  ██████╔╝██████╔╝███████║██║     ██║   ██║   ██║      ██║   ███████║
   ██║   ██╔══╝  ██╔══██╗██╔══██╗██╔══██║██║     ██║   ██║   ██║      ██║   ██╔══██║
   ██║   ███████╗██║  ██║██║  ██║██║  ██║╚██████╗╚██████╔╝   ██║      ██║   ██║  ██║
   ╚═╝   ╚══════╝╚═╝  ╚═╝╚═╝  ╚═╝╚═╝  ╚═╝ ╚═════╝ ╚═════╝    ╚═╝      ╚═╝   ╚═╝  ╚═╝
";

/// Startup banner with the version line
pub fn banner(version: &str) -> String {
    format!("{}{:>32}Server Tunneling v{}\n", BANNER, "", version)
}

/// Line printed when a termination signal arrives
pub fn shutdown_notice(mode: Mode) -> &'static str {
    match mode {
        Mode::Local => "Shutting down Terracotta...",
        Mode::Server => "Shutting down server...",
        Mode::Client => "Disconnecting from server...",
    }
}

/// A started mode, ready to serve
pub struct App {
    config: Arc<Config>,
    listener: TcpListener,
    handler: Arc<dyn ConnectionHandler>,
    registry: Option<SessionRegistry>,
    tunnel: Option<Arc<TunnelClient>>,
    stats: Arc<Stats>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl App {
    /// Bind the listener (and dial the tunnel server in client mode)
    pub async fn start(config: Arc<Config>, shutdown: CancellationToken) -> Result<Self> {
        let stats = Arc::new(Stats::new());
        let conn = config.conn;

        let (listener, handler, registry, tunnel): (
            TcpListener,
            Arc<dyn ConnectionHandler>,
            Option<SessionRegistry>,
            Option<Arc<TunnelClient>>,
        ) = match config.mode {
            Mode::Local => {
                let listener = bind_listener(config.local_listen_addr(), conn.tcp_backlog)?;
                let handler = LocalForwarder::new(
                    config.remote_target(),
                    conn,
                    Arc::clone(&stats),
                    shutdown.clone(),
                );
                println!("Terracotta tunnel active");
                println!(
                    "Local: {} -> Remote: {}",
                    listener.local_addr()?,
                    config.remote_target()
                );
                println!("Forwarding traffic...\n");
                (listener, Arc::new(handler), None, None)
            }
            Mode::Server => {
                let listener = bind_listener(config.server_listen_addr(), conn.tcp_backlog)?;
                let registry = SessionRegistry::new();
                let handler = EchoHandler::new(
                    registry.clone(),
                    Arc::clone(&stats),
                    conn.buffer_size,
                    shutdown.clone(),
                );
                println!("Terracotta server started");
                println!("Listening on: {}", listener.local_addr()?);
                println!("Waiting for clients...\n");
                (listener, Arc::new(handler), Some(registry), None)
            }
            Mode::Client => {
                println!("Terracotta client starting");
                println!("Server: {}", config.tunnel_server_addr());
                println!("Local: {}", config.local_listen_addr());
                println!("Establishing tunnel...\n");
                let client = Arc::new(
                    TunnelClient::connect(
                        config.tunnel_server_addr(),
                        &conn,
                        Arc::clone(&stats),
                        shutdown.clone(),
                    )
                    .await?,
                );
                println!("Connected to tunnel server");
                let listener = bind_listener(config.local_listen_addr(), conn.tcp_backlog)?;
                println!(
                    "Tunnel established! Local port {} is now forwarded",
                    listener.local_addr()?.port()
                );
                let handler: Arc<dyn ConnectionHandler> = client.clone();
                (listener, handler, None, Some(client))
            }
        };

        log::info!(mode = %config.mode, "Mode started");

        Ok(Self {
            config,
            listener,
            handler,
            registry,
            tunnel,
            stats,
            tracker: TaskTracker::new(),
            shutdown,
        })
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn stats(&self) -> Arc<Stats> {
        Arc::clone(&self.stats)
    }

    /// Serve until the shutdown token fires, then drain
    ///
    /// Fails only if client mode lost its tunnel.
    pub async fn run(self) -> Result<()> {
        let reporter = lifecycle::spawn_stats_reporter(
            Arc::clone(&self.stats),
            self.config.verbose,
            STATS_INTERVAL,
            self.shutdown.clone(),
        );

        run_accept_loop(
            self.listener,
            self.handler,
            &self.config.conn,
            &self.tracker,
            &self.shutdown,
        )
        .await;

        lifecycle::drain(
            &self.shutdown,
            self.registry.as_ref(),
            &self.tracker,
            self.config.conn.shutdown_grace,
        )
        .await;
        let _ = reporter.await;

        log::info!(final_stats = %self.stats.snapshot(), "Terracotta stopped");

        match self.tunnel {
            Some(tunnel) if tunnel.is_lost() => {
                Err(TerracottaError::TunnelClosed(tunnel.server_addr().to_string()).into())
            }
            _ => Ok(()),
        }
    }
}

/// Start the configured mode and serve until shutdown
pub async fn run(config: Arc<Config>, shutdown: CancellationToken) -> Result<()> {
    App::start(config, shutdown).await?.run().await
}
