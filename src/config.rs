//! Configuration module for Terracotta
//!
//! This module handles CLI argument parsing. All configuration comes from
//! command-line flags; there is no config file and no environment lookup.

use clap::{Parser, ValueEnum};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use crate::core::DEFAULT_LINGER;
use crate::error::{Result, TerracottaError};

/// Parse duration string (e.g., "10s", "2m", "1h") or plain seconds
fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    if let Ok(d) = humantime::parse_duration(s) {
        return Ok(d);
    }
    s.parse::<u64>().map(Duration::from_secs).map_err(|_| {
        format!(
            "Invalid duration '{}'. Use formats like '10s', '2m', '1h' or plain seconds",
            s
        )
    })
}

/// Operating mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    /// Direct port forwarding
    Local,
    /// Connect to tunnel server
    Client,
    /// Run as tunnel server
    Server,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Local => write!(f, "local"),
            Mode::Client => write!(f, "client"),
            Mode::Server => write!(f, "server"),
        }
    }
}

/// CLI arguments for Terracotta
#[derive(Parser, Debug, Clone)]
#[command(
    name = "terracotta",
    version,
    about = "Terracotta server tunneling: direct port forwarding, tunnel server and tunnel client",
    after_help = "Examples:\n  \
        # Direct port forwarding\n  \
        terracotta --local 8080 --remote example.com --port 80\n\n  \
        # Run tunnel server\n  \
        terracotta --mode server --server 9090\n\n  \
        # Run tunnel client\n  \
        terracotta --mode client --local 8080 --remote tunnelserver.com --server 9090"
)]
pub struct CliArgs {
    /// Mode: server, client, or local
    #[arg(long, value_enum, default_value_t = Mode::Local)]
    pub mode: Mode,

    /// Local port to listen on
    #[arg(long = "local", default_value_t = 8080)]
    pub local_port: u16,

    /// Remote address to connect to
    #[arg(long = "remote", default_value = "localhost")]
    pub remote_addr: String,

    /// Remote port to connect to
    #[arg(long = "port", default_value_t = 80)]
    pub remote_port: u16,

    /// Server port for tunneling
    #[arg(long = "server", default_value_t = 9090)]
    pub server_port: u16,

    /// Enable verbose logging
    #[arg(long, default_value_t = false)]
    pub verbose: bool,

    /// Log mode: trace, debug, info, warn, error
    #[arg(long, default_value = "info")]
    pub log_mode: String,

    /// Interface the listeners bind to
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub bind: IpAddr,

    // ==================== Performance Tuning ====================
    /// Connect timeout for outbound dials (e.g., "10s")
    #[arg(long, default_value = "10s", value_parser = parse_duration, help_heading = "Performance")]
    pub connect_timeout: Duration,

    /// Maximum time to wait for in-flight connections on shutdown
    #[arg(long, default_value = "5s", value_parser = parse_duration, help_heading = "Performance")]
    pub shutdown_grace: Duration,

    /// Idle time a relay keeps the open direction alive after the other side closed
    #[arg(long, default_value = "2s", value_parser = parse_duration, help_heading = "Performance")]
    pub relay_linger: Duration,

    /// Maximum concurrent connections, 0 = unlimited
    #[arg(long, default_value_t = 0, help_heading = "Performance")]
    pub max_connections: usize,

    /// Read buffer size in bytes for the echo loop
    #[arg(long, default_value_t = 4096, help_heading = "Performance")]
    pub buffer_size: usize,

    /// TCP listen backlog for pending connections
    #[arg(long, default_value_t = 1024, help_heading = "Performance")]
    pub tcp_backlog: i32,

    /// Enable TCP_NODELAY for lower latency
    #[arg(
        long,
        default_value_t = true,
        action = clap::ArgAction::Set,
        help_heading = "Performance"
    )]
    pub tcp_nodelay: bool,
}

impl CliArgs {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate the CLI arguments
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| -> Result<()> { Err(TerracottaError::Config(msg)) };

        if matches!(self.mode, Mode::Local | Mode::Client) && self.remote_addr.is_empty() {
            return invalid(format!("Remote address is required in {} mode", self.mode));
        }
        if self.connect_timeout.is_zero() {
            return invalid("connect_timeout must be greater than 0".to_string());
        }
        if self.relay_linger.is_zero() {
            return invalid("relay_linger must be greater than 0".to_string());
        }
        if self.buffer_size == 0 {
            return invalid("buffer_size must be greater than 0".to_string());
        }
        if self.tcp_backlog <= 0 {
            return invalid("tcp_backlog must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Connection performance configuration
#[derive(Debug, Clone, Copy)]
pub struct ConnConfig {
    /// TCP connect timeout
    pub connect_timeout: Duration,
    /// Grace period for in-flight connections on shutdown
    pub shutdown_grace: Duration,
    /// Idle limit for the open relay direction after the other one closed
    pub relay_linger: Duration,
    /// Concurrent connection limit (0 = unlimited)
    pub max_connections: usize,
    /// Buffer size for the echo loop
    pub buffer_size: usize,
    /// TCP listen backlog
    pub tcp_backlog: i32,
    /// Enable TCP_NODELAY
    pub tcp_nodelay: bool,
}

impl Default for ConnConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(5),
            relay_linger: DEFAULT_LINGER,
            max_connections: 0,
            buffer_size: 4096,
            tcp_backlog: 1024,
            tcp_nodelay: true,
        }
    }
}

impl ConnConfig {
    /// Create from CLI args
    pub fn from_cli(cli: &CliArgs) -> Self {
        Self {
            connect_timeout: cli.connect_timeout,
            shutdown_grace: cli.shutdown_grace,
            relay_linger: cli.relay_linger,
            max_connections: cli.max_connections,
            buffer_size: cli.buffer_size,
            tcp_backlog: cli.tcp_backlog,
            tcp_nodelay: cli.tcp_nodelay,
        }
    }
}

/// Immutable runtime configuration, read once at startup
#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    pub local_port: u16,
    pub remote_addr: String,
    pub remote_port: u16,
    pub server_port: u16,
    pub verbose: bool,
    pub bind: IpAddr,
    pub conn: ConnConfig,
}

impl Config {
    /// Build the runtime config from validated CLI args
    pub fn from_cli(cli: &CliArgs) -> Self {
        Self {
            mode: cli.mode,
            local_port: cli.local_port,
            remote_addr: cli.remote_addr.clone(),
            remote_port: cli.remote_port,
            server_port: cli.server_port,
            verbose: cli.verbose,
            bind: cli.bind,
            conn: ConnConfig::from_cli(cli),
        }
    }

    /// Address the local listener binds to (local and client modes)
    pub fn local_listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.local_port)
    }

    /// Address the tunnel server listener binds to (server mode)
    pub fn server_listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.server_port)
    }

    /// Forwarding target in local mode
    pub fn remote_target(&self) -> String {
        host_port(&self.remote_addr, self.remote_port)
    }

    /// Tunnel server address dialled in client mode
    pub fn tunnel_server_addr(&self) -> String {
        host_port(&self.remote_addr, self.server_port)
    }
}

/// `host:port`, bracketing IPv6 literals
fn host_port(host: &str, port: u16) -> String {
    match host.parse::<Ipv6Addr>() {
        Ok(ip) => SocketAddr::new(IpAddr::V6(ip), port).to_string(),
        Err(_) => format!("{}:{}", host, port),
    }
}
