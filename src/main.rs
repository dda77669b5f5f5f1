//! Terracotta binary entry point

// Use mimalloc as the global allocator for better performance
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::Result;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use terracotta::config::{CliArgs, Config};
use terracotta::logger::{self, log};
use terracotta::{app, lifecycle};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments (exits on invalid flags or mode)
    let cli = CliArgs::parse_args();
    cli.validate()?;

    // Initialize logger
    logger::init_logger(&cli.log_mode, cli.verbose);

    println!("{}", app::banner(env!("CARGO_PKG_VERSION")));
    println!("Starting Terracotta in {} mode...\n", cli.mode);

    let config = Arc::new(Config::from_cli(&cli));
    log::debug!(config = ?config, "Configuration loaded");

    // Create cancellation token for graceful shutdown
    let shutdown = CancellationToken::new();
    lifecycle::spawn_signal_watcher(shutdown.clone(), app::shutdown_notice(cli.mode));

    app::run(config, shutdown).await
}
