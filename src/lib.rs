//! Terracotta TCP tunneling
//!
//! Architecture:
//! - `core/`: Stats, bidirectional relay and the server session registry
//! - `handler/`: Per-mode connection handlers (local forward, echo server, tunnel client)
//! - `runner`: Listener setup, outbound dialing and the accept loop
//! - `lifecycle`: Stats reporter, signal handling and shutdown drain
//! - `app`: Mode wiring

pub mod app;
pub mod config;
pub mod core;
pub mod error;
pub mod handler;
pub mod lifecycle;
pub mod logger;
pub mod runner;
