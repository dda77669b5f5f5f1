//! Core relay module
//!
//! This module contains the pieces every mode shares:
//! - Traffic statistics
//! - Bidirectional relay
//! - Session registry for server-mode shutdown

pub mod registry;
pub mod relay;
pub mod stats;

pub use registry::{SessionId, SessionRegistry};
pub use relay::{relay, relay_reclaim, LegEnd, RelayOptions, RelayOutcome, Teardown, DEFAULT_LINGER};
pub use stats::{format_bytes, format_uptime, ConnectionGuard, Stats, StatsSnapshot};
