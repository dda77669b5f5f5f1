//! Process-wide traffic statistics
//!
//! Tracks active/total connections and bytes relayed in each direction.
//! All counters live behind one read-write lock so a snapshot is consistent
//! as of a single instant.

use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::logger::log;

#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    active: u64,
    total: u64,
    bytes_sent: u64,
    bytes_received: u64,
}

/// Statistics snapshot taken under a single lock acquisition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Currently open connections
    pub active: u64,
    /// Connections accepted since start
    pub total: u64,
    /// Bytes written towards the remote/tunnel side
    pub bytes_sent: u64,
    /// Bytes written back towards the accepted side
    pub bytes_received: u64,
    /// Time since the tracker was created
    pub uptime: Duration,
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Stats - Active: {}, Total: {}, Sent: {}, Received: {}, Uptime: {}",
            self.active,
            self.total,
            format_bytes(self.bytes_sent),
            format_bytes(self.bytes_received),
            format_uptime(self.uptime)
        )
    }
}

/// Thread-safe connection and traffic counters
#[derive(Debug)]
pub struct Stats {
    started_at: Instant,
    counters: RwLock<Counters>,
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

impl Stats {
    /// Create a new tracker; uptime starts now
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            counters: RwLock::new(Counters::default()),
        }
    }

    /// Record a new connection (active and total move together)
    pub fn add_connection(&self) {
        let mut c = self.counters.write();
        c.active += 1;
        c.total += 1;
    }

    /// Record a closed connection
    pub fn remove_connection(&self) {
        let mut c = self.counters.write();
        match c.active.checked_sub(1) {
            Some(active) => c.active = active,
            None => log::warn!("remove_connection called with no active connections"),
        }
    }

    /// Add relayed bytes to the cumulative counters
    pub fn add_bytes(&self, sent: u64, received: u64) {
        if sent == 0 && received == 0 {
            return;
        }
        let mut c = self.counters.write();
        c.bytes_sent += sent;
        c.bytes_received += received;
    }

    /// Consistent view of all counters
    pub fn snapshot(&self) -> StatsSnapshot {
        let c = *self.counters.read();
        StatsSnapshot {
            active: c.active,
            total: c.total,
            bytes_sent: c.bytes_sent,
            bytes_received: c.bytes_received,
            uptime: self.uptime(),
        }
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Count a connection for as long as the returned guard lives
    pub fn connection_guard(self: &Arc<Self>) -> ConnectionGuard {
        self.add_connection();
        ConnectionGuard {
            stats: Arc::clone(self),
        }
    }
}

/// Decrements the active count exactly once, on drop
#[must_use = "the connection is uncounted as soon as the guard is dropped"]
pub struct ConnectionGuard {
    stats: Arc<Stats>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.stats.remove_connection();
    }
}

/// Format bytes with binary units and one decimal place ("512 B", "1.5 KB")
pub fn format_bytes(bytes: u64) -> String {
    const UNIT: u64 = 1024;
    const PREFIXES: [char; 6] = ['K', 'M', 'G', 'T', 'P', 'E'];

    if bytes < UNIT {
        return format!("{} B", bytes);
    }

    let mut div = UNIT;
    let mut exp = 0;
    let mut n = bytes / UNIT;
    while n >= UNIT {
        div *= UNIT;
        exp += 1;
        n /= UNIT;
    }
    format!("{:.1} {}B", bytes as f64 / div as f64, PREFIXES[exp])
}

/// Format uptime rounded to whole seconds ("1h 2m 3s")
pub fn format_uptime(uptime: Duration) -> String {
    let secs = (uptime.as_millis() + 500) / 1000;
    humantime::format_duration(Duration::from_secs(secs as u64)).to_string()
}
