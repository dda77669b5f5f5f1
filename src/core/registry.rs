//! Session registry for server mode
//!
//! Tracks accepted connections by remote address so shutdown can close them.
//! Nothing routes through it.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::logger::log;

/// Unique session identifier
pub type SessionId = u64;

/// Handle of a live session
#[derive(Debug)]
struct Session {
    id: SessionId,
    cancel_token: CancellationToken,
    connected_at: Instant,
}

/// Address-keyed table of live sessions
#[derive(Debug, Clone)]
pub struct SessionRegistry {
    next_id: Arc<AtomicU64>,
    sessions: Arc<DashMap<String, Session>>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            next_id: Arc::new(AtomicU64::new(1)),
            sessions: Arc::new(DashMap::new()),
        }
    }

    /// Register a session and return its ID and the token that closes it
    ///
    /// The token is a child of `parent`, so cancelling the parent closes
    /// every session as well.
    pub fn register(
        &self,
        peer_addr: String,
        parent: &CancellationToken,
    ) -> (SessionId, CancellationToken) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel_token = parent.child_token();
        let session = Session {
            id,
            cancel_token: cancel_token.clone(),
            connected_at: Instant::now(),
        };
        if let Some(stale) = self.sessions.insert(peer_addr.clone(), session) {
            // Same address and port reused before the old entry was removed
            log::debug!(peer = %peer_addr, "Replacing stale session");
            stale.cancel_token.cancel();
        }
        (id, cancel_token)
    }

    /// Remove a session; returns how long it was connected
    ///
    /// Only removes the entry if it still belongs to `id`, so a late
    /// unregister cannot drop a newer session for the same address.
    pub fn unregister(&self, peer_addr: &str, id: SessionId) -> Option<Duration> {
        self.sessions
            .remove_if(peer_addr, |_, session| session.id == id)
            .map(|(_, session)| session.connected_at.elapsed())
    }

    /// Close every registered session; returns how many were closed
    pub fn close_all(&self) -> usize {
        // Collect first so no shard lock is held while handlers wake up
        let tokens: Vec<(String, CancellationToken)> = self
            .sessions
            .iter()
            .map(|e| (e.key().clone(), e.value().cancel_token.clone()))
            .collect();

        for (peer, token) in &tokens {
            log::debug!(peer = %peer, "Closing connection");
            token.cancel();
        }
        tokens.len()
    }

    /// Number of live sessions
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
