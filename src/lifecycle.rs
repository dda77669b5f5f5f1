//! Process lifecycle: stats reporting, signal handling and shutdown
//!
//! Shutdown order:
//! 1. cancel the shutdown token (accept loops return, relays stop)
//! 2. close every registered server session
//! 3. wait for tracked handler tasks, bounded by the grace period

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::core::{SessionRegistry, Stats, StatsSnapshot};
use crate::error::Result;
use crate::logger::log;

/// Stats reporting interval
pub const STATS_INTERVAL: Duration = Duration::from_secs(5);

/// Idle trackers stay quiet unless verbose
pub fn should_report(snapshot: &StatsSnapshot, verbose: bool) -> bool {
    verbose || snapshot.active > 0
}

/// Print a stats line to stdout every `period` until `shutdown` fires
pub fn spawn_stats_reporter(
    stats: Arc<Stats>,
    verbose: bool,
    period: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        // First report after one full period
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let snapshot = stats.snapshot();
                    if should_report(&snapshot, verbose) {
                        println!("{}", snapshot);
                    }
                }
                _ = shutdown.cancelled() => {
                    log::debug!("Stats reporter stopped");
                    break;
                }
            }
        }
    })
}

/// Wait for SIGINT or SIGTERM
#[cfg(unix)]
pub async fn wait_for_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::select! {
        _ = sigint.recv() => {
            log::info!("SIGINT received, shutting down...");
        }
        _ = sigterm.recv() => {
            log::info!("SIGTERM received, shutting down...");
        }
    }
    Ok(())
}

/// Wait for Ctrl-C
#[cfg(not(unix))]
pub async fn wait_for_signal() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    log::info!("Shutdown signal received...");
    Ok(())
}

/// Print `notice` and cancel `shutdown` on the first termination signal
pub fn spawn_signal_watcher(shutdown: CancellationToken, notice: &'static str) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            res = wait_for_signal() => {
                if let Err(e) = res {
                    log::error!(error = %e, "Failed to install signal handlers");
                    return;
                }
                println!("\n{}", notice);
                shutdown.cancel();
            }
            _ = shutdown.cancelled() => {}
        }
    })
}

/// Stop everything tied to `shutdown` and wait for in-flight connections
///
/// Returns `true` if every handler finished within `grace`. Handlers still
/// running afterwards are abandoned.
pub async fn drain(
    shutdown: &CancellationToken,
    registry: Option<&SessionRegistry>,
    tracker: &TaskTracker,
    grace: Duration,
) -> bool {
    shutdown.cancel();

    if let Some(registry) = registry {
        let closed = registry.close_all();
        if closed > 0 {
            log::info!(sessions = closed, "Closed tunnel sessions");
        }
    }

    tracker.close();
    match tokio::time::timeout(grace, tracker.wait()).await {
        Ok(()) => {
            log::debug!("All connections drained");
            true
        }
        Err(_) => {
            log::warn!(
                remaining = tracker.len(),
                grace = ?grace,
                "Shutdown grace period elapsed, abandoning connections"
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(active: u64) -> StatsSnapshot {
        StatsSnapshot {
            active,
            total: active,
            bytes_sent: 0,
            bytes_received: 0,
            uptime: Duration::ZERO,
        }
    }

    #[test]
    fn test_should_report() {
        assert!(!should_report(&snapshot(0), false));
        assert!(should_report(&snapshot(0), true));
        assert!(should_report(&snapshot(3), false));
    }

    #[test]
    fn test_stats_interval() {
        assert_eq!(STATS_INTERVAL, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_reporter_stops_on_shutdown() {
        let shutdown = CancellationToken::new();
        let handle = spawn_stats_reporter(
            Arc::new(Stats::new()),
            true,
            Duration::from_millis(10),
            shutdown.clone(),
        );

        tokio::time::sleep(Duration::from_millis(35)).await;
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("reporter should stop")
            .unwrap();
    }

    #[tokio::test]
    async fn test_drain_waits_for_tasks() {
        let shutdown = CancellationToken::new();
        let tracker = TaskTracker::new();

        for _ in 0..3 {
            let token = shutdown.clone();
            tracker.spawn(async move {
                token.cancelled().await;
                tokio::time::sleep(Duration::from_millis(10)).await;
            });
        }

        assert!(drain(&shutdown, None, &tracker, Duration::from_secs(5)).await);
        assert!(shutdown.is_cancelled());
        assert!(tracker.is_empty());
    }

    #[tokio::test]
    async fn test_drain_closes_sessions() {
        let shutdown = CancellationToken::new();
        let tracker = TaskTracker::new();
        let registry = SessionRegistry::new();
        // session token detached from the shutdown token
        let (_, session) = registry.register("127.0.0.1:1".to_string(), &CancellationToken::new());

        tracker.spawn({
            let session = session.clone();
            async move { session.cancelled().await }
        });

        assert!(drain(&shutdown, Some(&registry), &tracker, Duration::from_secs(5)).await);
        assert!(session.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_gives_up_after_grace() {
        let shutdown = CancellationToken::new();
        let tracker = TaskTracker::new();
        tracker.spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });

        assert!(!drain(&shutdown, None, &tracker, Duration::from_millis(100)).await);
        assert_eq!(tracker.len(), 1);
    }
}
