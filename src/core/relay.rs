//! Bidirectional relay with traffic statistics
//!
//! Copies bytes between an inbound and an outbound stream in both directions,
//! one task per direction. Bytes are counted as the destination accepts them,
//! so a leg that fails or is stopped half-way still reports what it moved.
//!
//! Once one leg reaches end-of-stream the other keeps running only while data
//! moves: it is stopped after `linger` without progress, so a peer that never
//! closes cannot pin the relay.

use pin_project_lite::pin_project;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::stats::Stats;
use crate::logger::log;

/// Copy buffer size per leg
pub const RELAY_BUFFER_SIZE: usize = 32 * 1024;

/// Idle time allowed to the remaining leg after the other one hit end-of-stream
pub const DEFAULT_LINGER: Duration = Duration::from_secs(2);

/// How a relay reacts when one leg finishes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Teardown {
    /// End-of-stream on either side is forwarded as a write shutdown.
    #[default]
    HalfClose,
    /// The outbound stream outlives the relay. Inbound end-of-stream is not
    /// forwarded to it; outbound end-of-stream stops both legs.
    KeepOutbound,
}

/// What a leg does after reading end-of-stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OnEof {
    /// Shut down the destination write side, let the other leg linger
    Shutdown,
    /// Leave the destination open, let the other leg linger
    Keep,
    /// Stop the other leg immediately
    StopBoth,
}

impl Teardown {
    /// Actions for the (inbound -> outbound, outbound -> inbound) legs
    fn eof_actions(self) -> (OnEof, OnEof) {
        match self {
            Teardown::HalfClose => (OnEof::Shutdown, OnEof::Shutdown),
            Teardown::KeepOutbound => (OnEof::Keep, OnEof::StopBoth),
        }
    }
}

/// Relay behaviour
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayOptions {
    pub teardown: Teardown,
    /// Idle limit for the remaining leg once the other reached end-of-stream
    pub linger: Duration,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            teardown: Teardown::default(),
            linger: DEFAULT_LINGER,
        }
    }
}

impl RelayOptions {
    pub fn new(teardown: Teardown, linger: Duration) -> Self {
        Self { teardown, linger }
    }
}

/// Why a leg stopped copying
#[derive(Debug)]
pub enum LegEnd {
    /// Source reached end-of-stream
    Eof,
    /// Reading the source failed
    ReadFailed(io::Error),
    /// Writing the destination failed
    WriteFailed(io::Error),
    /// Stopped by the other leg or by shutdown
    Stopped,
    /// Other leg finished and nothing moved for the linger period
    Lingered,
}

impl LegEnd {
    fn error(&self) -> Option<&io::Error> {
        match self {
            LegEnd::ReadFailed(e) | LegEnd::WriteFailed(e) => Some(e),
            LegEnd::Eof | LegEnd::Stopped | LegEnd::Lingered => None,
        }
    }
}

/// Result of a finished relay
#[derive(Debug)]
pub struct RelayOutcome {
    /// Bytes moved inbound -> outbound
    pub sent: u64,
    /// Bytes moved outbound -> inbound
    pub received: u64,
    /// How the inbound -> outbound leg ended
    pub upstream: LegEnd,
    /// How the outbound -> inbound leg ended
    pub downstream: LegEnd,
}

impl RelayOutcome {
    /// First error seen on either leg
    pub fn error(&self) -> Option<&io::Error> {
        self.upstream.error().or_else(|| self.downstream.error())
    }
}

pin_project! {
    /// Write half wrapper counting every byte the inner writer accepts
    struct MeteredWriter<W> {
        #[pin]
        inner: W,
        written: Arc<AtomicU64>,
    }
}

impl<W> MeteredWriter<W> {
    fn new(inner: W, written: Arc<AtomicU64>) -> Self {
        Self { inner, written }
    }

    fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: AsyncWrite> AsyncWrite for MeteredWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.project();
        let result = this.inner.poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &result {
            this.written.fetch_add(*n as u64, Ordering::Relaxed);
        }
        result
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}

/// Tokens shared by the two legs of one relay
#[derive(Clone)]
struct LegSignals {
    /// Stops both legs now
    pair: CancellationToken,
    /// Set once a leg reached end-of-stream
    half_done: CancellationToken,
    linger: Duration,
}

impl LegSignals {
    /// Resolves `linger` after the other leg finished; recreated per I/O step
    async fn linger_expired(&self) {
        self.half_done.cancelled().await;
        tokio::time::sleep(self.linger).await;
    }
}

/// Copy `reader` into `writer` until end-of-stream, failure, stop or linger
async fn copy_leg<R, W>(reader: &mut R, writer: &mut W, signals: &LegSignals) -> LegEnd
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];

    loop {
        let n = tokio::select! {
            res = reader.read(&mut buf) => match res {
                Ok(0) => return LegEnd::Eof,
                Ok(n) => n,
                Err(e) => return LegEnd::ReadFailed(e),
            },
            _ = signals.pair.cancelled() => return LegEnd::Stopped,
            _ = signals.linger_expired() => return LegEnd::Lingered,
        };

        tokio::select! {
            res = writer.write_all(&buf[..n]) => {
                if let Err(e) = res {
                    return LegEnd::WriteFailed(e);
                }
            }
            _ = signals.pair.cancelled() => return LegEnd::Stopped,
            _ = signals.linger_expired() => return LegEnd::Lingered,
        }
    }
}

/// Run one leg and apply the teardown policy to its ending
async fn run_leg<R, W>(
    mut reader: R,
    mut writer: W,
    on_eof: OnEof,
    signals: &LegSignals,
) -> (LegEnd, R, W)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let end = copy_leg(&mut reader, &mut writer, signals).await;

    match (&end, on_eof) {
        (LegEnd::Stopped | LegEnd::Lingered, _) => {}
        (LegEnd::Eof, OnEof::Shutdown) => {
            // Forward FIN; the other leg lingers while data still moves
            let _ = writer.shutdown().await;
            signals.half_done.cancel();
        }
        (LegEnd::Eof, OnEof::Keep) => signals.half_done.cancel(),
        _ => signals.pair.cancel(),
    }

    (end, reader, writer)
}

/// Which counter a leg credits
#[derive(Debug, Clone, Copy)]
enum Direction {
    Sent,
    Received,
}

/// Spawn one leg; it reports its byte count to `stats` as soon as it ends
fn spawn_leg<R, W>(
    reader: R,
    writer: W,
    direction: Direction,
    counter: Arc<AtomicU64>,
    on_eof: OnEof,
    signals: LegSignals,
    stats: Arc<Stats>,
) -> JoinHandle<(LegEnd, R, W)>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let writer = MeteredWriter::new(writer, Arc::clone(&counter));
        let (end, reader, writer) = run_leg(reader, writer, on_eof, &signals).await;

        let moved = counter.load(Ordering::Relaxed);
        match direction {
            Direction::Sent => stats.add_bytes(moved, 0),
            Direction::Received => stats.add_bytes(0, moved),
        }
        (end, reader, writer.into_inner())
    })
}

/// Relay bytes between `inbound` and `outbound` until both legs complete
///
/// - `inbound`: accepted stream; data read from it is credited as sent
/// - `outbound`: dialled/tunnel stream; data read from it is credited as received
/// - `options`: teardown policy and linger
/// - `cancel`: stops both legs (process shutdown)
///
/// Both streams are dropped when this returns.
pub async fn relay<A, B>(
    inbound: A,
    outbound: B,
    stats: &Arc<Stats>,
    options: RelayOptions,
    cancel: &CancellationToken,
) -> RelayOutcome
where
    A: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    B: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    relay_reclaim(inbound, outbound, stats, options, cancel)
        .await
        .0
}

/// Like [`relay`], but hands the outbound stream back
///
/// The outbound stream is `None` only if a leg task panicked.
pub async fn relay_reclaim<A, B>(
    inbound: A,
    outbound: B,
    stats: &Arc<Stats>,
    options: RelayOptions,
    cancel: &CancellationToken,
) -> (RelayOutcome, Option<B>)
where
    A: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    B: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (in_read, in_write) = tokio::io::split(inbound);
    let (out_read, out_write) = tokio::io::split(outbound);

    let sent = Arc::new(AtomicU64::new(0));
    let received = Arc::new(AtomicU64::new(0));

    // Stopping this token stops both legs; shutdown stops it from above
    let pair = cancel.child_token();
    // Legs run as their own tasks; stop them if this future is dropped
    let _stop_on_drop = pair.clone().drop_guard();

    let signals = LegSignals {
        pair: pair.clone(),
        half_done: CancellationToken::new(),
        linger: options.linger,
    };
    let (up_eof, down_eof) = options.teardown.eof_actions();

    let upstream = spawn_leg(
        in_read,
        out_write,
        Direction::Sent,
        Arc::clone(&sent),
        up_eof,
        signals.clone(),
        Arc::clone(stats),
    );
    let downstream = spawn_leg(
        out_read,
        in_write,
        Direction::Received,
        Arc::clone(&received),
        down_eof,
        signals,
        Arc::clone(stats),
    );

    let (upstream, downstream) = tokio::join!(
        join_leg(upstream, &pair),
        join_leg(downstream, &pair)
    );

    let sent = sent.load(Ordering::Relaxed);
    let received = received.load(Ordering::Relaxed);

    match (upstream, downstream) {
        (Some((up_end, in_read, out_write)), Some((down_end, out_read, in_write))) => {
            drop(in_read.unsplit(in_write));
            let outbound = out_read.unsplit(out_write);
            let outcome = RelayOutcome {
                sent,
                received,
                upstream: up_end,
                downstream: down_end,
            };
            (outcome, Some(outbound))
        }
        (upstream, downstream) => {
            let outcome = RelayOutcome {
                sent,
                received,
                upstream: upstream.map_or(LegEnd::Stopped, |(end, ..)| end),
                downstream: downstream.map_or(LegEnd::Stopped, |(end, ..)| end),
            };
            (outcome, None)
        }
    }
}

type LegResult<S, T> = (LegEnd, ReadHalf<S>, WriteHalf<T>);

/// Await a leg; a panicked leg stops its partner
async fn join_leg<S, T>(
    handle: JoinHandle<LegResult<S, T>>,
    pair: &CancellationToken,
) -> Option<LegResult<S, T>> {
    match handle.await {
        Ok(result) => Some(result),
        Err(e) => {
            log::error!(error = %e, "Relay leg task failed");
            pair.cancel();
            None
        }
    }
}
