//! End-to-end tests for the three modes on loopback ephemeral ports

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use terracotta::app::App;
use terracotta::config::{Config, ConnConfig, Mode};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(5);

fn config(mode: Mode, remote_port: u16, server_port: u16) -> Arc<Config> {
    Arc::new(Config {
        mode,
        local_port: 0,
        remote_addr: "127.0.0.1".to_string(),
        remote_port,
        server_port,
        verbose: false,
        bind: IpAddr::V4(Ipv4Addr::LOCALHOST),
        conn: ConnConfig {
            connect_timeout: Duration::from_secs(2),
            shutdown_grace: Duration::from_secs(1),
            relay_linger: Duration::from_millis(200),
            ..ConnConfig::default()
        },
    })
}

/// Plain echo service standing in for a remote target
async fn spawn_echo_service() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let (mut r, mut w) = stream.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
        }
    });
    addr
}

/// Port nothing listens on
fn dead_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

struct Running {
    addr: SocketAddr,
    stats: Arc<terracotta::core::Stats>,
    shutdown: CancellationToken,
    task: JoinHandle<anyhow::Result<()>>,
}

async fn start(config: Arc<Config>) -> Running {
    let shutdown = CancellationToken::new();
    let app = App::start(config, shutdown.clone()).await.unwrap();
    let addr = app.local_addr().unwrap();
    let stats = app.stats();
    let task = tokio::spawn(app.run());
    Running {
        addr,
        stats,
        shutdown,
        task,
    }
}

impl Running {
    async fn stop(self) -> anyhow::Result<()> {
        self.shutdown.cancel();
        timeout(WAIT, self.task)
            .await
            .expect("app should stop")
            .unwrap()
    }
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    timeout(WAIT, async {
        while !cond() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

async fn expect_closed(stream: &mut TcpStream) {
    let mut buf = [0u8; 1];
    let n = timeout(WAIT, stream.read(&mut buf))
        .await
        .expect("connection should be closed")
        .unwrap_or(0);
    assert_eq!(n, 0);
}

#[tokio::test]
async fn local_mode_forwards_both_ways() {
    let echo = spawn_echo_service().await;
    let app = start(config(Mode::Local, echo.port(), 0)).await;

    let mut client = TcpStream::connect(app.addr).await.unwrap();
    client.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    timeout(WAIT, client.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"ping");
    drop(client);

    let stats = Arc::clone(&app.stats);
    wait_until(|| stats.snapshot().active == 0).await;
    let snap = stats.snapshot();
    assert_eq!(snap.total, 1);
    assert!(snap.bytes_sent >= 4);
    assert!(snap.bytes_received >= 4);

    app.stop().await.unwrap();
}

#[tokio::test]
async fn local_mode_preserves_order_for_large_payload() {
    let echo = spawn_echo_service().await;
    let app = start(config(Mode::Local, echo.port(), 0)).await;

    let payload: Vec<u8> = (0..256 * 1024).map(|i| (i % 251) as u8).collect();
    let client = TcpStream::connect(app.addr).await.unwrap();
    let (mut r, mut w) = client.into_split();

    let writer = {
        let payload = payload.clone();
        tokio::spawn(async move {
            w.write_all(&payload).await.unwrap();
            w.shutdown().await.unwrap();
        })
    };

    let mut back = Vec::new();
    timeout(WAIT, r.read_to_end(&mut back))
        .await
        .expect("echo should complete")
        .unwrap();
    writer.await.unwrap();
    assert_eq!(back, payload);

    let stats = Arc::clone(&app.stats);
    wait_until(|| stats.snapshot().active == 0).await;
    assert_eq!(stats.snapshot().bytes_sent, payload.len() as u64);
    assert_eq!(stats.snapshot().bytes_received, payload.len() as u64);

    app.stop().await.unwrap();
}

#[tokio::test]
async fn local_mode_dial_failure_keeps_serving() {
    let app = start(config(Mode::Local, dead_port(), 0)).await;

    let mut first = TcpStream::connect(app.addr).await.unwrap();
    expect_closed(&mut first).await;

    let stats = Arc::clone(&app.stats);
    wait_until(|| stats.snapshot().total == 1 && stats.snapshot().active == 0).await;

    // the listener is still accepting
    let mut second = TcpStream::connect(app.addr).await.unwrap();
    expect_closed(&mut second).await;
    wait_until(|| stats.snapshot().total == 2 && stats.snapshot().active == 0).await;

    app.stop().await.unwrap();
}

#[tokio::test]
async fn server_mode_echoes() {
    let app = start(config(Mode::Server, 0, 0)).await;

    let mut client = TcpStream::connect(app.addr).await.unwrap();
    client.write_all(b"hello").await.unwrap();
    let mut buf = [0u8; 5];
    timeout(WAIT, client.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"hello");
    drop(client);

    let stats = Arc::clone(&app.stats);
    wait_until(|| stats.snapshot().active == 0).await;
    let snap = stats.snapshot();
    assert_eq!(snap.total, 1);
    assert_eq!(snap.bytes_sent, 5);
    assert_eq!(snap.bytes_received, 5);

    app.stop().await.unwrap();
}

#[tokio::test]
async fn active_count_tracks_open_connections() {
    let app = start(config(Mode::Server, 0, 0)).await;
    let stats = Arc::clone(&app.stats);

    let mut clients = Vec::new();
    for _ in 0..5 {
        let mut c = TcpStream::connect(app.addr).await.unwrap();
        // round trip so the handler is known to be running
        c.write_all(b".").await.unwrap();
        let mut buf = [0u8; 1];
        c.read_exact(&mut buf).await.unwrap();
        clients.push(c);
    }
    assert_eq!(stats.snapshot().active, 5);
    assert_eq!(stats.snapshot().total, 5);

    clients.truncate(2);
    wait_until(|| stats.snapshot().active == 2).await;

    drop(clients);
    wait_until(|| stats.snapshot().active == 0).await;
    assert_eq!(stats.snapshot().total, 5);

    app.stop().await.unwrap();
}

#[tokio::test]
async fn shutdown_closes_listener_and_sessions() {
    let app = start(config(Mode::Server, 0, 0)).await;
    let addr = app.addr;

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(b"x").await.unwrap();
    let mut buf = [0u8; 1];
    client.read_exact(&mut buf).await.unwrap();

    app.stop().await.unwrap();

    expect_closed(&mut client).await;
    assert!(TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn client_mode_through_tunnel_server() {
    let server = start(config(Mode::Server, 0, 0)).await;
    let client = start(config(Mode::Client, 0, server.addr.port())).await;

    for msg in [&b"first"[..], &b"second"[..]] {
        let mut local = TcpStream::connect(client.addr).await.unwrap();
        local.write_all(msg).await.unwrap();
        let mut buf = vec![0u8; msg.len()];
        timeout(WAIT, local.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(buf, msg);
        drop(local);

        let stats = Arc::clone(&client.stats);
        wait_until(|| stats.snapshot().active == 0).await;
    }

    // one upstream connection carried both local connections
    assert_eq!(server.stats.snapshot().total, 1);
    assert_eq!(client.stats.snapshot().total, 2);

    client.stop().await.unwrap();
    server.stop().await.unwrap();
}

#[tokio::test]
async fn client_mode_reply_after_half_close() {
    let server = start(config(Mode::Server, 0, 0)).await;
    let client = start(config(Mode::Client, 0, server.addr.port())).await;

    let mut local = TcpStream::connect(client.addr).await.unwrap();
    local.write_all(b"hello").await.unwrap();
    local.shutdown().await.unwrap();

    let mut back = Vec::new();
    timeout(WAIT, local.read_to_end(&mut back))
        .await
        .expect("reply should arrive before the connection closes")
        .unwrap();
    assert_eq!(back, b"hello");

    let stats = Arc::clone(&client.stats);
    wait_until(|| stats.snapshot().active == 0).await;

    // nothing left over in the tunnel for the next connection
    let mut next = TcpStream::connect(client.addr).await.unwrap();
    let mut buf = [0u8; 1];
    let early = timeout(Duration::from_millis(300), next.read(&mut buf)).await;
    assert!(early.is_err());

    next.write_all(b"again").await.unwrap();
    let mut buf = [0u8; 5];
    timeout(WAIT, next.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"again");
    drop(next);

    client.stop().await.unwrap();
    server.stop().await.unwrap();
}

#[tokio::test]
async fn client_mode_fails_without_tunnel_server() {
    let shutdown = CancellationToken::new();
    let res = App::start(config(Mode::Client, 0, dead_port()), shutdown).await;
    assert!(res.is_err());
}

#[tokio::test]
async fn client_mode_stops_when_tunnel_is_lost() {
    let server = start(config(Mode::Server, 0, 0)).await;
    let client = start(config(Mode::Client, 0, server.addr.port())).await;

    server.stop().await.unwrap();

    // the next bridged connection sees the closed upstream
    let mut local = TcpStream::connect(client.addr).await.unwrap();
    expect_closed(&mut local).await;

    let res = timeout(WAIT, client.task)
        .await
        .expect("client should shut itself down")
        .unwrap();
    let err = res.unwrap_err();
    assert!(err.to_string().contains("Tunnel connection"));
}

#[tokio::test]
async fn bind_failure_is_fatal() {
    let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let mut cfg = (*config(Mode::Server, 0, 0)).clone();
    cfg.server_port = taken.local_addr().unwrap().port();

    let res = App::start(Arc::new(cfg), CancellationToken::new()).await;
    assert!(res.is_err());
}
