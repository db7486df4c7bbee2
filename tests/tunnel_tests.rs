//! End-to-end tests of the acceptor, pool and relay over an in-memory
//! mux dialer.
mod common;

use common::MockDialer;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use udptun::{client, Config, ControlCommand, FecSetting, TunnelStats};

const WAIT: Duration = Duration::from_secs(5);

struct TestClient {
    addr: std::net::SocketAddr,
    control: mpsc::Sender<ControlCommand>,
    shards: Arc<FecSetting>,
    dialer: Arc<MockDialer>,
}

async fn start_client(config: Config) -> TestClient {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let dialer = Arc::new(MockDialer::new());
    let shards = Arc::new(FecSetting::new(config.data_shard, config.parity_shard));
    let (control, control_rx) = mpsc::channel(16);
    let stats = Arc::new(TunnelStats::default());

    let serve_dialer = dialer.clone();
    let serve_shards = shards.clone();
    tokio::spawn(async move {
        let _ = client::serve(listener, config, serve_dialer, control_rx, serve_shards, stats).await;
    });

    TestClient {
        addr,
        control,
        shards,
        dialer,
    }
}

/// Connect and consume the session tag byte the mock server sends first.
async fn connect_tagged(addr: std::net::SocketAddr) -> (TcpStream, u8) {
    let mut conn = TcpStream::connect(addr).await.unwrap();
    let mut tag = [0u8; 1];
    timeout(WAIT, conn.read_exact(&mut tag))
        .await
        .expect("tag timed out")
        .unwrap();
    (conn, tag[0])
}

#[tokio::test]
async fn test_echo_round_trip() {
    let client = start_client(Config {
        quiet: true,
        ..Config::default()
    })
    .await;

    let (mut conn, _) = connect_tagged(client.addr).await;
    conn.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    timeout(WAIT, conn.read_exact(&mut buf))
        .await
        .expect("echo timed out")
        .unwrap();
    assert_eq!(&buf, b"ping");
}

#[tokio::test]
async fn test_slots_used_round_robin() {
    let client = start_client(Config {
        conn: 2,
        quiet: true,
        ..Config::default()
    })
    .await;

    let mut tags = Vec::new();
    let mut conns = Vec::new();
    for _ in 0..4 {
        let (conn, tag) = connect_tagged(client.addr).await;
        tags.push(tag);
        conns.push(conn);
    }
    assert_eq!(tags, vec![0, 1, 0, 1]);
    assert_eq!(client.dialer.dials.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_large_transfer_is_byte_exact() {
    let client = start_client(Config {
        quiet: true,
        ..Config::default()
    })
    .await;

    let payload: Vec<u8> = (0..64 * 1024u32).map(|i| (i % 251) as u8).collect();
    let (mut conn, _) = connect_tagged(client.addr).await;

    let (mut read_half, mut write_half) = conn.split();
    let writer = async {
        write_half.write_all(&payload).await.unwrap();
        write_half.flush().await.unwrap();
    };
    let reader = async {
        let mut got = vec![0u8; payload.len()];
        timeout(Duration::from_secs(30), read_half.read_exact(&mut got))
            .await
            .expect("transfer timed out")
            .unwrap();
        got
    };
    let (_, got) = tokio::join!(writer, reader);
    assert_eq!(got, payload);
}

#[tokio::test]
async fn test_close_propagates_to_local_side() {
    let client = start_client(Config {
        quiet: true,
        ..Config::default()
    })
    .await;

    let (mut conn, _) = connect_tagged(client.addr).await;
    conn.write_all(b"bye").await.unwrap();
    let mut buf = [0u8; 3];
    timeout(WAIT, conn.read_exact(&mut buf))
        .await
        .expect("echo timed out")
        .unwrap();

    // half-close our side; the relay tears the pair down and we observe EOF
    conn.shutdown().await.unwrap();
    let mut rest = Vec::new();
    let n = timeout(WAIT, conn.read_to_end(&mut rest))
        .await
        .expect("close did not propagate")
        .unwrap();
    assert_eq!(n, 0);
}

#[tokio::test]
async fn test_fec_command_reaches_live_tunnels_before_next_stream() {
    let client = start_client(Config {
        quiet: true,
        ..Config::default()
    })
    .await;

    // force the first dial
    let (_conn, tag) = connect_tagged(client.addr).await;
    assert_eq!(tag, 0);

    client
        .control
        .send(ControlCommand::ReconfigureFec {
            data_shards: 20,
            parity_shards: 5,
        })
        .await
        .unwrap();

    // the next accepted connection sees the new setting already applied
    let (_conn2, _) = connect_tagged(client.addr).await;
    assert_eq!(client.shards.get(), (20, 5));
    let mut rxs = client.dialer.fec_rxs.lock().unwrap();
    assert_eq!(rxs[0].try_recv().unwrap(), (20, 5));
}

#[tokio::test]
async fn test_autoexpire_refills_while_old_streams_continue() {
    let client = start_client(Config {
        conn: 1,
        auto_expire: 1,
        scavenge_ttl: 600,
        quiet: true,
        ..Config::default()
    })
    .await;

    let (mut first, tag0) = connect_tagged(client.addr).await;
    assert_eq!(tag0, 0);

    tokio::time::sleep(Duration::from_millis(1500)).await;

    // slot expired: the next accept dials a fresh session
    let (_second, tag1) = connect_tagged(client.addr).await;
    assert_eq!(tag1, 1);
    assert_eq!(client.dialer.dials.load(Ordering::SeqCst), 2);

    // the stream on the expired session keeps working
    first.write_all(b"still here").await.unwrap();
    let mut buf = [0u8; 10];
    timeout(WAIT, first.read_exact(&mut buf))
        .await
        .expect("old stream died")
        .unwrap();
    assert_eq!(&buf, b"still here");
}
