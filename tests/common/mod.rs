//! Shared helpers for the integration tests.
use async_trait::async_trait;
use futures::future::poll_fn;
use futures::{AsyncReadExt, AsyncWriteExt};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::compat::TokioAsyncReadCompatExt;
use udptun::{FecControl, MuxConfig, MuxSession, Result, SessionDialer};

pub fn mux_config() -> MuxConfig {
    MuxConfig {
        version: 1,
        max_receive_buffer: 4 * 1024 * 1024,
        max_stream_buffer: 2 * 1024 * 1024,
        keep_alive: Duration::from_secs(10),
    }
}

/// Dials in-memory mux sessions backed by a tagging echo server: every
/// stream first receives one byte naming the session it runs on, then
/// an echo of everything it writes.
pub struct MockDialer {
    pub dials: AtomicUsize,
    pub fec_rxs: Mutex<Vec<mpsc::UnboundedReceiver<(usize, usize)>>>,
}

impl MockDialer {
    pub fn new() -> Self {
        Self {
            dials: AtomicUsize::new(0),
            fec_rxs: Mutex::new(Vec::new()),
        }
    }
}

impl Default for MockDialer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionDialer for MockDialer {
    async fn dial(&self) -> Result<(MuxSession, FecControl)> {
        let tag = self.dials.fetch_add(1, Ordering::SeqCst) as u8;
        let (near, far) = tokio::io::duplex(256 * 1024);
        tokio::spawn(tagged_echo_mux_server(far, tag));
        let session = MuxSession::spawn(near.compat(), &mux_config());
        let (fec, rx) = FecControl::channel();
        self.fec_rxs.lock().unwrap().push(rx);
        Ok((session, fec))
    }
}

async fn tagged_echo_mux_server(io: tokio::io::DuplexStream, tag: u8) {
    let mut connection =
        yamux::Connection::new(io.compat(), yamux::Config::default(), yamux::Mode::Server);
    while let Some(Ok(mut stream)) = poll_fn(|cx| connection.poll_next_inbound(cx)).await {
        tokio::spawn(async move {
            if stream.write_all(&[tag]).await.is_err() {
                return;
            }
            let mut buf = [0u8; 4096];
            loop {
                match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if stream.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                }
            }
            let _ = stream.close().await;
        });
    }
}
