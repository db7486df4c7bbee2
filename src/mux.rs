//! Stream-multiplexer client over a tunnel byte pipe.
//!
//! One driver task owns the yamux connection: it serves `open_stream`
//! requests and keeps polling inbound so stream I/O makes progress.
//! Keepalive probing lives in the transport driver (yamux exposes no
//! ping); when the tunnel dies the connection errors out here and the
//! session flips to closed.
use crate::config::{Config, MAX_SMUX_VERSION, MIN_STREAM_BUFFER};
use crate::error::{Result, TunnelError};
use futures::future::poll_fn;
use futures::{AsyncRead, AsyncWrite};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::debug;
use yamux::{Config as YamuxConfig, Connection, Mode, WindowUpdateMode};

/// Verified mux parameters.
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Mux protocol version, 1 or 2
    pub version: usize,
    /// Overall de-mux buffer in bytes
    pub max_receive_buffer: usize,
    /// Per-stream receive window in bytes, version 2 only
    pub max_stream_buffer: usize,
    /// Heartbeat interval, enforced by the transport driver
    pub keep_alive: Duration,
}

impl MuxConfig {
    pub fn from_config(config: &Config) -> Result<Self> {
        let mux = Self {
            version: config.smux_ver,
            max_receive_buffer: config.smux_buf,
            max_stream_buffer: config.stream_buf,
            keep_alive: Duration::from_secs(config.keep_alive),
        };
        mux.verify()?;
        Ok(mux)
    }

    pub fn verify(&self) -> Result<()> {
        if self.version == 0 || self.version > MAX_SMUX_VERSION {
            return Err(TunnelError::config(format!(
                "unsupported smux version: {}",
                self.version
            )));
        }
        if self.version >= 2 && self.max_stream_buffer < MIN_STREAM_BUFFER {
            return Err(TunnelError::config(format!(
                "stream buffer must be at least {} bytes",
                MIN_STREAM_BUFFER
            )));
        }
        if self.version >= 2 && self.max_receive_buffer < self.max_stream_buffer {
            return Err(TunnelError::config(
                "receive buffer must not be below the stream buffer",
            ));
        }
        if self.keep_alive.is_zero() {
            return Err(TunnelError::config("keepalive must be at least 1 second"));
        }
        Ok(())
    }

    fn to_yamux(&self) -> YamuxConfig {
        let mut cfg = YamuxConfig::default();
        cfg.set_max_buffer_size(self.max_receive_buffer);
        cfg.set_window_update_mode(WindowUpdateMode::OnRead);
        if self.version >= 2 {
            cfg.set_receive_window(self.max_stream_buffer as u32);
        }
        cfg
    }
}

type OpenReply = oneshot::Sender<Result<yamux::Stream>>;

/// Handle to one mux session. Cheap to clone; the session lives until
/// its peer goes away or [`MuxSession::close`] is called.
#[derive(Clone)]
pub struct MuxSession {
    open_tx: mpsc::Sender<OpenReply>,
    closed: Arc<AtomicBool>,
    close: Arc<Notify>,
}

impl MuxSession {
    /// Start a client-mode mux session over `io` and spawn its driver.
    pub fn spawn<T>(io: T, config: &MuxConfig) -> MuxSession
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (open_tx, open_rx) = mpsc::channel(16);
        let closed = Arc::new(AtomicBool::new(false));
        let close = Arc::new(Notify::new());
        let connection = Connection::new(io, config.to_yamux(), Mode::Client);
        tokio::spawn(drive(
            connection,
            open_rx,
            closed.clone(),
            close.clone(),
        ));
        MuxSession {
            open_tx,
            closed,
            close,
        }
    }

    /// Open one logical stream. Fails once the session is closed.
    pub async fn open_stream(&self) -> Result<yamux::Stream> {
        let (tx, rx) = oneshot::channel();
        self.open_tx
            .send(tx)
            .await
            .map_err(|_| TunnelError::SessionClosed)?;
        rx.await.map_err(|_| TunnelError::SessionClosed)?
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Ask the driver to close the connection. Idempotent.
    pub fn close(&self) {
        self.close.notify_one();
    }
}

async fn drive<T>(
    mut connection: Connection<T>,
    mut open_rx: mpsc::Receiver<OpenReply>,
    closed: Arc<AtomicBool>,
    close: Arc<Notify>,
) where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let mut accepting_opens = true;
    loop {
        tokio::select! {
            _ = close.notified() => {
                let _ = poll_fn(|cx| connection.poll_close(cx)).await;
                break;
            }
            request = open_rx.recv(), if accepting_opens => {
                match request {
                    Some(reply) => {
                        let result = poll_fn(|cx| connection.poll_new_outbound(cx))
                            .await
                            .map_err(|e| TunnelError::Mux(e.to_string()));
                        let _ = reply.send(result);
                    }
                    // every handle is gone; keep driving so in-flight
                    // streams can finish draining
                    None => accepting_opens = false,
                }
            }
            inbound = poll_fn(|cx| connection.poll_next_inbound(cx)) => {
                match inbound {
                    Some(Ok(stream)) => {
                        debug!("dropping unexpected inbound stream {}", stream.id());
                        drop(stream);
                    }
                    Some(Err(e)) => {
                        debug!("mux connection error: {}", e);
                        break;
                    }
                    None => {
                        debug!("mux connection closed by peer");
                        break;
                    }
                }
            }
        }
    }
    closed.store(true, Ordering::SeqCst);
}
