//! TCP acceptor and per-connection relay.
//!
//! The accept loop owns the session pool; control commands arrive over a
//! channel and are applied between accepts, so a reconfiguration is
//! visible before the next stream opens.
use crate::config::{Config, FecSetting};
use crate::control::ControlCommand;
use crate::mux::MuxSession;
use crate::pool::{SessionDialer, SessionPool};
use crate::scavenger;
use crate::stats::TunnelStats;
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::compat::FuturesAsyncReadCompatExt;
use tracing::{info, warn};

/// Relay copy buffer size, one per pump.
const BUF_SIZE: usize = 4096;

/// Bind the local listener and serve forever.
pub async fn run_client(
    config: Config,
    dialer: Arc<dyn SessionDialer>,
    control_rx: mpsc::Receiver<ControlCommand>,
    shards: Arc<FecSetting>,
    stats: Arc<TunnelStats>,
) -> Result<()> {
    let listen = config.listen_addr();
    let listener = TcpListener::bind(&listen)
        .await
        .with_context(|| format!("failed to listen on {}", listen))?;
    info!("listening on: {}", listener.local_addr()?);
    serve(listener, config, dialer, control_rx, shards, stats).await
}

/// Accept loop over an already-bound listener.
pub async fn serve(
    listener: TcpListener,
    config: Config,
    dialer: Arc<dyn SessionDialer>,
    mut control_rx: mpsc::Receiver<ControlCommand>,
    shards: Arc<FecSetting>,
    stats: Arc<TunnelStats>,
) -> Result<()> {
    let scavenger_tx = if config.auto_expire > 0 {
        Some(scavenger::start(config.scavenge_ttl))
    } else {
        None
    };
    let mut pool = SessionPool::new(config.conn, dialer, config.auto_expire, scavenger_tx);

    loop {
        tokio::select! {
            Some(command) = control_rx.recv() => {
                apply_control(&pool, &shards, command);
            }
            accepted = listener.accept() => {
                let (p1, peer) = accepted.context("accept failed")?;
                // apply anything the control pipe queued up first
                while let Ok(command) = control_rx.try_recv() {
                    apply_control(&pool, &shards, command);
                }
                let _ = p1.set_nodelay(true);
                let (_, session) = pool.pick().await;
                let remote = config.remote_addr.clone();
                let quiet = config.quiet;
                let stats = stats.clone();
                tokio::spawn(handle_client(session, p1, peer, remote, quiet, stats));
            }
        }
    }
}

fn apply_control(pool: &SessionPool, shards: &FecSetting, command: ControlCommand) {
    match command {
        ControlCommand::ReconfigureFec {
            data_shards,
            parity_shards,
        } => {
            if (data_shards, parity_shards) != shards.get() {
                shards.set(data_shards, parity_shards);
                info!("ds: {} ps: {}", data_shards, parity_shards);
                pool.apply_fec(data_shards, parity_shards);
            }
        }
    }
}

/// One accepted connection: open a logical stream, then shuttle bytes
/// both ways until either side finishes.
async fn handle_client(
    session: MuxSession,
    p1: TcpStream,
    peer: SocketAddr,
    remote: String,
    quiet: bool,
    stats: Arc<TunnelStats>,
) {
    let p2 = match session.open_stream().await {
        Ok(stream) => stream,
        Err(e) => {
            if !quiet {
                info!("{}", e);
            }
            return;
        }
    };
    stats.stream_opened();
    let stream_id = p2.id();
    if !quiet {
        info!("stream opened in: {} out: {}({})", peer, remote, stream_id);
    }

    let (mut in_read, mut in_write) = p1.into_split();
    let (mut out_read, mut out_write) = tokio::io::split(p2.compat());

    let result = tokio::select! {
        r = pump(&mut in_read, &mut out_write) => r,
        r = pump(&mut out_read, &mut in_write) => r,
    };
    if let Err(e) = &result {
        // the mux signals protocol violations as InvalidData
        if e.kind() == std::io::ErrorKind::InvalidData {
            warn!("mux {} in: {} out: {}({})", e, peer, remote, stream_id);
        }
    }
    // first side done: tear down both, which unblocks the other pump
    let _ = in_write.shutdown().await;
    let _ = out_write.shutdown().await;
    if !quiet {
        info!("stream closed in: {} out: {}({})", peer, remote, stream_id);
    }
}

async fn pump<R, W>(src: &mut R, dst: &mut W) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; BUF_SIZE];
    loop {
        let n = src.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        dst.write_all(&buf[..n]).await?;
        dst.flush().await?;
    }
}
