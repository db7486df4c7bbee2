//! Tunnel transport: the packet codec, the per-session UDP/KCP driver
//! and the production dialer that stacks compression and the mux on
//! top.
mod driver;
pub mod packet;

pub use driver::{dial, TunnelConn};

use crate::compress::CompressedStream;
use crate::config::{Config, FecSetting};
use crate::error::Result;
use crate::mux::{MuxConfig, MuxSession};
use crate::pool::SessionDialer;
use crate::stats::TunnelStats;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::compat::TokioAsyncReadCompatExt;
use tracing::info;

/// Runtime handle to one tunnel's FEC codec.
#[derive(Clone, Debug)]
pub struct FecControl {
    tx: mpsc::UnboundedSender<(usize, usize)>,
}

impl FecControl {
    /// Create a control handle plus the receiver its driver listens on.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<(usize, usize)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Reconfigure shard counts; a no-op once the session died.
    pub fn set_fec(&self, data_shards: usize, parity_shards: usize) {
        let _ = self.tx.send((data_shards, parity_shards));
    }
}

/// Production dialer: KCP over UDP, optionally compressed, mux client
/// on top. New sessions pick up the current FEC shard counts.
pub struct KcpDialer {
    config: Config,
    key: [u8; 32],
    shards: Arc<FecSetting>,
    mux_config: MuxConfig,
    stats: Arc<TunnelStats>,
}

impl KcpDialer {
    pub fn new(
        config: Config,
        key: [u8; 32],
        shards: Arc<FecSetting>,
        stats: Arc<TunnelStats>,
    ) -> Result<Self> {
        let mux_config = MuxConfig::from_config(&config)?;
        Ok(Self {
            config,
            key,
            shards,
            mux_config,
            stats,
        })
    }
}

#[async_trait]
impl SessionDialer for KcpDialer {
    async fn dial(&self) -> Result<(MuxSession, FecControl)> {
        let (data_shards, parity_shards) = self.shards.get();
        let conn = driver::dial(
            &self.config,
            &self.key,
            data_shards,
            parity_shards,
            self.stats.clone(),
        )
        .await?;
        self.stats.session_dialed();
        info!(
            "smux version: {} on connection: {} -> {}",
            self.config.smux_ver, conn.local_addr, conn.peer_addr
        );

        let session = if self.config.no_comp {
            MuxSession::spawn(conn.stream.compat(), &self.mux_config)
        } else {
            MuxSession::spawn(CompressedStream::new(conn.stream).compat(), &self.mux_config)
        };
        Ok((session, conn.fec))
    }
}
