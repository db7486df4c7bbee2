use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::io::AsyncWriteExt;
use tracing::warn;

/// Tunnel-wide counters, shared by every session driver.
#[derive(Debug, Default)]
pub struct TunnelStats {
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    checksum_drops: AtomicU64,
    fec_recovered: AtomicU64,
    fec_parity_sent: AtomicU64,
    sessions_dialed: AtomicU64,
    streams_opened: AtomicU64,
}

/// A point-in-time copy of [`TunnelStats`], serializable for the dump
/// file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub timestamp: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub checksum_drops: u64,
    pub fec_recovered: u64,
    pub fec_parity_sent: u64,
    pub sessions_dialed: u64,
    pub streams_opened: u64,
}

impl TunnelStats {
    pub fn packet_sent(&self, bytes: usize) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn packet_received(&self, bytes: usize) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn checksum_drop(&self) {
        self.checksum_drops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn fec_recovered(&self, shards: u64) {
        self.fec_recovered.fetch_add(shards, Ordering::Relaxed);
    }

    pub fn fec_parity_sent(&self, shards: u64) {
        self.fec_parity_sent.fetch_add(shards, Ordering::Relaxed);
    }

    pub fn session_dialed(&self) {
        self.sessions_dialed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stream_opened(&self) {
        self.streams_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            timestamp: SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            checksum_drops: self.checksum_drops.load(Ordering::Relaxed),
            fec_recovered: self.fec_recovered.load(Ordering::Relaxed),
            fec_parity_sent: self.fec_parity_sent.load(Ordering::Relaxed),
            sessions_dialed: self.sessions_dialed.load(Ordering::Relaxed),
            streams_opened: self.streams_opened.load(Ordering::Relaxed),
        }
    }
}

/// Periodically append a JSON snapshot line to `path`. Does nothing when
/// `path` is empty.
pub fn start_snmp_logger(stats: Arc<TunnelStats>, path: String, period_secs: u64) {
    if path.is_empty() {
        return;
    }
    let period = std::time::Duration::from_secs(period_secs.max(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        // skip the immediate first tick
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(e) = append_snapshot(&path, &stats.snapshot()).await {
                warn!("snmp log write failed: {}", e);
            }
        }
    });
}

async fn append_snapshot(path: &str, snapshot: &StatsSnapshot) -> std::io::Result<()> {
    let mut line = serde_json::to_vec(snapshot).map_err(std::io::Error::other)?;
    line.push(b'\n');
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(&line).await?;
    file.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let stats = TunnelStats::default();
        stats.packet_sent(100);
        stats.packet_sent(50);
        stats.packet_received(30);
        stats.checksum_drop();
        stats.fec_recovered(2);

        let snap = stats.snapshot();
        assert_eq!(snap.packets_sent, 2);
        assert_eq!(snap.bytes_sent, 150);
        assert_eq!(snap.packets_received, 1);
        assert_eq!(snap.bytes_received, 30);
        assert_eq!(snap.checksum_drops, 1);
        assert_eq!(snap.fec_recovered, 2);
    }

    #[tokio::test]
    async fn test_append_snapshot_writes_json_lines() {
        let dir = std::env::temp_dir().join(format!("udptun-snmp-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("snmp.log");
        let stats = TunnelStats::default();
        stats.packet_sent(10);

        append_snapshot(path.to_str().unwrap(), &stats.snapshot())
            .await
            .unwrap();
        append_snapshot(path.to_str().unwrap(), &stats.snapshot())
            .await
            .unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: StatsSnapshot = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed.packets_sent, 1);

        std::fs::remove_dir_all(&dir).ok();
    }
}
