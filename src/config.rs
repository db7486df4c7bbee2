//! Client configuration.
//!
//! One flat struct mirrors the CLI flags; the same field names (lowercase
//! long-names) are the JSON keys of the `-c` config file, matching what
//! the server side expects. A JSON file overrides only the keys it
//! actually contains.
use crate::error::{Result, TunnelError};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Highest stream-mux protocol version we speak.
pub const MAX_SMUX_VERSION: usize = 2;

/// Floor for the per-stream receive window imposed by the mux.
pub const MIN_STREAM_BUFFER: usize = 256 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Local TCP listen address
    #[serde(rename = "localaddr")]
    pub local_addr: String,
    /// Remote tunnel server address
    #[serde(rename = "remoteaddr")]
    pub remote_addr: String,
    /// Pre-shared secret between client and server
    pub key: String,
    /// Cipher name, see `crypt::new_block_crypt`
    pub crypt: String,
    /// Tuning profile: fast3, fast2, fast, normal, manual
    pub mode: String,
    /// Number of pooled tunnel sessions
    pub conn: usize,
    /// Per-session auto expiration in seconds, 0 to disable
    #[serde(rename = "autoexpire")]
    pub auto_expire: u64,
    /// How long an expired session may keep draining, in seconds
    #[serde(rename = "scavengettl")]
    pub scavenge_ttl: u64,
    /// Maximum transmission unit for tunnel UDP packets
    pub mtu: usize,
    /// Send window in packets
    #[serde(rename = "sndwnd")]
    pub snd_wnd: u16,
    /// Receive window in packets
    #[serde(rename = "rcvwnd")]
    pub rcv_wnd: u16,
    /// Reed-Solomon data shards
    #[serde(rename = "datashard")]
    pub data_shard: usize,
    /// Reed-Solomon parity shards
    #[serde(rename = "parityshard")]
    pub parity_shard: usize,
    /// DSCP (6 bit)
    pub dscp: u8,
    /// Disable the streaming compressor
    #[serde(rename = "nocomp")]
    pub no_comp: bool,
    /// Flush ACKs immediately when a packet is received
    #[serde(rename = "acknodelay")]
    pub ack_nodelay: bool,
    // manual-mode overrides for the ARQ tuning tuple
    #[serde(rename = "nodelay")]
    pub no_delay: i32,
    pub interval: i32,
    pub resend: i32,
    #[serde(rename = "nc")]
    pub no_congestion: i32,
    /// Per-socket OS buffer in bytes
    #[serde(rename = "sockbuf")]
    pub sock_buf: usize,
    /// Stream-mux protocol version, 1 or 2
    #[serde(rename = "smuxver")]
    pub smux_ver: usize,
    /// Overall de-mux buffer in bytes
    #[serde(rename = "smuxbuf")]
    pub smux_buf: usize,
    /// Per-stream receive buffer in bytes, mux v2 only
    #[serde(rename = "streambuf")]
    pub stream_buf: usize,
    /// Seconds between tunnel heartbeats
    #[serde(rename = "keepalive")]
    pub keep_alive: u64,
    /// Counter dump file, empty to disable
    #[serde(rename = "snmplog")]
    pub snmp_log: String,
    /// Counter dump period in seconds
    #[serde(rename = "snmpperiod")]
    pub snmp_period: u64,
    /// Log file, empty for stderr
    pub log: String,
    /// Control named pipe, empty to disable
    pub fifo: String,
    /// Suppress per-stream open/close messages
    pub quiet: bool,
    /// Emulate a TCP connection at the outer layer (unsupported, accepted
    /// for config compatibility)
    pub tcp: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            local_addr: ":12948".to_string(),
            remote_addr: "vps:29900".to_string(),
            key: "it's a secrect".to_string(),
            crypt: "aes".to_string(),
            mode: "fast".to_string(),
            conn: 1,
            auto_expire: 0,
            scavenge_ttl: 600,
            mtu: 1350,
            snd_wnd: 128,
            rcv_wnd: 512,
            data_shard: 10,
            parity_shard: 3,
            dscp: 0,
            no_comp: false,
            ack_nodelay: false,
            no_delay: 0,
            interval: 50,
            resend: 0,
            no_congestion: 0,
            sock_buf: 4194304,
            smux_ver: 1,
            smux_buf: 4194304,
            stream_buf: 2097152,
            keep_alive: 10,
            snmp_log: String::new(),
            snmp_period: 60,
            log: String::new(),
            fifo: String::new(),
            quiet: false,
            tcp: false,
        }
    }
}

impl Config {
    /// Resolve the tuning profile into the ARQ nodelay tuple. `manual`
    /// (and anything unrecognized) leaves the explicit flags untouched.
    pub fn apply_mode(&mut self) {
        let preset = match self.mode.as_str() {
            "normal" => Some((0, 40, 2, 1)),
            "fast" => Some((0, 30, 2, 1)),
            "fast2" => Some((1, 20, 2, 1)),
            "fast3" => Some((1, 10, 2, 1)),
            _ => None,
        };
        if let Some((nodelay, interval, resend, nc)) = preset {
            self.no_delay = nodelay;
            self.interval = interval;
            self.resend = resend;
            self.no_congestion = nc;
        }
    }

    /// Overlay values from a JSON config file. Only keys present in the
    /// file replace the current (CLI-provided) values.
    pub fn merge_json_file(&mut self, path: &str) -> anyhow::Result<()> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path))?;
        let overrides: serde_json::Value = serde_json::from_str(&text)
            .with_context(|| format!("failed to parse config file {}", path))?;
        let mut base = serde_json::to_value(&*self)?;
        match (&mut base, overrides) {
            (serde_json::Value::Object(dst), serde_json::Value::Object(src)) => {
                for (k, v) in src {
                    dst.insert(k, v);
                }
            }
            _ => anyhow::bail!("config file must contain a JSON object"),
        }
        *self = serde_json::from_value(base)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.smux_ver == 0 || self.smux_ver > MAX_SMUX_VERSION {
            return Err(TunnelError::config(format!(
                "unsupported smux version: {}",
                self.smux_ver
            )));
        }
        if self.conn == 0 {
            return Err(TunnelError::config("conn must be at least 1"));
        }
        if self.smux_ver >= 2 && self.stream_buf < MIN_STREAM_BUFFER {
            return Err(TunnelError::config(format!(
                "streambuf must be at least {} bytes",
                MIN_STREAM_BUFFER
            )));
        }
        if self.smux_ver >= 2 && self.smux_buf < self.stream_buf {
            return Err(TunnelError::config("smuxbuf must not be below streambuf"));
        }
        if self.keep_alive == 0 {
            return Err(TunnelError::config("keepalive must be at least 1 second"));
        }
        // leave room for packet framing plus a usable ARQ segment
        if self.mtu < 128 || self.mtu > 1500 {
            return Err(TunnelError::config(format!("invalid mtu: {}", self.mtu)));
        }
        Ok(())
    }

    /// Listen address with the bare-`:port` shorthand expanded.
    pub fn listen_addr(&self) -> String {
        if self.local_addr.starts_with(':') {
            format!("0.0.0.0{}", self.local_addr)
        } else {
            self.local_addr.clone()
        }
    }
}

/// The two FEC shard counts are the only configuration that may change
/// after startup (via the control pipe). They live behind atomics so the
/// dialer picks up the current values for every new session.
#[derive(Debug)]
pub struct FecSetting {
    data: AtomicUsize,
    parity: AtomicUsize,
}

impl FecSetting {
    pub fn new(data_shards: usize, parity_shards: usize) -> Self {
        Self {
            data: AtomicUsize::new(data_shards),
            parity: AtomicUsize::new(parity_shards),
        }
    }

    pub fn get(&self) -> (usize, usize) {
        (
            self.data.load(Ordering::Relaxed),
            self.parity.load(Ordering::Relaxed),
        )
    }

    pub fn set(&self, data_shards: usize, parity_shards: usize) {
        self.data.store(data_shards, Ordering::Relaxed);
        self.parity.store(parity_shards, Ordering::Relaxed);
    }
}
