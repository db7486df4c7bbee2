use crate::config::Config;
use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "udptun-client")]
#[command(author, version, about = "Reliable UDP tunnel client (with stream mux)", long_about = None)]
pub struct Cli {
    /// Local listen address
    #[arg(short = 'l', long, default_value = ":12948")]
    pub localaddr: String,

    /// Tunnel server address
    #[arg(short = 'r', long, default_value = "vps:29900")]
    pub remoteaddr: String,

    /// Pre-shared secret between client and server
    #[arg(long, env = "KCPTUN_KEY", default_value = "it's a secrect")]
    pub key: String,

    /// aes, aes-128, aes-192, salsa20, blowfish, twofish, cast5, 3des, tea, xtea, xor, sm4, none, null
    #[arg(long, default_value = "aes")]
    pub crypt: String,

    /// Profiles: fast3, fast2, fast, normal, manual
    #[arg(long, default_value = "fast")]
    pub mode: String,

    /// Number of UDP connections to the server
    #[arg(long, default_value_t = 1)]
    pub conn: usize,

    /// Auto expiration time (in seconds) for a single UDP connection, 0 to disable
    #[arg(long, default_value_t = 0)]
    pub autoexpire: u64,

    /// How long an expired connection can live (in seconds)
    #[arg(long, default_value_t = 600)]
    pub scavengettl: u64,

    /// Maximum transmission unit for UDP packets
    #[arg(long, default_value_t = 1350)]
    pub mtu: usize,

    /// Send window size (num of packets)
    #[arg(long, default_value_t = 128)]
    pub sndwnd: u16,

    /// Receive window size (num of packets)
    #[arg(long, default_value_t = 512)]
    pub rcvwnd: u16,

    /// Reed-Solomon erasure coding - data shards
    #[arg(long, alias = "ds", default_value_t = 10)]
    pub datashard: usize,

    /// Reed-Solomon erasure coding - parity shards
    #[arg(long, alias = "ps", default_value_t = 3)]
    pub parityshard: usize,

    /// DSCP (6 bit)
    #[arg(long, default_value_t = 0)]
    pub dscp: u8,

    /// Disable compression
    #[arg(long, default_value_t = false)]
    pub nocomp: bool,

    /// Flush ACK immediately when a packet is received
    #[arg(long, hide = true, default_value_t = false)]
    pub acknodelay: bool,

    #[arg(long, hide = true, default_value_t = 0)]
    pub nodelay: i32,

    #[arg(long, hide = true, default_value_t = 50)]
    pub interval: i32,

    #[arg(long, hide = true, default_value_t = 0)]
    pub resend: i32,

    #[arg(long, hide = true, default_value_t = 0)]
    pub nc: i32,

    /// Per-socket buffer in bytes
    #[arg(long, default_value_t = 4194304)]
    pub sockbuf: usize,

    /// Stream-mux version, available 1, 2
    #[arg(long, default_value_t = 1)]
    pub smuxver: usize,

    /// Overall de-mux buffer in bytes
    #[arg(long, default_value_t = 4194304)]
    pub smuxbuf: usize,

    /// Per-stream receive buffer in bytes, mux v2+
    #[arg(long, default_value_t = 2097152)]
    pub streambuf: usize,

    /// Seconds between heartbeats
    #[arg(long, default_value_t = 10)]
    pub keepalive: u64,

    /// Collect counters to file
    #[arg(long, default_value = "")]
    pub snmplog: String,

    /// Counter collect period, in seconds
    #[arg(long, default_value_t = 60)]
    pub snmpperiod: u64,

    /// Specify a log file to output, default goes to stderr
    #[arg(long, default_value = "")]
    pub log: String,

    /// Specify a fifo file for runtime control
    #[arg(long, default_value = "")]
    pub fifo: String,

    /// Suppress the 'stream open/close' messages
    #[arg(long, default_value_t = false)]
    pub quiet: bool,

    /// Emulate a TCP connection (linux)
    #[arg(long, default_value_t = false)]
    pub tcp: bool,

    /// Config from JSON file, which overrides the command from shell
    #[arg(short = 'c', value_name = "FILE")]
    pub config: Option<String>,
}

impl From<&Cli> for Config {
    fn from(cli: &Cli) -> Self {
        Config {
            local_addr: cli.localaddr.clone(),
            remote_addr: cli.remoteaddr.clone(),
            key: cli.key.clone(),
            crypt: cli.crypt.clone(),
            mode: cli.mode.clone(),
            conn: cli.conn,
            auto_expire: cli.autoexpire,
            scavenge_ttl: cli.scavengettl,
            mtu: cli.mtu,
            snd_wnd: cli.sndwnd,
            rcv_wnd: cli.rcvwnd,
            data_shard: cli.datashard,
            parity_shard: cli.parityshard,
            dscp: cli.dscp,
            no_comp: cli.nocomp,
            ack_nodelay: cli.acknodelay,
            no_delay: cli.nodelay,
            interval: cli.interval,
            resend: cli.resend,
            no_congestion: cli.nc,
            sock_buf: cli.sockbuf,
            smux_ver: cli.smuxver,
            smux_buf: cli.smuxbuf,
            stream_buf: cli.streambuf,
            keep_alive: cli.keepalive,
            snmp_log: cli.snmplog.clone(),
            snmp_period: cli.snmpperiod,
            log: cli.log.clone(),
            fifo: cli.fifo.clone(),
            quiet: cli.quiet,
            tcp: cli.tcp,
        }
    }
}
