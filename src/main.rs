use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use udptun::cli::Cli;
use udptun::{client, control, crypt, stats, Config, FecSetting, KcpDialer, TunnelStats};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::from(&cli);
    if let Some(path) = &cli.config {
        config.merge_json_file(path)?;
    }

    init_logging(&config)?;

    config.apply_mode();
    info!("version: {}", env!("CARGO_PKG_VERSION"));
    banner(&config);
    config.validate().context("invalid configuration")?;

    if config.tcp {
        warn!("tcp emulation is not supported, continuing over plain udp");
    }

    info!("initiating key derivation");
    let key = crypt::derive_key(&config.key);
    info!("key derivation done");

    let tunnel_stats = Arc::new(TunnelStats::default());
    stats::start_snmp_logger(
        tunnel_stats.clone(),
        config.snmp_log.clone(),
        config.snmp_period,
    );

    let shards = Arc::new(FecSetting::new(config.data_shard, config.parity_shard));
    let dialer = Arc::new(KcpDialer::new(
        config.clone(),
        key,
        shards.clone(),
        tunnel_stats.clone(),
    )?);

    let (control_tx, control_rx) = mpsc::channel(16);
    if config.fifo.is_empty() {
        drop(control_tx);
    } else {
        let path = PathBuf::from(&config.fifo);
        tokio::spawn(async move {
            if let Err(e) = control::run_fifo_reader(path, control_tx).await {
                error!("control pipe: {}", e);
                std::process::exit(1);
            }
        });
    }

    client::run_client(config, dialer, control_rx, shards, tunnel_stats).await
}

fn init_logging(config: &Config) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);
    if config.log.is_empty() {
        builder.init();
    } else {
        let file = {
            use std::os::unix::fs::OpenOptionsExt;
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .mode(0o666)
                .open(&config.log)
                .with_context(|| format!("failed to open log file {}", config.log))?
        };
        builder.with_writer(Arc::new(file)).with_ansi(false).init();
    }
    Ok(())
}

/// Every effective parameter, logged once at startup.
fn banner(config: &Config) {
    info!("listening on: {}", config.listen_addr());
    info!("encryption: {}", config.crypt);
    info!(
        "nodelay parameters: {} {} {} {}",
        config.no_delay, config.interval, config.resend, config.no_congestion
    );
    info!("remote address: {}", config.remote_addr);
    info!("sndwnd: {} rcvwnd: {}", config.snd_wnd, config.rcv_wnd);
    info!("compression: {}", !config.no_comp);
    info!("mtu: {}", config.mtu);
    info!(
        "datashard: {} parityshard: {}",
        config.data_shard, config.parity_shard
    );
    info!("acknodelay: {}", config.ack_nodelay);
    info!("dscp: {}", config.dscp);
    info!("sockbuf: {}", config.sock_buf);
    info!("smux version: {}", config.smux_ver);
    info!("smuxbuf: {}", config.smux_buf);
    info!("streambuf: {}", config.stream_buf);
    info!("keepalive: {}", config.keep_alive);
    info!("conn: {}", config.conn);
    info!("autoexpire: {}", config.auto_expire);
    info!("scavengettl: {}", config.scavenge_ttl);
    info!("snmplog: {}", config.snmp_log);
    info!("snmpperiod: {}", config.snmp_period);
    info!("fifo: {}", config.fifo);
    info!("quiet: {}", config.quiet);
    info!("tcp: {}", config.tcp);
}
