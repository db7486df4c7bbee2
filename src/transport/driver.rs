//! UDP session driver: pumps the KCP engine between a connected UDP
//! socket and an in-process byte pipe. The mux layer sits on the other
//! end of the pipe and never sees packets.
use super::packet::{PacketEvent, PacketPipeline};
use super::FecControl;
use crate::config::Config;
use crate::crypt;
use crate::error::{Result, TunnelError};
use crate::stats::TunnelStats;
use kcp::Kcp;
use std::collections::VecDeque;
use std::io::Write;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{interval, Duration, Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

/// Ceiling on tunnel packet size (also the receive buffer size).
const MAX_PACKET: usize = 1500;

/// Capacity of the in-process pipe between driver and mux.
const PIPE_CAPACITY: usize = 64 * 1024;

/// Read chunk taken from the mux side per iteration.
const READ_CHUNK: usize = 16 * 1024;

/// Keepalive intervals without any inbound packet before the session
/// declares the peer dead.
const KEEPALIVE_MISSES: u32 = 3;

/// One dialed tunnel session: the byte pipe to hand to the mux plus the
/// runtime FEC control handle.
#[derive(Debug)]
pub struct TunnelConn {
    pub stream: DuplexStream,
    pub fec: FecControl,
    pub local_addr: SocketAddr,
    pub peer_addr: SocketAddr,
}

/// KCP writes outgoing segments here; the driver drains them into the
/// packet pipeline after every engine call.
#[derive(Clone, Default)]
pub(crate) struct OutputQueue(Arc<Mutex<VecDeque<Vec<u8>>>>);

impl OutputQueue {
    pub(crate) fn drain(&self) -> Vec<Vec<u8>> {
        let mut queue = self.0.lock().expect("output queue poisoned");
        queue.drain(..).collect()
    }
}

impl Write for OutputQueue {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0
            .lock()
            .expect("output queue poisoned")
            .push_back(buf.to_vec());
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

async fn resolve(addr: &str) -> Result<SocketAddr> {
    tokio::net::lookup_host(addr)
        .await?
        .next()
        .ok_or_else(|| TunnelError::AddressResolve(addr.to_string()))
}

/// Best-effort socket tuning; failures are logged, never fatal.
fn tune_socket(udp: &UdpSocket, config: &Config) {
    let sock = socket2::SockRef::from(udp);
    if config.sock_buf > 0 {
        if let Err(e) = sock.set_recv_buffer_size(config.sock_buf) {
            warn!("set read buffer: {}", e);
        }
        if let Err(e) = sock.set_send_buffer_size(config.sock_buf) {
            warn!("set write buffer: {}", e);
        }
    }
    if config.dscp > 0 {
        // DSCP occupies the upper six bits of the TOS byte
        if let Err(e) = sock.set_tos(u32::from(config.dscp) << 2) {
            warn!("set dscp: {}", e);
        }
    }
}

fn now_ms(start: Instant) -> u32 {
    start.elapsed().as_millis() as u32
}

/// Open one tunnel session to the remote endpoint and spawn its driver.
pub async fn dial(
    config: &Config,
    key: &[u8; 32],
    data_shards: usize,
    parity_shards: usize,
    stats: Arc<TunnelStats>,
) -> Result<TunnelConn> {
    let peer_addr = resolve(&config.remote_addr).await?;
    let bind: SocketAddr = if peer_addr.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let udp = UdpSocket::bind(bind).await?;
    tune_socket(&udp, config);
    udp.connect(peer_addr).await?;
    let local_addr = udp.local_addr()?;

    let block = crypt::new_block_crypt(&config.crypt, key);
    let pipeline = PacketPipeline::new(block, data_shards, parity_shards, stats.clone())?;

    let overhead = pipeline.overhead();
    if config.mtu <= overhead + 50 {
        return Err(TunnelError::config(format!(
            "mtu {} leaves no room for {} bytes of packet overhead",
            config.mtu, overhead
        )));
    }

    let conv: u32 = rand::random();
    let queue = OutputQueue::default();
    let mut kcp = Kcp::new_stream(conv, queue.clone());
    kcp.set_nodelay(
        config.no_delay > 0,
        config.interval,
        config.resend,
        config.no_congestion > 0,
    );
    kcp.set_wndsize(config.snd_wnd, config.rcv_wnd);
    kcp.set_mtu(config.mtu - overhead)
        .map_err(|e| TunnelError::transport(e.to_string()))?;

    let (local, remote) = tokio::io::duplex(PIPE_CAPACITY);
    let (fec, fec_rx) = FecControl::channel();

    let driver = Driver {
        udp,
        kcp,
        queue,
        pipeline,
        pipe: remote,
        fec_rx,
        stats,
        snd_wnd: config.snd_wnd,
        keep_alive: Duration::from_secs(config.keep_alive.max(1)),
        ack_nodelay: config.ack_nodelay,
        interval_ms: config.interval.clamp(10, 5000) as u64,
        peer_addr,
    };
    tokio::spawn(driver.run());

    Ok(TunnelConn {
        stream: local,
        fec,
        local_addr,
        peer_addr,
    })
}

struct Driver {
    udp: UdpSocket,
    kcp: Kcp<OutputQueue>,
    queue: OutputQueue,
    pipeline: PacketPipeline,
    pipe: DuplexStream,
    fec_rx: mpsc::UnboundedReceiver<(usize, usize)>,
    stats: Arc<TunnelStats>,
    snd_wnd: u16,
    keep_alive: Duration,
    ack_nodelay: bool,
    interval_ms: u64,
    peer_addr: SocketAddr,
}

impl Driver {
    async fn run(mut self) {
        let start = Instant::now();
        let mut update_timer = interval(Duration::from_millis(self.interval_ms));
        update_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut keepalive_timer = interval(self.keep_alive);
        keepalive_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        keepalive_timer.tick().await;

        let mut last_rx = Instant::now();
        let mut pkt_buf = vec![0u8; MAX_PACKET];
        let mut read_buf = vec![0u8; READ_CHUNK];
        let mut fec_open = true;

        loop {
            // stop pulling from the mux while the send queue is saturated
            let can_send = self.kcp.wait_snd() < usize::from(self.snd_wnd) * 2;

            tokio::select! {
                received = self.udp.recv(&mut pkt_buf) => {
                    match received {
                        Ok(n) => {
                            last_rx = Instant::now();
                            self.stats.packet_received(n);
                            if self.handle_packet(pkt_buf[..n].to_vec()).await.is_err() {
                                break;
                            }
                        }
                        // transient (e.g. ICMP unreachable on a connected
                        // socket); the keepalive timeout decides liveness
                        Err(e) => trace!("udp recv: {}", e),
                    }
                }
                read = self.pipe.read(&mut read_buf), if can_send => {
                    match read {
                        Ok(0) => {
                            let _ = self.kcp.flush();
                            self.flush_outputs().await;
                            debug!("mux side closed, stopping tunnel {}", self.peer_addr);
                            break;
                        }
                        Ok(n) => {
                            if let Err(e) = self.kcp.send(&read_buf[..n]) {
                                debug!("kcp send: {}", e);
                                break;
                            }
                            let _ = self.kcp.flush();
                            self.flush_outputs().await;
                        }
                        Err(e) => {
                            debug!("pipe read: {}", e);
                            break;
                        }
                    }
                }
                _ = update_timer.tick() => {
                    if self.kcp.update(now_ms(start)).is_err() {
                        break;
                    }
                    self.flush_outputs().await;
                }
                _ = keepalive_timer.tick() => {
                    if last_rx.elapsed() > self.keep_alive * KEEPALIVE_MISSES {
                        warn!("tunnel {} keepalive timeout", self.peer_addr);
                        break;
                    }
                    let ping = self.pipeline.ping();
                    self.send_packet(ping).await;
                }
                cmd = self.fec_rx.recv(), if fec_open => {
                    match cmd {
                        Some((ds, ps)) => match self.pipeline.set_fec(ds, ps) {
                            Ok(()) => debug!("tunnel {} fec set to ds: {} ps: {}", self.peer_addr, ds, ps),
                            Err(e) => warn!("fec reconfigure failed: {}", e),
                        },
                        None => fec_open = false,
                    }
                }
            }
        }
        debug!("tunnel driver for {} stopped", self.peer_addr);
    }

    async fn handle_packet(&mut self, pkt: Vec<u8>) -> std::io::Result<()> {
        match self.pipeline.open(pkt) {
            PacketEvent::Payloads(payloads) => {
                for seg in payloads {
                    if let Err(e) = self.kcp.input(&seg) {
                        trace!("kcp input: {}", e);
                    }
                }
                if self.ack_nodelay {
                    let _ = self.kcp.flush();
                }
                self.deliver().await?;
                self.flush_outputs().await;
            }
            PacketEvent::Ping => {
                let pong = self.pipeline.pong();
                self.send_packet(pong).await;
            }
            PacketEvent::Pong | PacketEvent::Dropped => {}
        }
        Ok(())
    }

    /// Move every completed ARQ segment into the mux-facing pipe.
    async fn deliver(&mut self) -> std::io::Result<()> {
        loop {
            let size = match self.kcp.peeksize() {
                Ok(n) if n > 0 => n,
                _ => break,
            };
            let mut data = vec![0u8; size];
            match self.kcp.recv(&mut data) {
                Ok(n) => {
                    data.truncate(n);
                    self.pipe.write_all(&data).await?;
                }
                Err(_) => break,
            }
        }
        Ok(())
    }

    /// Frame, encrypt and transmit everything KCP queued for the wire.
    async fn flush_outputs(&mut self) {
        for seg in self.queue.drain() {
            match self.pipeline.seal_data(&seg) {
                Ok(pkts) => {
                    for p in pkts {
                        self.send_packet(p).await;
                    }
                }
                Err(e) => warn!("fec encode: {}", e),
            }
        }
    }

    async fn send_packet(&self, pkt: Vec<u8>) {
        match self.udp.send(&pkt).await {
            Ok(n) => self.stats.packet_sent(n),
            Err(e) => trace!("udp send: {}", e),
        }
    }
}
