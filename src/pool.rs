//! Session pool: N tunnel sessions, dialed lazily, handed out
//! round-robin. Owned by the acceptor task alone; nothing else touches
//! slot state.
use crate::error::Result;
use crate::mux::MuxSession;
use crate::transport::FecControl;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration, Instant};
use tracing::warn;

/// A session retired towards the scavenger, with the expiry it had when
/// it left the pool.
pub struct TimedSession {
    pub session: MuxSession,
    pub expires_at: Instant,
}

/// Opens one tunnel session with a mux client on top. The production
/// implementation is [`crate::transport::KcpDialer`].
#[async_trait]
pub trait SessionDialer: Send + Sync {
    async fn dial(&self) -> Result<(MuxSession, FecControl)>;
}

struct PoolSlot {
    session: MuxSession,
    fec: FecControl,
    expires_at: Option<Instant>,
}

impl PoolSlot {
    fn expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() > at)
    }
}

pub struct SessionPool {
    slots: Vec<Option<PoolSlot>>,
    dialer: Arc<dyn SessionDialer>,
    auto_expire: Option<Duration>,
    scavenger: Option<mpsc::Sender<TimedSession>>,
    retry_delay: Duration,
    rr: u16,
}

impl SessionPool {
    pub fn new(
        conn: usize,
        dialer: Arc<dyn SessionDialer>,
        auto_expire_secs: u64,
        scavenger: Option<mpsc::Sender<TimedSession>>,
    ) -> Self {
        let mut slots = Vec::with_capacity(conn.max(1));
        slots.resize_with(conn.max(1), || None);
        Self {
            slots,
            dialer,
            auto_expire: (auto_expire_secs > 0).then(|| Duration::from_secs(auto_expire_secs)),
            scavenger,
            retry_delay: Duration::from_secs(1),
            rr: 0,
        }
    }

    /// Shrink the dial retry delay (used by tests).
    #[cfg(test)]
    fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Pick the next slot round-robin and return a live session for it,
    /// refilling first if the slot is empty, closed or expired.
    pub async fn pick(&mut self) -> (usize, MuxSession) {
        let idx = usize::from(self.rr) % self.slots.len();
        self.rr = self.rr.wrapping_add(1);

        if let Some(slot) = &self.slots[idx] {
            if !slot.session.is_closed() && !slot.expired() {
                return (idx, slot.session.clone());
            }
        }
        let session = self.refill(idx).await;
        (idx, session)
    }

    /// Dial until it works. An expired predecessor keeps running; the
    /// scavenger owns its eventual closure.
    async fn refill(&mut self, idx: usize) -> MuxSession {
        loop {
            match self.dialer.dial().await {
                Ok((session, fec)) => {
                    let expires_at = self.auto_expire.map(|ttl| Instant::now() + ttl);
                    if let (Some(tx), Some(expiry)) = (&self.scavenger, expires_at) {
                        // blocks while the scavenger backlog is full;
                        // refill is already the slow path
                        let _ = tx
                            .send(TimedSession {
                                session: session.clone(),
                                expires_at: expiry,
                            })
                            .await;
                    }
                    self.slots[idx] = Some(PoolSlot {
                        session: session.clone(),
                        fec,
                        expires_at,
                    });
                    return session;
                }
                Err(e) => {
                    warn!("re-connecting: {}", e);
                    sleep(self.retry_delay).await;
                }
            }
        }
    }

    /// Push new FEC shard counts to every live tunnel.
    pub fn apply_fec(&self, data_shards: usize, parity_shards: usize) {
        for slot in self.slots.iter().flatten() {
            slot.fec.set_fec(data_shards, parity_shards);
        }
    }
}
