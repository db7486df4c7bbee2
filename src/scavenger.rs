//! Deferred closure of retired sessions.
//!
//! Sessions leave the pool while their streams are still draining; the
//! scavenger holds them through a grace window and closes whatever has
//! not closed itself by then.
use crate::pool::TimedSession;
use tokio::sync::mpsc;
use tokio::time::{interval, Duration, Instant};
use tracing::info;

/// Backlog of sessions awaiting closure; pool refills block when full.
pub const SCAVENGER_BACKLOG: usize = 128;

/// Spawn the scavenger and hand back its intake. Only called when
/// auto-expiry is enabled; otherwise no sessions ever retire.
pub fn start(grace_secs: u64) -> mpsc::Sender<TimedSession> {
    let (tx, rx) = mpsc::channel(SCAVENGER_BACKLOG);
    tokio::spawn(run(rx, Duration::from_secs(grace_secs)));
    tx
}

pub(crate) async fn run(mut rx: mpsc::Receiver<TimedSession>, grace: Duration) {
    let mut pending: Vec<TimedSession> = Vec::new();
    let mut ticker = interval(Duration::from_secs(1));
    let mut intake_open = true;
    loop {
        tokio::select! {
            received = rx.recv(), if intake_open => {
                match received {
                    Some(mut timed) => {
                        // the grace window extends the pool's expiry
                        timed.expires_at += grace;
                        pending.push(timed);
                    }
                    None => intake_open = false,
                }
            }
            _ = ticker.tick() => {
                pending.retain(|timed| {
                    if timed.session.is_closed() {
                        info!("scavenger: session normally closed");
                        false
                    } else if Instant::now() > timed.expires_at {
                        timed.session.close();
                        info!("scavenger: session closed due to ttl");
                        false
                    } else {
                        true
                    }
                });
                if !intake_open && pending.is_empty() {
                    break;
                }
            }
        }
    }
}
