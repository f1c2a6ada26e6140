//! Connectivity monitor -- polls a probe endpoint and publishes settled
//! online/offline transitions on a watch channel.
//!
//! Raw probe results are debounced: a transition must hold for the guard
//! interval before it propagates, so a flapping uplink cannot thrash the
//! mesh session and the sync engine.

use std::future::Future;
use std::time::Duration;

use fieldlink_mesh::NetMode;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;

use crate::config::ConnectivitySection;

/// Debounce state for raw connectivity observations. Pure, so the guard
/// logic is testable without sockets or timers.
pub struct Debouncer {
    published: NetMode,
    pending: Option<(NetMode, Instant)>,
    guard: Duration,
}

impl Debouncer {
    pub fn new(initial: NetMode, guard: Duration) -> Self {
        Debouncer {
            published: initial,
            pending: None,
            guard,
        }
    }

    pub fn published(&self) -> NetMode {
        self.published
    }

    /// Feed one raw observation. Returns the new settled mode when a
    /// transition has held for the guard interval.
    pub fn observe(&mut self, raw: NetMode, now: Instant) -> Option<NetMode> {
        if raw == self.published {
            self.pending = None;
            return None;
        }
        match self.pending {
            Some((mode, since)) if mode == raw => {
                if now.duration_since(since) >= self.guard {
                    self.published = raw;
                    self.pending = None;
                    Some(raw)
                } else {
                    None
                }
            }
            _ => {
                self.pending = Some((raw, now));
                None
            }
        }
    }
}

/// TCP-connect probe against the configured endpoint.
pub async fn tcp_probe(addr: String) -> bool {
    matches!(
        tokio::time::timeout(Duration::from_secs(2), TcpStream::connect(&addr)).await,
        Ok(Ok(_))
    )
}

/// Spawn the monitor with the real TCP probe.
pub fn spawn_connectivity_monitor(
    cfg: ConnectivitySection,
    shutdown: broadcast::Receiver<()>,
) -> watch::Receiver<NetMode> {
    let (tx, rx) = watch::channel(NetMode::Online);
    let addr = cfg.probe_addr.clone();
    tokio::spawn(run_connectivity_monitor(
        cfg,
        tx,
        move || tcp_probe(addr.clone()),
        shutdown,
    ));
    rx
}

/// Poll the probe and publish debounced transitions. The probe is injected
/// so tests can drive it without a network.
pub async fn run_connectivity_monitor<P, F>(
    cfg: ConnectivitySection,
    tx: watch::Sender<NetMode>,
    probe: P,
    mut shutdown: broadcast::Receiver<()>,
) where
    P: Fn() -> F,
    F: Future<Output = bool>,
{
    let mut debouncer = Debouncer::new(*tx.borrow(), Duration::from_secs(cfg.guard_secs));
    let mut interval = tokio::time::interval(Duration::from_secs(cfg.poll_secs.max(1)));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::debug!("connectivity monitor stopped");
                return;
            }
            _ = interval.tick() => {
                let raw = if probe().await { NetMode::Online } else { NetMode::Offline };
                if let Some(settled) = debouncer.observe(raw, Instant::now()) {
                    tracing::info!(mode = ?settled, "connectivity changed");
                    let _ = tx.send(settled);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn at(base: Instant, secs: u64) -> Instant {
        base + Duration::from_secs(secs)
    }

    #[test]
    fn test_transition_requires_guard() {
        let base = Instant::now();
        let mut d = Debouncer::new(NetMode::Online, Duration::from_secs(2));

        // First offline observation arms the guard, nothing propagates.
        assert_eq!(d.observe(NetMode::Offline, at(base, 0)), None);
        // Still inside the guard.
        assert_eq!(d.observe(NetMode::Offline, at(base, 1)), None);
        // Held long enough.
        assert_eq!(d.observe(NetMode::Offline, at(base, 2)), Some(NetMode::Offline));
        assert_eq!(d.published(), NetMode::Offline);
    }

    #[test]
    fn test_flap_inside_guard_suppressed() {
        let base = Instant::now();
        let mut d = Debouncer::new(NetMode::Online, Duration::from_secs(2));

        assert_eq!(d.observe(NetMode::Offline, at(base, 0)), None);
        // Link recovers before the guard expires: pending cleared.
        assert_eq!(d.observe(NetMode::Online, at(base, 1)), None);
        // Drops again: the guard restarts from here.
        assert_eq!(d.observe(NetMode::Offline, at(base, 2)), None);
        assert_eq!(d.observe(NetMode::Offline, at(base, 3)), None);
        assert_eq!(d.observe(NetMode::Offline, at(base, 4)), Some(NetMode::Offline));
    }

    #[test]
    fn test_steady_state_is_silent() {
        let base = Instant::now();
        let mut d = Debouncer::new(NetMode::Online, Duration::from_secs(2));
        for s in 0..10 {
            assert_eq!(d.observe(NetMode::Online, at(base, s)), None);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_publishes_settled_transition() {
        let cfg = ConnectivitySection {
            guard_secs: 2,
            poll_secs: 5,
            probe_addr: String::new(),
        };
        let online = Arc::new(AtomicBool::new(true));
        let flag = online.clone();
        let (tx, mut rx) = watch::channel(NetMode::Online);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        tokio::spawn(run_connectivity_monitor(
            cfg,
            tx,
            move || {
                let flag = flag.clone();
                async move { flag.load(Ordering::SeqCst) }
            },
            shutdown_rx,
        ));

        online.store(false, Ordering::SeqCst);
        // Two polls are needed: one arms the guard, the next confirms it.
        tokio::time::advance(Duration::from_secs(11)).await;
        tokio::task::yield_now().await;

        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), NetMode::Offline);
        drop(shutdown_tx);
    }
}
