use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::{self, Duration};
use tracing::info;

/// Packet counters shared between the poll thread and the stats logger.
#[derive(Debug, Default)]
pub struct StatsCollector {
    from_device: AtomicU64,
    to_device: AtomicU64,
    blocked: AtomicU64,
    forwarded: AtomicU64,
    gateway_tx: AtomicU64,
    gateway_rx: AtomicU64,
    errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub from_device: u64,
    pub to_device: u64,
    pub blocked: u64,
    pub forwarded: u64,
    pub gateway_tx: u64,
    pub gateway_rx: u64,
    pub errors: u64,
}

impl StatsCollector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Logs a summary every `log_interval_sec` on the current tokio runtime.
    pub fn spawn_logger(self: &Arc<Self>, log_interval_sec: u64) {
        let stats = self.clone();
        let period = Duration::from_secs(log_interval_sec.max(1));
        tokio::spawn(async move {
            let mut interval = time::interval(period);
            loop {
                interval.tick().await;
                stats.dump_stats();
            }
        });
    }

    pub fn inc_from_device(&self) {
        self.from_device.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_to_device(&self) {
        self.to_device.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_blocked(&self) {
        self.blocked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_forwarded(&self) {
        self.forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_gateway_tx(&self) {
        self.gateway_tx.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_gateway_rx(&self) {
        self.gateway_rx.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_errors(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            from_device: self.from_device.load(Ordering::Relaxed),
            to_device: self.to_device.load(Ordering::Relaxed),
            blocked: self.blocked.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            gateway_tx: self.gateway_tx.load(Ordering::Relaxed),
            gateway_rx: self.gateway_rx.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }

    fn dump_stats(&self) {
        let s = self.snapshot();
        let queries = s.blocked + s.forwarded;
        info!(
            "STATS DUMP: Device in/out: {}/{}, DNS: {} (blocked {} = {:.1}%), Gateway tx/rx: {}/{}, Errors: {}",
            s.from_device,
            s.to_device,
            queries,
            s.blocked,
            if queries > 0 {
                (s.blocked as f64 / queries as f64) * 100.0
            } else {
                0.0
            },
            s.gateway_tx,
            s.gateway_rx,
            s.errors
        );
    }
}
