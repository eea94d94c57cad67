//! Exchange counters and the periodic throughput reporter.
//!
//! Both roles receive an `Observer` when they are created instead of
//! touching process-wide state. `Metrics` is the lock-free implementation
//! the binary wires in; the reporter reads it without coordination, so a
//! report is an eventually-consistent snapshot.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Events emitted by the initiator and the endpoint.
pub trait Observer: Send + Sync {
    /// Initiator wrote a ping of `bytes` encoded bytes.
    fn ping_sent(&self, bytes: usize);
    /// Endpoint decoded a ping.
    fn ping_received(&self);
    /// Endpoint flushed a pong of `bytes` encoded bytes.
    fn pong_sent(&self, bytes: usize);
    /// Initiator decoded a pong.
    fn pong_received(&self);
    /// Endpoint exchange ended because the initiator went away.
    fn exchange_closed(&self);
    /// Endpoint exchange ended with an unexpected error.
    fn exchange_failed(&self);
}

/// Atomic counters for both roles.
#[derive(Debug, Default)]
pub struct Metrics {
    pings_sent: AtomicU64,
    pings_received: AtomicU64,
    pongs_sent: AtomicU64,
    pongs_received: AtomicU64,
    ping_bytes: AtomicU64,
    pong_bytes: AtomicU64,
    exchanges_closed: AtomicU64,
    exchanges_failed: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub pings_sent: u64,
    pub pings_received: u64,
    pub pongs_sent: u64,
    pub pongs_received: u64,
    pub ping_bytes: u64,
    pub pong_bytes: u64,
    pub exchanges_closed: u64,
    pub exchanges_failed: u64,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            pings_sent: self.pings_sent.load(Ordering::Relaxed),
            pings_received: self.pings_received.load(Ordering::Relaxed),
            pongs_sent: self.pongs_sent.load(Ordering::Relaxed),
            pongs_received: self.pongs_received.load(Ordering::Relaxed),
            ping_bytes: self.ping_bytes.load(Ordering::Relaxed),
            pong_bytes: self.pong_bytes.load(Ordering::Relaxed),
            exchanges_closed: self.exchanges_closed.load(Ordering::Relaxed),
            exchanges_failed: self.exchanges_failed.load(Ordering::Relaxed),
        }
    }
}

impl Observer for Metrics {
    fn ping_sent(&self, bytes: usize) {
        self.pings_sent.fetch_add(1, Ordering::Relaxed);
        self.ping_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn ping_received(&self) {
        self.pings_received.fetch_add(1, Ordering::Relaxed);
    }

    fn pong_sent(&self, bytes: usize) {
        self.pongs_sent.fetch_add(1, Ordering::Relaxed);
        self.pong_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn pong_received(&self) {
        self.pongs_received.fetch_add(1, Ordering::Relaxed);
    }

    fn exchange_closed(&self) {
        self.exchanges_closed.fetch_add(1, Ordering::Relaxed);
    }

    fn exchange_failed(&self) {
        self.exchanges_failed.fetch_add(1, Ordering::Relaxed);
    }
}

/// Per-second rates derived from a snapshot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rates {
    pub server_pongs_per_second: f64,
    pub client_pings_per_second: f64,
    pub client_pongs_per_second: f64,
    pub client_write_mbytes_per_second: f64,
}

impl Snapshot {
    pub fn rates(&self, elapsed: Duration) -> Rates {
        let secs = elapsed.as_secs_f64();
        if secs == 0.0 {
            return Rates {
                server_pongs_per_second: 0.0,
                client_pings_per_second: 0.0,
                client_pongs_per_second: 0.0,
                client_write_mbytes_per_second: 0.0,
            };
        }
        Rates {
            server_pongs_per_second: self.pongs_sent as f64 / secs,
            client_pings_per_second: self.pings_sent as f64 / secs,
            client_pongs_per_second: self.pongs_received as f64 / secs,
            client_write_mbytes_per_second: self.ping_bytes as f64 / secs / (1024.0 * 1024.0),
        }
    }
}

/// Log throughput since start every `period` until cancelled.
pub async fn report(metrics: Arc<Metrics>, period: Duration, cancel: CancellationToken) {
    let start = Instant::now();
    let mut ticker = interval_at(start + period, period);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let rates = metrics.snapshot().rates(start.elapsed());
        info!(
            server_pongs_per_second = rates.server_pongs_per_second,
            client_pings_per_second = rates.client_pings_per_second,
            client_pongs_per_second = rates.client_pongs_per_second,
            client_write_mbytes_per_second = rates.client_write_mbytes_per_second,
            "measurements"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let metrics = Metrics::new();
        metrics.ping_sent(23);
        metrics.ping_sent(23);
        metrics.ping_received();
        metrics.pong_sent(15);
        metrics.pong_received();
        metrics.exchange_closed();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.pings_sent, 2);
        assert_eq!(snapshot.ping_bytes, 46);
        assert_eq!(snapshot.pings_received, 1);
        assert_eq!(snapshot.pongs_sent, 1);
        assert_eq!(snapshot.pong_bytes, 15);
        assert_eq!(snapshot.pongs_received, 1);
        assert_eq!(snapshot.exchanges_closed, 1);
        assert_eq!(snapshot.exchanges_failed, 0);
    }

    #[test]
    fn test_rates() {
        let snapshot = Snapshot {
            pings_sent: 10,
            pongs_sent: 8,
            pongs_received: 6,
            ping_bytes: 2 * 1024 * 1024,
            ..Default::default()
        };
        let rates = snapshot.rates(Duration::from_secs(2));
        assert_eq!(rates.client_pings_per_second, 5.0);
        assert_eq!(rates.server_pongs_per_second, 4.0);
        assert_eq!(rates.client_pongs_per_second, 3.0);
        assert_eq!(rates.client_write_mbytes_per_second, 1.0);

        assert_eq!(snapshot.rates(Duration::ZERO).client_pings_per_second, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reporter_stops_on_cancel() {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(report(
            Metrics::new(),
            Duration::from_secs(5),
            cancel.clone(),
        ));

        tokio::time::sleep(Duration::from_secs(12)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("reporter did not stop")
            .unwrap();
    }
}
