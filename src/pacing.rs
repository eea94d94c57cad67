//! Tick source for outbound frames.

use crate::config::Mode;
use std::time::Duration;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

/// Decides when the next outbound frame may be written.
///
/// `tick` is cancel safe, so it can sit in a `select!` next to reads.
#[derive(Debug)]
pub enum Pacer {
    Paced(Interval),
    /// Always ready. Callers rely on tokio's cooperative budget to yield.
    Unpaced,
}

impl Pacer {
    pub fn new(mode: Mode, period: Duration) -> Self {
        match mode {
            Mode::Paced => {
                // First tick after one full period, not immediately.
                let mut interval = interval_at(Instant::now() + period, period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                Pacer::Paced(interval)
            }
            Mode::MaxThroughput => Pacer::Unpaced,
        }
    }

    pub async fn tick(&mut self) {
        match self {
            Pacer::Paced(interval) => {
                interval.tick().await;
            }
            Pacer::Unpaced => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_paced_waits_full_period() {
        let start = Instant::now();
        let mut pacer = Pacer::new(Mode::Paced, Duration::from_secs(1));

        pacer.tick().await;
        assert_eq!(start.elapsed(), Duration::from_secs(1));

        pacer.tick().await;
        assert_eq!(start.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unpaced_is_always_ready() {
        let start = Instant::now();
        let mut pacer = Pacer::new(Mode::MaxThroughput, Duration::from_secs(1));
        for _ in 0..100 {
            pacer.tick().await;
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
    }
}
