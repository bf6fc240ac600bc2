//! Keepalive with PING/PONG and RTT measurement.
//!
//! The correlation value of a ping is the sender's monotonic clock in
//! nanoseconds, so the pong alone is enough to compute the round trip.

use once_cell::sync::Lazy;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

static START: Lazy<Instant> = Lazy::new(Instant::now);

/// Generate a correlation ID based on monotonic time
pub fn now_corr_id() -> u64 {
    START.elapsed().as_nanos() as u64
}

/// Calculate RTT from the correlation ID echoed in a PONG
pub fn calc_rtt_from_corr(corr_id: u64) -> Option<Duration> {
    let now_ns = now_corr_id();
    now_ns.checked_sub(corr_id).map(Duration::from_nanos)
}

/// Counters maintained by the channel loops
#[derive(Debug, Default)]
pub struct ChannelStats {
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    messages_in: AtomicU64,
    messages_out: AtomicU64,
    last_rtt_ns: AtomicU64,
}

/// Point-in-time copy of [`ChannelStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Transport bytes received
    pub bytes_in: u64,
    /// Transport bytes written
    pub bytes_out: u64,
    /// Logical messages received
    pub messages_in: u64,
    /// Logical messages enqueued
    pub messages_out: u64,
    /// Most recent RTT measurement
    pub last_rtt: Option<Duration>,
}

impl ChannelStats {
    pub(crate) fn record_read(&self, n: usize) {
        self.bytes_in.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_write(&self, n: usize) {
        self.bytes_out.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_message_in(&self) {
        self.messages_in.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_message_out(&self) {
        self.messages_out.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rtt(&self, rtt: Duration) {
        // 0 means "no sample yet"
        let ns = (rtt.as_nanos() as u64).max(1);
        self.last_rtt_ns.store(ns, Ordering::Relaxed);
    }

    /// Copy the current counters
    pub fn snapshot(&self) -> StatsSnapshot {
        let rtt = self.last_rtt_ns.load(Ordering::Relaxed);
        StatsSnapshot {
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            messages_in: self.messages_in.load(Ordering::Relaxed),
            messages_out: self.messages_out.load(Ordering::Relaxed),
            last_rtt: (rtt != 0).then(|| Duration::from_nanos(rtt)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_corr_id_generation() {
        let id1 = now_corr_id();
        std::thread::sleep(Duration::from_millis(1));
        let id2 = now_corr_id();

        assert!(id2 > id1, "Correlation IDs should be monotonically increasing");
    }

    #[test]
    fn test_rtt_calculation() {
        let start_corr = now_corr_id();
        std::thread::sleep(Duration::from_millis(10));

        let rtt = calc_rtt_from_corr(start_corr).unwrap();
        assert!(rtt >= Duration::from_millis(10));
        assert!(calc_rtt_from_corr(u64::MAX).is_none());
    }

    #[test]
    fn test_stats_snapshot() {
        let stats = ChannelStats::default();
        assert_eq!(stats.snapshot().last_rtt, None);

        stats.record_read(10);
        stats.record_write(7);
        stats.record_message_in();
        stats.record_rtt(Duration::from_micros(250));

        let snap = stats.snapshot();
        assert_eq!(snap.bytes_in, 10);
        assert_eq!(snap.bytes_out, 7);
        assert_eq!(snap.messages_in, 1);
        assert_eq!(snap.messages_out, 0);
        assert_eq!(snap.last_rtt, Some(Duration::from_micros(250)));
    }
}
