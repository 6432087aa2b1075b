use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// One traffic accounting event.
#[derive(Debug, Clone, Copy)]
pub enum Stats {
    ReceivedBytes(u64),
    ReceivedPkts(u64),
    SendBytes(u64),
    SendPkts(u64),
    ErrorPkts(u64),
}

#[derive(Default)]
struct Counts {
    received_bytes: AtomicU64,
    received_pkts: AtomicU64,
    send_bytes: AtomicU64,
    send_pkts: AtomicU64,
    error_pkts: AtomicU64,
}

/// Shared traffic counters for the tunnel socket. Cloning hands out another
/// reporter over the same numbers.
#[derive(Default, Clone)]
pub struct Statistics(Arc<Counts>);

impl Statistics {
    pub fn send(&self, stats: &[Stats]) {
        for stat in stats {
            match stat {
                Stats::ReceivedBytes(n) => self.0.received_bytes.fetch_add(*n, Ordering::Relaxed),
                Stats::ReceivedPkts(n) => self.0.received_pkts.fetch_add(*n, Ordering::Relaxed),
                Stats::SendBytes(n) => self.0.send_bytes.fetch_add(*n, Ordering::Relaxed),
                Stats::SendPkts(n) => self.0.send_pkts.fetch_add(*n, Ordering::Relaxed),
                Stats::ErrorPkts(n) => self.0.error_pkts.fetch_add(*n, Ordering::Relaxed),
            };
        }
    }

    pub fn received_pkts(&self) -> u64 {
        self.0.received_pkts.load(Ordering::Relaxed)
    }

    pub fn send_pkts(&self) -> u64 {
        self.0.send_pkts.load(Ordering::Relaxed)
    }

    pub fn error_pkts(&self) -> u64 {
        self.0.error_pkts.load(Ordering::Relaxed)
    }

    /// One summary line, used when the server shuts down.
    pub fn log_summary(&self) {
        log::info!(
            "traffic summary: received={} pkts ({} bytes), sent={} pkts ({} bytes), errors={}",
            self.0.received_pkts.load(Ordering::Relaxed),
            self.0.received_bytes.load(Ordering::Relaxed),
            self.0.send_pkts.load(Ordering::Relaxed),
            self.0.send_bytes.load(Ordering::Relaxed),
            self.0.error_pkts.load(Ordering::Relaxed),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let statistics = Statistics::default();
        let reporter = statistics.clone();

        reporter.send(&[Stats::ReceivedBytes(100), Stats::ReceivedPkts(1)]);
        reporter.send(&[Stats::ReceivedPkts(1), Stats::ErrorPkts(1)]);

        assert_eq!(statistics.received_pkts(), 2);
        assert_eq!(statistics.error_pkts(), 1);
    }
}
