//! Tunnel byte counters

use std::sync::atomic::{AtomicU64, Ordering};

/// Decrypted-inbound and encrypted-outbound byte counts.
///
/// Written only by the adapter's driver task (and the deliver callback, which
/// runs on it); readable from any thread without locking. Monotone between a
/// start and the next stop/update, zeroed on start and update.
#[derive(Debug, Default)]
pub struct TrafficCounters {
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
}

impl TrafficCounters {
    /// Snapshot as `(bytes_received, bytes_sent)`
    pub fn snapshot(&self) -> (u64, u64) {
        (
            self.bytes_received.load(Ordering::Relaxed),
            self.bytes_sent.load(Ordering::Relaxed),
        )
    }

    pub(crate) fn add_rx(&self, n: u64) {
        self.bytes_received.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_tx(&self, n: u64) {
        self.bytes_sent.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn reset(&self) {
        self.bytes_received.store(0, Ordering::Relaxed);
        self.bytes_sent.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate_and_reset() {
        let counters = TrafficCounters::default();
        assert_eq!(counters.snapshot(), (0, 0));

        counters.add_rx(100);
        counters.add_rx(50);
        counters.add_tx(20);
        assert_eq!(counters.snapshot(), (150, 20));

        counters.reset();
        assert_eq!(counters.snapshot(), (0, 0));
    }
}
