use crate::access::SessionId;
use crate::session::SessionStatus;
use serde::{Deserialize, Serialize};
use std::ops::{Add, AddAssign};
use std::sync::atomic::{AtomicU64, Ordering};

/// Sent/received byte counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Traffic {
    /// Bytes sent to the client
    pub sent: u64,
    /// Bytes received from the client
    pub received: u64,
}

impl Traffic {
    pub fn new(sent: u64, received: u64) -> Self {
        Self { sent, received }
    }

    pub fn is_zero(&self) -> bool {
        self.sent == 0 && self.received == 0
    }

    pub fn total(&self) -> u64 {
        self.sent.saturating_add(self.received)
    }
}

impl Add for Traffic {
    type Output = Traffic;

    fn add(self, rhs: Traffic) -> Traffic {
        Traffic {
            sent: self.sent.saturating_add(rhs.sent),
            received: self.received.saturating_add(rhs.received),
        }
    }
}

impl AddAssign for Traffic {
    fn add_assign(&mut self, rhs: Traffic) {
        *self = *self + rhs;
    }
}

/// Usage accumulator for one session
///
/// `pending_*` holds the delta since the last successful sync and is drained
/// with `swap(0)`, so a concurrent `add` lands either in the taken snapshot or
/// in the next one, never in both and never in neither.
#[derive(Debug, Default)]
pub struct UsageCounter {
    pending_sent: AtomicU64,
    pending_received: AtomicU64,
    total_sent: AtomicU64,
    total_received: AtomicU64,
}

impl UsageCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add bytes to the pending delta and lifetime totals
    pub fn add(&self, sent: u64, received: u64) {
        if sent > 0 {
            self.pending_sent.fetch_add(sent, Ordering::AcqRel);
            self.total_sent.fetch_add(sent, Ordering::Relaxed);
        }
        if received > 0 {
            self.pending_received.fetch_add(received, Ordering::AcqRel);
            self.total_received.fetch_add(received, Ordering::Relaxed);
        }
    }

    /// Take the pending delta and reset it to zero
    pub fn take(&self) -> Traffic {
        Traffic {
            sent: self.pending_sent.swap(0, Ordering::AcqRel),
            received: self.pending_received.swap(0, Ordering::AcqRel),
        }
    }

    /// Put back a delta that could not be delivered
    pub fn restore(&self, traffic: Traffic) {
        self.pending_sent.fetch_add(traffic.sent, Ordering::AcqRel);
        self.pending_received
            .fetch_add(traffic.received, Ordering::AcqRel);
    }

    /// Current pending delta without resetting it
    pub fn peek(&self) -> Traffic {
        Traffic {
            sent: self.pending_sent.load(Ordering::Acquire),
            received: self.pending_received.load(Ordering::Acquire),
        }
    }

    /// Lifetime totals
    pub fn total(&self) -> Traffic {
        Traffic {
            sent: self.total_sent.load(Ordering::Relaxed),
            received: self.total_received.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of one session for status output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStats {
    pub session_id: SessionId,
    pub token_id: String,
    pub status: SessionStatus,
    pub stream_count: usize,
    /// Usage not yet reported to the access manager
    pub pending: Traffic,
    /// Usage since the session was created
    pub total: Traffic,
    pub age_secs: u64,
    pub idle_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_take_resets_pending_only() {
        let counter = UsageCounter::new();
        counter.add(100, 200);
        counter.add(1, 2);

        assert_eq!(counter.take(), Traffic::new(101, 202));
        assert!(counter.peek().is_zero());
        assert_eq!(counter.total(), Traffic::new(101, 202));
    }

    #[test]
    fn test_restore_keeps_delta_for_next_sync() {
        let counter = UsageCounter::new();
        counter.add(10, 20);
        let delta = counter.take();
        counter.add(5, 5);
        counter.restore(delta);

        assert_eq!(counter.take(), Traffic::new(15, 25));
        assert_eq!(counter.total(), Traffic::new(15, 25));
    }

    #[test]
    fn test_concurrent_add_and_take_conserve_bytes() {
        let counter = Arc::new(UsageCounter::new());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let counter = counter.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..10_000 {
                    counter.add(1, 2);
                }
            }));
        }

        let mut reported = Traffic::default();
        for _ in 0..100 {
            reported += counter.take();
        }
        for handle in handles {
            handle.join().unwrap();
        }
        reported += counter.take();

        assert_eq!(reported, Traffic::new(40_000, 80_000));
    }

    #[test]
    fn test_traffic_arithmetic() {
        let mut t = Traffic::new(1, 2) + Traffic::new(3, 4);
        t += Traffic::new(u64::MAX, 0);
        assert_eq!(t.sent, u64::MAX);
        assert_eq!(t.received, 6);
        assert!(!t.is_zero());
        assert!(Traffic::default().is_zero());
    }
}
