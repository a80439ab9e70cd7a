use std::sync::atomic::{AtomicU64, Ordering};

use tunnelmux_relay::RelayOutcome;

/// Running counters for one exit server
#[derive(Debug, Default)]
pub struct ExitStats {
    sessions_accepted: AtomicU64,
    streams_accepted: AtomicU64,
    dials_failed: AtomicU64,
    relays_completed: AtomicU64,
    /// Client to destination
    bytes_up: AtomicU64,
    /// Destination to client
    bytes_down: AtomicU64,
}

/// Point-in-time copy of `ExitStats`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExitStatsSnapshot {
    pub sessions_accepted: u64,
    pub streams_accepted: u64,
    pub dials_failed: u64,
    pub relays_completed: u64,
    pub bytes_up: u64,
    pub bytes_down: u64,
}

impl ExitStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn session_accepted(&self) {
        self.sessions_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn stream_accepted(&self) {
        self.streams_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn dial_failed(&self) {
        self.dials_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a finished relay between a stream (A) and its destination (B)
    pub(crate) fn relay_completed(&self, outcome: &RelayOutcome) {
        self.relays_completed.fetch_add(1, Ordering::Relaxed);
        self.bytes_up.fetch_add(outcome.a_to_b.bytes, Ordering::Relaxed);
        self.bytes_down.fetch_add(outcome.b_to_a.bytes, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ExitStatsSnapshot {
        ExitStatsSnapshot {
            sessions_accepted: self.sessions_accepted.load(Ordering::Relaxed),
            streams_accepted: self.streams_accepted.load(Ordering::Relaxed),
            dials_failed: self.dials_failed.load(Ordering::Relaxed),
            relays_completed: self.relays_completed.load(Ordering::Relaxed),
            bytes_up: self.bytes_up.load(Ordering::Relaxed),
            bytes_down: self.bytes_down.load(Ordering::Relaxed),
        }
    }
}
