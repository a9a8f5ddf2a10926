//! Lifecycle event sink.
//!
//! The queue reports each outcome to a [`MetricsSink`]. Recording must not block: the call
//! happens on the message path.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// An observable outcome of the message lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueEvent {
    Sent,
    Received,
    /// A receive found nothing eligible (or was cancelled before touching the store).
    Empty,
    Committed,
    RolledBack,
    Poisoned,
    RetriesExhausted,
    Expired(u64),
    HeartbeatReset(u64),
}

pub trait MetricsSink: Send + Sync + std::fmt::Debug {
    fn record(&self, event: QueueEvent);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record(&self, _event: QueueEvent) {}
}

/// Counter-backed sink.
#[derive(Debug, Default)]
pub struct CounterMetrics {
    sent: AtomicU64,
    received: AtomicU64,
    empty: AtomicU64,
    committed: AtomicU64,
    rolled_back: AtomicU64,
    poisoned: AtomicU64,
    retries_exhausted: AtomicU64,
    expired: AtomicU64,
    heartbeat_reset: AtomicU64,
}

/// Point-in-time copy of [`CounterMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub sent: u64,
    pub received: u64,
    pub empty: u64,
    pub committed: u64,
    pub rolled_back: u64,
    pub poisoned: u64,
    pub retries_exhausted: u64,
    pub expired: u64,
    pub heartbeat_reset: u64,
}

impl MetricsSnapshot {
    /// Messages that ended in the error store.
    pub fn errors(&self) -> u64 {
        self.poisoned + self.retries_exhausted
    }
}

impl CounterMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            sent: self.sent.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            empty: self.empty.load(Ordering::Relaxed),
            committed: self.committed.load(Ordering::Relaxed),
            rolled_back: self.rolled_back.load(Ordering::Relaxed),
            poisoned: self.poisoned.load(Ordering::Relaxed),
            retries_exhausted: self.retries_exhausted.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            heartbeat_reset: self.heartbeat_reset.load(Ordering::Relaxed),
        }
    }
}

impl MetricsSink for CounterMetrics {
    fn record(&self, event: QueueEvent) {
        let (counter, by) = match event {
            QueueEvent::Sent => (&self.sent, 1),
            QueueEvent::Received => (&self.received, 1),
            QueueEvent::Empty => (&self.empty, 1),
            QueueEvent::Committed => (&self.committed, 1),
            QueueEvent::RolledBack => (&self.rolled_back, 1),
            QueueEvent::Poisoned => (&self.poisoned, 1),
            QueueEvent::RetriesExhausted => (&self.retries_exhausted, 1),
            QueueEvent::Expired(n) => (&self.expired, n),
            QueueEvent::HeartbeatReset(n) => (&self.heartbeat_reset, n),
        };
        counter.fetch_add(by, Ordering::Relaxed);
    }
}
