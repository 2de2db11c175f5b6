//! Relay metrics hooks

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Lifecycle event of a session or relayed stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delta {
    Connect,
    Disconnect,
    /// Never got established.
    Failed,
}

pub trait ServerMetrics: Send + Sync {
    fn record_session(&self, delta: Delta);
    fn record_stream(&self, delta: Delta);
}

pub struct NoopMetrics;

impl ServerMetrics for NoopMetrics {
    fn record_session(&self, _: Delta) {}
    fn record_stream(&self, _: Delta) {}
}

#[derive(Debug, Default)]
struct Counters {
    active: AtomicI64,
    total: AtomicU64,
    failed: AtomicU64,
}

impl Counters {
    fn record(&self, delta: Delta) {
        match delta {
            Delta::Connect => {
                self.active.fetch_add(1, Ordering::Relaxed);
                self.total.fetch_add(1, Ordering::Relaxed);
            }
            Delta::Disconnect => {
                self.active.fetch_sub(1, Ordering::Relaxed);
            }
            Delta::Failed => {
                self.failed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// In-process counters for sessions and streams.
#[derive(Debug, Default)]
pub struct CounterMetrics {
    sessions: Counters,
    streams: Counters,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    pub active_sessions: i64,
    pub total_sessions: u64,
    pub failed_sessions: u64,
    pub active_streams: i64,
    pub total_streams: u64,
    pub failed_streams: u64,
}

impl CounterMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            active_sessions: self.sessions.active.load(Ordering::Relaxed),
            total_sessions: self.sessions.total.load(Ordering::Relaxed),
            failed_sessions: self.sessions.failed.load(Ordering::Relaxed),
            active_streams: self.streams.active.load(Ordering::Relaxed),
            total_streams: self.streams.total.load(Ordering::Relaxed),
            failed_streams: self.streams.failed.load(Ordering::Relaxed),
        }
    }
}

impl ServerMetrics for CounterMetrics {
    fn record_session(&self, delta: Delta) {
        self.sessions.record(delta);
    }

    fn record_stream(&self, delta: Delta) {
        self.streams.record(delta);
    }
}
