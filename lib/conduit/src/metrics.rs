//! Aggregate counters exposed by the networking core.

use crate::net::support::StatCounter;
use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters. All increments are relaxed; the snapshot is advisory.
pub struct Metrics {
    pub connections_initiated: AtomicU64,
    pub connections_received: AtomicU64,
    pub setups_started: AtomicU64,
    pub setups_completed: AtomicU64,
    pub setups_failed: AtomicU64,
    pub data_sent: AtomicU64,
    pub data_received: AtomicU64,
    pub commands_sent: AtomicU64,
    pub commands_received: AtomicU64,
    pub instructions_processed: AtomicU64,
}

#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct MetricsSnapshot {
    pub connections_initiated: StatCounter,
    pub connections_received: StatCounter,
    pub setups_started: StatCounter,
    pub setups_completed: StatCounter,
    pub setups_failed: StatCounter,
    pub data_sent: StatCounter,
    pub data_received: StatCounter,
    pub commands_sent: StatCounter,
    pub commands_received: StatCounter,
    pub instructions_processed: StatCounter,
}

impl Metrics {
    pub fn new() -> Metrics {
        Metrics {
            connections_initiated: AtomicU64::new(0),
            connections_received: AtomicU64::new(0),
            setups_started: AtomicU64::new(0),
            setups_completed: AtomicU64::new(0),
            setups_failed: AtomicU64::new(0),
            data_sent: AtomicU64::new(0),
            data_received: AtomicU64::new(0),
            commands_sent: AtomicU64::new(0),
            commands_received: AtomicU64::new(0),
            instructions_processed: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_initiated: self.connections_initiated.load(Ordering::Relaxed),
            connections_received: self.connections_received.load(Ordering::Relaxed),
            setups_started: self.setups_started.load(Ordering::Relaxed),
            setups_completed: self.setups_completed.load(Ordering::Relaxed),
            setups_failed: self.setups_failed.load(Ordering::Relaxed),
            data_sent: self.data_sent.load(Ordering::Relaxed),
            data_received: self.data_received.load(Ordering::Relaxed),
            commands_sent: self.commands_sent.load(Ordering::Relaxed),
            commands_received: self.commands_received.load(Ordering::Relaxed),
            instructions_processed: self.instructions_processed.load(Ordering::Relaxed),
        }
    }
}
