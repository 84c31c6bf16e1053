//! Runtime statistics of the command router.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared by the consumer factory, delegation handler and
/// response sender.
#[derive(Debug, Default)]
pub struct RouterStats {
    commands_received: AtomicU64,
    commands_forwarded: AtomicU64,
    commands_released: AtomicU64,
    commands_rejected: AtomicU64,
    responses_sent: AtomicU64,
    responses_failed: AtomicU64,
    recreation_sweeps: AtomicU64,
}

/// Point-in-time copy of [`RouterStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterStatsSnapshot {
    /// Commands received on tenant links
    pub commands_received: u64,
    /// Commands accepted by the target adapter instance
    pub commands_forwarded: u64,
    /// Commands released (no target, forward failure)
    pub commands_released: u64,
    /// Commands rejected (malformed, rejected by target)
    pub commands_rejected: u64,
    /// Command responses accepted downstream
    pub responses_sent: u64,
    /// Command responses that could not be sent
    pub responses_failed: u64,
    /// Consumer recreation sweeps started
    pub recreation_sweeps: u64,
}

impl RouterStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn command_received(&self) {
        self.commands_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn command_forwarded(&self) {
        self.commands_forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn command_released(&self) {
        self.commands_released.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn command_rejected(&self) {
        self.commands_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn response_sent(&self) {
        self.responses_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn response_failed(&self) {
        self.responses_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn recreation_sweep_started(&self) {
        self.recreation_sweeps.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a snapshot of all counters.
    pub fn snapshot(&self) -> RouterStatsSnapshot {
        RouterStatsSnapshot {
            commands_received: self.commands_received.load(Ordering::Relaxed),
            commands_forwarded: self.commands_forwarded.load(Ordering::Relaxed),
            commands_released: self.commands_released.load(Ordering::Relaxed),
            commands_rejected: self.commands_rejected.load(Ordering::Relaxed),
            responses_sent: self.responses_sent.load(Ordering::Relaxed),
            responses_failed: self.responses_failed.load(Ordering::Relaxed),
            recreation_sweeps: self.recreation_sweeps.load(Ordering::Relaxed),
        }
    }
}
