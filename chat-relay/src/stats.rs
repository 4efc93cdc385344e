use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Process-wide relay counters, exposed over `GET /stats`.
#[derive(Debug, Default)]
pub struct RelayStats {
    connections_open: AtomicU64,
    frames_malformed: AtomicU64,
    messages_routed: AtomicU64,
    deliveries: AtomicU64,
    delivery_failures: AtomicU64,
    unknown_recipients: AtomicU64,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub connections_open: u64,
    pub identities_registered: u64,
    pub frames_malformed: u64,
    pub messages_routed: u64,
    pub deliveries: u64,
    pub delivery_failures: u64,
    pub unknown_recipients: u64,
}

impl RelayStats {
    pub fn connection_opened(&self) {
        self.connections_open.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.connections_open.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn frame_malformed(&self) {
        self.frames_malformed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_routed(&self, delivered: usize, failed: usize, unknown_recipient: bool) {
        self.messages_routed.fetch_add(1, Ordering::Relaxed);
        self.deliveries.fetch_add(delivered as u64, Ordering::Relaxed);
        self.delivery_failures.fetch_add(failed as u64, Ordering::Relaxed);
        if unknown_recipient {
            self.unknown_recipients.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// `identities_registered` comes from the registry, which the stats do not own.
    pub fn snapshot(&self, identities_registered: usize) -> StatsSnapshot {
        StatsSnapshot {
            connections_open: self.connections_open.load(Ordering::Relaxed),
            identities_registered: identities_registered as u64,
            frames_malformed: self.frames_malformed.load(Ordering::Relaxed),
            messages_routed: self.messages_routed.load(Ordering::Relaxed),
            deliveries: self.deliveries.load(Ordering::Relaxed),
            delivery_failures: self.delivery_failures.load(Ordering::Relaxed),
            unknown_recipients: self.unknown_recipients.load(Ordering::Relaxed),
        }
    }
}
