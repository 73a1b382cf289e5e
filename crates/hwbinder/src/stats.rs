//! Dispatch statistics

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters updated by the dispatcher and the transport
#[derive(Debug, Default)]
pub struct DispatchStats {
    pub transactions_received: AtomicU64,
    pub oneway_received: AtomicU64,
    pub replies_sent: AtomicU64,
    pub unreplied: AtomicU64,
    pub handler_errors: AtomicU64,
    /// Handler errors raised after the reply had already gone out
    pub errors_after_reply: AtomicU64,
    pub bytes_received: AtomicU64,
    pub bytes_sent: AtomicU64,
}

impl DispatchStats {
    pub fn snapshot(&self) -> DispatchStatsSnapshot {
        DispatchStatsSnapshot {
            transactions_received: self.transactions_received.load(Ordering::Relaxed),
            oneway_received: self.oneway_received.load(Ordering::Relaxed),
            replies_sent: self.replies_sent.load(Ordering::Relaxed),
            unreplied: self.unreplied.load(Ordering::Relaxed),
            handler_errors: self.handler_errors.load(Ordering::Relaxed),
            errors_after_reply: self.errors_after_reply.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add(counter: &AtomicU64, amount: usize) {
        counter.fetch_add(amount as u64, Ordering::Relaxed);
    }
}

/// Snapshot of dispatch statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchStatsSnapshot {
    pub transactions_received: u64,
    pub oneway_received: u64,
    pub replies_sent: u64,
    pub unreplied: u64,
    pub handler_errors: u64,
    pub errors_after_reply: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
}
