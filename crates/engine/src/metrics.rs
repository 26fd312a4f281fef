//! Transaction lifecycle counters
//!
//! Counters are process-wide per manager and updated with relaxed atomics;
//! a [`TransactionMetrics`] snapshot is not a consistent cut across counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters owned by a transaction manager
#[derive(Debug, Default)]
pub struct TransactionCounters {
    active_count: AtomicU64,
    total_started: AtomicU64,
    total_committed: AtomicU64,
    total_rolled_back: AtomicU64,
    unexpected_rollbacks: AtomicU64,
}

impl TransactionCounters {
    /// Create zeroed counters
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new actual transaction
    pub fn record_start(&self) {
        self.active_count.fetch_add(1, Ordering::Relaxed);
        self.total_started.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a new transaction committing
    pub fn record_commit(&self) {
        self.decrement_active();
        self.total_committed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a new transaction rolling back
    pub fn record_rollback(&self) {
        self.decrement_active();
        self.total_rolled_back.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a transaction that ended without a clean commit or rollback
    pub fn record_failure(&self) {
        self.decrement_active();
    }

    /// Record a commit request that was turned into a rollback
    pub fn record_unexpected_rollback(&self) {
        self.unexpected_rollbacks.fetch_add(1, Ordering::Relaxed);
    }

    fn decrement_active(&self) {
        // Saturating so a stray completion can never underflow
        let _ = self
            .active_count
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |x| {
                Some(x.saturating_sub(1))
            });
    }

    /// Take a snapshot
    pub fn snapshot(&self) -> TransactionMetrics {
        let started = self.total_started.load(Ordering::Relaxed);
        let committed = self.total_committed.load(Ordering::Relaxed);

        TransactionMetrics {
            active_count: self.active_count.load(Ordering::Relaxed),
            total_started: started,
            total_committed: committed,
            total_rolled_back: self.total_rolled_back.load(Ordering::Relaxed),
            unexpected_rollbacks: self.unexpected_rollbacks.load(Ordering::Relaxed),
            commit_rate: if started > 0 {
                committed as f64 / started as f64
            } else {
                0.0
            },
        }
    }
}

/// Transaction metrics
///
/// Only actual transactions begun by the manager are counted; scopes that
/// join an existing transaction or run without one are not.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionMetrics {
    /// Transactions begun and not yet completed
    pub active_count: u64,
    /// Total transactions begun
    pub total_started: u64,
    /// Total transactions committed
    pub total_committed: u64,
    /// Total transactions rolled back
    pub total_rolled_back: u64,
    /// Commit requests answered with a rollback
    pub unexpected_rollbacks: u64,
    /// Commit success rate (committed / started)
    pub commit_rate: f64,
}

impl TransactionMetrics {
    /// Total transactions that completed (committed + rolled back)
    pub fn total_completed(&self) -> u64 {
        self.total_committed + self.total_rolled_back
    }

    /// Rollback rate (rolled back / started)
    pub fn rollback_rate(&self) -> f64 {
        if self.total_started > 0 {
            self.total_rolled_back as f64 / self.total_started as f64
        } else {
            0.0
        }
    }
}
