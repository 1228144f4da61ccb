//! Process-wide lifecycle counters.
//!
//! Incremented at the call site; [`Metrics::flush`] emits the current values
//! as one `tracing::info!` event (the daemon flushes after each sweep).

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    transitions: AtomicU64,
    aborts: AtomicU64,
    continues: AtomicU64,
    reconciliations: AtomicU64,
    conflicts: AtomicU64,
    notify_failures: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            transitions: AtomicU64::new(0),
            aborts: AtomicU64::new(0),
            continues: AtomicU64::new(0),
            reconciliations: AtomicU64::new(0),
            conflicts: AtomicU64::new(0),
            notify_failures: AtomicU64::new(0),
        }
    }

    /// A status transition was committed.
    pub fn inc_transitions(&self) {
        self.transitions.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "transitions", "counter incremented");
    }

    pub fn inc_aborts(&self) {
        self.aborts.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "aborts", "counter incremented");
    }

    pub fn inc_continues(&self) {
        self.continues.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "continues", "counter incremented");
    }

    /// A stuck run was repaired by reconciliation.
    pub fn inc_reconciliations(&self) {
        self.reconciliations.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "reconciliations", "counter incremented");
    }

    /// A guarded update matched zero rows.
    pub fn inc_conflicts(&self) {
        self.conflicts.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "conflicts", "counter incremented");
    }

    /// A best-effort workflow notification was not delivered.
    pub fn inc_notify_failures(&self) {
        self.notify_failures.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "notify_failures", "counter incremented");
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            transitions = self.transitions(),
            aborts = self.aborts(),
            continues = self.continues(),
            reconciliations = self.reconciliations(),
            conflicts = self.conflicts(),
            notify_failures = self.notify_failures(),
        );
    }

    pub fn transitions(&self) -> u64 {
        self.transitions.load(Ordering::Relaxed)
    }

    pub fn aborts(&self) -> u64 {
        self.aborts.load(Ordering::Relaxed)
    }

    pub fn continues(&self) -> u64 {
        self.continues.load(Ordering::Relaxed)
    }

    pub fn reconciliations(&self) -> u64 {
        self.reconciliations.load(Ordering::Relaxed)
    }

    pub fn conflicts(&self) -> u64 {
        self.conflicts.load(Ordering::Relaxed)
    }

    pub fn notify_failures(&self) -> u64 {
        self.notify_failures.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        self.transitions.store(0, Ordering::Relaxed);
        self.aborts.store(0, Ordering::Relaxed);
        self.continues.store(0, Ordering::Relaxed);
        self.reconciliations.store(0, Ordering::Relaxed);
        self.conflicts.store(0, Ordering::Relaxed);
        self.notify_failures.store(0, Ordering::Relaxed);
    }
}
