//! Global atomic counters for sandbox observability.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event (e.g. at the end of a run).

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lightweight atomic counters — no allocations, no locking.
pub struct Metrics {
    runs_started: AtomicU64,
    runs_failed: AtomicU64,
    gated_calls: AtomicU64,
    budget_rejections: AtomicU64,
    capability_denials: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            runs_started: AtomicU64::new(0),
            runs_failed: AtomicU64::new(0),
            gated_calls: AtomicU64::new(0),
            budget_rejections: AtomicU64::new(0),
            capability_denials: AtomicU64::new(0),
        }
    }

    pub fn inc_runs_started(&self) {
        self.runs_started.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "runs_started", "counter incremented");
    }

    pub fn inc_runs_failed(&self) {
        self.runs_failed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "runs_failed", "counter incremented");
    }

    /// A gated call passed the gate and was delegated.
    pub fn inc_gated_calls(&self) {
        self.gated_calls.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "gated_calls", "counter incremented");
    }

    pub fn inc_budget_rejections(&self) {
        self.budget_rejections.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "budget_rejections", "counter incremented");
    }

    pub fn inc_capability_denials(&self) {
        self.capability_denials.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "capability_denials", "counter incremented");
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            runs_started = self.runs_started(),
            runs_failed = self.runs_failed(),
            gated_calls = self.gated_calls(),
            budget_rejections = self.budget_rejections(),
            capability_denials = self.capability_denials(),
        );
    }

    pub fn runs_started(&self) -> u64 {
        self.runs_started.load(Ordering::Relaxed)
    }

    pub fn runs_failed(&self) -> u64 {
        self.runs_failed.load(Ordering::Relaxed)
    }

    pub fn gated_calls(&self) -> u64 {
        self.gated_calls.load(Ordering::Relaxed)
    }

    pub fn budget_rejections(&self) -> u64 {
        self.budget_rejections.load(Ordering::Relaxed)
    }

    pub fn capability_denials(&self) -> u64 {
        self.capability_denials.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        self.runs_started.store(0, Ordering::Relaxed);
        self.runs_failed.store(0, Ordering::Relaxed);
        self.gated_calls.store(0, Ordering::Relaxed);
        self.budget_rejections.store(0, Ordering::Relaxed);
        self.capability_denials.store(0, Ordering::Relaxed);
    }
}
