//! Shard counters exposed for external observation.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Stats {
    num_runs: AtomicU64,
    corpus_active: AtomicU64,
    corpus_total: AtomicU64,
    num_features: AtomicU64,
    covered_pcs: AtomicU64,
    num_crashes: AtomicU64,
    num_reproducers: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_num_runs(&self, n: u64) {
        self.num_runs.store(n, Ordering::Relaxed);
    }

    pub fn num_runs(&self) -> u64 {
        self.num_runs.load(Ordering::Relaxed)
    }

    pub fn set_corpus_active(&self, n: u64) {
        self.corpus_active.store(n, Ordering::Relaxed);
    }

    pub fn corpus_active(&self) -> u64 {
        self.corpus_active.load(Ordering::Relaxed)
    }

    pub fn set_corpus_total(&self, n: u64) {
        self.corpus_total.store(n, Ordering::Relaxed);
    }

    pub fn corpus_total(&self) -> u64 {
        self.corpus_total.load(Ordering::Relaxed)
    }

    pub fn set_num_features(&self, n: u64) {
        self.num_features.store(n, Ordering::Relaxed);
    }

    pub fn num_features(&self) -> u64 {
        self.num_features.load(Ordering::Relaxed)
    }

    pub fn set_covered_pcs(&self, n: u64) {
        self.covered_pcs.store(n, Ordering::Relaxed);
    }

    pub fn covered_pcs(&self) -> u64 {
        self.covered_pcs.load(Ordering::Relaxed)
    }

    pub fn inc_crashes(&self) {
        self.num_crashes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn num_crashes(&self) -> u64 {
        self.num_crashes.load(Ordering::Relaxed)
    }

    pub fn inc_reproducers(&self) {
        self.num_reproducers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn num_reproducers(&self) -> u64 {
        self.num_reproducers.load(Ordering::Relaxed)
    }
}
