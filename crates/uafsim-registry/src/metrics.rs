//! Atomic counters for registry observability.
//!
//! All counters use relaxed ordering. They are diagnostic, not synchronization.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Registry operation counters.
pub struct RegistryMetrics {
    /// Chunks inserted by `create`.
    pub creates: AtomicU64,
    /// Chunks inserted by `allocate`.
    pub allocations: AtomicU64,
    /// Successful `Live -> Freed` transitions (either entry point).
    pub frees: AtomicU64,
    /// Free-like requests against an already freed chunk.
    pub double_frees: AtomicU64,
    /// `use` calls that hit a freed chunk.
    pub use_after_free: AtomicU64,
    /// `read` calls that hit a freed chunk.
    pub read_after_free: AtomicU64,
    /// Lookups that matched no record.
    pub not_found: AtomicU64,
}

impl RegistryMetrics {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            creates: AtomicU64::new(0),
            allocations: AtomicU64::new(0),
            frees: AtomicU64::new(0),
            double_frees: AtomicU64::new(0),
            use_after_free: AtomicU64::new(0),
            read_after_free: AtomicU64::new(0),
            not_found: AtomicU64::new(0),
        }
    }

    /// Increment a counter by 1.
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Read a counter value.
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn snapshot(&self) -> RegistryMetricsSnapshot {
        RegistryMetricsSnapshot {
            creates: Self::get(&self.creates),
            allocations: Self::get(&self.allocations),
            frees: Self::get(&self.frees),
            double_frees: Self::get(&self.double_frees),
            use_after_free: Self::get(&self.use_after_free),
            read_after_free: Self::get(&self.read_after_free),
            not_found: Self::get(&self.not_found),
        }
    }

    /// Zero every counter.
    pub fn reset(&self) {
        for counter in [
            &self.creates,
            &self.allocations,
            &self.frees,
            &self.double_frees,
            &self.use_after_free,
            &self.read_after_free,
            &self.not_found,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

impl Default for RegistryMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of [`RegistryMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RegistryMetricsSnapshot {
    pub creates: u64,
    pub allocations: u64,
    pub frees: u64,
    pub double_frees: u64,
    pub use_after_free: u64,
    pub read_after_free: u64,
    pub not_found: u64,
}

impl RegistryMetricsSnapshot {
    /// Total unsafe accesses and double frees observed.
    #[must_use]
    pub const fn detections(&self) -> u64 {
        self.double_frees + self.use_after_free + self.read_after_free
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_increments() {
        let m = RegistryMetrics::new();
        RegistryMetrics::inc(&m.creates);
        RegistryMetrics::inc(&m.double_frees);
        RegistryMetrics::inc(&m.use_after_free);
        let snap = m.snapshot();
        assert_eq!(snap.creates, 1);
        assert_eq!(snap.detections(), 2);

        m.reset();
        assert_eq!(m.snapshot(), RegistryMetricsSnapshot::default());
    }
}
