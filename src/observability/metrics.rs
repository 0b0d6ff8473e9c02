// Supportability counters for async context propagation.
//
// Purpose: make token and registry lifecycle measurable in production.
// Invariant: every token transition (create, link, expire, timeout) and
// every registry outcome (register, reject, evict) increments exactly one
// counter on exactly one code path.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

/// Counter metric (monotonically increasing)
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Counter {
            value: AtomicU64::new(0),
        }
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.value.store(0, Ordering::Relaxed);
    }
}

/// Process-wide token and registry lifecycle counters.
#[derive(Debug, Default)]
pub struct SupportabilityMetrics {
    pub token_create: Counter,
    pub token_expire: Counter,
    pub token_timeout: Counter,
    pub token_link_success: Counter,
    pub token_link_ignore: Counter,
    pub registry_register: Counter,
    pub registry_reject: Counter,
    pub registry_retrieve: Counter,
    pub registry_evict: Counter,
}

/// Point-in-time copy of the counters, for harvest reporting and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub token_create: u64,
    pub token_expire: u64,
    pub token_timeout: u64,
    pub token_link_success: u64,
    pub token_link_ignore: u64,
    pub registry_register: u64,
    pub registry_reject: u64,
    pub registry_retrieve: u64,
    pub registry_evict: u64,
}

impl SupportabilityMetrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            token_create: self.token_create.get(),
            token_expire: self.token_expire.get(),
            token_timeout: self.token_timeout.get(),
            token_link_success: self.token_link_success.get(),
            token_link_ignore: self.token_link_ignore.get(),
            registry_register: self.registry_register.get(),
            registry_reject: self.registry_reject.get(),
            registry_retrieve: self.registry_retrieve.get(),
            registry_evict: self.registry_evict.get(),
        }
    }

    pub fn reset(&self) {
        self.token_create.reset();
        self.token_expire.reset();
        self.token_timeout.reset();
        self.token_link_success.reset();
        self.token_link_ignore.reset();
        self.registry_register.reset();
        self.registry_reject.reset();
        self.registry_retrieve.reset();
        self.registry_evict.reset();
    }
}

static GLOBAL_METRICS: OnceLock<SupportabilityMetrics> = OnceLock::new();

/// Global supportability metrics instance.
pub fn metrics() -> &'static SupportabilityMetrics {
    GLOBAL_METRICS.get_or_init(SupportabilityMetrics::default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_increments() {
        let counter = Counter::new();
        assert_eq!(counter.get(), 0);
        counter.inc();
        counter.inc();
        assert_eq!(counter.get(), 2);
        counter.reset();
        assert_eq!(counter.get(), 0);
    }

    #[test]
    fn test_snapshot_copies_values() {
        let m = SupportabilityMetrics::default();
        m.token_create.inc();
        m.token_link_success.inc();
        let snap = m.snapshot();
        assert_eq!(snap.token_create, 1);
        assert_eq!(snap.token_link_success, 1);
        assert_eq!(snap.token_expire, 0);
        // Snapshot is a copy, not a view
        m.token_create.inc();
        assert_eq!(snap.token_create, 1);
    }
}
