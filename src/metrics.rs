//! Explicit metrics handle passed to each component at construction,
//! replacing the teacher ecosystem's global mutable Prometheus registry
//! (Design Notes §9). Tests supply [`InMemoryMetrics`]; production code
//! supplies [`PrometheusMetrics`], following the `CounterVec`/`Gauge`
//! pattern used across the wider example pack for DNS-adjacent services.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use prometheus::{CounterVec, IntGauge, Opts, Registry};

/// Everything the reconciliation engine needs to report about itself.
/// Implemented by [`PrometheusMetrics`] for production and
/// [`InMemoryMetrics`] for tests.
pub trait MetricsRegistry: Send + Sync {
    /// Owner guard rejected a create candidate (spec.md §4.D "Owner guard").
    fn inc_owner_conflict(&self, record_type: &str, owner: &str, foreign_owner: &str, apex_domain: &str);
    fn set_last_reconcile_timestamp(&self, unix_seconds: i64);
    fn set_last_sync_timestamp(&self, unix_seconds: i64);
    fn set_consecutive_soft_errors(&self, n: u64);
    fn inc_registry_errors(&self);
    fn inc_source_errors(&self);
    fn inc_provider_errors(&self, soft: bool);
}

/// Production metrics backed by a `prometheus::Registry`.
pub struct PrometheusMetrics {
    registry: Registry,
    owner_conflicts: CounterVec,
    last_reconcile_timestamp: IntGauge,
    last_sync_timestamp: IntGauge,
    consecutive_soft_errors: IntGauge,
    registry_errors: IntGauge,
    source_errors: IntGauge,
    provider_errors_soft: IntGauge,
    provider_errors_hard: IntGauge,
}

impl PrometheusMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let owner_conflicts = CounterVec::new(
            Opts::new(
                "dns_reconciler_owner_conflicts_total",
                "Create candidates rejected because an existing record is owned by another controller",
            ),
            &["record_type", "owner", "foreign_owner", "apex_domain"],
        )?;
        let last_reconcile_timestamp = IntGauge::new(
            "dns_reconciler_last_reconcile_timestamp_seconds",
            "Unix time of the last RunOnce invocation",
        )?;
        let last_sync_timestamp = IntGauge::new(
            "dns_reconciler_last_sync_timestamp_seconds",
            "Unix time of the last successful ApplyChanges",
        )?;
        let consecutive_soft_errors = IntGauge::new(
            "dns_reconciler_consecutive_soft_errors",
            "Number of consecutive ticks that ended in a soft error",
        )?;
        let registry_errors = IntGauge::new(
            "dns_reconciler_registry_errors_total",
            "Errors returned by Registry::Records",
        )?;
        let source_errors = IntGauge::new(
            "dns_reconciler_source_errors_total",
            "Errors returned by Source::Endpoints",
        )?;
        let provider_errors_soft = IntGauge::new(
            "dns_reconciler_provider_errors_soft_total",
            "Soft (transient) provider errors",
        )?;
        let provider_errors_hard = IntGauge::new(
            "dns_reconciler_provider_errors_hard_total",
            "Hard (fatal) provider errors",
        )?;

        registry.register(Box::new(owner_conflicts.clone()))?;
        registry.register(Box::new(last_reconcile_timestamp.clone()))?;
        registry.register(Box::new(last_sync_timestamp.clone()))?;
        registry.register(Box::new(consecutive_soft_errors.clone()))?;
        registry.register(Box::new(registry_errors.clone()))?;
        registry.register(Box::new(source_errors.clone()))?;
        registry.register(Box::new(provider_errors_soft.clone()))?;
        registry.register(Box::new(provider_errors_hard.clone()))?;

        Ok(PrometheusMetrics {
            registry,
            owner_conflicts,
            last_reconcile_timestamp,
            last_sync_timestamp,
            consecutive_soft_errors,
            registry_errors,
            source_errors,
            provider_errors_soft,
            provider_errors_hard,
        })
    }

    /// The underlying registry, for wiring into a `/metrics` HTTP handler.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl MetricsRegistry for PrometheusMetrics {
    fn inc_owner_conflict(&self, record_type: &str, owner: &str, foreign_owner: &str, apex_domain: &str) {
        self.owner_conflicts
            .with_label_values(&[record_type, owner, foreign_owner, apex_domain])
            .inc();
    }

    fn set_last_reconcile_timestamp(&self, unix_seconds: i64) {
        self.last_reconcile_timestamp.set(unix_seconds);
    }

    fn set_last_sync_timestamp(&self, unix_seconds: i64) {
        self.last_sync_timestamp.set(unix_seconds);
    }

    fn set_consecutive_soft_errors(&self, n: u64) {
        self.consecutive_soft_errors.set(n as i64);
    }

    fn inc_registry_errors(&self) {
        self.registry_errors.inc();
    }

    fn inc_source_errors(&self) {
        self.source_errors.inc();
    }

    fn inc_provider_errors(&self, soft: bool) {
        if soft {
            self.provider_errors_soft.inc();
        } else {
            self.provider_errors_hard.inc();
        }
    }
}

/// An in-memory registry for tests, so assertions can read back counters
/// without scraping a text exposition format.
#[derive(Default)]
pub struct InMemoryMetrics {
    owner_conflicts: Mutex<HashMap<(String, String, String, String), u64>>,
    last_reconcile_timestamp: AtomicU64,
    last_sync_timestamp: AtomicU64,
    consecutive_soft_errors: AtomicU64,
    registry_errors: AtomicU64,
    source_errors: AtomicU64,
    provider_errors_soft: AtomicU64,
    provider_errors_hard: AtomicU64,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn owner_conflict_count(&self, record_type: &str, owner: &str, foreign_owner: &str, apex_domain: &str) -> u64 {
        let key = (
            record_type.to_string(),
            owner.to_string(),
            foreign_owner.to_string(),
            apex_domain.to_string(),
        );
        *self.owner_conflicts.lock().unwrap().get(&key).unwrap_or(&0)
    }

    pub fn registry_error_count(&self) -> u64 {
        self.registry_errors.load(Ordering::SeqCst)
    }

    pub fn source_error_count(&self) -> u64 {
        self.source_errors.load(Ordering::SeqCst)
    }

    pub fn consecutive_soft_error_count(&self) -> u64 {
        self.consecutive_soft_errors.load(Ordering::SeqCst)
    }
}

impl MetricsRegistry for InMemoryMetrics {
    fn inc_owner_conflict(&self, record_type: &str, owner: &str, foreign_owner: &str, apex_domain: &str) {
        let key = (
            record_type.to_string(),
            owner.to_string(),
            foreign_owner.to_string(),
            apex_domain.to_string(),
        );
        *self.owner_conflicts.lock().unwrap().entry(key).or_insert(0) += 1;
    }

    fn set_last_reconcile_timestamp(&self, unix_seconds: i64) {
        self.last_reconcile_timestamp.store(unix_seconds as u64, Ordering::SeqCst);
    }

    fn set_last_sync_timestamp(&self, unix_seconds: i64) {
        self.last_sync_timestamp.store(unix_seconds as u64, Ordering::SeqCst);
    }

    fn set_consecutive_soft_errors(&self, n: u64) {
        self.consecutive_soft_errors.store(n, Ordering::SeqCst);
    }

    fn inc_registry_errors(&self) {
        self.registry_errors.fetch_add(1, Ordering::SeqCst);
    }

    fn inc_source_errors(&self) {
        self.source_errors.fetch_add(1, Ordering::SeqCst);
    }

    fn inc_provider_errors(&self, soft: bool) {
        if soft {
            self.provider_errors_soft.fetch_add(1, Ordering::SeqCst);
        } else {
            self.provider_errors_hard.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_owner_conflict_counts_per_label_set() {
        let m = InMemoryMetrics::new();
        m.inc_owner_conflict("A", "me", "other", "example.com");
        m.inc_owner_conflict("A", "me", "other", "example.com");
        m.inc_owner_conflict("AAAA", "me", "other", "example.com");
        assert_eq!(m.owner_conflict_count("A", "me", "other", "example.com"), 2);
        assert_eq!(m.owner_conflict_count("AAAA", "me", "other", "example.com"), 1);
    }

    #[test]
    fn prometheus_metrics_registers_without_error() {
        let m = PrometheusMetrics::new().expect("metrics registration should succeed");
        m.inc_owner_conflict("A", "me", "other", "example.com");
        m.set_last_reconcile_timestamp(12345);
        assert!(!m.registry().gather().is_empty());
    }
}
