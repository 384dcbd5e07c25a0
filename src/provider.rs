//! The `Provider` contract (spec.md §6): reads current records from, and
//! applies changes against, a concrete DNS backend. Concrete providers
//! (Route53, Cloudflare, ...) are out of scope (spec.md §1) — only the
//! trait, an in-memory test double, and the time-bounded cache (§4.G) that
//! wraps any provider ship here.
//!
//! Grounded on the teacher's `Provider` trait (`src/provider.rs`), which
//! already splits `DnsProvider`/`TxTRegistryProvider`/mock generation the
//! same way; generalized here to the full `Changes` shape instead of a
//! single `Action` at a time.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[cfg(test)]
use mockall::automock;
use thiserror::Error;

use crate::changes::Changes;
use crate::domainfilter::DomainFilter;
use crate::endpoint::Endpoint;
use crate::errors::{Classify, ErrorClass};

/// Read current records from, and apply changes against, a concrete DNS
/// backend. Implementations must make `adjust_endpoints` idempotent and
/// must not add spurious changes (spec.md §6).
#[cfg_attr(test, automock)]
pub trait Provider: Send + Sync {
    fn records(&self) -> Result<Vec<Endpoint>, ProviderError>;
    fn apply_changes(&self, changes: &Changes) -> Result<(), ProviderError>;

    /// Canonicalize provider-specific properties. Must be idempotent and
    /// must not add spurious changes (spec.md §6). Default: identity.
    fn adjust_endpoints(&self, endpoints: Vec<Endpoint>) -> Result<Vec<Endpoint>, ProviderError> {
        Ok(endpoints)
    }

    fn domain_filter(&self) -> DomainFilter {
        DomainFilter::default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    /// Rate limit / transient 5xx / DNS timeout (spec.md §7).
    #[error("transient provider error: {0}")]
    Soft(String),
    /// Authentication, config, unknown provider (spec.md §7).
    #[error("fatal provider error: {0}")]
    Hard(String),
}

impl Classify for ProviderError {
    fn class(&self) -> ErrorClass {
        match self {
            ProviderError::Soft(_) => ErrorClass::Soft,
            ProviderError::Hard(_) => ErrorClass::Hard,
        }
    }
}

/// An in-memory provider behind a mutex, used in place of a real
/// Cloudflare/Route53 client by plan-calculator/registry/controller tests
/// (spec.md §6 supplement). Applies `Changes` the same way any real
/// provider must: creates are appended, updates replace by key, deletes
/// remove by key.
#[derive(Default)]
pub struct InMemoryProvider {
    records: Mutex<Vec<Endpoint>>,
    domain_filter: DomainFilter,
    fail_next_apply: Mutex<Option<ProviderError>>,
    fail_next_records: Mutex<Option<ProviderError>>,
}

impl InMemoryProvider {
    pub fn new(records: Vec<Endpoint>) -> Self {
        InMemoryProvider {
            records: Mutex::new(records),
            domain_filter: DomainFilter::default(),
            fail_next_apply: Mutex::new(None),
            fail_next_records: Mutex::new(None),
        }
    }

    pub fn with_domain_filter(mut self, filter: DomainFilter) -> Self {
        self.domain_filter = filter;
        self
    }

    /// Makes the next `apply_changes` call fail, for controller-loop error
    /// classification tests.
    pub fn fail_next_apply(&self, err: ProviderError) {
        *self.fail_next_apply.lock().unwrap() = Some(err);
    }

    pub fn fail_next_records(&self, err: ProviderError) {
        *self.fail_next_records.lock().unwrap() = Some(err);
    }

    pub fn snapshot(&self) -> Vec<Endpoint> {
        self.records.lock().unwrap().clone()
    }
}

impl Provider for InMemoryProvider {
    fn records(&self) -> Result<Vec<Endpoint>, ProviderError> {
        if let Some(err) = self.fail_next_records.lock().unwrap().take() {
            return Err(err);
        }
        Ok(self.records.lock().unwrap().clone())
    }

    fn apply_changes(&self, changes: &Changes) -> Result<(), ProviderError> {
        if let Some(err) = self.fail_next_apply.lock().unwrap().take() {
            return Err(err);
        }
        let mut records = self.records.lock().unwrap();
        for key in changes.delete.iter().map(Endpoint::key) {
            records.retain(|e| e.key() != key);
        }
        for old in &changes.update_old {
            records.retain(|e| e.key() != old.key());
        }
        for new in &changes.update_new {
            records.push(new.clone());
        }
        for created in &changes.create {
            records.push(created.clone());
        }
        Ok(())
    }

    fn domain_filter(&self) -> DomainFilter {
        self.domain_filter.clone()
    }
}

/// Wraps a provider, serving `records()` from a cache while it is younger
/// than `ttl` and invalidating it on every `apply_changes` (spec.md §4.G).
/// `adjust_endpoints`/`domain_filter` pass through unmodified.
pub struct CachingProvider<P> {
    inner: P,
    ttl: Duration,
    cache: Mutex<Option<(Instant, Vec<Endpoint>)>>,
}

impl<P: Provider> CachingProvider<P> {
    pub fn new(inner: P, ttl: Duration) -> Self {
        CachingProvider {
            inner,
            ttl,
            cache: Mutex::new(None),
        }
    }

    pub fn into_inner(self) -> P {
        self.inner
    }
}

impl<P: Provider> Provider for CachingProvider<P> {
    fn records(&self) -> Result<Vec<Endpoint>, ProviderError> {
        {
            let cache = self.cache.lock().unwrap();
            if let Some((fetched_at, records)) = cache.as_ref() {
                if fetched_at.elapsed() < self.ttl {
                    return Ok(records.clone());
                }
            }
        }
        let records = self.inner.records()?;
        *self.cache.lock().unwrap() = Some((Instant::now(), records.clone()));
        Ok(records)
    }

    fn apply_changes(&self, changes: &Changes) -> Result<(), ProviderError> {
        let result = self.inner.apply_changes(changes);
        // Invalidate regardless of success: a partial failure may still
        // have mutated backend state (spec.md §4.E.3).
        *self.cache.lock().unwrap() = None;
        result
    }

    fn adjust_endpoints(&self, endpoints: Vec<Endpoint>) -> Result<Vec<Endpoint>, ProviderError> {
        self.inner.adjust_endpoints(endpoints)
    }

    fn domain_filter(&self) -> DomainFilter {
        self.inner.domain_filter()
    }
}

/// Shared handle so a `CachingProvider` can be cloned into both the
/// registry and the controller loop without duplicating the cache.
pub type SharedProvider = Arc<dyn Provider>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::RecordType;

    fn ep(name: &str) -> Endpoint {
        Endpoint::new(name, RecordType::A, vec!["1.1.1.1".to_string()])
    }

    #[test]
    fn in_memory_provider_apply_changes_creates_updates_deletes() {
        let provider = InMemoryProvider::new(vec![ep("a.example.com")]);
        let changes = Changes {
            create: vec![ep("b.example.com")],
            update_old: vec![ep("a.example.com")],
            update_new: vec![ep("a.example.com").with_ttl(300)],
            delete: vec![],
        };
        provider.apply_changes(&changes).unwrap();
        let snapshot = provider.snapshot();
        assert_eq!(snapshot.len(), 2);
        let a = snapshot.iter().find(|e| e.dns_name == "a.example.com").unwrap();
        assert_eq!(a.record_ttl, 300);
    }

    #[test]
    fn in_memory_provider_apply_changes_deletes_by_key() {
        let provider = InMemoryProvider::new(vec![ep("a.example.com"), ep("b.example.com")]);
        let changes = Changes {
            delete: vec![ep("a.example.com")],
            ..Default::default()
        };
        provider.apply_changes(&changes).unwrap();
        assert_eq!(provider.snapshot().len(), 1);
    }

    #[test]
    fn caching_provider_serves_cached_records_within_ttl() {
        let provider = CachingProvider::new(InMemoryProvider::new(vec![ep("a.example.com")]), Duration::from_secs(60));
        let first = provider.records().unwrap();
        // Mutate the backend directly; the cache should still win.
        provider.inner.records.lock().unwrap().push(ep("b.example.com"));
        let second = provider.records().unwrap();
        assert_eq!(first.len(), second.len());
    }

    #[test]
    fn caching_provider_invalidates_on_apply_changes() {
        let provider = CachingProvider::new(InMemoryProvider::new(vec![ep("a.example.com")]), Duration::from_secs(60));
        let _ = provider.records().unwrap();
        let changes = Changes {
            create: vec![ep("b.example.com")],
            ..Default::default()
        };
        provider.apply_changes(&changes).unwrap();
        let after = provider.records().unwrap();
        assert_eq!(after.len(), 2);
    }
}
