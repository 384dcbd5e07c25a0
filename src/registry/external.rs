//! The alternative ownership registry: ownership metadata lives as rows in
//! an external key-value store instead of alongside the DNS records
//! themselves (spec.md §4.E.2). Single-writer-per-owner, conditional-put
//! semantics: a create whose key is already claimed by a foreign owner is
//! dropped from the batch rather than overwriting the row.
//!
//! No teacher module covers this — the teacher only ever shipped a TXT
//! registry. Grounded on the same `Registry` trait as [`super::txt`] and on
//! the `DashMap`-backed concurrent map pattern used across the pack for
//! in-process key-value state (e.g. `RoeeJ-heimdall/src/rate_limiter.rs`'s
//! `DashMap<IpAddr, _>`), here a plain `Mutex<HashMap<..>>` since writes are
//! already serialized to the single reconciler thread (spec.md §5).

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use thiserror::Error;

use crate::changes::Changes;
use crate::domainfilter::DomainFilter;
use crate::endpoint::{Endpoint, EndpointKey, Labels};
use crate::provider::Provider;

use super::{Registry, RegistryError};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LabelStoreError {
    #[error("key {0:?} is already owned by another controller")]
    Conflict(EndpointKey),
    #[error("label store backend error: {0}")]
    Backend(String),
}

/// A single-writer-per-owner key-value store mapping an endpoint key to
/// its ownership labels (spec.md §4.E.2).
pub trait LabelStore: Send + Sync {
    fn get_all(&self) -> Result<HashMap<EndpointKey, (String, Labels)>, LabelStoreError>;
    /// Fails with [`LabelStoreError::Conflict`] if a row already exists
    /// for `key` under a different owner (conditional put).
    fn insert(&self, key: &EndpointKey, owner: &str, labels: &Labels) -> Result<(), LabelStoreError>;
    fn update(&self, key: &EndpointKey, owner: &str, labels: &Labels) -> Result<(), LabelStoreError>;
    fn delete(&self, key: &EndpointKey) -> Result<(), LabelStoreError>;
}

/// An in-memory [`LabelStore`] for tests, replacing a real external
/// key-value backend (DynamoDB, etcd, a relational table, ...).
#[derive(Default)]
pub struct InMemoryLabelStore {
    rows: Mutex<HashMap<EndpointKey, (String, Labels)>>,
}

impl InMemoryLabelStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LabelStore for InMemoryLabelStore {
    fn get_all(&self) -> Result<HashMap<EndpointKey, (String, Labels)>, LabelStoreError> {
        Ok(self.rows.lock().unwrap().clone())
    }

    fn insert(&self, key: &EndpointKey, owner: &str, labels: &Labels) -> Result<(), LabelStoreError> {
        let mut rows = self.rows.lock().unwrap();
        if let Some((existing_owner, _)) = rows.get(key) {
            if existing_owner != owner {
                return Err(LabelStoreError::Conflict(key.clone()));
            }
        }
        rows.insert(key.clone(), (owner.to_string(), labels.clone()));
        Ok(())
    }

    fn update(&self, key: &EndpointKey, owner: &str, labels: &Labels) -> Result<(), LabelStoreError> {
        self.rows.lock().unwrap().insert(key.clone(), (owner.to_string(), labels.clone()));
        Ok(())
    }

    fn delete(&self, key: &EndpointKey) -> Result<(), LabelStoreError> {
        self.rows.lock().unwrap().remove(key);
        Ok(())
    }
}

impl From<LabelStoreError> for RegistryError {
    fn from(e: LabelStoreError) -> Self {
        match e {
            LabelStoreError::Conflict(key) => RegistryError::Conflict(format!("{key:?}")),
            LabelStoreError::Backend(msg) => RegistryError::Config(msg),
        }
    }
}

pub struct ExternalTableRegistry<P, S> {
    provider: P,
    store: S,
    owner_id: String,
    orphans: Mutex<Vec<EndpointKey>>,
}

impl<P: Provider, S: LabelStore> ExternalTableRegistry<P, S> {
    pub fn new(provider: P, store: S, owner_id: impl Into<String>) -> Self {
        ExternalTableRegistry {
            provider,
            store,
            owner_id: owner_id.into(),
            orphans: Mutex::new(Vec::new()),
        }
    }
}

impl<P: Provider, S: LabelStore> Registry for ExternalTableRegistry<P, S> {
    fn records(&self) -> Result<Vec<Endpoint>, RegistryError> {
        let rows = self.store.get_all().map_err(RegistryError::from)?;
        let mut records = self.provider.records()?;
        let record_keys: HashSet<EndpointKey> = records.iter().map(Endpoint::key).collect();

        for record in &mut records {
            if let Some((owner, labels)) = rows.get(&record.key()) {
                record.merge_labels(labels);
                record.set_label("owner", owner);
            }
        }

        let orphaned: Vec<EndpointKey> = rows.keys().filter(|k| !record_keys.contains(*k)).cloned().collect();
        *self.orphans.lock().unwrap() = orphaned;

        Ok(records)
    }

    fn apply_changes(&self, changes: Changes) -> Result<(), RegistryError> {
        let mut create = Vec::with_capacity(changes.create.len());
        for endpoint in changes.create {
            match self.store.insert(&endpoint.key(), &self.owner_id, &endpoint.labels) {
                Ok(()) => create.push(endpoint),
                // Lost-race semantics: someone else claimed this key first.
                Err(LabelStoreError::Conflict(_)) => continue,
                Err(e) => return Err(e.into()),
            }
        }

        for (old, new) in changes.update_old.iter().zip(changes.update_new.iter()) {
            self.store.update(&old.key(), &self.owner_id, &new.labels).map_err(RegistryError::from)?;
        }

        for endpoint in &changes.delete {
            self.store.delete(&endpoint.key()).map_err(RegistryError::from)?;
        }

        let provider_changes = Changes {
            create,
            update_old: changes.update_old,
            update_new: changes.update_new,
            delete: changes.delete,
        };

        self.provider.apply_changes(&provider_changes)?;

        let orphaned = std::mem::take(&mut *self.orphans.lock().unwrap());
        for key in orphaned {
            self.store.delete(&key).map_err(RegistryError::from)?;
        }

        Ok(())
    }

    fn adjust_endpoints(&self, endpoints: Vec<Endpoint>) -> Result<Vec<Endpoint>, RegistryError> {
        Ok(self.provider.adjust_endpoints(endpoints)?)
    }

    fn owner_id(&self) -> &str {
        &self.owner_id
    }

    fn domain_filter(&self) -> DomainFilter {
        self.provider.domain_filter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::RecordType;
    use crate::provider::InMemoryProvider;

    fn a(name: &str, ip: &str) -> Endpoint {
        Endpoint::new(name, RecordType::A, vec![ip.to_string()])
    }

    #[test]
    fn records_joins_label_rows_with_provider_records() {
        let provider = InMemoryProvider::new(vec![a("foo.example.com", "1.1.1.1")]);
        let store = InMemoryLabelStore::new();
        let registry = ExternalTableRegistry::new(provider, store, "me");
        let key = ("foo.example.com".to_string(), RecordType::A, None);
        registry.store.insert(&key, "me", &Labels::new()).unwrap();

        let records = registry.records().unwrap();
        assert_eq!(records[0].label("owner"), Some("me"));
    }

    #[test]
    fn apply_changes_writes_rows_then_forwards_to_provider() {
        let provider = InMemoryProvider::new(vec![]);
        let store = InMemoryLabelStore::new();
        let registry = ExternalTableRegistry::new(provider, store, "me");
        let changes = Changes {
            create: vec![a("foo.example.com", "1.1.1.1")],
            ..Default::default()
        };
        registry.apply_changes(changes).unwrap();
        assert_eq!(registry.provider.snapshot().len(), 1);
        let key = ("foo.example.com".to_string(), RecordType::A, None);
        assert!(registry.store.get_all().unwrap().contains_key(&key));
    }

    #[test]
    fn create_dropped_on_foreign_row_conflict() {
        let provider = InMemoryProvider::new(vec![]);
        let store = InMemoryLabelStore::new();
        let key = ("foo.example.com".to_string(), RecordType::A, None);
        store.insert(&key, "other", &Labels::new()).unwrap();
        let registry = ExternalTableRegistry::new(provider, store, "me");

        let changes = Changes {
            create: vec![a("foo.example.com", "1.1.1.1")],
            ..Default::default()
        };
        registry.apply_changes(changes).unwrap();
        assert!(registry.provider.snapshot().is_empty());
    }

    #[test]
    fn orphaned_rows_are_deleted_after_next_successful_apply() {
        let provider = InMemoryProvider::new(vec![]);
        let store = InMemoryLabelStore::new();
        let key = ("gone.example.com".to_string(), RecordType::A, None);
        store.insert(&key, "me", &Labels::new()).unwrap();
        let registry = ExternalTableRegistry::new(provider, store, "me");

        // The provider no longer has this record; `records()` should
        // queue the row for cleanup.
        let _ = registry.records().unwrap();
        assert!(registry.orphans.lock().unwrap().contains(&key));

        registry.apply_changes(Changes::default()).unwrap();
        assert!(!registry.store.get_all().unwrap().contains_key(&key));
    }
}
