//! The ownership registry (spec.md §4.E): persists ownership labels
//! alongside DNS records and rejects foreign edits. Two concrete
//! strategies share this module's [`Registry`] trait: [`txt::TxtRegistry`]
//! (the default, ownership encoded as TXT records) and
//! [`external::ExternalTableRegistry`] (ownership encoded as rows in an
//! external key-value store).
//!
//! Grounded on the teacher's `ARegistry` trait (`src/registry.rs`,
//! `src/registry/mod.rs`) and its `TxtRegistry` sketch
//! (`src/registry/txt/mod.rs`), which this crate completes: the teacher's
//! `apply_plan`/`register_domain`/`claim`/`release` surface (A-record-only,
//! single-tenant) is generalized to the full `Changes`-shaped interface
//! spec.md §4.E specifies, with `missing` added for migration.

pub mod external;
pub mod txt;

use thiserror::Error;

use crate::changes::Changes;
use crate::domainfilter::DomainFilter;
use crate::endpoint::Endpoint;
use crate::errors::{Classify, ErrorClass};
use crate::provider::ProviderError;

pub use external::ExternalTableRegistry;
pub use txt::TxtRegistry;

/// Persists ownership metadata alongside DNS records; filters foreign
/// edits; migrates between ownership-encoding schemes (spec.md §4.E).
pub trait Registry: Send + Sync {
    /// Current records, enriched with ownership labels. Any provider
    /// failure propagates with no ownership state mutated (spec.md
    /// §4.E.3).
    fn records(&self) -> Result<Vec<Endpoint>, RegistryError>;

    /// Apply `changes`, having first written/removed ownership metadata
    /// for every endpoint this controller owns, and having dropped any
    /// endpoint owned by another controller.
    fn apply_changes(&self, changes: Changes) -> Result<(), RegistryError>;

    /// Strip labels the provider cannot store and normalize defaults,
    /// delegating provider-specific shaping to the wrapped provider
    /// (spec.md §4.E).
    fn adjust_endpoints(&self, endpoints: Vec<Endpoint>) -> Result<Vec<Endpoint>, RegistryError>;

    fn owner_id(&self) -> &str;

    fn domain_filter(&self) -> DomainFilter;

    /// Endpoints to append to `PlanCalculator::calculate`'s `create` list
    /// unfiltered except by domain/managed-type — lets the registry
    /// backfill records required by a new ownership-encoding scheme
    /// (spec.md §4.D step 6, §4.E.1 Migration). Default: none.
    fn missing_records(&self) -> Vec<Endpoint> {
        Vec::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("label store conflict: {0}")]
    Conflict(String),
    #[error("registry configuration error: {0}")]
    Config(String),
}

impl Classify for RegistryError {
    fn class(&self) -> ErrorClass {
        match self {
            RegistryError::Provider(e) => e.class(),
            // A lost create race or a bad config is never worth retrying
            // forever, but it also isn't the "terminate the process" kind
            // of failure — the loop treats both as soft so reconciliation
            // keeps making progress on every other record.
            RegistryError::Conflict(_) | RegistryError::Config(_) => ErrorClass::Soft,
        }
    }
}
