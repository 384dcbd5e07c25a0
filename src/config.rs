//! CLI surface (spec.md §6) and the capability-based factory dispatch
//! (spec.md §9 Design Notes) that turns parsed flags into the concrete
//! components `main` wires together.
//!
//! Grounded on the teacher's `Cli`/`cli::mod` struct
//! (`src/bin/cli/mod.rs`), which uses the same `clap::Parser` derive with
//! an `env_prefix!` macro and `ValueEnum` enums for every closed choice.
//! The teacher resolves its single `Provider` choice with a `match` inside
//! `main`; this crate generalizes that to a small registered-factory map
//! so a caller can add a registry strategy without touching `main`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use log::LevelFilter;
use thiserror::Error;

use crate::domainfilter::DomainFilter;
use crate::endpoint::RecordType;
use crate::policy::Policy as EnginePolicy;
use crate::provider::{CachingProvider, Provider, SharedProvider};
use crate::registry::external::{ExternalTableRegistry, InMemoryLabelStore};
use crate::registry::txt::{TxtRegistry, TxtRegistryConfig};
use crate::registry::Registry;

macro_rules! env_prefix {
    () => {
        "DNS_RECONCILER_"
    };
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, ValueEnum)]
pub enum Loglevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<Loglevel> for LevelFilter {
    fn from(level: Loglevel) -> Self {
        match level {
            Loglevel::Error => LevelFilter::Error,
            Loglevel::Warn => LevelFilter::Warn,
            Loglevel::Info => LevelFilter::Info,
            Loglevel::Debug => LevelFilter::Debug,
            Loglevel::Trace => LevelFilter::Trace,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, ValueEnum)]
pub enum CliPolicy {
    Sync,
    UpsertOnly,
    CreateOnly,
}

impl From<CliPolicy> for EnginePolicy {
    fn from(value: CliPolicy) -> Self {
        match value {
            CliPolicy::Sync => EnginePolicy::Sync,
            CliPolicy::UpsertOnly => EnginePolicy::UpsertOnly,
            CliPolicy::CreateOnly => EnginePolicy::CreateOnly,
        }
    }
}

/// Which ownership-encoding strategy the registry factory should build
/// (spec.md §4.E: TXT records alongside the data, or rows in an external
/// key-value table).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, ValueEnum)]
pub enum RegistryKind {
    Txt,
    External,
}

#[derive(Debug, Clone, PartialEq, Eq, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Set the loglevel of the application
    #[arg(value_enum, short = 'l', long, default_value_t = Loglevel::Info, value_name = "LEVEL", env = concat!(env_prefix!(), "LOGLEVEL"))]
    pub loglevel: Loglevel,

    /// Run one reconciliation then exit
    #[arg(long, default_value_t = false, action)]
    pub once: bool,

    /// Do not apply changes, only log what would happen
    #[arg(long, short = 'd', action, default_value_t = false)]
    pub dry_run: bool,

    /// Seconds between scheduled reconciliations
    #[arg(long, default_value_t = 60, env = concat!(env_prefix!(), "INTERVAL"))]
    pub interval: u64,

    /// Minimum seconds between two event-triggered reconciliations
    #[arg(long, default_value_t = 5, env = concat!(env_prefix!(), "MIN_EVENT_SYNC_INTERVAL"))]
    pub min_event_sync_interval: u64,

    /// Which actions the plan calculator is permitted to emit
    #[arg(value_enum, long, default_value_t = CliPolicy::Sync, env = concat!(env_prefix!(), "POLICY"))]
    pub policy: CliPolicy,

    /// Record types the engine is allowed to manage, comma-separated
    #[arg(long, use_value_delimiter = true, value_delimiter = ',', default_values = ["A", "AAAA", "CNAME"], env = concat!(env_prefix!(), "MANAGED_RECORD_TYPES"))]
    pub managed_record_types: Vec<RecordType>,

    /// Record types to exclude even if present in managed-record-types
    #[arg(long, use_value_delimiter = true, value_delimiter = ',', env = concat!(env_prefix!(), "EXCLUDE_RECORD_TYPES"))]
    pub exclude_record_types: Vec<RecordType>,

    /// Domain suffixes to include, comma-separated; empty means all
    #[arg(long, use_value_delimiter = true, value_delimiter = ',', env = concat!(env_prefix!(), "DOMAIN_FILTER"))]
    pub domain_filter: Vec<String>,

    /// Domain suffixes to exclude, comma-separated
    #[arg(long, use_value_delimiter = true, value_delimiter = ',', env = concat!(env_prefix!(), "EXCLUDE_DOMAINS"))]
    pub exclude_domains: Vec<String>,

    /// Regex a name must match to be included
    #[arg(long, env = concat!(env_prefix!(), "REGEX_DOMAIN_FILTER"))]
    pub regex_domain_filter: Option<String>,

    /// Regex that excludes a name even if it matched the include filter
    #[arg(long, env = concat!(env_prefix!(), "REGEX_DOMAIN_EXCLUDE"))]
    pub regex_domain_exclude: Option<String>,

    /// Which ownership-encoding strategy to use
    #[arg(value_enum, long, default_value_t = RegistryKind::Txt, env = concat!(env_prefix!(), "REGISTRY"))]
    pub registry: RegistryKind,

    /// Unique identifier for this controller instance
    #[arg(long, required = true, env = concat!(env_prefix!(), "TXT_OWNER_ID"))]
    pub txt_owner_id: String,

    /// Previous owner ID to migrate ownership records away from
    #[arg(long, env = concat!(env_prefix!(), "TXT_OWNER_ID_OLD"))]
    pub txt_owner_id_old: Option<String>,

    /// Prefix prepended to generated TXT registry record names
    #[arg(long, default_value = "", env = concat!(env_prefix!(), "TXT_PREFIX"))]
    pub txt_prefix: String,

    /// Suffix appended to generated TXT registry record names
    #[arg(long, default_value = "", env = concat!(env_prefix!(), "TXT_SUFFIX"))]
    pub txt_suffix: String,

    /// Replaces a leading wildcard label in the owned name's TXT counterpart
    #[arg(long, env = concat!(env_prefix!(), "TXT_WILDCARD_REPLACEMENT"))]
    pub txt_wildcard_replacement: Option<String>,

    /// 32-byte base64 AES key to encrypt TXT ownership payloads
    #[arg(long, env = concat!(env_prefix!(), "TXT_ENCRYPT_AES_KEY"))]
    pub txt_encrypt_aes_key: Option<String>,

    /// Seconds the provider cache serves reads before refetching
    #[arg(long, default_value_t = 0, env = concat!(env_prefix!(), "PROVIDER_CACHE_TIME"))]
    pub provider_cache_time: u64,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid regex in domain filter: {0}")]
    Regex(#[from] regex::Error),
    #[error("--txt-encrypt-aes-key must decode to exactly 32 bytes")]
    BadAesKey,
    #[error("invalid base64 in --txt-encrypt-aes-key: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("no registry factory registered for {0:?}")]
    UnknownRegistry(RegistryKind),
}

impl Cli {
    pub fn domain_filter(&self) -> Result<DomainFilter, ConfigError> {
        let mut filter = DomainFilter::new(self.domain_filter.clone(), self.exclude_domains.clone());
        if let Some(pattern) = &self.regex_domain_filter {
            filter = filter.with_include_regex(pattern)?;
        }
        if let Some(pattern) = &self.regex_domain_exclude {
            filter = filter.with_exclude_regex(pattern)?;
        }
        Ok(filter)
    }

    pub fn managed_types(&self) -> HashSet<RecordType> {
        self.managed_record_types.iter().copied().collect()
    }

    pub fn excluded_types(&self) -> HashSet<RecordType> {
        self.exclude_record_types.iter().copied().collect()
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval)
    }

    pub fn min_event_sync_interval(&self) -> Duration {
        Duration::from_secs(self.min_event_sync_interval)
    }

    pub fn txt_config(&self) -> Result<TxtRegistryConfig, ConfigError> {
        let aes_key = match &self.txt_encrypt_aes_key {
            None => None,
            Some(encoded) => {
                use base64::{engine::general_purpose::STANDARD, Engine as _};
                let bytes = STANDARD.decode(encoded)?;
                let key: [u8; 32] = bytes.try_into().map_err(|_| ConfigError::BadAesKey)?;
                Some(key)
            }
        };
        Ok(TxtRegistryConfig {
            owner_id: self.txt_owner_id.clone(),
            txt_prefix: self.txt_prefix.clone(),
            txt_suffix: self.txt_suffix.clone(),
            txt_wildcard_replacement: self.txt_wildcard_replacement.clone(),
            old_owner_id: self.txt_owner_id_old.clone(),
            aes_key,
        })
    }
}

/// Wraps `provider` in a [`CachingProvider`] unless `--provider-cache-time`
/// is zero (spec.md §4.G).
pub fn build_shared_provider<P: Provider + 'static>(provider: P, cache_time: Duration) -> SharedProvider {
    if cache_time.is_zero() {
        Arc::new(provider)
    } else {
        Arc::new(CachingProvider::new(provider, cache_time))
    }
}

/// Builds a [`Registry`] from a [`RegistryKind`] and a shared provider.
/// Capability-based dispatch (spec.md §9): each strategy is registered
/// under its [`RegistryKind`] once, at construction, rather than matched
/// inline in `main` — adding a third strategy means registering a new
/// factory, not editing this function.
pub struct RegistryFactories {
    factories: HashMap<RegistryKind, Box<dyn Fn(&Cli, SharedProvider) -> Result<Arc<dyn Registry>, ConfigError>>>,
}

impl RegistryFactories {
    pub fn build(&self, kind: RegistryKind, cli: &Cli, provider: SharedProvider) -> Result<Arc<dyn Registry>, ConfigError> {
        let factory = self.factories.get(&kind).ok_or(ConfigError::UnknownRegistry(kind))?;
        factory(cli, provider)
    }

    pub fn register(&mut self, kind: RegistryKind, factory: impl Fn(&Cli, SharedProvider) -> Result<Arc<dyn Registry>, ConfigError> + 'static) {
        self.factories.insert(kind, Box::new(factory));
    }
}

impl Default for RegistryFactories {
    /// The two strategies this crate ships (spec.md §4.E.1, §4.E.2).
    fn default() -> Self {
        let mut factories = RegistryFactories { factories: HashMap::new() };
        factories.register(RegistryKind::Txt, |cli, provider| {
            let config = cli.txt_config()?;
            Ok(Arc::new(TxtRegistry::new(SharedProviderAdapter(provider), config)))
        });
        factories.register(RegistryKind::External, |cli, provider| {
            Ok(Arc::new(ExternalTableRegistry::new(
                SharedProviderAdapter(provider),
                InMemoryLabelStore::new(),
                cli.txt_owner_id.clone(),
            )))
        });
        factories
    }
}

/// `TxtRegistry`/`ExternalTableRegistry` are generic over a concrete
/// `Provider`; the factory map only has `Arc<dyn Provider>` to hand out, so
/// this newtype lets `SharedProvider` itself satisfy the `Provider` bound.
struct SharedProviderAdapter(SharedProvider);

impl Provider for SharedProviderAdapter {
    fn records(&self) -> Result<Vec<crate::endpoint::Endpoint>, crate::provider::ProviderError> {
        self.0.records()
    }

    fn apply_changes(&self, changes: &crate::changes::Changes) -> Result<(), crate::provider::ProviderError> {
        self.0.apply_changes(changes)
    }

    fn adjust_endpoints(&self, endpoints: Vec<crate::endpoint::Endpoint>) -> Result<Vec<crate::endpoint::Endpoint>, crate::provider::ProviderError> {
        self.0.adjust_endpoints(endpoints)
    }

    fn domain_filter(&self) -> DomainFilter {
        self.0.domain_filter()
    }
}
