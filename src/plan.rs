//! The plan calculator — the crate's core algorithm. A pure function
//! `(current, desired, filters, policy, owner) -> Changes` with no I/O and
//! no fallible paths (spec.md §4.D, §7 "the plan calculator cannot produce
//! errors").

use std::collections::{HashMap, HashSet};

use log::{debug, trace};

use crate::changes::Changes;
use crate::domainfilter::{match_all_domain_filters, DomainFilter};
use crate::endpoint::{apex_domain, targets_same, Endpoint, RecordType};
use crate::metrics::MetricsRegistry;
use crate::policy::{self, Policy};

/// Resolves multiple desired candidates sharing a key down to one endpoint,
/// for both first-seen creates and in-place updates. Default: [`PerResource`].
pub trait ConflictResolver {
    fn resolve_create(&self, candidates: &[Endpoint]) -> Endpoint;
    fn resolve_update(&self, current: &Endpoint, candidates: &[Endpoint]) -> Endpoint;
}

/// `resolveCreate` picks the lexicographically/IP-ordered minimum by
/// `targets.IsLess`. `resolveUpdate` prefers the candidate whose `resource`
/// label matches current's, falling back to `resolveCreate`.
#[derive(Debug, Default, Clone, Copy)]
pub struct PerResource;

impl ConflictResolver for PerResource {
    fn resolve_create(&self, candidates: &[Endpoint]) -> Endpoint {
        candidates
            .iter()
            .cloned()
            .reduce(|min, next| if next.targets_is_less(&min) { next } else { min })
            .expect("resolve_create called with no candidates")
    }

    fn resolve_update(&self, current: &Endpoint, candidates: &[Endpoint]) -> Endpoint {
        if let Some(resource) = current.label("resource") {
            if let Some(matching) = candidates.iter().find(|c| c.label("resource") == Some(resource)) {
                return matching.clone();
            }
        }
        self.resolve_create(candidates)
    }
}

/// Called for each current provider-specific property name with
/// `(name, current_value, desired_value_or_empty)`; returns whether the two
/// values should be considered equal.
pub type PropertyComparator = Box<dyn Fn(&str, &str, &str) -> bool + Send + Sync>;

pub struct PlanCalculator {
    domain_filter: DomainFilter,
    /// A second filter ANDed with `domain_filter` (spec.md §4.F step 5:
    /// "compose the domain filter from controller filter and
    /// registry.GetDomainFilter()"), kept separate from `domain_filter`
    /// rather than merged into it since the two filters' include/exclude
    /// suffix lists don't compose losslessly into a single filter.
    extra_domain_filter: Option<DomainFilter>,
    managed_types: HashSet<RecordType>,
    excluded_types: HashSet<RecordType>,
    owner_id: String,
    policies: Vec<Policy>,
    resolver: Box<dyn ConflictResolver + Send + Sync>,
    property_comparator: Option<PropertyComparator>,
}

impl PlanCalculator {
    pub fn new(domain_filter: DomainFilter, managed_types: HashSet<RecordType>, owner_id: impl Into<String>) -> Self {
        PlanCalculator {
            domain_filter,
            extra_domain_filter: None,
            managed_types,
            excluded_types: HashSet::new(),
            owner_id: owner_id.into(),
            policies: vec![Policy::Sync],
            resolver: Box::new(PerResource),
            property_comparator: None,
        }
    }

    /// AND an additional domain filter in, e.g. the registry's own
    /// `GetDomainFilter()` (spec.md §4.F step 5).
    pub fn with_extra_domain_filter(mut self, filter: DomainFilter) -> Self {
        self.extra_domain_filter = Some(filter);
        self
    }

    pub fn excluding_types(mut self, excluded_types: HashSet<RecordType>) -> Self {
        self.excluded_types = excluded_types;
        self
    }

    pub fn with_policies(mut self, policies: Vec<Policy>) -> Self {
        self.policies = policies;
        self
    }

    pub fn with_resolver(mut self, resolver: Box<dyn ConflictResolver + Send + Sync>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_property_comparator(mut self, cmp: PropertyComparator) -> Self {
        self.property_comparator = Some(cmp);
        self
    }

    fn is_managed(&self, record_type: RecordType) -> bool {
        self.managed_types.contains(&record_type) && !self.excluded_types.contains(&record_type)
    }

    fn filter(&self, endpoints: Vec<Endpoint>) -> Vec<Endpoint> {
        endpoints
            .into_iter()
            .filter(|e| {
                match_all_domain_filters(&[Some(&self.domain_filter), self.extra_domain_filter.as_ref()], &e.dns_name)
                    && self.is_managed(e.record_type)
            })
            .collect()
    }

    /// Run the full algorithm (spec.md §4.D).
    ///
    /// `missing` are appended to `create`, filtered only by domain/managed
    /// type — used by the ownership registry to backfill records required
    /// by a new ownership-encoding scheme (see [`crate::registry`]).
    pub fn calculate(
        &self,
        current: Vec<Endpoint>,
        desired: Vec<Endpoint>,
        missing: Vec<Endpoint>,
        metrics: &dyn MetricsRegistry,
    ) -> Changes {
        let current = self.filter(current);
        let desired = self.filter(desired);

        let mut table: HashMap<(String, Option<String>), PlanRow> = HashMap::new();
        for c in current {
            let key = (c.dns_name.clone(), c.set_identifier.clone());
            table.entry(key).or_default().current = Some(c);
        }
        for d in desired {
            let key = (d.dns_name.clone(), d.set_identifier.clone());
            table.entry(key).or_default().candidates.push(d);
        }

        let mut changes = Changes::default();

        for ((name, set_id), row) in table {
            trace!("processing plan row {:?}[{:?}]", name, set_id);
            let PlanRow { current, candidates } = row;

            if let Some(current) = &current {
                if let Some(owner) = current.label("owner") {
                    if !owner.is_empty() && owner != self.owner_id {
                        metrics.inc_owner_conflict(
                            &current.record_type.to_string(),
                            &self.owner_id,
                            owner,
                            &apex_domain(&name),
                        );
                        debug!("skipping {} owned by foreign controller {:?}", name, owner);
                        continue;
                    }
                }
            }

            let (candidates, extra_delete) = resolve_cname_conflict(current.as_ref(), candidates);
            let current = if extra_delete.is_some() { None } else { current };
            if let Some(extra) = extra_delete {
                changes.delete.push(extra);
            }

            match (current, candidates.is_empty()) {
                (None, true) => {}
                (None, false) => {
                    changes.create.push(self.resolver.resolve_create(&candidates));
                }
                (Some(current), true) => {
                    changes.delete.push(current);
                }
                (Some(current), false) => {
                    let mut resolved = self.resolver.resolve_update(&current, &candidates);
                    let should_update = self.should_update_ttl(&resolved, &current)
                        || target_changed(&resolved, &current)
                        || self.should_update_provider_specific(&resolved, &current);
                    if should_update {
                        if let Some(owner) = current.label("owner") {
                            resolved.set_label("owner", owner);
                        }
                        changes.update_old.push(current);
                        changes.update_new.push(resolved);
                    }
                }
            }
        }

        let mut changes = policy::apply_all(&self.policies, changes);
        changes.create.extend(self.filter(missing));
        changes
    }

    fn should_update_ttl(&self, desired: &Endpoint, current: &Endpoint) -> bool {
        desired.record_ttl != 0 && desired.record_ttl != current.record_ttl
    }

    fn should_update_provider_specific(&self, desired: &Endpoint, current: &Endpoint) -> bool {
        for (name, current_value) in &current.provider_specific {
            let desired_value = desired.provider_specific(name).unwrap_or("");
            let equal = match &self.property_comparator {
                Some(cmp) => cmp(name, current_value, desired_value),
                None => current_value == desired_value,
            };
            if !equal {
                return true;
            }
        }
        false
    }
}

fn target_changed(desired: &Endpoint, current: &Endpoint) -> bool {
    !targets_same(&current.targets, &desired.targets)
}

#[derive(Default)]
struct PlanRow {
    current: Option<Endpoint>,
    candidates: Vec<Endpoint>,
}

/// RFC 1034 §3.6.2: a CNAME at a name may not coexist with any other type.
/// If `candidates` mix CNAME and non-CNAME, the CNAME candidates are
/// discarded; a current CNAME is returned separately so the caller can
/// queue it for deletion once the row is reprocessed as "create" for the
/// surviving non-CNAME candidates.
fn resolve_cname_conflict(current: Option<&Endpoint>, candidates: Vec<Endpoint>) -> (Vec<Endpoint>, Option<Endpoint>) {
    let has_cname = candidates.iter().any(|c| c.record_type == RecordType::Cname);
    let has_other = candidates.iter().any(|c| c.record_type != RecordType::Cname);

    if !(has_cname && has_other) {
        return (candidates, None);
    }

    let filtered: Vec<Endpoint> = candidates.into_iter().filter(|c| c.record_type != RecordType::Cname).collect();

    match current {
        Some(cur) if cur.record_type == RecordType::Cname => (filtered, Some(cur.clone())),
        _ => (filtered, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::RecordType;
    use crate::metrics::InMemoryMetrics;

    fn calc(owner: &str) -> PlanCalculator {
        PlanCalculator::new(
            DomainFilter::default(),
            HashSet::from([
                RecordType::A,
                RecordType::Aaaa,
                RecordType::Cname,
                RecordType::Txt,
            ]),
            owner,
        )
    }

    fn a(name: &str, ip: &str) -> Endpoint {
        Endpoint::new(name, RecordType::A, vec![ip.to_string()])
    }

    fn cname(name: &str, target: &str) -> Endpoint {
        Endpoint::new(name, RecordType::Cname, vec![target.to_string()])
    }

    #[test]
    fn property_1_no_diff_when_current_equals_desired() {
        let metrics = InMemoryMetrics::new();
        let current = vec![a("foo.example.com", "1.2.3.4")];
        let desired = vec![a("foo.example.com", "1.2.3.4")];
        let changes = calc("me").calculate(current, desired, vec![], &metrics);
        assert!(changes.is_empty());
    }

    #[test]
    fn s1_first_round_create_resolves_minimum() {
        let metrics = InMemoryMetrics::new();
        let desired = vec![
            cname("foo.example.com", "v1"),
            cname("foo.example.com", "v2"),
            a("bar.example.com", "127.0.0.1"),
        ];
        let changes = calc("me").calculate(vec![], desired, vec![], &metrics);
        assert_eq!(changes.create.len(), 2);
        assert!(changes.update_old.is_empty());
        assert!(changes.update_new.is_empty());
        assert!(changes.delete.is_empty());
        let foo = changes.create.iter().find(|e| e.dns_name == "foo.example.com").unwrap();
        assert_eq!(foo.targets, vec!["v1".to_string()]);
    }

    #[test]
    fn s2_ttl_only_update() {
        let metrics = InMemoryMetrics::new();
        let current = vec![a("bar.example.com", "127.0.0.1")];
        let desired = vec![a("bar.example.com", "127.0.0.1").with_ttl(300)];
        let changes = calc("me").calculate(current.clone(), desired.clone(), vec![], &metrics);
        assert_eq!(changes.update_old, current);
        assert_eq!(changes.update_new, desired);
    }

    #[test]
    fn s3_type_conflict_drops_cname() {
        let metrics = InMemoryMetrics::new();
        let desired = vec![cname("x.example.com", "v1"), a("x.example.com", "1.2.3.4")];
        let changes = calc("me").calculate(vec![], desired, vec![], &metrics);
        assert_eq!(changes.create.len(), 1);
        assert_eq!(changes.create[0].record_type, RecordType::A);
    }

    #[test]
    fn s4_foreign_owner_blocks_all_actions() {
        let metrics = InMemoryMetrics::new();
        let mut current = a("y.example.com", "1.1.1.1");
        current.set_label("owner", "other");
        let desired = vec![a("y.example.com", "2.2.2.2")];
        let changes = calc("me").calculate(vec![current], desired, vec![], &metrics);
        assert!(changes.is_empty());
        assert_eq!(metrics.owner_conflict_count("A", "me", "other", "example.com"), 1);
    }

    #[test]
    fn s5_delete_suppressed_by_upsert_only_policy() {
        let metrics = InMemoryMetrics::new();
        let current = vec![a("z.example.com", "1.1.1.1")];
        let calculator = calc("me").with_policies(vec![Policy::UpsertOnly]);
        let changes = calculator.calculate(current, vec![], vec![], &metrics);
        assert!(changes.is_empty());
    }

    #[test]
    fn current_cname_is_deleted_when_desired_switches_type() {
        let metrics = InMemoryMetrics::new();
        let current = vec![cname("x.example.com", "old-target")];
        let desired = vec![cname("x.example.com", "old-target"), a("x.example.com", "1.2.3.4")];
        let changes = calc("me").calculate(current, desired, vec![], &metrics);
        assert_eq!(changes.delete.len(), 1);
        assert_eq!(changes.delete[0].record_type, RecordType::Cname);
        assert_eq!(changes.create.len(), 1);
        assert_eq!(changes.create[0].record_type, RecordType::A);
    }

    #[test]
    fn property_3_delete_all_current_when_desired_empty() {
        let metrics = InMemoryMetrics::new();
        let current = vec![a("a.example.com", "1.1.1.1"), a("b.example.com", "2.2.2.2")];
        let changes = calc("me").calculate(current.clone(), vec![], vec![], &metrics);
        assert_eq!(changes.delete.len(), 2);
        assert!(changes.create.is_empty());
    }

    #[test]
    fn unset_ttl_never_forces_update() {
        let metrics = InMemoryMetrics::new();
        let current = vec![a("bar.example.com", "127.0.0.1").with_ttl(300)];
        let desired = vec![a("bar.example.com", "127.0.0.1")];
        let changes = calc("me").calculate(current, desired, vec![], &metrics);
        assert!(changes.is_empty());
    }

    #[test]
    fn domain_filter_drops_non_matching_names() {
        let metrics = InMemoryMetrics::new();
        let filter = DomainFilter::new(vec!["example.com".to_string()], vec![]);
        let calculator = PlanCalculator::new(filter, HashSet::from([RecordType::A]), "me");
        let desired = vec![a("foo.example.com", "1.1.1.1"), a("foo.example.org", "2.2.2.2")];
        let changes = calculator.calculate(vec![], desired, vec![], &metrics);
        assert_eq!(changes.create.len(), 1);
        assert_eq!(changes.create[0].dns_name, "foo.example.com");
    }

    #[test]
    fn missing_endpoints_are_appended_to_create_unfiltered_by_policy() {
        let metrics = InMemoryMetrics::new();
        let calculator = calc("me").with_policies(vec![Policy::CreateOnly]);
        let missing = vec![a("migrated.example.com", "9.9.9.9")];
        let changes = calculator.calculate(vec![], vec![], missing, &metrics);
        assert_eq!(changes.create.len(), 1);
    }

    #[test]
    fn provider_specific_mismatch_triggers_update() {
        let metrics = InMemoryMetrics::new();
        let current = vec![a("foo.example.com", "1.1.1.1")];
        let mut desired_ep = a("foo.example.com", "1.1.1.1");
        desired_ep.set_provider_specific("weight", "10");
        let changes = calc("me").calculate(current, vec![desired_ep], vec![], &metrics);
        assert_eq!(changes.update_old.len(), 1);
    }

    #[test]
    fn desired_only_provider_specific_does_not_trigger_update() {
        let metrics = InMemoryMetrics::new();
        let current = vec![a("foo.example.com", "1.1.1.1")];
        let mut desired_ep = a("foo.example.com", "1.1.1.1");
        desired_ep.set_provider_specific("new-prop", "x");
        let changes = calc("me").calculate(current, vec![desired_ep], vec![], &metrics);
        assert!(changes.is_empty());
    }
}
