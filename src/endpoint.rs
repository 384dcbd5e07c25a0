//! The canonical DNS record representation ([`Endpoint`]) that every other
//! component in this crate operates on.
//!
//! Endpoints are produced by [`crate::source::Source`]s (desired state) and by
//! [`crate::provider::Provider`]s (current state, enriched with ownership
//! labels by [`crate::registry`]). The [`crate::plan`] module never talks to
//! a provider or source directly — it only ever sees `Endpoint`s.

use std::collections::BTreeMap;
use std::fmt::{self, Display};
use std::net::{Ipv4Addr, Ipv6Addr};

use thiserror::Error;

/// Maximum length, in bytes, of a single dot-separated DNS label (RFC 1035 §3.1).
const MAX_DNS_LABEL_LEN: usize = 63;

/// TTL in seconds. `0` means "unset / use the provider default" and never
/// participates in a diff (see [`crate::plan`]).
pub type Ttl = u32;

/// The DNS record types this crate can represent and reconcile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RecordType {
    A,
    Aaaa,
    Cname,
    Txt,
    Srv,
    Ns,
    Ptr,
    Mx,
    Naptr,
}

impl Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RecordType::A => "A",
            RecordType::Aaaa => "AAAA",
            RecordType::Cname => "CNAME",
            RecordType::Txt => "TXT",
            RecordType::Srv => "SRV",
            RecordType::Ns => "NS",
            RecordType::Ptr => "PTR",
            RecordType::Mx => "MX",
            RecordType::Naptr => "NAPTR",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for RecordType {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "A" => Ok(RecordType::A),
            "AAAA" => Ok(RecordType::Aaaa),
            "CNAME" => Ok(RecordType::Cname),
            "TXT" => Ok(RecordType::Txt),
            "SRV" => Ok(RecordType::Srv),
            "NS" => Ok(RecordType::Ns),
            "PTR" => Ok(RecordType::Ptr),
            "MX" => Ok(RecordType::Mx),
            "NAPTR" => Ok(RecordType::Naptr),
            other => Err(EndpointError::UnknownRecordType(other.to_string())),
        }
    }
}

/// Internal metadata attached to an endpoint (e.g. `owner`, `resource`). Kept
/// as a `BTreeMap` so iteration order is deterministic, which the TXT
/// serialization round-trip relies on.
pub type Labels = BTreeMap<String, String>;

/// A single `(name, value)` provider-specific property. Ordered because two
/// providers may treat repeated names differently; `set` is last-write-wins.
pub type ProviderSpecific = Vec<(String, String)>;

/// The unit of DNS intent: a name, a type, optional routing discriminator,
/// a TTL, an ordered list of targets, and two metadata bags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub dns_name: String,
    pub record_type: RecordType,
    pub set_identifier: Option<String>,
    pub record_ttl: Ttl,
    pub targets: Vec<String>,
    pub labels: Labels,
    pub provider_specific: ProviderSpecific,
}

/// `(dnsName, recordType, setIdentifier)` — required unique across the
/// desired set and across the current set (spec.md §3).
pub type EndpointKey = (String, RecordType, Option<String>);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EndpointError {
    #[error("dns label exceeds {MAX_DNS_LABEL_LEN} bytes: {0:?}")]
    LabelTooLong(String),
    #[error("empty dns name")]
    EmptyName,
    #[error("unknown record type: {0}")]
    UnknownRecordType(String),
    #[error("MX target does not match 'preference host' shape: {0:?}")]
    InvalidMxTarget(String),
    #[error("SRV target does not match 'priority weight port host' shape: {0:?}")]
    InvalidSrvTarget(String),
    #[error("A record target is not a valid IPv4 address: {0:?}")]
    InvalidARecordTarget(String),
    #[error("AAAA record target is not a valid IPv6 address: {0:?}")]
    InvalidAaaaRecordTarget(String),
}

impl Endpoint {
    /// Construct a new endpoint. `dns_name` is canonicalized immediately
    /// (lowercased, trailing dot stripped); callers wanting to surface a
    /// canonicalization failure should call [`Endpoint::validate`] afterwards.
    pub fn new(dns_name: impl Into<String>, record_type: RecordType, targets: Vec<String>) -> Self {
        let dns_name = canonicalize_name(&dns_name.into());
        Endpoint {
            dns_name,
            record_type,
            set_identifier: None,
            record_ttl: 0,
            targets,
            labels: Labels::new(),
            provider_specific: ProviderSpecific::new(),
        }
    }

    pub fn with_ttl(mut self, ttl: Ttl) -> Self {
        self.record_ttl = ttl;
        self
    }

    pub fn with_set_identifier(mut self, set_identifier: impl Into<String>) -> Self {
        self.set_identifier = Some(set_identifier.into());
        self
    }

    pub fn with_labels(mut self, labels: Labels) -> Self {
        self.labels = labels;
        self
    }

    /// `(dnsName, recordType, setIdentifier)`.
    pub fn key(&self) -> EndpointKey {
        (self.dns_name.clone(), self.record_type, self.set_identifier.clone())
    }

    pub fn label(&self, name: &str) -> Option<&str> {
        self.labels.get(name).map(String::as_str)
    }

    pub fn set_label(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.labels.insert(name.into(), value.into());
    }

    /// Merge `other` into this endpoint's labels without overwriting keys
    /// that are already present (non-destructive, per spec.md §4.A).
    pub fn merge_labels(&mut self, other: &Labels) {
        for (k, v) in other {
            self.labels.entry(k.clone()).or_insert_with(|| v.clone());
        }
    }

    /// Look up a provider-specific property by name.
    pub fn provider_specific(&self, name: &str) -> Option<&str> {
        self.provider_specific
            .iter()
            .rev()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Set (or overwrite, last-write-wins) a provider-specific property.
    pub fn set_provider_specific(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        if let Some(entry) = self.provider_specific.iter_mut().find(|(k, _)| *k == name) {
            entry.1 = value.into();
        } else {
            self.provider_specific.push((name, value.into()));
        }
    }

    pub fn delete_provider_specific(&mut self, name: &str) {
        self.provider_specific.retain(|(k, _)| k != name);
    }

    /// Re-run canonicalization and RFC-shape validation. Returns every
    /// problem found rather than stopping at the first, so callers can drop
    /// the offending endpoint and keep reconciling the rest (spec.md §7).
    pub fn validate(&self) -> Vec<EndpointError> {
        let mut errors = Vec::new();

        if self.dns_name.is_empty() {
            errors.push(EndpointError::EmptyName);
        }
        for label in self.dns_name.split('.') {
            if label.len() > MAX_DNS_LABEL_LEN {
                errors.push(EndpointError::LabelTooLong(label.to_string()));
            }
        }

        match self.record_type {
            RecordType::Mx => {
                for t in &self.targets {
                    if parse_mx_target(t).is_none() {
                        errors.push(EndpointError::InvalidMxTarget(t.clone()));
                    }
                }
            }
            RecordType::Srv => {
                for t in &self.targets {
                    if parse_srv_target(t).is_none() {
                        errors.push(EndpointError::InvalidSrvTarget(t.clone()));
                    }
                }
            }
            RecordType::A => {
                for t in &self.targets {
                    if t.parse::<Ipv4Addr>().is_err() {
                        errors.push(EndpointError::InvalidARecordTarget(t.clone()));
                    }
                }
            }
            RecordType::Aaaa => {
                for t in &self.targets {
                    if t.parse::<Ipv6Addr>().is_err() {
                        errors.push(EndpointError::InvalidAaaaRecordTarget(t.clone()));
                    }
                }
            }
            _ => {}
        }

        errors
    }

    /// Total order over this endpoint's target list, used by the default
    /// conflict resolver to pick a deterministic minimum among create
    /// candidates. Compares element-wise; a shorter, otherwise-equal list
    /// sorts first.
    pub fn targets_is_less(&self, other: &Endpoint) -> bool {
        for (a, b) in self.targets.iter().zip(other.targets.iter()) {
            if target_is_less(a, b) {
                return true;
            }
            if target_is_less(b, a) {
                return false;
            }
        }
        self.targets.len() < other.targets.len()
    }
}

impl Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}{} {:?}",
            self.dns_name,
            self.record_type,
            self.set_identifier
                .as_ref()
                .map(|s| format!("[{}]", s))
                .unwrap_or_default(),
            self.targets
        )
    }
}

/// Lowercase and strip a single trailing dot. Does not validate label
/// lengths (see [`Endpoint::validate`]) so it can be used unconditionally in
/// constructors.
pub fn canonicalize_name(name: &str) -> String {
    let name = name.strip_suffix('.').unwrap_or(name);
    name.to_ascii_lowercase()
}

/// Parse an `Ipv4Addr` or `Ipv6Addr` target into its canonical string form;
/// anything else is treated as an FQDN and only lowercased / de-dotted.
pub fn normalize_target(target: &str) -> String {
    if let Ok(v4) = target.parse::<Ipv4Addr>() {
        return v4.to_string();
    }
    if let Ok(v6) = target.parse::<Ipv6Addr>() {
        return v6.to_string();
    }
    canonicalize_name(target)
}

/// `Same(a,b)`: length-equal and pairwise case-insensitive with IP
/// normalization (spec.md §4.A). Order matters — this is a positional
/// comparison, not a set comparison.
pub fn targets_same(a: &[String], b: &[String]) -> bool {
    a.len() == b.len()
        && a.iter()
            .zip(b.iter())
            .all(|(x, y)| normalize_target(x) == normalize_target(y))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum TargetClass {
    Ipv4,
    Ipv6,
    Other,
}

fn classify(target: &str) -> (TargetClass, Ipv4Addr, Ipv6Addr, String) {
    if let Ok(v4) = target.parse::<Ipv4Addr>() {
        return (TargetClass::Ipv4, v4, Ipv6Addr::UNSPECIFIED, String::new());
    }
    if let Ok(v6) = target.parse::<Ipv6Addr>() {
        return (TargetClass::Ipv6, Ipv4Addr::UNSPECIFIED, v6, String::new());
    }
    (
        TargetClass::Other,
        Ipv4Addr::UNSPECIFIED,
        Ipv6Addr::UNSPECIFIED,
        target.to_ascii_lowercase(),
    )
}

/// `IsLess`: a total order over single targets that prefers IP targets over
/// FQDN targets, so `1-2-3-4.example.com` never sorts between IPv4 literals.
/// IPv6 addresses are compared after parsing, so shortened and expanded
/// forms of the same address compare equal.
pub fn target_is_less(a: &str, b: &str) -> bool {
    let (ca, a4, a6, astr) = classify(a);
    let (cb, b4, b6, bstr) = classify(b);

    if ca != cb {
        return ca < cb;
    }
    match ca {
        TargetClass::Ipv4 => a4 < b4,
        TargetClass::Ipv6 => a6 < b6,
        TargetClass::Other => astr < bstr,
    }
}

/// Parse an MX target of the shape `"<preference:u16> <host>"`.
pub fn parse_mx_target(target: &str) -> Option<(u16, &str)> {
    let mut parts = target.splitn(2, ' ');
    let pref = parts.next()?.parse::<u16>().ok()?;
    let host = parts.next()?;
    if host.is_empty() {
        return None;
    }
    Some((pref, host))
}

/// Parse an SRV target of the shape
/// `"<priority:u16> <weight:u16> <port:u16> <host>"`.
pub fn parse_srv_target(target: &str) -> Option<(u16, u16, u16, &str)> {
    let mut parts = target.splitn(4, ' ');
    let pri = parts.next()?.parse::<u16>().ok()?;
    let weight = parts.next()?.parse::<u16>().ok()?;
    let port = parts.next()?.parse::<u16>().ok()?;
    let host = parts.next()?;
    if host.is_empty() {
        return None;
    }
    Some((pri, weight, port, host))
}

/// The last two dot-separated labels of a DNS name; used only as a metric
/// label to cap cardinality (spec.md §4.D, Glossary).
pub fn apex_domain(name: &str) -> String {
    let labels: Vec<&str> = name.trim_end_matches('.').split('.').collect();
    if labels.len() <= 2 {
        labels.join(".")
    } else {
        labels[labels.len() - 2..].join(".")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonicalizes_trailing_dot_and_case() {
        let e = Endpoint::new("Foo.Example.COM.", RecordType::A, vec!["1.2.3.4".into()]);
        assert_eq!(e.dns_name, "foo.example.com");
    }

    #[test]
    fn targets_same_normalizes_ipv6() {
        let a = vec!["2001:db8::1".to_string()];
        let b = vec!["2001:0db8:0000:0000:0000:0000:0000:0001".to_string()];
        assert!(targets_same(&a, &b));
    }

    #[test]
    fn targets_same_requires_equal_length() {
        let a = vec!["1.1.1.1".to_string()];
        let b = vec!["1.1.1.1".to_string(), "2.2.2.2".to_string()];
        assert!(!targets_same(&a, &b));
    }

    #[test]
    fn target_is_less_prefers_ip_over_fqdn() {
        assert!(target_is_less("1.2.3.4", "1-2-3-4.example.com"));
        assert!(!target_is_less("1-2-3-4.example.com", "1.2.3.4"));
    }

    #[test]
    fn target_is_less_orders_ipv4_numerically() {
        assert!(target_is_less("10.0.0.1", "10.0.0.2"));
        assert!(!target_is_less("10.0.0.2", "10.0.0.1"));
    }

    #[test]
    fn mx_target_shape() {
        assert_eq!(parse_mx_target("10 mail.example.com"), Some((10, "mail.example.com")));
        assert_eq!(parse_mx_target("mail.example.com"), None);
        assert_eq!(parse_mx_target("10"), None);
    }

    #[test]
    fn srv_target_shape() {
        assert_eq!(
            parse_srv_target("10 20 5223 xmpp.example.com"),
            Some((10, 20, 5223, "xmpp.example.com"))
        );
        assert_eq!(parse_srv_target("10 20 5223"), None);
    }

    #[test]
    fn apex_domain_takes_last_two_labels() {
        assert_eq!(apex_domain("foo.bar.example.com"), "example.com");
        assert_eq!(apex_domain("example.com"), "example.com");
        assert_eq!(apex_domain("com"), "com");
    }

    #[test]
    fn validate_rejects_long_labels() {
        let long_label = "a".repeat(64);
        let e = Endpoint::new(format!("{}.example.com", long_label), RecordType::A, vec!["1.1.1.1".into()]);
        assert!(e.validate().iter().any(|e| matches!(e, EndpointError::LabelTooLong(_))));
    }

    #[test]
    fn validate_rejects_malformed_mx() {
        let e = Endpoint::new("example.com", RecordType::Mx, vec!["not-a-valid-target".into()]);
        assert!(e.validate().iter().any(|e| matches!(e, EndpointError::InvalidMxTarget(_))));
    }

    #[test]
    fn merge_labels_is_non_destructive() {
        let mut e = Endpoint::new("example.com", RecordType::A, vec!["1.1.1.1".into()]);
        e.set_label("owner", "me");
        let mut incoming = Labels::new();
        incoming.insert("owner".to_string(), "someone-else".to_string());
        incoming.insert("resource".to_string(), "svc/foo".to_string());
        e.merge_labels(&incoming);
        assert_eq!(e.label("owner"), Some("me"));
        assert_eq!(e.label("resource"), Some("svc/foo"));
    }

    #[test]
    fn provider_specific_last_write_wins() {
        let mut e = Endpoint::new("example.com", RecordType::A, vec!["1.1.1.1".into()]);
        e.set_provider_specific("weight", "10");
        e.set_provider_specific("weight", "20");
        assert_eq!(e.provider_specific("weight"), Some("20"));
        assert_eq!(e.provider_specific.len(), 1);
    }
}
