//! Include/exclude zone matching, consulted by every pipeline stage
//! (source filtering, plan calculation, registry record listing).

use regex::Regex;

/// Configured with dotted-suffix include/exclude lists and optional
/// include/exclude regexes. `match(name)` is true iff the name matches an
/// include (or all suffix/regex filters are empty) AND matches no exclude.
#[derive(Debug, Clone)]
pub struct DomainFilter {
    include: Vec<String>,
    exclude: Vec<String>,
    include_regex: Option<Regex>,
    exclude_regex: Option<Regex>,
}

impl Default for DomainFilter {
    /// The universal filter: matches every name.
    fn default() -> Self {
        DomainFilter {
            include: Vec::new(),
            exclude: Vec::new(),
            include_regex: None,
            exclude_regex: None,
        }
    }
}

impl DomainFilter {
    pub fn new(include: Vec<String>, exclude: Vec<String>) -> Self {
        DomainFilter {
            include: include.into_iter().map(|s| normalize_suffix(&s)).collect(),
            exclude: exclude.into_iter().map(|s| normalize_suffix(&s)).collect(),
            include_regex: None,
            exclude_regex: None,
        }
    }

    pub fn with_include_regex(mut self, pattern: &str) -> Result<Self, regex::Error> {
        self.include_regex = Some(Regex::new(pattern)?);
        Ok(self)
    }

    pub fn with_exclude_regex(mut self, pattern: &str) -> Result<Self, regex::Error> {
        self.exclude_regex = Some(Regex::new(pattern)?);
        Ok(self)
    }

    /// True iff `name` matches an include (or all suffixes/regexes are
    /// empty) AND matches no exclude.
    pub fn matches(&self, name: &str) -> bool {
        let name = name.trim_end_matches('.').to_ascii_lowercase();

        if let Some(re) = &self.exclude_regex {
            if re.is_match(&name) {
                return false;
            }
        }
        if self.exclude.iter().any(|suf| matches_suffix(&name, suf)) {
            return false;
        }

        let has_any_include = !self.include.is_empty() || self.include_regex.is_some();
        if !has_any_include {
            return true;
        }
        if let Some(re) = &self.include_regex {
            if re.is_match(&name) {
                return true;
            }
        }
        self.include.iter().any(|suf| matches_suffix(&name, suf))
    }

    pub fn is_universal(&self) -> bool {
        self.include.is_empty()
            && self.exclude.is_empty()
            && self.include_regex.is_none()
            && self.exclude_regex.is_none()
    }
}

fn normalize_suffix(s: &str) -> String {
    s.trim_end_matches('.').to_ascii_lowercase()
}

fn matches_suffix(name: &str, suffix: &str) -> bool {
    name == suffix || name.ends_with(&format!(".{}", suffix))
}

/// Composes filters with logical AND; a `None` filter is treated as
/// universal (matches everything).
pub fn match_all_domain_filters(filters: &[Option<&DomainFilter>], name: &str) -> bool {
    filters
        .iter()
        .all(|f| f.map(|f| f.matches(name)).unwrap_or(true))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn universal_filter_matches_everything() {
        let f = DomainFilter::default();
        assert!(f.matches("anything.example.com"));
        assert!(f.is_universal());
    }

    #[test]
    fn include_suffix_matches_subdomains() {
        let f = DomainFilter::new(vec!["example.com".to_string()], vec![]);
        assert!(f.matches("example.com"));
        assert!(f.matches("foo.example.com"));
        assert!(!f.matches("example.org"));
        assert!(!f.matches("notexample.com"));
    }

    #[test]
    fn exclude_wins_over_include() {
        let f = DomainFilter::new(
            vec!["example.com".to_string()],
            vec!["internal.example.com".to_string()],
        );
        assert!(f.matches("foo.example.com"));
        assert!(!f.matches("svc.internal.example.com"));
    }

    #[test]
    fn regex_filters_apply() {
        let f = DomainFilter::default()
            .with_include_regex(r"^.*\.prod\.example\.com$")
            .unwrap();
        assert!(f.matches("api.prod.example.com"));
        assert!(!f.matches("api.staging.example.com"));
    }

    #[test]
    fn match_all_domain_filters_is_logical_and() {
        let a = DomainFilter::new(vec!["example.com".to_string()], vec![]);
        let b = DomainFilter::new(vec![], vec!["internal.example.com".to_string()]);
        assert!(match_all_domain_filters(&[Some(&a), Some(&b)], "foo.example.com"));
        assert!(!match_all_domain_filters(
            &[Some(&a), Some(&b)],
            "foo.internal.example.com"
        ));
        assert!(match_all_domain_filters(&[None, Some(&b)], "anything.com"));
    }

    #[test]
    fn trailing_dot_is_ignored() {
        let f = DomainFilter::new(vec!["example.com".to_string()], vec![]);
        assert!(f.matches("foo.example.com."));
    }
}
