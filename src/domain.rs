//! Domain names and their sort-friendly index keys.
//!
//! The archive's CDX index keys every capture by a SURT-style search key: the
//! host's labels reversed and comma-joined, followed by `)` and the path.
//! Under lexicographic order this puts a domain and all of its subdomains
//! next to each other:
//!
//! ```text
//! com,example)/              ← example.com
//! com,example,blog)/post     ← blog.example.com
//! com,example,www)/          ← www.example.com
//! com,exampleinc)/           ← exampleinc.com (not a match)
//! ```

use std::fmt;
use std::str::FromStr;

use crate::error::{CollectorError, CollectorResult};

/// A validated domain together with its reversed-label search key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DomainKey {
    domain: String,
    key: String,
}

impl DomainKey {
    /// Validate `domain` and build its key (`example.com` → `com,example`).
    ///
    /// Labels must be non-empty and consist of ASCII alphanumerics and
    /// hyphens, and there must be at least one dot. Input is lowercased.
    pub fn new(domain: &str) -> CollectorResult<Self> {
        let domain = domain.trim().to_ascii_lowercase();
        let invalid = |reason: &str| CollectorError::InvalidDomain {
            domain: domain.clone(),
            reason: reason.to_string(),
        };

        if !domain.contains('.') {
            return Err(invalid("a domain needs at least one dot"));
        }
        let labels: Vec<&str> = domain.split('.').collect();
        for label in &labels {
            if label.is_empty() {
                return Err(invalid("empty label"));
            }
            if !label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
                return Err(invalid(
                    "labels may only contain alphanumeric characters and hyphens",
                ));
            }
        }

        let key = labels.iter().rev().copied().collect::<Vec<_>>().join(",");
        Ok(Self { domain, key })
    }

    /// Rebuild a domain from a stored search key (`com,example` → `example.com`).
    pub fn from_search_key(key: &str) -> CollectorResult<Self> {
        let domain = key.split(',').rev().collect::<Vec<_>>().join(".");
        Self::new(&domain)
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn search_key(&self) -> &str {
        &self.key
    }

    /// The smallest index key that can belong to this domain. Every match
    /// sorts at or after it.
    pub fn lower_bound(&self) -> String {
        format!("{})", self.key)
    }

    pub fn matches(&self, search_key: &str) -> bool {
        is_match(search_key, &self.key)
    }
}

impl fmt::Display for DomainKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.domain)
    }
}

impl FromStr for DomainKey {
    type Err = CollectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Whether an index `search_key` belongs to the domain keyed by `key`.
///
/// `)` closes the host part of an exact match; `,` continues into a
/// subdomain label. Anything else (`com,exampleinc)`) is a different host.
pub fn is_match(search_key: &str, key: &str) -> bool {
    match search_key.strip_prefix(key) {
        Some(rest) => rest.starts_with(')') || rest.starts_with(','),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_reverses_labels() {
        let key = DomainKey::new("example.com").unwrap();
        assert_eq!(key.search_key(), "com,example");
        assert_eq!(key.lower_bound(), "com,example)");

        let key = DomainKey::new("Blog.Example.co.uk").unwrap();
        assert_eq!(key.domain(), "blog.example.co.uk");
        assert_eq!(key.search_key(), "uk,co,example,blog");
    }

    #[test]
    fn test_rejects_invalid_domains() {
        assert!(DomainKey::new("localhost").is_err());
        assert!(DomainKey::new("example..com").is_err());
        assert!(DomainKey::new("example.com/path").is_err());
        assert!(DomainKey::new("exa_mple.com").is_err());
        assert!(DomainKey::new("").is_err());
        assert!(DomainKey::new("my-site.example.org").is_ok());
    }

    #[test]
    fn test_match_predicate() {
        assert!(is_match("com,example)/x", "com,example"));
        assert!(is_match("com,example,www)/x", "com,example"));
        assert!(!is_match("com,exampleinc)/x", "com,example"));
        assert!(!is_match("com,example-shop)/", "com,example"));
        assert!(!is_match("com,exampl)/", "com,example"));
        assert!(!is_match("com,example", "com,example"));
    }

    #[test]
    fn test_search_key_round_trip() {
        let key = DomainKey::new("www.example.com").unwrap();
        let back = DomainKey::from_search_key(key.search_key()).unwrap();
        assert_eq!(back, key);
    }

    #[test]
    fn test_lower_bound_sorts_before_all_matches() {
        let key = DomainKey::new("example.com").unwrap();
        let bound = key.lower_bound();
        for candidate in ["com,example)/", "com,example,a)/", "com,example,zzz)/x"] {
            assert!(candidate >= bound.as_str());
            assert!(key.matches(candidate));
        }
        assert!("com,examplf)/" > bound.as_str());
        assert!(!key.matches("com,examplf)/"));
    }
}
