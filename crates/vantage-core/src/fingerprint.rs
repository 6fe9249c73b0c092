//! URL normalization and content-addressed hashing.
//!
//! Two layers of dedup: a process-local hash set suppresses duplicates
//! before write; the persistence layer's unique constraint is the source
//! of truth.

use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::Mutex;
use url::Url;

use crate::error::ScanError;

/// A normalized URL and its SHA-256 fingerprint (lowercase hex, 64 chars).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pub normalized: String,
    pub hash: String,
}

/// Normalize a URL and hash it.
///
/// Rules: lowercase scheme and host, strip default ports, drop the
/// fragment, sort query parameters by key (values sorted within a key),
/// trim trailing slashes from the path unless the path is `/`. Inputs
/// without a scheme (or without a host) are rejected. Normalization is a
/// fixed point: feeding the normalized form back in returns it unchanged.
pub fn normalize_url(raw: &str) -> Result<Fingerprint, ScanError> {
    let mut url =
        Url::parse(raw).map_err(|e| ScanError::InvalidUrl(raw.to_string(), e.to_string()))?;

    if url.host_str().is_none() {
        return Err(ScanError::InvalidUrl(
            raw.to_string(),
            "URL has no host".to_string(),
        ));
    }

    url.set_fragment(None);

    // The url crate already lowercases scheme and host and drops known
    // default ports; query ordering and the trailing slash are on us.
    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if pairs.is_empty() {
        url.set_query(None);
    } else {
        pairs.sort();
        let mut serializer = url.query_pairs_mut();
        serializer.clear();
        for (k, v) in &pairs {
            serializer.append_pair(k, v);
        }
        drop(serializer);
    }

    let path = url.path().to_string();
    if path.len() > 1 && path.ends_with('/') {
        let trimmed = path.trim_end_matches('/');
        url.set_path(if trimmed.is_empty() { "/" } else { trimmed });
    }

    let normalized = url.to_string();
    let hash = hex::encode(Sha256::digest(normalized.as_bytes()));

    Ok(Fingerprint { normalized, hash })
}

/// Process-local set of already-seen natural keys.
///
/// Single logical writer (the worker's result fan-in); the mutex
/// serializes callback writes per spec'd ownership rules.
#[derive(Debug, Default)]
pub struct DedupSet {
    seen: Mutex<HashSet<String>>,
}

impl DedupSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the key was not seen before.
    pub fn insert(&self, key: &str) -> bool {
        self.seen.lock().unwrap().insert(key.to_string())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.seen.lock().unwrap().contains(key)
    }

    pub fn len(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_case_port_fragment_and_query_order() {
        let a = normalize_url("https://Example.com:443/A?b=2&a=1#x").unwrap();
        let b = normalize_url("HTTPS://EXAMPLE.COM/A?a=1&b=2").unwrap();
        assert_eq!(a.normalized, "https://example.com/A?a=1&b=2");
        assert_eq!(a, b);
    }

    #[test]
    fn hash_is_sha256_of_normalized_form() {
        let fp = normalize_url("https://Example.com:443/A?b=2&a=1#x").unwrap();
        let expected = hex::encode(Sha256::digest("https://example.com/A?a=1&b=2".as_bytes()));
        assert_eq!(fp.hash, expected);
        assert_eq!(fp.hash.len(), 64);
        assert!(fp.hash.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn root_path_keeps_trailing_slash() {
        let fp = normalize_url("https://example.com/").unwrap();
        assert_eq!(fp.normalized, "https://example.com/");
        let bare = normalize_url("https://example.com").unwrap();
        assert_eq!(bare.normalized, "https://example.com/");
    }

    #[test]
    fn deep_path_trailing_slash_is_trimmed() {
        let fp = normalize_url("https://example.com/a/b/").unwrap();
        assert_eq!(fp.normalized, "https://example.com/a/b");
    }

    #[test]
    fn normalize_is_a_fixed_point() {
        for raw in [
            "https://Example.com:443/A?b=2&a=1#x",
            "http://foo.test:80/path/?z=9&z=1&a=",
            "https://example.com/",
            "https://example.com/a//b//",
        ] {
            let once = normalize_url(raw).unwrap();
            let twice = normalize_url(&once.normalized).unwrap();
            assert_eq!(once, twice, "not a fixed point for {raw}");
        }
    }

    #[test]
    fn values_sorted_within_a_key() {
        let fp = normalize_url("https://example.com/?k=b&k=a&j=1").unwrap();
        assert_eq!(fp.normalized, "https://example.com/?j=1&k=a&k=b");
    }

    #[test]
    fn rejects_missing_scheme() {
        assert!(normalize_url("example.com/path").is_err());
        assert!(normalize_url("//example.com/path").is_err());
    }

    #[test]
    fn rejects_hostless_urls() {
        assert!(normalize_url("mailto:ops@example.com").is_err());
    }

    #[test]
    fn nonstandard_port_is_kept() {
        let fp = normalize_url("https://example.com:8443/x").unwrap();
        assert_eq!(fp.normalized, "https://example.com:8443/x");
    }

    #[test]
    fn dedup_set_reports_first_insert_only() {
        let set = DedupSet::new();
        assert!(set.insert("a"));
        assert!(!set.insert("a"));
        assert!(set.insert("b"));
        assert_eq!(set.len(), 2);
        assert!(set.contains("a"));
    }
}
