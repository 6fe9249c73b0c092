//! Apex-domain scope enforcement and domain grammar checks.

/// Syntactic check for a DNS name: dot-separated labels of at most 63
/// chars, alphanumeric plus inner hyphens, with an alphabetic TLD of at
/// least two chars.
pub fn is_valid_domain(name: &str) -> bool {
    let name = name.trim_end_matches('.');
    if name.is_empty() || name.len() > 253 {
        return false;
    }
    let labels: Vec<&str> = name.split('.').collect();
    if labels.len() < 2 {
        return false;
    }
    for label in &labels {
        if label.is_empty() || label.len() > 63 {
            return false;
        }
        if label.starts_with('-') || label.ends_with('-') {
            return false;
        }
        if !label
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-')
        {
            return false;
        }
    }
    let tld = labels[labels.len() - 1];
    tld.len() >= 2 && tld.chars().all(|c| c.is_ascii_alphabetic())
}

/// Filters discovered hosts against an asset's apex-domain set.
///
/// A host is in scope when it equals an apex or is a subdomain of one.
/// Out-of-scope records are dropped and counted, never treated as errors.
#[derive(Debug, Clone)]
pub struct ScopeFilter {
    apexes: Vec<String>,
}

impl ScopeFilter {
    pub fn new<I, S>(apexes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            apexes: apexes
                .into_iter()
                .map(|a| a.into().to_ascii_lowercase())
                .collect(),
        }
    }

    pub fn contains(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        let host = host.trim_end_matches('.');
        self.apexes
            .iter()
            .any(|apex| host == apex || host.ends_with(&format!(".{apex}")))
    }

    pub fn apexes(&self) -> &[String] {
        &self.apexes
    }
}
