//! External-host whitelist for the forwarding path.
//!
//! A query name is allowed when it equals a stored entry or when
//! stripping leading labels at dot boundaries yields one
//! (`api.example.com` matches an `example.com` entry). Entries are
//! lowercased and trailing-dot-normalized on the way in. An enabled
//! whitelist with no entries blocks everything; a disabled whitelist
//! allows everything.

use std::collections::HashSet;

/// Allow-list of external hostnames the DNS layer may resolve.
#[derive(Debug, Clone, Default)]
pub struct Whitelist {
    enabled: bool,
    hosts: HashSet<String>,
}

fn normalize(host: &str) -> String {
    host.trim_end_matches('.').to_ascii_lowercase()
}

impl Whitelist {
    pub fn new() -> Self {
        Whitelist::default()
    }

    /// Replace the whole configuration.
    pub fn set(&mut self, enabled: bool, hosts: Vec<String>) {
        self.enabled = enabled;
        self.hosts = hosts.iter().map(|h| normalize(h)).collect();
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Stored entries, normalized.
    pub fn hosts(&self) -> Vec<String> {
        let mut hosts: Vec<String> = self.hosts.iter().cloned().collect();
        hosts.sort();
        hosts
    }

    pub fn add(&mut self, host: &str) {
        self.hosts.insert(normalize(host));
    }

    /// Returns whether the host was present.
    pub fn remove(&mut self, host: &str) -> bool {
        self.hosts.remove(&normalize(host))
    }

    /// Whether a query name passes the whitelist.
    pub fn allows(&self, name: &str) -> bool {
        if !self.enabled {
            return true;
        }

        let normalized = normalize(name);
        if self.hosts.contains(&normalized) {
            return true;
        }

        // Strip leading labels: api.cdn.example.com → cdn.example.com
        // → example.com → com.
        let mut rest = normalized.as_str();
        while let Some((_, suffix)) = rest.split_once('.') {
            if self.hosts.contains(suffix) {
                return true;
            }
            rest = suffix;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn whitelist(hosts: &[&str]) -> Whitelist {
        let mut w = Whitelist::new();
        w.set(true, hosts.iter().map(|h| h.to_string()).collect());
        w
    }

    #[test]
    fn disabled_allows_everything() {
        let w = Whitelist::new();
        assert!(w.allows("anything.example.net"));
        assert!(w.allows(""));
    }

    #[test]
    fn enabled_empty_blocks_everything() {
        let w = whitelist(&[]);
        assert!(!w.allows("example.com"));
        assert!(!w.allows("anything.at.all"));
    }

    #[test]
    fn exact_match_allowed() {
        let w = whitelist(&["example.com"]);
        assert!(w.allows("example.com"));
        assert!(w.allows("example.com."));
        assert!(w.allows("EXAMPLE.COM"));
    }

    #[test]
    fn subdomains_match_suffix_entry() {
        let w = whitelist(&["example.com"]);
        assert!(w.allows("api.example.com"));
        assert!(w.allows("deep.api.example.com."));
    }

    #[test]
    fn suffix_must_align_on_label_boundary() {
        let w = whitelist(&["example.com"]);
        assert!(!w.allows("notexample.com"));
        assert!(!w.allows("example.com.evil.net"));
    }

    #[test]
    fn unrelated_hosts_blocked() {
        let w = whitelist(&["example.com"]);
        assert!(!w.allows("evil.net"));
        assert!(!w.allows("com"));
    }

    #[test]
    fn entries_are_normalized() {
        let w = whitelist(&["Example.COM."]);
        assert!(w.allows("cdn.example.com"));
        assert_eq!(w.hosts(), vec!["example.com"]);
    }

    #[test]
    fn add_and_remove() {
        let mut w = whitelist(&["example.com"]);
        w.add("Trusted.ORG.");
        assert!(w.allows("a.trusted.org"));

        assert!(w.remove("example.com"));
        assert!(!w.allows("example.com"));
        assert!(!w.remove("example.com"));
    }
}
