//! Destination whitelist and the [`DomainMatcher`] that enforces it.
//!
//! A host is allowed iff it equals a whitelist entry or is a subdomain of
//! one: with `github.com` listed, `api.github.com` passes and
//! `evilgithub.com` does not. An empty whitelist denies everything.
//!
//! The active [`Whitelist`] is an immutable snapshot behind an [`ArcSwap`].
//! Readers take the current `Arc` without locking; [`DomainMatcher::reload`]
//! swaps in a complete new set, so a decision never sees a half-updated list.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::Result;

/// Lowercase a host and strip any scheme, userinfo, path, port and trailing dot.
///
/// `HTTPS://API.GitHub.com:443/x` becomes `api.github.com`. Bracketed IPv6
/// literals keep their address and lose the brackets.
pub fn normalize_host(host: &str) -> String {
    let mut h = host.trim();
    if let Some((_, rest)) = h.split_once("://") {
        h = rest;
    }
    if let Some(end) = h.find(['/', '?', '#']) {
        h = &h[..end];
    }
    if let Some((_, rest)) = h.rsplit_once('@') {
        h = rest;
    }
    let h = if let Some(inner) = h.strip_prefix('[') {
        inner.split(']').next().unwrap_or(inner)
    } else if h.matches(':').count() == 1 {
        h.split(':').next().unwrap_or(h)
    } else {
        h
    };
    h.trim_end_matches('.').to_ascii_lowercase()
}

/// Normalize a whitelist line. A leading `*.` or `.` is dropped; subdomains
/// always match.
fn normalize_entry(entry: &str) -> Option<String> {
    let entry = entry.trim();
    let entry = entry
        .strip_prefix("*.")
        .or_else(|| entry.strip_prefix('.'))
        .unwrap_or(entry);
    let normalized = normalize_host(entry);
    (!normalized.is_empty()).then_some(normalized)
}

/// Outcome of a destination check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Verdict {
    pub allowed: bool,
    pub reason: String,
}

/// An immutable set of normalized whitelist entries.
#[derive(Debug, Clone, Default)]
pub struct Whitelist {
    domains: HashSet<String>,
}

impl Whitelist {
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            domains: entries
                .into_iter()
                .filter_map(|e| normalize_entry(e.as_ref()))
                .collect(),
        }
    }

    /// Parse a line-oriented list. Blank lines and `#` comments are ignored.
    pub fn parse(text: &str) -> Self {
        Self::new(
            text.lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#')),
        )
    }

    /// Read and parse a whitelist file.
    pub fn load(path: &Path) -> Result<Self> {
        Ok(Self::parse(&std::fs::read_to_string(path)?))
    }

    /// Load a whitelist, treating any read failure as an empty list (deny all).
    pub fn load_or_deny_all(path: &Path) -> Self {
        match Self::load(path) {
            Ok(whitelist) => whitelist,
            Err(e) => {
                warn!(
                    "Whitelist {} could not be loaded ({}); denying all destinations",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    /// The entry that permits `host`, if any.
    pub fn matching_entry(&self, host: &str) -> Option<&str> {
        let host = normalize_host(host);
        if host.is_empty() {
            return None;
        }
        if let Some(entry) = self.domains.get(host.as_str()) {
            return Some(entry.as_str());
        }
        host.match_indices('.')
            .find_map(|(i, _)| self.domains.get(&host[i + 1..]))
            .map(String::as_str)
    }

    pub fn is_allowed(&self, host: &str) -> bool {
        self.matching_entry(host).is_some()
    }

    pub fn evaluate(&self, host: &str) -> Verdict {
        let normalized = normalize_host(host);
        if normalized.is_empty() {
            return Verdict {
                allowed: false,
                reason: "request has no destination host".to_string(),
            };
        }
        match self.matching_entry(&normalized) {
            Some(entry) => Verdict {
                allowed: true,
                reason: format!("host '{}' matches whitelist entry '{}'", normalized, entry),
            },
            None if self.is_empty() => Verdict {
                allowed: false,
                reason: format!("host '{}' is not whitelisted (whitelist is empty)", normalized),
            },
            None => Verdict {
                allowed: false,
                reason: format!("host '{}' is not whitelisted", normalized),
            },
        }
    }

    /// Entries in sorted order.
    pub fn entries(&self) -> Vec<&str> {
        let mut entries: Vec<&str> = self.domains.iter().map(String::as_str).collect();
        entries.sort_unstable();
        entries
    }

    pub fn len(&self) -> usize {
        self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }
}

/// Answers allow/deny for hosts against the current whitelist snapshot.
#[derive(Debug)]
pub struct DomainMatcher {
    current: ArcSwap<Whitelist>,
}

impl DomainMatcher {
    /// Wrap an initial whitelist. An empty list is announced once here.
    pub fn new(whitelist: Whitelist) -> Self {
        if whitelist.is_empty() {
            warn!("Effective whitelist is empty: all outbound traffic will be denied");
        } else {
            info!("Whitelist active ({} domains)", whitelist.len());
        }
        Self {
            current: ArcSwap::from_pointee(whitelist),
        }
    }

    /// The snapshot current at the time of the call.
    pub fn snapshot(&self) -> Arc<Whitelist> {
        self.current.load_full()
    }

    pub fn is_allowed(&self, host: &str) -> bool {
        self.current.load().is_allowed(host)
    }

    pub fn evaluate(&self, host: &str) -> Verdict {
        self.current.load().evaluate(host)
    }

    /// Atomically replace the whitelist. In-flight decisions keep the snapshot they hold.
    pub fn reload(&self, whitelist: Whitelist) {
        if whitelist.is_empty() {
            warn!("Reloaded whitelist is empty: all outbound traffic will be denied");
        } else {
            info!("Whitelist reloaded ({} domains)", whitelist.len());
        }
        self.current.store(Arc::new(whitelist));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_hosts() {
        assert_eq!(normalize_host("API.GitHub.com"), "api.github.com");
        assert_eq!(normalize_host("api.github.com:443"), "api.github.com");
        assert_eq!(normalize_host("https://api.github.com/x?y"), "api.github.com");
        assert_eq!(normalize_host("github.com."), "github.com");
        assert_eq!(normalize_host("user:pw@github.com:8080"), "github.com");
        assert_eq!(normalize_host("[::1]:8080"), "::1");
    }

    #[test]
    fn parse_ignores_comments_and_blank_lines() {
        let wl = Whitelist::parse("# Comment\napi.anthropic.com\n\n  GitHub.com  \n# x.com\n");
        assert_eq!(wl.entries(), vec!["api.anthropic.com", "github.com"]);
    }

    #[test]
    fn exact_and_subdomain_match() {
        let wl = Whitelist::new(["github.com"]);
        assert!(wl.is_allowed("github.com"));
        assert!(wl.is_allowed("api.github.com"));
        assert!(wl.is_allowed("a.b.github.com:443"));
        assert!(!wl.is_allowed("evilgithub.com"));
        assert!(!wl.is_allowed("notgithub.com"));
        assert!(!wl.is_allowed("github.com.evil.io"));
        assert!(!wl.is_allowed("raw.githubusercontent.com"));
    }

    #[test]
    fn wildcard_entries_normalize_to_suffix() {
        let wl = Whitelist::new(["*.npmjs.org", ".pypi.org"]);
        assert!(wl.is_allowed("registry.npmjs.org"));
        assert!(wl.is_allowed("files.pypi.org"));
    }

    #[test]
    fn empty_whitelist_denies_everything() {
        let wl = Whitelist::default();
        for host in ["github.com", "localhost", "a.b.c"] {
            assert!(!wl.is_allowed(host));
        }
        assert!(wl.evaluate("github.com").reason.contains("not whitelisted"));
    }

    #[test]
    fn deny_reason_cites_not_whitelisted() {
        let wl = Whitelist::new(["github.com"]);
        let verdict = wl.evaluate("evilgithub.com");
        assert!(!verdict.allowed);
        assert_eq!(verdict.reason, "host 'evilgithub.com' is not whitelisted");
    }

    #[test]
    fn empty_host_denied() {
        let wl = Whitelist::new(["github.com"]);
        assert!(!wl.evaluate("").allowed);
        assert!(!wl.evaluate(":443").allowed);
    }

    #[test]
    fn load_or_deny_all_on_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let wl = Whitelist::load_or_deny_all(&dir.path().join("missing.txt"));
        assert!(wl.is_empty());
    }

    #[test]
    fn reload_swaps_snapshot_without_touching_held_ones() {
        let matcher = DomainMatcher::new(Whitelist::new(["old.com"]));
        let before = matcher.snapshot();
        matcher.reload(Whitelist::new(["new.com"]));

        assert!(before.is_allowed("old.com"));
        assert!(!before.is_allowed("new.com"));
        assert!(matcher.is_allowed("new.com"));
        assert!(!matcher.is_allowed("old.com"));
    }

    #[test]
    fn concurrent_reads_during_reload_see_whole_sets() {
        let matcher = Arc::new(DomainMatcher::new(Whitelist::new(["a.com", "b.com"])));
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let matcher = matcher.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        let snap = matcher.snapshot();
                        // Both entries of a set are present together, or neither is.
                        assert_eq!(snap.is_allowed("a.com"), snap.is_allowed("b.com"));
                    }
                })
            })
            .collect();
        for i in 0..100 {
            if i % 2 == 0 {
                matcher.reload(Whitelist::new(["c.com", "d.com"]));
            } else {
                matcher.reload(Whitelist::new(["a.com", "b.com"]));
            }
        }
        for r in readers {
            r.join().unwrap();
        }
    }
}
