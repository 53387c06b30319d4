//! Data Loss Prevention: detection rules and content scrubbing.
//!
//! - [`catalog`] loads the ordered [`catalog::PatternCatalog`] from a
//!   gitleaks-style rule file plus the built-in PII rules.
//! - [`patterns`] holds the built-in PII definitions and the default rule file.
//! - [`scrubber`] redacts matches in bodies, sensitive headers and URL query
//!   strings and reports [`Finding`]s.
//!
//! A [`Finding`] never carries the matched text, only the rule name, where it
//! matched and how many times.

pub mod catalog;
pub mod patterns;
pub mod scrubber;

use serde::{Deserialize, Serialize};

/// Content above the scrub ceiling (or streamed) was forwarded unscrubbed.
pub const OVERSIZE_NOT_SCRUBBED: &str = "oversize_not_scrubbed";
/// Text-typed content could not be decoded and was forwarded unscrubbed.
pub const UNDECODABLE_NOT_SCRUBBED: &str = "undecodable_not_scrubbed";
/// A CONNECT tunnel was relayed without content inspection.
pub const TUNNEL_NOT_INSPECTED: &str = "tunnel_not_inspected";

/// Rule names owned by the engine; rule files may not use them.
pub const RESERVED_RULE_NAMES: &[&str] = &[
    OVERSIZE_NOT_SCRUBBED,
    UNDECODABLE_NOT_SCRUBBED,
    TUNNEL_NOT_INSPECTED,
];

/// Severity level for a detection rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// What kind of sensitive data a rule detects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Secret,
    Pii,
}

/// Where in an exchange a finding was made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Location {
    RequestBody,
    ResponseBody,
    Header,
    Url,
}

/// One rule matching at one location, with the number of occurrences.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub rule_name: String,
    pub location: Location,
    pub occurrence_count: usize,
}

impl Finding {
    pub fn new(rule_name: impl Into<String>, location: Location, occurrence_count: usize) -> Self {
        Self {
            rule_name: rule_name.into(),
            location,
            occurrence_count,
        }
    }

    /// Marker for content that was too large to scrub.
    pub fn oversize(location: Location) -> Self {
        Self::new(OVERSIZE_NOT_SCRUBBED, location, 1)
    }

    /// Marker for text content that failed to decode.
    pub fn undecodable(location: Location) -> Self {
        Self::new(UNDECODABLE_NOT_SCRUBBED, location, 1)
    }

    /// True for the engine's "not scrubbed" markers.
    pub fn is_degraded(&self) -> bool {
        RESERVED_RULE_NAMES.contains(&self.rule_name.as_str())
    }
}

/// Fold `incoming` into `into`, summing counts for the same rule and location.
///
/// Order of first appearance is preserved.
pub fn merge_findings(into: &mut Vec<Finding>, incoming: impl IntoIterator<Item = Finding>) {
    for finding in incoming {
        match into
            .iter_mut()
            .find(|f| f.rule_name == finding.rule_name && f.location == finding.location)
        {
            Some(existing) => existing.occurrence_count += finding.occurrence_count,
            None => into.push(finding),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_sums_same_rule_and_location() {
        let mut findings = vec![Finding::new("email", Location::Header, 1)];
        merge_findings(
            &mut findings,
            vec![
                Finding::new("email", Location::Header, 2),
                Finding::new("email", Location::RequestBody, 1),
            ],
        );
        assert_eq!(findings.len(), 2);
        assert_eq!(findings[0].occurrence_count, 3);
        assert_eq!(findings[1].location, Location::RequestBody);
    }

    #[test]
    fn finding_serializes_without_matched_text() {
        let finding = Finding::new("stripe-key", Location::RequestBody, 1);
        let json = serde_json::to_string(&finding).unwrap();
        assert_eq!(
            json,
            r#"{"rule_name":"stripe-key","location":"REQUEST_BODY","occurrence_count":1}"#
        );
    }

    #[test]
    fn markers_are_degraded() {
        assert!(Finding::oversize(Location::ResponseBody).is_degraded());
        assert!(Finding::undecodable(Location::RequestBody).is_degraded());
        assert!(!Finding::new("email", Location::Url, 1).is_degraded());
    }
}
