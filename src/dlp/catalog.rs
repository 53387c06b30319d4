//! The ordered set of detection rules shared with the pre-flight scanner.
//!
//! Rules come from a gitleaks-compatible TOML file:
//!
//! ```toml
//! [[rules]]
//! id = "stripe-key"
//! description = "Stripe secret key"
//! regex = '''\b((?:sk|rk)_(?:live|test)_[0-9a-zA-Z]{16,})\b'''
//! secretGroup = 1
//! severity = "critical"
//! ```
//!
//! Declaration order is evaluation order. Loading is all-or-nothing: one bad
//! rule fails the whole catalog.

use std::collections::HashSet;
use std::path::Path;

use regex::Regex;
use serde::Deserialize;
use tracing::{info, warn};

use super::patterns;
use super::{Category, RESERVED_RULE_NAMES, Severity};
use crate::error::{Result, VibedomError};

/// Placeholder text substituted for matches of the rule `name`.
///
/// `stripe-key` becomes `[REDACTED_STRIPE_KEY]`.
pub fn placeholder_for(name: &str) -> String {
    format!("[REDACTED_{}]", name.to_uppercase().replace(['-', ' ', '.'], "_"))
}

/// Shannon entropy in bits per character.
pub fn shannon_entropy(text: &str) -> f64 {
    let mut counts = std::collections::HashMap::new();
    let mut total = 0usize;
    for c in text.chars() {
        *counts.entry(c).or_insert(0usize) += 1;
        total += 1;
    }
    if total == 0 {
        return 0.0;
    }
    counts
        .values()
        .map(|&n| {
            let p = n as f64 / total as f64;
            -p * p.log2()
        })
        .sum()
}

/// A single compiled detection rule.
#[derive(Debug, Clone)]
pub struct DetectionRule {
    name: String,
    description: String,
    matcher: Regex,
    category: Category,
    severity: Severity,
    placeholder: String,
    secret_group: Option<usize>,
    min_entropy: Option<f64>,
    validator: Option<fn(&str) -> bool>,
}

impl DetectionRule {
    /// Compile a rule. The regex error is reported against the rule name.
    pub fn new(name: &str, pattern: &str, category: Category, severity: Severity) -> Result<Self> {
        let matcher = Regex::new(pattern).map_err(|e| VibedomError::InvalidRule {
            rule: name.to_string(),
            message: e.to_string(),
        })?;
        Ok(Self {
            name: name.to_string(),
            description: String::new(),
            matcher,
            category,
            severity,
            placeholder: placeholder_for(name),
            secret_group: None,
            min_entropy: None,
            validator: None,
        })
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Redact only this capture group instead of the whole match.
    pub fn with_secret_group(mut self, group: usize) -> Result<Self> {
        if group >= self.matcher.captures_len() {
            return Err(VibedomError::InvalidRule {
                rule: self.name.clone(),
                message: format!(
                    "secretGroup {} but the regex has {} group(s)",
                    group,
                    self.matcher.captures_len() - 1
                ),
            });
        }
        self.secret_group = Some(group);
        Ok(self)
    }

    /// Skip matches whose redacted span falls below this entropy.
    pub fn with_min_entropy(mut self, bits: f64) -> Self {
        self.min_entropy = Some(bits);
        self
    }

    /// Extra check applied to each candidate span (e.g. SSN range rules).
    pub fn with_validator(mut self, validator: fn(&str) -> bool) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn category(&self) -> Category {
        self.category
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }

    pub fn placeholder(&self) -> &str {
        &self.placeholder
    }

    /// Byte spans to redact in `text`, left to right and non-overlapping.
    ///
    /// With no explicit secret group, a regex that has capture groups redacts
    /// group 1 so that labels such as `api_key=` survive.
    pub fn find_spans<'a>(&'a self, text: &'a str) -> impl Iterator<Item = (usize, usize)> + 'a {
        let group = self
            .secret_group
            .unwrap_or(if self.matcher.captures_len() > 1 { 1 } else { 0 });
        self.matcher.captures_iter(text).filter_map(move |caps| {
            let m = caps.get(group).or_else(|| caps.get(0))?;
            if m.start() == m.end() {
                return None;
            }
            let span = m.as_str();
            if let Some(min) = self.min_entropy {
                if shannon_entropy(span) < min {
                    return None;
                }
            }
            if let Some(validate) = self.validator {
                if !validate(span) {
                    return None;
                }
            }
            Some((m.start(), m.end()))
        })
    }

    /// True if any span of this rule matches `text`.
    pub fn is_match(&self, text: &str) -> bool {
        self.find_spans(text).next().is_some()
    }
}

#[derive(Debug, Deserialize)]
struct RuleFile {
    #[serde(default)]
    rules: Vec<RawRule>,
}

#[derive(Debug, Deserialize)]
struct RawRule {
    id: Option<String>,
    #[serde(default)]
    description: Option<String>,
    regex: Option<String>,
    #[serde(default, rename = "secretGroup")]
    secret_group: Option<usize>,
    #[serde(default)]
    entropy: Option<f64>,
    #[serde(default)]
    category: Option<Category>,
    #[serde(default)]
    severity: Option<Severity>,
}

impl RawRule {
    fn compile(self, index: usize) -> Result<DetectionRule> {
        let name = match self.id {
            Some(id) if !id.trim().is_empty() => id.trim().to_string(),
            _ => {
                return Err(VibedomError::InvalidRule {
                    rule: format!("#{}", index + 1),
                    message: "missing 'id'".to_string(),
                });
            }
        };
        let pattern = self.regex.ok_or_else(|| VibedomError::InvalidRule {
            rule: name.clone(),
            message: "missing 'regex'".to_string(),
        })?;

        let mut rule = DetectionRule::new(
            &name,
            &pattern,
            self.category.unwrap_or(Category::Secret),
            self.severity.unwrap_or(Severity::High),
        )?
        .with_description(self.description.unwrap_or_default());
        if let Some(group) = self.secret_group {
            rule = rule.with_secret_group(group)?;
        }
        if let Some(bits) = self.entropy {
            rule = rule.with_min_entropy(bits);
        }
        Ok(rule)
    }
}

/// Immutable, ordered collection of [`DetectionRule`]s.
#[derive(Debug, Clone)]
pub struct PatternCatalog {
    rules: Vec<DetectionRule>,
}

impl PatternCatalog {
    /// Build a catalog, rejecting duplicate and reserved rule names.
    ///
    /// Two names that map to the same placeholder count as duplicates.
    pub fn from_rules(rules: Vec<DetectionRule>) -> Result<Self> {
        let mut seen = HashSet::new();
        for rule in &rules {
            if RESERVED_RULE_NAMES.contains(&rule.name.as_str()) {
                return Err(VibedomError::ReservedRule(rule.name.clone()));
            }
            if !seen.insert(rule.placeholder.clone()) {
                return Err(VibedomError::DuplicateRule(rule.name.clone()));
            }
        }
        Ok(Self { rules })
    }

    /// Parse a gitleaks-style rule file, optionally followed by the built-in PII rules.
    pub fn from_toml_str(source: &str, include_pii: bool) -> Result<Self> {
        let file: RuleFile = toml::from_str(source)?;
        if file.rules.is_empty() {
            warn!("Pattern source defines no rules; only built-in PII rules apply");
        }
        let mut rules = file
            .rules
            .into_iter()
            .enumerate()
            .map(|(i, raw)| raw.compile(i))
            .collect::<Result<Vec<_>>>()?;
        if include_pii {
            rules.extend(patterns::builtin_pii()?);
        }
        Self::from_rules(rules)
    }

    /// Load from a rule file, or from the bundled default rules when `path` is `None`.
    pub fn load(path: Option<&Path>, include_pii: bool) -> Result<Self> {
        let catalog = match path {
            Some(path) => {
                let source = std::fs::read_to_string(path)?;
                Self::from_toml_str(&source, include_pii)?
            }
            None => Self::from_toml_str(patterns::DEFAULT_RULES, include_pii)?,
        };
        info!(
            "Pattern catalog loaded from {} ({} rules)",
            path.map(|p| p.display().to_string())
                .unwrap_or_else(|| "built-in defaults".to_string()),
            catalog.len()
        );
        Ok(catalog)
    }

    /// Rules in evaluation order.
    pub fn rules(&self) -> &[DetectionRule] {
        &self.rules
    }

    pub fn get(&self, name: &str) -> Option<&DetectionRule> {
        self.rules.iter().find(|r| r.name == name)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
