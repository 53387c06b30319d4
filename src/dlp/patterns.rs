//! Built-in detection rules.
//!
//! | Source | Rules |
//! |--------|-------|
//! | `templates/gitleaks.toml` | private keys, cloud/provider keys, Stripe, Slack, JWT, bearer tokens, DB connection strings, generic secrets |
//! | [`builtin_pii`] | email, credit card, US SSN, US phone, private IPv4 |
//!
//! The secret rules live in a rule file because the pre-flight scanner reads
//! the same file; the PII rules are always compiled in.

use super::catalog::DetectionRule;
use super::{Category, Severity};
use crate::error::Result;

/// Default gitleaks-style rule file, used when no pattern path is configured.
pub const DEFAULT_RULES: &str = include_str!("../../templates/gitleaks.toml");

/// The built-in PII rules, in evaluation order.
pub fn builtin_pii() -> Result<Vec<DetectionRule>> {
    Ok(vec![
        DetectionRule::new(
            "email",
            r"\b[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}\b",
            Category::Pii,
            Severity::Medium,
        )?
        .with_description("Email Address"),
        DetectionRule::new(
            "credit_card",
            r"\b(?:4[0-9]{12}(?:[0-9]{3})?|5[1-5][0-9]{14}|3[47][0-9]{13}|6(?:011|5[0-9]{2})[0-9]{12})\b",
            Category::Pii,
            Severity::Critical,
        )?
        .with_description("Credit Card Number"),
        DetectionRule::new(
            "us_ssn",
            r"\b\d{3}-\d{2}-\d{4}\b",
            Category::Pii,
            Severity::Critical,
        )?
        .with_description("US Social Security Number")
        .with_validator(is_plausible_ssn),
        DetectionRule::new(
            "phone_us",
            r"\b(?:\+?1[-.\s]?)?(?:\(?[2-9]\d{2}\)?[-.\s]?)[2-9]\d{2}[-.\s]?\d{4}\b",
            Category::Pii,
            Severity::Medium,
        )?
        .with_description("US Phone Number"),
        DetectionRule::new(
            "ipv4_private",
            r"\b(?:10\.\d{1,3}\.\d{1,3}\.\d{1,3}|172\.(?:1[6-9]|2\d|3[01])\.\d{1,3}\.\d{1,3}|192\.168\.\d{1,3}\.\d{1,3})\b",
            Category::Pii,
            Severity::Low,
        )?
        .with_description("Private IPv4 Address"),
    ])
}

/// Area 000, 666 and 9xx, group 00 and serial 0000 are never issued.
fn is_plausible_ssn(candidate: &str) -> bool {
    let mut parts = candidate.split('-');
    let (Some(area), Some(group), Some(serial)) = (parts.next(), parts.next(), parts.next()) else {
        return false;
    };
    area != "000" && area != "666" && !area.starts_with('9') && group != "00" && serial != "0000"
}
