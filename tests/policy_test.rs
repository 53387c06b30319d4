use std::path::PathBuf;

use vibedom_proxy::dlp::catalog::PatternCatalog;
use vibedom_proxy::dlp::{Category, Severity};
use vibedom_proxy::error::VibedomError;
use vibedom_proxy::policy::config::AppConfig;
use vibedom_proxy::policy::whitelist::Whitelist;

const FULL_TOML: &str = r#"
[proxy]
listen = "127.0.0.1:18080"
upstream_timeout_secs = 10
max_buffer_bytes = 1048576

[whitelist]
path = "/mnt/config/trusted_domains.txt"

[dlp]
patterns = "/mnt/config/gitleaks.toml"
max_scrub_bytes = 262144
sensitive_headers = ["Authorization", "X-Api-Key"]
builtin_pii = false

[audit]
path = "/mnt/session/network.jsonl"
"#;

const RULES: &str = r#"
title = "team rules"

[[rules]]
id = "internal-token"
description = "Internal service token"
regex = '''itk_[0-9a-f]{32}'''
keywords = ["itk_"]
severity = "critical"

[[rules]]
id = "customer-id"
regex = '''cust-\d{8}'''
category = "pii"
severity = "low"

[rules.allowlist]
paths = ['''test/''']
"#;

#[test]
fn parse_full_config() {
    let config = AppConfig::from_toml_str(FULL_TOML).unwrap();
    assert_eq!(config.proxy.listen, "127.0.0.1:18080");
    assert_eq!(config.proxy.upstream_timeout_secs, 10);
    assert_eq!(config.proxy.max_buffer_bytes, 1048576);
    assert_eq!(config.whitelist.path, PathBuf::from("/mnt/config/trusted_domains.txt"));
    assert_eq!(config.dlp.patterns, Some(PathBuf::from("/mnt/config/gitleaks.toml")));
    assert_eq!(config.dlp.max_scrub_bytes, 262144);
    assert!(!config.dlp.builtin_pii);
    assert_eq!(config.audit.path, PathBuf::from("/mnt/session/network.jsonl"));
}

#[test]
fn shipped_config_template_is_valid() {
    let config = AppConfig::from_toml_str(include_str!("../templates/vibedom.toml")).unwrap();
    assert_eq!(config.proxy.listen, "127.0.0.1:8080");
    assert_eq!(config.dlp.max_scrub_bytes, 512 * 1024);
    assert!(config.dlp.sensitive_headers.iter().any(|h| h == "cookie"));
}

#[test]
fn shipped_whitelist_template_allows_core_hosts() {
    let whitelist = Whitelist::parse(include_str!("../templates/trusted_domains.txt"));
    assert!(whitelist.is_allowed("api.anthropic.com"));
    assert!(whitelist.is_allowed("api.github.com"));
    assert!(whitelist.is_allowed("raw.githubusercontent.com"));
    assert!(whitelist.is_allowed("registry.npmjs.org"));
    assert!(!whitelist.is_allowed("pastebin.com"));
}

#[test]
fn whitelist_file_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("trusted_domains.txt");
    std::fs::write(
        &path,
        "# comment\n\nGitHub.com\n*.npmjs.org\nhttps://pypi.org/simple\n",
    )
    .unwrap();
    let whitelist = Whitelist::load(&path).unwrap();
    assert_eq!(whitelist.entries(), vec!["github.com", "npmjs.org", "pypi.org"]);
}

#[test]
fn custom_rule_file_loads_in_order_with_pii_appended() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("gitleaks.toml");
    std::fs::write(&path, RULES).unwrap();

    let catalog = PatternCatalog::load(Some(&path), true).unwrap();
    let names: Vec<&str> = catalog.rules().iter().map(|r| r.name()).collect();
    assert_eq!(
        names,
        vec![
            "internal-token",
            "customer-id",
            "email",
            "credit_card",
            "us_ssn",
            "phone_us",
            "ipv4_private",
        ]
    );

    let token = catalog.get("internal-token").unwrap();
    assert_eq!(token.severity(), Severity::Critical);
    assert_eq!(token.category(), Category::Secret);
    assert_eq!(token.placeholder(), "[REDACTED_INTERNAL_TOKEN]");
    assert_eq!(catalog.get("customer-id").unwrap().category(), Category::Pii);
}

#[test]
fn custom_rule_file_without_pii() {
    let catalog = PatternCatalog::from_toml_str(RULES, false).unwrap();
    assert_eq!(catalog.len(), 2);
}

#[test]
fn malformed_rule_fails_whole_catalog() {
    let source = format!("{}\n[[rules]]\nid = \"bad\"\nregex = '''[z-a]'''\n", RULES);
    let err = PatternCatalog::from_toml_str(&source, true).unwrap_err();
    assert!(matches!(err, VibedomError::InvalidRule { ref rule, .. } if rule == "bad"));
}

#[test]
fn reserved_rule_name_is_rejected() {
    let source = "[[rules]]\nid = \"oversize_not_scrubbed\"\nregex = '''x'''\n";
    assert!(matches!(
        PatternCatalog::from_toml_str(source, false),
        Err(VibedomError::ReservedRule(_))
    ));
}

#[test]
fn duplicate_rule_id_is_rejected() {
    let source = "[[rules]]\nid = \"dup\"\nregex = '''a'''\n\n[[rules]]\nid = \"dup\"\nregex = '''b'''\n";
    assert!(matches!(
        PatternCatalog::from_toml_str(source, false),
        Err(VibedomError::DuplicateRule(_))
    ));
}

#[test]
fn missing_rule_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let result = PatternCatalog::load(Some(&dir.path().join("nope.toml")), true);
    assert!(matches!(result, Err(VibedomError::Io(_))));
}

#[test]
fn invalid_toml_returns_error() {
    assert!(AppConfig::from_toml_str("this is not valid toml [[[").is_err());
}
