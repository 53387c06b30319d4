//! TOML configuration types for the vibedom proxy.
//!
//! The top-level [`AppConfig`] is deserialized from `vibedom.toml`. Every
//! section has defaults, so an empty file is a valid configuration.
//!
//! # Example `vibedom.toml`
//!
//! ```toml
//! [proxy]
//! listen = "127.0.0.1:8080"
//!
//! [whitelist]
//! path = "/mnt/config/trusted_domains.txt"
//!
//! [dlp]
//! patterns = "/mnt/config/gitleaks.toml"
//! max_scrub_bytes = 524288
//!
//! [audit]
//! path = "/mnt/session/network.jsonl"
//! ```
//!
//! Relative paths are resolved against the directory holding the config file.

use std::path::{Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::dlp::scrubber::{DEFAULT_MAX_SCRUB_BYTES, DEFAULT_SENSITIVE_HEADERS, ScrubConfig};
use crate::error::{Result, VibedomError};

/// Overrides the whitelist path.
pub const ENV_WHITELIST_PATH: &str = "VIBEDOM_WHITELIST_PATH";
/// Overrides the pattern file path.
pub const ENV_GITLEAKS_CONFIG: &str = "VIBEDOM_GITLEAKS_CONFIG";
/// Overrides the audit log path.
pub const ENV_NETWORK_LOG_PATH: &str = "VIBEDOM_NETWORK_LOG_PATH";

fn default_listen() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_upstream_timeout_secs() -> u64 {
    30
}

fn default_max_buffer_bytes() -> usize {
    16 * 1024 * 1024
}

fn default_whitelist_path() -> PathBuf {
    PathBuf::from("trusted_domains.txt")
}

fn default_max_scrub_bytes() -> usize {
    DEFAULT_MAX_SCRUB_BYTES
}

fn default_sensitive_headers() -> Vec<String> {
    DEFAULT_SENSITIVE_HEADERS.iter().map(|h| h.to_string()).collect()
}

fn default_true() -> bool {
    true
}

fn default_audit_path() -> PathBuf {
    PathBuf::from("network.jsonl")
}

/// Proxy server configuration (`[proxy]` section).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProxyConfig {
    /// Address to listen on (e.g., `"127.0.0.1:8080"`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Timeout for connecting to and reading from upstream servers.
    #[serde(default = "default_upstream_timeout_secs")]
    pub upstream_timeout_secs: u64,
    /// Bodies declared larger than this are streamed instead of buffered.
    #[serde(default = "default_max_buffer_bytes")]
    pub max_buffer_bytes: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            upstream_timeout_secs: default_upstream_timeout_secs(),
            max_buffer_bytes: default_max_buffer_bytes(),
        }
    }
}

/// Destination whitelist (`[whitelist]` section).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WhitelistConfig {
    /// Line-oriented domain list; `#` comments and blank lines are ignored.
    #[serde(default = "default_whitelist_path")]
    pub path: PathBuf,
}

impl Default for WhitelistConfig {
    fn default() -> Self {
        Self {
            path: default_whitelist_path(),
        }
    }
}

/// Data Loss Prevention configuration (`[dlp]` section).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DlpConfig {
    /// Gitleaks-style rule file. If `None`, the bundled rules are used.
    #[serde(default)]
    pub patterns: Option<PathBuf>,
    /// Content above this size is forwarded unscrubbed and flagged.
    #[serde(default = "default_max_scrub_bytes")]
    pub max_scrub_bytes: usize,
    /// Header names whose values are scanned and replaced whole.
    #[serde(default = "default_sensitive_headers")]
    pub sensitive_headers: Vec<String>,
    /// Append the built-in PII rules after the file's rules.
    #[serde(default = "default_true")]
    pub builtin_pii: bool,
}

impl Default for DlpConfig {
    fn default() -> Self {
        Self {
            patterns: None,
            max_scrub_bytes: default_max_scrub_bytes(),
            sensitive_headers: default_sensitive_headers(),
            builtin_pii: true,
        }
    }
}

impl From<&DlpConfig> for ScrubConfig {
    fn from(dlp: &DlpConfig) -> Self {
        ScrubConfig {
            max_scrub_bytes: dlp.max_scrub_bytes,
            sensitive_headers: dlp.sensitive_headers.clone(),
        }
    }
}

/// Audit output (`[audit]` section).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuditConfig {
    /// JSONL file that receives one record per exchange.
    #[serde(default = "default_audit_path")]
    pub path: PathBuf,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            path: default_audit_path(),
        }
    }
}

/// Top-level application configuration deserialized from `vibedom.toml`.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub whitelist: WhitelistConfig,
    #[serde(default)]
    pub dlp: DlpConfig,
    #[serde(default)]
    pub audit: AuditConfig,
}

impl AppConfig {
    /// Load and parse the configuration from a TOML file at the given path.
    ///
    /// `${VAR}` and `$VAR` placeholders are substituted from the environment
    /// first; an unset variable is an error. Relative paths are then resolved
    /// against the file's directory and the `VIBEDOM_*` overrides applied.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config = Self::from_toml_str(&content)?;
        if let Some(base) = path.parent() {
            config.resolve_relative_to(base);
        }
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse TOML text after environment substitution.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let content = substitute_env_vars(content)?;
        Ok(toml::from_str(&content)?)
    }

    /// Apply `VIBEDOM_WHITELIST_PATH`, `VIBEDOM_GITLEAKS_CONFIG` and
    /// `VIBEDOM_NETWORK_LOG_PATH` when set.
    pub fn apply_env_overrides(&mut self) {
        if let Some(path) = env_path(ENV_WHITELIST_PATH) {
            self.whitelist.path = path;
        }
        if let Some(path) = env_path(ENV_GITLEAKS_CONFIG) {
            self.dlp.patterns = Some(path);
        }
        if let Some(path) = env_path(ENV_NETWORK_LOG_PATH) {
            self.audit.path = path;
        }
    }

    fn resolve_relative_to(&mut self, base: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() && !base.as_os_str().is_empty() {
                *p = base.join(&*p);
            }
        };
        resolve(&mut self.whitelist.path);
        resolve(&mut self.audit.path);
        if let Some(p) = self.dlp.patterns.as_mut() {
            resolve(p);
        }
    }
}

fn env_path(name: &str) -> Option<PathBuf> {
    std::env::var_os(name)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

/// Replace `${VAR_NAME}` and `$VAR_NAME` placeholders with environment variable values.
///
/// The bare form only matches upper-case names to avoid false positives.
fn substitute_env_vars(input: &str) -> Result<String> {
    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Z_][A-Z0-9_]*)")?;

    let mut result = String::with_capacity(input.len());
    let mut last = 0;
    for cap in re.captures_iter(input) {
        let (Some(whole), Some(name)) = (cap.get(0), cap.get(1).or_else(|| cap.get(2))) else {
            continue;
        };
        let value = std::env::var(name.as_str())
            .map_err(|_| VibedomError::ConfigEnvVar(name.as_str().to_string()))?;
        result.push_str(&input[last..whole.start()]);
        result.push_str(&value);
        last = whole.end();
    }
    result.push_str(&input[last..]);
    Ok(result)
}
