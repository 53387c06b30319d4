use thiserror::Error;

/// Unified error type for the vibedom proxy library.
#[derive(Debug, Error)]
pub enum VibedomError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Environment variable not set: {0}")]
    ConfigEnvVar(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Regex error: {0}")]
    Regex(#[from] regex::Error),

    #[error("Invalid detection rule '{rule}': {message}")]
    InvalidRule { rule: String, message: String },

    #[error("Duplicate detection rule: {0}")]
    DuplicateRule(String),

    #[error("Rule name '{0}' is reserved for engine markers")]
    ReservedRule(String),

    #[error("Proxy error: {0}")]
    Proxy(String),
}

pub type Result<T> = std::result::Result<T, VibedomError>;
