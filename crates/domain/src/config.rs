//! TOML-backed configuration tree with serde defaults and a validation
//! pass that reports issues instead of aborting.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub translation: TranslationConfig,
    #[serde(default)]
    pub quota: QuotaConfig,
    /// One entry per retrieval backend (scripture, tradition-text,
    /// encyclopedia, commentary).
    #[serde(default)]
    pub search: Vec<SearchBackendConfig>,
}

impl Config {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| Error::Config(e.to_string()))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Provider
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "d_provider_id")]
    pub id: String,
    #[serde(default = "d_provider_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub default_model: Option<String>,
    #[serde(default = "d_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "d_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            id: d_provider_id(),
            base_url: d_provider_base_url(),
            auth: AuthConfig::default(),
            default_model: None,
            max_tokens: d_max_tokens(),
            timeout_secs: d_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AuthConfig {
    /// Env var containing the key.
    #[serde(default)]
    pub env: Option<String>,
    /// Direct key (config-only setups; prefer env).
    #[serde(default)]
    pub key: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Translation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslationConfig {
    /// Model used for citation translation. `None` = provider default.
    #[serde(default)]
    pub model: Option<String>,
    /// Upper bound on in-flight requests in the batched path.
    #[serde(default = "d_max_parallel")]
    pub max_parallel: usize,
}

impl Default for TranslationConfig {
    fn default() -> Self {
        Self {
            model: None,
            max_parallel: d_max_parallel(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Quota
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Per-turn tool-call ceilings. Configurable per deployment; the
/// defaults (10 total, 3 consecutive) are the tested baseline.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct QuotaConfig {
    /// Hard ceiling on tool dispatches in one turn.
    #[serde(default = "d_max_total_calls")]
    pub max_total_calls: u32,
    /// Max times the same tool may be requested consecutively.
    #[serde(default = "d_max_consecutive")]
    pub max_consecutive: u32,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            max_total_calls: d_max_total_calls(),
            max_consecutive: d_max_consecutive(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Search backends
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchBackendConfig {
    /// Tool name exposed to the model (e.g. "search_quran").
    pub name: String,
    /// Human-readable corpus description handed to the model.
    #[serde(default)]
    pub description: String,
    pub base_url: String,
    #[serde(default)]
    pub auth: AuthConfig,
    /// Primary language of the corpus text.
    #[serde(default = "d_corpus_language")]
    pub corpus_language: String,
    #[serde(default = "d_search_timeout_secs")]
    pub timeout_secs: u64,
}

// ── serde default helpers ───────────────────────────────────────────

fn d_provider_id() -> String {
    "anthropic".into()
}
fn d_provider_base_url() -> String {
    "https://api.anthropic.com".into()
}
fn d_max_tokens() -> u32 {
    4096
}
fn d_timeout_secs() -> u64 {
    120
}
fn d_max_parallel() -> usize {
    8
}
fn d_max_total_calls() -> u32 {
    10
}
fn d_max_consecutive() -> u32 {
    3
}
fn d_corpus_language() -> String {
    "ar".into()
}
fn d_search_timeout_secs() -> u64 {
    20
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Config validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Severity level for a configuration issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Error,
    Warning,
}

/// A single configuration validation issue.
#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}

impl Config {
    /// Validate the configuration and return a list of issues.
    /// Empty vec = everything looks good.
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();

        if self.provider.base_url.is_empty() {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: "provider.base_url".into(),
                message: "base_url must not be empty".into(),
            });
        }

        if self.quota.max_total_calls == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: "quota.max_total_calls".into(),
                message: "ceiling must be greater than 0".into(),
            });
        }
        if self.quota.max_consecutive == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: "quota.max_consecutive".into(),
                message: "ceiling must be greater than 0".into(),
            });
        }

        if self.search.is_empty() {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                field: "search".into(),
                message: "no search backends configured".into(),
            });
        }

        for (i, backend) in self.search.iter().enumerate() {
            if backend.name.is_empty() {
                issues.push(ConfigIssue {
                    severity: ConfigSeverity::Error,
                    field: format!("search[{i}].name"),
                    message: "tool name must not be empty".into(),
                });
            }
            if backend.base_url.is_empty() {
                issues.push(ConfigIssue {
                    severity: ConfigSeverity::Error,
                    field: format!("search[{i}].base_url"),
                    message: "base_url must not be empty".into(),
                });
            }
        }

        issues
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_tested_baseline() {
        let config = Config::default();
        assert_eq!(config.quota.max_total_calls, 10);
        assert_eq!(config.quota.max_consecutive, 3);
        assert_eq!(config.provider.max_tokens, 4096);
        assert!(config.search.is_empty());
    }

    #[test]
    fn parses_minimal_toml() {
        let toml_src = r#"
            [provider]
            default_model = "claude-sonnet-4-20250514"

            [provider.auth]
            env = "ANTHROPIC_API_KEY"

            [[search]]
            name = "search_quran"
            description = "Keyword and semantic search over the Quran"
            base_url = "https://search.example.com/quran"

            [[search]]
            name = "search_hadith"
            base_url = "https://search.example.com/hadith"
            corpus_language = "ar"
        "#;
        let config = Config::from_toml_str(toml_src).unwrap();
        assert_eq!(config.search.len(), 2);
        assert_eq!(config.search[0].name, "search_quran");
        assert_eq!(config.search[1].corpus_language, "ar");
        assert_eq!(
            config.provider.auth.env.as_deref(),
            Some("ANTHROPIC_API_KEY")
        );
        // Untouched sections keep their defaults.
        assert_eq!(config.quota.max_total_calls, 10);
    }

    #[test]
    fn quota_overrides_apply() {
        let config = Config::from_toml_str("[quota]\nmax_total_calls = 5\n").unwrap();
        assert_eq!(config.quota.max_total_calls, 5);
        assert_eq!(config.quota.max_consecutive, 3);
    }

    #[test]
    fn validate_flags_zero_ceilings() {
        let mut config = Config::default();
        config.quota.max_total_calls = 0;
        let issues = config.validate();
        assert!(issues
            .iter()
            .any(|i| i.field == "quota.max_total_calls"
                && i.severity == ConfigSeverity::Error));
    }

    #[test]
    fn validate_warns_on_no_backends() {
        let issues = Config::default().validate();
        assert!(issues
            .iter()
            .any(|i| i.field == "search" && i.severity == ConfigSeverity::Warning));
    }

    #[test]
    fn validate_flags_empty_backend_fields() {
        let mut config = Config::default();
        config.search.push(SearchBackendConfig {
            name: String::new(),
            description: String::new(),
            base_url: String::new(),
            auth: AuthConfig::default(),
            corpus_language: "ar".into(),
            timeout_secs: 20,
        });
        let issues = config.validate();
        assert!(issues.iter().any(|i| i.field == "search[0].name"));
        assert!(issues.iter().any(|i| i.field == "search[0].base_url"));
    }

    #[test]
    fn bad_toml_is_a_config_error() {
        let err = Config::from_toml_str("provider = 3").unwrap_err();
        assert!(matches!(err, crate::error::Error::Config(_)));
    }
}
