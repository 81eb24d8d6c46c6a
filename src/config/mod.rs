//! Configuration management.

mod file_config;

pub use file_config::{find_config_file, load_config, to_toml};

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::models::{DiscoveryConfiguration, PipelineConfiguration, SourceType};
use crate::utils::{Backoff, RetryConfig};

/// Application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Provider order and retry policy for agent calls
    #[serde(default)]
    pub providers: ProvidersConfig,

    /// Pipeline preset selection
    #[serde(default)]
    pub pipeline: PipelineSettings,

    /// Discovery preset selection and overrides
    #[serde(default)]
    pub discovery: DiscoverySettings,

    /// API keys and contact addresses for discovery sources
    #[serde(default)]
    pub api_keys: ApiKeys,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// API keys for external services
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiKeys {
    /// Semantic Scholar API key (optional, for higher rate limits)
    #[serde(default = "env_semantic_scholar")]
    pub semantic_scholar: Option<String>,

    /// Contact address for the OpenAlex polite pool
    #[serde(default = "env_openalex_email")]
    pub openalex_email: Option<String>,

    /// Contact address for the CrossRef polite pool
    #[serde(default = "env_crossref_mailto")]
    pub crossref_mailto: Option<String>,
}

impl Default for ApiKeys {
    fn default() -> Self {
        Self {
            semantic_scholar: env_semantic_scholar(),
            openalex_email: env_openalex_email(),
            crossref_mailto: env_crossref_mailto(),
        }
    }
}

fn env_semantic_scholar() -> Option<String> {
    std::env::var("SEMANTIC_SCHOLAR_API_KEY").ok()
}

fn env_openalex_email() -> Option<String> {
    std::env::var("OPENALEX_EMAIL").ok()
}

fn env_crossref_mailto() -> Option<String> {
    std::env::var("CROSSREF_MAILTO").ok()
}

/// Provider chain configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProvidersConfig {
    /// Cloud provider ids in the order they are tried; empty means registration order
    #[serde(default)]
    pub order: Vec<String>,

    /// Id of the local model used once every cloud provider is exhausted
    #[serde(default)]
    pub local_fallback: Option<String>,

    #[serde(default)]
    pub retry: RetrySettings,
}

/// Per-provider retry policy as written in the config file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_backoff")]
    pub backoff: Backoff,

    /// Limit for a single provider attempt
    #[serde(default = "default_attempt_timeout_secs")]
    pub attempt_timeout_secs: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff: default_backoff(),
            attempt_timeout_secs: default_attempt_timeout_secs(),
        }
    }
}

impl RetrySettings {
    /// Retry policy for [`FallbackChain::from_config`](crate::agents::FallbackChain::from_config)
    pub fn to_retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts.max(1),
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            backoff: self.backoff,
            attempt_timeout: Duration::from_secs(self.attempt_timeout_secs),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    250
}

fn default_max_delay_ms() -> u64 {
    5_000
}

fn default_backoff() -> Backoff {
    Backoff::Exponential { multiplier: 2.0 }
}

fn default_attempt_timeout_secs() -> u64 {
    120
}

/// Pipeline section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineSettings {
    /// One of `fast`, `quick`, `comprehensive`, `research-grade`
    #[serde(default = "default_pipeline_preset")]
    pub preset: String,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            preset: default_pipeline_preset(),
        }
    }
}

impl PipelineSettings {
    pub fn configuration(&self) -> Result<PipelineConfiguration, ConfigError> {
        PipelineConfiguration::preset(&self.preset)
            .ok_or_else(|| ConfigError::Invalid(format!("unknown pipeline preset '{}'", self.preset)))
    }
}

fn default_pipeline_preset() -> String {
    "comprehensive".to_string()
}

/// Discovery section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoverySettings {
    /// One of `default`, `fast`, `comprehensive`
    #[serde(default = "default_discovery_preset")]
    pub preset: String,

    /// Source ids replacing the preset's source set when non-empty
    #[serde(default)]
    pub sources: Vec<String>,

    #[serde(default)]
    pub deduplicate: bool,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            preset: default_discovery_preset(),
            sources: Vec::new(),
            deduplicate: false,
        }
    }
}

impl DiscoverySettings {
    /// Resolve the preset and apply the overrides from this section
    pub fn configuration(&self) -> Result<DiscoveryConfiguration, ConfigError> {
        let mut configuration = DiscoveryConfiguration::preset(&self.preset).ok_or_else(|| {
            ConfigError::Invalid(format!("unknown discovery preset '{}'", self.preset))
        })?;

        if !self.sources.is_empty() {
            configuration.enabled_sources =
                self.sources.iter().map(|id| SourceType::from_id(id)).collect();
        }
        configuration.deduplicate |= self.deduplicate;

        Ok(configuration)
    }
}

fn default_discovery_preset() -> String {
    "default".to_string()
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// `json` for JSON lines, anything else for human-readable output
    #[serde(default)]
    pub format: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: None,
        }
    }
}

impl LoggingConfig {
    pub fn is_json(&self) -> bool {
        self.format
            .as_deref()
            .is_some_and(|f| f.eq_ignore_ascii_case("json"))
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Serialize error: {0}")]
    Serialize(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.pipeline.preset, "comprehensive");
        assert_eq!(config.discovery.preset, "default");
        assert!(!config.discovery.deduplicate);
        assert!(config.providers.order.is_empty());
        assert_eq!(config.logging.level, "info");
        assert!(!config.logging.is_json());
    }

    #[test]
    fn test_retry_settings_conversion() {
        let retry = RetrySettings::default().to_retry_config();
        assert_eq!(retry.max_attempts, 3);
        assert_eq!(retry.initial_delay, Duration::from_millis(250));
        assert_eq!(retry.max_delay, Duration::from_secs(5));
        assert_eq!(retry, RetryConfig::default());

        let zero = RetrySettings {
            max_attempts: 0,
            ..RetrySettings::default()
        };
        assert_eq!(zero.to_retry_config().max_attempts, 1);
    }

    #[test]
    fn test_pipeline_settings() {
        let settings = PipelineSettings {
            preset: "quick".to_string(),
        };
        assert_eq!(settings.configuration().unwrap().required_stages.len(), 3);

        let unknown = PipelineSettings {
            preset: "turbo".to_string(),
        };
        assert!(matches!(unknown.configuration(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_discovery_settings_overrides() {
        let settings = DiscoverySettings {
            preset: "fast".to_string(),
            sources: vec!["openalex".to_string(), "semantic".to_string()],
            deduplicate: true,
        };
        let configuration = settings.configuration().unwrap();
        assert!(configuration.deduplicate);
        assert_eq!(configuration.enabled_sources.len(), 2);
        assert!(configuration.enabled_sources.contains(&SourceType::OpenAlex));
        assert!(configuration.enabled_sources.contains(&SourceType::SemanticScholar));
        assert_eq!(configuration.max_total_papers, 25);
    }
}
