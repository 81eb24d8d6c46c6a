//! Configuration file support for paperflow.
//!
//! Settings come from a TOML file layered under environment overrides.
//! Environment variables use the `PAPERFLOW_` prefix and `__` between
//! nested keys, e.g. `PAPERFLOW_PROVIDERS__RETRY__MAX_ATTEMPTS=5`.
//!
//! # Configuration File Format
//!
//! ```toml
//! [providers]
//! order = ["primary", "secondary"]
//! local_fallback = "local"
//!
//! [providers.retry]
//! max_attempts = 3
//! initial_delay_ms = 250
//! max_delay_ms = 5000
//! backoff = { kind = "exponential", multiplier = 2.0 }
//!
//! [pipeline]
//! preset = "comprehensive"
//!
//! [discovery]
//! preset = "default"
//! sources = ["crossref", "openalex"]
//! deduplicate = true
//!
//! [api_keys]
//! semantic_scholar = "your-api-key"
//! openalex_email = "you@example.org"
//!
//! [logging]
//! level = "debug"
//! format = "json"
//! ```

use std::path::{Path, PathBuf};

use super::{AppConfig, ConfigError};

const ENV_PREFIX: &str = "PAPERFLOW";

/// Locate the configuration file: `./paperflow.toml`, then the user config directory
pub fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("paperflow.toml");
    if local.is_file() {
        return Some(local);
    }

    dirs::config_dir()
        .map(|dir| dir.join("paperflow").join("config.toml"))
        .filter(|path| path.is_file())
}

/// Load configuration from `path` (or the discovered file) plus environment overrides.
///
/// A missing file is not an error; defaults apply.
pub fn load_config(path: Option<&Path>) -> Result<AppConfig, ConfigError> {
    let mut builder = config::Config::builder();

    match path {
        Some(path) => {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        None => {
            if let Some(found) = find_config_file() {
                tracing::debug!(path = %found.display(), "using configuration file");
                builder = builder.add_source(config::File::from(found).required(false));
            }
        }
    }

    let settings = builder
        .add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    Ok(settings.try_deserialize()?)
}

/// Render the effective configuration as TOML
pub fn to_toml(config: &AppConfig) -> Result<String, ConfigError> {
    toml::to_string_pretty(config).map_err(|e| ConfigError::Serialize(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::Backoff;
    use tempfile::tempdir;

    #[test]
    fn test_config_file_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let toml_content = r#"
[providers]
order = ["primary", "secondary"]
local_fallback = "local"

[providers.retry]
initial_delay_ms = 100
backoff = { kind = "fixed" }

[pipeline]
preset = "research-grade"

[discovery]
preset = "comprehensive"
deduplicate = true

[api_keys]
semantic_scholar = "test-key"

[logging]
level = "debug"
format = "json"
"#;
        std::fs::write(&path, toml_content).unwrap();

        let config = load_config(Some(&path)).unwrap();

        assert_eq!(config.providers.order, vec!["primary", "secondary"]);
        assert_eq!(config.providers.local_fallback.as_deref(), Some("local"));
        assert_eq!(config.providers.retry.initial_delay_ms, 100);
        assert_eq!(config.providers.retry.backoff, Backoff::Fixed);
        assert_eq!(config.pipeline.preset, "research-grade");
        assert!(config.discovery.deduplicate);
        assert_eq!(config.api_keys.semantic_scholar.as_deref(), Some("test-key"));
        assert_eq!(config.logging.level, "debug");
        assert!(config.logging.is_json());
    }

    #[test]
    fn test_config_round_trips_through_toml() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = AppConfig::default();
        config.providers.order = vec!["primary".to_string()];
        config.discovery.sources = vec!["openalex".to_string()];
        config.api_keys.semantic_scholar = Some("saved-key".to_string());

        std::fs::write(&path, to_toml(&config).unwrap()).unwrap();

        let loaded = load_config(Some(&path)).unwrap();
        assert_eq!(loaded.providers.order, config.providers.order);
        assert_eq!(loaded.discovery.sources, config.discovery.sources);
        assert_eq!(loaded.api_keys.semantic_scholar.as_deref(), Some("saved-key"));
    }

    #[test]
    fn test_env_override() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[providers.retry]\nmax_attempts = 2\n").unwrap();

        std::env::set_var("PAPERFLOW_PROVIDERS__RETRY__MAX_ATTEMPTS", "7");
        let config = load_config(Some(&path));
        std::env::remove_var("PAPERFLOW_PROVIDERS__RETRY__MAX_ATTEMPTS");

        assert_eq!(config.unwrap().providers.retry.max_attempts, 7);
    }

    #[test]
    fn test_config_file_nonexistent() {
        let path = PathBuf::from("/nonexistent/config.toml");
        assert!(load_config(Some(&path)).is_err());
    }

    #[test]
    fn test_config_file_invalid_toml() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("invalid.toml");

        std::fs::write(&path, "invalid = toml = content").unwrap();

        assert!(load_config(Some(&path)).is_err());
    }
}
