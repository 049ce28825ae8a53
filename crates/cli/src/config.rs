//! TOML settings file for the `stepflow` binary.
//!
//! ```toml
//! [server]
//! bind = "0.0.0.0:8080"
//!
//! [database]
//! url = "postgres://localhost/stepflow"
//! max_connections = 10
//!
//! [engine]
//! max_concurrent_steps = 8
//! execution_timeout_ms = 600000
//! ```
//!
//! Every table and key is optional. Command-line flags and their
//! environment variables win over the file.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use engine::EngineConfig;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub database: DatabaseSettings,
    pub engine: EngineConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub bind: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    /// No URL means executions are kept in memory.
    pub url: Option<String>,
    pub max_connections: u32,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 10,
        }
    }
}

impl Settings {
    /// Read settings from `path`, or use the defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read config file {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("invalid config file {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let settings: Settings = toml::from_str("").unwrap();
        assert_eq!(settings.server.bind, "0.0.0.0:8080");
        assert_eq!(settings.database.url, None);
        assert_eq!(settings.database.max_connections, 10);
        assert_eq!(settings.engine, EngineConfig::default());
    }

    #[test]
    fn engine_table_overrides_only_named_keys() {
        let settings: Settings = toml::from_str(
            r#"
            [database]
            url = "postgres://localhost/stepflow"

            [engine]
            max_concurrent_steps = 8
            execution_timeout_ms = 600000
            "#,
        )
        .unwrap();

        assert_eq!(
            settings.database.url.as_deref(),
            Some("postgres://localhost/stepflow")
        );
        assert_eq!(settings.engine.max_concurrent_steps, 8);
        assert_eq!(settings.engine.execution_timeout_ms, Some(600_000));
        assert_eq!(settings.engine.max_attempts, 3);
    }

    #[test]
    fn missing_file_is_an_error() {
        let err = Settings::load(Some(Path::new("/nonexistent/stepflow.toml"))).unwrap_err();
        assert!(err.to_string().contains("cannot read config file"));
    }

    #[test]
    fn no_path_means_defaults() {
        let settings = Settings::load(None).unwrap();
        assert_eq!(settings.engine, EngineConfig::default());
    }
}
