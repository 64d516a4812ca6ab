use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    #[serde(default)]
    pub state: StateConfig,
    pub sync: SyncConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StateConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

fn default_db_path() -> String {
    "hydra-sync.db".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    /// Remote ingestion endpoint for session batches.
    pub endpoint: String,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_interval_secs() -> u64 {
    300
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl AppConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&content)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_fills_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [sync]
            endpoint = "https://labs.example.com/api/sync"
            "#,
        )
        .unwrap();

        assert_eq!(config.state.db_path, "hydra-sync.db");
        assert_eq!(config.sync.interval_secs, 300);
        assert_eq!(config.sync.request_timeout_secs, 30);
    }

    #[test]
    fn missing_endpoint_is_rejected() {
        assert!(toml::from_str::<AppConfig>("[sync]\n").is_err());
        assert!(toml::from_str::<AppConfig>("").is_err());
    }
}
