use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Deserialize, Clone, Serialize)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: Option<u32>,
    pub min_connections: Option<u32>,
    pub acquire_timeout_seconds: Option<u64>,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: Option<String>,
    pub file: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://kirppu.db".to_string(),
            max_connections: Some(10),
            min_connections: Some(1),
            acquire_timeout_seconds: Some(30),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: Some("full".to_string()),
            file: None,
        }
    }
}

impl AppConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config_str = std::fs::read_to_string(path).map_err(|e| {
            crate::error::MarketError::Config(format!("Failed to read config file: {}", e))
        })?;

        let config: AppConfig = toml::from_str(&config_str).map_err(|e| {
            crate::error::MarketError::Config(format!("Failed to parse config file: {}", e))
        })?;

        Ok(config)
    }

    pub fn load_with_env_overrides<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config = Self::load(path)?;

        if let Ok(database_url) = std::env::var("DATABASE_URL") {
            config.database.url = database_url;
        }

        if let Ok(log_level) = std::env::var("RUST_LOG") {
            config.logging.level = log_level;
        }

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.database.url.is_empty() {
            return Err(crate::error::MarketError::Config(
                "Database URL cannot be empty".to_string(),
            ));
        }

        if self.logging.level.is_empty() {
            return Err(crate::error::MarketError::Config(
                "Log level cannot be empty".to_string(),
            ));
        }

        Ok(())
    }

    pub fn get_database_url(&self) -> &str {
        &self.database.url
    }
}

pub fn create_default_config_file<P: AsRef<Path>>(path: P) -> Result<()> {
    let default_config = AppConfig::default();
    let toml_str = toml::to_string_pretty(&default_config).map_err(|e| {
        crate::error::MarketError::Config(format!("Failed to serialize default config: {}", e))
    })?;

    std::fs::write(path, toml_str).map_err(|e| {
        crate::error::MarketError::Config(format!("Failed to write default config file: {}", e))
    })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.database.url, "sqlite://kirppu.db");
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        assert!(config.validate().is_ok());

        config.database.url = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_file_creation() {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path();

        create_default_config_file(path).unwrap();
        assert!(path.exists());

        let loaded_config = AppConfig::load(path).unwrap();
        assert_eq!(loaded_config.database.url, "sqlite://kirppu.db");
    }

    #[test]
    fn test_partial_config_parses() {
        let temp_file = NamedTempFile::new().unwrap();
        let test_config = r#"
[database]
url = "sqlite://test.db"

[logging]
level = "debug"
"#;
        std::fs::write(temp_file.path(), test_config).unwrap();

        let config = AppConfig::load(temp_file.path()).unwrap();
        assert_eq!(config.database.url, "sqlite://test.db");
        assert_eq!(config.logging.level, "debug");
    }
}
