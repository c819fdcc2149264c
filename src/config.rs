/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */
use serde::Deserialize;
use std::path::Path;

fn true_() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Sqlite,
    Postgres,
}

impl Default for BackendKind {
    fn default() -> Self {
        BackendKind::Sqlite
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub backend: BackendKind,
    /// File path for sqlite, connection URL for postgres.
    pub url: String,
    pub max_connections: u32,
    pub busy_timeout_ms: u64,
    /// Only meaningful for sqlite, where it is a per-connection pragma.
    #[serde(default = "true_")]
    pub foreign_keys: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            backend: BackendKind::Sqlite,
            url: String::from("mdstore.db"),
            max_connections: 4,
            busy_timeout_ms: 5000,
            foreign_keys: true,
        }
    }
}

impl DatabaseConfig {
    pub fn sqlite(path: impl Into<String>) -> Self {
        DatabaseConfig {
            url: path.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub database: DatabaseConfig,
    /// Bind bulk deletions as a single array parameter where the dialect
    /// supports it, instead of an IN-list.
    #[serde(default = "true_")]
    pub array_binding: bool,
    pub log_level: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            database: DatabaseConfig::default(),
            array_binding: true,
            log_level: String::from("info"),
        }
    }
}

impl StoreConfig {
    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(Self::from_toml(&content)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        // Given
        let content = "";

        // When
        let config = StoreConfig::from_toml(content).unwrap();

        // Then
        assert_eq!(config.database.backend, BackendKind::Sqlite);
        assert_eq!(config.database.max_connections, 4);
        assert!(config.database.foreign_keys);
        assert!(config.array_binding);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_postgres_config() {
        // Given
        let content = r#"
array_binding = false

[database]
backend = "postgres"
url = "postgres://localhost/mdstore"
max_connections = 16
"#;

        // When
        let config = StoreConfig::from_toml(content).unwrap();

        // Then
        assert_eq!(config.database.backend, BackendKind::Postgres);
        assert_eq!(config.database.url, "postgres://localhost/mdstore");
        assert_eq!(config.database.max_connections, 16);
        assert_eq!(config.database.busy_timeout_ms, 5000);
        assert!(!config.array_binding);
    }
}
