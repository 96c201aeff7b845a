use crate::cache::CacheMode;
use crate::model::DEFAULT_MAX_CHAIN_DEPTH;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub graph: GraphConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub connection_string: Option<String>,
    pub max_connections: Option<u32>,
}

/// Cache policy for graph builds served over HTTP
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub mode: CacheMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphConfig {
    pub max_chain_depth: usize,
    /// Order tree views by attribute name instead of position
    pub sorted_view: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3002,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            connection_string: None,
            max_connections: Some(20),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { mode: CacheMode::Weak }
    }
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            max_chain_depth: DEFAULT_MAX_CHAIN_DEPTH,
            sorted_view: false,
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, an optional `config` file and
    /// `DATASETS_`-prefixed environment variables
    pub fn load() -> anyhow::Result<Self> {
        Self::load_with_env(None)
    }

    /// `env` replaces the process environment when given
    fn load_with_env(env: Option<config::Map<String, String>>) -> anyhow::Result<Self> {
        let mut config = config::Config::builder();

        config = config.add_source(config::Config::try_from(&AppConfig::default())?);

        config = config.add_source(config::File::with_name("config").required(false));

        // Sections nest on a double underscore so field names keep theirs:
        // DATASETS_SERVER__PORT=8080, DATASETS_GRAPH__MAX_CHAIN_DEPTH=5
        config = config.add_source(
            config::Environment::with_prefix("DATASETS")
                .prefix_separator("_")
                .separator("__")
                .source(env),
        );

        let config = config.build()?;
        let app_config: AppConfig = config.try_deserialize()?;

        Ok(app_config)
    }

    /// Database URL from config or `DATABASE_URL`; `None` selects the
    /// in-memory store
    pub fn database_url(&self) -> Option<String> {
        if let Some(connection_string) = &self.database.connection_string {
            return Some(connection_string.clone());
        }
        std::env::var("DATABASE_URL").ok().filter(|url| !url.is_empty())
    }

    pub fn max_connections(&self) -> u32 {
        self.database.max_connections.unwrap_or(20)
    }

    pub fn server_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.server_address(), "127.0.0.1:3002");
        assert_eq!(config.graph.max_chain_depth, 15);
        assert!(!config.graph.sorted_view);
        assert_eq!(config.cache.mode, CacheMode::Weak);
        assert_eq!(config.max_connections(), 20);
    }

    #[test]
    fn test_explicit_connection_string_wins() {
        let mut config = AppConfig::default();
        config.database.connection_string = Some("postgres://localhost/datasets".into());
        assert_eq!(config.database_url().as_deref(), Some("postgres://localhost/datasets"));
    }

    #[test]
    fn test_env_overrides_multi_word_keys() {
        let env: config::Map<String, String> = [
            ("DATASETS_GRAPH__MAX_CHAIN_DEPTH", "3"),
            ("DATASETS_GRAPH__SORTED_VIEW", "true"),
            ("DATASETS_CACHE__MODE", "strong"),
            ("DATASETS_DATABASE__MAX_CONNECTIONS", "5"),
            ("DATASETS_SERVER__PORT", "8080"),
        ]
        .into_iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect();

        let config = AppConfig::load_with_env(Some(env)).unwrap();
        assert_eq!(config.graph.max_chain_depth, 3);
        assert!(config.graph.sorted_view);
        assert_eq!(config.cache.mode, CacheMode::Strong);
        assert_eq!(config.max_connections(), 5);
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.host, "127.0.0.1");
    }
}
