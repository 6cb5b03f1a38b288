//! Configuration structures for capsule.
//!
//! This module defines configuration options for the runtime:
//! - [`RuntimeConfig`]: Top-level configuration containing all settings
//! - [`RegistryConfig`]: Where named programs are loaded from
//! - [`CacheConfig`]: Location and use of the script/resource cache
//! - [`HttpConfig`]: Outbound HTTP client and host policy
//!
//! # Example
//!
//! ```toml
//! verbose = false
//!
//! [registry]
//! base_url = "https://registry.example.com/api/v1"
//! access_token = "secret"
//!
//! [cache]
//! dir = "/var/cache/capsule"
//!
//! [http]
//! allowed_hosts = ["*.example.com"]
//! block_private_addresses = true
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::RuntimeError;

/// Top-level runtime configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RuntimeConfig {
    /// Program registry settings.
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Cache settings.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Outbound HTTP settings.
    #[serde(default)]
    pub http: HttpConfig,

    /// Per-user state directory (tokens file, default cache location).
    ///
    /// Defaults to `~/.capsule`.
    #[serde(default)]
    pub home: Option<PathBuf>,

    /// Enable `debug` output from scripts and progress output from the harness.
    #[serde(default)]
    pub verbose: bool,
}

/// Program registry configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RegistryConfig {
    /// Base URL of the registry API (without trailing `/load`).
    #[serde(default = "defaults::registry_base_url")]
    pub base_url: String,

    /// Access token sent with registry requests.
    #[serde(default)]
    pub access_token: Option<String>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            base_url: defaults::registry_base_url(),
            access_token: None,
        }
    }
}

/// Cache configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    /// Consult and populate the cache when loading programs.
    #[serde(default = "defaults::cache_enabled")]
    pub enabled: bool,

    /// Cache directory. Defaults to `<home>/cache`.
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: defaults::cache_enabled(),
            dir: None,
        }
    }
}

/// Outbound HTTP configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HttpConfig {
    /// User agent sent with every request.
    #[serde(default = "defaults::user_agent")]
    pub user_agent: String,

    /// Host patterns scripts may reach (`*`, `api.example.com`, `*.example.com`).
    #[serde(default = "defaults::allowed_hosts")]
    pub allowed_hosts: Vec<String>,

    /// Refuse loopback, private, and link-local destinations.
    #[serde(default)]
    pub block_private_addresses: bool,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            user_agent: defaults::user_agent(),
            allowed_hosts: defaults::allowed_hosts(),
            block_private_addresses: false,
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigFileError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigFileError::Io {
            path: path.as_ref().display().to_string(),
            source: e,
        })?;

        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, ConfigFileError> {
        toml::from_str(content).map_err(|e| ConfigFileError::Parse {
            message: e.to_string(),
        })
    }

    /// Resolve the per-user state directory.
    pub fn home_dir(&self) -> Result<PathBuf, RuntimeError> {
        if let Some(home) = &self.home {
            return Ok(home.clone());
        }
        dirs::home_dir()
            .map(|dir| dir.join(defaults::HOME_DIR_NAME))
            .ok_or_else(|| RuntimeError::invalid_config("could not determine the home directory"))
    }

    /// Resolve the cache directory.
    pub fn cache_dir(&self) -> Result<PathBuf, RuntimeError> {
        match &self.cache.dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(self.home_dir()?.join("cache")),
        }
    }

    /// Path of the token alias file.
    pub fn tokens_file(&self) -> Result<PathBuf, RuntimeError> {
        Ok(self.home_dir()?.join("tokens"))
    }
}

/// Configuration file errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigFileError {
    /// Failed to read configuration file.
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse configuration file.
    #[error("Failed to parse config file: {message}")]
    Parse { message: String },
}

/// Default value functions for serde.
mod defaults {
    pub const HOME_DIR_NAME: &str = ".capsule";

    pub fn registry_base_url() -> String {
        "http://localhost:8888/api/v1".to_string()
    }

    pub const fn cache_enabled() -> bool {
        true
    }

    pub fn user_agent() -> String {
        concat!("capsule/", env!("CARGO_PKG_VERSION")).to_string()
    }

    pub fn allowed_hosts() -> Vec<String> {
        vec!["*".to_string()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RuntimeConfig::default();

        assert_eq!(config.registry.base_url, "http://localhost:8888/api/v1");
        assert!(config.registry.access_token.is_none());
        assert!(config.cache.enabled);
        assert!(config.cache.dir.is_none());
        assert_eq!(config.http.allowed_hosts, vec!["*"]);
        assert!(!config.http.block_private_addresses);
        assert!(config.http.user_agent.starts_with("capsule/"));
        assert!(!config.verbose);
    }

    #[test]
    fn test_parse_minimal_config() {
        let toml = r#"
            [registry]
            base_url = "https://registry.example.com/api/v1"
        "#;

        let config = RuntimeConfig::from_toml(toml).unwrap();

        assert_eq!(config.registry.base_url, "https://registry.example.com/api/v1");
        // Defaults applied
        assert!(config.cache.enabled);
        assert_eq!(config.http.allowed_hosts, vec!["*"]);
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
            home = "/tmp/capsule-home"
            verbose = true

            [registry]
            base_url = "https://registry.example.com/api/v1"
            access_token = "secret-token"

            [cache]
            enabled = false
            dir = "/tmp/capsule-cache"

            [http]
            user_agent = "tester/1.0"
            allowed_hosts = ["api.example.com", "*.example.org"]
            block_private_addresses = true
        "#;

        let config = RuntimeConfig::from_toml(toml).unwrap();

        assert!(config.verbose);
        assert_eq!(config.registry.access_token.as_deref(), Some("secret-token"));
        assert!(!config.cache.enabled);
        assert_eq!(config.cache_dir().unwrap(), PathBuf::from("/tmp/capsule-cache"));
        assert_eq!(config.http.user_agent, "tester/1.0");
        assert_eq!(config.http.allowed_hosts.len(), 2);
        assert!(config.http.block_private_addresses);
        assert_eq!(
            config.tokens_file().unwrap(),
            PathBuf::from("/tmp/capsule-home/tokens")
        );
    }

    #[test]
    fn test_cache_dir_defaults_under_home() {
        let config = RuntimeConfig {
            home: Some(PathBuf::from("/srv/capsule")),
            ..Default::default()
        };

        assert_eq!(config.cache_dir().unwrap(), PathBuf::from("/srv/capsule/cache"));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capsule.toml");
        std::fs::write(&path, "verbose = true\n").unwrap();

        let config = RuntimeConfig::from_file(&path).unwrap();
        assert!(config.verbose);

        let missing = RuntimeConfig::from_file(dir.path().join("missing.toml"));
        assert!(matches!(missing, Err(ConfigFileError::Io { .. })));
    }

    #[test]
    fn test_parse_invalid_toml() {
        let invalid = "this is not valid toml [";
        let result = RuntimeConfig::from_toml(invalid);
        assert!(matches!(result, Err(ConfigFileError::Parse { .. })));
    }
}
