//! Configuration loading for the FlowK binaries.
//!
//! Configuration lives in TOML, either at an explicit `-config` path or at
//! `<config dir>/flowk/config.toml`. A missing default file yields the
//! built-in defaults; an explicit path that cannot be read is an error.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::errors::ConfigError;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowkConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_addr")]
    pub addr: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Directory uploaded flow files are stored into.
    #[serde(default = "default_upload_dir")]
    pub upload_dir: PathBuf,

    /// Roots searched when an uploaded flow's import escapes the upload
    /// directory.
    #[serde(default)]
    pub search_roots: Vec<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: default_addr(),
            port: default_port(),
            upload_dir: default_upload_dir(),
            search_roots: Vec::new(),
        }
    }
}

/// Artifact storage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            log_dir: default_log_dir(),
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Tracing env-filter expression.
    #[serde(default = "default_filter")]
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_filter(),
        }
    }
}

fn default_addr() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8321
}

fn default_upload_dir() -> PathBuf {
    PathBuf::from("uploads")
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_filter() -> String {
    "info".to_string()
}

impl FlowkConfig {
    /// Load configuration. An explicit path must exist; the default XDG
    /// location is optional.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match explicit {
            Some(path) => path.to_path_buf(),
            None => match Self::default_path() {
                Some(path) if path.exists() => path,
                _ => {
                    debug!("no config file found, using defaults");
                    return Ok(Self::default());
                }
            },
        };

        let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        let config = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.clone(),
            source,
        })?;
        debug!("loaded config from {}", path.display());
        Ok(config)
    }

    /// Default location: `<config dir>/flowk/config.toml`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("flowk").join("config.toml"))
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.addr, self.server.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = FlowkConfig::default();
        assert_eq!(config.server.addr, "127.0.0.1");
        assert_eq!(config.server.port, 8321);
        assert_eq!(config.storage.log_dir, PathBuf::from("logs"));
        assert_eq!(config.logging.filter, "info");
    }

    #[test]
    fn test_load_explicit_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[server]
port = 9000

[storage]
log_dir = "/tmp/flowk-logs"

[logging]
filter = "flowk_core=debug"
"#,
        )
        .unwrap();

        let config = FlowkConfig::load(Some(&path)).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.addr, "127.0.0.1");
        assert_eq!(config.storage.log_dir, PathBuf::from("/tmp/flowk-logs"));
        assert_eq!(config.logging.filter, "flowk_core=debug");
        assert_eq!(config.bind_address(), "127.0.0.1:9000");
    }

    #[test]
    fn test_missing_explicit_file_is_error() {
        let result = FlowkConfig::load(Some(Path::new("/nope/config.toml")));
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }

    #[test]
    fn test_invalid_toml_is_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "server = nonsense[").unwrap();
        let result = FlowkConfig::load(Some(&path));
        assert!(matches!(result, Err(ConfigError::Parse { .. })));
    }
}
