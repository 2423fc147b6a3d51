use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Daemon settings resolved from the environment (and `.env`), plus the
/// parsed JSON config file they point at.
#[derive(Debug, Clone)]
pub struct Config {
    pub config_path: PathBuf,
    pub users_path: PathBuf,
    pub log_level: String,
    pub file: FileConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct FileConfig {
    pub host: String,
    pub port: u16,
    pub unix_socket: UnixSocketConfig,
    pub redis: RedisConfig,
    pub logging: LoggingConfig,
    pub servers: BTreeMap<String, ServerConfig>,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 42069,
            unix_socket: UnixSocketConfig::default(),
            redis: RedisConfig::default(),
            logging: LoggingConfig::default(),
            servers: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct UnixSocketConfig {
    pub enabled: bool,
    pub location: PathBuf,
}

impl Default for UnixSocketConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            location: std::env::temp_dir().join("procwarden.sock"),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct RedisConfig {
    pub enabled: bool,
    pub url: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: "redis://localhost".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingConfig {
    pub enabled: bool,
    pub path: PathBuf,
    pub max_size_mb: u64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: PathBuf::from("logs/actions.log"),
            max_size_mb: 10,
        }
    }
}

impl LoggingConfig {
    pub fn max_size_bytes(&self) -> u64 {
        self.max_size_mb * 1024 * 1024
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    pub directory: PathBuf,
    pub command: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// Expands `~` and `$VAR` references.
fn expand_tilde(path_str: &str) -> Result<PathBuf> {
    shellexpand::full(path_str)
        .map(|p| PathBuf::from(p.as_ref()))
        .map_err(|e| anyhow::anyhow!("Failed to expand path '{}': {}", path_str, e))
}

impl FileConfig {
    pub fn parse(content: &str) -> Result<Self> {
        let mut parsed: FileConfig = serde_json::from_str(content).context("Invalid config JSON")?;
        for (name, server) in parsed.servers.iter_mut() {
            if name.trim().is_empty() || name.contains('/') {
                anyhow::bail!("Invalid server name: {:?}", name);
            }
            if server.command.trim().is_empty() {
                anyhow::bail!("Server {} has an empty command", name);
            }
            let expanded = expand_tilde(&server.directory.to_string_lossy())?;
            server.directory = match dunce::canonicalize(&expanded) {
                Ok(canonical) => canonical,
                Err(e) => {
                    warn!(server = %name, directory = %expanded.display(), error = %e, "Server directory could not be canonicalized");
                    expanded
                }
            };
        }
        Ok(parsed)
    }

    pub fn read(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::parse(&content)
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok(); // Load .env file if present

        let config_path = std::env::var("PROCWARDEN_CONFIG")
            .map(|p| expand_tilde(&p))
            .unwrap_or_else(|_| Ok(PathBuf::from("config.json")))?;
        let users_path = std::env::var("PROCWARDEN_USERS")
            .map(|p| expand_tilde(&p))
            .unwrap_or_else(|_| Ok(PathBuf::from("users.json")))?;
        let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let file = if config_path.exists() {
            FileConfig::read(&config_path)?
        } else {
            warn!(path = %config_path.display(), "Config file not found, starting with no servers");
            FileConfig::default()
        };

        Ok(Config {
            config_path,
            users_path,
            log_level,
            file,
        })
    }

    /// Re-reads the config file this daemon was started with.
    pub fn reload_file(&self) -> Result<FileConfig> {
        FileConfig::read(&self.config_path)
    }
}
