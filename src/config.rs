//! Configuration management for Tusk
//!
//! Built once at process start and handed to the store, server and client
//! constructors; nothing reads the environment after that.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use serde::Deserialize;

use crate::store::{DEFAULT_TTL_SECS, MAX_TTL_SECS};
use crate::transfer::{ChecksumAlgorithm, DEFAULT_CHUNK_SIZE};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub store: StoreConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,

    /// Public origin used to build `Location` headers; taken from the
    /// request's `Host` header when unset
    pub base_url: Option<String>,

    /// Route the upload endpoints are mounted under
    pub api_path: String,

    pub upload_dir: PathBuf,

    /// 0 = unlimited
    pub max_upload_size: u64,

    pub chunk_size: usize,

    /// Seconds between expiration sweeps; 0 disables the background task
    pub expiration_interval_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    File,
    Sqlite,
}

impl FromStr for StoreBackend {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "file" => Ok(Self::File),
            "sqlite" => Ok(Self::Sqlite),
            _ => Err(ConfigError::InvalidValue {
                name: "TUS_STORE",
                value: value.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    pub backend: StoreBackend,

    /// Document used by the file backend
    pub path: PathBuf,

    /// Connection string used by the sqlite backend
    pub database_url: String,

    pub ttl_secs: u64,

    /// Overrides the default per-role prefix
    pub prefix: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// Server origin, e.g. `http://localhost:3000`
    pub endpoint: String,
    pub api_path: String,
    pub checksum_algorithm: ChecksumAlgorithm,
    pub chunk_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: "0.0.0.0".to_string(),
            port: 3000,
            base_url: None,
            api_path: "/files".to_string(),
            upload_dir: PathBuf::from("./uploads"),
            max_upload_size: 0,
            chunk_size: DEFAULT_CHUNK_SIZE,
            expiration_interval_secs: 300,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            backend: StoreBackend::File,
            path: PathBuf::from("./uploads/.cache/tus.json"),
            database_url: "sqlite:./tusk.db".to_string(),
            ttl_secs: DEFAULT_TTL_SECS,
            prefix: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            endpoint: "http://localhost:3000".to_string(),
            api_path: "/files".to_string(),
            checksum_algorithm: ChecksumAlgorithm::default(),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Config::default();

        Ok(Config {
            server: ServerConfig {
                host: env::var("TUS_HOST").unwrap_or(defaults.server.host),
                port: parse_var("TUS_PORT", defaults.server.port)?,
                base_url: env::var("TUS_BASE_URL").ok().filter(|url| !url.is_empty()),
                api_path: env::var("TUS_API_PATH")
                    .map(|path| normalize_api_path(&path))
                    .unwrap_or(defaults.server.api_path),
                upload_dir: env::var("TUS_UPLOAD_DIR")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.server.upload_dir),
                max_upload_size: parse_var("TUS_MAX_UPLOAD_SIZE", defaults.server.max_upload_size)?,
                chunk_size: parse_var("TUS_CHUNK_SIZE", defaults.server.chunk_size)?,
                expiration_interval_secs: parse_var(
                    "TUS_EXPIRATION_INTERVAL",
                    defaults.server.expiration_interval_secs,
                )?,
            },
            store: StoreConfig {
                backend: parse_var("TUS_STORE", defaults.store.backend)?,
                path: env::var("TUS_STORE_PATH")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.store.path),
                database_url: env::var("TUS_DATABASE_URL").unwrap_or(defaults.store.database_url),
                ttl_secs: parse_ttl(defaults.store.ttl_secs)?,
                prefix: env::var("TUS_STORE_PREFIX").ok(),
            },
        })
    }
}

impl ClientConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = ClientConfig::default();

        Ok(ClientConfig {
            endpoint: env::var("TUS_ENDPOINT").unwrap_or(defaults.endpoint),
            api_path: env::var("TUS_API_PATH")
                .map(|path| normalize_api_path(&path))
                .unwrap_or(defaults.api_path),
            checksum_algorithm: parse_var("TUS_CHECKSUM_ALGORITHM", defaults.checksum_algorithm)?,
            chunk_size: parse_var("TUS_CHUNK_SIZE", defaults.chunk_size)?,
        })
    }
}

/// Leading slash, no trailing slash
pub fn normalize_api_path(path: &str) -> String {
    let trimmed = path.trim().trim_matches('/');
    format!("/{trimmed}")
}

fn parse_var<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { name, value }),
        Err(_) => Ok(default),
    }
}

fn parse_ttl(default: u64) -> Result<u64, ConfigError> {
    let ttl_secs = parse_var("TUS_TTL", default)?;
    if ttl_secs > MAX_TTL_SECS {
        return Err(ConfigError::InvalidValue {
            name: "TUS_TTL",
            value: ttl_secs.to_string(),
        });
    }
    Ok(ttl_secs)
}
