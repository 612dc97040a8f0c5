use crate::codegen::DEFAULT_CODE_LENGTH;
use crate::storage::PoolSettings;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_JOURNAL_PATH: &str = "/tmp/short-url-db.json";
const DEFAULT_SQLITE_URL: &str = "sqlite://./marten.db";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub server: ServerConfig,
    pub shortener: ShortenerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub backend: DatabaseBackend,
    /// Connection string for the relational backends.
    pub url: Option<String>,
    pub max_open_connections: u32,
    pub max_idle_connections: u32,
    pub operation_timeout_secs: u64,
    /// Journal replayed by the memory backend. `None` keeps state in memory only.
    pub journal_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseBackend {
    Memory,
    Sqlite,
    Postgres,
}

impl DatabaseBackend {
    /// Guess the backend from a connection string's scheme.
    pub fn from_url(url: &str) -> Option<Self> {
        let scheme = url.split_once(':')?.0.to_lowercase();
        match scheme.as_str() {
            "postgres" | "postgresql" => Some(DatabaseBackend::Postgres),
            "sqlite" => Some(DatabaseBackend::Sqlite),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShortenerConfig {
    /// Prefix joined with a code to form the public short URL.
    pub base_url: String,
    pub code_length: usize,
    pub max_attempts: u32,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let url = lookup("DATABASE_DSN")
            .or_else(|| lookup("DATABASE_URL"))
            .filter(|v| !v.trim().is_empty());

        let backend = match lookup("DATABASE_BACKEND").map(|v| v.to_lowercase()) {
            Some(v) if v == "memory" => DatabaseBackend::Memory,
            Some(v) if v == "sqlite" => DatabaseBackend::Sqlite,
            Some(v) if v == "postgres" || v == "postgresql" => DatabaseBackend::Postgres,
            other => {
                if let Some(other) = other {
                    tracing::warn!(
                        "Unknown DATABASE_BACKEND '{other}', inferring from DATABASE_URL. Supported values: memory, sqlite, postgres"
                    );
                }
                url.as_deref()
                    .and_then(DatabaseBackend::from_url)
                    .unwrap_or(DatabaseBackend::Memory)
            }
        };

        let url = match backend {
            DatabaseBackend::Sqlite => Some(url.unwrap_or_else(|| DEFAULT_SQLITE_URL.to_string())),
            DatabaseBackend::Postgres => Some(
                url.context("DATABASE_URL must be set when DATABASE_BACKEND=postgres")?,
            ),
            DatabaseBackend::Memory => url,
        };

        // An explicitly empty path disables the journal
        let journal_path = match lookup("FILE_STORAGE_PATH") {
            Some(path) if path.trim().is_empty() => None,
            Some(path) => Some(PathBuf::from(path)),
            None => Some(PathBuf::from(DEFAULT_JOURNAL_PATH)),
        };

        let code_length = parse_or(&lookup, "SHORT_CODE_LENGTH", DEFAULT_CODE_LENGTH)?;
        if code_length == 0 {
            anyhow::bail!("SHORT_CODE_LENGTH must be at least 1");
        }

        Ok(Config {
            database: DatabaseConfig {
                backend,
                url,
                max_open_connections: parse_or(&lookup, "DB_MAX_OPEN_CON", 30)?,
                max_idle_connections: parse_or(&lookup, "DB_MAX_IDLE_CON", 30)?,
                operation_timeout_secs: parse_or(&lookup, "DB_OPERATION_TIMEOUT_SECS", 120)?,
                journal_path,
            },
            server: ServerConfig {
                host: lookup("SERVER_HOST").unwrap_or_else(|| "localhost".to_string()),
                port: parse_or(&lookup, "SERVER_PORT", 8080)?,
            },
            shortener: ShortenerConfig {
                base_url: lookup("BASE_URL")
                    .unwrap_or_else(|| "http://localhost:8080".to_string()),
                code_length,
                max_attempts: parse_or(&lookup, "SHORT_CODE_MAX_ATTEMPTS", 8)?,
            },
        })
    }
}

impl DatabaseConfig {
    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            max_open: self.max_open_connections,
            max_idle: self.max_idle_connections,
            operation_timeout: Duration::from_secs(self.operation_timeout_secs),
            ..PoolSettings::default()
        }
    }

    /// Point at a new connection string, switching backend when the scheme says so.
    pub fn set_url(&mut self, url: String) {
        if let Some(backend) = DatabaseBackend::from_url(&url) {
            self.backend = backend;
        }
        self.url = Some(url);
    }
}

impl ServerConfig {
    /// Parse a `host:port` address as given on the command line.
    pub fn parse_address(address: &str) -> anyhow::Result<Self> {
        let (host, port) = address
            .rsplit_once(':')
            .with_context(|| format!("address '{address}' must look like host:port"))?;
        let port = port
            .parse::<u16>()
            .with_context(|| format!("invalid port in address '{address}'"))?;
        let host = if host.is_empty() { "localhost" } else { host };

        Ok(ServerConfig {
            host: host.to_string(),
            port,
        })
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> anyhow::Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("invalid value '{raw}' for {key}")),
        None => Ok(default),
    }
}
