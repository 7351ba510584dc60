use std::collections::BTreeMap;

use thiserror::Error;

/// Runtime configuration, read from the environment with an optional `.env`
/// file as fallback. Real environment variables win over file entries.
#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub redis_url: String,
    pub jwt_secret: String,
    pub server_port: u16,
    pub embedding_service_url: String,
    pub admin_token: Option<String>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let dotenv = std::fs::read_to_string(".env")
            .map(|contents| parse_dotenv(&contents))
            .unwrap_or_default();
        Self::from_lookup(|key| {
            std::env::var(key)
                .ok()
                .filter(|value| !value.trim().is_empty())
                .or_else(|| dotenv.get(key).cloned())
        })
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let database_url = lookup("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?;
        let raw_port = lookup("SERVER_PORT").unwrap_or_else(|| "8080".to_string());
        let server_port = raw_port.parse::<u16>().map_err(|_| ConfigError::Invalid {
            key: "SERVER_PORT",
            value: raw_port,
        })?;
        Ok(Self {
            database_url,
            redis_url: lookup("REDIS_URL").unwrap_or_else(|| "redis://localhost:6379".to_string()),
            jwt_secret: lookup("JWT_SECRET").unwrap_or_else(|| "secret".to_string()),
            server_port,
            embedding_service_url: lookup("EMBEDDING_SERVICE_URL")
                .unwrap_or_else(|| "http://localhost:5000".to_string()),
            admin_token: lookup("ADMIN_TOKEN"),
        })
    }
}

fn parse_dotenv(contents: &str) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for raw_line in contents.lines() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line).trim();
        let Some((raw_key, raw_value)) = line.split_once('=') else {
            continue;
        };
        let key = raw_key.trim();
        if key.is_empty() {
            continue;
        }
        let mut value = raw_value.trim().to_string();
        if let Some(stripped) = value
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
        {
            value = stripped.to_string();
        }
        if value.is_empty() {
            continue;
        }
        out.insert(key.to_string(), value);
    }
    out
}
