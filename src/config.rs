use std::str::FromStr;

use anyhow::{anyhow, Result};
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub(crate) struct AppConfig {
    pub(crate) database: DatabaseConfig,
    pub(crate) api: ApiConfig,
    pub(crate) engine: EngineConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub(crate) struct DatabaseConfig {
    pub(crate) url: String,
    pub(crate) min_pool_size: u32,
    pub(crate) max_pool_size: u32,
    pub(crate) max_lifetime_seconds: u64,
    pub(crate) acquire_timeout_seconds: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub(crate) struct ApiConfig {
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) cors_origins: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub(crate) struct EngineConfig {
    /// The single market this engine instance serves, e.g. "BTC-USD".
    pub(crate) market: String,
    pub(crate) queue_capacity: usize,
    pub(crate) command_timeout_ms: u64,
}

pub(crate) fn load_config() -> Result<AppConfig> {
    let cfg = AppConfig {
        database: DatabaseConfig {
            url: env_required("DATABASE_URL")?,
            min_pool_size: env_parse("DB_MIN_POOL_SIZE", 5),
            max_pool_size: env_parse("DB_MAX_POOL_SIZE", 30),
            max_lifetime_seconds: env_parse("DB_MAX_LIFETIME_SECONDS", 1800),
            acquire_timeout_seconds: env_parse("DB_ACQUIRE_TIMEOUT_SECONDS", 30),
        },
        api: ApiConfig {
            host: env_or("API_HOST", "0.0.0.0"),
            port: env_parse("API_PORT", 8080),
            cors_origins: env_list("CORS_ORIGINS", &["*"]),
        },
        engine: EngineConfig {
            market: env_or("ENGINE_MARKET", crate::order::DEFAULT_MARKET),
            queue_capacity: env_parse("ENGINE_QUEUE_CAPACITY", 1024),
            command_timeout_ms: env_parse("ENGINE_COMMAND_TIMEOUT_MS", 3000),
        },
    };
    if cfg.engine.queue_capacity == 0 {
        return Err(anyhow!("ENGINE_QUEUE_CAPACITY must be positive"));
    }
    if cfg.engine.command_timeout_ms == 0 {
        return Err(anyhow!("ENGINE_COMMAND_TIMEOUT_MS must be positive"));
    }
    Ok(cfg)
}

fn env_required(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| anyhow!("missing required env var: {key}"))
}

fn env_or(key: &str, default: &str) -> String {
    match std::env::var(key) {
        Ok(v) if !v.trim().is_empty() => v,
        _ => default.to_string(),
    }
}

/// Parse any FromStr value out of the environment, keeping the default on a
/// missing, empty or malformed variable.
fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or(default),
        Err(_) => default,
    }
}

fn env_list(key: &str, default: &[&str]) -> Vec<String> {
    let fallback = || default.iter().map(|s| (*s).to_string()).collect();
    match std::env::var(key) {
        Ok(raw) => {
            let items = parse_list(&raw);
            if items.is_empty() {
                fallback()
            } else {
                items
            }
        }
        Err(_) => fallback(),
    }
}

/// Comma- or semicolon-separated list; entries may carry stray quotes or
/// surrounding whitespace from compose files.
fn parse_list(raw: &str) -> Vec<String> {
    raw.split([',', ';'])
        .map(|s| s.trim().trim_matches(|c| c == '"' || c == '\''))
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_list_splits_on_either_delimiter() {
        assert_eq!(
            parse_list("http://a.test, http://b.test;http://c.test"),
            vec!["http://a.test", "http://b.test", "http://c.test"]
        );
    }

    #[test]
    fn parse_list_strips_quotes_and_empty_entries() {
        assert_eq!(parse_list("\"*\", ,'x',"), vec!["*", "x"]);
        assert!(parse_list("  ,, ").is_empty());
    }
}
