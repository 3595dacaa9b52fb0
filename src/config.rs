use std::fmt::Display;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{EngineError, EngineResult};

/// Service configuration, loaded from environment variables with sensible
/// defaults. `.env` files are honored via dotenv in `main`.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server bind address (`FLOODGATE_BIND`).
    pub bind_addr: SocketAddr,
    /// Default log filter level (`FLOODGATE_LOG`).
    pub log_level: String,
    /// Cleanup sweeper interval (`FLOODGATE_CLEANUP_INTERVAL_SECS`).
    pub cleanup_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:3000".parse().expect("valid default address"),
            log_level: "info".to_string(),
            cleanup_interval: Duration::from_secs(300),
        }
    }
}

impl Config {
    pub fn from_env() -> EngineResult<Self> {
        let defaults = Config::default();
        Ok(Self {
            bind_addr: env_parse("FLOODGATE_BIND", defaults.bind_addr)?,
            log_level: env_parse("FLOODGATE_LOG", defaults.log_level)?,
            cleanup_interval: Duration::from_secs(env_parse(
                "FLOODGATE_CLEANUP_INTERVAL_SECS",
                defaults.cleanup_interval.as_secs(),
            )?),
        })
    }
}

fn env_parse<T>(name: &str, default: T) -> EngineResult<T>
where
    T: FromStr,
    T::Err: Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| EngineError::InvalidConfig(format!("{name}={raw}: {e}"))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.bind_addr.port(), 3000);
        assert_eq!(config.cleanup_interval, Duration::from_secs(300));
        assert_eq!(config.log_level, "info");
    }
}
