use std::time::Duration;

use thiserror::Error;
use tracing::warn;

use crate::{
    client::JobHandleSource,
    observer::{ObserverStrategy, DEFAULT_POLL_ATTEMPTS, DEFAULT_POLL_INTERVAL},
};

pub const DEFAULT_API_URL: &str = "http://localhost:8000";
pub const DEFAULT_PORT: u16 = 8080;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid {name}: '{value}'")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub api_url: String,
    pub strategy: ObserverStrategy,
    pub job_handles: JobHandleSource,
    pub port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            strategy: ObserverStrategy::Push,
            job_handles: JobHandleSource::Correlation,
            port: DEFAULT_PORT,
        }
    }
}

impl Config {
    /// Reads the process environment; call `dotenv::dotenv()` first to pick
    /// up a `.env` file.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| get(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let api_url = get("HERO_CARD_API_URL").unwrap_or_else(|| DEFAULT_API_URL.to_string());

        let strategy = match get("HERO_CARD_OBSERVER").as_deref().map(str::to_ascii_lowercase).as_deref() {
            None | Some("push") => ObserverStrategy::Push,
            Some("poll") => ObserverStrategy::Poll {
                interval: get("HERO_CARD_POLL_INTERVAL_SECS")
                    .and_then(|v| parse_or_warn::<u64>("HERO_CARD_POLL_INTERVAL_SECS", &v))
                    .filter(|secs| *secs > 0)
                    .map(Duration::from_secs)
                    .unwrap_or(DEFAULT_POLL_INTERVAL),
                max_attempts: get("HERO_CARD_POLL_MAX_ATTEMPTS")
                    .and_then(|v| parse_or_warn::<u32>("HERO_CARD_POLL_MAX_ATTEMPTS", &v))
                    .filter(|n| *n > 0)
                    .unwrap_or(DEFAULT_POLL_ATTEMPTS),
            },
            Some(other) => {
                return Err(ConfigError::Invalid { name: "HERO_CARD_OBSERVER", value: other.to_string() })
            }
        };

        let job_handles = match get("HERO_CARD_JOB_HANDLE").as_deref().map(str::to_ascii_lowercase).as_deref() {
            None => match strategy {
                ObserverStrategy::Push => JobHandleSource::Correlation,
                ObserverStrategy::Poll { .. } => JobHandleSource::Server,
            },
            Some("correlation") => JobHandleSource::Correlation,
            Some("server") => JobHandleSource::Server,
            Some(other) => {
                return Err(ConfigError::Invalid { name: "HERO_CARD_JOB_HANDLE", value: other.to_string() })
            }
        };

        let port = get("PORT").and_then(|v| parse_or_warn::<u16>("PORT", &v)).unwrap_or(DEFAULT_PORT);

        Ok(Self { api_url, strategy, job_handles, port })
    }
}

fn parse_or_warn<T: std::str::FromStr>(name: &str, value: &str) -> Option<T> {
    let parsed = value.parse().ok();
    if parsed.is_none() {
        warn!("Ignoring invalid {}='{}', using default", name, value);
    }
    parsed
}
