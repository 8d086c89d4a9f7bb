use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;
use std::time::Duration;

pub const DEFAULT_API_URL: &str = "http://localhost:8000";
pub const DEFAULT_POLL_SECS: u64 = 3;
pub const DEFAULT_CONTEXT_POLL_SECS: u64 = 300;
/// `LOTTERY_API_URL` value that runs against the in-memory backend.
pub const DEMO_API_URL: &str = "demo";

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub api_url: String,
    pub poll_interval: Duration,
    pub context_poll_interval: Duration,
    pub init_data: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            poll_interval: Duration::from_secs(DEFAULT_POLL_SECS),
            context_poll_interval: Duration::from_secs(DEFAULT_CONTEXT_POLL_SECS),
            init_data: None,
        }
    }
}

impl Config {
    pub fn uses_demo_backend(&self) -> bool {
        self.api_url.eq_ignore_ascii_case(DEMO_API_URL)
    }
}

pub fn load() -> Result<Config> {
    from_lookup(|key| env::var(key).ok())
}

fn from_lookup<F>(lookup: F) -> Result<Config>
where
    F: Fn(&str) -> Option<String>,
{
    let api_url = lookup("LOTTERY_API_URL")
        .filter(|url| !url.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_API_URL.to_string());

    let poll_secs = seconds(&lookup, "LOTTERY_POLL_SECS", DEFAULT_POLL_SECS)?;
    let context_secs = seconds(&lookup, "LOTTERY_CONTEXT_POLL_SECS", DEFAULT_CONTEXT_POLL_SECS)?;

    Ok(Config {
        api_url: api_url.trim().trim_end_matches('/').to_string(),
        poll_interval: Duration::from_secs(poll_secs),
        context_poll_interval: Duration::from_secs(context_secs),
        init_data: lookup("TELEGRAM_INIT_DATA").filter(|data| !data.trim().is_empty()),
    })
}

fn seconds<F>(lookup: &F, key: &str, default: u64) -> Result<u64>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => {
            let secs: u64 = raw
                .trim()
                .parse()
                .with_context(|| format!("{key} must be a whole number of seconds, got {raw:?}"))?;
            anyhow::ensure!(secs > 0, "{key} must be greater than zero");
            Ok(secs)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        let config = from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.api_url, DEFAULT_API_URL);
        assert_eq!(config.poll_interval, Duration::from_secs(3));
        assert_eq!(config.context_poll_interval, Duration::from_secs(300));
        assert!(config.init_data.is_none());
    }

    #[test]
    fn trims_trailing_slash_from_api_url() {
        let config = from_lookup(lookup(&[("LOTTERY_API_URL", "https://api.example.org/ ")])).unwrap();
        assert_eq!(config.api_url, "https://api.example.org");
        assert!(!config.uses_demo_backend());
    }

    #[test]
    fn demo_marker_selects_in_memory_backend() {
        let config = from_lookup(lookup(&[("LOTTERY_API_URL", "demo")])).unwrap();
        assert!(config.uses_demo_backend());
    }

    #[test]
    fn rejects_bad_poll_interval() {
        assert!(from_lookup(lookup(&[("LOTTERY_POLL_SECS", "soon")])).is_err());
        assert!(from_lookup(lookup(&[("LOTTERY_POLL_SECS", "0")])).is_err());
    }
}
