use anyhow::{Context, Result};
use arena_core::WebhookConfig;
use std::env;
use std::time::Duration;

const DEFAULT_RECONCILE_INTERVAL_SECS: u64 = 300;
const DEFAULT_STALE_AFTER_SECS: u64 = 900;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub webhook: WebhookConfig,
    /// Period of the background reconciliation sweep. `None` disables it.
    pub reconcile_interval: Option<Duration>,
    /// Heartbeat age after which a run counts as stuck.
    pub stale_after: Duration,
    pub log_json: bool,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let port = env::var("PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse::<u16>()
            .context("PORT must be a valid number")?;

        let webhook = WebhookConfig::from_env().context("invalid webhook configuration")?;

        let reconcile_interval = parse_secs(
            "RECONCILE_INTERVAL_SECS",
            env::var("RECONCILE_INTERVAL_SECS").ok(),
            DEFAULT_RECONCILE_INTERVAL_SECS,
        )?;
        let stale_after = parse_secs(
            "STALE_AFTER_SECS",
            env::var("STALE_AFTER_SECS").ok(),
            DEFAULT_STALE_AFTER_SECS,
        )?;

        Ok(Config {
            port,
            webhook,
            reconcile_interval: (reconcile_interval > 0)
                .then(|| Duration::from_secs(reconcile_interval)),
            stale_after: Duration::from_secs(stale_after),
            log_json: parse_log_format(env::var("LOG_FORMAT").ok()),
        })
    }
}

/// Parse a whole number of seconds, falling back to `default` when unset
/// or blank.
pub fn parse_secs(name: &str, value: Option<String>, default: u64) -> Result<u64> {
    match value.filter(|s| !s.trim().is_empty()) {
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .with_context(|| format!("{name} must be a whole number of seconds, got {raw:?}")),
        None => Ok(default),
    }
}

/// `LOG_FORMAT=json` selects JSON lines.
pub fn parse_log_format(value: Option<String>) -> bool {
    value.is_some_and(|v| v.trim().eq_ignore_ascii_case("json"))
}
