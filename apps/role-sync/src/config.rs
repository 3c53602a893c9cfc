use std::{
    env,
    net::{AddrParseError, SocketAddr},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_CHAIN_BASE_URL: &str = "https://lcd.testnet.osmosis.zone";
pub const DEFAULT_DISCORD_API_BASE_URL: &str = "https://discord.com/api/v10";

/// Anti-gaming thresholds. Mutable at runtime through the validator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ValidatorConfig {
    pub min_wallet_age_days: i64,
    pub max_volatility_threshold: f64,
    pub volatility_window_minutes: i64,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            min_wallet_age_days: 7,
            max_volatility_threshold: 0.5,
            volatility_window_minutes: 10,
        }
    }
}

impl ValidatorConfig {
    /// Mean pairwise change above this fraction of the max threshold also blocks.
    pub const AVERAGE_VOLATILITY_RATIO: f64 = 0.7;

    #[must_use]
    pub fn average_volatility_threshold(&self) -> f64 {
        self.max_volatility_threshold * Self::AVERAGE_VOLATILITY_RATIO
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PollerConfig {
    pub batch_size: usize,
    pub batch_pause_ms: u64,
    pub fetch_timeout_seconds: u64,
    pub skip_failed_fetches: bool,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            batch_pause_ms: 500,
            fetch_timeout_seconds: 10,
            skip_failed_fetches: false,
        }
    }
}

impl PollerConfig {
    #[must_use]
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_seconds)
    }

    #[must_use]
    pub fn batch_pause(&self) -> Duration {
        Duration::from_millis(self.batch_pause_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub poll_interval_seconds: u64,
    pub error_backoff_seconds: u64,
    pub reconcile_concurrency: usize,
    pub reconcile_queue_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_seconds: 30,
            error_backoff_seconds: 5,
            reconcile_concurrency: 4,
            reconcile_queue_capacity: 1024,
        }
    }
}

#[derive(Clone, Debug)]
pub struct DiscordConfig {
    pub api_base_url: String,
    pub bot_token: Option<String>,
    pub guild_id: Option<String>,
}

impl Default for DiscordConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_DISCORD_API_BASE_URL.to_string(),
            bot_token: None,
            guild_id: None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub service_name: String,
    pub bind_addr: SocketAddr,
    pub db_url: Option<String>,
    pub chain_base_url: String,
    pub validator: ValidatorConfig,
    pub poller: PollerConfig,
    pub scheduler: SchedulerConfig,
    pub discord: DiscordConfig,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid ROLE_SYNC_BIND_ADDR: {0}")]
    BindAddrParse(#[from] AddrParseError),
    #[error("invalid ROLE_SYNC_CHAIN_BASE_URL: {0}")]
    InvalidChainBaseUrl(String),
    #[error("invalid validator config: {0}")]
    InvalidValidatorConfig(String),
    #[error("invalid poller config: {0}")]
    InvalidPollerConfig(String),
    #[error("invalid scheduler config: {0}")]
    InvalidSchedulerConfig(String),
    #[error("invalid discord config: {0}")]
    InvalidDiscordConfig(String),
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let lookup = |key: &str| env::var(key).ok();
        let bind_addr = env::var("ROLE_SYNC_BIND_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:4300".to_string())
            .parse()?;
        let service_name =
            env::var("ROLE_SYNC_SERVICE_NAME").unwrap_or_else(|_| "role-sync".to_string());
        let db_url = env::var("DB_URL")
            .or_else(|_| env::var("DATABASE_URL"))
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());
        let chain_base_url = parse_chain_base_url_from_env(lookup)?;

        Ok(Self {
            service_name,
            bind_addr,
            db_url,
            chain_base_url,
            validator: parse_validator_config_from_env(lookup)?,
            poller: parse_poller_config_from_env(lookup)?,
            scheduler: parse_scheduler_config_from_env(lookup)?,
            discord: parse_discord_config_from_env(lookup)?,
        })
    }
}

fn parse_chain_base_url_from_env(
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<String, ConfigError> {
    let raw = lookup("ROLE_SYNC_CHAIN_BASE_URL")
        .or_else(|| lookup("OSMOSIS_API_URL"))
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| DEFAULT_CHAIN_BASE_URL.to_string());
    if !raw.starts_with("http://") && !raw.starts_with("https://") {
        return Err(ConfigError::InvalidChainBaseUrl(raw));
    }
    Ok(raw.trim_end_matches('/').to_string())
}

fn parse_validator_config_from_env(
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<ValidatorConfig, ConfigError> {
    let defaults = ValidatorConfig::default();
    let invalid = ConfigError::InvalidValidatorConfig;

    let max_volatility_threshold = parse_number(
        &lookup,
        "ROLE_SYNC_MAX_VOLATILITY_THRESHOLD",
        defaults.max_volatility_threshold,
        (0.0, 100.0),
        invalid,
    )?;
    // Same bound as a runtime update: a zero threshold blocks every change.
    if !max_volatility_threshold.is_finite() || max_volatility_threshold <= 0.0 {
        return Err(invalid(format!(
            "ROLE_SYNC_MAX_VOLATILITY_THRESHOLD must be > 0, got {max_volatility_threshold}"
        )));
    }

    Ok(ValidatorConfig {
        min_wallet_age_days: parse_number(
            &lookup,
            "ROLE_SYNC_MIN_WALLET_AGE_DAYS",
            defaults.min_wallet_age_days,
            (0, 3_650),
            invalid,
        )?,
        max_volatility_threshold,
        volatility_window_minutes: parse_number(
            &lookup,
            "ROLE_SYNC_VOLATILITY_WINDOW_MINUTES",
            defaults.volatility_window_minutes,
            (1, 10_080),
            invalid,
        )?,
    })
}

fn parse_poller_config_from_env(
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<PollerConfig, ConfigError> {
    let defaults = PollerConfig::default();
    let invalid = ConfigError::InvalidPollerConfig;

    let skip_failed_fetches = match lookup("ROLE_SYNC_SKIP_FAILED_FETCHES") {
        Some(raw) => parse_bool(raw.as_str()).map_err(|value| {
            ConfigError::InvalidPollerConfig(format!("ROLE_SYNC_SKIP_FAILED_FETCHES: {value}"))
        })?,
        None => defaults.skip_failed_fetches,
    };

    Ok(PollerConfig {
        batch_size: parse_number(
            &lookup,
            "ROLE_SYNC_BATCH_SIZE",
            defaults.batch_size,
            (1, 100),
            invalid,
        )?,
        batch_pause_ms: parse_number(
            &lookup,
            "ROLE_SYNC_BATCH_PAUSE_MS",
            defaults.batch_pause_ms,
            (0, 60_000),
            invalid,
        )?,
        fetch_timeout_seconds: parse_number(
            &lookup,
            "ROLE_SYNC_FETCH_TIMEOUT_SECONDS",
            defaults.fetch_timeout_seconds,
            (1, 120),
            invalid,
        )?,
        skip_failed_fetches,
    })
}

fn parse_scheduler_config_from_env(
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<SchedulerConfig, ConfigError> {
    let defaults = SchedulerConfig::default();
    let invalid = ConfigError::InvalidSchedulerConfig;

    Ok(SchedulerConfig {
        poll_interval_seconds: parse_number(
            &lookup,
            "ROLE_SYNC_POLL_INTERVAL_SECONDS",
            defaults.poll_interval_seconds,
            (1, 86_400),
            invalid,
        )?,
        error_backoff_seconds: parse_number(
            &lookup,
            "ROLE_SYNC_ERROR_BACKOFF_SECONDS",
            defaults.error_backoff_seconds,
            (1, 3_600),
            invalid,
        )?,
        reconcile_concurrency: parse_number(
            &lookup,
            "ROLE_SYNC_RECONCILE_CONCURRENCY",
            defaults.reconcile_concurrency,
            (1, 64),
            invalid,
        )?,
        reconcile_queue_capacity: parse_number(
            &lookup,
            "ROLE_SYNC_RECONCILE_QUEUE_CAPACITY",
            defaults.reconcile_queue_capacity,
            (1, 100_000),
            invalid,
        )?,
    })
}

fn parse_discord_config_from_env(
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<DiscordConfig, ConfigError> {
    let non_empty = |key: &str| {
        lookup(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    };

    let api_base_url = non_empty("ROLE_SYNC_DISCORD_API_BASE_URL")
        .unwrap_or_else(|| DEFAULT_DISCORD_API_BASE_URL.to_string())
        .trim_end_matches('/')
        .to_string();
    let guild_id = non_empty("DISCORD_GUILD_ID");
    if let Some(guild_id) = guild_id.as_deref() {
        if guild_id.parse::<u64>().is_err() {
            return Err(ConfigError::InvalidDiscordConfig(format!(
                "DISCORD_GUILD_ID must be a numeric snowflake, got: {guild_id}"
            )));
        }
    }

    Ok(DiscordConfig {
        api_base_url,
        bot_token: non_empty("DISCORD_BOT_TOKEN"),
        guild_id,
    })
}

fn parse_number<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
    (min, max): (T, T),
    error: fn(String) -> ConfigError,
) -> Result<T, ConfigError>
where
    T: std::str::FromStr + PartialOrd + Copy,
    T::Err: std::fmt::Display,
{
    let Some(raw) = lookup(key) else {
        return Ok(default);
    };
    let value = raw
        .trim()
        .parse::<T>()
        .map_err(|parse_error| error(format!("{key}: {parse_error}")))?;
    if value < min {
        return Ok(min);
    }
    if value > max {
        return Ok(max);
    }
    Ok(value)
}

fn parse_bool(raw: &str) -> Result<bool, String> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(other.to_string()),
    }
}
