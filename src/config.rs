use crate::cache::fallback::FallbackStrategy;
use crate::cache::fetcher::RetryPolicy;
use crate::error::ConfigError;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default refresh interval: 24 hours
const DEFAULT_REFRESH_INTERVAL: &str = "24h";
const DEFAULT_FALLBACK_STRATEGY: &str = "skip";
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_BASE_DELAY_SECONDS: f64 = 1.0;
const DEFAULT_MAX_DELAY_SECONDS: f64 = 30.0;
const DEFAULT_REQUEST_TIMEOUT_SECONDS: f64 = 10.0;
pub const DEFAULT_MAX_CONCURRENT_REFRESHES: usize = 5;

static DURATION_PART: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d+)\s*([A-Za-z]*)").expect("duration regex is valid"));

/// Admin ids arrive as JSON numbers from config files and as strings from the
/// environment.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum AdminId {
    Number(i64),
    Text(String),
}

impl AdminId {
    fn resolve(&self) -> Result<i64, ConfigError> {
        match self {
            AdminId::Number(n) => Ok(*n),
            AdminId::Text(s) => s
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidAdminId(s.clone())),
        }
    }
}

/// Unvalidated options, exactly as an operator wrote them.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawConfig {
    pub refresh_interval: Option<String>,
    pub fallback_strategy: Option<String>,
    pub fallback_admin_user_id: Option<AdminId>,
    pub max_retries: Option<u32>,
    pub base_delay_seconds: Option<f64>,
    pub max_delay_seconds: Option<f64>,
    pub request_timeout_seconds: Option<f64>,
    pub max_concurrent_refreshes: Option<usize>,
    pub snapshot_path: Option<PathBuf>,
}

impl RawConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            refresh_interval: env::var("IDMAP_REFRESH_INTERVAL").ok(),
            fallback_strategy: env::var("IDMAP_FALLBACK_STRATEGY").ok(),
            fallback_admin_user_id: env::var("IDMAP_FALLBACK_ADMIN_USER_ID")
                .ok()
                .map(AdminId::Text),
            max_retries: env_number("IDMAP_MAX_RETRIES", "max_retries")?,
            base_delay_seconds: env_number("IDMAP_BASE_DELAY_SECONDS", "base_delay_seconds")?,
            max_delay_seconds: env_number("IDMAP_MAX_DELAY_SECONDS", "max_delay_seconds")?,
            request_timeout_seconds: env_number(
                "IDMAP_REQUEST_TIMEOUT_SECONDS",
                "request_timeout_seconds",
            )?,
            max_concurrent_refreshes: env_number(
                "IDMAP_MAX_CONCURRENT_REFRESHES",
                "max_concurrent_refreshes",
            )?,
            snapshot_path: env::var("IDMAP_SNAPSHOT_PATH").ok().map(PathBuf::from),
        })
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::File(format!("{}: {}", path.display(), e)))?;
        serde_json::from_str(&text)
            .map_err(|e| ConfigError::File(format!("{}: {}", path.display(), e)))
    }

    /// Fill every option left unset here from `other`.
    pub fn or(self, other: RawConfig) -> Self {
        Self {
            refresh_interval: self.refresh_interval.or(other.refresh_interval),
            fallback_strategy: self.fallback_strategy.or(other.fallback_strategy),
            fallback_admin_user_id: self.fallback_admin_user_id.or(other.fallback_admin_user_id),
            max_retries: self.max_retries.or(other.max_retries),
            base_delay_seconds: self.base_delay_seconds.or(other.base_delay_seconds),
            max_delay_seconds: self.max_delay_seconds.or(other.max_delay_seconds),
            request_timeout_seconds: self
                .request_timeout_seconds
                .or(other.request_timeout_seconds),
            max_concurrent_refreshes: self
                .max_concurrent_refreshes
                .or(other.max_concurrent_refreshes),
            snapshot_path: self.snapshot_path.or(other.snapshot_path),
        }
    }

    /// Validate every option. This is the only place a `ConfigError` can arise.
    pub fn build(self) -> Result<CacheConfig, ConfigError> {
        let refresh_interval = parse_duration(
            "refresh_interval",
            self.refresh_interval
                .as_deref()
                .unwrap_or(DEFAULT_REFRESH_INTERVAL),
        )?;

        let admin_id = self
            .fallback_admin_user_id
            .as_ref()
            .map(AdminId::resolve)
            .transpose()?;
        let fallback = FallbackStrategy::parse(
            self.fallback_strategy
                .as_deref()
                .unwrap_or(DEFAULT_FALLBACK_STRATEGY),
            admin_id,
        )?;

        let retry = RetryPolicy::new(
            self.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            seconds(
                "base_delay_seconds",
                self.base_delay_seconds.unwrap_or(DEFAULT_BASE_DELAY_SECONDS),
            )?,
            seconds(
                "max_delay_seconds",
                self.max_delay_seconds.unwrap_or(DEFAULT_MAX_DELAY_SECONDS),
            )?,
            seconds(
                "request_timeout_seconds",
                self.request_timeout_seconds
                    .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECONDS),
            )?,
        )?;

        let max_concurrent_refreshes = self
            .max_concurrent_refreshes
            .unwrap_or(DEFAULT_MAX_CONCURRENT_REFRESHES);
        if max_concurrent_refreshes == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }

        Ok(CacheConfig {
            refresh_interval,
            fallback,
            retry,
            max_concurrent_refreshes,
            snapshot_path: self.snapshot_path,
        })
    }
}

/// Validated cache configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum age of a mapping before it is stale
    pub refresh_interval: Duration,
    pub fallback: FallbackStrategy,
    pub retry: RetryPolicy,
    /// Bound on simultaneous source lookups
    pub max_concurrent_refreshes: usize,
    /// Snapshot file; `None` keeps the table in memory only
    pub snapshot_path: Option<PathBuf>,
}

impl CacheConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        RawConfig::from_env()?.build()
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(24 * 60 * 60),
            fallback: FallbackStrategy::Skip,
            retry: RetryPolicy::default(),
            max_concurrent_refreshes: DEFAULT_MAX_CONCURRENT_REFRESHES,
            snapshot_path: None,
        }
    }
}

fn env_number<T: std::str::FromStr>(
    var: &str,
    option: &'static str,
) -> Result<Option<T>, ConfigError> {
    match env::var(var) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidNumber { option, value }),
        Err(_) => Ok(None),
    }
}

fn seconds(option: &'static str, value: f64) -> Result<Duration, ConfigError> {
    if !value.is_finite() || value <= 0.0 {
        return Err(ConfigError::NotPositive {
            option,
            value: value.to_string(),
        });
    }
    Duration::try_from_secs_f64(value).map_err(|_| ConfigError::InvalidNumber {
        option,
        value: value.to_string(),
    })
}

/// Parse a duration such as `"90"`, `"45s"`, `"24h"` or `"1h30m"`.
///
/// Units are `s`, `m`, `h`, `d` and `w`; a bare number is seconds. The total
/// must be strictly positive.
pub fn parse_duration(option: &'static str, value: &str) -> Result<Duration, ConfigError> {
    let invalid = || ConfigError::InvalidDuration {
        option,
        value: value.to_string(),
    };

    let trimmed = value.trim();
    if trimmed.starts_with('-') {
        return Err(ConfigError::NotPositive {
            option,
            value: value.to_string(),
        });
    }

    let mut total: u64 = 0;
    let mut pos = 0;
    let mut parts = 0;
    for caps in DURATION_PART.captures_iter(trimmed) {
        let whole = caps.get(0).ok_or_else(invalid)?;
        if !trimmed[pos..whole.start()].trim().is_empty() {
            return Err(invalid());
        }
        pos = whole.end();
        parts += 1;

        let amount: u64 = caps[1].parse().map_err(|_| invalid())?;
        let unit = match caps[2].to_ascii_lowercase().as_str() {
            "" | "s" => 1,
            "m" => 60,
            "h" => 60 * 60,
            "d" => 24 * 60 * 60,
            "w" => 7 * 24 * 60 * 60,
            _ => return Err(invalid()),
        };
        total = amount
            .checked_mul(unit)
            .and_then(|secs| total.checked_add(secs))
            .ok_or_else(invalid)?;
    }

    if parts == 0 || !trimmed[pos..].trim().is_empty() {
        return Err(invalid());
    }
    if total == 0 {
        return Err(ConfigError::NotPositive {
            option,
            value: value.to_string(),
        });
    }
    Ok(Duration::from_secs(total))
}
