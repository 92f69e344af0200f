use anyhow::{Context, Result};
use std::{env, fmt::Display, str::FromStr, time::Duration};
use tracing::{info, warn};
use utils::errors::DATABASE_URL_NOT_SET;

pub const DEFAULT_BASE_URL: &str = "https://www.reddit.com";
pub const DEFAULT_USER_AGENT: &str = "subindex-scanner/0.1 (mention indexer; read-only)";

/// Where the limiter keeps its last granted slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitBackend {
    /// Shared through the `rate_limit_state` row, so every worker process draws from one budget.
    Database,
    /// Process-local only.
    Memory,
}

impl FromStr for RateLimitBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "database" | "db" => Ok(Self::Database),
            "memory" => Ok(Self::Memory),
            other => Err(format!("unknown rate limit backend `{other}`")),
        }
    }
}

/// Scalar tuning values, read once at process start.
#[derive(Debug, Clone)]
pub struct ScannerConfig {
    pub database_url: String,
    pub base_url: String,
    pub user_agent: String,
    pub rate_limit_interval: Duration,
    pub rate_limit_backend: RateLimitBackend,
    pub request_timeout: Duration,
    pub acquire_timeout: Duration,
    pub max_transient_retries: u32,
    pub default_retry_after: Duration,
    pub initial_scan_window: Duration,
    pub rescan_window: Duration,
    pub scan_cooldown: Duration,
    pub metadata_staleness: Duration,
    pub missing_field_retry: Duration,
    pub not_found_recheck: Duration,
    pub refresh_batch_size: u64,
    pub refresh_concurrency: usize,
    pub rescan_batch_size: u64,
    pub rescan_phase_budget: Duration,
    pub cycle_sleep: Duration,
    pub idle_sleep: Duration,
    pub listing_limit: u32,
    /// Listing pages followed per target through the `after` cursor.
    pub max_listing_pages: u32,
    pub comment_limit: u32,
    pub bootstrap_schema: bool,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            rate_limit_interval: Duration::from_millis(6500),
            rate_limit_backend: RateLimitBackend::Database,
            request_timeout: Duration::from_secs(15),
            acquire_timeout: Duration::from_secs(300),
            max_transient_retries: 2,
            default_retry_after: Duration::from_secs(30),
            initial_scan_window: hours(48),
            rescan_window: hours(24),
            scan_cooldown: minutes(30),
            metadata_staleness: days(7),
            missing_field_retry: hours(6),
            not_found_recheck: days(7),
            refresh_batch_size: 50,
            refresh_concurrency: 4,
            rescan_batch_size: 25,
            rescan_phase_budget: Duration::from_secs(600),
            cycle_sleep: Duration::from_secs(600),
            idle_sleep: Duration::from_secs(60),
            listing_limit: 100,
            max_listing_pages: 10,
            comment_limit: 500,
            bootstrap_schema: false,
        }
    }
}

impl ScannerConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let database_url = env::var("DATABASE_URL").context(DATABASE_URL_NOT_SET)?;

        let rate_delay_secs: f64 = env_or("API_RATE_DELAY", 6.5);
        let rate_limit_interval = if rate_delay_secs.is_finite() && rate_delay_secs > 0.0 {
            Duration::from_secs_f64(rate_delay_secs)
        } else {
            warn!(value = rate_delay_secs, "API_RATE_DELAY must be positive, using default");
            defaults.rate_limit_interval
        };

        let config = Self {
            database_url,
            base_url: env::var("REDDIT_BASE_URL")
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or(defaults.base_url),
            user_agent: env::var("REDDIT_USER_AGENT").unwrap_or(defaults.user_agent),
            rate_limit_interval,
            rate_limit_backend: env_or("RATE_LIMIT_BACKEND", defaults.rate_limit_backend),
            request_timeout: Duration::from_secs(env_or("REQUEST_TIMEOUT_SECS", 15)),
            acquire_timeout: Duration::from_secs(env_or("ACQUIRE_TIMEOUT_SECS", 300)),
            max_transient_retries: env_or("MAX_TRANSIENT_RETRIES", defaults.max_transient_retries),
            default_retry_after: Duration::from_secs(env_or("DEFAULT_RETRY_AFTER_SECS", 30)),
            initial_scan_window: hours(env_or("INITIAL_SCAN_WINDOW_HOURS", 48)),
            rescan_window: hours(env_or("RESCAN_WINDOW_HOURS", 24)),
            scan_cooldown: minutes(env_or("SCAN_COOLDOWN_MINUTES", 30)),
            metadata_staleness: days(env_or("SUBREDDIT_META_CACHE_DAYS", 7)),
            missing_field_retry: hours(env_or("MISSING_FIELD_RETRY_HOURS", 6)),
            not_found_recheck: days(env_or("NOT_FOUND_RECHECK_DAYS", 7)),
            refresh_batch_size: env_or("REFRESH_BATCH_SIZE", defaults.refresh_batch_size),
            refresh_concurrency: env_or("REFRESH_CONCURRENCY", defaults.refresh_concurrency).max(1),
            rescan_batch_size: env_or("RESCAN_BATCH_SIZE", defaults.rescan_batch_size),
            rescan_phase_budget: Duration::from_secs(env_or("RESCAN_PHASE_SECS", 600)),
            cycle_sleep: Duration::from_secs(env_or("CYCLE_SLEEP_SECS", 600)),
            idle_sleep: Duration::from_secs(env_or("IDLE_SLEEP_SECS", 60)),
            listing_limit: env_or("LISTING_LIMIT", defaults.listing_limit).clamp(1, 100),
            max_listing_pages: env_or("MAX_LISTING_PAGES", defaults.max_listing_pages).max(1),
            comment_limit: env_or("COMMENT_LIMIT", defaults.comment_limit).max(1),
            bootstrap_schema: env_or("BOOTSTRAP_SCHEMA", false),
        };

        info!(
            base_url = %config.base_url,
            rate_limit_interval = ?config.rate_limit_interval,
            rate_limit_backend = ?config.rate_limit_backend,
            refresh_concurrency = config.refresh_concurrency,
            "Scanner config loaded"
        );

        Ok(config)
    }
}

fn minutes(m: u64) -> Duration {
    Duration::from_secs(m.saturating_mul(60))
}

fn hours(h: u64) -> Duration {
    Duration::from_secs(h.saturating_mul(60 * 60))
}

fn days(d: u64) -> Duration {
    hours(d.saturating_mul(24))
}

fn env_or<T>(key: &str, default: T) -> T
where
    T: FromStr,
    T::Err: Display,
{
    match env::var(key) {
        Ok(raw) => match raw.trim().parse::<T>() {
            Ok(value) => value,
            Err(err) => {
                warn!(key, value = %raw, error = %err, "Failed to parse config override, using default");
                default
            }
        },
        Err(_) => default,
    }
}
