use std::env;
use std::time::Duration;

use anyhow::{Context, Result};
use dotenvy::dotenv;

const DEFAULT_USER_AGENT: &str = "ats-crawler/0.1 (+contact)";

/// Crawler configuration loaded from environment variables. Every numeric
/// knob is clamped to a sane floor so a bad value cannot disable politeness.
#[derive(Debug, Clone)]
pub struct CrawlerConfig {
    pub user_agent: String,
    pub per_host_delay_ms: u64,
    pub per_host_concurrency: usize,
    pub global_concurrency: usize,
    pub request_timeout_secs: u64,
    pub request_max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub max_company_seconds: u64,
    pub robots: RobotsConfig,
    pub sitemap: SitemapConfig,
    pub daemon: DaemonConfig,
    pub canary: CanaryConfig,
}

#[derive(Debug, Clone)]
pub struct RobotsConfig {
    /// When robots.txt cannot be fetched: true treats the host as allow-all,
    /// false as disallow-all.
    pub fail_open: bool,
    /// Lets ATS adapter traffic (vendor feed endpoints, not page crawling)
    /// through a fail-closed decision while robots is unavailable.
    pub allow_ats_adapter_when_unavailable: bool,
}

#[derive(Debug, Clone)]
pub struct SitemapConfig {
    pub max_depth: u32,
    pub max_sitemaps: usize,
    pub max_urls_per_domain: usize,
}

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub enabled: bool,
    pub worker_count: usize,
    pub poll_interval_ms: u64,
    pub lock_ttl_seconds: u64,
    pub success_interval_minutes: u64,
    pub failure_backoff_minutes: Vec<u64>,
}

#[derive(Debug, Clone)]
pub struct CanaryConfig {
    pub max_requests_per_host: u32,
    pub max_total_requests: u32,
    pub max_429_rate: f64,
    pub min_requests_for_429_rate: u32,
    pub max_consecutive_errors: u32,
    pub max_attempts_per_request: u32,
    pub request_timeout_secs: u64,
    pub max_duration_secs: u64,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            per_host_delay_ms: 1000,
            per_host_concurrency: 2,
            global_concurrency: 5,
            request_timeout_secs: 60,
            request_max_retries: 2,
            retry_base_delay_ms: 250,
            retry_max_delay_ms: 2000,
            max_company_seconds: 300,
            robots: RobotsConfig {
                fail_open: false,
                allow_ats_adapter_when_unavailable: true,
            },
            sitemap: SitemapConfig {
                max_depth: 3,
                max_sitemaps: 50,
                max_urls_per_domain: 200,
            },
            daemon: DaemonConfig {
                enabled: false,
                worker_count: 8,
                poll_interval_ms: 1000,
                lock_ttl_seconds: 600,
                success_interval_minutes: 60,
                failure_backoff_minutes: vec![5, 15, 60, 360, 1440],
            },
            canary: CanaryConfig {
                max_requests_per_host: 75,
                max_total_requests: 5000,
                max_429_rate: 0.08,
                min_requests_for_429_rate: 25,
                max_consecutive_errors: 25,
                max_attempts_per_request: 1,
                request_timeout_secs: 20,
                max_duration_secs: 600,
            },
        }
    }
}

impl CrawlerConfig {
    /// Load configuration from environment variables, falling back to
    /// defaults for anything unset.
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        let defaults = Self::default();
        Ok(Self {
            user_agent: env::var("CRAWLER_USER_AGENT").unwrap_or(defaults.user_agent),
            per_host_delay_ms: env_u64("CRAWLER_PER_HOST_DELAY_MS", defaults.per_host_delay_ms)?
                .max(1),
            per_host_concurrency: env_u64(
                "CRAWLER_PER_HOST_CONCURRENCY",
                defaults.per_host_concurrency as u64,
            )?
            .max(1) as usize,
            global_concurrency: env_u64(
                "CRAWLER_GLOBAL_CONCURRENCY",
                defaults.global_concurrency as u64,
            )?
            .max(1) as usize,
            request_timeout_secs: env_u64(
                "CRAWLER_REQUEST_TIMEOUT_SECONDS",
                defaults.request_timeout_secs,
            )?
            .max(1),
            request_max_retries: env_u64(
                "CRAWLER_REQUEST_MAX_RETRIES",
                defaults.request_max_retries as u64,
            )? as u32,
            retry_base_delay_ms: env_u64(
                "CRAWLER_RETRY_BASE_DELAY_MS",
                defaults.retry_base_delay_ms,
            )?,
            retry_max_delay_ms: env_u64("CRAWLER_RETRY_MAX_DELAY_MS", defaults.retry_max_delay_ms)?,
            max_company_seconds: env_u64("CRAWLER_MAX_COMPANY_SECONDS", defaults.max_company_seconds)?
                .max(1),
            robots: RobotsConfig {
                fail_open: env_bool("CRAWLER_ROBOTS_FAIL_OPEN", defaults.robots.fail_open)?,
                allow_ats_adapter_when_unavailable: env_bool(
                    "CRAWLER_ROBOTS_ALLOW_ATS_ADAPTER_WHEN_UNAVAILABLE",
                    defaults.robots.allow_ats_adapter_when_unavailable,
                )?,
            },
            sitemap: SitemapConfig {
                max_depth: env_u64("CRAWLER_SITEMAP_MAX_DEPTH", defaults.sitemap.max_depth as u64)?
                    as u32,
                max_sitemaps: env_u64(
                    "CRAWLER_SITEMAP_MAX_SITEMAPS",
                    defaults.sitemap.max_sitemaps as u64,
                )?
                .max(1) as usize,
                max_urls_per_domain: env_u64(
                    "CRAWLER_SITEMAP_MAX_URLS_PER_DOMAIN",
                    defaults.sitemap.max_urls_per_domain as u64,
                )?
                .max(1) as usize,
            },
            daemon: DaemonConfig {
                enabled: env_bool("CRAWLER_DAEMON_ENABLED", defaults.daemon.enabled)?,
                worker_count: env_u64(
                    "CRAWLER_DAEMON_WORKER_COUNT",
                    defaults.daemon.worker_count as u64,
                )?
                .max(1) as usize,
                poll_interval_ms: env_u64(
                    "CRAWLER_DAEMON_POLL_INTERVAL_MS",
                    defaults.daemon.poll_interval_ms,
                )?
                .max(100),
                lock_ttl_seconds: env_u64(
                    "CRAWLER_DAEMON_LOCK_TTL_SECONDS",
                    defaults.daemon.lock_ttl_seconds,
                )?
                .max(1),
                success_interval_minutes: env_u64(
                    "CRAWLER_DAEMON_SUCCESS_INTERVAL_MINUTES",
                    defaults.daemon.success_interval_minutes,
                )?
                .max(1),
                failure_backoff_minutes: env_minutes_list(
                    "CRAWLER_DAEMON_FAILURE_BACKOFF_MINUTES",
                    defaults.daemon.failure_backoff_minutes,
                )?,
            },
            canary: CanaryConfig {
                max_requests_per_host: env_u64(
                    "CRAWLER_CANARY_MAX_REQUESTS_PER_HOST",
                    defaults.canary.max_requests_per_host as u64,
                )? as u32,
                max_total_requests: env_u64(
                    "CRAWLER_CANARY_MAX_TOTAL_REQUESTS",
                    defaults.canary.max_total_requests as u64,
                )? as u32,
                max_429_rate: env::var("CRAWLER_CANARY_MAX_429_RATE")
                    .ok()
                    .map(|raw| raw.parse::<f64>())
                    .transpose()
                    .context("CRAWLER_CANARY_MAX_429_RATE must be a number")?
                    .unwrap_or(defaults.canary.max_429_rate)
                    .max(0.0),
                min_requests_for_429_rate: env_u64(
                    "CRAWLER_CANARY_MIN_REQUESTS_FOR_429_RATE",
                    defaults.canary.min_requests_for_429_rate as u64,
                )?
                .max(1) as u32,
                max_consecutive_errors: env_u64(
                    "CRAWLER_CANARY_MAX_CONSECUTIVE_ERRORS",
                    defaults.canary.max_consecutive_errors as u64,
                )? as u32,
                max_attempts_per_request: env_u64(
                    "CRAWLER_CANARY_MAX_ATTEMPTS_PER_REQUEST",
                    defaults.canary.max_attempts_per_request as u64,
                )?
                .max(1) as u32,
                request_timeout_secs: env_u64(
                    "CRAWLER_CANARY_REQUEST_TIMEOUT_SECONDS",
                    defaults.canary.request_timeout_secs,
                )?
                .max(1),
                max_duration_secs: env_u64(
                    "CRAWLER_CANARY_MAX_DURATION_SECONDS",
                    defaults.canary.max_duration_secs,
                )?
                .max(1),
            },
        })
    }

    pub fn per_host_delay(&self) -> Duration {
        Duration::from_millis(self.per_host_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn env_u64(key: &str, default: u64) -> Result<u64> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .with_context(|| format!("{} must be a non-negative integer", key)),
        Err(_) => Ok(default),
    }
}

fn env_bool(key: &str, default: bool) -> Result<bool> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<bool>()
            .with_context(|| format!("{} must be true or false", key)),
        Err(_) => Ok(default),
    }
}

fn env_minutes_list(key: &str, default: Vec<u64>) -> Result<Vec<u64>> {
    match env::var(key) {
        Ok(raw) => {
            let parsed = raw
                .split(',')
                .map(|part| part.trim().parse::<u64>())
                .collect::<Result<Vec<u64>, _>>()
                .with_context(|| format!("{} must be a comma-separated list of minutes", key))?;
            if parsed.is_empty() {
                Ok(default)
            } else {
                Ok(parsed)
            }
        }
        Err(_) => Ok(default),
    }
}
