use std::borrow::Cow;
use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

/// Applicant tracking system vendors this engine can fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AtsType {
    Workday,
    Greenhouse,
    Lever,
    SmartRecruiters,
    Unknown,
}

impl AtsType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AtsType::Workday => "workday",
            AtsType::Greenhouse => "greenhouse",
            AtsType::Lever => "lever",
            AtsType::SmartRecruiters => "smartrecruiters",
            AtsType::Unknown => "unknown",
        }
    }
}

/// A normalized ATS endpoint detection. Immutable value, deduplicated by
/// `(ats_type, lowercased endpoint_url)` with first discovery winning.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AtsDetectionRecord {
    pub ats_type: AtsType,
    pub endpoint_url: String,
}

impl AtsDetectionRecord {
    pub fn new(ats_type: AtsType, endpoint_url: impl Into<String>) -> Self {
        Self {
            ats_type,
            endpoint_url: endpoint_url.into(),
        }
    }

    pub fn dedupe_key(&self) -> String {
        format!("{}|{}", self.ats_type.as_str(), self.endpoint_url.to_lowercase())
    }
}

/// A company due for crawling, supplied by the resolution layer.
/// The engine never decides which companies exist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompanyTarget {
    pub company_id: i64,
    pub ticker: String,
    pub domain: String,
    pub careers_hint_url: Option<String>,
}

/// Closed set of fetch-level error codes. Application-level classification
/// (4xx vs 5xx and so on) happens in callers via the HTTP status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchErrorCode {
    Timeout,
    IoError,
    HostCooldown,
    BodyTooLarge,
    InvalidUrl,
}

impl FetchErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FetchErrorCode::Timeout => "timeout",
            FetchErrorCode::IoError => "io_error",
            FetchErrorCode::HostCooldown => "host_cooldown",
            FetchErrorCode::BodyTooLarge => "body_too_large",
            FetchErrorCode::InvalidUrl => "invalid_url",
        }
    }
}

/// The uniform fetch outcome every higher-level step consumes.
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub requested_url: String,
    pub final_url: Option<String>,
    pub status: u16,
    pub body: Option<Vec<u8>>,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub fetched_at: DateTime<Utc>,
    pub elapsed: Duration,
    pub error_code: Option<FetchErrorCode>,
    pub error_message: Option<String>,
}

impl FetchResult {
    pub fn is_success(&self) -> bool {
        self.error_code.is_none() && (200..300).contains(&self.status)
    }

    pub fn final_url_or_requested(&self) -> &str {
        self.final_url.as_deref().unwrap_or(&self.requested_url)
    }

    pub fn body_text(&self) -> Option<Cow<'_, str>> {
        self.body.as_deref().map(String::from_utf8_lossy)
    }

    /// Stable key for error tallies: the error code, or `http_{status}`.
    pub fn error_key(&self) -> String {
        if let Some(code) = self.error_code {
            return code.as_str().to_string();
        }
        if self.status > 0 {
            return format!("http_{}", self.status);
        }
        "unknown_error".to_string()
    }
}

/// Closed failure taxonomy used for host cooldown categories and
/// operator-facing diagnostics. Retryability is a property of the reason,
/// not of the individual error string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReasonCode {
    RobotsBlocked,
    SitemapNotFound,
    Timeout,
    DnsFailure,
    TlsFailure,
    Http401_403,
    Http404,
    Http429RateLimit,
    Http5xx,
    ParsingFailed,
    HostCooldown,
    Unknown,
}

impl ReasonCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasonCode::RobotsBlocked => "robots_blocked",
            ReasonCode::SitemapNotFound => "sitemap_not_found",
            ReasonCode::Timeout => "timeout",
            ReasonCode::DnsFailure => "dns_failure",
            ReasonCode::TlsFailure => "tls_failure",
            ReasonCode::Http401_403 => "http_401_403",
            ReasonCode::Http404 => "http_404",
            ReasonCode::Http429RateLimit => "http_429_rate_limit",
            ReasonCode::Http5xx => "http_5xx",
            ReasonCode::ParsingFailed => "parsing_failed",
            ReasonCode::HostCooldown => "host_cooldown",
            ReasonCode::Unknown => "unknown",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ReasonCode::Timeout
                | ReasonCode::DnsFailure
                | ReasonCode::TlsFailure
                | ReasonCode::Http429RateLimit
                | ReasonCode::Http5xx
        )
    }

    pub fn from_fetch(result: &FetchResult) -> Self {
        match result.error_code {
            Some(FetchErrorCode::Timeout) => ReasonCode::Timeout,
            Some(FetchErrorCode::HostCooldown) => ReasonCode::HostCooldown,
            Some(FetchErrorCode::IoError) => {
                let message = result
                    .error_message
                    .as_deref()
                    .unwrap_or("")
                    .to_lowercase();
                if message.contains("dns")
                    || message.contains("name or service not known")
                    || message.contains("no such host")
                {
                    ReasonCode::DnsFailure
                } else if message.contains("ssl")
                    || message.contains("tls")
                    || message.contains("handshake")
                    || message.contains("certificate")
                {
                    ReasonCode::TlsFailure
                } else {
                    ReasonCode::Unknown
                }
            }
            Some(_) => ReasonCode::Unknown,
            None => Self::from_status(result.status),
        }
    }

    pub fn from_status(status: u16) -> Self {
        match status {
            401 | 403 => ReasonCode::Http401_403,
            404 => ReasonCode::Http404,
            408 => ReasonCode::Timeout,
            429 => ReasonCode::Http429RateLimit,
            500..=599 => ReasonCode::Http5xx,
            _ => ReasonCode::Unknown,
        }
    }

    /// Classify an error-tally key (the strings accumulated during a
    /// company crawl) into the closed taxonomy.
    pub fn from_error_key(key: &str) -> Self {
        let lower = key.trim().to_lowercase();
        if lower.is_empty() {
            return ReasonCode::Unknown;
        }
        if lower.contains("blocked_by_robots") {
            return ReasonCode::RobotsBlocked;
        }
        if lower.contains("host_cooldown") {
            return ReasonCode::HostCooldown;
        }
        if lower.contains("no_sitemaps")
            || lower.contains("sitemap_no_urls")
            || lower.contains("no_candidate_urls")
            || lower.contains("sitemap_fetch_failed")
        {
            return ReasonCode::SitemapNotFound;
        }
        if lower.contains("parse")
            || lower.contains("gzip_decode_error")
            || lower.contains("empty_sitemap_payload")
        {
            return ReasonCode::ParsingFailed;
        }
        if lower.contains("time_budget") || lower.contains("budget_exceeded") {
            return ReasonCode::Timeout;
        }
        if lower.contains("timeout") {
            return ReasonCode::Timeout;
        }
        match parse_http_status_key(&lower) {
            Some(status) => Self::from_status(status),
            None => ReasonCode::Unknown,
        }
    }
}

fn parse_http_status_key(key: &str) -> Option<u16> {
    let idx = key.rfind("http_")?;
    let digits: String = key[idx + 5..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

/// One `<url><loc>` entry discovered from a sitemap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SitemapUrlEntry {
    pub url: String,
    pub lastmod: Option<String>,
}

/// Record of one fetched sitemap document. `url_count` is the number of
/// *new* URLs this sitemap contributed, not a cumulative total.
#[derive(Debug, Clone)]
pub struct SitemapFetchRecord {
    pub sitemap_url: String,
    pub fetched_at: DateTime<Utc>,
    pub url_count: usize,
}

/// Transient output of one sitemap discovery pass.
#[derive(Debug, Default)]
pub struct SitemapDiscoveryResult {
    pub fetched_sitemaps: Vec<SitemapFetchRecord>,
    pub discovered_urls: Vec<SitemapUrlEntry>,
    pub errors: HashMap<String, u32>,
}

/// Per-company crawl outcome reported back to the work queue.
#[derive(Debug, Clone)]
pub struct CompanyCrawlSummary {
    pub company_id: i64,
    pub ticker: String,
    pub domain: String,
    pub sitemaps_fetched: usize,
    pub candidate_url_count: usize,
    pub detections: Vec<AtsDetectionRecord>,
    pub closeout_safe: bool,
    pub top_errors: Vec<(String, u32)>,
}

impl CompanyCrawlSummary {
    /// The dominant failure reason, classified from the most frequent
    /// error key.
    pub fn primary_reason(&self) -> ReasonCode {
        self.top_errors
            .first()
            .map(|(key, _)| ReasonCode::from_error_key(key))
            .unwrap_or(ReasonCode::Unknown)
    }

    /// Compact error summary suitable for the queue's `last_error` column.
    pub fn error_summary(&self) -> String {
        if self.top_errors.is_empty() {
            return "company_crawl_failed".to_string();
        }
        let mut summary = self
            .top_errors
            .iter()
            .take(3)
            .map(|(key, _)| key.as_str())
            .collect::<Vec<_>>()
            .join(",");
        summary.truncate(500);
        summary
    }
}

/// Operational visibility into the crawl queue.
#[derive(Debug, Clone, Serialize)]
pub struct CrawlQueueStats {
    pub due_count: i64,
    pub locked_count: i64,
    pub next_due_at: Option<DateTime<Utc>>,
    pub recent_errors: Vec<QueueErrorSample>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueErrorSample {
    pub company_id: i64,
    pub last_error: Option<String>,
    pub last_finished_at: Option<DateTime<Utc>>,
    pub consecutive_failures: i32,
}

/// Coarse classification of a discovered URL, used to pick probe candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveredUrlKind {
    CandidateJob,
    AtsLanding,
    Other,
}

impl DiscoveredUrlKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscoveredUrlKind::CandidateJob => "candidate_job",
            DiscoveredUrlKind::AtsLanding => "ats_landing",
            DiscoveredUrlKind::Other => "other",
        }
    }
}

const JOB_PATH_HINTS: &[&str] = &[
    "/careers",
    "/jobs",
    "/job",
    "/openings",
    "/positions",
    "/job-search",
    "/search-jobs",
];

pub fn classify_url(url: &str) -> DiscoveredUrlKind {
    let parsed = match Url::parse(url) {
        Ok(parsed) => parsed,
        Err(_) => return DiscoveredUrlKind::Other,
    };
    let host = match parsed.host_str() {
        Some(host) => host.to_lowercase(),
        None => return DiscoveredUrlKind::Other,
    };
    if is_ats_host(&host) {
        return DiscoveredUrlKind::AtsLanding;
    }
    let path = parsed.path().to_lowercase();
    if JOB_PATH_HINTS.iter().any(|hint| path.contains(hint)) {
        return DiscoveredUrlKind::CandidateJob;
    }
    DiscoveredUrlKind::Other
}

pub fn is_ats_host(host: &str) -> bool {
    let h = host.to_lowercase();
    h.ends_with("myworkdayjobs.com")
        || h.contains("workdayjobs")
        || h.contains("greenhouse.io")
        || h.contains("grnh.se")
        || h.contains("jobs.lever.co")
        || h.contains("api.lever.co")
        || h.contains("smartrecruiters.com")
}

/// Increment a key in an error tally map.
pub fn bump_error(errors: &mut HashMap<String, u32>, key: impl Into<String>) {
    *errors.entry(key.into()).or_insert(0) += 1;
}

/// The `limit` most frequent error keys, highest count first.
pub fn top_errors(errors: &HashMap<String, u32>, limit: usize) -> Vec<(String, u32)> {
    let mut entries: Vec<(String, u32)> = errors.iter().map(|(k, v)| (k.clone(), *v)).collect();
    entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    entries.truncate(limit);
    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_url() {
        assert_eq!(
            classify_url("https://boards.greenhouse.io/acme"),
            DiscoveredUrlKind::AtsLanding
        );
        assert_eq!(
            classify_url("https://example.com/careers/openings"),
            DiscoveredUrlKind::CandidateJob
        );
        assert_eq!(
            classify_url("https://example.com/about"),
            DiscoveredUrlKind::Other
        );
        assert_eq!(classify_url("not a url"), DiscoveredUrlKind::Other);
    }

    #[test]
    fn test_dedupe_key_is_case_insensitive() {
        let a = AtsDetectionRecord::new(AtsType::Lever, "https://jobs.lever.co/Acme");
        let b = AtsDetectionRecord::new(AtsType::Lever, "https://jobs.lever.co/acme");
        assert_eq!(a.dedupe_key(), b.dedupe_key());
    }

    #[test]
    fn test_top_errors_orders_by_count() {
        let mut errors = HashMap::new();
        bump_error(&mut errors, "timeout");
        bump_error(&mut errors, "timeout");
        bump_error(&mut errors, "http_404");
        let top = top_errors(&errors, 5);
        assert_eq!(top[0], ("timeout".to_string(), 2));
        assert_eq!(top[1], ("http_404".to_string(), 1));
    }

    #[test]
    fn test_reason_code_from_error_keys() {
        assert_eq!(
            ReasonCode::from_error_key("blocked_by_robots"),
            ReasonCode::RobotsBlocked
        );
        assert_eq!(
            ReasonCode::from_error_key("gzip_decode_error"),
            ReasonCode::ParsingFailed
        );
        assert_eq!(
            ReasonCode::from_error_key("sitemap_fetch_failed"),
            ReasonCode::SitemapNotFound
        );
        assert_eq!(
            ReasonCode::from_error_key("company_time_budget_exceeded"),
            ReasonCode::Timeout
        );
        assert_eq!(ReasonCode::from_error_key("http_404"), ReasonCode::Http404);
        assert_eq!(
            ReasonCode::from_error_key("http_429_rate_limit"),
            ReasonCode::Http429RateLimit
        );
        assert_eq!(ReasonCode::from_error_key("weird"), ReasonCode::Unknown);
    }

    #[test]
    fn test_reason_code_retryability() {
        assert!(ReasonCode::Timeout.is_retryable());
        assert!(ReasonCode::Http5xx.is_retryable());
        assert!(ReasonCode::Http429RateLimit.is_retryable());
        assert!(!ReasonCode::RobotsBlocked.is_retryable());
        assert!(!ReasonCode::Http404.is_retryable());
        assert!(!ReasonCode::HostCooldown.is_retryable());
    }

    #[test]
    fn test_reason_code_from_io_error_message() {
        let mut result = FetchResult {
            requested_url: "https://example.com".to_string(),
            final_url: None,
            status: 0,
            body: None,
            content_type: None,
            content_encoding: None,
            fetched_at: Utc::now(),
            elapsed: Duration::from_millis(1),
            error_code: Some(FetchErrorCode::IoError),
            error_message: Some("dns error: no such host".to_string()),
        };
        assert_eq!(ReasonCode::from_fetch(&result), ReasonCode::DnsFailure);
        result.error_message = Some("tls handshake failed".to_string());
        assert_eq!(ReasonCode::from_fetch(&result), ReasonCode::TlsFailure);
        result.error_message = Some("connection reset by peer".to_string());
        assert_eq!(ReasonCode::from_fetch(&result), ReasonCode::Unknown);
    }

    #[test]
    fn test_error_key_prefers_error_code() {
        let result = FetchResult {
            requested_url: "https://example.com".to_string(),
            final_url: None,
            status: 0,
            body: None,
            content_type: None,
            content_encoding: None,
            fetched_at: Utc::now(),
            elapsed: Duration::from_millis(1),
            error_code: Some(FetchErrorCode::Timeout),
            error_message: None,
        };
        assert_eq!(result.error_key(), "timeout");
    }
}
