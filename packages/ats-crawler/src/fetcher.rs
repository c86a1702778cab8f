use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use rand::Rng;
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, Semaphore};
use tokio::time::Instant;
use tracing::debug;
use url::Url;

use crate::canary::{CanaryAbort, CanaryBudget};
use crate::config::CrawlerConfig;
use crate::host_state::HostStateStore;
use crate::types::{FetchErrorCode, FetchResult, ReasonCode};

/// Pacing extension applied to a host that answers 403 or 429.
const RATE_LIMIT_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub enum FetchMethod {
    Get,
    PostJson(String),
    PostForm(String),
}

/// One logical fetch through the polite client.
#[derive(Clone)]
pub struct FetchRequest {
    pub url: String,
    pub method: FetchMethod,
    pub accept: String,
    pub user_agent_override: Option<String>,
    pub max_bytes: Option<usize>,
    pub budget: Option<CanaryBudget>,
}

impl FetchRequest {
    pub fn get(url: impl Into<String>, accept: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: FetchMethod::Get,
            accept: accept.into(),
            user_agent_override: None,
            max_bytes: None,
            budget: None,
        }
    }

    pub fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = Some(max_bytes);
        self
    }

    pub fn with_budget(mut self, budget: Option<CanaryBudget>) -> Self {
        self.budget = budget;
        self
    }
}

/// A single wire request, after politeness has been applied.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub url: Url,
    pub method: FetchMethod,
    pub accept: String,
    pub user_agent: String,
    pub timeout: Duration,
    pub max_bytes: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub final_url: String,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub body: Vec<u8>,
    /// Body exceeded the request's byte cap and was not fully read.
    pub truncated: bool,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("i/o error: {0}")]
    Io(String),
}

/// Trait for the wire layer (to allow mocking).
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn execute(&self, request: &TransportRequest) -> Result<TransportResponse, TransportError>;
}

/// Production transport backed by reqwest.
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn execute(&self, request: &TransportRequest) -> Result<TransportResponse, TransportError> {
        let builder = match &request.method {
            FetchMethod::Get => self.client.get(request.url.clone()),
            FetchMethod::PostJson(body) => self
                .client
                .post(request.url.clone())
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body.clone()),
            FetchMethod::PostForm(body) => self
                .client
                .post(request.url.clone())
                .header(
                    reqwest::header::CONTENT_TYPE,
                    "application/x-www-form-urlencoded",
                )
                .body(body.clone()),
        };

        let response = builder
            .timeout(request.timeout)
            .header(reqwest::header::USER_AGENT, &request.user_agent)
            .header(reqwest::header::ACCEPT, &request.accept)
            .header(reqwest::header::ACCEPT_LANGUAGE, "en-US,en;q=0.8")
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = response.status().as_u16();
        let final_url = response.url().to_string();
        let content_type = header_value(&response, reqwest::header::CONTENT_TYPE);
        let content_encoding = header_value(&response, reqwest::header::CONTENT_ENCODING);

        match request.max_bytes {
            None => {
                let body = response.bytes().await.map_err(map_reqwest_error)?;
                Ok(TransportResponse {
                    status,
                    final_url,
                    content_type,
                    content_encoding,
                    body: body.to_vec(),
                    truncated: false,
                })
            }
            Some(max_bytes) => {
                let cap = max_bytes.max(1);
                // A declared Content-Length past the cap skips the read entirely.
                if let Some(length) = response.content_length() {
                    if length as usize > cap {
                        return Ok(TransportResponse {
                            status,
                            final_url,
                            content_type,
                            content_encoding,
                            body: Vec::new(),
                            truncated: true,
                        });
                    }
                }
                let mut body = Vec::with_capacity(cap.min(16 * 1024));
                let mut truncated = false;
                let mut stream = response.bytes_stream();
                while let Some(chunk) = stream.next().await {
                    let chunk = chunk.map_err(map_reqwest_error)?;
                    if body.len() + chunk.len() > cap {
                        truncated = true;
                        break;
                    }
                    body.extend_from_slice(&chunk);
                }
                Ok(TransportResponse {
                    status,
                    final_url,
                    content_type,
                    content_encoding,
                    body,
                    truncated,
                })
            }
        }
    }
}

fn header_value(response: &reqwest::Response, name: reqwest::header::HeaderName) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string())
}

fn map_reqwest_error(error: reqwest::Error) -> TransportError {
    if error.is_timeout() {
        TransportError::Timeout(error.to_string())
    } else {
        TransportError::Io(error.to_string())
    }
}

/// Rate-limited HTTP client: the sole point of per-host politeness
/// enforcement and canary budget checks. Bounds global and per-host
/// concurrency, paces requests per host, short-circuits hosts in cooldown,
/// and retries transient failures with jittered exponential backoff.
pub struct PoliteFetcher {
    config: Arc<CrawlerConfig>,
    transport: Arc<dyn HttpTransport>,
    host_state: Arc<dyn HostStateStore>,
    global_limiter: Arc<Semaphore>,
    host_limiters: Mutex<HashMap<String, Arc<Semaphore>>>,
    host_pacing: Mutex<HashMap<String, Arc<AsyncMutex<Instant>>>>,
}

impl PoliteFetcher {
    pub fn new(
        config: Arc<CrawlerConfig>,
        transport: Arc<dyn HttpTransport>,
        host_state: Arc<dyn HostStateStore>,
    ) -> Self {
        let global_limiter = Arc::new(Semaphore::new(config.global_concurrency.max(1)));
        Self {
            config,
            transport,
            host_state,
            global_limiter,
            host_limiters: Mutex::new(HashMap::new()),
            host_pacing: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get(&self, url: &str, accept: &str) -> Result<FetchResult, CanaryAbort> {
        self.fetch(&FetchRequest::get(url, accept)).await
    }

    /// Fetch with retries. Only a tripped canary budget surfaces as `Err`;
    /// every per-request failure is folded into the returned `FetchResult`.
    pub async fn fetch(&self, request: &FetchRequest) -> Result<FetchResult, CanaryAbort> {
        let max_attempts = request
            .budget
            .as_ref()
            .map(|budget| budget.max_attempts_per_request())
            .unwrap_or(1 + self.config.request_max_retries)
            .max(1);

        let mut attempt = 1;
        loop {
            let result = self.execute_once(request).await?;
            if !Self::should_retry(&result) || attempt >= max_attempts {
                self.record_final_outcome(&result).await;
                return Ok(result);
            }
            debug!(
                url = %request.url,
                attempt,
                error = %result.error_key(),
                "retrying fetch"
            );
            self.sleep_backoff(attempt, request.budget.as_ref()).await?;
            attempt += 1;
        }
    }

    async fn execute_once(&self, request: &FetchRequest) -> Result<FetchResult, CanaryAbort> {
        let started = Instant::now();
        let parsed = match normalize_url(&request.url) {
            Some(parsed) => parsed,
            None => {
                return Ok(Self::error_result(
                    request,
                    started,
                    FetchErrorCode::InvalidUrl,
                    "URL missing host or malformed".to_string(),
                ));
            }
        };
        let host = match parsed.host_str() {
            Some(host) => host.to_lowercase(),
            None => {
                return Ok(Self::error_result(
                    request,
                    started,
                    FetchErrorCode::InvalidUrl,
                    "URL missing host or malformed".to_string(),
                ));
            }
        };

        if let Some(until) = self.host_state.next_allowed_at(&host).await {
            return Ok(Self::error_result(
                request,
                started,
                FetchErrorCode::HostCooldown,
                format!("cooldown_until={}", until),
            ));
        }
        if let Some(budget) = &request.budget {
            budget.before_request(&host)?;
        }

        let _global = match self.global_limiter.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                return Ok(Self::error_result(
                    request,
                    started,
                    FetchErrorCode::IoError,
                    "global limiter closed".to_string(),
                ));
            }
        };
        let host_limiter = self.host_limiter(&host);
        let _host = match host_limiter.acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                return Ok(Self::error_result(
                    request,
                    started,
                    FetchErrorCode::IoError,
                    "host limiter closed".to_string(),
                ));
            }
        };

        self.enforce_per_host_delay(&host, request.budget.as_ref())
            .await?;

        let timeout = request
            .budget
            .as_ref()
            .map(|budget| budget.request_timeout())
            .unwrap_or_else(|| self.config.request_timeout());
        let user_agent = request
            .user_agent_override
            .clone()
            .filter(|agent| !agent.trim().is_empty())
            .unwrap_or_else(|| self.config.user_agent.clone());
        let transport_request = TransportRequest {
            url: parsed,
            method: request.method.clone(),
            accept: if request.accept.trim().is_empty() {
                "*/*".to_string()
            } else {
                request.accept.clone()
            },
            user_agent,
            timeout,
            max_bytes: request.max_bytes,
        };

        let result = match self.transport.execute(&transport_request).await {
            Ok(response) => {
                if response.status == 403 || response.status == 429 {
                    self.extend_pacing(&host, RATE_LIMIT_BACKOFF).await;
                }
                if response.truncated {
                    FetchResult {
                        requested_url: request.url.clone(),
                        final_url: Some(response.final_url),
                        status: response.status,
                        body: None,
                        content_type: response.content_type,
                        content_encoding: response.content_encoding,
                        fetched_at: Utc::now(),
                        elapsed: started.elapsed(),
                        error_code: Some(FetchErrorCode::BodyTooLarge),
                        error_message: request
                            .max_bytes
                            .map(|max_bytes| format!("max_bytes={}", max_bytes)),
                    }
                } else {
                    FetchResult {
                        requested_url: request.url.clone(),
                        final_url: Some(response.final_url),
                        status: response.status,
                        body: Some(response.body),
                        content_type: response.content_type,
                        content_encoding: response.content_encoding,
                        fetched_at: Utc::now(),
                        elapsed: started.elapsed(),
                        error_code: None,
                        error_message: None,
                    }
                }
            }
            Err(TransportError::Timeout(message)) => {
                Self::error_result(request, started, FetchErrorCode::Timeout, message)
            }
            Err(TransportError::Io(message)) => {
                Self::error_result(request, started, FetchErrorCode::IoError, message)
            }
        };

        if let Some(budget) = &request.budget {
            budget.record_result(&result)?;
        }
        Ok(result)
    }

    fn should_retry(result: &FetchResult) -> bool {
        match result.error_code {
            Some(FetchErrorCode::Timeout) | Some(FetchErrorCode::IoError) => true,
            Some(_) => false,
            // Fail fast on 429: the cooldown makes callers skip the host
            // for the rest of the run rather than hammering it.
            None => result.status == 408 || result.status >= 500,
        }
    }

    /// Host cooldown bookkeeping runs once per logical fetch, after the
    /// retry budget has been spent, so a transient timeout can be retried
    /// before the host is put on ice.
    async fn record_final_outcome(&self, result: &FetchResult) {
        let Some(host) = normalize_url(&result.requested_url)
            .and_then(|url| url.host_str().map(|host| host.to_lowercase()))
        else {
            return;
        };
        if result.is_success() {
            self.host_state.record_success(&host).await;
            return;
        }
        let category = match result.error_code {
            Some(FetchErrorCode::Timeout) => Some(ReasonCode::Timeout),
            Some(_) => None,
            None if result.status == 429 => Some(ReasonCode::Http429RateLimit),
            None if result.status == 408 => Some(ReasonCode::Timeout),
            None => None,
        };
        if let Some(category) = category {
            self.host_state.record_failure(&host, category.as_str()).await;
        }
    }

    async fn sleep_backoff(
        &self,
        attempt: u32,
        budget: Option<&CanaryBudget>,
    ) -> Result<(), CanaryAbort> {
        if let Some(budget) = budget {
            budget.check_deadline()?;
        }
        let base = self.config.retry_base_delay_ms;
        if base == 0 {
            return Ok(());
        }
        let mut delay = base.saturating_mul(1u64 << attempt.saturating_sub(1).min(16));
        if self.config.retry_max_delay_ms > 0 {
            delay = delay.min(self.config.retry_max_delay_ms);
        }
        if delay == 0 {
            return Ok(());
        }
        let jitter = {
            let mut rng = rand::thread_rng();
            rng.gen_range(0..(delay / 2).max(1))
        };
        tokio::time::sleep(Duration::from_millis(delay / 2 + jitter)).await;
        if let Some(budget) = budget {
            budget.check_deadline()?;
        }
        Ok(())
    }

    /// Serializes the check-wait-stamp sequence per host so two workers never
    /// compute the same stale wait window.
    async fn enforce_per_host_delay(
        &self,
        host: &str,
        budget: Option<&CanaryBudget>,
    ) -> Result<(), CanaryAbort> {
        let cell = self.pacing_cell(host);
        let mut next_allowed = cell.lock().await;
        let now = Instant::now();
        if *next_allowed > now {
            if let Some(budget) = budget {
                budget.check_deadline()?;
            }
            tokio::time::sleep_until(*next_allowed).await;
            if let Some(budget) = budget {
                budget.check_deadline()?;
            }
        }
        *next_allowed = Instant::now() + self.config.per_host_delay();
        Ok(())
    }

    async fn extend_pacing(&self, host: &str, duration: Duration) {
        let cell = self.pacing_cell(host);
        let mut next_allowed = cell.lock().await;
        let candidate = Instant::now() + duration;
        if candidate > *next_allowed {
            *next_allowed = candidate;
        }
    }

    fn pacing_cell(&self, host: &str) -> Arc<AsyncMutex<Instant>> {
        let mut pacing = self.host_pacing.lock().unwrap();
        pacing
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(Instant::now())))
            .clone()
    }

    fn host_limiter(&self, host: &str) -> Arc<Semaphore> {
        let mut limiters = self.host_limiters.lock().unwrap();
        limiters
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.config.per_host_concurrency.max(1))))
            .clone()
    }

    fn error_result(
        request: &FetchRequest,
        started: Instant,
        code: FetchErrorCode,
        message: String,
    ) -> FetchResult {
        FetchResult {
            requested_url: request.url.clone(),
            final_url: None,
            status: 0,
            body: None,
            content_type: None,
            content_encoding: None,
            fetched_at: Utc::now(),
            elapsed: started.elapsed(),
            error_code: Some(code),
            error_message: Some(message),
        }
    }
}

/// Normalize a raw URL, adding `https://` when no scheme is present.
pub fn normalize_url(input: &str) -> Option<Url> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }
    let candidate = if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("https://{}", trimmed)
    };
    let parsed = Url::parse(&candidate).ok()?;
    parsed.host_str()?;
    Some(parsed)
}
