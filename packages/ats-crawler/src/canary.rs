use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;

use crate::config::CanaryConfig;
use crate::types::FetchResult;

pub const ABORT_TOTAL_BUDGET: &str = "total_request_budget_exceeded";
pub const ABORT_PER_HOST_BUDGET: &str = "per_host_request_budget_exceeded";
pub const ABORT_CONSECUTIVE_ERRORS: &str = "consecutive_error_threshold_exceeded";
pub const ABORT_RATE_LIMIT: &str = "rate_limit_threshold_exceeded";
pub const ABORT_DEADLINE: &str = "deadline_exceeded";

/// Whole-run abort signal, distinguishable from ordinary per-request
/// failures so callers can tell "this company failed" apart from
/// "stop everything now".
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("canary aborted: {reason}")]
pub struct CanaryAbort {
    pub reason: &'static str,
}

#[derive(Default)]
struct BudgetState {
    host_counts: HashMap<String, u32>,
    total_requests: u32,
    total_429: u32,
    consecutive_errors: u32,
    aborted: Option<&'static str>,
}

/// Run-scoped request budget for bounded diagnostic crawls. The handle is
/// cheap to clone and is passed explicitly through every fetch and pipeline
/// step. Once tripped it is poisoned: every subsequent check re-raises the
/// same abort.
#[derive(Clone)]
pub struct CanaryBudget {
    state: Arc<Mutex<BudgetState>>,
    limits: Arc<CanaryConfig>,
    deadline: Instant,
}

impl CanaryBudget {
    pub fn new(limits: &CanaryConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(BudgetState::default())),
            limits: Arc::new(limits.clone()),
            deadline: Instant::now() + Duration::from_secs(limits.max_duration_secs),
        }
    }

    pub fn max_attempts_per_request(&self) -> u32 {
        self.limits.max_attempts_per_request.max(1)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.limits.request_timeout_secs)
    }

    /// Admission check run before every outgoing request.
    pub fn before_request(&self, host: &str) -> Result<(), CanaryAbort> {
        let mut state = self.state.lock().unwrap();
        if let Some(reason) = state.aborted {
            return Err(CanaryAbort { reason });
        }
        if self.limits.max_total_requests > 0
            && state.total_requests >= self.limits.max_total_requests
        {
            return Err(Self::abort(&mut state, ABORT_TOTAL_BUDGET));
        }
        if self.limits.max_requests_per_host > 0 {
            let count = state.host_counts.entry(host.to_string()).or_insert(0);
            if *count >= self.limits.max_requests_per_host {
                return Err(Self::abort(&mut state, ABORT_PER_HOST_BUDGET));
            }
            *count += 1;
        }
        state.total_requests += 1;
        Ok(())
    }

    /// Observes one request outcome; may trip the error or 429-rate guards.
    pub fn record_result(&self, result: &FetchResult) -> Result<(), CanaryAbort> {
        let mut state = self.state.lock().unwrap();
        if let Some(reason) = state.aborted {
            return Err(CanaryAbort { reason });
        }
        if result.status == 429 {
            state.total_429 += 1;
        }
        let is_error =
            result.error_code.is_some() || result.status == 429 || result.status >= 500;
        if is_error {
            state.consecutive_errors += 1;
        } else {
            state.consecutive_errors = 0;
        }

        if self.limits.max_consecutive_errors > 0
            && state.consecutive_errors >= self.limits.max_consecutive_errors
        {
            return Err(Self::abort(&mut state, ABORT_CONSECUTIVE_ERRORS));
        }
        if self.limits.max_429_rate > 0.0
            && state.total_requests >= self.limits.min_requests_for_429_rate
        {
            let rate = f64::from(state.total_429) / f64::from(state.total_requests.max(1));
            if rate >= self.limits.max_429_rate {
                return Err(Self::abort(&mut state, ABORT_RATE_LIMIT));
            }
        }
        Ok(())
    }

    /// Checked at suspension points (before sends, around backoff sleeps) so
    /// an expired deadline is detected promptly.
    pub fn check_deadline(&self) -> Result<(), CanaryAbort> {
        let mut state = self.state.lock().unwrap();
        if let Some(reason) = state.aborted {
            return Err(CanaryAbort { reason });
        }
        if Instant::now() >= self.deadline {
            return Err(Self::abort(&mut state, ABORT_DEADLINE));
        }
        Ok(())
    }

    pub fn abort_reason(&self) -> Option<&'static str> {
        self.state.lock().unwrap().aborted
    }

    fn abort(state: &mut BudgetState, reason: &'static str) -> CanaryAbort {
        state.aborted = Some(reason);
        CanaryAbort { reason }
    }
}
