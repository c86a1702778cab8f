use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

/// Cooldown ladder applied to a host after repeated failures.
const BACKOFF_STEPS: &[Duration] = &[
    Duration::from_secs(5 * 60),
    Duration::from_secs(15 * 60),
    Duration::from_secs(60 * 60),
    Duration::from_secs(360 * 60),
    Duration::from_secs(1440 * 60),
];

/// Per-host politeness state, keyed by lowercase hostname. `next_allowed_at`
/// only moves forward except on the explicit success reset.
#[derive(Debug, Clone, Default)]
pub struct HostPolitenessState {
    pub next_allowed_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub last_error_category: Option<String>,
}

/// Host cooldown bookkeeping consulted by the fetcher before every request
/// and updated after every response.
#[async_trait]
pub trait HostStateStore: Send + Sync {
    /// Returns the cooldown expiry for the host, if it is still in the future.
    async fn next_allowed_at(&self, host: &str) -> Option<DateTime<Utc>>;

    async fn record_failure(&self, host: &str, category: &str);

    async fn record_success(&self, host: &str);
}

/// Process-local host state. Politeness state is a courtesy optimization and
/// does not need to survive restart, so the production store is in-memory.
#[derive(Default)]
pub struct InMemoryHostState {
    states: Mutex<HashMap<String, HostPolitenessState>>,
}

impl InMemoryHostState {
    pub fn new() -> Self {
        Self::default()
    }

    fn backoff_for(failures: u32) -> Duration {
        let index = (failures.max(1) as usize).min(BACKOFF_STEPS.len()) - 1;
        BACKOFF_STEPS[index]
    }
}

#[async_trait]
impl HostStateStore for InMemoryHostState {
    async fn next_allowed_at(&self, host: &str) -> Option<DateTime<Utc>> {
        let key = host.trim().to_lowercase();
        let states = self.states.lock().unwrap();
        let state = states.get(&key)?;
        let next_allowed = state.next_allowed_at?;
        if next_allowed > Utc::now() {
            Some(next_allowed)
        } else {
            None
        }
    }

    async fn record_failure(&self, host: &str, category: &str) {
        let key = host.trim().to_lowercase();
        if key.is_empty() {
            return;
        }
        let mut states = self.states.lock().unwrap();
        let state = states.entry(key.clone()).or_default();
        state.consecutive_failures += 1;
        state.last_error_category = Some(category.to_string());
        let cooldown = Self::backoff_for(state.consecutive_failures);
        state.next_allowed_at = Some(Utc::now() + chrono::Duration::seconds(cooldown.as_secs() as i64));
        debug!(
            host = %key,
            failures = state.consecutive_failures,
            category = %category,
            cooldown_secs = cooldown.as_secs(),
            "host cooldown extended"
        );
    }

    async fn record_success(&self, host: &str) {
        let key = host.trim().to_lowercase();
        if key.is_empty() {
            return;
        }
        let mut states = self.states.lock().unwrap();
        if let Some(state) = states.get_mut(&key) {
            state.consecutive_failures = 0;
            state.next_allowed_at = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cooldown_ladder_is_monotone() {
        let mut previous = Duration::ZERO;
        for failures in 1..=7 {
            let step = InMemoryHostState::backoff_for(failures);
            assert!(step >= previous, "backoff shrank at {} failures", failures);
            previous = step;
        }
        // Past the table length the cooldown stays at the last step.
        assert_eq!(
            InMemoryHostState::backoff_for(10),
            InMemoryHostState::backoff_for(5)
        );
    }

    #[tokio::test]
    async fn test_failure_sets_cooldown_and_success_clears_it() {
        let store = InMemoryHostState::new();
        assert!(store.next_allowed_at("example.com").await.is_none());

        store.record_failure("example.com", "timeout").await;
        let cooldown = store.next_allowed_at("example.com").await;
        assert!(cooldown.is_some());
        assert!(cooldown.unwrap() > Utc::now());

        store.record_success("example.com").await;
        assert!(store.next_allowed_at("example.com").await.is_none());
    }

    #[tokio::test]
    async fn test_host_keys_are_normalized() {
        let store = InMemoryHostState::new();
        store.record_failure(" Example.COM ", "timeout").await;
        assert!(store.next_allowed_at("example.com").await.is_some());
    }

    #[tokio::test]
    async fn test_repeated_failures_extend_cooldown() {
        let store = InMemoryHostState::new();
        store.record_failure("example.com", "http_429").await;
        let first = store.next_allowed_at("example.com").await.unwrap();
        store.record_failure("example.com", "http_429").await;
        let second = store.next_allowed_at("example.com").await.unwrap();
        assert!(second > first);
    }
}
