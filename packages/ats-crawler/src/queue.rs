use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::Rng;
use sqlx::{PgPool, Row};

use crate::config::DaemonConfig;
use crate::types::{CrawlQueueStats, QueueErrorSample};

/// Backoff duration for a company that has failed `failures_so_far` times
/// before the current one. Monotonically non-decreasing up to the table
/// length, then constant.
pub fn failure_backoff(failures_so_far: u32, backoff_minutes: &[u64]) -> Duration {
    if backoff_minutes.is_empty() {
        return Duration::from_secs(5 * 60);
    }
    let index = (failures_so_far as usize).min(backoff_minutes.len() - 1);
    Duration::from_secs(backoff_minutes[index].max(1) * 60)
}

/// Next failure reschedule time: the backoff step plus a small random jitter
/// so companies that failed at the same tick do not retry in lockstep.
pub fn next_failure_run_at(failures_so_far: u32, backoff_minutes: &[u64]) -> DateTime<Utc> {
    let backoff = failure_backoff(failures_so_far, backoff_minutes);
    let jitter_secs = rand::thread_rng().gen_range(5..30);
    Utc::now()
        + ChronoDuration::seconds(backoff.as_secs() as i64)
        + ChronoDuration::seconds(jitter_secs)
}

/// Durable, lease-based queue of companies due for crawling. One entry per
/// company; entries are never deleted during normal operation.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Atomically claim one due, unlocked entry. Exactly one concurrent
    /// caller wins a given entry.
    async fn claim(&self, lock_owner: &str, lock_ttl: Duration) -> Result<Option<i64>>;

    /// Clear the lease, reset failures, reschedule at the success interval.
    async fn mark_success(&self, company_id: i64) -> Result<()>;

    /// Clear the lease, bump failures, reschedule with table backoff + jitter.
    async fn mark_failure(&self, company_id: i64, error: &str) -> Result<()>;

    /// Clear the lease without touching the schedule.
    async fn release(&self, company_id: i64) -> Result<()>;

    /// Insert one entry per known company with `next_run_at = now` if
    /// absent; existing entries are left untouched.
    async fn bootstrap(&self) -> Result<u64>;

    async fn stats(&self, error_sample_limit: i64) -> Result<CrawlQueueStats>;
}

/// PostgreSQL-backed queue. The claim uses `FOR UPDATE SKIP LOCKED` so the
/// durable store, not in-process coordination, arbitrates between workers.
pub struct PostgresWorkQueue {
    pool: PgPool,
    config: DaemonConfig,
}

impl PostgresWorkQueue {
    pub fn new(pool: PgPool, config: DaemonConfig) -> Self {
        Self { pool, config }
    }
}

#[async_trait]
impl WorkQueue for PostgresWorkQueue {
    async fn claim(&self, lock_owner: &str, lock_ttl: Duration) -> Result<Option<i64>> {
        let owner = if lock_owner.trim().is_empty() {
            "unknown"
        } else {
            lock_owner.trim()
        };
        let row = sqlx::query(
            r#"
            WITH candidate AS (
                SELECT company_id
                FROM crawl_queue
                WHERE next_run_at <= NOW()
                  AND (locked_until IS NULL OR locked_until < NOW())
                ORDER BY next_run_at ASC
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            UPDATE crawl_queue cq
            SET locked_until = NOW() + ($1 || ' seconds')::INTERVAL,
                lock_owner = $2,
                lock_count = cq.lock_count + 1,
                last_started_at = NOW(),
                updated_at = NOW()
            FROM candidate
            WHERE cq.company_id = candidate.company_id
            RETURNING cq.company_id
            "#,
        )
        .bind(lock_ttl.as_secs().max(1).to_string())
        .bind(owner)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to claim crawl queue entry")?;

        Ok(row.map(|row| row.get("company_id")))
    }

    async fn mark_success(&self, company_id: i64) -> Result<()> {
        let next_run_at =
            Utc::now() + ChronoDuration::minutes(self.config.success_interval_minutes.max(1) as i64);
        sqlx::query(
            r#"
            UPDATE crawl_queue
            SET next_run_at = $1,
                locked_until = NULL,
                lock_owner = NULL,
                last_finished_at = NOW(),
                last_success_at = NOW(),
                last_error = NULL,
                consecutive_failures = 0,
                total_runs = total_runs + 1,
                total_successes = total_successes + 1,
                updated_at = NOW()
            WHERE company_id = $2
            "#,
        )
        .bind(next_run_at)
        .bind(company_id)
        .execute(&self.pool)
        .await
        .context("Failed to mark crawl queue success")?;
        Ok(())
    }

    async fn mark_failure(&self, company_id: i64, error: &str) -> Result<()> {
        let failures: Option<i32> =
            sqlx::query_scalar("SELECT consecutive_failures FROM crawl_queue WHERE company_id = $1")
                .bind(company_id)
                .fetch_optional(&self.pool)
                .await
                .context("Failed to read consecutive failures")?;
        let next_run_at = next_failure_run_at(
            failures.unwrap_or(0).max(0) as u32,
            &self.config.failure_backoff_minutes,
        );
        sqlx::query(
            r#"
            UPDATE crawl_queue
            SET next_run_at = $1,
                locked_until = NULL,
                lock_owner = NULL,
                last_finished_at = NOW(),
                last_error = $2,
                consecutive_failures = consecutive_failures + 1,
                total_runs = total_runs + 1,
                total_failures = total_failures + 1,
                updated_at = NOW()
            WHERE company_id = $3
            "#,
        )
        .bind(next_run_at)
        .bind(error)
        .bind(company_id)
        .execute(&self.pool)
        .await
        .context("Failed to mark crawl queue failure")?;
        Ok(())
    }

    async fn release(&self, company_id: i64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE crawl_queue
            SET locked_until = NULL,
                lock_owner = NULL,
                updated_at = NOW()
            WHERE company_id = $1
            "#,
        )
        .bind(company_id)
        .execute(&self.pool)
        .await
        .context("Failed to release crawl queue lock")?;
        Ok(())
    }

    async fn bootstrap(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            INSERT INTO crawl_queue (company_id, next_run_at, updated_at)
            SELECT id, NOW(), NOW()
            FROM companies
            ON CONFLICT (company_id) DO NOTHING
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to bootstrap crawl queue")?;
        Ok(result.rows_affected())
    }

    async fn stats(&self, error_sample_limit: i64) -> Result<CrawlQueueStats> {
        let due_count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM crawl_queue
            WHERE next_run_at <= NOW()
              AND (locked_until IS NULL OR locked_until < NOW())
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .context("Failed to count due queue entries")?;

        let locked_count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM crawl_queue
            WHERE locked_until IS NOT NULL
              AND locked_until > NOW()
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .context("Failed to count locked queue entries")?;

        let next_due_at: Option<DateTime<Utc>> =
            sqlx::query_scalar("SELECT MIN(next_run_at) FROM crawl_queue")
                .fetch_one(&self.pool)
                .await
                .context("Failed to read next due time")?;

        let recent_errors = sqlx::query(
            r#"
            SELECT company_id, last_error, last_finished_at, consecutive_failures
            FROM crawl_queue
            WHERE last_error IS NOT NULL
            ORDER BY last_finished_at DESC NULLS LAST
            LIMIT $1
            "#,
        )
        .bind(error_sample_limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to load queue error samples")?
        .into_iter()
        .map(|row| QueueErrorSample {
            company_id: row.get("company_id"),
            last_error: row.get("last_error"),
            last_finished_at: row.get("last_finished_at"),
            consecutive_failures: row.get("consecutive_failures"),
        })
        .collect();

        Ok(CrawlQueueStats {
            due_count,
            locked_count,
            next_due_at,
            recent_errors,
        })
    }
}

#[derive(Debug, Clone, Default)]
struct MemoryEntry {
    next_run_at: Option<DateTime<Utc>>,
    locked_until: Option<DateTime<Utc>>,
    lock_owner: Option<String>,
    last_error: Option<String>,
    last_finished_at: Option<DateTime<Utc>>,
    consecutive_failures: i32,
    total_runs: i64,
    total_successes: i64,
    total_failures: i64,
}

/// In-memory queue with the same semantics, for tests and for embedded use
/// where a single process acts as the claim arbiter. One mutex makes every
/// claim atomic.
pub struct InMemoryWorkQueue {
    entries: Mutex<HashMap<i64, MemoryEntry>>,
    config: DaemonConfig,
}

impl InMemoryWorkQueue {
    pub fn new(config: DaemonConfig) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Register a company as due now. Idempotent: an existing entry is
    /// left untouched.
    pub fn insert_company(&self, company_id: i64) {
        let mut entries = self.entries.lock().unwrap();
        entries.entry(company_id).or_insert_with(|| MemoryEntry {
            next_run_at: Some(Utc::now()),
            ..Default::default()
        });
    }

    pub fn consecutive_failures(&self, company_id: i64) -> i32 {
        self.entries
            .lock()
            .unwrap()
            .get(&company_id)
            .map(|entry| entry.consecutive_failures)
            .unwrap_or(0)
    }

    pub fn next_run_at(&self, company_id: i64) -> Option<DateTime<Utc>> {
        self.entries
            .lock()
            .unwrap()
            .get(&company_id)
            .and_then(|entry| entry.next_run_at)
    }

    pub fn lock_owner(&self, company_id: i64) -> Option<String> {
        self.entries
            .lock()
            .unwrap()
            .get(&company_id)
            .and_then(|entry| entry.lock_owner.clone())
    }

    /// `(total_runs, total_successes, total_failures)` for one entry.
    pub fn run_counters(&self, company_id: i64) -> (i64, i64, i64) {
        self.entries
            .lock()
            .unwrap()
            .get(&company_id)
            .map(|entry| (entry.total_runs, entry.total_successes, entry.total_failures))
            .unwrap_or((0, 0, 0))
    }
}

#[async_trait]
impl WorkQueue for InMemoryWorkQueue {
    async fn claim(&self, lock_owner: &str, lock_ttl: Duration) -> Result<Option<i64>> {
        let now = Utc::now();
        let mut entries = self.entries.lock().unwrap();
        let candidate = entries
            .iter()
            .filter(|(_, entry)| {
                entry.next_run_at.map(|at| at <= now).unwrap_or(false)
                    && entry.locked_until.map(|until| until < now).unwrap_or(true)
            })
            .min_by_key(|(_, entry)| entry.next_run_at)
            .map(|(id, _)| *id);
        if let Some(company_id) = candidate {
            let entry = entries.get_mut(&company_id).unwrap();
            entry.locked_until =
                Some(now + ChronoDuration::seconds(lock_ttl.as_secs().max(1) as i64));
            entry.lock_owner = Some(lock_owner.to_string());
            return Ok(Some(company_id));
        }
        Ok(None)
    }

    async fn mark_success(&self, company_id: i64) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get_mut(&company_id) {
            entry.next_run_at = Some(
                Utc::now()
                    + ChronoDuration::minutes(self.config.success_interval_minutes.max(1) as i64),
            );
            entry.locked_until = None;
            entry.lock_owner = None;
            entry.last_error = None;
            entry.last_finished_at = Some(Utc::now());
            entry.consecutive_failures = 0;
            entry.total_runs += 1;
            entry.total_successes += 1;
        }
        Ok(())
    }

    async fn mark_failure(&self, company_id: i64, error: &str) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get_mut(&company_id) {
            let next_run_at = next_failure_run_at(
                entry.consecutive_failures.max(0) as u32,
                &self.config.failure_backoff_minutes,
            );
            entry.next_run_at = Some(next_run_at);
            entry.locked_until = None;
            entry.lock_owner = None;
            entry.last_error = Some(error.to_string());
            entry.last_finished_at = Some(Utc::now());
            entry.consecutive_failures += 1;
            entry.total_runs += 1;
            entry.total_failures += 1;
        }
        Ok(())
    }

    async fn release(&self, company_id: i64) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get_mut(&company_id) {
            entry.locked_until = None;
            entry.lock_owner = None;
        }
        Ok(())
    }

    async fn bootstrap(&self) -> Result<u64> {
        Ok(0)
    }

    async fn stats(&self, error_sample_limit: i64) -> Result<CrawlQueueStats> {
        let now = Utc::now();
        let entries = self.entries.lock().unwrap();
        let due_count = entries
            .values()
            .filter(|entry| {
                entry.next_run_at.map(|at| at <= now).unwrap_or(false)
                    && entry.locked_until.map(|until| until < now).unwrap_or(true)
            })
            .count() as i64;
        let locked_count = entries
            .values()
            .filter(|entry| entry.locked_until.map(|until| until > now).unwrap_or(false))
            .count() as i64;
        let next_due_at = entries.values().filter_map(|entry| entry.next_run_at).min();
        let mut recent: Vec<(&i64, &MemoryEntry)> = entries
            .iter()
            .filter(|(_, entry)| entry.last_error.is_some())
            .collect();
        recent.sort_by_key(|(_, entry)| std::cmp::Reverse(entry.last_finished_at));
        let recent_errors = recent
            .into_iter()
            .take(error_sample_limit.max(0) as usize)
            .map(|(id, entry)| QueueErrorSample {
                company_id: *id,
                last_error: entry.last_error.clone(),
                last_finished_at: entry.last_finished_at,
                consecutive_failures: entry.consecutive_failures,
            })
            .collect();
        Ok(CrawlQueueStats {
            due_count,
            locked_count,
            next_due_at,
            recent_errors,
        })
    }
}
