use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::canary::CanaryBudget;
use crate::pipeline::CompanyCrawlRunner;
use crate::types::{top_errors, CompanyCrawlSummary, CompanyTarget};

const RUN_TOP_ERROR_LIMIT: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CrawlRunStatus {
    Completed,
    CompletedWithErrors,
    NoTargets,
    Aborted,
}

/// Aggregate outcome of one foreground crawl run: per-company summaries,
/// success/failure counts, and the abort reason if the run's canary budget
/// tripped. Operators read this shape, never raw errors.
#[derive(Debug)]
pub struct CrawlRunReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: CrawlRunStatus,
    pub abort_reason: Option<&'static str>,
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub summaries: Vec<CompanyCrawlSummary>,
    pub top_errors: Vec<(String, u32)>,
}

/// Foreground run orchestrator. Crawls a batch of companies on a bounded
/// per-run pool, separate from the daemon workers but sharing the same
/// fetcher and host politeness state. An optional canary budget is shared
/// by every company in the run, so a single trip unwinds the whole run.
pub struct CrawlOrchestrator {
    runner: Arc<dyn CompanyCrawlRunner>,
    parallelism: usize,
}

impl CrawlOrchestrator {
    pub fn new(runner: Arc<dyn CompanyCrawlRunner>, parallelism: usize) -> Self {
        Self {
            runner,
            parallelism: parallelism.max(1),
        }
    }

    pub async fn run(
        &self,
        targets: Vec<CompanyTarget>,
        budget: Option<CanaryBudget>,
    ) -> CrawlRunReport {
        let started_at = Utc::now();
        if targets.is_empty() {
            return CrawlRunReport {
                started_at,
                finished_at: Utc::now(),
                status: CrawlRunStatus::NoTargets,
                abort_reason: None,
                attempted: 0,
                succeeded: 0,
                failed: 0,
                summaries: Vec::new(),
                top_errors: Vec::new(),
            };
        }

        let attempted = targets.len();
        info!(
            companies = attempted,
            parallelism = self.parallelism,
            budgeted = budget.is_some(),
            "crawl run starting"
        );

        let semaphore = Arc::new(Semaphore::new(self.parallelism));
        let mut handles = Vec::with_capacity(attempted);
        for target in targets {
            let runner = self.runner.clone();
            let sem = semaphore.clone();
            let budget = budget.clone();
            handles.push(tokio::spawn(async move {
                let _permit = sem.acquire_owned().await.ok()?;
                let outcome = runner.crawl_company(&target, budget.as_ref()).await;
                Some((target, outcome))
            }));
        }

        let mut summaries = Vec::with_capacity(attempted);
        let mut errors: HashMap<String, u32> = HashMap::new();
        let mut succeeded = 0usize;
        let mut failed = 0usize;
        let mut abort_reason: Option<&'static str> = None;
        for handle in futures::future::join_all(handles).await {
            let Ok(Some((target, outcome))) = handle else {
                failed += 1;
                *errors.entry("company_crawl_exception".to_string()).or_insert(0) += 1;
                continue;
            };
            match outcome {
                Ok(summary) => {
                    if summary.closeout_safe {
                        succeeded += 1;
                    } else {
                        failed += 1;
                    }
                    for (key, count) in &summary.top_errors {
                        *errors.entry(key.clone()).or_insert(0) += count;
                    }
                    summaries.push(summary);
                }
                Err(abort) => {
                    // The first trip wins; the poisoned budget makes the
                    // remaining companies re-raise the same reason.
                    if abort_reason.is_none() {
                        warn!(
                            company_id = target.company_id,
                            reason = abort.reason,
                            "crawl run aborted"
                        );
                    }
                    abort_reason.get_or_insert(abort.reason);
                    failed += 1;
                }
            }
        }

        let status = if abort_reason.is_some() {
            CrawlRunStatus::Aborted
        } else if failed > 0 {
            CrawlRunStatus::CompletedWithErrors
        } else {
            CrawlRunStatus::Completed
        };
        let report = CrawlRunReport {
            started_at,
            finished_at: Utc::now(),
            status,
            abort_reason,
            attempted,
            succeeded,
            failed,
            summaries,
            top_errors: top_errors(&errors, RUN_TOP_ERROR_LIMIT),
        };
        info!(
            status = ?report.status,
            succeeded = report.succeeded,
            failed = report.failed,
            abort_reason = report.abort_reason.unwrap_or(""),
            "crawl run finished"
        );
        report
    }
}
