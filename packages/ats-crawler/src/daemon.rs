use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::DaemonConfig;
use crate::pipeline::CompanyCrawlRunner;
use crate::queue::WorkQueue;
use crate::storage::CrawlStorage;
use crate::types::CrawlQueueStats;

const ERROR_SAMPLE_LIMIT: i64 = 5;

#[derive(Debug, Clone, Serialize)]
pub struct DaemonStatus {
    pub running: bool,
    pub worker_count: usize,
    pub queue: CrawlQueueStats,
}

/// Fixed pool of daemon workers, each looping claim → crawl → reschedule.
/// A stop signal prevents new claims immediately; in-flight companies
/// finish, and abandoned leases simply expire for later reclaim.
pub struct CrawlDaemon {
    queue: Arc<dyn WorkQueue>,
    storage: Arc<dyn CrawlStorage>,
    runner: Arc<dyn CompanyCrawlRunner>,
    config: DaemonConfig,
    instance_id: String,
    running: AtomicBool,
}

impl CrawlDaemon {
    pub fn new(
        queue: Arc<dyn WorkQueue>,
        storage: Arc<dyn CrawlStorage>,
        runner: Arc<dyn CompanyCrawlRunner>,
        config: DaemonConfig,
    ) -> Self {
        Self {
            queue,
            storage,
            runner,
            config,
            instance_id: format!("daemon-{}", Uuid::new_v4()),
            running: AtomicBool::new(false),
        }
    }

    pub async fn status(&self) -> DaemonStatus {
        let queue = match self.queue.stats(ERROR_SAMPLE_LIMIT).await {
            Ok(stats) => stats,
            Err(error) => {
                warn!(error = %error, "failed to load crawl queue stats");
                CrawlQueueStats {
                    due_count: 0,
                    locked_count: 0,
                    next_due_at: None,
                    recent_errors: Vec::new(),
                }
            }
        };
        DaemonStatus {
            running: self.running.load(Ordering::SeqCst),
            worker_count: self.config.worker_count,
            queue,
        }
    }

    /// Run the worker pool until the shutdown token fires.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        info!(
            instance_id = %self.instance_id,
            workers = self.config.worker_count,
            "crawl daemon starting"
        );
        self.running.store(true, Ordering::SeqCst);

        let mut handles = Vec::with_capacity(self.config.worker_count);
        for index in 0..self.config.worker_count {
            let daemon = self.clone();
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                daemon.worker_loop(index + 1, shutdown).await;
            }));
        }
        futures::future::join_all(handles).await;

        self.running.store(false, Ordering::SeqCst);
        info!(instance_id = %self.instance_id, "crawl daemon stopped");
        Ok(())
    }

    async fn worker_loop(&self, worker_index: usize, shutdown: CancellationToken) {
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms.max(100));
        let lock_ttl = Duration::from_secs(self.config.lock_ttl_seconds.max(1));

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let claimed = match self.queue.claim(&self.instance_id, lock_ttl).await {
                Ok(claimed) => claimed,
                Err(error) => {
                    warn!(worker = worker_index, error = %error, "failed to claim queue entry");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(poll_interval) => {}
                    }
                    continue;
                }
            };

            let Some(company_id) = claimed else {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(poll_interval) => {}
                }
                continue;
            };

            if self.crawl_claimed_company(worker_index, company_id).await {
                // A canary abort poisoned the run: stop claiming.
                break;
            }
        }
    }

    /// Crawl one claimed company. Returns true when the worker must stop
    /// because the run-wide canary budget tripped.
    async fn crawl_claimed_company(&self, worker_index: usize, company_id: i64) -> bool {
        let target = match self.storage.find_company_target(company_id).await {
            Ok(Some(target)) => target,
            Ok(None) => {
                if let Err(error) = self.queue.mark_failure(company_id, "missing_domain").await {
                    error!(company_id, error = %error, "failed to record missing domain");
                }
                return false;
            }
            Err(error) => {
                warn!(worker = worker_index, company_id, error = %error, "failed to load company target");
                if let Err(error) = self.queue.mark_failure(company_id, "target_load_failed").await
                {
                    error!(company_id, error = %error, "failed to record target load failure");
                }
                return false;
            }
        };

        match self.runner.crawl_company(&target, None).await {
            Ok(summary) => {
                let outcome = if summary.closeout_safe {
                    self.queue.mark_success(company_id).await
                } else {
                    warn!(
                        worker = worker_index,
                        company_id,
                        reason = summary.primary_reason().as_str(),
                        error = %summary.error_summary(),
                        "company crawl failed"
                    );
                    self.queue
                        .mark_failure(company_id, &summary.error_summary())
                        .await
                };
                if let Err(error) = outcome {
                    error!(company_id, error = %error, "failed to record crawl outcome");
                }
                false
            }
            Err(abort) => {
                // The abort counts as a queue failure for this company so
                // its backoff schedule reflects the interrupted crawl, and
                // the worker stops claiming.
                warn!(
                    worker = worker_index,
                    company_id,
                    reason = abort.reason,
                    "canary abort during daemon crawl"
                );
                if let Err(error) = self.queue.mark_failure(company_id, abort.reason).await {
                    error!(company_id, error = %error, "failed to record canary abort");
                }
                true
            }
        }
    }
}
