pub mod ats;
pub mod canary;
pub mod config;
pub mod daemon;
pub mod fetcher;
pub mod host_state;
pub mod orchestrator;
pub mod pipeline;
pub mod queue;
pub mod robots;
pub mod sitemap;
pub mod storage;
pub mod types;

// Re-exports for clean API
pub use canary::{CanaryAbort, CanaryBudget};
pub use config::CrawlerConfig;
pub use daemon::CrawlDaemon;
pub use fetcher::{FetchRequest, HttpTransport, PoliteFetcher, ReqwestTransport};
pub use host_state::{HostStateStore, InMemoryHostState};
pub use orchestrator::{CrawlOrchestrator, CrawlRunReport, CrawlRunStatus};
pub use pipeline::{CompanyCrawlRunner, CompanyCrawler};
pub use queue::{InMemoryWorkQueue, PostgresWorkQueue, WorkQueue};
pub use robots::{RobotsCache, RobotsRules};
pub use sitemap::SitemapDiscovery;
pub use storage::{CrawlStorage, PostgresCrawlStorage};
pub use types::{
    AtsDetectionRecord, AtsType, CompanyCrawlSummary, CompanyTarget, CrawlQueueStats, FetchResult,
    ReasonCode,
};
