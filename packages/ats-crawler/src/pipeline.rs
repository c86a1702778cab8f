use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::ats;
use crate::canary::{CanaryAbort, CanaryBudget};
use crate::config::CrawlerConfig;
use crate::fetcher::{FetchRequest, PoliteFetcher};
use crate::robots::RobotsCache;
use crate::sitemap::SitemapDiscovery;
use crate::storage::CrawlStorage;
use crate::types::{
    bump_error, classify_url, top_errors, AtsDetectionRecord, CompanyCrawlSummary, CompanyTarget,
    DiscoveredUrlKind,
};

const HTML_ACCEPT: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8";
const MAX_PROBE_URLS: usize = 25;
const MAX_SHORT_LINK_RESOLUTIONS: usize = 2;
const TOP_ERROR_LIMIT: usize = 5;

/// Per-company pipeline entry point (to allow mocking in the daemon).
#[async_trait]
pub trait CompanyCrawlRunner: Send + Sync {
    async fn crawl_company(
        &self,
        target: &CompanyTarget,
        budget: Option<&CanaryBudget>,
    ) -> Result<CompanyCrawlSummary, CanaryAbort>;
}

/// Runs the robots → sitemap → fingerprint pipeline for one company.
/// Per-request failures degrade to error tallies; only a tripped canary
/// budget unwinds the whole crawl.
pub struct CompanyCrawler {
    config: Arc<CrawlerConfig>,
    fetcher: Arc<PoliteFetcher>,
    robots: Arc<RobotsCache>,
    sitemaps: Arc<SitemapDiscovery>,
    storage: Arc<dyn CrawlStorage>,
}

impl CompanyCrawler {
    pub fn new(
        config: Arc<CrawlerConfig>,
        fetcher: Arc<PoliteFetcher>,
        robots: Arc<RobotsCache>,
        sitemaps: Arc<SitemapDiscovery>,
        storage: Arc<dyn CrawlStorage>,
    ) -> Self {
        Self {
            config,
            fetcher,
            robots,
            sitemaps,
            storage,
        }
    }

    async fn register_detection(
        &self,
        target: &CompanyTarget,
        record: AtsDetectionRecord,
        discovered_from_url: &str,
        detection_method: &str,
        verified: bool,
        detections: &mut Vec<AtsDetectionRecord>,
        seen: &mut HashSet<String>,
        errors: &mut HashMap<String, u32>,
    ) {
        let key = record.dedupe_key();
        if !seen.insert(key) {
            return;
        }
        info!(
            company_id = target.company_id,
            ats = record.ats_type.as_str(),
            endpoint = %record.endpoint_url,
            method = detection_method,
            "ats endpoint detected"
        );
        if let Err(error) = self
            .storage
            .upsert_ats_endpoint(
                target.company_id,
                &record,
                discovered_from_url,
                detection_method,
                verified,
            )
            .await
        {
            warn!(company_id = target.company_id, error = %error, "failed to persist ats endpoint");
            bump_error(errors, "storage_error");
        }
        if let Err(error) = self
            .storage
            .upsert_discovered_url(
                target.company_id,
                &record.endpoint_url,
                DiscoveredUrlKind::AtsLanding,
                "ats_detected",
            )
            .await
        {
            warn!(company_id = target.company_id, error = %error, "failed to persist discovered url");
            bump_error(errors, "storage_error");
        }
        detections.push(record);
    }

    /// Resolve Greenhouse short links found in page content. Bounded to two
    /// fetches per page to cap cost.
    async fn resolve_short_links(
        &self,
        html: &str,
        budget: Option<&CanaryBudget>,
    ) -> Result<Vec<(AtsDetectionRecord, String)>, CanaryAbort> {
        let short_links = ats::extract_greenhouse_short_links(html);
        if short_links.is_empty() {
            return Ok(Vec::new());
        }
        let mut resolved = Vec::new();
        let mut attempts = 0;
        for link in short_links {
            if attempts >= MAX_SHORT_LINK_RESOLUTIONS {
                break;
            }
            attempts += 1;
            if !self.robots.is_allowed(&link, budget).await? {
                continue;
            }
            let request =
                FetchRequest::get(link.clone(), HTML_ACCEPT).with_budget(budget.cloned());
            let fetch = self.fetcher.fetch(&request).await?;
            let body = fetch.body_text().map(|text| text.into_owned());
            for record in ats::extract_endpoints(
                Some(fetch.final_url_or_requested()),
                body.as_deref(),
            ) {
                resolved.push((record, link.clone()));
            }
            if !resolved.is_empty() {
                break;
            }
        }
        Ok(resolved)
    }
}

#[async_trait]
impl CompanyCrawlRunner for CompanyCrawler {
    async fn crawl_company(
        &self,
        target: &CompanyTarget,
        budget: Option<&CanaryBudget>,
    ) -> Result<CompanyCrawlSummary, CanaryAbort> {
        info!(
            company_id = target.company_id,
            ticker = %target.ticker,
            domain = %target.domain,
            "crawling company"
        );
        let deadline = Instant::now() + Duration::from_secs(self.config.max_company_seconds);
        let mut errors: HashMap<String, u32> = HashMap::new();
        let mut detections: Vec<AtsDetectionRecord> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();

        // Robots rules for the company domain seed the sitemap frontier.
        let root_rules = self.robots.rules_for_host(&target.domain, budget).await?;
        let mut seed_sitemaps: Vec<String> = root_rules.sitemap_urls().to_vec();
        if seed_sitemaps.is_empty() {
            seed_sitemaps.push(format!("https://{}/sitemap.xml", target.domain));
            if !target.domain.starts_with("www.") {
                seed_sitemaps.push(format!("https://www.{}/sitemap.xml", target.domain));
            }
        }

        let sitemap_result = self
            .sitemaps
            .discover(
                &seed_sitemaps,
                self.config.sitemap.max_depth,
                self.config.sitemap.max_sitemaps,
                self.config.sitemap.max_urls_per_domain,
                budget,
            )
            .await?;
        for (key, count) in &sitemap_result.errors {
            *errors.entry(key.clone()).or_insert(0) += count;
        }
        for record in &sitemap_result.fetched_sitemaps {
            if let Err(error) = self
                .storage
                .insert_sitemap_fetch(target.company_id, record)
                .await
            {
                warn!(company_id = target.company_id, error = %error, "failed to persist sitemap fetch");
                bump_error(&mut errors, "storage_error");
            }
        }

        let mut candidate_urls: Vec<String> = Vec::new();
        let mut candidate_seen: HashSet<String> = HashSet::new();
        let mut ats_landing_urls: Vec<String> = Vec::new();
        for entry in &sitemap_result.discovered_urls {
            let kind = classify_url(&entry.url);
            if let Err(error) = self
                .storage
                .upsert_discovered_url(target.company_id, &entry.url, kind, "discovered")
                .await
            {
                warn!(company_id = target.company_id, error = %error, "failed to persist discovered url");
                bump_error(&mut errors, "storage_error");
            }
            match kind {
                DiscoveredUrlKind::CandidateJob => {
                    if candidate_seen.insert(entry.url.clone()) {
                        candidate_urls.push(entry.url.clone());
                    }
                }
                DiscoveredUrlKind::AtsLanding => {
                    if candidate_seen.insert(entry.url.clone()) {
                        candidate_urls.push(entry.url.clone());
                    }
                    ats_landing_urls.push(entry.url.clone());
                }
                DiscoveredUrlKind::Other => {}
            }
        }

        if candidate_urls.is_empty() {
            if sitemap_result.fetched_sitemaps.is_empty() {
                if sitemap_result.errors.contains_key("blocked_by_robots") {
                    bump_error(&mut errors, "sitemap_blocked_by_robots");
                } else if !sitemap_result.errors.is_empty() {
                    bump_error(&mut errors, "sitemap_fetch_failed");
                } else {
                    bump_error(&mut errors, "no_sitemaps_found");
                }
            } else if sitemap_result.discovered_urls.is_empty() {
                bump_error(&mut errors, "sitemap_no_urls");
            } else {
                bump_error(&mut errors, "no_candidate_urls");
            }
        }

        // Fingerprint ATS endpoints from the sitemap URL batch before any
        // page is fetched; structural URL matches are free.
        for (record, source) in ats::scan_sitemap_urls(
            &sitemap_result
                .discovered_urls
                .iter()
                .map(|entry| entry.url.clone())
                .collect::<Vec<_>>(),
        ) {
            self.register_detection(
                target,
                record,
                &source,
                "sitemap",
                false,
                &mut detections,
                &mut seen,
                &mut errors,
            )
            .await;
        }

        let mut probe_success = false;
        if Instant::now() >= deadline {
            bump_error(&mut errors, "company_time_budget_exceeded");
        } else {
            // Probe the careers hint, conventional paths, ATS landing pages,
            // then remaining candidates up to the probe cap.
            let mut probes: Vec<String> = Vec::new();
            let mut probe_seen: HashSet<String> = HashSet::new();
            if let Some(hint) = target
                .careers_hint_url
                .as_deref()
                .map(str::trim)
                .filter(|hint| !hint.is_empty())
            {
                if probe_seen.insert(hint.to_string()) {
                    probes.push(hint.to_string());
                }
            }
            for conventional in [
                format!("https://{}/careers", target.domain),
                format!("https://{}/jobs", target.domain),
            ] {
                if probe_seen.insert(conventional.clone()) {
                    probes.push(conventional);
                }
            }
            for url in ats_landing_urls.iter().chain(candidate_urls.iter()) {
                if probes.len() >= MAX_PROBE_URLS {
                    break;
                }
                if probe_seen.insert(url.clone()) {
                    probes.push(url.clone());
                }
            }

            for probe in probes {
                if Instant::now() >= deadline {
                    bump_error(&mut errors, "company_time_budget_exceeded");
                    break;
                }

                // Structural patterns in the probe URL itself cost nothing.
                for record in ats::extract_endpoints(Some(&probe), None) {
                    self.register_detection(
                        target,
                        record,
                        &probe,
                        "pattern",
                        false,
                        &mut detections,
                        &mut seen,
                        &mut errors,
                    )
                    .await;
                }

                if !self.robots.is_allowed(&probe, budget).await? {
                    bump_error(&mut errors, "blocked_by_robots");
                    continue;
                }
                let request =
                    FetchRequest::get(probe.clone(), HTML_ACCEPT).with_budget(budget.cloned());
                let fetch = self.fetcher.fetch(&request).await?;
                if fetch.is_success() {
                    probe_success = true;
                } else {
                    bump_error(&mut errors, fetch.error_key());
                }

                let body = fetch.body_text().map(|text| text.into_owned());
                let resolved_url = fetch.final_url_or_requested().to_string();
                let mut extracted =
                    ats::extract_endpoints(Some(&resolved_url), body.as_deref());
                if let Some(html) = body.as_deref() {
                    for (record, _) in ats::scan_html_links(html, &resolved_url) {
                        extracted.push(record);
                    }
                    for (record, _) in self.resolve_short_links(html, budget).await? {
                        extracted.push(record);
                    }
                }
                for record in extracted {
                    self.register_detection(
                        target,
                        record,
                        &resolved_url,
                        if fetch.is_success() { "html" } else { "pattern" },
                        fetch.is_success(),
                        &mut detections,
                        &mut seen,
                        &mut errors,
                    )
                    .await;
                }
            }
        }

        let closeout_safe = probe_success || !detections.is_empty();
        let summary = CompanyCrawlSummary {
            company_id: target.company_id,
            ticker: target.ticker.clone(),
            domain: target.domain.clone(),
            sitemaps_fetched: sitemap_result.fetched_sitemaps.len(),
            candidate_url_count: candidate_urls.len(),
            detections,
            closeout_safe,
            top_errors: top_errors(&errors, TOP_ERROR_LIMIT),
        };
        info!(
            company_id = target.company_id,
            sitemaps = summary.sitemaps_fetched,
            candidates = summary.candidate_url_count,
            detections = summary.detections.len(),
            closeout_safe = summary.closeout_safe,
            "company crawl finished"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CrawlerConfig;
    use crate::fetcher::{HttpTransport, TransportError, TransportRequest, TransportResponse};
    use crate::host_state::InMemoryHostState;
    use crate::types::{AtsType, SitemapFetchRecord};
    use anyhow::Result as AnyResult;
    use std::sync::Mutex;

    struct MapTransport {
        pages: Mutex<HashMap<String, (u16, String)>>,
    }

    impl MapTransport {
        fn new() -> Self {
            Self {
                pages: Mutex::new(HashMap::new()),
            }
        }

        fn insert(&self, url: &str, status: u16, body: &str) {
            self.pages
                .lock()
                .unwrap()
                .insert(url.to_string(), (status, body.to_string()));
        }
    }

    #[async_trait]
    impl HttpTransport for MapTransport {
        async fn execute(
            &self,
            request: &TransportRequest,
        ) -> Result<TransportResponse, TransportError> {
            let url = request.url.to_string();
            let pages = self.pages.lock().unwrap();
            let (status, body) = pages
                .get(&url)
                .cloned()
                .unwrap_or((404, String::new()));
            Ok(TransportResponse {
                status,
                final_url: url,
                content_type: Some("text/html".to_string()),
                content_encoding: None,
                body: body.into_bytes(),
                truncated: false,
            })
        }
    }

    #[derive(Default)]
    struct RecordingStorage {
        endpoints: Mutex<Vec<(i64, AtsDetectionRecord, String)>>,
        discovered: Mutex<Vec<(i64, String, String)>>,
        sitemap_fetches: Mutex<Vec<(i64, String)>>,
    }

    #[async_trait]
    impl CrawlStorage for RecordingStorage {
        async fn find_company_target(&self, _company_id: i64) -> AnyResult<Option<CompanyTarget>> {
            Ok(None)
        }

        async fn upsert_ats_endpoint(
            &self,
            company_id: i64,
            record: &AtsDetectionRecord,
            _discovered_from_url: &str,
            detection_method: &str,
            _verified: bool,
        ) -> AnyResult<()> {
            self.endpoints.lock().unwrap().push((
                company_id,
                record.clone(),
                detection_method.to_string(),
            ));
            Ok(())
        }

        async fn upsert_discovered_url(
            &self,
            company_id: i64,
            url: &str,
            _kind: DiscoveredUrlKind,
            status: &str,
        ) -> AnyResult<()> {
            self.discovered
                .lock()
                .unwrap()
                .push((company_id, url.to_string(), status.to_string()));
            Ok(())
        }

        async fn insert_sitemap_fetch(
            &self,
            company_id: i64,
            record: &SitemapFetchRecord,
        ) -> AnyResult<()> {
            self.sitemap_fetches
                .lock()
                .unwrap()
                .push((company_id, record.sitemap_url.clone()));
            Ok(())
        }
    }

    fn crawler_with(
        transport: Arc<MapTransport>,
        storage: Arc<RecordingStorage>,
    ) -> CompanyCrawler {
        let mut config = CrawlerConfig::default();
        config.per_host_delay_ms = 1;
        config.request_max_retries = 0;
        let config = Arc::new(config);
        let fetcher = Arc::new(PoliteFetcher::new(
            config.clone(),
            transport,
            Arc::new(InMemoryHostState::new()),
        ));
        let robots = Arc::new(RobotsCache::new(config.clone(), fetcher.clone()));
        let sitemaps = Arc::new(SitemapDiscovery::new(fetcher.clone(), robots.clone()));
        CompanyCrawler::new(config, fetcher, robots, sitemaps, storage)
    }

    fn target() -> CompanyTarget {
        CompanyTarget {
            company_id: 42,
            ticker: "ACME".to_string(),
            domain: "example.com".to_string(),
            careers_hint_url: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_pipeline_detects_from_sitemap_and_html() {
        let transport = Arc::new(MapTransport::new());
        transport.insert(
            "https://example.com/robots.txt",
            200,
            "User-agent: *\nAllow: /\nSitemap: https://example.com/sitemap.xml\n",
        );
        transport.insert(
            "https://example.com/sitemap.xml",
            200,
            "<urlset>\
             <url><loc>https://example.com/careers/openings</loc></url>\
             <url><loc>https://jobs.lever.co/acme/123</loc></url>\
             <url><loc>https://example.com/about</loc></url>\
             </urlset>",
        );
        transport.insert(
            "https://example.com/careers",
            200,
            r#"<html><body><a href="https://boards.greenhouse.io/acme">Apply</a></body></html>"#,
        );
        transport.insert("https://example.com/careers/openings", 200, "<html></html>");
        // robots for the lever landing page host
        transport.insert("https://jobs.lever.co/robots.txt", 200, "User-agent: *\nAllow: /\n");
        transport.insert("https://jobs.lever.co/acme/123", 200, "<html></html>");

        let storage = Arc::new(RecordingStorage::default());
        let crawler = crawler_with(transport, storage.clone());

        let summary = crawler.crawl_company(&target(), None).await.unwrap();

        assert!(summary.closeout_safe);
        assert_eq!(summary.sitemaps_fetched, 1);
        assert_eq!(summary.candidate_url_count, 2);
        let types: Vec<AtsType> = summary
            .detections
            .iter()
            .map(|record| record.ats_type)
            .collect();
        assert!(types.contains(&AtsType::Lever), "lever from sitemap batch");
        assert!(types.contains(&AtsType::Greenhouse), "greenhouse from html");

        let endpoints = storage.endpoints.lock().unwrap();
        assert_eq!(endpoints.len(), summary.detections.len());
        let sitemap_fetches = storage.sitemap_fetches.lock().unwrap();
        assert_eq!(sitemap_fetches.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_sitemaps_fail_the_company_but_not_the_pipeline() {
        let transport = Arc::new(MapTransport::new());
        transport.insert("https://example.com/robots.txt", 200, "User-agent: *\nAllow: /\n");
        transport.insert("https://www.example.com/robots.txt", 200, "User-agent: *\nAllow: /\n");
        // Every other URL answers 404.

        let storage = Arc::new(RecordingStorage::default());
        let crawler = crawler_with(transport, storage);

        let summary = crawler.crawl_company(&target(), None).await.unwrap();
        assert!(!summary.closeout_safe);
        assert!(summary.detections.is_empty());
        let keys: Vec<&str> = summary
            .top_errors
            .iter()
            .map(|(key, _)| key.as_str())
            .collect();
        assert!(keys.contains(&"sitemap_fetch_failed"));
        assert!(keys.contains(&"http_404"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_robots_disallow_blocks_probes() {
        let transport = Arc::new(MapTransport::new());
        transport.insert(
            "https://example.com/robots.txt",
            200,
            "User-agent: *\nDisallow: /\nSitemap: https://example.com/sitemap.xml\n",
        );

        let storage = Arc::new(RecordingStorage::default());
        let crawler = crawler_with(transport, storage);

        let summary = crawler.crawl_company(&target(), None).await.unwrap();
        assert!(!summary.closeout_safe);
        let keys: Vec<&str> = summary
            .top_errors
            .iter()
            .map(|(key, _)| key.as_str())
            .collect();
        assert!(keys.contains(&"blocked_by_robots"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_canary_abort_unwinds_the_company_crawl() {
        let transport = Arc::new(MapTransport::new());
        transport.insert("https://example.com/robots.txt", 200, "User-agent: *\nAllow: /\n");

        let storage = Arc::new(RecordingStorage::default());
        let crawler = crawler_with(transport, storage);

        let mut limits = CrawlerConfig::default().canary;
        limits.max_total_requests = 1;
        let budget = CanaryBudget::new(&limits);

        let err = crawler
            .crawl_company(&target(), Some(&budget))
            .await
            .unwrap_err();
        assert_eq!(err.reason, crate::canary::ABORT_TOTAL_BUDGET);
        assert_eq!(budget.abort_reason(), Some(crate::canary::ABORT_TOTAL_BUDGET));
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_links_resolve_through_one_extra_hop() {
        let transport = Arc::new(MapTransport::new());
        transport.insert(
            "https://example.com/robots.txt",
            200,
            "User-agent: *\nAllow: /\n",
        );
        transport.insert(
            "https://example.com/careers",
            200,
            r#"<html><body>Openings: <a href="https://grnh.se/acme1">jobs</a></body></html>"#,
        );
        transport.insert("https://grnh.se/robots.txt", 200, "User-agent: *\nAllow: /\n");
        transport.insert(
            "https://grnh.se/acme1",
            200,
            r#"<html><body><a href="https://boards.greenhouse.io/acme">Board</a></body></html>"#,
        );

        let storage = Arc::new(RecordingStorage::default());
        let crawler = crawler_with(transport, storage);

        let summary = crawler.crawl_company(&target(), None).await.unwrap();
        assert!(summary
            .detections
            .iter()
            .any(|record| record.endpoint_url == "https://boards.greenhouse.io/acme"));
    }
}
