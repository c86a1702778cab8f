use std::collections::{HashSet, VecDeque};
use std::io::Read;
use std::sync::Arc;

use chrono::Utc;
use flate2::read::GzDecoder;
use lazy_static::lazy_static;
use scraper::{Html, Selector};
use tracing::debug;

use crate::canary::{CanaryAbort, CanaryBudget};
use crate::fetcher::{FetchRequest, PoliteFetcher};
use crate::robots::RobotsCache;
use crate::types::{bump_error, FetchResult, SitemapDiscoveryResult, SitemapFetchRecord, SitemapUrlEntry};

const SITEMAP_ACCEPT: &str = "application/xml,text/xml;q=0.9,*/*;q=0.1";
const MAX_SITEMAP_BYTES: usize = 2_000_000;

lazy_static! {
    static ref CHILD_SITEMAP_SELECTOR: Selector =
        Selector::parse("sitemap > loc").expect("static selector");
    static ref URL_SELECTOR: Selector = Selector::parse("url").expect("static selector");
    static ref LOC_SELECTOR: Selector = Selector::parse("loc").expect("static selector");
    static ref LASTMOD_SELECTOR: Selector = Selector::parse("lastmod").expect("static selector");
}

struct SitemapTask {
    url: String,
    depth: u32,
}

/// Recursive sitemap discovery: breadth-first over sitemap indexes up to a
/// depth/fan-out budget, yielding a bounded, deduplicated set of URLs.
/// Failed or blocked fetches become error tallies, never halted traversal.
pub struct SitemapDiscovery {
    fetcher: Arc<PoliteFetcher>,
    robots: Arc<RobotsCache>,
}

impl SitemapDiscovery {
    pub fn new(fetcher: Arc<PoliteFetcher>, robots: Arc<RobotsCache>) -> Self {
        Self { fetcher, robots }
    }

    pub async fn discover(
        &self,
        seed_sitemaps: &[String],
        max_depth: u32,
        max_sitemaps: usize,
        max_urls: usize,
        budget: Option<&CanaryBudget>,
    ) -> Result<SitemapDiscoveryResult, CanaryAbort> {
        let mut queue: VecDeque<SitemapTask> = VecDeque::new();
        for seed in seed_sitemaps {
            if let Some(normalized) = normalize_sitemap_url(seed) {
                queue.push_back(SitemapTask {
                    url: normalized,
                    depth: 0,
                });
            }
        }

        let mut result = SitemapDiscoveryResult::default();
        let mut visited: HashSet<String> = HashSet::new();
        let mut seen_urls: HashSet<String> = HashSet::new();

        while let Some(task) = queue.pop_front() {
            if visited.len() >= max_sitemaps {
                break;
            }
            if task.depth > max_depth || visited.contains(&task.url) {
                continue;
            }
            visited.insert(task.url.clone());

            if !self.robots.is_allowed(&task.url, budget).await? {
                debug!(sitemap = %task.url, "sitemap blocked by robots");
                bump_error(&mut result.errors, "blocked_by_robots");
                continue;
            }

            let request = FetchRequest::get(task.url.clone(), SITEMAP_ACCEPT)
                .with_max_bytes(MAX_SITEMAP_BYTES)
                .with_budget(budget.cloned());
            let fetch = self.fetcher.fetch(&request).await?;
            if !fetch.is_success() {
                bump_error(&mut result.errors, fetch.error_key());
                continue;
            }

            let payload = match extract_xml_payload(&task.url, &fetch) {
                Ok(payload) => payload,
                Err(_) => {
                    bump_error(&mut result.errors, "gzip_decode_error");
                    continue;
                }
            };
            if payload.trim().is_empty() {
                bump_error(&mut result.errors, "empty_sitemap_payload");
                continue;
            }

            let document = Html::parse_document(&payload);

            let children: Vec<String> = document
                .select(&CHILD_SITEMAP_SELECTOR)
                .filter_map(|loc| normalize_sitemap_url(&loc.text().collect::<String>()))
                .collect();
            if !children.is_empty() && task.depth < max_depth {
                for child in children {
                    if !visited.contains(&child) && visited.len() + queue.len() < max_sitemaps {
                        queue.push_back(SitemapTask {
                            url: child,
                            depth: task.depth + 1,
                        });
                    }
                }
            }

            let mut new_urls = 0usize;
            for url_element in document.select(&URL_SELECTOR) {
                let Some(loc_element) = url_element.select(&LOC_SELECTOR).next() else {
                    continue;
                };
                let Some(loc) = normalize_sitemap_url(&loc_element.text().collect::<String>())
                else {
                    continue;
                };
                if seen_urls.contains(&loc) || seen_urls.len() >= max_urls {
                    continue;
                }
                let lastmod = url_element
                    .select(&LASTMOD_SELECTOR)
                    .next()
                    .map(|el| el.text().collect::<String>().trim().to_string())
                    .filter(|text| !text.is_empty());
                seen_urls.insert(loc.clone());
                result.discovered_urls.push(SitemapUrlEntry { url: loc, lastmod });
                new_urls += 1;
            }

            result.fetched_sitemaps.push(SitemapFetchRecord {
                sitemap_url: task.url,
                fetched_at: Utc::now(),
                url_count: new_urls,
            });
            if seen_urls.len() >= max_urls {
                break;
            }
        }

        Ok(result)
    }
}

/// Decompress the payload when any gzip signal is present: a `.gz` URL
/// suffix (requested or final), a gzip Content-Encoding, or the
/// `1f 8b` magic bytes. Absent all three the body is treated as plain XML.
fn extract_xml_payload(sitemap_url: &str, fetch: &FetchResult) -> Result<String, std::io::Error> {
    let Some(body) = fetch.body.as_deref() else {
        return Ok(String::new());
    };
    if is_gzip_payload(sitemap_url, fetch, body) {
        let mut decoder = GzDecoder::new(body);
        let mut decoded = String::new();
        decoder.read_to_string(&mut decoded)?;
        Ok(decoded)
    } else {
        Ok(String::from_utf8_lossy(body).into_owned())
    }
}

fn is_gzip_payload(sitemap_url: &str, fetch: &FetchResult, body: &[u8]) -> bool {
    let requested = sitemap_url.to_lowercase();
    let resolved = fetch.final_url_or_requested().to_lowercase();
    if requested.ends_with(".gz") || resolved.ends_with(".gz") {
        return true;
    }
    if fetch
        .content_encoding
        .as_deref()
        .map(|encoding| encoding.to_lowercase().contains("gzip"))
        .unwrap_or(false)
    {
        return true;
    }
    body.len() >= 2 && body[0] == 0x1f && body[1] == 0x8b
}

fn normalize_sitemap_url(url: &str) -> Option<String> {
    let trimmed = url.trim();
    if trimmed.is_empty() {
        return None;
    }
    let normalized = if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("https://{}", trimmed)
    };
    Some(normalized)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CrawlerConfig;
    use crate::fetcher::{HttpTransport, TransportError, TransportRequest, TransportResponse};
    use crate::host_state::InMemoryHostState;
    use async_trait::async_trait;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::collections::HashMap;
    use std::io::Write;
    use std::sync::Mutex;

    const ROBOTS_ALLOW_ALL: &str = "User-agent: *\nAllow: /\n";

    struct Page {
        status: u16,
        body: Vec<u8>,
        content_encoding: Option<String>,
    }

    struct MapTransport {
        pages: Mutex<HashMap<String, Page>>,
    }

    impl MapTransport {
        fn new() -> Self {
            Self {
                pages: Mutex::new(HashMap::new()),
            }
        }

        fn insert(&self, url: &str, status: u16, body: impl Into<Vec<u8>>) {
            self.pages.lock().unwrap().insert(
                url.to_string(),
                Page {
                    status,
                    body: body.into(),
                    content_encoding: None,
                },
            );
        }

        fn insert_encoded(&self, url: &str, body: Vec<u8>, encoding: &str) {
            self.pages.lock().unwrap().insert(
                url.to_string(),
                Page {
                    status: 200,
                    body,
                    content_encoding: Some(encoding.to_string()),
                },
            );
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
            match pages.get(&url) {
                Some(page) => Ok(TransportResponse {
                    status: page.status,
                    final_url: url,
                    content_type: None,
                    content_encoding: page.content_encoding.clone(),
                    body: page.body.clone(),
                    truncated: false,
                }),
                None => Ok(TransportResponse {
                    status: 404,
                    final_url: url,
                    content_type: None,
                    content_encoding: None,
                    body: Vec::new(),
                    truncated: false,
                }),
            }
        }
    }

    fn discovery_with(transport: Arc<MapTransport>) -> SitemapDiscovery {
        let mut config = CrawlerConfig::default();
        config.per_host_delay_ms = 1;
        config.request_max_retries = 0;
        let config = Arc::new(config);
        let fetcher = Arc::new(PoliteFetcher::new(
            config.clone(),
            transport,
            Arc::new(InMemoryHostState::new()),
        ));
        let robots = Arc::new(RobotsCache::new(config, fetcher.clone()));
        SitemapDiscovery::new(fetcher, robots)
    }

    fn urlset(urls: &[&str]) -> String {
        let entries: String = urls
            .iter()
            .map(|url| format!("<url><loc>{}</loc></url>", url))
            .collect();
        format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?><urlset>{}</urlset>",
            entries
        )
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_index_traversal_discovers_urls_from_child() {
        let transport = Arc::new(MapTransport::new());
        transport.insert("https://example.com/robots.txt", 200, ROBOTS_ALLOW_ALL);
        transport.insert(
            "https://example.com/sitemap.xml",
            200,
            format!(
                "<sitemapindex><sitemap><loc>https://example.com/jobs.xml</loc></sitemap></sitemapindex>{}",
                urlset(&[
                    "https://example.com/a",
                    "https://example.com/b",
                    "https://example.com/c",
                ])
            ),
        );
        transport.insert(
            "https://example.com/jobs.xml",
            200,
            urlset(&["https://example.com/d", "https://example.com/e"]),
        );

        let discovery = discovery_with(transport);
        let result = discovery
            .discover(
                &["https://example.com/sitemap.xml".to_string()],
                1,
                50,
                10,
                None,
            )
            .await
            .unwrap();

        assert_eq!(result.fetched_sitemaps.len(), 2);
        assert_eq!(result.discovered_urls.len(), 5);
        // Per-sitemap counts reflect only the new URLs each contributed.
        assert_eq!(result.fetched_sitemaps[0].url_count, 3);
        assert_eq!(result.fetched_sitemaps[1].url_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_urls_stops_traversal_early() {
        let transport = Arc::new(MapTransport::new());
        transport.insert("https://example.com/robots.txt", 200, ROBOTS_ALLOW_ALL);
        transport.insert(
            "https://example.com/sitemap.xml",
            200,
            urlset(&[
                "https://example.com/a",
                "https://example.com/b",
                "https://example.com/c",
            ]),
        );

        let discovery = discovery_with(transport);
        let result = discovery
            .discover(
                &["https://example.com/sitemap.xml".to_string()],
                1,
                50,
                2,
                None,
            )
            .await
            .unwrap();
        assert_eq!(result.discovered_urls.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_depth_budget_skips_grandchildren() {
        let transport = Arc::new(MapTransport::new());
        transport.insert("https://example.com/robots.txt", 200, ROBOTS_ALLOW_ALL);
        transport.insert(
            "https://example.com/sitemap.xml",
            200,
            "<sitemapindex><sitemap><loc>https://example.com/child.xml</loc></sitemap></sitemapindex>",
        );
        transport.insert(
            "https://example.com/child.xml",
            200,
            "<sitemapindex><sitemap><loc>https://example.com/grandchild.xml</loc></sitemap></sitemapindex>",
        );
        transport.insert(
            "https://example.com/grandchild.xml",
            200,
            urlset(&["https://example.com/deep"]),
        );

        let discovery = discovery_with(transport);
        let result = discovery
            .discover(
                &["https://example.com/sitemap.xml".to_string()],
                1,
                50,
                10,
                None,
            )
            .await
            .unwrap();
        assert_eq!(result.fetched_sitemaps.len(), 2);
        assert!(result.discovered_urls.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_gzip_detection_is_equivalent_across_signals() {
        let payload = urlset(&["https://example.com/a", "https://example.com/b"]);
        let compressed = gzip(payload.as_bytes());

        // Signal 1: .gz URL suffix.
        let by_suffix = {
            let transport = Arc::new(MapTransport::new());
            transport.insert("https://example.com/robots.txt", 200, ROBOTS_ALLOW_ALL);
            transport.insert("https://example.com/sitemap.xml.gz", 200, compressed.clone());
            discovery_with(transport)
                .discover(
                    &["https://example.com/sitemap.xml.gz".to_string()],
                    1,
                    50,
                    10,
                    None,
                )
                .await
                .unwrap()
        };

        // Signal 2: Content-Encoding header.
        let by_header = {
            let transport = Arc::new(MapTransport::new());
            transport.insert("https://example.com/robots.txt", 200, ROBOTS_ALLOW_ALL);
            transport.insert_encoded("https://example.com/sitemap.xml", compressed.clone(), "gzip");
            discovery_with(transport)
                .discover(
                    &["https://example.com/sitemap.xml".to_string()],
                    1,
                    50,
                    10,
                    None,
                )
                .await
                .unwrap()
        };

        // Signal 3: magic bytes alone.
        let by_magic = {
            let transport = Arc::new(MapTransport::new());
            transport.insert("https://example.com/robots.txt", 200, ROBOTS_ALLOW_ALL);
            transport.insert("https://example.com/sitemap.xml", 200, compressed.clone());
            discovery_with(transport)
                .discover(
                    &["https://example.com/sitemap.xml".to_string()],
                    1,
                    50,
                    10,
                    None,
                )
                .await
                .unwrap()
        };

        let urls = |result: &SitemapDiscoveryResult| {
            result
                .discovered_urls
                .iter()
                .map(|entry| entry.url.clone())
                .collect::<Vec<_>>()
        };
        assert_eq!(urls(&by_suffix), urls(&by_header));
        assert_eq!(urls(&by_header), urls(&by_magic));
        assert_eq!(by_magic.discovered_urls.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_robots_blocked_sitemap_is_tallied_not_fatal() {
        let transport = Arc::new(MapTransport::new());
        transport.insert(
            "https://example.com/robots.txt",
            200,
            "User-agent: *\nDisallow: /blocked\n",
        );
        transport.insert(
            "https://example.com/open.xml",
            200,
            urlset(&["https://example.com/a"]),
        );

        let discovery = discovery_with(transport);
        let result = discovery
            .discover(
                &[
                    "https://example.com/blocked/sitemap.xml".to_string(),
                    "https://example.com/open.xml".to_string(),
                ],
                1,
                50,
                10,
                None,
            )
            .await
            .unwrap();
        assert_eq!(result.errors.get("blocked_by_robots"), Some(&1));
        assert_eq!(result.discovered_urls.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_failures_become_error_tallies() {
        let transport = Arc::new(MapTransport::new());
        transport.insert("https://example.com/robots.txt", 200, ROBOTS_ALLOW_ALL);
        // No sitemap registered: the transport answers 404.

        let discovery = discovery_with(transport);
        let result = discovery
            .discover(
                &["https://example.com/sitemap.xml".to_string()],
                1,
                50,
                10,
                None,
            )
            .await
            .unwrap();
        assert!(result.fetched_sitemaps.is_empty());
        assert_eq!(result.errors.get("http_404"), Some(&1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_corrupt_gzip_is_a_decode_error() {
        let transport = Arc::new(MapTransport::new());
        transport.insert("https://example.com/robots.txt", 200, ROBOTS_ALLOW_ALL);
        transport.insert(
            "https://example.com/sitemap.xml.gz",
            200,
            vec![0x1f, 0x8b, 0x00, 0x01, 0x02],
        );

        let discovery = discovery_with(transport);
        let result = discovery
            .discover(
                &["https://example.com/sitemap.xml.gz".to_string()],
                1,
                50,
                10,
                None,
            )
            .await
            .unwrap();
        assert_eq!(result.errors.get("gzip_decode_error"), Some(&1));
    }
}
