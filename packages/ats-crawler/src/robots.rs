use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use regex::Regex;
use tracing::{debug, info, warn};
use url::Url;

use crate::canary::{CanaryAbort, CanaryBudget};
use crate::config::CrawlerConfig;
use crate::fetcher::{FetchRequest, PoliteFetcher};

const ROBOTS_ACCEPT: &str = "text/plain,text/*;q=0.9,*/*;q=0.1";
const ROBOTS_UNAVAILABLE_TTL_HOURS: i64 = 6;
const MAX_UNAVAILABLE_HOSTS: usize = 2048;

#[derive(Debug, Clone)]
struct RobotsRule {
    path: String,
    allow: bool,
    pattern: Option<Regex>,
}

impl RobotsRule {
    fn new(path: String, allow: bool) -> Self {
        let normalized = if path.starts_with('/') {
            path
        } else {
            format!("/{}", path)
        };
        let pattern = if normalized.contains('*') || normalized.contains('$') {
            compile_wildcard(&normalized)
        } else {
            None
        };
        Self {
            path: normalized,
            allow,
            pattern,
        }
    }

    fn matches(&self, test_path: &str) -> bool {
        match &self.pattern {
            Some(pattern) => pattern.is_match(test_path),
            None => test_path.starts_with(&self.path),
        }
    }
}

fn compile_wildcard(path: &str) -> Option<Regex> {
    let mut regex = String::from("^");
    for c in path.chars() {
        match c {
            '*' => regex.push_str(".*"),
            '$' => regex.push('$'),
            other => regex.push_str(&regex::escape(&other.to_string())),
        }
    }
    Regex::new(&regex).ok()
}

/// Parsed robots.txt rules for one host. Immutable after construction.
/// Longest matching pattern wins; ties prefer allow; empty means allow-all.
#[derive(Debug, Clone, Default)]
pub struct RobotsRules {
    rules: Vec<RobotsRule>,
    sitemap_urls: Vec<String>,
}

impl RobotsRules {
    pub fn allow_all() -> Self {
        Self::default()
    }

    pub fn disallow_all() -> Self {
        Self {
            rules: vec![RobotsRule::new("/".to_string(), false)],
            sitemap_urls: Vec::new(),
        }
    }

    pub fn sitemap_urls(&self) -> &[String] {
        &self.sitemap_urls
    }

    pub fn is_allowed(&self, path_and_query: &str) -> bool {
        if self.rules.is_empty() {
            return true;
        }
        let subject = if path_and_query.trim().is_empty() {
            "/"
        } else {
            path_and_query
        };
        let mut best: Option<&RobotsRule> = None;
        let mut best_len: isize = -1;
        for rule in &self.rules {
            if !rule.matches(subject) {
                continue;
            }
            let length = rule.path.len() as isize;
            if length > best_len {
                best = Some(rule);
                best_len = length;
            } else if length == best_len && rule.allow && best.map(|b| !b.allow).unwrap_or(false) {
                best = Some(rule);
            }
        }
        best.map(|rule| rule.allow).unwrap_or(true)
    }

    /// Line-oriented parse honoring only the wildcard user-agent group.
    /// A blank line resets the current group; consecutive `User-agent`
    /// lines join one group; `Sitemap:` lines are collected regardless.
    pub fn parse(robots_text: &str) -> Self {
        if robots_text.trim().is_empty() {
            return Self::allow_all();
        }

        let mut sitemaps = Vec::new();
        let mut rules = Vec::new();

        let mut current_agents: Vec<String> = Vec::new();
        let mut group_relevant = false;
        let mut last_was_user_agent = false;

        for raw_line in robots_text.lines() {
            let no_comment = match raw_line.find('#') {
                Some(idx) => &raw_line[..idx],
                None => raw_line,
            };
            let line = no_comment.trim();
            if line.is_empty() {
                current_agents.clear();
                group_relevant = false;
                last_was_user_agent = false;
                continue;
            }
            let Some(colon) = line.find(':') else {
                continue;
            };
            if colon == 0 {
                continue;
            }

            let key = line[..colon].trim().to_lowercase();
            let value = line[colon + 1..].trim();

            if key == "user-agent" {
                if !last_was_user_agent {
                    current_agents.clear();
                }
                current_agents.push(value.to_lowercase());
                group_relevant = current_agents.iter().any(|agent| agent == "*");
                last_was_user_agent = true;
                continue;
            }

            last_was_user_agent = false;
            if key == "sitemap" {
                if !value.is_empty() {
                    sitemaps.push(value.to_string());
                }
                continue;
            }

            if !group_relevant {
                continue;
            }
            if (key == "allow" || key == "disallow") && !value.is_empty() {
                rules.push(RobotsRule::new(value.to_string(), key == "allow"));
            }
        }

        Self {
            rules,
            sitemap_urls: sitemaps,
        }
    }
}

/// Per-host robots.txt compliance cache. Rules are fetched once per host per
/// cache window through the polite fetcher; unavailable hosts are remembered
/// for a TTL so dead hosts are not re-probed on every request.
pub struct RobotsCache {
    config: Arc<CrawlerConfig>,
    fetcher: Arc<PoliteFetcher>,
    cache: Mutex<HashMap<String, Arc<RobotsRules>>>,
    unavailable: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl RobotsCache {
    pub fn new(config: Arc<CrawlerConfig>, fetcher: Arc<PoliteFetcher>) -> Self {
        Self {
            config,
            fetcher,
            cache: Mutex::new(HashMap::new()),
            unavailable: Mutex::new(HashMap::new()),
        }
    }

    pub async fn rules_for_host(
        &self,
        host: &str,
        budget: Option<&CanaryBudget>,
    ) -> Result<Arc<RobotsRules>, CanaryAbort> {
        if host.trim().is_empty() {
            return Ok(Arc::new(RobotsRules::allow_all()));
        }
        let key = host.trim().to_lowercase();
        if let Some(rules) = self.cache.lock().unwrap().get(&key) {
            return Ok(rules.clone());
        }

        let rules = Arc::new(self.load_rules_for_host(&key, budget).await?);
        self.cache
            .lock()
            .unwrap()
            .entry(key)
            .or_insert_with(|| rules.clone());
        Ok(rules)
    }

    pub async fn is_allowed(
        &self,
        url: &str,
        budget: Option<&CanaryBudget>,
    ) -> Result<bool, CanaryAbort> {
        let Some(parsed) = parse_url(url) else {
            return Ok(true);
        };
        let Some(host) = parsed.host_str() else {
            return Ok(true);
        };
        let rules = self.rules_for_host(host, budget).await?;
        let mut path = parsed.path().to_string();
        if path.is_empty() {
            path = "/".to_string();
        }
        if let Some(query) = parsed.query() {
            if !query.is_empty() {
                path = format!("{}?{}", path, query);
            }
        }
        Ok(rules.is_allowed(&path))
    }

    /// Like `is_allowed`, but lets ATS adapter traffic (vendor-hosted feed
    /// endpoints, not generic page crawling) bypass a fail-closed decision
    /// while robots is unavailable.
    pub async fn is_allowed_for_ats_adapter(
        &self,
        url: &str,
        budget: Option<&CanaryBudget>,
    ) -> Result<bool, CanaryAbort> {
        if self.is_allowed(url, budget).await? {
            return Ok(true);
        }
        let robots_unavailable = self.is_robots_unavailable(url, budget).await?;
        let allowed_by_policy =
            robots_unavailable && self.config.robots.allow_ats_adapter_when_unavailable;
        if allowed_by_policy {
            let host = parse_url(url).and_then(|u| u.host_str().map(|h| h.to_string()));
            info!(
                host = host.as_deref().unwrap_or(""),
                "robots policy bypass for ats adapter while robots unavailable"
            );
        }
        Ok(allowed_by_policy)
    }

    pub async fn is_robots_unavailable(
        &self,
        url: &str,
        budget: Option<&CanaryBudget>,
    ) -> Result<bool, CanaryAbort> {
        let Some(parsed) = parse_url(url) else {
            return Ok(false);
        };
        let Some(host) = parsed.host_str() else {
            return Ok(false);
        };
        let key = host.to_lowercase();
        self.rules_for_host(&key, budget).await?;
        Ok(self.check_unavailable(&key))
    }

    async fn load_rules_for_host(
        &self,
        host: &str,
        budget: Option<&CanaryBudget>,
    ) -> Result<RobotsRules, CanaryAbort> {
        let robots_url = format!("https://{}/robots.txt", host);
        let request = FetchRequest::get(robots_url, ROBOTS_ACCEPT).with_budget(budget.cloned());
        let fetch = self.fetcher.fetch(&request).await?;
        if !fetch.is_success() {
            self.mark_unavailable(host);
            let fail_open = self.config.robots.fail_open;
            warn!(
                host = %host,
                status = fetch.status,
                error = %fetch.error_key(),
                decision = if fail_open { "allow_all" } else { "disallow_all" },
                "robots fetch failed"
            );
            return Ok(if fail_open {
                RobotsRules::allow_all()
            } else {
                RobotsRules::disallow_all()
            });
        }
        self.unavailable.lock().unwrap().remove(host);
        let body = fetch.body_text().unwrap_or_default();
        let rules = RobotsRules::parse(&body);
        debug!(
            host = %host,
            sitemap_hints = rules.sitemap_urls().len(),
            "loaded robots rules"
        );
        Ok(rules)
    }

    fn mark_unavailable(&self, host: &str) {
        let now = Utc::now();
        let mut unavailable = self.unavailable.lock().unwrap();
        unavailable.insert(host.to_string(), now);

        let cutoff = now - ChronoDuration::hours(ROBOTS_UNAVAILABLE_TTL_HOURS);
        let expired: Vec<String> = unavailable
            .iter()
            .filter(|(_, marked)| **marked < cutoff)
            .map(|(host, _)| host.clone())
            .collect();
        let mut cache = self.cache.lock().unwrap();
        for host in expired {
            unavailable.remove(&host);
            cache.remove(&host);
        }

        // Bounded memory: evict oldest entries past the cap.
        if unavailable.len() > MAX_UNAVAILABLE_HOSTS {
            let overflow = unavailable.len() - MAX_UNAVAILABLE_HOSTS;
            let mut oldest: Vec<(String, DateTime<Utc>)> = unavailable
                .iter()
                .map(|(host, marked)| (host.clone(), *marked))
                .collect();
            oldest.sort_by_key(|(_, marked)| *marked);
            for (host, _) in oldest.into_iter().take(overflow) {
                unavailable.remove(&host);
                cache.remove(&host);
            }
        }
    }

    fn check_unavailable(&self, host: &str) -> bool {
        let mut unavailable = self.unavailable.lock().unwrap();
        let Some(marked) = unavailable.get(host).copied() else {
            return false;
        };
        if marked + ChronoDuration::hours(ROBOTS_UNAVAILABLE_TTL_HOURS) < Utc::now() {
            unavailable.remove(host);
            self.cache.lock().unwrap().remove(host);
            return false;
        }
        true
    }

    #[cfg(test)]
    fn backdate_unavailable(&self, host: &str, hours: i64) {
        let mut unavailable = self.unavailable.lock().unwrap();
        unavailable.insert(host.to_string(), Utc::now() - ChronoDuration::hours(hours));
    }
}

fn parse_url(url: &str) -> Option<Url> {
    Url::parse(url).ok()
}
