use std::collections::HashSet;

use lazy_static::lazy_static;
use regex::Regex;
use scraper::{Html, Selector};
use url::Url;

use crate::types::{AtsDetectionRecord, AtsType};

lazy_static! {
    static ref GREENHOUSE_BOARD: Regex =
        Regex::new(r"(?i)(?:https?:)?//boards\.greenhouse\.io/([A-Za-z0-9._-]+)").unwrap();
    static ref GREENHOUSE_JOB_BOARDS: Regex =
        Regex::new(r"(?i)(?:https?:)?//job-boards\.greenhouse\.io/([A-Za-z0-9._-]+)").unwrap();
    static ref GREENHOUSE_API: Regex =
        Regex::new(r"(?i)(?:https?:)?//(?:boards-api|api)\.greenhouse\.io/v1/boards/([A-Za-z0-9._-]+)")
            .unwrap();
    static ref GREENHOUSE_EMBED: Regex =
        Regex::new(r#"(?i)(?:https?:)?//boards\.greenhouse\.io/embed/job_board[^"'\s>]*"#).unwrap();
    static ref GREENHOUSE_SHORT: Regex =
        Regex::new(r"(?i)(?:https?:)?//grnh\.se/([A-Za-z0-9._-]+)").unwrap();
    static ref LEVER_JOBS: Regex =
        Regex::new(r"(?i)(?:https?:)?//jobs\.lever\.co/([A-Za-z0-9._-]+)").unwrap();
    static ref LEVER_APPLY: Regex =
        Regex::new(r"(?i)(?:https?:)?//apply\.lever\.co/([A-Za-z0-9._-]+)").unwrap();
    static ref LEVER_API: Regex =
        Regex::new(r"(?i)(?:https?:)?//api\.lever\.co/v0/postings/([A-Za-z0-9._-]+)").unwrap();
    static ref WORKDAY: Regex =
        Regex::new(r#"(?i)(?:https?:)?//([A-Za-z0-9-]+\.[A-Za-z0-9.-]*myworkdayjobs\.com)(/[^"'\s<>]*)?"#)
            .unwrap();
    static ref SMARTRECRUITERS_JOBS: Regex =
        Regex::new(r"(?i)(?:https?:)?//jobs\.smartrecruiters\.com/([A-Za-z0-9._-]+)").unwrap();
    static ref SMARTRECRUITERS_CAREERS: Regex =
        Regex::new(r"(?i)(?:https?:)?//careers\.smartrecruiters\.com/([A-Za-z0-9._-]+)").unwrap();
    static ref SMARTRECRUITERS_WEB: Regex =
        Regex::new(r"(?i)(?:https?:)?//www\.smartrecruiters\.com/([A-Za-z0-9._-]+)").unwrap();
    static ref SMARTRECRUITERS_API: Regex =
        Regex::new(r"(?i)(?:https?:)?//api\.smartrecruiters\.com/v1/companies/([A-Za-z0-9._-]+)")
            .unwrap();
    static ref LOCALE_SEGMENT: Regex = Regex::new(r"^[a-z]{2}-[A-Z]{2}$").unwrap();
    static ref ANCHOR_SELECTOR: Selector = Selector::parse("a[href]").expect("static selector");
}

/// Coarse vendor classification of a single URL by its host.
pub fn detect_vendor(url: &str) -> AtsType {
    let Some(host) = extract_host(url) else {
        return AtsType::Unknown;
    };
    if host.ends_with("myworkdayjobs.com") || host.contains("workdayjobs") {
        return AtsType::Workday;
    }
    if host.contains("greenhouse.io") || host.contains("grnh.se") {
        return AtsType::Greenhouse;
    }
    if host.contains("jobs.lever.co")
        || host.contains("api.lever.co")
        || host.contains("apply.lever.co")
    {
        return AtsType::Lever;
    }
    if host.contains("smartrecruiters.com") {
        return AtsType::SmartRecruiters;
    }
    AtsType::Unknown
}

/// Coarse vendor classification of page content.
pub fn detect_vendor_in_html(html: &str) -> AtsType {
    if html.trim().is_empty() {
        return AtsType::Unknown;
    }
    let lower = html.to_lowercase();
    if lower.contains("myworkdayjobs.com")
        || lower.contains("workdayjobs")
        || lower.contains("/wday/cxs/")
    {
        return AtsType::Workday;
    }
    if lower.contains("greenhouse.io") || lower.contains("grnh.se/") {
        return AtsType::Greenhouse;
    }
    if lower.contains("jobs.lever.co")
        || lower.contains("api.lever.co/v0/postings/")
        || lower.contains("apply.lever.co")
        || lower.contains("lever.co")
    {
        return AtsType::Lever;
    }
    if lower.contains("smartrecruiters.com") {
        return AtsType::SmartRecruiters;
    }
    AtsType::Unknown
}

pub fn detect_vendor_in_url_or_html(url: &str, html: &str) -> AtsType {
    let by_url = detect_vendor(url);
    if by_url != AtsType::Unknown {
        return by_url;
    }
    detect_vendor_in_html(html)
}

/// Extract normalized ATS endpoints from a URL and/or page HTML.
/// Deduplicated by `(vendor, lowercased url)`, discovery order preserved.
pub fn extract_endpoints(url: Option<&str>, html: Option<&str>) -> Vec<AtsDetectionRecord> {
    let mut records = Vec::new();
    let mut seen = HashSet::new();
    if let Some(url) = url {
        extract_from_text(url, &mut records, &mut seen);
    }
    if let Some(html) = html {
        extract_from_text(html, &mut records, &mut seen);
    }
    records
}

/// Greenhouse short links found in page content. Resolving them to a real
/// board token requires an extra fetch, handled by the pipeline.
pub fn extract_greenhouse_short_links(html: &str) -> Vec<String> {
    let mut links = Vec::new();
    for capture in GREENHOUSE_SHORT.captures_iter(html) {
        if let Some(token) = clean_token(&capture[1]) {
            links.push(format!("https://grnh.se/{}", token));
        }
    }
    links
}

/// Scan a batch of sitemap URL strings. Each detection keeps the first
/// source URL that produced it.
pub fn scan_sitemap_urls(urls: &[String]) -> Vec<(AtsDetectionRecord, String)> {
    let mut discovered = Vec::new();
    let mut seen = HashSet::new();
    for url in urls {
        if url.trim().is_empty() {
            continue;
        }
        for record in extract_endpoints(Some(url), None) {
            let key = record.dedupe_key();
            if seen.insert(key) {
                discovered.push((record, url.clone()));
            }
        }
    }
    discovered
}

/// Scan anchor hrefs within an HTML document, resolving relative hrefs
/// against the base URL. Keeps the originating href per endpoint.
pub fn scan_html_links(html: &str, base_url: &str) -> Vec<(AtsDetectionRecord, String)> {
    if html.trim().is_empty() {
        return Vec::new();
    }
    let base = Url::parse(base_url).ok();
    let document = Html::parse_document(html);
    let mut discovered = Vec::new();
    let mut seen = HashSet::new();
    for anchor in document.select(&ANCHOR_SELECTOR) {
        let Some(href) = anchor.value().attr("href") else {
            continue;
        };
        let href = href.trim();
        if href.is_empty() {
            continue;
        }
        let resolved = match &base {
            Some(base) => base
                .join(href)
                .map(|url| url.to_string())
                .unwrap_or_else(|_| href.to_string()),
            None => href.to_string(),
        };
        for record in extract_endpoints(Some(&resolved), None) {
            let key = record.dedupe_key();
            if seen.insert(key) {
                discovered.push((record, resolved.clone()));
            }
        }
    }
    discovered
}

fn extract_from_text(text: &str, records: &mut Vec<AtsDetectionRecord>, seen: &mut HashSet<String>) {
    if text.trim().is_empty() {
        return;
    }

    for capture in GREENHOUSE_BOARD.captures_iter(text) {
        let Some(token) = clean_token(&capture[1]) else {
            continue;
        };
        if token.eq_ignore_ascii_case("embed") {
            continue;
        }
        add_endpoint(
            records,
            seen,
            AtsType::Greenhouse,
            format!("https://boards.greenhouse.io/{}", token),
        );
    }

    for capture in GREENHOUSE_JOB_BOARDS.captures_iter(text) {
        let Some(token) = clean_token(&capture[1]) else {
            continue;
        };
        if token.eq_ignore_ascii_case("embed") {
            continue;
        }
        add_endpoint(
            records,
            seen,
            AtsType::Greenhouse,
            format!("https://boards.greenhouse.io/{}", token),
        );
    }

    for capture in GREENHOUSE_API.captures_iter(text) {
        if let Some(token) = clean_token(&capture[1]) {
            add_endpoint(
                records,
                seen,
                AtsType::Greenhouse,
                format!("https://boards-api.greenhouse.io/v1/boards/{}", token),
            );
        }
    }

    for capture in GREENHOUSE_EMBED.captures_iter(text) {
        let token = extract_query_param(&capture[0], "for").and_then(|value| clean_token(&value));
        if let Some(token) = token {
            add_endpoint(
                records,
                seen,
                AtsType::Greenhouse,
                format!("https://boards.greenhouse.io/{}", token),
            );
        }
    }

    for pattern in [&*LEVER_JOBS, &*LEVER_APPLY, &*LEVER_API] {
        for capture in pattern.captures_iter(text) {
            if let Some(account) = clean_token(&capture[1]) {
                add_endpoint(
                    records,
                    seen,
                    AtsType::Lever,
                    format!("https://jobs.lever.co/{}", account),
                );
            }
        }
    }

    for capture in WORKDAY.captures_iter(text) {
        let Some(host) = clean_token(&capture[1]) else {
            continue;
        };
        let path = capture.get(2).map(|m| m.as_str()).unwrap_or("");
        if let Some(endpoint) = normalize_workday_endpoint(&host, path) {
            add_endpoint(records, seen, AtsType::Workday, endpoint);
        }
    }

    for pattern in [
        &*SMARTRECRUITERS_JOBS,
        &*SMARTRECRUITERS_CAREERS,
        &*SMARTRECRUITERS_WEB,
        &*SMARTRECRUITERS_API,
    ] {
        for capture in pattern.captures_iter(text) {
            if let Some(company) = clean_token(&capture[1]) {
                add_endpoint(
                    records,
                    seen,
                    AtsType::SmartRecruiters,
                    format!("https://careers.smartrecruiters.com/{}", company),
                );
            }
        }
    }
}

fn add_endpoint(
    records: &mut Vec<AtsDetectionRecord>,
    seen: &mut HashSet<String>,
    ats_type: AtsType,
    endpoint_url: String,
) {
    let Some(normalized) = normalize_endpoint_url(&endpoint_url) else {
        return;
    };
    let record = AtsDetectionRecord::new(ats_type, normalized);
    if seen.insert(record.dedupe_key()) {
        records.push(record);
    }
}

fn normalize_endpoint_url(raw: &str) -> Option<String> {
    let parsed = safe_url(raw)?;
    let host = parsed.host_str()?.to_lowercase();
    let path = parsed.path();
    let mut normalized = format!("https://{}{}", host, path);
    if normalized.ends_with('/') && normalized.len() > "https://x/".len() {
        normalized.pop();
    }
    Some(normalized)
}

/// Collapse Workday path variants (CXS API, locale-prefixed, bare) into one
/// canonical `https://{host}/{locale?}/{site}` endpoint.
fn normalize_workday_endpoint(host: &str, raw_path: &str) -> Option<String> {
    if host.is_empty() {
        return None;
    }
    let host = host.to_lowercase();
    let path = strip_trailing_punctuation(strip_query_and_fragment(raw_path));
    let segments: Vec<&str> = path.split('/').filter(|part| !part.is_empty()).collect();
    if segments.is_empty() {
        return None;
    }

    let (locale, site) = if segments.len() >= 4
        && segments[0].eq_ignore_ascii_case("wday")
        && segments[1].eq_ignore_ascii_case("cxs")
    {
        (None, segments[3])
    } else if segments.len() >= 2 && LOCALE_SEGMENT.is_match(segments[0]) {
        (Some(segments[0]), segments[1])
    } else {
        (None, segments[0])
    };

    let site = strip_trailing_punctuation(site.to_string());
    if site.is_empty() {
        return None;
    }
    Some(match locale {
        Some(locale) => format!("https://{}/{}/{}", host, locale, site),
        None => format!("https://{}/{}", host, site),
    })
}

fn extract_query_param(raw_url: &str, param: &str) -> Option<String> {
    let parsed = safe_url(raw_url)?;
    parsed
        .query_pairs()
        .find(|(key, _)| key.eq_ignore_ascii_case(param))
        .map(|(_, value)| value.into_owned())
}

fn strip_query_and_fragment(value: &str) -> String {
    let mut result = value;
    if let Some(idx) = result.find('?') {
        result = &result[..idx];
    }
    if let Some(idx) = result.find('#') {
        result = &result[..idx];
    }
    result.to_string()
}

fn strip_trailing_punctuation(value: String) -> String {
    let mut trimmed = value.trim().to_string();
    while let Some(last) = trimmed.chars().last() {
        if matches!(last, '.' | ',' | ';' | ')' | ']' | '}' | '"' | '&' | '?') {
            trimmed.pop();
        } else {
            break;
        }
    }
    trimmed
}

fn clean_token(value: &str) -> Option<String> {
    let cleaned = strip_trailing_punctuation(value.trim().to_string());
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned)
    }
}

fn extract_host(url: &str) -> Option<String> {
    safe_url(url).and_then(|parsed| parsed.host_str().map(|host| host.to_lowercase()))
}

fn safe_url(raw: &str) -> Option<Url> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let mut candidate = trimmed.to_string();
    if candidate.starts_with("//") {
        candidate = format!("https:{}", candidate);
    }
    if !candidate.starts_with("http://") && !candidate.starts_with("https://") {
        candidate = format!("https://{}", candidate);
    }
    Url::parse(&candidate).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_greenhouse_api_aliases_share_one_canonical_record() {
        let from_api =
            extract_endpoints(Some("https://api.greenhouse.io/v1/boards/acme/jobs"), None);
        let from_boards_api = extract_endpoints(
            Some("https://boards-api.greenhouse.io/v1/boards/acme/jobs"),
            None,
        );
        assert_eq!(from_api, from_boards_api);
        assert_eq!(from_api.len(), 1);
        assert_eq!(
            from_api[0].endpoint_url,
            "https://boards-api.greenhouse.io/v1/boards/acme"
        );
    }

    #[test]
    fn test_greenhouse_board_host_aliases_collapse() {
        let records = extract_endpoints(
            None,
            Some("see https://boards.greenhouse.io/acme and https://job-boards.greenhouse.io/acme"),
        );
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].endpoint_url, "https://boards.greenhouse.io/acme");
    }

    #[test]
    fn test_greenhouse_embed_widget_board_token() {
        let html = r#"<iframe src="https://boards.greenhouse.io/embed/job_board?for=acme&b=1">"#;
        let records = extract_endpoints(None, Some(html));
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].endpoint_url, "https://boards.greenhouse.io/acme");
    }

    #[test]
    fn test_greenhouse_embed_token_is_not_a_board() {
        let records = extract_endpoints(Some("https://boards.greenhouse.io/embed/job_board"), None);
        assert!(records.is_empty());
    }

    #[test]
    fn test_lever_variants_normalize_to_jobs_host() {
        for url in [
            "https://jobs.lever.co/acme",
            "https://apply.lever.co/acme",
            "https://api.lever.co/v0/postings/acme?mode=json",
        ] {
            let records = extract_endpoints(Some(url), None);
            assert_eq!(records.len(), 1, "no record for {}", url);
            assert_eq!(records[0].ats_type, AtsType::Lever);
            assert_eq!(records[0].endpoint_url, "https://jobs.lever.co/acme");
        }
    }

    #[test]
    fn test_workday_cxs_and_ui_paths_share_canonical_endpoint() {
        let from_cxs = extract_endpoints(
            Some("https://acme.wd5.myworkdayjobs.com/wday/cxs/acme/External/jobs"),
            None,
        );
        let from_ui = extract_endpoints(Some("https://acme.wd5.myworkdayjobs.com/External"), None);
        assert_eq!(from_cxs, from_ui);
        assert_eq!(
            from_cxs[0].endpoint_url,
            "https://acme.wd5.myworkdayjobs.com/External"
        );
    }

    #[test]
    fn test_workday_locale_prefix_is_preserved() {
        let records = extract_endpoints(
            Some("https://acme.wd1.myworkdayjobs.com/en-US/Careers?q=rust"),
            None,
        );
        assert_eq!(records.len(), 1);
        assert_eq!(
            records[0].endpoint_url,
            "https://acme.wd1.myworkdayjobs.com/en-US/Careers"
        );
    }

    #[test]
    fn test_workday_bare_host_is_not_an_endpoint() {
        let records = extract_endpoints(Some("https://acme.wd5.myworkdayjobs.com"), None);
        assert!(records.is_empty());
    }

    #[test]
    fn test_smartrecruiters_variants_normalize_to_careers_host() {
        for url in [
            "https://jobs.smartrecruiters.com/acme",
            "https://www.smartrecruiters.com/acme",
            "https://api.smartrecruiters.com/v1/companies/acme",
        ] {
            let records = extract_endpoints(Some(url), None);
            assert_eq!(records.len(), 1, "no record for {}", url);
            assert_eq!(
                records[0].endpoint_url,
                "https://careers.smartrecruiters.com/acme"
            );
        }
    }

    #[test]
    fn test_trailing_punctuation_is_stripped() {
        let records = extract_endpoints(None, Some("apply at https://jobs.lever.co/acme)."));
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].endpoint_url, "https://jobs.lever.co/acme");
    }

    #[test]
    fn test_first_discovery_wins_and_order_is_preserved() {
        let html = "https://jobs.lever.co/acme https://boards.greenhouse.io/acme \
                    https://jobs.lever.co/ACME";
        let records = extract_endpoints(None, Some(html));
        assert_eq!(records.len(), 2);
        // Case-insensitive dedupe: the first-seen casing survives.
        let lever: Vec<_> = records
            .iter()
            .filter(|record| record.ats_type == AtsType::Lever)
            .collect();
        assert_eq!(lever.len(), 1);
        assert_eq!(lever[0].endpoint_url, "https://jobs.lever.co/acme");
    }

    #[test]
    fn test_short_link_extraction() {
        let html = r#"<a href="https://grnh.se/abc123">Jobs</a> plus //grnh.se/xyz."#;
        let links = extract_greenhouse_short_links(html);
        assert_eq!(
            links,
            vec![
                "https://grnh.se/abc123".to_string(),
                "https://grnh.se/xyz".to_string()
            ]
        );
    }

    #[test]
    fn test_scan_sitemap_urls_keeps_first_source() {
        let urls = vec![
            "https://example.com/about".to_string(),
            "https://jobs.lever.co/acme/1234".to_string(),
            "https://jobs.lever.co/acme/5678".to_string(),
        ];
        let discovered = scan_sitemap_urls(&urls);
        assert_eq!(discovered.len(), 1);
        assert_eq!(discovered[0].0.endpoint_url, "https://jobs.lever.co/acme");
        assert_eq!(discovered[0].1, "https://jobs.lever.co/acme/1234");
    }

    #[test]
    fn test_scan_html_links_resolves_relative_hrefs() {
        let html = r#"<html><body>
            <a href="/careers">Careers</a>
            <a href="https://boards.greenhouse.io/acme">Apply</a>
        </body></html>"#;
        let discovered = scan_html_links(html, "https://example.com/");
        assert_eq!(discovered.len(), 1);
        assert_eq!(
            discovered[0].0.endpoint_url,
            "https://boards.greenhouse.io/acme"
        );
    }

    #[test]
    fn test_detect_vendor_by_host() {
        assert_eq!(
            detect_vendor("https://acme.wd5.myworkdayjobs.com/External"),
            AtsType::Workday
        );
        assert_eq!(detect_vendor("https://grnh.se/abc"), AtsType::Greenhouse);
        assert_eq!(detect_vendor("https://apply.lever.co/acme"), AtsType::Lever);
        assert_eq!(
            detect_vendor("https://careers.smartrecruiters.com/acme"),
            AtsType::SmartRecruiters
        );
        assert_eq!(detect_vendor("https://example.com/careers"), AtsType::Unknown);
    }

    #[test]
    fn test_detect_vendor_in_html_via_cxs_marker() {
        let html = r#"<script>fetch("/wday/cxs/acme/External/jobs")</script>"#;
        assert_eq!(detect_vendor_in_html(html), AtsType::Workday);
    }
}
