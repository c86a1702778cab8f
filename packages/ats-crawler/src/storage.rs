use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{PgPool, Row};

use crate::types::{AtsDetectionRecord, CompanyTarget, DiscoveredUrlKind, SitemapFetchRecord};

/// Persistence sink consumed by the crawl pipeline. The engine calls simple
/// find/upsert operations; the storage technology behind them is not part
/// of the crawl core.
#[async_trait]
pub trait CrawlStorage: Send + Sync {
    async fn find_company_target(&self, company_id: i64) -> Result<Option<CompanyTarget>>;

    async fn upsert_ats_endpoint(
        &self,
        company_id: i64,
        record: &AtsDetectionRecord,
        discovered_from_url: &str,
        detection_method: &str,
        verified: bool,
    ) -> Result<()>;

    async fn upsert_discovered_url(
        &self,
        company_id: i64,
        url: &str,
        kind: DiscoveredUrlKind,
        status: &str,
    ) -> Result<()>;

    async fn insert_sitemap_fetch(
        &self,
        company_id: i64,
        record: &SitemapFetchRecord,
    ) -> Result<()>;
}

pub struct PostgresCrawlStorage {
    pool: PgPool,
}

impl PostgresCrawlStorage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CrawlStorage for PostgresCrawlStorage {
    async fn find_company_target(&self, company_id: i64) -> Result<Option<CompanyTarget>> {
        let row = sqlx::query(
            r#"
            SELECT id, ticker, domain, careers_hint_url
            FROM companies
            WHERE id = $1 AND domain IS NOT NULL
            "#,
        )
        .bind(company_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to load company target")?;

        Ok(row.map(|row| CompanyTarget {
            company_id: row.get("id"),
            ticker: row.get("ticker"),
            domain: row.get("domain"),
            careers_hint_url: row.get("careers_hint_url"),
        }))
    }

    async fn upsert_ats_endpoint(
        &self,
        company_id: i64,
        record: &AtsDetectionRecord,
        discovered_from_url: &str,
        detection_method: &str,
        verified: bool,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO ats_endpoints (
                company_id, ats_type, endpoint_url, discovered_from_url,
                detection_method, verified, detected_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, NOW(), NOW())
            ON CONFLICT (company_id, ats_type, endpoint_url)
            DO UPDATE SET discovered_from_url = EXCLUDED.discovered_from_url,
                          detection_method = EXCLUDED.detection_method,
                          verified = ats_endpoints.verified OR EXCLUDED.verified,
                          updated_at = NOW()
            "#,
        )
        .bind(company_id)
        .bind(record.ats_type.as_str())
        .bind(&record.endpoint_url)
        .bind(discovered_from_url)
        .bind(detection_method)
        .bind(verified)
        .execute(&self.pool)
        .await
        .context("Failed to upsert ats endpoint")?;
        Ok(())
    }

    async fn upsert_discovered_url(
        &self,
        company_id: i64,
        url: &str,
        kind: DiscoveredUrlKind,
        status: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO discovered_urls (company_id, url, url_kind, status, updated_at)
            VALUES ($1, $2, $3, $4, NOW())
            ON CONFLICT (company_id, url)
            DO UPDATE SET url_kind = EXCLUDED.url_kind,
                          status = EXCLUDED.status,
                          updated_at = NOW()
            "#,
        )
        .bind(company_id)
        .bind(url)
        .bind(kind.as_str())
        .bind(status)
        .execute(&self.pool)
        .await
        .context("Failed to upsert discovered url")?;
        Ok(())
    }

    async fn insert_sitemap_fetch(
        &self,
        company_id: i64,
        record: &SitemapFetchRecord,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sitemap_fetches (company_id, sitemap_url, fetched_at, url_count)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(company_id)
        .bind(&record.sitemap_url)
        .bind(record.fetched_at)
        .bind(record.url_count as i32)
        .execute(&self.pool)
        .await
        .context("Failed to insert sitemap fetch record")?;
        Ok(())
    }
}
