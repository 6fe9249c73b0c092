//! Postgres backend for the persistence adapter.
//!
//! Bulk upserts bind parallel arrays and go through
//! `INSERT ... SELECT FROM UNNEST(...) ON CONFLICT`, with `(xmax = 0)` in
//! the RETURNING clause to split inserts from updates. Job and scan rows
//! use single-row atomic UPDATEs with COALESCE so unset fields stay put.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use uuid::Uuid;

use vantage_core::types::{
    Asset, AssetScanJob, BatchScanJob, BatchStatus, DnsRecord, Endpoint, HistoricalUrl,
    HttpProbe, ResolvedUrl, Scan, ScanStatus, Subdomain,
};
use vantage_core::ScanError;

use crate::{BatchUpdate, ScanStore, ScanUpdate, UpsertStats};

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, ScanError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(classify)?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn classify(e: sqlx::Error) -> ScanError {
    match e {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            ScanError::TransientStore(e.to_string())
        }
        other => ScanError::Store(other.to_string()),
    }
}

fn scan_status(raw: &str) -> Result<ScanStatus, ScanError> {
    serde_json::from_value(serde_json::Value::String(raw.to_string()))
        .map_err(|_| ScanError::Store(format!("unknown scan status '{raw}'")))
}

fn batch_status(raw: &str) -> Result<BatchStatus, ScanError> {
    serde_json::from_value(serde_json::Value::String(raw.to_string()))
        .map_err(|_| ScanError::Store(format!("unknown batch status '{raw}'")))
}

/// Fold `(xmax = 0)` flags from a RETURNING clause into stats. Rows the
/// conflict clause dropped entirely count as skipped.
fn stats_from_flags(total: usize, flags: Vec<bool>) -> UpsertStats {
    let inserted = flags.iter().filter(|f| **f).count() as u64;
    let updated = flags.len() as u64 - inserted;
    UpsertStats {
        inserted,
        updated,
        skipped: total as u64 - flags.len() as u64,
    }
}

#[async_trait]
impl ScanStore for PgStore {
    async fn fetch_asset(&self, asset_id: Uuid) -> Result<Option<Asset>, ScanError> {
        let row: Option<(Uuid, Vec<String>)> =
            sqlx::query_as("SELECT id, apex_domains FROM assets WHERE id = $1")
                .bind(asset_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(classify)?;
        Ok(row.map(|(id, apex_domains)| Asset { id, apex_domains }))
    }

    async fn create_scan(&self, scan: &Scan) -> Result<(), ScanError> {
        sqlx::query(
            "INSERT INTO scans (id, user_id, asset_ids, modules, status, total_domains,
                 completed_domains, created_at, timeout_seconds, config)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(scan.id)
        .bind(scan.user_id)
        .bind(&scan.asset_ids)
        .bind(&scan.modules)
        .bind(scan.status.as_str())
        .bind(scan.total_domains as i64)
        .bind(scan.completed_domains as i64)
        .bind(scan.created_at)
        .bind(scan.timeout_seconds as i64)
        .bind(&scan.config)
        .execute(&self.pool)
        .await
        .map_err(classify)?;
        Ok(())
    }

    async fn fetch_scan(&self, scan_id: Uuid) -> Result<Option<Scan>, ScanError> {
        type Row = (
            Uuid,
            Uuid,
            Vec<Uuid>,
            Vec<String>,
            String,
            i64,
            i64,
            DateTime<Utc>,
            Option<DateTime<Utc>>,
            Option<DateTime<Utc>>,
            serde_json::Value,
            i64,
        );
        let row: Option<Row> = sqlx::query_as(
            "SELECT id, user_id, asset_ids, modules, status, total_domains,
                 completed_domains, created_at, started_at, completed_at, config,
                 timeout_seconds
             FROM scans WHERE id = $1",
        )
        .bind(scan_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(classify)?;

        row.map(|r| {
            Ok(Scan {
                id: r.0,
                user_id: r.1,
                asset_ids: r.2,
                modules: r.3,
                status: scan_status(&r.4)?,
                total_domains: r.5 as u64,
                completed_domains: r.6 as u64,
                created_at: r.7,
                started_at: r.8,
                completed_at: r.9,
                config: r.10,
                timeout_seconds: r.11 as u64,
            })
        })
        .transpose()
    }

    async fn update_scan(&self, scan_id: Uuid, update: &ScanUpdate) -> Result<(), ScanError> {
        sqlx::query(
            "UPDATE scans SET
                 status = COALESCE($2, status),
                 total_domains = COALESCE($3, total_domains),
                 completed_domains = COALESCE($4, completed_domains),
                 started_at = COALESCE($5, started_at),
                 completed_at = COALESCE($6, completed_at),
                 config = COALESCE($7, config)
             WHERE id = $1",
        )
        .bind(scan_id)
        .bind(update.status.map(|s| s.as_str()))
        .bind(update.total_domains.map(|v| v as i64))
        .bind(update.completed_domains.map(|v| v as i64))
        .bind(update.started_at)
        .bind(update.completed_at)
        .bind(&update.config)
        .execute(&self.pool)
        .await
        .map_err(classify)?;
        Ok(())
    }

    async fn create_asset_scan_job(&self, job: &AssetScanJob) -> Result<(), ScanError> {
        sqlx::query(
            "INSERT INTO asset_scan_jobs (id, parent_scan_id, asset_id, status,
                 total_domains, completed_domains, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(job.id)
        .bind(job.parent_scan_id)
        .bind(job.asset_id)
        .bind(job.status.as_str())
        .bind(job.total_domains as i64)
        .bind(job.completed_domains as i64)
        .bind(job.created_at)
        .execute(&self.pool)
        .await
        .map_err(classify)?;
        Ok(())
    }

    async fn update_asset_scan_job(
        &self,
        job_id: Uuid,
        status: ScanStatus,
        completed_domains: u64,
    ) -> Result<(), ScanError> {
        sqlx::query(
            "UPDATE asset_scan_jobs SET status = $2, completed_domains = $3,
                 completed_at = CASE WHEN $2 IN ('completed', 'partial_failure', 'failed',
                     'cancelled') THEN now() ELSE completed_at END
             WHERE id = $1",
        )
        .bind(job_id)
        .bind(status.as_str())
        .bind(completed_domains as i64)
        .execute(&self.pool)
        .await
        .map_err(classify)?;
        Ok(())
    }

    async fn create_batch(&self, batch: &BatchScanJob) -> Result<(), ScanError> {
        let mapping = serde_json::to_value(&batch.asset_scan_mapping)
            .map_err(|e| ScanError::Store(e.to_string()))?;
        sqlx::query(
            "INSERT INTO batch_scan_jobs (id, module, status, batch_domains,
                 asset_scan_mapping, total_domains, completed_domains, failed_domains,
                 allocated_cpu, allocated_memory, est_duration_minutes, task_handle,
                 last_activity_at, retry_count, max_retries, error)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)",
        )
        .bind(batch.id)
        .bind(&batch.module)
        .bind(batch.status.as_str())
        .bind(&batch.batch_domains)
        .bind(mapping)
        .bind(batch.total_domains as i64)
        .bind(batch.completed_domains as i64)
        .bind(batch.failed_domains as i64)
        .bind(batch.allocated_cpu as i32)
        .bind(batch.allocated_memory as i32)
        .bind(batch.est_duration_minutes as i64)
        .bind(&batch.task_handle)
        .bind(batch.last_activity_at)
        .bind(batch.retry_count as i32)
        .bind(batch.max_retries as i32)
        .bind(&batch.error)
        .execute(&self.pool)
        .await
        .map_err(classify)?;
        Ok(())
    }

    async fn fetch_batch(&self, batch_id: Uuid) -> Result<Option<BatchScanJob>, ScanError> {
        type Row = (
            Uuid,
            String,
            String,
            Vec<String>,
            serde_json::Value,
            i64,
            i64,
            i64,
            i32,
            i32,
            i64,
            Option<String>,
            DateTime<Utc>,
            i32,
            i32,
            Option<String>,
        );
        let row: Option<Row> = sqlx::query_as(
            "SELECT id, module, status, batch_domains, asset_scan_mapping,
                 total_domains, completed_domains, failed_domains, allocated_cpu,
                 allocated_memory, est_duration_minutes, task_handle, last_activity_at,
                 retry_count, max_retries, error
             FROM batch_scan_jobs WHERE id = $1",
        )
        .bind(batch_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(classify)?;

        row.map(|r| {
            Ok(BatchScanJob {
                id: r.0,
                module: r.1,
                status: batch_status(&r.2)?,
                batch_domains: r.3,
                asset_scan_mapping: serde_json::from_value(r.4)
                    .map_err(|e| ScanError::Store(e.to_string()))?,
                total_domains: r.5 as u64,
                completed_domains: r.6 as u64,
                failed_domains: r.7 as u64,
                allocated_cpu: r.8 as u32,
                allocated_memory: r.9 as u32,
                est_duration_minutes: r.10 as u64,
                task_handle: r.11,
                last_activity_at: r.12,
                retry_count: r.13 as u32,
                max_retries: r.14 as u32,
                error: r.15,
            })
        })
        .transpose()
    }

    async fn update_batch(&self, batch_id: Uuid, update: &BatchUpdate) -> Result<(), ScanError> {
        sqlx::query(
            "UPDATE batch_scan_jobs SET
                 status = COALESCE($2, status),
                 completed_domains = COALESCE($3, completed_domains),
                 failed_domains = COALESCE($4, failed_domains),
                 task_handle = COALESCE($5, task_handle),
                 retry_count = COALESCE($6, retry_count),
                 error = COALESCE($7, error),
                 metadata = COALESCE($8, metadata),
                 last_activity_at = now()
             WHERE id = $1",
        )
        .bind(batch_id)
        .bind(update.status.map(|s| s.as_str()))
        .bind(update.completed_domains.map(|v| v as i64))
        .bind(update.failed_domains.map(|v| v as i64))
        .bind(&update.task_handle)
        .bind(update.retry_count.map(|v| v as i32))
        .bind(&update.error)
        .bind(&update.metadata)
        .execute(&self.pool)
        .await
        .map_err(classify)?;
        Ok(())
    }

    async fn upsert_subdomains(&self, records: &[Subdomain]) -> Result<UpsertStats, ScanError> {
        if records.is_empty() {
            return Ok(UpsertStats::default());
        }
        let mut scan_job_ids = Vec::with_capacity(records.len());
        let mut asset_ids = Vec::with_capacity(records.len());
        let mut names = Vec::with_capacity(records.len());
        let mut sources = Vec::with_capacity(records.len());
        let mut discovered = Vec::with_capacity(records.len());
        for r in records {
            scan_job_ids.push(r.scan_job_id);
            asset_ids.push(r.asset_id);
            names.push(r.subdomain.to_ascii_lowercase());
            sources.push(r.source.clone());
            discovered.push(r.discovered_at);
        }

        let flags: Vec<(bool,)> = sqlx::query_as(
            "INSERT INTO subdomains (scan_job_id, asset_id, subdomain, source,
                 discovered_at, last_seen_at, times_discovered)
             SELECT t.scan_job_id, t.asset_id, t.subdomain, t.source, t.discovered_at,
                 t.discovered_at, 1
             FROM UNNEST($1::uuid[], $2::uuid[], $3::text[], $4::text[], $5::timestamptz[])
                 AS t(scan_job_id, asset_id, subdomain, source, discovered_at)
             ON CONFLICT (asset_id, subdomain) DO UPDATE SET
                 last_seen_at = GREATEST(subdomains.last_seen_at, EXCLUDED.last_seen_at),
                 times_discovered = subdomains.times_discovered + 1
             RETURNING (xmax = 0)",
        )
        .bind(&scan_job_ids)
        .bind(&asset_ids)
        .bind(&names)
        .bind(&sources)
        .bind(&discovered)
        .fetch_all(&self.pool)
        .await
        .map_err(classify)?;

        Ok(stats_from_flags(
            records.len(),
            flags.into_iter().map(|(f,)| f).collect(),
        ))
    }

    async fn upsert_dns_records(&self, records: &[DnsRecord]) -> Result<UpsertStats, ScanError> {
        if records.is_empty() {
            return Ok(UpsertStats::default());
        }
        let mut scan_job_ids = Vec::with_capacity(records.len());
        let mut asset_ids = Vec::with_capacity(records.len());
        let mut names = Vec::with_capacity(records.len());
        let mut types = Vec::with_capacity(records.len());
        let mut values = Vec::with_capacity(records.len());
        let mut priorities: Vec<Option<i32>> = Vec::with_capacity(records.len());
        let mut sources = Vec::with_capacity(records.len());
        let mut discovered = Vec::with_capacity(records.len());
        for r in records {
            scan_job_ids.push(r.scan_job_id);
            asset_ids.push(r.asset_id);
            names.push(r.subdomain.to_ascii_lowercase());
            types.push(r.record_type.clone());
            values.push(r.record_value.clone());
            priorities.push(r.priority);
            sources.push(r.source.clone());
            discovered.push(r.discovered_at);
        }

        let flags: Vec<(bool,)> = sqlx::query_as(
            "INSERT INTO dns_records (scan_job_id, asset_id, subdomain, record_type,
                 record_value, priority, source, discovered_at)
             SELECT * FROM UNNEST($1::uuid[], $2::uuid[], $3::text[], $4::text[],
                 $5::text[], $6::int[], $7::text[], $8::timestamptz[])
             ON CONFLICT (subdomain, record_type, record_value, priority) DO UPDATE SET
                 scan_job_id = EXCLUDED.scan_job_id,
                 source = EXCLUDED.source,
                 discovered_at = EXCLUDED.discovered_at
             RETURNING (xmax = 0)",
        )
        .bind(&scan_job_ids)
        .bind(&asset_ids)
        .bind(&names)
        .bind(&types)
        .bind(&values)
        .bind(&priorities)
        .bind(&sources)
        .bind(&discovered)
        .fetch_all(&self.pool)
        .await
        .map_err(classify)?;

        Ok(stats_from_flags(
            records.len(),
            flags.into_iter().map(|(f,)| f).collect(),
        ))
    }

    async fn insert_http_probes(&self, records: &[HttpProbe]) -> Result<UpsertStats, ScanError> {
        if records.is_empty() {
            return Ok(UpsertStats::default());
        }
        let mut scan_job_ids = Vec::with_capacity(records.len());
        let mut asset_ids = Vec::with_capacity(records.len());
        let mut names = Vec::with_capacity(records.len());
        let mut schemes = Vec::with_capacity(records.len());
        let mut ports = Vec::with_capacity(records.len());
        let mut status_codes: Vec<Option<i32>> = Vec::with_capacity(records.len());
        let mut titles: Vec<Option<String>> = Vec::with_capacity(records.len());
        let mut servers: Vec<Option<String>> = Vec::with_capacity(records.len());
        let mut lengths: Vec<Option<i64>> = Vec::with_capacity(records.len());
        let mut sources = Vec::with_capacity(records.len());
        let mut discovered = Vec::with_capacity(records.len());
        for r in records {
            scan_job_ids.push(r.scan_job_id);
            asset_ids.push(r.asset_id);
            names.push(r.subdomain.to_ascii_lowercase());
            schemes.push(r.scheme.clone());
            ports.push(r.port as i32);
            status_codes.push(r.status_code.map(|c| c as i32));
            titles.push(r.title.clone());
            servers.push(r.web_server.clone());
            lengths.push(r.content_length.map(|l| l as i64));
            sources.push(r.source.clone());
            discovered.push(r.discovered_at);
        }

        // Probes are per-scan observations: no cross-scan dedupe, just
        // idempotent re-delivery within a scan job.
        let inserted: Vec<(Uuid,)> = sqlx::query_as(
            "INSERT INTO http_probes (scan_job_id, asset_id, subdomain, scheme, port,
                 status_code, title, web_server, content_length, source, discovered_at)
             SELECT * FROM UNNEST($1::uuid[], $2::uuid[], $3::text[], $4::text[],
                 $5::int[], $6::int[], $7::text[], $8::text[], $9::bigint[],
                 $10::text[], $11::timestamptz[])
             ON CONFLICT (scan_job_id, subdomain, scheme, port) DO NOTHING
             RETURNING scan_job_id",
        )
        .bind(&scan_job_ids)
        .bind(&asset_ids)
        .bind(&names)
        .bind(&schemes)
        .bind(&ports)
        .bind(&status_codes)
        .bind(&titles)
        .bind(&servers)
        .bind(&lengths)
        .bind(&sources)
        .bind(&discovered)
        .fetch_all(&self.pool)
        .await
        .map_err(classify)?;

        Ok(UpsertStats {
            inserted: inserted.len() as u64,
            updated: 0,
            skipped: records.len() as u64 - inserted.len() as u64,
        })
    }

    async fn upsert_endpoints(&self, records: &[Endpoint]) -> Result<UpsertStats, ScanError> {
        if records.is_empty() {
            return Ok(UpsertStats::default());
        }
        let mut scan_job_ids = Vec::with_capacity(records.len());
        let mut asset_ids = Vec::with_capacity(records.len());
        let mut urls = Vec::with_capacity(records.len());
        let mut hashes = Vec::with_capacity(records.len());
        let mut sources = Vec::with_capacity(records.len());
        let mut discovered = Vec::with_capacity(records.len());
        for r in records {
            scan_job_ids.push(r.scan_job_id);
            asset_ids.push(r.asset_id);
            urls.push(r.url.clone());
            hashes.push(r.url_hash.clone());
            sources.push(r.source.clone());
            discovered.push(r.discovered_at);
        }

        let flags: Vec<(bool,)> = sqlx::query_as(
            "INSERT INTO crawled_endpoints (scan_job_id, asset_id, url, url_hash,
                 source, discovered_at, last_seen_at, times_discovered)
             SELECT t.scan_job_id, t.asset_id, t.url, t.url_hash, t.source,
                 t.discovered_at, t.discovered_at, 1
             FROM UNNEST($1::uuid[], $2::uuid[], $3::text[], $4::text[], $5::text[],
                 $6::timestamptz[])
                 AS t(scan_job_id, asset_id, url, url_hash, source, discovered_at)
             ON CONFLICT (asset_id, url_hash) DO UPDATE SET
                 last_seen_at = GREATEST(crawled_endpoints.last_seen_at, EXCLUDED.last_seen_at),
                 times_discovered = crawled_endpoints.times_discovered + 1
             RETURNING (xmax = 0)",
        )
        .bind(&scan_job_ids)
        .bind(&asset_ids)
        .bind(&urls)
        .bind(&hashes)
        .bind(&sources)
        .bind(&discovered)
        .fetch_all(&self.pool)
        .await
        .map_err(classify)?;

        Ok(stats_from_flags(
            records.len(),
            flags.into_iter().map(|(f,)| f).collect(),
        ))
    }

    async fn upsert_historical_urls(
        &self,
        records: &[HistoricalUrl],
    ) -> Result<UpsertStats, ScanError> {
        if records.is_empty() {
            return Ok(UpsertStats::default());
        }
        let mut scan_job_ids = Vec::with_capacity(records.len());
        let mut asset_ids = Vec::with_capacity(records.len());
        let mut urls = Vec::with_capacity(records.len());
        let mut hashes = Vec::with_capacity(records.len());
        let mut sources = Vec::with_capacity(records.len());
        let mut discovered = Vec::with_capacity(records.len());
        for r in records {
            scan_job_ids.push(r.scan_job_id);
            asset_ids.push(r.asset_id);
            urls.push(r.url.clone());
            hashes.push(r.url_hash.clone());
            sources.push(r.source.clone());
            discovered.push(r.discovered_at);
        }

        let inserted: Vec<(Uuid,)> = sqlx::query_as(
            "INSERT INTO historical_urls (scan_job_id, asset_id, url, url_hash,
                 source, discovered_at)
             SELECT * FROM UNNEST($1::uuid[], $2::uuid[], $3::text[], $4::text[],
                 $5::text[], $6::timestamptz[])
             ON CONFLICT (asset_id, url_hash) DO NOTHING
             RETURNING scan_job_id",
        )
        .bind(&scan_job_ids)
        .bind(&asset_ids)
        .bind(&urls)
        .bind(&hashes)
        .bind(&sources)
        .bind(&discovered)
        .fetch_all(&self.pool)
        .await
        .map_err(classify)?;

        Ok(UpsertStats {
            inserted: inserted.len() as u64,
            updated: 0,
            skipped: records.len() as u64 - inserted.len() as u64,
        })
    }

    async fn upsert_urls(&self, records: &[ResolvedUrl]) -> Result<UpsertStats, ScanError> {
        if records.is_empty() {
            return Ok(UpsertStats::default());
        }
        let mut scan_job_ids = Vec::with_capacity(records.len());
        let mut asset_ids = Vec::with_capacity(records.len());
        let mut urls = Vec::with_capacity(records.len());
        let mut hashes = Vec::with_capacity(records.len());
        let mut alive = Vec::with_capacity(records.len());
        let mut status_codes: Vec<Option<i32>> = Vec::with_capacity(records.len());
        let mut sources: Vec<serde_json::Value> = Vec::with_capacity(records.len());
        let mut discovered = Vec::with_capacity(records.len());
        for r in records {
            scan_job_ids.push(r.scan_job_id);
            asset_ids.push(r.asset_id);
            urls.push(r.url.clone());
            hashes.push(r.url_hash.clone());
            alive.push(r.alive);
            status_codes.push(r.status_code.map(|c| c as i32));
            sources.push(serde_json::Value::from(r.sources.clone()));
            discovered.push(r.discovered_at);
        }

        // `sources` is a jsonb string set; re-discovery unions it.
        let flags: Vec<(bool,)> = sqlx::query_as(
            "INSERT INTO urls (scan_job_id, asset_id, url, url_hash, alive,
                 status_code, sources, discovered_at)
             SELECT * FROM UNNEST($1::uuid[], $2::uuid[], $3::text[], $4::text[],
                 $5::bool[], $6::int[], $7::jsonb[], $8::timestamptz[])
             ON CONFLICT (asset_id, url_hash) DO UPDATE SET
                 alive = EXCLUDED.alive,
                 status_code = EXCLUDED.status_code,
                 sources = (SELECT COALESCE(jsonb_agg(DISTINCT s), '[]'::jsonb)
                     FROM jsonb_array_elements_text(urls.sources || EXCLUDED.sources) AS t(s)),
                 discovered_at = LEAST(urls.discovered_at, EXCLUDED.discovered_at)
             RETURNING (xmax = 0)",
        )
        .bind(&scan_job_ids)
        .bind(&asset_ids)
        .bind(&urls)
        .bind(&hashes)
        .bind(&alive)
        .bind(&status_codes)
        .bind(&sources)
        .bind(&discovered)
        .fetch_all(&self.pool)
        .await
        .map_err(classify)?;

        Ok(stats_from_flags(
            records.len(),
            flags.into_iter().map(|(f,)| f).collect(),
        ))
    }

    async fn fetch_module_profiles(&self) -> Result<Vec<serde_json::Value>, ScanError> {
        let rows: Vec<(serde_json::Value,)> =
            sqlx::query_as("SELECT profile FROM module_profiles WHERE active")
                .fetch_all(&self.pool)
                .await
                .map_err(classify)?;
        Ok(rows.into_iter().map(|(p,)| p).collect())
    }

    async fn fetch_seed_data(
        &self,
        module: &str,
        asset_id: Uuid,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<String>, ScanError> {
        match module {
            "dnsx" | "httpx" => {
                let rows: Vec<(String,)> = sqlx::query_as(
                    "SELECT subdomain FROM subdomains WHERE asset_id = $1
                     ORDER BY subdomain OFFSET $2 LIMIT $3",
                )
                .bind(asset_id)
                .bind(offset as i64)
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await
                .map_err(classify)?;
                Ok(rows.into_iter().map(|(s,)| s).collect())
            }
            "katana" => {
                let rows: Vec<(String, i32, String)> = sqlx::query_as(
                    "SELECT scheme, port, subdomain FROM http_probes WHERE asset_id = $1
                     ORDER BY subdomain, scheme, port OFFSET $2 LIMIT $3",
                )
                .bind(asset_id)
                .bind(offset as i64)
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await
                .map_err(classify)?;
                Ok(rows
                    .into_iter()
                    .map(|(scheme, port, subdomain)| probe_url(&scheme, port as u16, &subdomain))
                    .collect())
            }
            "urlfinder" => {
                let rows: Vec<(String,)> = sqlx::query_as(
                    "SELECT url FROM (
                         SELECT url FROM crawled_endpoints WHERE asset_id = $1
                         UNION
                         SELECT url FROM historical_urls WHERE asset_id = $1
                     ) AS harvested
                     ORDER BY url OFFSET $2 LIMIT $3",
                )
                .bind(asset_id)
                .bind(offset as i64)
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await
                .map_err(classify)?;
                Ok(rows.into_iter().map(|(u,)| u).collect())
            }
            other => Err(ScanError::UnknownModule(other.to_string())),
        }
    }

    async fn count_seed_data(&self, module: &str, asset_id: Uuid) -> Result<u64, ScanError> {
        let query = match module {
            "dnsx" | "httpx" => "SELECT COUNT(*) FROM subdomains WHERE asset_id = $1",
            "katana" => "SELECT COUNT(*) FROM http_probes WHERE asset_id = $1",
            "urlfinder" => {
                "SELECT COUNT(*) FROM (
                     SELECT url FROM crawled_endpoints WHERE asset_id = $1
                     UNION
                     SELECT url FROM historical_urls WHERE asset_id = $1
                 ) AS harvested"
            }
            other => return Err(ScanError::UnknownModule(other.to_string())),
        };
        let row: (i64,) = sqlx::query_as(query)
            .bind(asset_id)
            .fetch_one(&self.pool)
            .await
            .map_err(classify)?;
        Ok(row.0 as u64)
    }
}

/// Rebuild the probed URL, omitting the default port for its scheme.
pub(crate) fn probe_url(scheme: &str, port: u16, subdomain: &str) -> String {
    let default = matches!((scheme, port), ("http", 80) | ("https", 443));
    if default {
        format!("{scheme}://{subdomain}")
    } else {
        format!("{scheme}://{subdomain}:{port}")
    }
}
