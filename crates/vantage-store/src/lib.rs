//! Persistence adapter for the recon pipeline.
//!
//! Every discovery write goes through a bulk upsert keyed on the entity's
//! natural key, so retries and stream re-deliveries converge on one row.
//! Job and scan rows are updated with atomic single-row UPDATEs.

pub mod memory;
pub mod postgres;
pub mod retry;

pub use memory::MemStore;
pub use postgres::PgStore;
pub use retry::with_store_retry;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use vantage_core::types::{
    Asset, AssetScanJob, BatchScanJob, BatchStatus, Discovery, DnsRecord, Endpoint,
    HistoricalUrl, HttpProbe, ResolvedUrl, Scan, ScanStatus, Subdomain,
};
use vantage_core::ScanError;

/// Bulk writes stay under this many rows per statement.
pub const UPSERT_WINDOW: usize = 500;

/// Outcome of one bulk upsert.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertStats {
    pub inserted: u64,
    pub updated: u64,
    pub skipped: u64,
}

impl UpsertStats {
    pub fn merge(&mut self, other: UpsertStats) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.skipped += other.skipped;
    }
}

/// Partial update of a scan row. `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct ScanUpdate {
    pub status: Option<ScanStatus>,
    pub total_domains: Option<u64>,
    pub completed_domains: Option<u64>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub config: Option<serde_json::Value>,
}

/// Partial update of a batch scan job row. `None` fields are left
/// untouched; `last_activity_at` is always refreshed.
#[derive(Debug, Clone, Default)]
pub struct BatchUpdate {
    pub status: Option<BatchStatus>,
    pub completed_domains: Option<u64>,
    pub failed_domains: Option<u64>,
    pub task_handle: Option<String>,
    pub retry_count: Option<u32>,
    pub error: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

impl BatchUpdate {
    pub fn status(status: BatchStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }
}

/// The persistence seam. Backed by Postgres in production and by an
/// in-memory map in tests; both honor the same conflict targets.
#[async_trait]
pub trait ScanStore: Send + Sync {
    async fn fetch_asset(&self, asset_id: Uuid) -> Result<Option<Asset>, ScanError>;

    async fn create_scan(&self, scan: &Scan) -> Result<(), ScanError>;
    async fn fetch_scan(&self, scan_id: Uuid) -> Result<Option<Scan>, ScanError>;
    async fn update_scan(&self, scan_id: Uuid, update: &ScanUpdate) -> Result<(), ScanError>;

    async fn create_asset_scan_job(&self, job: &AssetScanJob) -> Result<(), ScanError>;
    async fn update_asset_scan_job(
        &self,
        job_id: Uuid,
        status: ScanStatus,
        completed_domains: u64,
    ) -> Result<(), ScanError>;

    async fn create_batch(&self, batch: &BatchScanJob) -> Result<(), ScanError>;
    async fn fetch_batch(&self, batch_id: Uuid) -> Result<Option<BatchScanJob>, ScanError>;
    async fn update_batch(&self, batch_id: Uuid, update: &BatchUpdate) -> Result<(), ScanError>;

    async fn upsert_subdomains(&self, records: &[Subdomain]) -> Result<UpsertStats, ScanError>;
    async fn upsert_dns_records(&self, records: &[DnsRecord]) -> Result<UpsertStats, ScanError>;
    async fn insert_http_probes(&self, records: &[HttpProbe]) -> Result<UpsertStats, ScanError>;
    async fn upsert_endpoints(&self, records: &[Endpoint]) -> Result<UpsertStats, ScanError>;
    async fn upsert_historical_urls(
        &self,
        records: &[HistoricalUrl],
    ) -> Result<UpsertStats, ScanError>;
    async fn upsert_urls(&self, records: &[ResolvedUrl]) -> Result<UpsertStats, ScanError>;

    /// Raw module-profile rows from the registry table. The registry crate
    /// owns the schema; an empty result means "use the builtin seed".
    async fn fetch_module_profiles(&self) -> Result<Vec<serde_json::Value>, ScanError>;

    /// Inputs for a consumer module that seeds from prior discoveries:
    /// dnsx/httpx read subdomains, katana reads probed URLs, urlfinder
    /// reads harvested URLs.
    async fn fetch_seed_data(
        &self,
        module: &str,
        asset_id: Uuid,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<String>, ScanError>;

    /// How many seed rows `fetch_seed_data` would page through; the
    /// pipeline sizes store-seeded batches from this.
    async fn count_seed_data(&self, module: &str, asset_id: Uuid) -> Result<u64, ScanError>;
}

/// Route a mixed batch of discoveries to the per-entity bulk upserts, in
/// windows of at most [`UPSERT_WINDOW`] rows each.
pub async fn upsert_discoveries(
    store: &dyn ScanStore,
    discoveries: &[Discovery],
) -> Result<UpsertStats, ScanError> {
    let mut subdomains = Vec::new();
    let mut dns = Vec::new();
    let mut probes = Vec::new();
    let mut endpoints = Vec::new();
    let mut historical = Vec::new();
    let mut urls = Vec::new();

    for d in discoveries {
        match d {
            Discovery::Subdomain(r) => subdomains.push(r.clone()),
            Discovery::Dns(r) => dns.push(r.clone()),
            Discovery::HttpProbe(r) => probes.push(r.clone()),
            Discovery::Endpoint(r) => endpoints.push(r.clone()),
            Discovery::HistoricalUrl(r) => historical.push(r.clone()),
            Discovery::Url(r) => urls.push(r.clone()),
        }
    }

    let mut stats = UpsertStats::default();
    for window in subdomains.chunks(UPSERT_WINDOW) {
        stats.merge(store.upsert_subdomains(window).await?);
    }
    for window in dns.chunks(UPSERT_WINDOW) {
        stats.merge(store.upsert_dns_records(window).await?);
    }
    for window in probes.chunks(UPSERT_WINDOW) {
        stats.merge(store.insert_http_probes(window).await?);
    }
    for window in endpoints.chunks(UPSERT_WINDOW) {
        stats.merge(store.upsert_endpoints(window).await?);
    }
    for window in historical.chunks(UPSERT_WINDOW) {
        stats.merge(store.upsert_historical_urls(window).await?);
    }
    for window in urls.chunks(UPSERT_WINDOW) {
        stats.merge(store.upsert_urls(window).await?);
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_stats_merge_accumulates() {
        let mut a = UpsertStats {
            inserted: 1,
            updated: 2,
            skipped: 3,
        };
        a.merge(UpsertStats {
            inserted: 10,
            updated: 0,
            skipped: 1,
        });
        assert_eq!(a.inserted, 11);
        assert_eq!(a.updated, 2);
        assert_eq!(a.skipped, 4);
    }
}
