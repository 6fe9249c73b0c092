//! In-memory store backend.
//!
//! Keyed by the same natural keys as the Postgres schema so idempotency
//! behaves identically; tests inject assets and inspect rows directly.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

use vantage_core::types::{
    Asset, AssetScanJob, BatchScanJob, DnsRecord, Endpoint, HistoricalUrl, HttpProbe,
    ResolvedUrl, Scan, ScanStatus, Subdomain,
};
use vantage_core::ScanError;

use crate::postgres::probe_url;
use crate::{BatchUpdate, ScanStore, ScanUpdate, UpsertStats};

#[derive(Debug, Clone)]
pub struct StoredSubdomain {
    pub record: Subdomain,
    pub last_seen_at: DateTime<Utc>,
    pub times_discovered: u32,
}

#[derive(Debug, Clone)]
pub struct StoredEndpoint {
    pub record: Endpoint,
    pub last_seen_at: DateTime<Utc>,
    pub times_discovered: u32,
}

#[derive(Default)]
struct Inner {
    assets: HashMap<Uuid, Asset>,
    scans: HashMap<Uuid, Scan>,
    asset_jobs: HashMap<Uuid, AssetScanJob>,
    batches: HashMap<Uuid, BatchScanJob>,
    batch_metadata: HashMap<Uuid, serde_json::Value>,
    subdomains: HashMap<(Uuid, String), StoredSubdomain>,
    dns: HashMap<(String, String, String, i32), DnsRecord>,
    probes: HashMap<(Uuid, String, String, u16), HttpProbe>,
    endpoints: HashMap<(Uuid, String), StoredEndpoint>,
    historical: HashMap<(Uuid, String), HistoricalUrl>,
    urls: HashMap<(Uuid, String), ResolvedUrl>,
    module_profiles: Vec<serde_json::Value>,
    /// Remaining update_batch calls to fail with a transient error.
    flaky_batch_updates: u32,
}

#[derive(Default)]
pub struct MemStore {
    inner: Mutex<Inner>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_asset(&self, asset: Asset) {
        self.inner.lock().unwrap().assets.insert(asset.id, asset);
    }

    /// Make the next `n` update_batch calls fail transiently.
    pub fn fail_next_batch_updates(&self, n: u32) {
        self.inner.lock().unwrap().flaky_batch_updates = n;
    }

    pub fn insert_module_profile(&self, profile: serde_json::Value) {
        self.inner.lock().unwrap().module_profiles.push(profile);
    }

    pub fn scan(&self, scan_id: Uuid) -> Option<Scan> {
        self.inner.lock().unwrap().scans.get(&scan_id).cloned()
    }

    pub fn batch(&self, batch_id: Uuid) -> Option<BatchScanJob> {
        self.inner.lock().unwrap().batches.get(&batch_id).cloned()
    }

    pub fn batches(&self) -> Vec<BatchScanJob> {
        self.inner.lock().unwrap().batches.values().cloned().collect()
    }

    pub fn asset_jobs(&self) -> Vec<AssetScanJob> {
        self.inner
            .lock()
            .unwrap()
            .asset_jobs
            .values()
            .cloned()
            .collect()
    }

    pub fn subdomain_names(&self, asset_id: Uuid) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        let mut names: Vec<String> = inner
            .subdomains
            .keys()
            .filter(|(a, _)| *a == asset_id)
            .map(|(_, s)| s.clone())
            .collect();
        names.sort();
        names
    }

    pub fn times_discovered(&self, asset_id: Uuid, subdomain: &str) -> Option<u32> {
        self.inner
            .lock()
            .unwrap()
            .subdomains
            .get(&(asset_id, subdomain.to_ascii_lowercase()))
            .map(|s| s.times_discovered)
    }

    pub fn subdomain_count(&self) -> usize {
        self.inner.lock().unwrap().subdomains.len()
    }

    pub fn dns_record_count(&self) -> usize {
        self.inner.lock().unwrap().dns.len()
    }

    pub fn probe_count(&self) -> usize {
        self.inner.lock().unwrap().probes.len()
    }

    pub fn endpoint_count(&self) -> usize {
        self.inner.lock().unwrap().endpoints.len()
    }

    pub fn historical_count(&self) -> usize {
        self.inner.lock().unwrap().historical.len()
    }

    pub fn url_count(&self) -> usize {
        self.inner.lock().unwrap().urls.len()
    }

    pub fn url_sources(&self, asset_id: Uuid, url_hash: &str) -> Vec<String> {
        self.inner
            .lock()
            .unwrap()
            .urls
            .get(&(asset_id, url_hash.to_string()))
            .map(|u| u.sources.clone())
            .unwrap_or_default()
    }

    pub fn batch_metadata(&self, batch_id: Uuid) -> Option<serde_json::Value> {
        self.inner
            .lock()
            .unwrap()
            .batch_metadata
            .get(&batch_id)
            .cloned()
    }
}

#[async_trait]
impl ScanStore for MemStore {
    async fn fetch_asset(&self, asset_id: Uuid) -> Result<Option<Asset>, ScanError> {
        Ok(self.inner.lock().unwrap().assets.get(&asset_id).cloned())
    }

    async fn create_scan(&self, scan: &Scan) -> Result<(), ScanError> {
        self.inner
            .lock()
            .unwrap()
            .scans
            .insert(scan.id, scan.clone());
        Ok(())
    }

    async fn fetch_scan(&self, scan_id: Uuid) -> Result<Option<Scan>, ScanError> {
        Ok(self.inner.lock().unwrap().scans.get(&scan_id).cloned())
    }

    async fn update_scan(&self, scan_id: Uuid, update: &ScanUpdate) -> Result<(), ScanError> {
        let mut inner = self.inner.lock().unwrap();
        let scan = inner
            .scans
            .get_mut(&scan_id)
            .ok_or_else(|| ScanError::Store(format!("no scan {scan_id}")))?;
        if let Some(status) = update.status {
            scan.status = status;
        }
        if let Some(total) = update.total_domains {
            scan.total_domains = total;
        }
        if let Some(done) = update.completed_domains {
            scan.completed_domains = done;
        }
        if update.started_at.is_some() {
            scan.started_at = update.started_at;
        }
        if update.completed_at.is_some() {
            scan.completed_at = update.completed_at;
        }
        if let Some(config) = &update.config {
            scan.config = config.clone();
        }
        Ok(())
    }

    async fn create_asset_scan_job(&self, job: &AssetScanJob) -> Result<(), ScanError> {
        self.inner
            .lock()
            .unwrap()
            .asset_jobs
            .insert(job.id, job.clone());
        Ok(())
    }

    async fn update_asset_scan_job(
        &self,
        job_id: Uuid,
        status: ScanStatus,
        completed_domains: u64,
    ) -> Result<(), ScanError> {
        let mut inner = self.inner.lock().unwrap();
        let job = inner
            .asset_jobs
            .get_mut(&job_id)
            .ok_or_else(|| ScanError::Store(format!("no asset scan job {job_id}")))?;
        job.status = status;
        job.completed_domains = completed_domains;
        if status.is_terminal() {
            job.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn create_batch(&self, batch: &BatchScanJob) -> Result<(), ScanError> {
        self.inner
            .lock()
            .unwrap()
            .batches
            .insert(batch.id, batch.clone());
        Ok(())
    }

    async fn fetch_batch(&self, batch_id: Uuid) -> Result<Option<BatchScanJob>, ScanError> {
        Ok(self.inner.lock().unwrap().batches.get(&batch_id).cloned())
    }

    async fn update_batch(&self, batch_id: Uuid, update: &BatchUpdate) -> Result<(), ScanError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.flaky_batch_updates > 0 {
            inner.flaky_batch_updates -= 1;
            return Err(ScanError::TransientStore("injected failure".to_string()));
        }
        if let Some(metadata) = &update.metadata {
            inner.batch_metadata.insert(batch_id, metadata.clone());
        }
        let batch = inner
            .batches
            .get_mut(&batch_id)
            .ok_or_else(|| ScanError::Store(format!("no batch {batch_id}")))?;
        if let Some(status) = update.status {
            batch.status = status;
        }
        if let Some(done) = update.completed_domains {
            batch.completed_domains = done;
        }
        if let Some(failed) = update.failed_domains {
            batch.failed_domains = failed;
        }
        if update.task_handle.is_some() {
            batch.task_handle = update.task_handle.clone();
        }
        if let Some(retries) = update.retry_count {
            batch.retry_count = retries;
        }
        if update.error.is_some() {
            batch.error = update.error.clone();
        }
        batch.last_activity_at = Utc::now();
        Ok(())
    }

    async fn upsert_subdomains(&self, records: &[Subdomain]) -> Result<UpsertStats, ScanError> {
        let mut inner = self.inner.lock().unwrap();
        let mut stats = UpsertStats::default();
        for r in records {
            let key = (r.asset_id, r.subdomain.to_ascii_lowercase());
            match inner.subdomains.get_mut(&key) {
                Some(existing) => {
                    existing.last_seen_at = existing.last_seen_at.max(r.discovered_at);
                    existing.times_discovered += 1;
                    stats.updated += 1;
                }
                None => {
                    inner.subdomains.insert(
                        key,
                        StoredSubdomain {
                            record: r.clone(),
                            last_seen_at: r.discovered_at,
                            times_discovered: 1,
                        },
                    );
                    stats.inserted += 1;
                }
            }
        }
        Ok(stats)
    }

    async fn upsert_dns_records(&self, records: &[DnsRecord]) -> Result<UpsertStats, ScanError> {
        let mut inner = self.inner.lock().unwrap();
        let mut stats = UpsertStats::default();
        for r in records {
            let key = (
                r.subdomain.to_ascii_lowercase(),
                r.record_type.clone(),
                r.record_value.clone(),
                r.priority.unwrap_or(-1),
            );
            if inner.dns.insert(key, r.clone()).is_some() {
                stats.updated += 1;
            } else {
                stats.inserted += 1;
            }
        }
        Ok(stats)
    }

    async fn insert_http_probes(&self, records: &[HttpProbe]) -> Result<UpsertStats, ScanError> {
        let mut inner = self.inner.lock().unwrap();
        let mut stats = UpsertStats::default();
        for r in records {
            let key = (
                r.scan_job_id,
                r.subdomain.to_ascii_lowercase(),
                r.scheme.clone(),
                r.port,
            );
            if inner.probes.contains_key(&key) {
                stats.skipped += 1;
            } else {
                inner.probes.insert(key, r.clone());
                stats.inserted += 1;
            }
        }
        Ok(stats)
    }

    async fn upsert_endpoints(&self, records: &[Endpoint]) -> Result<UpsertStats, ScanError> {
        let mut inner = self.inner.lock().unwrap();
        let mut stats = UpsertStats::default();
        for r in records {
            let key = (r.asset_id, r.url_hash.clone());
            match inner.endpoints.get_mut(&key) {
                Some(existing) => {
                    existing.last_seen_at = existing.last_seen_at.max(r.discovered_at);
                    existing.times_discovered += 1;
                    stats.updated += 1;
                }
                None => {
                    inner.endpoints.insert(
                        key,
                        StoredEndpoint {
                            record: r.clone(),
                            last_seen_at: r.discovered_at,
                            times_discovered: 1,
                        },
                    );
                    stats.inserted += 1;
                }
            }
        }
        Ok(stats)
    }

    async fn upsert_historical_urls(
        &self,
        records: &[HistoricalUrl],
    ) -> Result<UpsertStats, ScanError> {
        let mut inner = self.inner.lock().unwrap();
        let mut stats = UpsertStats::default();
        for r in records {
            let key = (r.asset_id, r.url_hash.clone());
            if inner.historical.contains_key(&key) {
                stats.skipped += 1;
            } else {
                inner.historical.insert(key, r.clone());
                stats.inserted += 1;
            }
        }
        Ok(stats)
    }

    async fn upsert_urls(&self, records: &[ResolvedUrl]) -> Result<UpsertStats, ScanError> {
        let mut inner = self.inner.lock().unwrap();
        let mut stats = UpsertStats::default();
        for r in records {
            let key = (r.asset_id, r.url_hash.clone());
            match inner.urls.get_mut(&key) {
                Some(existing) => {
                    existing.alive = r.alive;
                    existing.status_code = r.status_code;
                    for source in &r.sources {
                        if !existing.sources.contains(source) {
                            existing.sources.push(source.clone());
                        }
                    }
                    existing.sources.sort();
                    stats.updated += 1;
                }
                None => {
                    inner.urls.insert(key, r.clone());
                    stats.inserted += 1;
                }
            }
        }
        Ok(stats)
    }

    async fn fetch_module_profiles(&self) -> Result<Vec<serde_json::Value>, ScanError> {
        Ok(self.inner.lock().unwrap().module_profiles.clone())
    }

    async fn count_seed_data(&self, module: &str, asset_id: Uuid) -> Result<u64, ScanError> {
        let all = self.fetch_seed_data(module, asset_id, 0, u64::MAX).await?;
        Ok(all.len() as u64)
    }

    async fn fetch_seed_data(
        &self,
        module: &str,
        asset_id: Uuid,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<String>, ScanError> {
        let inner = self.inner.lock().unwrap();
        let mut seeds: Vec<String> = match module {
            "dnsx" | "httpx" => inner
                .subdomains
                .keys()
                .filter(|(a, _)| *a == asset_id)
                .map(|(_, s)| s.clone())
                .collect(),
            "katana" => inner
                .probes
                .values()
                .filter(|p| p.asset_id == asset_id)
                .map(|p| probe_url(&p.scheme, p.port, &p.subdomain))
                .collect(),
            "urlfinder" => {
                let mut urls: Vec<String> = inner
                    .endpoints
                    .values()
                    .filter(|e| e.record.asset_id == asset_id)
                    .map(|e| e.record.url.clone())
                    .chain(
                        inner
                            .historical
                            .values()
                            .filter(|h| h.asset_id == asset_id)
                            .map(|h| h.url.clone()),
                    )
                    .collect();
                urls.dedup();
                urls
            }
            other => return Err(ScanError::UnknownModule(other.to_string())),
        };
        seeds.sort();
        seeds.dedup();
        Ok(seeds
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect())
    }
}
