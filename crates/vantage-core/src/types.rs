//! Scan, batch-job, and discovery-record types.
//!
//! Cross-component references are opaque handles (UUIDs and strings), never
//! object graphs: each row has a single writer and readers query by handle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// An asset is an externally-owned identifier plus its apex domains.
/// Immutable for the duration of a scan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Asset {
    pub id: Uuid,
    pub apex_domains: Vec<String>,
}

/// Aggregate status of a scan. Terminal states are `Completed`,
/// `PartialFailure`, `Failed`, and `Cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    Pending,
    Running,
    Completed,
    PartialFailure,
    Failed,
    Cancelled,
}

impl ScanStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ScanStatus::Pending | ScanStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ScanStatus::Pending => "pending",
            ScanStatus::Running => "running",
            ScanStatus::Completed => "completed",
            ScanStatus::PartialFailure => "partial_failure",
            ScanStatus::Failed => "failed",
            ScanStatus::Cancelled => "cancelled",
        }
    }
}

/// Status of one batch scan job. `Interrupted` is written best-effort by
/// the worker's shutdown hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Interrupted,
}

impl BatchStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, BatchStatus::Pending | BatchStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Pending => "pending",
            BatchStatus::Running => "running",
            BatchStatus::Completed => "completed",
            BatchStatus::Failed => "failed",
            BatchStatus::Cancelled => "cancelled",
            BatchStatus::Interrupted => "interrupted",
        }
    }
}

/// A scan over one or more assets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scan {
    pub id: Uuid,
    pub user_id: Uuid,
    pub asset_ids: Vec<Uuid>,
    pub modules: Vec<String>,
    pub status: ScanStatus,
    pub total_domains: u64,
    pub completed_domains: u64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Snapshot of the resolved plan (execution order, batch sizes,
    /// resource allocations).
    pub config: serde_json::Value,
    pub timeout_seconds: u64,
}

/// Per-(scan, asset) job mirroring scan fields at asset granularity.
/// Discovery records reference this job's id as `scan_job_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetScanJob {
    pub id: Uuid,
    pub parent_scan_id: Uuid,
    pub asset_id: Uuid,
    pub status: ScanStatus,
    pub total_domains: u64,
    pub completed_domains: u64,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// One worker task unit: a module plus up to `max_batch_size` domains.
///
/// The batch owns its task handle and is the sole writer of its row once
/// launched; the pipeline only reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchScanJob {
    pub id: Uuid,
    pub module: String,
    pub status: BatchStatus,
    pub batch_domains: Vec<String>,
    /// Maps each batch domain to the asset scan job it belongs to.
    pub asset_scan_mapping: HashMap<String, Uuid>,
    pub total_domains: u64,
    pub completed_domains: u64,
    pub failed_domains: u64,
    pub allocated_cpu: u32,
    pub allocated_memory: u32,
    pub est_duration_minutes: u64,
    pub task_handle: Option<String>,
    pub last_activity_at: DateTime<Utc>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub error: Option<String>,
}

impl BatchScanJob {
    /// Counts must never exceed the batch size.
    pub fn counts_consistent(&self) -> bool {
        self.batch_domains.len() as u64 == self.total_domains
            && self.completed_domains + self.failed_domains <= self.total_domains
    }
}

/// Progress snapshot a worker publishes for orchestrator polling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchProgress {
    pub batch_id: Uuid,
    pub module: String,
    pub status: BatchStatus,
    pub total_domains: u64,
    pub completed_domains: u64,
    pub failed_domains: u64,
    /// Domains that timed out but still yielded records.
    pub partial_domains: u64,
    pub out_of_scope: u64,
    pub last_activity_at: DateTime<Utc>,
}

/// Per-worker lifecycle. Transitions are monotonic:
/// `Starting -> Running -> Flushing -> {Completed, Failed, Interrupted, Cancelled}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Starting,
    Running,
    Flushing,
    Completed,
    Failed,
    Interrupted,
    Cancelled,
}

impl WorkerState {
    fn rank(&self) -> u8 {
        match self {
            WorkerState::Starting => 0,
            WorkerState::Running => 1,
            WorkerState::Flushing => 2,
            _ => 3,
        }
    }

    /// A transition is legal when it moves forward; terminal states never
    /// transition again.
    pub fn can_transition(&self, next: WorkerState) -> bool {
        self.rank() < next.rank() || (self.rank() == 2 && next.rank() == 3)
    }

    pub fn is_terminal(&self) -> bool {
        self.rank() == 3
    }
}

// ---------------------------------------------------------------------------
// Discovery records
// ---------------------------------------------------------------------------

/// A discovered subdomain. Natural key: `(asset_id, subdomain)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subdomain {
    pub scan_job_id: Uuid,
    pub asset_id: Uuid,
    pub subdomain: String,
    pub source: String,
    pub discovered_at: DateTime<Utc>,
}

/// A resolved DNS record. Natural key:
/// `(subdomain, record_type, record_value, priority)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DnsRecord {
    pub scan_job_id: Uuid,
    pub asset_id: Uuid,
    pub subdomain: String,
    pub record_type: String,
    pub record_value: String,
    pub priority: Option<i32>,
    pub source: String,
    pub discovered_at: DateTime<Utc>,
}

/// An HTTP probe result. Per-scan insert keyed by
/// `(scan_job_id, subdomain, scheme, port)` — no cross-scan dedupe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpProbe {
    pub scan_job_id: Uuid,
    pub asset_id: Uuid,
    pub subdomain: String,
    pub scheme: String,
    pub port: u16,
    pub status_code: Option<u16>,
    pub title: Option<String>,
    pub web_server: Option<String>,
    pub content_length: Option<u64>,
    pub source: String,
    pub discovered_at: DateTime<Utc>,
}

/// An endpoint found by the crawler. Natural key: `(asset_id, url_hash)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Endpoint {
    pub scan_job_id: Uuid,
    pub asset_id: Uuid,
    pub url: String,
    pub url_hash: String,
    pub source: String,
    pub discovered_at: DateTime<Utc>,
}

/// A URL harvested from historical archives. Natural key:
/// `(asset_id, url_hash)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoricalUrl {
    pub scan_job_id: Uuid,
    pub asset_id: Uuid,
    pub url: String,
    pub url_hash: String,
    pub source: String,
    pub discovered_at: DateTime<Utc>,
}

/// A liveness-resolved URL. Natural key: `(asset_id, url_hash)`; repeated
/// discoveries append to `sources`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedUrl {
    pub scan_job_id: Uuid,
    pub asset_id: Uuid,
    pub url: String,
    pub url_hash: String,
    pub alive: bool,
    pub status_code: Option<u16>,
    pub sources: Vec<String>,
    pub discovered_at: DateTime<Utc>,
}

/// The union of everything a scanner can emit. Workers treat results
/// uniformly through this enum: scope-check, dedup, stream, persist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Discovery {
    Subdomain(Subdomain),
    Dns(DnsRecord),
    HttpProbe(HttpProbe),
    Endpoint(Endpoint),
    HistoricalUrl(HistoricalUrl),
    Url(ResolvedUrl),
}

impl Discovery {
    pub fn scan_job_id(&self) -> Uuid {
        match self {
            Discovery::Subdomain(r) => r.scan_job_id,
            Discovery::Dns(r) => r.scan_job_id,
            Discovery::HttpProbe(r) => r.scan_job_id,
            Discovery::Endpoint(r) => r.scan_job_id,
            Discovery::HistoricalUrl(r) => r.scan_job_id,
            Discovery::Url(r) => r.scan_job_id,
        }
    }

    pub fn asset_id(&self) -> Uuid {
        match self {
            Discovery::Subdomain(r) => r.asset_id,
            Discovery::Dns(r) => r.asset_id,
            Discovery::HttpProbe(r) => r.asset_id,
            Discovery::Endpoint(r) => r.asset_id,
            Discovery::HistoricalUrl(r) => r.asset_id,
            Discovery::Url(r) => r.asset_id,
        }
    }

    pub fn source(&self) -> &str {
        match self {
            Discovery::Subdomain(r) => &r.source,
            Discovery::Dns(r) => &r.source,
            Discovery::HttpProbe(r) => &r.source,
            Discovery::Endpoint(r) => &r.source,
            Discovery::HistoricalUrl(r) => &r.source,
            Discovery::Url(r) => r.sources.first().map(String::as_str).unwrap_or(""),
        }
    }

    /// Host the record pertains to, for scope enforcement. URL-shaped
    /// records yield their parsed host.
    pub fn host(&self) -> Option<String> {
        match self {
            Discovery::Subdomain(r) => Some(r.subdomain.to_ascii_lowercase()),
            Discovery::Dns(r) => Some(r.subdomain.to_ascii_lowercase()),
            Discovery::HttpProbe(r) => Some(r.subdomain.to_ascii_lowercase()),
            Discovery::Endpoint(r) => host_of(&r.url),
            Discovery::HistoricalUrl(r) => host_of(&r.url),
            Discovery::Url(r) => host_of(&r.url),
        }
    }

    /// Natural-key string for the in-memory dedup set. Mirrors the
    /// persistence conflict targets.
    pub fn dedup_key(&self) -> String {
        match self {
            Discovery::Subdomain(r) => {
                format!("sub:{}:{}", r.asset_id, r.subdomain.to_ascii_lowercase())
            }
            Discovery::Dns(r) => format!(
                "dns:{}:{}:{}:{}",
                r.subdomain.to_ascii_lowercase(),
                r.record_type,
                r.record_value,
                r.priority.unwrap_or(-1)
            ),
            Discovery::HttpProbe(r) => format!(
                "probe:{}:{}:{}:{}",
                r.scan_job_id,
                r.subdomain.to_ascii_lowercase(),
                r.scheme,
                r.port
            ),
            Discovery::Endpoint(r) => format!("ep:{}:{}", r.asset_id, r.url_hash),
            Discovery::HistoricalUrl(r) => format!("hist:{}:{}", r.asset_id, r.url_hash),
            Discovery::Url(r) => format!("url:{}:{}", r.asset_id, r.url_hash),
        }
    }
}

fn host_of(raw: &str) -> Option<String> {
    url::Url::parse(raw)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subdomain(name: &str) -> Discovery {
        Discovery::Subdomain(Subdomain {
            scan_job_id: Uuid::nil(),
            asset_id: Uuid::nil(),
            subdomain: name.to_string(),
            source: "subfinder".to_string(),
            discovered_at: Utc::now(),
        })
    }

    #[test]
    fn scan_status_terminality() {
        assert!(!ScanStatus::Pending.is_terminal());
        assert!(!ScanStatus::Running.is_terminal());
        assert!(ScanStatus::Completed.is_terminal());
        assert!(ScanStatus::PartialFailure.is_terminal());
        assert!(ScanStatus::Failed.is_terminal());
        assert!(ScanStatus::Cancelled.is_terminal());
    }

    #[test]
    fn worker_state_transitions_are_monotonic() {
        use WorkerState::*;
        assert!(Starting.can_transition(Running));
        assert!(Running.can_transition(Flushing));
        assert!(Flushing.can_transition(Completed));
        assert!(Running.can_transition(Failed));
        assert!(!Completed.can_transition(Running));
        assert!(!Flushing.can_transition(Running));
        assert!(!Interrupted.can_transition(Completed));
    }

    #[test]
    fn dedup_key_is_case_insensitive_on_host() {
        assert_eq!(
            subdomain("API.example.com").dedup_key(),
            subdomain("api.example.com").dedup_key()
        );
    }

    #[test]
    fn host_parses_url_records() {
        let ep = Discovery::Endpoint(Endpoint {
            scan_job_id: Uuid::nil(),
            asset_id: Uuid::nil(),
            url: "https://App.Example.com/login".to_string(),
            url_hash: "deadbeef".to_string(),
            source: "katana".to_string(),
            discovered_at: Utc::now(),
        });
        assert_eq!(ep.host().as_deref(), Some("app.example.com"));
    }

    #[test]
    fn batch_counts_consistency() {
        let mut batch = BatchScanJob {
            id: Uuid::new_v4(),
            module: "subfinder".to_string(),
            status: BatchStatus::Running,
            batch_domains: vec!["a.com".to_string(), "b.com".to_string()],
            asset_scan_mapping: HashMap::new(),
            total_domains: 2,
            completed_domains: 1,
            failed_domains: 1,
            allocated_cpu: 512,
            allocated_memory: 1024,
            est_duration_minutes: 5,
            task_handle: None,
            last_activity_at: Utc::now(),
            retry_count: 0,
            max_retries: 2,
            error: None,
        };
        assert!(batch.counts_consistent());
        batch.completed_domains = 2;
        assert!(!batch.counts_consistent());
    }

    #[test]
    fn status_serde_uses_snake_case() {
        let json = serde_json::to_string(&ScanStatus::PartialFailure).unwrap();
        assert_eq!(json, r#""partial_failure""#);
        let back: BatchStatus = serde_json::from_str(r#""interrupted""#).unwrap();
        assert_eq!(back, BatchStatus::Interrupted);
    }
}
