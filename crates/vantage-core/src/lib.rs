//! Vantage core - shared domain types for the recon pipeline
//!
//! This crate holds everything the other crates agree on: the scan/batch
//! job model, the discovery record entities, the error taxonomy, URL
//! fingerprinting, and apex-domain scope filtering.

pub mod error;
pub mod fingerprint;
pub mod scope;
pub mod types;

pub use error::ScanError;
pub use fingerprint::{normalize_url, DedupSet, Fingerprint};
pub use scope::{is_valid_domain, ScopeFilter};
pub use types::{
    Asset, AssetScanJob, BatchProgress, BatchScanJob, BatchStatus, Discovery, DnsRecord,
    Endpoint, HistoricalUrl, HttpProbe, ResolvedUrl, Scan, ScanStatus, Subdomain, WorkerState,
};
