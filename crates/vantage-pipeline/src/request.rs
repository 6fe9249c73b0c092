//! Scan request and its validation.

use std::time::Duration;
use uuid::Uuid;

use vantage_core::types::Asset;
use vantage_core::{is_valid_domain, ScanError};
use vantage_registry::ModuleRegistry;
use vantage_store::ScanStore;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3 * 60 * 60);
pub const MIN_TIMEOUT: Duration = Duration::from_secs(30 * 60);
pub const MAX_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone)]
pub struct ScanRequest {
    pub user_id: Uuid,
    pub asset_ids: Vec<Uuid>,
    pub modules: Vec<String>,
    pub timeout: Duration,
    /// Skip apexes that fail the domain grammar instead of rejecting the
    /// whole request.
    pub active_domains_only: bool,
}

impl ScanRequest {
    pub fn new(user_id: Uuid, asset_ids: Vec<Uuid>, modules: Vec<String>) -> Self {
        Self {
            user_id,
            asset_ids,
            modules,
            timeout: DEFAULT_TIMEOUT,
            active_domains_only: false,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Reject CLI timeouts outside the supported range. The pipeline itself
/// accepts any deadline (tests drive it with seconds-long ones).
pub fn validate_timeout(timeout: Duration) -> Result<(), ScanError> {
    if timeout < MIN_TIMEOUT || timeout > MAX_TIMEOUT {
        return Err(ScanError::InvalidRequest(format!(
            "timeout {}s outside [{}, {}]",
            timeout.as_secs(),
            MIN_TIMEOUT.as_secs(),
            MAX_TIMEOUT.as_secs()
        )));
    }
    Ok(())
}

/// Check the request against the registry and the store. Returns each
/// asset with its usable apex domains; every failure is an
/// `InvalidRequest` surfaced to the CLI before anything launches.
pub async fn validate_request(
    request: &ScanRequest,
    registry: &ModuleRegistry,
    store: &dyn ScanStore,
) -> Result<Vec<(Asset, Vec<String>)>, ScanError> {
    if request.modules.is_empty() {
        return Err(ScanError::InvalidRequest("no modules requested".to_string()));
    }
    if request.asset_ids.is_empty() {
        return Err(ScanError::InvalidRequest("no assets requested".to_string()));
    }

    let checked = registry.validate_all(&request.modules);
    let unknown: Vec<String> = checked
        .into_iter()
        .filter(|(_, ok)| !ok)
        .map(|(name, _)| name)
        .collect();
    if !unknown.is_empty() {
        return Err(ScanError::InvalidRequest(format!(
            "unknown or inactive modules: {}",
            unknown.join(", ")
        )));
    }

    let mut validated = Vec::with_capacity(request.asset_ids.len());
    let mut total_domains = 0usize;
    for asset_id in &request.asset_ids {
        let asset = store
            .fetch_asset(*asset_id)
            .await?
            .ok_or_else(|| ScanError::InvalidRequest(format!("asset {asset_id} not found")))?;

        let mut domains = Vec::with_capacity(asset.apex_domains.len());
        for domain in &asset.apex_domains {
            let domain = domain.trim().to_ascii_lowercase();
            if is_valid_domain(&domain) {
                domains.push(domain);
            } else if !request.active_domains_only {
                return Err(ScanError::InvalidRequest(format!(
                    "asset {asset_id} has a malformed apex domain '{domain}'"
                )));
            }
        }
        domains.sort();
        domains.dedup();
        total_domains += domains.len();
        validated.push((asset, domains));
    }

    if total_domains == 0 {
        return Err(ScanError::InvalidRequest(
            "no usable apex domains across the requested assets".to_string(),
        ));
    }

    Ok(validated)
}
