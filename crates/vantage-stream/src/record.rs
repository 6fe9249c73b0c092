//! Wire schema for stream entries.
//!
//! Every entry is flat field/value pairs. Data records carry the
//! entity-specific fields plus `scan_job_id`, `asset_id`, `source`, and
//! `discovered_at` (RFC-3339 UTC). A completion marker is a distinguished
//! entry with `type = "completion"` and is the last thing a producer
//! writes for its scan job.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use vantage_core::types::{
    Discovery, DnsRecord, Endpoint, HistoricalUrl, HttpProbe, ResolvedUrl, Subdomain,
};
use vantage_core::ScanError;

use crate::transport::StreamEntry;

/// Reserved value of the `type` field marking end-of-production.
pub const COMPLETION_TYPE: &str = "completion";

/// Signals that no more records will follow from this producer for this
/// scan job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionMarker {
    pub module: String,
    pub scan_job_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub total_results: u64,
}

/// A decoded stream entry.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamRecord {
    Data(Discovery),
    Completion(CompletionMarker),
}

/// Encode a discovery into flat field pairs. `metadata`, when present,
/// is serialized to a JSON string — the transport rejects nested maps.
pub fn encode_data(
    discovery: &Discovery,
    metadata: Option<&serde_json::Value>,
) -> Vec<(String, String)> {
    let mut fields: Vec<(String, String)> = Vec::new();
    let mut push = |k: &str, v: String| fields.push((k.to_string(), v));

    match discovery {
        Discovery::Subdomain(r) => {
            push("kind", "subdomain".into());
            push("subdomain", r.subdomain.clone());
        }
        Discovery::Dns(r) => {
            push("kind", "dns".into());
            push("subdomain", r.subdomain.clone());
            push("record_type", r.record_type.clone());
            push("record_value", r.record_value.clone());
            if let Some(p) = r.priority {
                push("priority", p.to_string());
            }
        }
        Discovery::HttpProbe(r) => {
            push("kind", "http_probe".into());
            push("subdomain", r.subdomain.clone());
            push("scheme", r.scheme.clone());
            push("port", r.port.to_string());
            if let Some(s) = r.status_code {
                push("status_code", s.to_string());
            }
            if let Some(t) = &r.title {
                push("title", t.clone());
            }
            if let Some(w) = &r.web_server {
                push("web_server", w.clone());
            }
            if let Some(l) = r.content_length {
                push("content_length", l.to_string());
            }
        }
        Discovery::Endpoint(r) => {
            push("kind", "endpoint".into());
            push("url", r.url.clone());
            push("url_hash", r.url_hash.clone());
        }
        Discovery::HistoricalUrl(r) => {
            push("kind", "historical_url".into());
            push("url", r.url.clone());
            push("url_hash", r.url_hash.clone());
        }
        Discovery::Url(r) => {
            push("kind", "url".into());
            push("url", r.url.clone());
            push("url_hash", r.url_hash.clone());
            push("alive", r.alive.to_string());
            if let Some(s) = r.status_code {
                push("status_code", s.to_string());
            }
            push(
                "sources",
                serde_json::to_string(&r.sources).unwrap_or_else(|_| "[]".to_string()),
            );
        }
    }

    push("scan_job_id", discovery.scan_job_id().to_string());
    push("asset_id", discovery.asset_id().to_string());
    push("source", discovery.source().to_string());
    push("discovered_at", discovered_at(discovery).to_rfc3339());
    if let Some(meta) = metadata {
        push(
            "metadata",
            serde_json::to_string(meta).unwrap_or_else(|_| "{}".to_string()),
        );
    }

    fields
}

/// Encode a completion marker.
pub fn encode_completion(marker: &CompletionMarker) -> Vec<(String, String)> {
    vec![
        ("type".to_string(), COMPLETION_TYPE.to_string()),
        ("module".to_string(), marker.module.clone()),
        ("scan_job_id".to_string(), marker.scan_job_id.to_string()),
        ("timestamp".to_string(), marker.timestamp.to_rfc3339()),
        ("total_results".to_string(), marker.total_results.to_string()),
    ]
}

/// Decode one stream entry into a data record or completion marker.
pub fn decode(entry: &StreamEntry) -> Result<StreamRecord, ScanError> {
    if entry.field("type") == Some(COMPLETION_TYPE) {
        return Ok(StreamRecord::Completion(CompletionMarker {
            module: req(entry, "module")?.to_string(),
            scan_job_id: uuid_field(entry, "scan_job_id")?,
            timestamp: time_field(entry, "timestamp")?,
            total_results: int_field(entry, "total_results")?,
        }));
    }

    let scan_job_id = uuid_field(entry, "scan_job_id")?;
    let asset_id = uuid_field(entry, "asset_id")?;
    let source = req(entry, "source")?.to_string();
    let discovered_at = time_field(entry, "discovered_at")?;

    let discovery = match req(entry, "kind")? {
        "subdomain" => Discovery::Subdomain(Subdomain {
            scan_job_id,
            asset_id,
            subdomain: req(entry, "subdomain")?.to_string(),
            source,
            discovered_at,
        }),
        "dns" => Discovery::Dns(DnsRecord {
            scan_job_id,
            asset_id,
            subdomain: req(entry, "subdomain")?.to_string(),
            record_type: req(entry, "record_type")?.to_string(),
            record_value: req(entry, "record_value")?.to_string(),
            priority: opt_int(entry, "priority")?,
            source,
            discovered_at,
        }),
        "http_probe" => Discovery::HttpProbe(HttpProbe {
            scan_job_id,
            asset_id,
            subdomain: req(entry, "subdomain")?.to_string(),
            scheme: req(entry, "scheme")?.to_string(),
            port: int_field(entry, "port")?,
            status_code: opt_int(entry, "status_code")?,
            title: entry.field("title").map(str::to_string),
            web_server: entry.field("web_server").map(str::to_string),
            content_length: opt_int(entry, "content_length")?,
            source,
            discovered_at,
        }),
        "endpoint" => Discovery::Endpoint(Endpoint {
            scan_job_id,
            asset_id,
            url: req(entry, "url")?.to_string(),
            url_hash: req(entry, "url_hash")?.to_string(),
            source,
            discovered_at,
        }),
        "historical_url" => Discovery::HistoricalUrl(HistoricalUrl {
            scan_job_id,
            asset_id,
            url: req(entry, "url")?.to_string(),
            url_hash: req(entry, "url_hash")?.to_string(),
            source,
            discovered_at,
        }),
        "url" => Discovery::Url(ResolvedUrl {
            scan_job_id,
            asset_id,
            url: req(entry, "url")?.to_string(),
            url_hash: req(entry, "url_hash")?.to_string(),
            alive: req(entry, "alive")? == "true",
            status_code: opt_int(entry, "status_code")?,
            sources: entry
                .field("sources")
                .map(|raw| serde_json::from_str(raw).unwrap_or_default())
                .unwrap_or_default(),
            discovered_at,
        }),
        other => {
            return Err(ScanError::Stream(format!(
                "unknown record kind '{other}' in entry {}",
                entry.id
            )))
        }
    };

    Ok(StreamRecord::Data(discovery))
}

/// Optional `metadata` payload of an entry, parsed from its JSON string.
pub fn metadata_of(entry: &StreamEntry) -> Option<serde_json::Value> {
    entry
        .field("metadata")
        .and_then(|raw| serde_json::from_str(raw).ok())
}

fn discovered_at(discovery: &Discovery) -> DateTime<Utc> {
    match discovery {
        Discovery::Subdomain(r) => r.discovered_at,
        Discovery::Dns(r) => r.discovered_at,
        Discovery::HttpProbe(r) => r.discovered_at,
        Discovery::Endpoint(r) => r.discovered_at,
        Discovery::HistoricalUrl(r) => r.discovered_at,
        Discovery::Url(r) => r.discovered_at,
    }
}

fn req<'a>(entry: &'a StreamEntry, name: &str) -> Result<&'a str, ScanError> {
    entry.field(name).ok_or_else(|| {
        ScanError::Stream(format!("entry {} missing field '{name}'", entry.id))
    })
}

fn uuid_field(entry: &StreamEntry, name: &str) -> Result<Uuid, ScanError> {
    req(entry, name)?
        .parse()
        .map_err(|_| ScanError::Stream(format!("entry {} has bad uuid in '{name}'", entry.id)))
}

fn time_field(entry: &StreamEntry, name: &str) -> Result<DateTime<Utc>, ScanError> {
    DateTime::parse_from_rfc3339(req(entry, name)?)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| {
            ScanError::Stream(format!("entry {} has bad timestamp in '{name}'", entry.id))
        })
}

fn int_field<T: std::str::FromStr>(entry: &StreamEntry, name: &str) -> Result<T, ScanError> {
    req(entry, name)?
        .parse()
        .map_err(|_| ScanError::Stream(format!("entry {} has bad number in '{name}'", entry.id)))
}

fn opt_int<T: std::str::FromStr>(
    entry: &StreamEntry,
    name: &str,
) -> Result<Option<T>, ScanError> {
    match entry.field(name) {
        None => Ok(None),
        Some(raw) => raw.parse().map(Some).map_err(|_| {
            ScanError::Stream(format!("entry {} has bad number in '{name}'", entry.id))
        }),
    }
}
