//! The scanner seam.
//!
//! Enumeration tools are black boxes behind [`DomainScanner`]: give them a
//! target, get discovery records back. The production adapter shells out
//! to the wrapped tool inside the module's container image and parses its
//! JSON-lines output; tests plug in closures.

use async_trait::async_trait;
use chrono::Utc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};
use uuid::Uuid;

use vantage_core::types::{
    Discovery, DnsRecord, Endpoint, HistoricalUrl, HttpProbe, ResolvedUrl, Subdomain,
};
use vantage_core::{normalize_url, ScanError};

/// Identity a scanner stamps onto every record it produces.
#[derive(Debug, Clone)]
pub struct ScanContext {
    pub scan_job_id: Uuid,
    pub asset_id: Uuid,
    pub module: String,
}

/// One scan attempt's yield. `timed_out` with records present is demoted
/// to partial success by the retry layer; the records are kept.
#[derive(Debug, Default)]
pub struct ScannerOutput {
    pub records: Vec<Discovery>,
    pub timed_out: bool,
}

#[async_trait]
pub trait DomainScanner: Send + Sync {
    async fn scan(&self, target: &str, ctx: &ScanContext) -> Result<ScannerOutput, ScanError>;
}

/// Closure-backed scanner for tests and synthetic runs.
pub struct FnScanner<F>(pub F)
where
    F: Fn(&str, &ScanContext) -> Result<ScannerOutput, ScanError> + Send + Sync;

#[async_trait]
impl<F> DomainScanner for FnScanner<F>
where
    F: Fn(&str, &ScanContext) -> Result<ScannerOutput, ScanError> + Send + Sync,
{
    async fn scan(&self, target: &str, ctx: &ScanContext) -> Result<ScannerOutput, ScanError> {
        (self.0)(target, ctx)
    }
}

/// Parses one line of tool output into zero or more records.
pub type LineParser = fn(&str, &ScanContext) -> Vec<Discovery>;

/// Runs the wrapped enumeration tool as a child process, one invocation
/// per target, collecting JSON-lines output. On deadline the child is
/// killed and whatever was parsed so far is returned with `timed_out`.
pub struct SubprocessScanner {
    program: String,
    args: Vec<String>,
    timeout: Duration,
    parser: LineParser,
}

impl SubprocessScanner {
    pub fn new(
        program: impl Into<String>,
        args: Vec<String>,
        timeout: Duration,
        parser: LineParser,
    ) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
            parser,
        }
    }
}

#[async_trait]
impl DomainScanner for SubprocessScanner {
    async fn scan(&self, target: &str, ctx: &ScanContext) -> Result<ScannerOutput, ScanError> {
        let args: Vec<String> = self
            .args
            .iter()
            .map(|a| a.replace("{target}", target))
            .collect();

        let mut child = Command::new(&self.program)
            .args(&args)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ScanError::ScannerFailed {
                domain: target.to_string(),
                reason: format!("spawn {}: {e}", self.program),
            })?;

        let stdout = child.stdout.take().ok_or_else(|| ScanError::ScannerFailed {
            domain: target.to_string(),
            reason: "no stdout".to_string(),
        })?;
        let mut lines = BufReader::new(stdout).lines();

        let deadline = Instant::now() + self.timeout;
        let mut records = Vec::new();
        let mut timed_out = false;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                timed_out = true;
                break;
            }
            match tokio::time::timeout(remaining, lines.next_line()).await {
                Err(_) => {
                    timed_out = true;
                    break;
                }
                Ok(Ok(Some(line))) => records.extend((self.parser)(&line, ctx)),
                Ok(Ok(None)) => break,
                Ok(Err(e)) => {
                    return Err(ScanError::ScannerFailed {
                        domain: target.to_string(),
                        reason: e.to_string(),
                    })
                }
            }
        }

        if timed_out {
            warn!(
                target,
                program = self.program.as_str(),
                parsed = records.len(),
                "scanner hit its deadline, keeping partial output"
            );
            let _ = child.kill().await;
        } else {
            let status = child.wait().await.map_err(|e| ScanError::ScannerFailed {
                domain: target.to_string(),
                reason: e.to_string(),
            })?;
            if !status.success() && records.is_empty() {
                return Err(ScanError::ScannerFailed {
                    domain: target.to_string(),
                    reason: format!("{} exited with {status}", self.program),
                });
            }
        }

        debug!(target, records = records.len(), "scan finished");
        Ok(ScannerOutput { records, timed_out })
    }
}

/// Build the production scanner for a module: the wrapped tool on the
/// container image's PATH with its usual JSON-lines flags.
pub fn for_module(module: &str, timeout: Duration) -> Result<Box<dyn DomainScanner>, ScanError> {
    let arg = |s: &str| s.to_string();
    let scanner = match module {
        "subfinder" => SubprocessScanner::new(
            "subfinder",
            vec![arg("-d"), arg("{target}"), arg("-silent"), arg("-json")],
            timeout,
            parse_subfinder_line,
        ),
        "dnsx" => SubprocessScanner::new(
            "dnsx",
            vec![arg("-d"), arg("{target}"), arg("-resp"), arg("-json"), arg("-silent")],
            timeout,
            parse_dnsx_line,
        ),
        "httpx" => SubprocessScanner::new(
            "httpx",
            vec![arg("-u"), arg("{target}"), arg("-json"), arg("-silent")],
            timeout,
            parse_httpx_line,
        ),
        "gau" => SubprocessScanner::new(
            "gau",
            vec![arg("{target}")],
            timeout,
            parse_gau_line,
        ),
        "katana" => SubprocessScanner::new(
            "katana",
            vec![arg("-u"), arg("{target}"), arg("-jsonl"), arg("-silent")],
            timeout,
            parse_katana_line,
        ),
        "urlfinder" => SubprocessScanner::new(
            "urlfinder",
            vec![arg("-u"), arg("{target}"), arg("-json")],
            timeout,
            parse_urlfinder_line,
        ),
        other => return Err(ScanError::UnknownModule(other.to_string())),
    };
    Ok(Box::new(scanner))
}

fn json_str(value: &serde_json::Value, key: &str) -> Option<String> {
    value.get(key).and_then(|v| v.as_str()).map(str::to_string)
}

fn parse_subfinder_line(line: &str, ctx: &ScanContext) -> Vec<Discovery> {
    let line = line.trim();
    if line.is_empty() {
        return Vec::new();
    }
    let host = match serde_json::from_str::<serde_json::Value>(line) {
        Ok(v) => json_str(&v, "host"),
        Err(_) => Some(line.to_string()),
    };
    host.map(|h| {
        vec![Discovery::Subdomain(Subdomain {
            scan_job_id: ctx.scan_job_id,
            asset_id: ctx.asset_id,
            subdomain: h.to_ascii_lowercase(),
            source: ctx.module.clone(),
            discovered_at: Utc::now(),
        })]
    })
    .unwrap_or_default()
}

fn parse_dnsx_line(line: &str, ctx: &ScanContext) -> Vec<Discovery> {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(line.trim()) else {
        return Vec::new();
    };
    let Some(host) = json_str(&value, "host") else {
        return Vec::new();
    };

    let mut records = Vec::new();
    let mut push = |record_type: &str, record_value: String, priority: Option<i32>| {
        records.push(Discovery::Dns(DnsRecord {
            scan_job_id: ctx.scan_job_id,
            asset_id: ctx.asset_id,
            subdomain: host.to_ascii_lowercase(),
            record_type: record_type.to_string(),
            record_value,
            priority,
            source: ctx.module.clone(),
            discovered_at: Utc::now(),
        }));
    };

    for record_type in ["a", "aaaa", "cname", "ns", "txt"] {
        if let Some(values) = value.get(record_type).and_then(|v| v.as_array()) {
            for entry in values.iter().filter_map(|v| v.as_str()) {
                push(&record_type.to_ascii_uppercase(), entry.to_string(), None);
            }
        }
    }
    if let Some(values) = value.get("mx").and_then(|v| v.as_array()) {
        for (i, entry) in values.iter().filter_map(|v| v.as_str()).enumerate() {
            push("MX", entry.to_string(), Some((i as i32 + 1) * 10));
        }
    }
    records
}

fn parse_httpx_line(line: &str, ctx: &ScanContext) -> Vec<Discovery> {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(line.trim()) else {
        return Vec::new();
    };
    let Some(host) = json_str(&value, "input").or_else(|| json_str(&value, "host")) else {
        return Vec::new();
    };
    let scheme = json_str(&value, "scheme").unwrap_or_else(|| "https".to_string());
    let port = value
        .get("port")
        .and_then(|v| {
            v.as_u64()
                .or_else(|| v.as_str().and_then(|s| s.parse().ok()))
        })
        .unwrap_or(if scheme == "http" { 80 } else { 443 }) as u16;

    vec![Discovery::HttpProbe(HttpProbe {
        scan_job_id: ctx.scan_job_id,
        asset_id: ctx.asset_id,
        subdomain: host.to_ascii_lowercase(),
        scheme,
        port,
        status_code: value
            .get("status_code")
            .and_then(|v| v.as_u64())
            .map(|c| c as u16),
        title: json_str(&value, "title"),
        web_server: json_str(&value, "webserver"),
        content_length: value.get("content_length").and_then(|v| v.as_u64()),
        source: ctx.module.clone(),
        discovered_at: Utc::now(),
    })]
}

fn parse_gau_line(line: &str, ctx: &ScanContext) -> Vec<Discovery> {
    let raw = line.trim();
    if raw.is_empty() {
        return Vec::new();
    }
    match normalize_url(raw) {
        Ok(fp) => vec![Discovery::HistoricalUrl(HistoricalUrl {
            scan_job_id: ctx.scan_job_id,
            asset_id: ctx.asset_id,
            url: fp.normalized,
            url_hash: fp.hash,
            source: ctx.module.clone(),
            discovered_at: Utc::now(),
        })],
        Err(_) => Vec::new(),
    }
}

fn parse_katana_line(line: &str, ctx: &ScanContext) -> Vec<Discovery> {
    let raw = line.trim();
    if raw.is_empty() {
        return Vec::new();
    }
    let endpoint = match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(v) => v
            .pointer("/request/endpoint")
            .and_then(|e| e.as_str())
            .map(str::to_string),
        Err(_) => Some(raw.to_string()),
    };
    let Some(endpoint) = endpoint else {
        return Vec::new();
    };
    match normalize_url(&endpoint) {
        Ok(fp) => vec![Discovery::Endpoint(Endpoint {
            scan_job_id: ctx.scan_job_id,
            asset_id: ctx.asset_id,
            url: fp.normalized,
            url_hash: fp.hash,
            source: ctx.module.clone(),
            discovered_at: Utc::now(),
        })],
        Err(_) => Vec::new(),
    }
}

fn parse_urlfinder_line(line: &str, ctx: &ScanContext) -> Vec<Discovery> {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(line.trim()) else {
        return Vec::new();
    };
    let Some(raw) = json_str(&value, "url") else {
        return Vec::new();
    };
    let Ok(fp) = normalize_url(&raw) else {
        return Vec::new();
    };
    let status_code = value
        .get("status_code")
        .and_then(|v| v.as_u64())
        .map(|c| c as u16);
    vec![Discovery::Url(ResolvedUrl {
        scan_job_id: ctx.scan_job_id,
        asset_id: ctx.asset_id,
        url: fp.normalized,
        url_hash: fp.hash,
        alive: value
            .get("alive")
            .and_then(|v| v.as_bool())
            .unwrap_or(status_code.map(|c| c < 400).unwrap_or(false)),
        status_code,
        sources: vec![ctx.module.clone()],
        discovered_at: Utc::now(),
    })]
}

/// The input a consumer hands to its scanner for one upstream record.
pub fn target_of(discovery: &Discovery) -> &str {
    match discovery {
        Discovery::Subdomain(r) => &r.subdomain,
        Discovery::Dns(r) => &r.subdomain,
        Discovery::HttpProbe(r) => &r.subdomain,
        Discovery::Endpoint(r) => &r.url,
        Discovery::HistoricalUrl(r) => &r.url,
        Discovery::Url(r) => &r.url,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(module: &str) -> ScanContext {
        ScanContext {
            scan_job_id: Uuid::new_v4(),
            asset_id: Uuid::new_v4(),
            module: module.to_string(),
        }
    }

    #[test]
    fn subfinder_accepts_plain_and_json_lines() {
        let c = ctx("subfinder");
        let plain = parse_subfinder_line("API.Example.com", &c);
        let json = parse_subfinder_line(r#"{"host":"api.example.com"}"#, &c);
        for records in [&plain, &json] {
            match &records[0] {
                Discovery::Subdomain(s) => assert_eq!(s.subdomain, "api.example.com"),
                other => panic!("unexpected {other:?}"),
            }
        }
        assert!(parse_subfinder_line("", &c).is_empty());
    }

    #[test]
    fn dnsx_expands_answer_arrays() {
        let c = ctx("dnsx");
        let records = parse_dnsx_line(
            r#"{"host":"mail.example.com","a":["1.2.3.4","1.2.3.5"],"mx":["mx1.example.com"]}"#,
            &c,
        );
        assert_eq!(records.len(), 3);
        let mx = records
            .iter()
            .find_map(|d| match d {
                Discovery::Dns(r) if r.record_type == "MX" => Some(r),
                _ => None,
            })
            .unwrap();
        assert_eq!(mx.priority, Some(10));
        assert_eq!(mx.record_value, "mx1.example.com");
    }

    #[test]
    fn httpx_builds_a_probe_with_defaults() {
        let c = ctx("httpx");
        let records = parse_httpx_line(
            r#"{"input":"api.example.com","scheme":"https","status_code":200,"title":"API"}"#,
            &c,
        );
        match &records[0] {
            Discovery::HttpProbe(p) => {
                assert_eq!(p.port, 443);
                assert_eq!(p.status_code, Some(200));
                assert_eq!(p.title.as_deref(), Some("API"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn url_parsers_fingerprint_and_drop_garbage() {
        let c = ctx("gau");
        let ok = parse_gau_line("https://Example.com:443/a?b=1", &c);
        match &ok[0] {
            Discovery::HistoricalUrl(h) => {
                assert_eq!(h.url, "https://example.com/a?b=1");
                assert_eq!(h.url_hash.len(), 64);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(parse_gau_line("not a url", &c).is_empty());
    }

    #[test]
    fn katana_reads_the_request_endpoint() {
        let c = ctx("katana");
        let records = parse_katana_line(
            r#"{"request":{"endpoint":"https://example.com/login","method":"GET"}}"#,
            &c,
        );
        match &records[0] {
            Discovery::Endpoint(e) => assert_eq!(e.url, "https://example.com/login"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn urlfinder_derives_liveness_from_status() {
        let c = ctx("urlfinder");
        let records =
            parse_urlfinder_line(r#"{"url":"https://example.com/x","status_code":200}"#, &c);
        match &records[0] {
            Discovery::Url(u) => {
                assert!(u.alive);
                assert_eq!(u.sources, vec!["urlfinder"]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn fn_scanner_passes_through() {
        let scanner = FnScanner(|target: &str, c: &ScanContext| {
            Ok(ScannerOutput {
                records: parse_subfinder_line(&format!("api.{target}"), c),
                timed_out: false,
            })
        });
        let out = scanner.scan("example.com", &ctx("subfinder")).await.unwrap();
        assert_eq!(out.records.len(), 1);
    }

    #[test]
    fn unknown_module_has_no_scanner() {
        assert!(for_module("nmap", Duration::from_secs(1)).is_err());
    }
}
