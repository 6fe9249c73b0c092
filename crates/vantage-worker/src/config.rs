//! Worker configuration from the environment contract.
//!
//! The router reads the environment once, decides the execution mode, and
//! fails fast with the complete list of missing (or malformed) variables.

use std::time::Duration;
use uuid::Uuid;

use vantage_core::ScanError;
use vantage_runtime::env as envkeys;

/// Execution mode, decided from the environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Ad-hoc run: domains from `DOMAINS`, results persisted directly.
    Simple,
    /// Orchestrated batch: domains pinned in `BATCH_DOMAINS` or fetched
    /// from the store by `(asset_id, offset, limit)`.
    Batch,
    /// Consume an upstream module's output stream via a consumer group.
    StreamingConsumer,
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub mode: Mode,
    pub module: String,
    pub scan_job_id: Uuid,
    pub user_id: Uuid,
    pub asset_id: Option<Uuid>,
    pub batch_id: Option<Uuid>,
    pub database_url: String,
    pub service_key: String,
    pub redis_host: Option<String>,
    pub redis_port: Option<u16>,
    pub streaming_mode: bool,
    pub stream_input_keys: Vec<String>,
    pub stream_output_key: Option<String>,
    pub consumer_group: Option<String>,
    pub consumer_name: Option<String>,
    /// Completion markers to observe before the consumer loop exits;
    /// defaults to one per input stream.
    pub expected_completions: Option<u64>,
    pub batch_offset: u64,
    pub batch_limit: u64,
    pub domains: Vec<String>,
    pub batch_domains: Vec<String>,
    pub workers: usize,
    pub rate_per_sec: f64,
    pub batch_size: usize,
    pub block: Duration,
    /// Idle threshold before pending messages are claimed from dead
    /// consumers.
    pub min_idle: Duration,
    pub max_processing_time: Duration,
    pub scan_timeout: Duration,
    pub max_retries: u32,
    pub metrics_port: u16,
    pub log_level: String,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, ScanError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any name -> value lookup (tests inject maps here).
    pub fn from_lookup<F>(get: F) -> Result<Self, ScanError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut missing: Vec<String> = Vec::new();

        let module = required(&get, &mut missing, envkeys::MODULE);
        let scan_job_id_raw = required(&get, &mut missing, envkeys::SCAN_JOB_ID);
        let user_id_raw = required(&get, &mut missing, envkeys::USER_ID);
        let database_url = required(&get, &mut missing, envkeys::SUPABASE_URL);
        let service_key = required(&get, &mut missing, envkeys::SERVICE_KEY);

        let streaming_mode = get(envkeys::STREAMING_MODE)
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        let stream_input_raw = get(envkeys::STREAM_INPUT_KEY);
        let batch_id_raw = get(envkeys::BATCH_ID);

        let mode = if streaming_mode && stream_input_raw.is_some() {
            Mode::StreamingConsumer
        } else if batch_id_raw.is_some() {
            Mode::Batch
        } else {
            Mode::Simple
        };

        // Per-mode requirements; every miss is reported, not just the first.
        let mut domains = Vec::new();
        let mut batch_offset = 0u64;
        let mut batch_limit = 0u64;
        match mode {
            Mode::Simple => {
                let raw = required(&get, &mut missing, envkeys::DOMAINS);
                if !raw.is_empty() {
                    match serde_json::from_str::<Vec<String>>(&raw) {
                        Ok(list) => domains = list,
                        Err(_) => missing.push(format!("{} (invalid JSON array)", envkeys::DOMAINS)),
                    }
                }
            }
            Mode::Batch => {
                required(&get, &mut missing, envkeys::BATCH_ID);
                required(&get, &mut missing, envkeys::ASSET_ID);
                batch_offset = parse_required(
                    envkeys::BATCH_OFFSET,
                    &mut missing,
                    get(envkeys::BATCH_OFFSET),
                );
                batch_limit = parse_required(
                    envkeys::BATCH_LIMIT,
                    &mut missing,
                    get(envkeys::BATCH_LIMIT),
                );
                if batch_limit == 0 && !missing.iter().any(|m| m.starts_with(envkeys::BATCH_LIMIT))
                {
                    missing.push(format!("{} (must be positive)", envkeys::BATCH_LIMIT));
                }
            }
            Mode::StreamingConsumer => {
                required(&get, &mut missing, envkeys::STREAM_INPUT_KEY);
                required(&get, &mut missing, envkeys::CONSUMER_GROUP_NAME);
                required(&get, &mut missing, envkeys::CONSUMER_NAME);
                required(&get, &mut missing, envkeys::REDIS_HOST);
                required(&get, &mut missing, envkeys::REDIS_PORT);
            }
        }

        // A streaming producer needs its output stream and the broker.
        if streaming_mode && mode != Mode::StreamingConsumer {
            required(&get, &mut missing, envkeys::STREAM_OUTPUT_KEY);
            required(&get, &mut missing, envkeys::REDIS_HOST);
            required(&get, &mut missing, envkeys::REDIS_PORT);
        }

        let scan_job_id = parse_uuid(envkeys::SCAN_JOB_ID, &scan_job_id_raw, &mut missing);
        let user_id = parse_uuid(envkeys::USER_ID, &user_id_raw, &mut missing);
        let asset_id = match get(envkeys::ASSET_ID) {
            Some(raw) => Some(parse_uuid(envkeys::ASSET_ID, &raw, &mut missing)),
            None => None,
        };
        let batch_id = match &batch_id_raw {
            Some(raw) => Some(parse_uuid(envkeys::BATCH_ID, raw, &mut missing)),
            None => None,
        };

        let redis_port = match get(envkeys::REDIS_PORT) {
            Some(raw) => match raw.parse::<u16>() {
                Ok(p) => Some(p),
                Err(_) => {
                    missing.push(format!("{} (invalid port)", envkeys::REDIS_PORT));
                    None
                }
            },
            None => None,
        };

        if !missing.is_empty() {
            missing.sort();
            missing.dedup();
            return Err(ScanError::Config { missing });
        }

        let batch_domains = get(envkeys::BATCH_DOMAINS)
            .and_then(|raw| serde_json::from_str::<Vec<String>>(&raw).ok())
            .unwrap_or_default();

        Ok(Self {
            mode,
            module,
            scan_job_id,
            user_id,
            asset_id,
            batch_id,
            database_url,
            service_key,
            redis_host: get(envkeys::REDIS_HOST),
            redis_port,
            streaming_mode,
            stream_input_keys: stream_input_raw
                .map(|raw| {
                    raw.split(',')
                        .map(|k| k.trim().to_string())
                        .filter(|k| !k.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            stream_output_key: get(envkeys::STREAM_OUTPUT_KEY),
            consumer_group: get(envkeys::CONSUMER_GROUP_NAME),
            consumer_name: get(envkeys::CONSUMER_NAME),
            expected_completions: get(envkeys::EXPECTED_COMPLETIONS)
                .and_then(|v| v.parse().ok()),
            batch_offset,
            batch_limit,
            domains,
            batch_domains,
            workers: parse_or(get(envkeys::WORKERS), 10),
            rate_per_sec: get("RATE_LIMIT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(10.0),
            batch_size: parse_or(get(envkeys::BATCH_SIZE), 100),
            block: Duration::from_millis(parse_or(get(envkeys::BLOCK_MILLISECONDS), 5_000)),
            min_idle: Duration::from_millis(parse_or(
                get("MIN_IDLE_MILLISECONDS"),
                5 * 60 * 1_000u64,
            )),
            max_processing_time: Duration::from_secs(parse_or(
                get(envkeys::MAX_PROCESSING_TIME),
                3_600,
            )),
            scan_timeout: Duration::from_secs(
                60 * parse_or(get(envkeys::SCAN_TIMEOUT), 5u64),
            ),
            max_retries: parse_or(get("MAX_RETRIES"), 2u32),
            metrics_port: parse_or(get(envkeys::METRICS_PORT), 9_090u16),
            log_level: get(envkeys::LOG_LEVEL).unwrap_or_else(|| "info".to_string()),
        })
    }
}

fn required<F>(get: &F, missing: &mut Vec<String>, name: &str) -> String
where
    F: Fn(&str) -> Option<String>,
{
    match get(name) {
        Some(v) if !v.is_empty() => v,
        _ => {
            missing.push(name.to_string());
            String::new()
        }
    }
}

fn parse_uuid(name: &str, raw: &str, missing: &mut Vec<String>) -> Uuid {
    if raw.is_empty() {
        // Already reported as missing.
        return Uuid::nil();
    }
    match raw.parse() {
        Ok(id) => id,
        Err(_) => {
            missing.push(format!("{name} (invalid UUID)"));
            Uuid::nil()
        }
    }
}

fn parse_required(name: &str, missing: &mut Vec<String>, raw: Option<String>) -> u64 {
    match raw {
        Some(v) => match v.parse() {
            Ok(n) => n,
            Err(_) => {
                missing.push(format!("{name} (invalid integer)"));
                0
            }
        },
        None => {
            missing.push(name.to_string());
            0
        }
    }
}

fn parse_or<T: std::str::FromStr>(raw: Option<String>, default: T) -> T {
    raw.and_then(|v| v.parse().ok()).unwrap_or(default)
}
