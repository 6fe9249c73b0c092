//! Worker execution-core scenarios against the in-memory backends.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use vantage_core::types::{
    Asset, BatchScanJob, BatchStatus, Discovery, DnsRecord, Subdomain, WorkerState,
};
use vantage_core::ScanError;
use vantage_store::{MemStore, ScanStore};
use vantage_stream::record::{encode_completion, encode_data, CompletionMarker};
use vantage_stream::{consumer_group, output_stream_key, MemoryTransport, StreamTransport};
use vantage_worker::runner::{run, WorkerContext};
use vantage_worker::scanner::{DomainScanner, FnScanner, ScanContext, ScannerOutput};
use vantage_worker::shutdown::{cancel_pair, CancelHandle, CancelReason};
use vantage_worker::{WorkerConfig, WorkerMetrics};

fn base_env(module: &str) -> HashMap<String, String> {
    let mut env = HashMap::new();
    env.insert("MODULE".to_string(), module.to_string());
    env.insert("SCAN_JOB_ID".to_string(), Uuid::new_v4().to_string());
    env.insert("USER_ID".to_string(), Uuid::new_v4().to_string());
    env.insert(
        "SUPABASE_URL".to_string(),
        "postgres://stub/vantage".to_string(),
    );
    env.insert("SERVICE_KEY".to_string(), "svc".to_string());
    env.insert("RATE_LIMIT".to_string(), "1000000".to_string());
    env.insert("BLOCK_MILLISECONDS".to_string(), "100".to_string());
    env.insert("MAX_RETRIES".to_string(), "0".to_string());
    env
}

fn build_context(
    env: &HashMap<String, String>,
    store: Arc<MemStore>,
    transport: Option<Arc<MemoryTransport>>,
    scanner: Arc<dyn DomainScanner>,
) -> (WorkerContext, CancelHandle) {
    let config = WorkerConfig::from_lookup(|name| env.get(name).cloned()).unwrap();
    let (handle, cancel) = cancel_pair();
    let ctx = WorkerContext {
        config,
        store: store as Arc<dyn ScanStore>,
        transport: transport.map(|t| t as Arc<dyn StreamTransport>),
        scanner,
        cancel,
        metrics: WorkerMetrics::new(),
    };
    (ctx, handle)
}

fn subdomain_of(ctx: &ScanContext, name: &str) -> Discovery {
    Discovery::Subdomain(Subdomain {
        scan_job_id: ctx.scan_job_id,
        asset_id: ctx.asset_id,
        subdomain: name.to_string(),
        source: ctx.module.clone(),
        discovered_at: Utc::now(),
    })
}

/// Simple mode: synthetic results collapse duplicates and drop the
/// out-of-scope host; exactly one subdomain survives.
#[tokio::test]
async fn simple_mode_scopes_and_dedups() {
    let store = Arc::new(MemStore::new());
    let mut env = base_env("subfinder");
    env.insert("DOMAINS".to_string(), r#"["example.com"]"#.to_string());

    let scanner = Arc::new(FnScanner(|_: &str, c: &ScanContext| {
        Ok(ScannerOutput {
            records: vec![
                subdomain_of(c, "api.example.com"),
                subdomain_of(c, "foo.other.com"),
                subdomain_of(c, "api.example.com"),
            ],
            timed_out: false,
        })
    }));

    let (ctx, _handle) = build_context(&env, store.clone(), None, scanner);
    let summary = run(&ctx).await.unwrap();

    assert_eq!(summary.state, WorkerState::Completed);
    assert_eq!(summary.completed_domains, 1);
    assert_eq!(summary.out_of_scope, 1);
    assert_eq!(summary.deduped, 1);

    let asset_id = ctx.config.scan_job_id; // simple mode fallback identity
    assert_eq!(store.subdomain_names(asset_id), vec!["api.example.com"]);
    assert_eq!(store.subdomain_count(), 1);
}

fn dns_scanner() -> Arc<dyn DomainScanner> {
    Arc::new(FnScanner(|target: &str, c: &ScanContext| {
        Ok(ScannerOutput {
            records: vec![Discovery::Dns(DnsRecord {
                scan_job_id: c.scan_job_id,
                asset_id: c.asset_id,
                subdomain: target.to_string(),
                record_type: "A".to_string(),
                record_value: "93.184.216.34".to_string(),
                priority: None,
                source: c.module.clone(),
                discovered_at: Utc::now(),
            })],
            timed_out: false,
        })
    }))
}

async fn seed_stream(
    transport: &MemoryTransport,
    key: &str,
    scan_job_id: Uuid,
    asset_id: Uuid,
    hosts: &[&str],
    completion_after: bool,
) {
    for host in hosts {
        let record = Discovery::Subdomain(Subdomain {
            scan_job_id,
            asset_id,
            subdomain: host.to_string(),
            source: "subfinder".to_string(),
            discovered_at: Utc::now(),
        });
        transport
            .append(key, &encode_data(&record, None))
            .await
            .unwrap();
    }
    if completion_after {
        let marker = CompletionMarker {
            module: "subfinder".to_string(),
            scan_job_id,
            timestamp: Utc::now(),
            total_results: hosts.len() as u64,
        };
        transport
            .append(key, &encode_completion(&marker))
            .await
            .unwrap();
    }
}

fn consumer_env(
    env: &mut HashMap<String, String>,
    key: &str,
    asset_id: Uuid,
) {
    env.insert("STREAMING_MODE".to_string(), "true".to_string());
    env.insert("STREAM_INPUT_KEY".to_string(), key.to_string());
    env.insert(
        "CONSUMER_GROUP_NAME".to_string(),
        consumer_group("dnsx"),
    );
    env.insert("CONSUMER_NAME".to_string(), "dnsx-task-t1".to_string());
    env.insert("REDIS_HOST".to_string(), "stub".to_string());
    env.insert("REDIS_PORT".to_string(), "6379".to_string());
    env.insert("ASSET_ID".to_string(), asset_id.to_string());
}

/// A consumer stops at the completion marker: on `[R1, R2, completion,
/// R3]` the trailing record is never processed, and the marker is acked.
#[tokio::test]
async fn consumer_exits_on_completion_marker() {
    let store = Arc::new(MemStore::new());
    let transport = Arc::new(MemoryTransport::new());
    let asset = Asset {
        id: Uuid::new_v4(),
        apex_domains: vec!["example.com".to_string()],
    };
    store.insert_asset(asset.clone());

    let mut env = base_env("dnsx");
    let scan_job_id: Uuid = env["SCAN_JOB_ID"].parse().unwrap();
    let key = output_stream_key(scan_job_id, "subfinder");
    consumer_env(&mut env, &key, asset.id);

    seed_stream(
        &transport,
        &key,
        scan_job_id,
        asset.id,
        &["a.example.com", "b.example.com"],
        true,
    )
    .await;
    // R3 lands after the marker; no producer should do this, but the
    // consumer must not care.
    seed_stream(
        &transport,
        &key,
        scan_job_id,
        asset.id,
        &["c.example.com"],
        false,
    )
    .await;

    let (ctx, _handle) = build_context(
        &env,
        store.clone(),
        Some(transport.clone()),
        dns_scanner(),
    );
    let summary = run(&ctx).await.unwrap();

    assert_eq!(summary.state, WorkerState::Completed);
    assert_eq!(summary.completed_domains, 2);
    assert_eq!(store.dns_record_count(), 2);

    // R3 was delivered but neither processed nor acked.
    assert_eq!(transport.pending_count(&key, &consumer_group("dnsx")), 1);
}

/// At-least-once hygiene: duplicated entries in the stream still converge
/// to one row per natural key, and every processed entry is acked.
#[tokio::test]
async fn consumer_collapses_duplicate_deliveries() {
    let store = Arc::new(MemStore::new());
    let transport = Arc::new(MemoryTransport::new());
    let asset = Asset {
        id: Uuid::new_v4(),
        apex_domains: vec!["example.com".to_string()],
    };
    store.insert_asset(asset.clone());

    let mut env = base_env("dnsx");
    let scan_job_id: Uuid = env["SCAN_JOB_ID"].parse().unwrap();
    let key = output_stream_key(scan_job_id, "subfinder");
    consumer_env(&mut env, &key, asset.id);

    seed_stream(
        &transport,
        &key,
        scan_job_id,
        asset.id,
        &["a.example.com", "a.example.com", "a.example.com"],
        true,
    )
    .await;

    let (ctx, _handle) = build_context(
        &env,
        store.clone(),
        Some(transport.clone()),
        dns_scanner(),
    );
    let summary = run(&ctx).await.unwrap();

    assert_eq!(summary.state, WorkerState::Completed);
    assert_eq!(store.dns_record_count(), 1);
    assert_eq!(summary.consumed, 4);
    // Everything acked, nothing left pending.
    assert_eq!(transport.pending_count(&key, &consumer_group("dnsx")), 0);
}

/// The store-level half of at-least-once: a record re-delivered after a
/// crashed consumer (claimed from pending) still yields exactly one row.
#[tokio::test]
async fn redelivered_record_yields_one_row() {
    let store = Arc::new(MemStore::new());
    let transport = Arc::new(MemoryTransport::new());
    let asset = Asset {
        id: Uuid::new_v4(),
        apex_domains: vec!["example.com".to_string()],
    };
    store.insert_asset(asset.clone());

    let mut env = base_env("dnsx");
    // Claim aggressively so the stranded delivery is picked up at once.
    env.insert("MIN_IDLE_MILLISECONDS".to_string(), "0".to_string());
    let scan_job_id: Uuid = env["SCAN_JOB_ID"].parse().unwrap();
    let key = output_stream_key(scan_job_id, "subfinder");
    consumer_env(&mut env, &key, asset.id);

    seed_stream(
        &transport,
        &key,
        scan_job_id,
        asset.id,
        &["a.example.com"],
        true,
    )
    .await;

    // First delivery went to a consumer that died before acking, but
    // after persisting its work.
    transport
        .create_group(&key, &consumer_group("dnsx"))
        .await
        .unwrap();
    let dead = transport
        .read_group(&key, &consumer_group("dnsx"), "dead", 1, Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(dead.len(), 1);
    store
        .upsert_dns_records(&[DnsRecord {
            scan_job_id,
            asset_id: asset.id,
            subdomain: "a.example.com".to_string(),
            record_type: "A".to_string(),
            record_value: "93.184.216.34".to_string(),
            priority: None,
            source: "dnsx".to_string(),
            discovered_at: Utc::now(),
        }])
        .await
        .unwrap();

    // The replacement worker claims the stranded entry, reprocesses it,
    // and converges on the same row before exiting on the marker.
    let (ctx, _handle) = build_context(
        &env,
        store.clone(),
        Some(transport.clone()),
        dns_scanner(),
    );
    let summary = run(&ctx).await.unwrap();
    assert_eq!(summary.state, WorkerState::Completed);
    assert_eq!(store.dns_record_count(), 1);
    assert_eq!(transport.pending_count(&key, &consumer_group("dnsx")), 0);
}

struct SlowScanner;

#[async_trait]
impl DomainScanner for SlowScanner {
    async fn scan(&self, _target: &str, _ctx: &ScanContext) -> Result<ScannerOutput, ScanError> {
        tokio::time::sleep(Duration::from_secs(300)).await;
        Ok(ScannerOutput::default())
    }
}

fn batch_row(batch_id: Uuid, domains: &[&str]) -> BatchScanJob {
    BatchScanJob {
        id: batch_id,
        module: "subfinder".to_string(),
        status: BatchStatus::Pending,
        batch_domains: domains.iter().map(|d| d.to_string()).collect(),
        asset_scan_mapping: HashMap::new(),
        total_domains: domains.len() as u64,
        completed_domains: 0,
        failed_domains: 0,
        allocated_cpu: 256,
        allocated_memory: 512,
        est_duration_minutes: 1,
        task_handle: None,
        last_activity_at: Utc::now(),
        retry_count: 0,
        max_retries: 0,
        error: None,
    }
}

/// Signal-driven shutdown: the worker cancels, flushes, and writes
/// `interrupted` well inside the 10-second drain budget.
#[tokio::test]
async fn sigterm_writes_interrupted_within_the_deadline() {
    let store = Arc::new(MemStore::new());
    let asset = Asset {
        id: Uuid::new_v4(),
        apex_domains: vec!["example.com".to_string()],
    };
    store.insert_asset(asset.clone());

    let batch_id = Uuid::new_v4();
    store
        .create_batch(&batch_row(batch_id, &["example.com"]))
        .await
        .unwrap();

    let mut env = base_env("subfinder");
    env.insert("BATCH_ID".to_string(), batch_id.to_string());
    env.insert("ASSET_ID".to_string(), asset.id.to_string());
    env.insert("BATCH_OFFSET".to_string(), "0".to_string());
    env.insert("BATCH_LIMIT".to_string(), "1".to_string());
    env.insert(
        "BATCH_DOMAINS".to_string(),
        r#"["example.com"]"#.to_string(),
    );

    let (ctx, handle) = build_context(&env, store.clone(), None, Arc::new(SlowScanner));

    let started = std::time::Instant::now();
    let worker = tokio::spawn(async move { run(&ctx).await });
    tokio::time::sleep(Duration::from_millis(200)).await;
    handle.cancel(CancelReason::Signal("SIGTERM".to_string()));

    let summary = worker.await.unwrap().unwrap();
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(summary.state, WorkerState::Interrupted);

    let row = store.batch(batch_id).unwrap();
    assert_eq!(row.status, BatchStatus::Interrupted);
    assert!(row.error.unwrap().contains("SIGTERM"));
}

/// Cancellation tokens observed mid-pool stop new work; this pins the
/// requested-cancel (not signal) path to `cancelled`, not `interrupted`.
#[tokio::test]
async fn requested_cancellation_marks_the_batch_cancelled() {
    let store = Arc::new(MemStore::new());
    let asset = Asset {
        id: Uuid::new_v4(),
        apex_domains: vec!["example.com".to_string()],
    };
    store.insert_asset(asset.clone());
    let batch_id = Uuid::new_v4();
    store
        .create_batch(&batch_row(batch_id, &["example.com"]))
        .await
        .unwrap();

    let mut env = base_env("subfinder");
    env.insert("BATCH_ID".to_string(), batch_id.to_string());
    env.insert("ASSET_ID".to_string(), asset.id.to_string());
    env.insert("BATCH_OFFSET".to_string(), "0".to_string());
    env.insert("BATCH_LIMIT".to_string(), "1".to_string());
    env.insert(
        "BATCH_DOMAINS".to_string(),
        r#"["example.com"]"#.to_string(),
    );

    let (ctx, handle) = build_context(&env, store.clone(), None, Arc::new(SlowScanner));
    let worker = tokio::spawn(async move { run(&ctx).await });
    tokio::time::sleep(Duration::from_millis(200)).await;
    handle.cancel(CancelReason::Requested);

    let summary = worker.await.unwrap().unwrap();
    assert_eq!(summary.state, WorkerState::Cancelled);
    assert_eq!(store.batch(batch_id).unwrap().status, BatchStatus::Cancelled);
}
