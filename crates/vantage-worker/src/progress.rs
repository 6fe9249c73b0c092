//! Progress reporting: batch row updates, the progress snapshot key, and
//! the per-module status key the orchestrator polls.

use chrono::Utc;
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use vantage_core::types::{BatchProgress, BatchStatus};
use vantage_core::ScanError;
use vantage_store::retry::DEFAULT_UPDATE_ATTEMPTS;
use vantage_store::{with_store_retry, BatchUpdate, ScanStore};
use vantage_stream::{module_status_key, progress_key, StreamTransport, STREAM_TTL};

use crate::retry::DomainStatus;

pub struct ProgressReporter {
    store: Arc<dyn ScanStore>,
    transport: Option<Arc<dyn StreamTransport>>,
    batch_id: Option<Uuid>,
    scan_job_id: Uuid,
    module: String,
    total_domains: u64,
    completed: AtomicU64,
    failed: AtomicU64,
    partial: AtomicU64,
    out_of_scope: AtomicU64,
}

impl ProgressReporter {
    pub fn new(
        store: Arc<dyn ScanStore>,
        transport: Option<Arc<dyn StreamTransport>>,
        batch_id: Option<Uuid>,
        scan_job_id: Uuid,
        module: impl Into<String>,
        total_domains: u64,
    ) -> Self {
        Self {
            store,
            transport,
            batch_id,
            scan_job_id,
            module: module.into(),
            total_domains,
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            partial: AtomicU64::new(0),
            out_of_scope: AtomicU64::new(0),
        }
    }

    /// Mirror the sink's out-of-scope drop counter into the snapshot.
    pub fn set_out_of_scope(&self, count: u64) {
        self.out_of_scope.store(count, Ordering::Relaxed);
    }

    /// Account one finished domain. Partial successes produced records,
    /// so they count as completed; the partial count is surfaced
    /// separately in the batch metadata.
    pub fn record(&self, status: DomainStatus) {
        match status {
            DomainStatus::Completed => {
                self.completed.fetch_add(1, Ordering::Relaxed);
            }
            DomainStatus::PartialSuccess => {
                self.completed.fetch_add(1, Ordering::Relaxed);
                self.partial.fetch_add(1, Ordering::Relaxed);
            }
            DomainStatus::Failed => {
                self.failed.fetch_add(1, Ordering::Relaxed);
            }
            DomainStatus::Cancelled => {}
        }
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn partial(&self) -> u64 {
        self.partial.load(Ordering::Relaxed)
    }

    pub async fn started(&self) -> Result<(), ScanError> {
        self.publish(BatchStatus::Running, None).await
    }

    pub async fn completed_with(&self, status: BatchStatus, error: Option<String>) -> Result<(), ScanError> {
        self.publish(status, error).await
    }

    /// Best-effort `interrupted` write from the shutdown hook.
    pub async fn interrupted(&self, signal: &str) -> Result<(), ScanError> {
        let metadata = json!({
            "interrupted_at": Utc::now().to_rfc3339(),
            "signal": signal,
        });
        self.update_row(
            BatchStatus::Interrupted,
            Some(format!("interrupted by {signal}")),
            Some(metadata),
        )
        .await?;
        self.publish_keys(BatchStatus::Interrupted).await;
        Ok(())
    }

    /// Update the batch row (retry-wrapped) and refresh the progress and
    /// module-status keys. Key publication is advisory: failures are
    /// logged, never propagated.
    pub async fn publish(
        &self,
        status: BatchStatus,
        error: Option<String>,
    ) -> Result<(), ScanError> {
        let metadata = json!({ "partial_success_domains": self.partial() });
        self.update_row(status, error, Some(metadata)).await?;
        self.publish_keys(status).await;
        Ok(())
    }

    async fn update_row(
        &self,
        status: BatchStatus,
        error: Option<String>,
        metadata: Option<serde_json::Value>,
    ) -> Result<(), ScanError> {
        let Some(batch_id) = self.batch_id else {
            return Ok(());
        };
        let update = BatchUpdate {
            status: Some(status),
            completed_domains: Some(self.completed()),
            failed_domains: Some(self.failed()),
            error,
            metadata,
            ..BatchUpdate::default()
        };
        with_store_retry("update_batch", DEFAULT_UPDATE_ATTEMPTS, || {
            self.store.update_batch(batch_id, &update)
        })
        .await
    }

    async fn publish_keys(&self, status: BatchStatus) {
        let Some(transport) = &self.transport else {
            return;
        };
        if let Some(batch_id) = self.batch_id {
            let snapshot = BatchProgress {
                batch_id,
                module: self.module.clone(),
                status,
                total_domains: self.total_domains,
                completed_domains: self.completed(),
                failed_domains: self.failed(),
                partial_domains: self.partial(),
                out_of_scope: self.out_of_scope.load(Ordering::Relaxed),
                last_activity_at: Utc::now(),
            };
            if let Ok(payload) = serde_json::to_string(&snapshot) {
                if let Err(e) = transport
                    .set_key(&progress_key(batch_id), &payload, STREAM_TTL)
                    .await
                {
                    warn!(error = %e, "failed to publish progress key");
                }
            }
        }

        let module_status = match status {
            BatchStatus::Pending => "pending",
            BatchStatus::Running => "running",
            BatchStatus::Completed => "completed",
            BatchStatus::Failed | BatchStatus::Cancelled | BatchStatus::Interrupted => "failed",
        };
        if let Err(e) = transport
            .set_key(
                &module_status_key(self.scan_job_id, &self.module),
                module_status,
                STREAM_TTL,
            )
            .await
        {
            warn!(error = %e, "failed to publish module status key");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::HashMap;
    use vantage_core::types::BatchScanJob;
    use vantage_store::MemStore;
    use vantage_stream::MemoryTransport;

    fn batch_row(id: Uuid) -> BatchScanJob {
        BatchScanJob {
            id,
            module: "subfinder".to_string(),
            status: BatchStatus::Pending,
            batch_domains: vec!["example.com".to_string()],
            asset_scan_mapping: HashMap::new(),
            total_domains: 1,
            completed_domains: 0,
            failed_domains: 0,
            allocated_cpu: 256,
            allocated_memory: 512,
            est_duration_minutes: 1,
            task_handle: None,
            last_activity_at: Utc::now(),
            retry_count: 0,
            max_retries: 2,
            error: None,
        }
    }

    #[tokio::test]
    async fn publish_updates_row_and_keys() {
        let store = Arc::new(MemStore::new());
        let transport = Arc::new(MemoryTransport::new());
        let batch_id = Uuid::new_v4();
        let scan_job_id = Uuid::new_v4();
        store.create_batch(&batch_row(batch_id)).await.unwrap();

        let reporter = ProgressReporter::new(
            store.clone(),
            Some(transport.clone()),
            Some(batch_id),
            scan_job_id,
            "subfinder",
            1,
        );
        reporter.record(DomainStatus::Completed);
        reporter.publish(BatchStatus::Running, None).await.unwrap();

        let row = store.batch(batch_id).unwrap();
        assert_eq!(row.status, BatchStatus::Running);
        assert_eq!(row.completed_domains, 1);

        let status = transport
            .get_key(&module_status_key(scan_job_id, "subfinder"))
            .await
            .unwrap();
        assert_eq!(status.as_deref(), Some("running"));

        let snapshot_raw = transport
            .get_key(&progress_key(batch_id))
            .await
            .unwrap()
            .unwrap();
        let snapshot: BatchProgress = serde_json::from_str(&snapshot_raw).unwrap();
        assert_eq!(snapshot.completed_domains, 1);
    }

    #[tokio::test]
    async fn partial_success_counts_as_completed() {
        let store = Arc::new(MemStore::new());
        let batch_id = Uuid::new_v4();
        store.create_batch(&batch_row(batch_id)).await.unwrap();
        let reporter = ProgressReporter::new(
            store.clone(),
            None,
            Some(batch_id),
            Uuid::new_v4(),
            "subfinder",
            2,
        );
        reporter.record(DomainStatus::PartialSuccess);
        reporter.record(DomainStatus::Failed);
        reporter
            .publish(BatchStatus::Completed, None)
            .await
            .unwrap();

        let row = store.batch(batch_id).unwrap();
        assert_eq!(row.completed_domains, 1);
        assert_eq!(row.failed_domains, 1);
        let metadata = store.batch_metadata(batch_id).unwrap();
        assert_eq!(metadata["partial_success_domains"], 1);
    }

    #[tokio::test]
    async fn row_updates_survive_transient_store_failures() {
        let store = Arc::new(MemStore::new());
        let batch_id = Uuid::new_v4();
        store.create_batch(&batch_row(batch_id)).await.unwrap();
        store.fail_next_batch_updates(2);

        let reporter = ProgressReporter::new(
            store.clone(),
            None,
            Some(batch_id),
            Uuid::new_v4(),
            "subfinder",
            1,
        );
        reporter.started().await.unwrap();
        assert_eq!(store.batch(batch_id).unwrap().status, BatchStatus::Running);
    }

    #[tokio::test]
    async fn interrupted_write_records_signal_metadata() {
        let store = Arc::new(MemStore::new());
        let batch_id = Uuid::new_v4();
        store.create_batch(&batch_row(batch_id)).await.unwrap();
        let reporter = ProgressReporter::new(
            store.clone(),
            None,
            Some(batch_id),
            Uuid::new_v4(),
            "subfinder",
            1,
        );
        reporter.interrupted("SIGTERM").await.unwrap();

        let row = store.batch(batch_id).unwrap();
        assert_eq!(row.status, BatchStatus::Interrupted);
        assert!(row.error.unwrap().contains("SIGTERM"));
        let metadata = store.batch_metadata(batch_id).unwrap();
        assert_eq!(metadata["signal"], "SIGTERM");
        assert!(metadata["interrupted_at"].is_string());
    }

    #[tokio::test]
    async fn no_batch_id_means_no_row_writes() {
        let store = Arc::new(MemStore::new());
        let reporter =
            ProgressReporter::new(store.clone(), None, None, Uuid::new_v4(), "subfinder", 1);
        // Simple mode: nothing to update, nothing to fail on.
        reporter.publish(BatchStatus::Completed, None).await.unwrap();
    }
}
