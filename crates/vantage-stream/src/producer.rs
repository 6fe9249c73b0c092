//! Producer handle for one module's output stream.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use vantage_core::types::Discovery;
use vantage_core::ScanError;

use crate::record::{encode_completion, encode_data, CompletionMarker};
use crate::transport::StreamTransport;
use crate::{output_stream_key, STREAM_TTL};

/// Appends data records for one `(scan_job_id, module)` pair and writes the
/// completion marker on finish. Each producer exclusively owns its output
/// key for its scan job.
pub struct StreamProducer {
    transport: Arc<dyn StreamTransport>,
    key: String,
    module: String,
    scan_job_id: Uuid,
    appended: AtomicU64,
    finished: AtomicBool,
}

impl StreamProducer {
    pub fn new(transport: Arc<dyn StreamTransport>, scan_job_id: Uuid, module: &str) -> Self {
        let key = output_stream_key(scan_job_id, module);
        Self::with_key(transport, key, scan_job_id, module)
    }

    /// Producer over an explicitly named stream key (the launcher injects
    /// the key through the environment contract).
    pub fn with_key(
        transport: Arc<dyn StreamTransport>,
        key: impl Into<String>,
        scan_job_id: Uuid,
        module: &str,
    ) -> Self {
        Self {
            transport,
            key: key.into(),
            module: module.to_string(),
            scan_job_id,
            appended: AtomicU64::new(0),
            finished: AtomicBool::new(false),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn appended(&self) -> u64 {
        self.appended.load(Ordering::Relaxed)
    }

    pub async fn append(
        &self,
        discovery: &Discovery,
        metadata: Option<&serde_json::Value>,
    ) -> Result<String, ScanError> {
        let id = self
            .transport
            .append(&self.key, &encode_data(discovery, metadata))
            .await?;
        self.appended.fetch_add(1, Ordering::Relaxed);
        Ok(id)
    }

    /// Write the completion marker and arm the stream TTL. The marker must
    /// be the last record on the stream for this scan job; calling twice is
    /// a no-op.
    pub async fn finish(&self) -> Result<(), ScanError> {
        if self.finished.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let marker = CompletionMarker {
            module: self.module.clone(),
            scan_job_id: self.scan_job_id,
            timestamp: chrono::Utc::now(),
            total_results: self.appended(),
        };
        self.transport
            .append(&self.key, &encode_completion(&marker))
            .await?;
        self.transport.expire(&self.key, STREAM_TTL).await?;
        info!(
            stream = %self.key,
            total_results = marker.total_results,
            "completion marker written"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryTransport;
    use crate::record::{decode, StreamRecord, COMPLETION_TYPE};
    use chrono::Utc;
    use vantage_core::types::Subdomain;

    fn subdomain(scan_job_id: Uuid, name: &str) -> Discovery {
        Discovery::Subdomain(Subdomain {
            scan_job_id,
            asset_id: Uuid::nil(),
            subdomain: name.to_string(),
            source: "subfinder".to_string(),
            discovered_at: Utc::now(),
        })
    }

    #[tokio::test]
    async fn completion_is_the_last_record_and_written_once() {
        let transport = Arc::new(MemoryTransport::new());
        let job = Uuid::new_v4();
        let producer = StreamProducer::new(transport.clone(), job, "subfinder");

        producer
            .append(&subdomain(job, "a.example.com"), None)
            .await
            .unwrap();
        producer
            .append(&subdomain(job, "b.example.com"), None)
            .await
            .unwrap();
        producer.finish().await.unwrap();
        producer.finish().await.unwrap();

        let entries = transport.entries(producer.key());
        assert_eq!(entries.len(), 3);
        let markers: Vec<_> = entries
            .iter()
            .filter(|e| e.field("type") == Some(COMPLETION_TYPE))
            .collect();
        assert_eq!(markers.len(), 1);
        assert_eq!(entries.last().unwrap().field("type"), Some(COMPLETION_TYPE));

        match decode(entries.last().unwrap()).unwrap() {
            StreamRecord::Completion(m) => {
                assert_eq!(m.total_results, 2);
                assert_eq!(m.scan_job_id, job);
            }
            other => panic!("unexpected record: {other:?}"),
        }
    }

    #[tokio::test]
    async fn finish_arms_the_stream_ttl() {
        let transport = Arc::new(MemoryTransport::new());
        let producer = StreamProducer::new(transport.clone(), Uuid::new_v4(), "subfinder");
        producer.finish().await.unwrap();
        assert_eq!(transport.ttl_of(producer.key()), Some(STREAM_TTL));
    }
}
