//! The result sink every execution path shares.
//!
//! Fan-in point for scanner callbacks: scope enforcement, in-memory
//! dedup, optional stream append, and buffered idempotent persistence.
//! The buffer has a single logical writer; the mutex serializes callbacks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;

use vantage_core::types::Discovery;
use vantage_core::{DedupSet, ScanError, ScopeFilter};
use vantage_store::{upsert_discoveries, ScanStore};
use vantage_stream::StreamProducer;

use crate::metrics::WorkerMetrics;

pub struct ResultSink {
    store: Arc<dyn ScanStore>,
    producer: Option<StreamProducer>,
    scope: ScopeFilter,
    dedup: DedupSet,
    buffer: Mutex<Vec<Discovery>>,
    flush_threshold: usize,
    out_of_scope: AtomicU64,
    suppressed: AtomicU64,
    accepted: AtomicU64,
    metrics: WorkerMetrics,
}

impl ResultSink {
    pub fn new(
        store: Arc<dyn ScanStore>,
        scope: ScopeFilter,
        producer: Option<StreamProducer>,
        metrics: WorkerMetrics,
    ) -> Self {
        Self {
            store,
            producer,
            scope,
            dedup: DedupSet::new(),
            buffer: Mutex::new(Vec::new()),
            flush_threshold: 100,
            out_of_scope: AtomicU64::new(0),
            suppressed: AtomicU64::new(0),
            accepted: AtomicU64::new(0),
            metrics,
        }
    }

    pub fn with_flush_threshold(mut self, threshold: usize) -> Self {
        self.flush_threshold = threshold.max(1);
        self
    }

    /// Run one batch of scanner results through scope, dedup, stream, and
    /// the persistence buffer.
    pub async fn accept(&self, records: Vec<Discovery>) -> Result<(), ScanError> {
        let mut kept = Vec::new();
        for record in records {
            let in_scope = record
                .host()
                .map(|h| self.scope.contains(&h))
                .unwrap_or(false);
            if !in_scope {
                self.out_of_scope.fetch_add(1, Ordering::Relaxed);
                self.metrics.records_out_of_scope.inc();
                continue;
            }
            if !self.dedup.insert(&record.dedup_key()) {
                self.suppressed.fetch_add(1, Ordering::Relaxed);
                self.metrics.records_deduped.inc();
                continue;
            }
            kept.push(record);
        }

        for record in &kept {
            if let Some(producer) = &self.producer {
                producer.append(record, None).await?;
                self.metrics.records_streamed.inc();
            }
        }

        let should_flush = {
            let mut buffer = self.buffer.lock().unwrap();
            self.accepted.fetch_add(kept.len() as u64, Ordering::Relaxed);
            buffer.extend(kept);
            buffer.len() >= self.flush_threshold
        };
        if should_flush {
            self.flush().await?;
        }
        Ok(())
    }

    /// Drain the buffer into the store.
    pub async fn flush(&self) -> Result<(), ScanError> {
        let drained: Vec<Discovery> = {
            let mut buffer = self.buffer.lock().unwrap();
            std::mem::take(&mut *buffer)
        };
        if drained.is_empty() {
            return Ok(());
        }
        let stats = upsert_discoveries(self.store.as_ref(), &drained).await?;
        self.metrics.records_persisted.inc_by(drained.len() as u64);
        debug!(
            flushed = drained.len(),
            inserted = stats.inserted,
            updated = stats.updated,
            skipped = stats.skipped,
            "result buffer flushed"
        );
        Ok(())
    }

    /// Final flush plus the completion marker, when streaming.
    pub async fn finish(&self) -> Result<(), ScanError> {
        self.flush().await?;
        if let Some(producer) = &self.producer {
            producer.finish().await?;
        }
        Ok(())
    }

    pub fn out_of_scope(&self) -> u64 {
        self.out_of_scope.load(Ordering::Relaxed)
    }

    pub fn suppressed(&self) -> u64 {
        self.suppressed.load(Ordering::Relaxed)
    }

    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    pub fn streamed(&self) -> u64 {
        self.producer.as_ref().map(|p| p.appended()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;
    use vantage_core::types::Subdomain;
    use vantage_store::MemStore;
    use vantage_stream::record::COMPLETION_TYPE;
    use vantage_stream::MemoryTransport;

    fn subdomain(asset_id: Uuid, name: &str) -> Discovery {
        Discovery::Subdomain(Subdomain {
            scan_job_id: Uuid::nil(),
            asset_id,
            subdomain: name.to_string(),
            source: "subfinder".to_string(),
            discovered_at: Utc::now(),
        })
    }

    #[tokio::test]
    async fn out_of_scope_records_are_dropped_and_counted() {
        let store = Arc::new(MemStore::new());
        let asset = Uuid::new_v4();
        let sink = ResultSink::new(
            store.clone(),
            ScopeFilter::new(["example.com"]),
            None,
            WorkerMetrics::new(),
        );

        sink.accept(vec![
            subdomain(asset, "api.example.com"),
            subdomain(asset, "foo.other.com"),
            subdomain(asset, "api.example.com"),
        ])
        .await
        .unwrap();
        sink.finish().await.unwrap();

        assert_eq!(store.subdomain_names(asset), vec!["api.example.com"]);
        assert_eq!(sink.out_of_scope(), 1);
        assert_eq!(sink.suppressed(), 1);
        assert_eq!(sink.accepted(), 1);
    }

    #[tokio::test]
    async fn buffer_flushes_at_the_threshold() {
        let store = Arc::new(MemStore::new());
        let asset = Uuid::new_v4();
        let sink = ResultSink::new(
            store.clone(),
            ScopeFilter::new(["example.com"]),
            None,
            WorkerMetrics::new(),
        )
        .with_flush_threshold(2);

        sink.accept(vec![subdomain(asset, "a.example.com")])
            .await
            .unwrap();
        assert_eq!(store.subdomain_count(), 0);

        sink.accept(vec![subdomain(asset, "b.example.com")])
            .await
            .unwrap();
        assert_eq!(store.subdomain_count(), 2);
    }

    #[tokio::test]
    async fn streaming_sink_appends_then_completes() {
        let store = Arc::new(MemStore::new());
        let transport = Arc::new(MemoryTransport::new());
        let job = Uuid::new_v4();
        let asset = Uuid::new_v4();
        let producer = StreamProducer::new(transport.clone(), job, "subfinder");
        let key = producer.key().to_string();
        let sink = ResultSink::new(
            store.clone(),
            ScopeFilter::new(["example.com"]),
            Some(producer),
            WorkerMetrics::new(),
        );

        sink.accept(vec![
            subdomain(asset, "a.example.com"),
            subdomain(asset, "b.example.com"),
            subdomain(asset, "a.example.com"),
        ])
        .await
        .unwrap();
        sink.finish().await.unwrap();

        let entries = transport.entries(&key);
        // Two data records (duplicate suppressed before streaming) plus
        // the completion marker, last.
        assert_eq!(entries.len(), 3);
        assert_eq!(entries.last().unwrap().field("type"), Some(COMPLETION_TYPE));
        assert_eq!(sink.streamed(), 2);
    }

    #[tokio::test]
    async fn hostless_records_count_as_out_of_scope() {
        let store = Arc::new(MemStore::new());
        let asset = Uuid::new_v4();
        let sink = ResultSink::new(
            store.clone(),
            ScopeFilter::new(["example.com"]),
            None,
            WorkerMetrics::new(),
        );
        let bad = Discovery::Endpoint(vantage_core::types::Endpoint {
            scan_job_id: Uuid::nil(),
            asset_id: asset,
            url: "not a url".to_string(),
            url_hash: "x".to_string(),
            source: "katana".to_string(),
            discovered_at: Utc::now(),
        });
        sink.accept(vec![bad]).await.unwrap();
        sink.finish().await.unwrap();
        assert_eq!(store.endpoint_count(), 0);
        assert_eq!(sink.out_of_scope(), 1);
    }
}
