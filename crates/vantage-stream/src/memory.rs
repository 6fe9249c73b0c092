//! In-memory stream backend with consumer-group semantics.
//!
//! Mirrors the Redis backend's guarantees (FIFO per key, per-group
//! exclusive delivery, pending entries reclaimable after an idle period)
//! so the pipeline and workers can be exercised hermetically in tests and
//! local smoke runs.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use vantage_core::ScanError;

use crate::transport::{StreamEntry, StreamTransport};

#[derive(Debug, Clone)]
struct StoredEntry {
    id: String,
    fields: Vec<(String, String)>,
}

#[derive(Debug)]
struct PendingEntry {
    consumer: String,
    delivered_at: Instant,
    index: usize,
}

#[derive(Debug, Default)]
struct GroupState {
    /// Index of the next never-delivered entry.
    cursor: usize,
    pending: HashMap<String, PendingEntry>,
}

#[derive(Debug, Default)]
struct StreamState {
    entries: Vec<StoredEntry>,
    groups: HashMap<String, GroupState>,
    next_seq: u64,
    ttl: Option<Duration>,
}

#[derive(Default)]
pub struct MemoryTransport {
    streams: Mutex<HashMap<String, StreamState>>,
    kv: Mutex<HashMap<String, (String, Duration)>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every entry ever appended to a key, in append order.
    pub fn entries(&self, key: &str) -> Vec<StreamEntry> {
        self.streams
            .lock()
            .unwrap()
            .get(key)
            .map(|s| {
                s.entries
                    .iter()
                    .map(|e| StreamEntry {
                        id: e.id.clone(),
                        fields: e.fields.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn pending_count(&self, key: &str, group: &str) -> usize {
        self.streams
            .lock()
            .unwrap()
            .get(key)
            .and_then(|s| s.groups.get(group))
            .map(|g| g.pending.len())
            .unwrap_or(0)
    }

    pub fn ttl_of(&self, key: &str) -> Option<Duration> {
        self.streams.lock().unwrap().get(key).and_then(|s| s.ttl)
    }

    pub fn stream_keys(&self) -> Vec<String> {
        self.streams.lock().unwrap().keys().cloned().collect()
    }
}

#[async_trait]
impl StreamTransport for MemoryTransport {
    async fn append(&self, key: &str, fields: &[(String, String)]) -> Result<String, ScanError> {
        let mut streams = self.streams.lock().unwrap();
        let stream = streams.entry(key.to_string()).or_default();
        stream.next_seq += 1;
        let id = format!("{}-0", stream.next_seq);
        stream.entries.push(StoredEntry {
            id: id.clone(),
            fields: fields.to_vec(),
        });
        Ok(id)
    }

    async fn create_group(&self, key: &str, group: &str) -> Result<(), ScanError> {
        let mut streams = self.streams.lock().unwrap();
        let stream = streams.entry(key.to_string()).or_default();
        // Pre-existing groups keep their cursor.
        stream.groups.entry(group.to_string()).or_default();
        Ok(())
    }

    async fn read_group(
        &self,
        key: &str,
        group: &str,
        consumer: &str,
        max: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, ScanError> {
        let deadline = Instant::now() + block;
        loop {
            {
                let mut streams = self.streams.lock().unwrap();
                let stream = streams.get_mut(key).ok_or_else(|| {
                    ScanError::Stream(format!("no such stream '{key}'"))
                })?;
                let total = stream.entries.len();
                let group_state = stream.groups.get_mut(group).ok_or_else(|| {
                    ScanError::Stream(format!("no such group '{group}' on '{key}'"))
                })?;

                if group_state.cursor < total {
                    let end = (group_state.cursor + max).min(total);
                    let indexes: Vec<usize> = (group_state.cursor..end).collect();
                    group_state.cursor = end;
                    let now = Instant::now();
                    for &i in &indexes {
                        let id = stream.entries[i].id.clone();
                        group_state.pending.insert(
                            id,
                            PendingEntry {
                                consumer: consumer.to_string(),
                                delivered_at: now,
                                index: i,
                            },
                        );
                    }
                    return Ok(indexes
                        .into_iter()
                        .map(|i| StreamEntry {
                            id: stream.entries[i].id.clone(),
                            fields: stream.entries[i].fields.clone(),
                        })
                        .collect());
                }
            }

            if Instant::now() >= deadline {
                return Ok(Vec::new());
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn ack(&self, key: &str, group: &str, id: &str) -> Result<(), ScanError> {
        let mut streams = self.streams.lock().unwrap();
        if let Some(group_state) = streams.get_mut(key).and_then(|s| s.groups.get_mut(group)) {
            group_state.pending.remove(id);
        }
        Ok(())
    }

    async fn auto_claim(
        &self,
        key: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        max: usize,
    ) -> Result<Vec<StreamEntry>, ScanError> {
        let mut streams = self.streams.lock().unwrap();
        let Some(stream) = streams.get_mut(key) else {
            return Ok(Vec::new());
        };
        let entries = &stream.entries;
        let Some(group_state) = stream.groups.get_mut(group) else {
            return Ok(Vec::new());
        };

        let now = Instant::now();
        let mut idle: Vec<(usize, String)> = group_state
            .pending
            .iter()
            .filter(|(_, p)| now.duration_since(p.delivered_at) >= min_idle)
            .map(|(id, p)| (p.index, id.clone()))
            .collect();
        idle.sort();
        idle.truncate(max);

        let mut claimed = Vec::with_capacity(idle.len());
        for (index, id) in idle {
            if let Some(p) = group_state.pending.get_mut(&id) {
                p.consumer = consumer.to_string();
                p.delivered_at = now;
            }
            claimed.push(StreamEntry {
                id,
                fields: entries[index].fields.clone(),
            });
        }
        Ok(claimed)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), ScanError> {
        if let Some(stream) = self.streams.lock().unwrap().get_mut(key) {
            stream.ttl = Some(ttl);
        }
        Ok(())
    }

    async fn set_key(&self, key: &str, value: &str, ttl: Duration) -> Result<(), ScanError> {
        self.kv
            .lock()
            .unwrap()
            .insert(key.to_string(), (value.to_string(), ttl));
        Ok(())
    }

    async fn get_key(&self, key: &str) -> Result<Option<String>, ScanError> {
        Ok(self.kv.lock().unwrap().get(key).map(|(v, _)| v.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(n: u32) -> Vec<(String, String)> {
        vec![("n".to_string(), n.to_string())]
    }

    #[tokio::test]
    async fn fifo_order_within_a_key() {
        let t = MemoryTransport::new();
        t.create_group("s", "g").await.unwrap();
        for n in 0..5 {
            t.append("s", &fields(n)).await.unwrap();
        }
        let read = t
            .read_group("s", "g", "c1", 10, Duration::ZERO)
            .await
            .unwrap();
        let ns: Vec<&str> = read.iter().map(|e| e.field("n").unwrap()).collect();
        assert_eq!(ns, ["0", "1", "2", "3", "4"]);
    }

    #[tokio::test]
    async fn entries_delivered_to_one_consumer_at_a_time() {
        let t = MemoryTransport::new();
        t.create_group("s", "g").await.unwrap();
        for n in 0..4 {
            t.append("s", &fields(n)).await.unwrap();
        }
        let a = t
            .read_group("s", "g", "c1", 2, Duration::ZERO)
            .await
            .unwrap();
        let b = t
            .read_group("s", "g", "c2", 10, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(a.len(), 2);
        assert_eq!(b.len(), 2);
        let ids_a: Vec<&str> = a.iter().map(|e| e.id.as_str()).collect();
        assert!(b.iter().all(|e| !ids_a.contains(&e.id.as_str())));
    }

    #[tokio::test]
    async fn independent_groups_see_all_entries() {
        let t = MemoryTransport::new();
        t.create_group("s", "g1").await.unwrap();
        t.create_group("s", "g2").await.unwrap();
        t.append("s", &fields(1)).await.unwrap();
        let a = t
            .read_group("s", "g1", "c", 10, Duration::ZERO)
            .await
            .unwrap();
        let b = t
            .read_group("s", "g2", "c", 10, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 1);
    }

    #[tokio::test]
    async fn ack_removes_from_pending() {
        let t = MemoryTransport::new();
        t.create_group("s", "g").await.unwrap();
        t.append("s", &fields(1)).await.unwrap();
        let read = t
            .read_group("s", "g", "c", 10, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(t.pending_count("s", "g"), 1);
        t.ack("s", "g", &read[0].id).await.unwrap();
        assert_eq!(t.pending_count("s", "g"), 0);
    }

    #[tokio::test]
    async fn unacked_entries_are_reclaimable() {
        let t = MemoryTransport::new();
        t.create_group("s", "g").await.unwrap();
        t.append("s", &fields(7)).await.unwrap();
        let read = t
            .read_group("s", "g", "dead", 10, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(read.len(), 1);

        // Not acked: a second consumer claims it after the idle window.
        let claimed = t
            .auto_claim("s", "g", "alive", Duration::ZERO, 10)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, read[0].id);
        assert_eq!(claimed[0].field("n"), Some("7"));
    }

    #[tokio::test]
    async fn auto_claim_respects_min_idle() {
        let t = MemoryTransport::new();
        t.create_group("s", "g").await.unwrap();
        t.append("s", &fields(1)).await.unwrap();
        t.read_group("s", "g", "c", 10, Duration::ZERO)
            .await
            .unwrap();
        let claimed = t
            .auto_claim("s", "g", "c2", Duration::from_secs(3600), 10)
            .await
            .unwrap();
        assert!(claimed.is_empty());
    }

    #[tokio::test]
    async fn create_group_is_idempotent_and_keeps_cursor() {
        let t = MemoryTransport::new();
        t.create_group("s", "g").await.unwrap();
        t.append("s", &fields(1)).await.unwrap();
        t.read_group("s", "g", "c", 10, Duration::ZERO)
            .await
            .unwrap();
        // Re-creating must not rewind delivery.
        t.create_group("s", "g").await.unwrap();
        let again = t
            .read_group("s", "g", "c", 10, Duration::ZERO)
            .await
            .unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn blocking_read_waits_for_appends() {
        let t = std::sync::Arc::new(MemoryTransport::new());
        t.create_group("s", "g").await.unwrap();
        let reader = {
            let t = t.clone();
            tokio::spawn(async move {
                t.read_group("s", "g", "c", 10, Duration::from_secs(2))
                    .await
                    .unwrap()
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        t.append("s", &fields(9)).await.unwrap();
        let read = reader.await.unwrap();
        assert_eq!(read.len(), 1);
    }

    #[tokio::test]
    async fn expire_records_ttl() {
        let t = MemoryTransport::new();
        t.append("s", &fields(1)).await.unwrap();
        t.expire("s", Duration::from_secs(86_400)).await.unwrap();
        assert_eq!(t.ttl_of("s"), Some(Duration::from_secs(86_400)));
    }
}
