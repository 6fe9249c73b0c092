//! Redis Streams backend.
//!
//! Commands are issued explicitly (`XADD`, `XGROUP`, `XREADGROUP`, `XACK`,
//! `XAUTOCLAIM`, `EXPIRE`) over a `ConnectionManager`, which reconnects
//! under the hood.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::RedisError;
use std::time::Duration;
use tracing::debug;

use vantage_core::ScanError;

use crate::transport::{StreamEntry, StreamTransport};

type RawEntries = Vec<(String, Vec<(String, String)>)>;

pub struct RedisTransport {
    conn: ConnectionManager,
}

impl RedisTransport {
    /// Connect using the worker env contract's host/port pair.
    pub async fn connect(host: &str, port: u16) -> Result<Self, ScanError> {
        Self::connect_url(&format!("redis://{host}:{port}")).await
    }

    pub async fn connect_url(url: &str) -> Result<Self, ScanError> {
        let client = redis::Client::open(url).map_err(|e| ScanError::Stream(e.to_string()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(classify_err)?;
        Ok(Self { conn })
    }
}

fn classify_err(e: RedisError) -> ScanError {
    if e.is_io_error() || e.is_timeout() || e.is_connection_refusal() || e.is_connection_dropped() {
        ScanError::TransientNetwork(e.to_string())
    } else {
        ScanError::Stream(e.to_string())
    }
}

fn to_entries(raw: RawEntries) -> Vec<StreamEntry> {
    raw.into_iter()
        .map(|(id, fields)| StreamEntry { id, fields })
        .collect()
}

#[async_trait]
impl StreamTransport for RedisTransport {
    async fn append(&self, key: &str, fields: &[(String, String)]) -> Result<String, ScanError> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("XADD");
        cmd.arg(key).arg("*");
        for (f, v) in fields {
            cmd.arg(f).arg(v);
        }
        let id: String = cmd.query_async(&mut conn).await.map_err(classify_err)?;
        Ok(id)
    }

    async fn create_group(&self, key: &str, group: &str) -> Result<(), ScanError> {
        let mut conn = self.conn.clone();
        let res: Result<(), RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(key)
            .arg(group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;
        match res {
            Ok(()) => Ok(()),
            // The group already exists; its cursor is not ours to change.
            Err(e) if e.code() == Some("BUSYGROUP") => {
                debug!(key, group, "consumer group already exists");
                Ok(())
            }
            Err(e) => Err(classify_err(e)),
        }
    }

    async fn read_group(
        &self,
        key: &str,
        group: &str,
        consumer: &str,
        max: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, ScanError> {
        let mut conn = self.conn.clone();
        let reply: Option<Vec<(String, RawEntries)>> = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(group)
            .arg(consumer)
            .arg("COUNT")
            .arg(max)
            .arg("BLOCK")
            .arg(block.as_millis() as u64)
            .arg("STREAMS")
            .arg(key)
            .arg(">")
            .query_async(&mut conn)
            .await
            .map_err(classify_err)?;

        Ok(reply
            .map(|streams| {
                streams
                    .into_iter()
                    .flat_map(|(_, entries)| to_entries(entries))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn ack(&self, key: &str, group: &str, id: &str) -> Result<(), ScanError> {
        let mut conn = self.conn.clone();
        let _acked: i64 = redis::cmd("XACK")
            .arg(key)
            .arg(group)
            .arg(id)
            .query_async(&mut conn)
            .await
            .map_err(classify_err)?;
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
        let mut conn = self.conn.clone();
        let reply: redis::Value = redis::cmd("XAUTOCLAIM")
            .arg(key)
            .arg(group)
            .arg(consumer)
            .arg(min_idle.as_millis() as u64)
            .arg("0-0")
            .arg("COUNT")
            .arg(max)
            .query_async(&mut conn)
            .await
            .map_err(classify_err)?;

        // Reply shape: [next-cursor, entries, ...]; older servers omit the
        // trailing deleted-id list.
        if let redis::Value::Array(items) = reply {
            if let Some(entries_val) = items.get(1) {
                let raw: RawEntries =
                    redis::from_redis_value(entries_val).map_err(classify_err)?;
                return Ok(to_entries(raw));
            }
        }
        Ok(Vec::new())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), ScanError> {
        let mut conn = self.conn.clone();
        let _set: i64 = redis::cmd("EXPIRE")
            .arg(key)
            .arg(ttl.as_secs())
            .query_async(&mut conn)
            .await
            .map_err(classify_err)?;
        Ok(())
    }

    async fn set_key(&self, key: &str, value: &str, ttl: Duration) -> Result<(), ScanError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl.as_secs())
            .query_async(&mut conn)
            .await
            .map_err(classify_err)?;
        Ok(())
    }

    async fn get_key(&self, key: &str) -> Result<Option<String>, ScanError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(classify_err)?;
        Ok(value)
    }
}
