//! Networked KV backend, built on Redis.
//!
//! TTL is delegated to the server (`SET ... PX`/`PEXPIRE`); `list`/`count`
//! use a cursor-based `SCAN` rather than a blocking `KEYS` enumerate.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;

use super::KvStore;
use crate::{Error, Result};

/// Networked, server-TTL KV backend.
pub struct RedisKv {
    conn: ConnectionManager,
    closed: AtomicBool,
}

impl RedisKv {
    /// Connect and verify reachability with a `PING`. The constructor fails
    /// if the server cannot be reached.
    pub async fn connect(url: &str) -> Result<Arc<dyn KvStore>> {
        let client = redis::Client::open(url).map_err(|e| Error::KvBackend(e.to_string()))?;
        let mut conn = client
            .get_connection_manager()
            .await
            .map_err(|e| Error::KvBackend(e.to_string()))?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| Error::KvBackend(e.to_string()))?;
        Ok(Arc::new(Self {
            conn,
            closed: AtomicBool::new(false),
        }))
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(Error::KvClosed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl KvStore for RedisKv {
    async fn get(&self, key: &str) -> Result<Bytes> {
        self.check_open()?;
        let mut conn = self.conn.clone();
        let value: Option<Vec<u8>> = conn
            .get(key)
            .await
            .map_err(|e| Error::KvBackend(e.to_string()))?;
        value.map(Bytes::from).ok_or(Error::KvNotFound)
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<()> {
        self.check_open()?;
        let mut conn = self.conn.clone();
        match ttl {
            #[allow(clippy::cast_possible_truncation)]
            Some(d) => {
                let ms = d.as_millis().max(1) as u64;
                let _: () = conn
                    .set_ex(key, value.to_vec(), ms.div_ceil(1000).max(1))
                    .await
                    .map_err(|e| Error::KvBackend(e.to_string()))?;
            }
            None => {
                let _: () = conn
                    .set(key, value.to_vec())
                    .await
                    .map_err(|e| Error::KvBackend(e.to_string()))?;
            }
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.check_open()?;
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .del(key)
            .await
            .map_err(|e| Error::KvBackend(e.to_string()))?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.check_open()?;
        let mut conn = self.conn.clone();
        let exists: bool = conn
            .exists(key)
            .await
            .map_err(|e| Error::KvBackend(e.to_string()))?;
        Ok(exists)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        self.check_open()?;
        let mut conn = self.conn.clone();
        let pattern = format!("{prefix}*");
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(200)
                .query_async(&mut conn)
                .await
                .map_err(|e| Error::KvBackend(e.to_string()))?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(keys)
    }

    async fn count(&self, prefix: &str) -> Result<usize> {
        Ok(self.list(prefix).await?.len())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(Error::KvClosed);
        }
        Ok(())
    }
}
