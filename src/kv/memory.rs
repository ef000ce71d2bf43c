//! In-memory KV backend: a `DashMap` guarded view with a background cleaner.
//!
//! Grounded on the existing response cache's TTL-and-sweep shape (expiry
//! tracked per entry, a periodic task evicts), generalized to the full KV
//! capability set and given a deterministic, acknowledged shutdown.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::KvStore;
use crate::{Error, Result};

struct Entry {
    value: Bytes,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|t| Instant::now() >= t)
    }
}

/// In-process KV backend. State does not survive a restart.
pub struct MemoryKv {
    map: DashMap<String, Entry>,
    closed: AtomicBool,
    stop_tx: watch::Sender<bool>,
    cleaner: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl MemoryKv {
    /// Construct and start the background cleaner, which wakes every
    /// `cleanup_interval` to scan and evict expired entries.
    pub fn new(cleanup_interval: Duration) -> Arc<Self> {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let store = Arc::new(Self {
            map: DashMap::new(),
            closed: AtomicBool::new(false),
            stop_tx,
            cleaner: parking_lot::Mutex::new(None),
        });

        let weak = Arc::downgrade(&store);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cleanup_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(store) = weak.upgrade() else { break };
                        store.map.retain(|_, e| !e.is_expired());
                    }
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });
        *store.cleaner.lock() = Some(handle);
        store
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
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Bytes> {
        self.check_open()?;
        match self.map.get(key) {
            Some(entry) if !entry.is_expired() => Ok(entry.value.clone()),
            Some(_) => {
                drop(self.map.remove(key));
                Err(Error::KvNotFound)
            }
            None => Err(Error::KvNotFound),
        }
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<()> {
        self.check_open()?;
        let expires_at = ttl.map(|d| Instant::now() + d);
        self.map.insert(key.to_string(), Entry { value, expires_at });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.check_open()?;
        self.map.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.check_open()?;
        Ok(self.map.get(key).is_some_and(|e| !e.is_expired()))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        self.check_open()?;
        Ok(self
            .map
            .iter()
            .filter(|e| !e.is_expired() && e.key().starts_with(prefix))
            .map(|e| e.key().clone())
            .collect())
    }

    async fn count(&self, prefix: &str) -> Result<usize> {
        self.check_open()?;
        Ok(self
            .map
            .iter()
            .filter(|e| !e.is_expired() && e.key().starts_with(prefix))
            .count())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(Error::KvClosed);
        }
        let _ = self.stop_tx.send(true);
        let handle = self.cleaner.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_then_get_within_ttl_returns_value() {
        let kv = MemoryKv::new(Duration::from_secs(60));
        kv.set("k", Bytes::from_static(b"v"), Some(Duration::from_secs(10)))
            .await
            .unwrap();
        assert_eq!(kv.get("k").await.unwrap(), Bytes::from_static(b"v"));
    }

    #[tokio::test]
    async fn get_after_ttl_elapses_is_not_found() {
        tokio::time::pause();
        let kv = MemoryKv::new(Duration::from_secs(60));
        kv.set("k", Bytes::from_static(b"v"), Some(Duration::from_millis(10)))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_millis(20)).await;
        assert!(matches!(kv.get("k").await, Err(Error::KvNotFound)));
    }

    #[tokio::test]
    async fn no_ttl_never_expires() {
        tokio::time::pause();
        let kv = MemoryKv::new(Duration::from_secs(60));
        kv.set("k", Bytes::from_static(b"v"), None).await.unwrap();
        tokio::time::advance(Duration::from_secs(3600)).await;
        assert_eq!(kv.get("k").await.unwrap(), Bytes::from_static(b"v"));
    }

    #[tokio::test]
    async fn delete_of_absent_key_is_not_an_error() {
        let kv = MemoryKv::new(Duration::from_secs(60));
        kv.delete("missing").await.unwrap();
    }

    #[tokio::test]
    async fn exists_honors_ttl() {
        tokio::time::pause();
        let kv = MemoryKv::new(Duration::from_secs(60));
        kv.set("k", Bytes::from_static(b"v"), Some(Duration::from_millis(5)))
            .await
            .unwrap();
        assert!(kv.exists("k").await.unwrap());
        tokio::time::advance(Duration::from_millis(50)).await;
        assert!(!kv.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn list_and_count_exclude_expired_and_non_matching() {
        tokio::time::pause();
        let kv = MemoryKv::new(Duration::from_secs(60));
        kv.set("a:1", Bytes::from_static(b"1"), None).await.unwrap();
        kv.set("a:2", Bytes::from_static(b"2"), Some(Duration::from_millis(5)))
            .await
            .unwrap();
        kv.set("b:1", Bytes::from_static(b"3"), None).await.unwrap();
        tokio::time::advance(Duration::from_millis(50)).await;
        let keys = kv.list("a:").await.unwrap();
        assert_eq!(keys, vec!["a:1".to_string()]);
        assert_eq!(kv.count("a:").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn after_close_every_operation_is_closed() {
        let kv = MemoryKv::new(Duration::from_secs(60));
        kv.set("k", Bytes::from_static(b"v"), None).await.unwrap();
        kv.close().await.unwrap();
        assert!(matches!(kv.get("k").await, Err(Error::KvClosed)));
        assert!(matches!(
            kv.set("k", Bytes::from_static(b"v"), None).await,
            Err(Error::KvClosed)
        ));
        assert!(matches!(kv.close().await, Err(Error::KvClosed)));
    }
}
