//! Key-value store abstraction.
//!
//! A uniform `get`/`set`/`delete`/`exists`/`list`/`count`/`close` surface over
//! three interchangeable backends ([`memory`], [`sled_store`], [`redis_store`]),
//! plus a [`Namespace`] decorator that gives every consumer (sessions, email
//! tokens, OAuth2 state, rate-limit buckets) an isolated logical keyspace over
//! one shared physical store.

pub mod memory;
pub mod redis_store;
pub mod sled_store;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::{Error, Result};

/// Backend selection, as configured under `kvs.type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// In-process map. Default. State is lost on restart.
    Memory,
    /// Embedded on-disk log-structured store (sled).
    Disk,
    /// Networked cache (Redis).
    Redis,
}

impl Default for Backend {
    fn default() -> Self {
        Self::Memory
    }
}

/// Uniform key-value store capability set. All operations are safe under
/// concurrent callers; `Get`/`Exists` never observe an expired entry.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Fetch a value. Returns `Err(Error::KvNotFound)` on miss or expiry,
    /// `Err(Error::KvClosed)` after `close()`.
    async fn get(&self, key: &str) -> Result<Bytes>;

    /// Store a value. `ttl = None` means no expiry. Callers normalize
    /// negative durations to zero before calling (see `config` parsing).
    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<()>;

    /// Remove a key. Absent key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Whether a non-expired entry exists for `key`.
    async fn exists(&self, key: &str) -> Result<bool>;

    /// List keys with the given prefix. Unordered; never includes expired keys.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Count keys with the given prefix.
    async fn count(&self, prefix: &str) -> Result<usize>;

    /// Idempotent from the caller's perspective: a second call may itself
    /// return `Err(Error::KvClosed)`, but subsequent `get`/`set`/etc. on this
    /// store always do.
    async fn close(&self) -> Result<()>;
}

/// Prepends `prefix` on write/read and strips it from `list` results so the
/// wrapped view is transparent. Constructing with an empty prefix hands back
/// the inner store unchanged — there is nothing to wrap.
pub struct Namespace {
    inner: Arc<dyn KvStore>,
    prefix: String,
}

impl Namespace {
    /// Wrap `inner` under `prefix`. An empty prefix is a no-op.
    pub fn wrap(inner: Arc<dyn KvStore>, prefix: impl Into<String>) -> Arc<dyn KvStore> {
        let prefix = prefix.into();
        if prefix.is_empty() {
            return inner;
        }
        Arc::new(Self { inner, prefix })
    }

    fn namespaced(&self, key: &str) -> String {
        format!("{}{key}", self.prefix)
    }
}

#[async_trait]
impl KvStore for Namespace {
    async fn get(&self, key: &str) -> Result<Bytes> {
        self.inner.get(&self.namespaced(key)).await
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<()> {
        self.inner.set(&self.namespaced(key), value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.inner.delete(&self.namespaced(key)).await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.inner.exists(&self.namespaced(key)).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let full_prefix = self.namespaced(prefix);
        let keys = self.inner.list(&full_prefix).await?;
        Ok(keys
            .into_iter()
            .filter_map(|k| k.strip_prefix(&self.prefix).map(str::to_string))
            .collect())
    }

    async fn count(&self, prefix: &str) -> Result<usize> {
        self.inner.count(&self.namespaced(prefix)).await
    }

    async fn close(&self) -> Result<()> {
        // Wrappers sharing one backend must be lifecycle-coordinated by the
        // caller — closing a wrapper closes the inner store.
        self.inner.close().await
    }
}

/// Construct a KV store for the given backend, returning a handle that
/// callers share across every [`Namespace`] view they need.
pub async fn open(
    backend: Backend,
    disk_path: Option<&std::path::Path>,
    redis_url: Option<&str>,
) -> Result<Arc<dyn KvStore>> {
    match backend {
        Backend::Memory => Ok(memory::MemoryKv::new(Duration::from_secs(60))),
        Backend::Disk => {
            let path = disk_path
                .map(std::path::Path::to_path_buf)
                .unwrap_or_else(default_disk_path);
            sled_store::SledKv::open(&path, Duration::from_secs(60)).await
        }
        Backend::Redis => {
            let url = redis_url.ok_or_else(|| {
                Error::ConfigInvalid("kvs.redis_url is required for kvs.type = redis".into())
            })?;
            redis_store::RedisKv::connect(url).await
        }
    }
}

fn default_disk_path() -> std::path::PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("chatbotgate")
        .join("kv")
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Probe {
        seen: parking_lot::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl KvStore for Probe {
        async fn get(&self, key: &str) -> Result<Bytes> {
            self.seen.lock().push(format!("get:{key}"));
            Err(Error::KvNotFound)
        }
        async fn set(&self, key: &str, _value: Bytes, _ttl: Option<Duration>) -> Result<()> {
            self.seen.lock().push(format!("set:{key}"));
            Ok(())
        }
        async fn delete(&self, key: &str) -> Result<()> {
            self.seen.lock().push(format!("delete:{key}"));
            Ok(())
        }
        async fn exists(&self, key: &str) -> Result<bool> {
            self.seen.lock().push(format!("exists:{key}"));
            Ok(false)
        }
        async fn list(&self, prefix: &str) -> Result<Vec<String>> {
            self.seen.lock().push(format!("list:{prefix}"));
            Ok(vec![format!("{prefix}one"), format!("{prefix}two")])
        }
        async fn count(&self, prefix: &str) -> Result<usize> {
            self.seen.lock().push(format!("count:{prefix}"));
            Ok(2)
        }
        async fn close(&self) -> Result<()> {
            self.seen.lock().push("close".to_string());
            Ok(())
        }
    }

    fn probe() -> Arc<Probe> {
        Arc::new(Probe {
            seen: parking_lot::Mutex::new(Vec::new()),
        })
    }

    #[tokio::test]
    async fn empty_prefix_is_a_noop() {
        let inner = probe();
        let ns = Namespace::wrap(inner.clone(), "");
        ns.set("k", Bytes::from_static(b"v"), None).await.unwrap();
        assert_eq!(inner.seen.lock()[0], "set:k");
    }

    #[tokio::test]
    async fn prefix_is_prepended_on_write_and_read() {
        let inner = probe();
        let ns = Namespace::wrap(inner.clone(), "A:");
        ns.set("k", Bytes::from_static(b"v"), None).await.unwrap();
        assert_eq!(inner.seen.lock().last().unwrap(), "set:A:k");
        let _ = ns.get("k").await;
        assert_eq!(inner.seen.lock().last().unwrap(), "get:A:k");
    }

    #[tokio::test]
    async fn list_strips_prefix_from_results() {
        let inner = probe();
        let ns = Namespace::wrap(inner, "A:");
        let keys = ns.list("").await.unwrap();
        assert_eq!(keys, vec!["one".to_string(), "two".to_string()]);
    }

    #[tokio::test]
    async fn close_closes_inner() {
        let inner = probe();
        let ns = Namespace::wrap(inner.clone(), "A:");
        ns.close().await.unwrap();
        assert_eq!(inner.seen.lock().last().unwrap(), "close");
    }
}
