use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

/// Error type for key-value operations.
#[derive(Debug, Clone)]
pub enum KvError {
    /// The backing store failed (I/O, connection, serialization inside
    /// the adapter). Carries the adapter's message.
    Backend(String),
    /// A path operation found a non-object where it needed to descend.
    NotAnObject { key: String },
}

impl std::fmt::Display for KvError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KvError::Backend(msg) => write!(f, "kv backend error: {msg}"),
            KvError::NotAnObject { key } => {
                write!(f, "kv record '{key}' is not an object, cannot descend")
            }
        }
    }
}

impl std::error::Error for KvError {}

/// Host-supplied key-value store.
///
/// Records are JSON values keyed by flat strings; the core never assumes
/// anything about durability or visibility beyond read-your-writes on a
/// single key. Adapters are expected to serialize their own operations.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>, KvError>;

    async fn put(&self, key: &str, value: Value) -> Result<(), KvError>;

    async fn delete(&self, key: &str) -> Result<(), KvError>;

    /// Keys currently present with the given prefix. Used by run-scope
    /// bookkeeping and by hosts for diagnostics; adapters backed by
    /// stores without enumeration may return `KvError::Backend`.
    async fn keys(&self, prefix: &str) -> Result<Vec<String>, KvError>;

    async fn has(&self, key: &str) -> Result<bool, KvError> {
        Ok(self.get(key).await?.is_some())
    }
}

/// In-process [`KvStore`] adapter on a concurrent map.
///
/// The default store for tests and for hosts that don't need durability.
#[derive(Clone, Default)]
pub struct MemoryKv {
    records: Arc<DashMap<String, Value>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records currently stored.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<Value>, KvError> {
        Ok(self.records.get(key).map(|r| r.value().clone()))
    }

    async fn put(&self, key: &str, value: Value) -> Result<(), KvError> {
        self.records.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        self.records.remove(key);
        Ok(())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, KvError> {
        Ok(self
            .records
            .iter()
            .filter(|r| r.key().starts_with(prefix))
            .map(|r| r.key().clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn put_get_delete() {
        let kv = MemoryKv::new();
        kv.put("user", json!({"name": "ada"})).await.unwrap();
        assert_eq!(kv.get("user").await.unwrap(), Some(json!({"name": "ada"})));
        assert!(kv.has("user").await.unwrap());
        kv.delete("user").await.unwrap();
        assert_eq!(kv.get("user").await.unwrap(), None);
        assert!(!kv.has("user").await.unwrap());
    }

    #[tokio::test]
    async fn delete_missing_key_is_noop() {
        let kv = MemoryKv::new();
        kv.delete("ghost").await.unwrap();
    }

    #[tokio::test]
    async fn keys_filters_by_prefix() {
        let kv = MemoryKv::new();
        kv.put("__run__:a", json!({})).await.unwrap();
        kv.put("__run__:b", json!({})).await.unwrap();
        kv.put("other", json!({})).await.unwrap();
        let mut keys = kv.keys("__run__:").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["__run__:a", "__run__:b"]);
    }
}
