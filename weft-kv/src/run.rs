use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::{Map, Value};
use tokio::sync::Mutex;

use crate::path::{delete_in, descend, set_in};
use crate::store::{KvError, KvStore};

/// Reserved key prefix for run-scope records in the host KV.
pub const RUN_KEY_PREFIX: &str = "__run__:";

struct RunRecord {
    id: String,
    key: String,
    data: Mutex<Value>,
    pending: AtomicI64,
}

/// Registry of live run scopes.
///
/// A run scope is created at an invocation boundary (route, cron tick,
/// reactive emission) and carried through every event emitted on its
/// behalf. The pending counter starts at 1 for the creator; the bus
/// retains once per delivery and releases when the handler settles. When
/// the counter reaches zero the backing `__run__:<id>` record is deleted
/// and the scope becomes unresolvable.
#[derive(Clone)]
pub struct RunRegistry {
    runs: Arc<DashMap<String, Arc<RunRecord>>>,
    kv: Arc<dyn KvStore>,
}

impl RunRegistry {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            runs: Arc::new(DashMap::new()),
            kv,
        }
    }

    /// Create a new run scope with pending=1 and an empty persisted record.
    pub async fn create(&self) -> Result<RunHandle, KvError> {
        let id = uuid::Uuid::new_v4().to_string();
        let key = format!("{RUN_KEY_PREFIX}{id}");
        self.kv.put(&key, Value::Object(Map::new())).await?;
        let record = Arc::new(RunRecord {
            id: id.clone(),
            key,
            data: Mutex::new(Value::Object(Map::new())),
            pending: AtomicI64::new(1),
        });
        self.runs.insert(id, Arc::clone(&record));
        Ok(RunHandle {
            registry: self.clone(),
            record,
        })
    }

    /// Resolve a live scope by id. `None` once the scope has been fully
    /// released.
    pub fn resolve(&self, id: &str) -> Option<RunHandle> {
        self.runs.get(id).map(|r| RunHandle {
            registry: self.clone(),
            record: Arc::clone(r.value()),
        })
    }

    /// Increment the pending counter. No-op (returning `false`) if the
    /// scope is already gone.
    pub fn retain(&self, id: &str) -> bool {
        match self.runs.get(id) {
            Some(r) => {
                r.pending.fetch_add(1, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    /// Decrement the pending counter; at zero, delete the backing record
    /// and drop the scope.
    pub async fn release(&self, id: &str) -> Result<(), KvError> {
        let record = match self.runs.get(id) {
            Some(r) => Arc::clone(r.value()),
            None => return Ok(()),
        };
        if record.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.runs.remove(id);
            self.kv.delete(&record.key).await?;
        }
        Ok(())
    }

    /// Synchronous release used from `Drop`. The KV deletion is spawned
    /// onto the runtime when one is available; outside a runtime the
    /// in-memory scope is dropped and the record is left for the host to
    /// sweep.
    fn release_background(&self, id: &str) {
        let record = match self.runs.get(id) {
            Some(r) => Arc::clone(r.value()),
            None => return,
        };
        if record.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.runs.remove(id);
            let kv = Arc::clone(&self.kv);
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        if let Err(e) = kv.delete(&record.key).await {
                            tracing::warn!(run = %record.id, error = %e, "run record cleanup failed");
                        }
                    });
                }
                Err(_) => {
                    tracing::debug!(run = %record.id, "run record dropped outside runtime, kv entry left behind");
                }
            }
        }
    }

    /// Retain and wrap the scope in an RAII token. `None` if the scope is
    /// gone.
    pub fn token(&self, id: &str) -> Option<RunToken> {
        if self.retain(id) {
            Some(RunToken {
                registry: self.clone(),
                id: id.to_string(),
                released: AtomicBool::new(false),
            })
        } else {
            None
        }
    }

    /// Current pending count of a scope, for diagnostics and tests.
    pub fn pending(&self, id: &str) -> Option<i64> {
        self.runs.get(id).map(|r| r.pending.load(Ordering::SeqCst))
    }

    /// Number of live scopes.
    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }
}

/// Handle to a live run scope: dotted-path data access that persists the
/// record after every mutation, plus retain/release.
#[derive(Clone)]
pub struct RunHandle {
    registry: RunRegistry,
    record: Arc<RunRecord>,
}

impl RunHandle {
    pub fn id(&self) -> &str {
        &self.record.id
    }

    /// The key the scope's record is persisted under.
    pub fn key(&self) -> &str {
        &self.record.key
    }

    pub async fn get(&self, path: &str) -> Option<Value> {
        let data = self.record.data.lock().await;
        let segments: Vec<&str> = path.split('.').collect();
        descend(&data, &segments).cloned()
    }

    pub async fn has(&self, path: &str) -> bool {
        self.get(path).await.is_some()
    }

    pub async fn set(&self, path: &str, value: Value) -> Result<(), KvError> {
        let mut data = self.record.data.lock().await;
        let segments: Vec<&str> = path.split('.').collect();
        set_in(&mut data, &segments, value);
        self.persist(&data).await
    }

    pub async fn delete(&self, path: &str) -> Result<(), KvError> {
        let mut data = self.record.data.lock().await;
        let segments: Vec<&str> = path.split('.').collect();
        delete_in(&mut data, &segments);
        self.persist(&data).await
    }

    pub async fn clear(&self) -> Result<(), KvError> {
        let mut data = self.record.data.lock().await;
        *data = Value::Object(Map::new());
        self.persist(&data).await
    }

    async fn persist(&self, data: &Value) -> Result<(), KvError> {
        self.registry.kv.put(&self.record.key, data.clone()).await
    }

    pub fn retain(&self) {
        self.registry.retain(&self.record.id);
    }

    pub async fn release(&self) -> Result<(), KvError> {
        self.registry.release(&self.record.id).await
    }

    /// Retain and wrap in an RAII token for attachment to an envelope.
    pub fn token(&self) -> RunToken {
        self.registry
            .token(&self.record.id)
            .expect("live handle implies live scope")
    }
}

/// RAII retention of a run scope.
///
/// Cloning retains again; dropping without an explicit [`release`]
/// releases in the background, so an envelope filtered out mid-pipeline
/// still balances its retain.
///
/// [`release`]: RunToken::release
pub struct RunToken {
    registry: RunRegistry,
    id: String,
    released: AtomicBool,
}

impl RunToken {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Resolve the scope this token pins. `None` only if the token
    /// outlived a registry bug; a held token keeps pending > 0.
    pub fn handle(&self) -> Option<RunHandle> {
        self.registry.resolve(&self.id)
    }

    /// Release exactly once, awaiting the KV cleanup when this was the
    /// last reference.
    pub async fn release(&self) -> Result<(), KvError> {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.registry.release(&self.id).await?;
        }
        Ok(())
    }
}

impl Clone for RunToken {
    fn clone(&self) -> Self {
        self.registry.retain(&self.id);
        Self {
            registry: self.registry.clone(),
            id: self.id.clone(),
            released: AtomicBool::new(false),
        }
    }
}

impl Drop for RunToken {
    fn drop(&mut self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.registry.release_background(&self.id);
        }
    }
}

impl std::fmt::Debug for RunToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunToken").field("id", &self.id).finish()
    }
}
