use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

/// One committed state transition. Both sides are snapshots serialized
/// at commit time.
#[derive(Debug, Clone)]
pub struct Change {
    pub next: Value,
    pub prev: Value,
}

/// Reactive state container with batched change notification.
///
/// Mutations go through [`StateCell::update`]; the first update of a
/// batch schedules a commit task, and every further update landing
/// before that task runs folds into the same notification. Subscribers
/// therefore see at most one [`Change`] per batch however many fields
/// changed.
///
/// Requires a tokio runtime (the commit task is spawned).
#[derive(Clone)]
pub struct StateCell<T> {
    inner: Arc<CellInner<T>>,
}

struct CellInner<T> {
    state: Mutex<CellState<T>>,
    tx: broadcast::Sender<Change>,
}

struct CellState<T> {
    current: T,
    committed: Value,
    commit_scheduled: bool,
}

impl<T> StateCell<T>
where
    T: Clone + Serialize + Send + 'static,
{
    pub fn new(initial: T) -> Self {
        let committed = serde_json::to_value(&initial).unwrap_or(Value::Null);
        let (tx, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(CellInner {
                state: Mutex::new(CellState {
                    current: initial,
                    committed,
                    commit_scheduled: false,
                }),
                tx,
            }),
        }
    }

    /// Apply a mutation and schedule the batch commit.
    pub fn update(&self, mutate: impl FnOnce(&mut T)) {
        let mut state = self.inner.state.lock().unwrap();
        mutate(&mut state.current);
        if !state.commit_scheduled {
            state.commit_scheduled = true;
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move {
                // One yield lets every synchronous sibling update join
                // this batch before the snapshot is taken.
                tokio::task::yield_now().await;
                let change = {
                    let mut state = inner.state.lock().unwrap();
                    state.commit_scheduled = false;
                    let next = serde_json::to_value(&state.current).unwrap_or(Value::Null);
                    let prev = std::mem::replace(&mut state.committed, next.clone());
                    Change { next, prev }
                };
                let _ = inner.tx.send(change);
            });
        }
    }

    /// Clone of the current (possibly uncommitted) value.
    pub fn get(&self) -> T {
        self.inner.state.lock().unwrap().current.clone()
    }

    /// Snapshot of the last *committed* value, the seed for watchers.
    pub fn committed(&self) -> Value {
        self.inner.state.lock().unwrap().committed.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Change> {
        self.inner.tx.subscribe()
    }
}
