use std::sync::Arc;

use serde_json::{Map, Value};

use crate::store::{KvError, KvStore};

/// Dotted-path facade over a host [`KvStore`].
///
/// A path `a.b.c` addresses the nested descendant `b.c` of the record
/// stored under the root key `a`. A single-segment path addresses the
/// root record untouched. Writes create intermediate objects; deletes
/// prune the leaf but leave intermediates, and a root that becomes empty
/// is removed entirely.
///
/// `set` and `delete` read-modify-write the root record; concurrent
/// writers to the same root are not serialized here. Keep unrelated data
/// under distinct roots.
#[derive(Clone)]
pub struct KvPath {
    store: Arc<dyn KvStore>,
}

impl KvPath {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    pub async fn get(&self, path: &str) -> Result<Option<Value>, KvError> {
        let (root, segments) = split_path(path);
        let Some(record) = self.store.get(root).await? else {
            return Ok(None);
        };
        if segments.is_empty() {
            return Ok(Some(record));
        }
        if !record.is_object() {
            return Err(KvError::NotAnObject { key: root.to_string() });
        }
        Ok(descend(&record, &segments).cloned())
    }

    pub async fn has(&self, path: &str) -> Result<bool, KvError> {
        Ok(self.get(path).await?.is_some())
    }

    pub async fn set(&self, path: &str, value: Value) -> Result<(), KvError> {
        let (root, segments) = split_path(path);
        if segments.is_empty() {
            return self.store.put(root, value).await;
        }
        let mut record = match self.store.get(root).await? {
            Some(r) if r.is_object() => r,
            Some(_) => return Err(KvError::NotAnObject { key: root.to_string() }),
            None => Value::Object(Map::new()),
        };
        set_in(&mut record, &segments, value);
        self.store.put(root, record).await
    }

    pub async fn delete(&self, path: &str) -> Result<(), KvError> {
        let (root, segments) = split_path(path);
        if segments.is_empty() {
            return self.store.delete(root).await;
        }
        let Some(mut record) = self.store.get(root).await? else {
            return Ok(());
        };
        if !record.is_object() {
            return Err(KvError::NotAnObject { key: root.to_string() });
        }
        delete_in(&mut record, &segments);
        match &record {
            Value::Object(map) if map.is_empty() => self.store.delete(root).await,
            _ => self.store.put(root, record).await,
        }
    }
}

/// Split `a.b.c` into the root key and the descent segments.
pub(crate) fn split_path(path: &str) -> (&str, Vec<&str>) {
    let mut parts = path.split('.');
    let root = parts.next().unwrap_or(path);
    (root, parts.collect())
}

/// Walk `segments` down a JSON object tree.
pub(crate) fn descend<'a>(record: &'a Value, segments: &[&str]) -> Option<&'a Value> {
    let mut current = record;
    for seg in segments {
        current = current.as_object()?.get(*seg)?;
    }
    Some(current)
}

/// Write `value` at the segment path, creating intermediate objects.
/// Non-object intermediates are overwritten with objects.
pub(crate) fn set_in(record: &mut Value, segments: &[&str], value: Value) {
    let mut current = record;
    for seg in &segments[..segments.len() - 1] {
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        current = current
            .as_object_mut()
            .expect("just ensured object")
            .entry(seg.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    if !current.is_object() {
        *current = Value::Object(Map::new());
    }
    current
        .as_object_mut()
        .expect("just ensured object")
        .insert(segments[segments.len() - 1].to_string(), value);
}

/// Remove the leaf at the segment path. Intermediates are left in place.
pub(crate) fn delete_in(record: &mut Value, segments: &[&str]) {
    let mut current = record;
    for seg in &segments[..segments.len() - 1] {
        match current.as_object_mut().and_then(|m| m.get_mut(*seg)) {
            Some(next) => current = next,
            None => return,
        }
    }
    if let Some(map) = current.as_object_mut() {
        map.remove(segments[segments.len() - 1]);
    }
}
