use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use futures::stream;
use serde_json::json;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, PoisonError, RwLock};
use std::time::Duration;

use super::{ObjectStream, StorageProvider, check_key};
use crate::core::error::StorageError;
use crate::core::models::{ConnectionReport, ObjectInfo, ObjectStat};

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    content_type: String,
    modified: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Faults {
    fail_get: HashSet<String>,
    fail_put: HashSet<String>,
    unreachable: bool,
    delay: Option<Duration>,
}

/// Provider holding objects in process memory.
///
/// Keys are listed in lexicographic order. Faults can be injected per key or
/// for the whole backend, which makes it the stand-in for remote storage in
/// tests.
#[derive(Debug)]
pub struct InMemoryProvider {
    name: String,
    objects: RwLock<BTreeMap<String, StoredObject>>,
    faults: Mutex<Faults>,
}

impl Default for InMemoryProvider {
    fn default() -> Self {
        Self::new("memory")
    }
}

impl InMemoryProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            objects: RwLock::new(BTreeMap::new()),
            faults: Mutex::new(Faults::default()),
        }
    }

    /// Make every `get` of `key` fail with a backend error.
    pub fn fail_get_for(&self, key: &str) {
        self.faults().fail_get.insert(key.to_string());
    }

    /// Make every `put` of `key` fail with a backend error.
    pub fn fail_put_for(&self, key: &str) {
        self.faults().fail_put.insert(key.to_string());
    }

    /// Fail every operation as if the backend were offline.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.faults().unreachable = unreachable;
    }

    /// Sleep before each data operation.
    pub fn set_delay(&self, delay: Option<Duration>) {
        self.faults().delay = delay;
    }

    pub fn len(&self) -> usize {
        self.objects.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn content_type(&self, key: &str) -> Option<String> {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .map(|o| o.content_type.clone())
    }

    fn faults(&self) -> std::sync::MutexGuard<'_, Faults> {
        self.faults.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply the configured delay and reachability, then key-specific faults.
    async fn gate(&self, key: &str, failing: impl Fn(&Faults) -> bool) -> Result<(), StorageError> {
        let delay = self.faults().delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let faults = self.faults();
        if faults.unreachable {
            return Err(StorageError::Unreachable(format!("{} is offline", self.name)));
        }
        if failing(&faults) {
            return Err(StorageError::Backend(format!(
                "injected failure for '{}'",
                key
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl StorageProvider for InMemoryProvider {
    fn kind(&self) -> &'static str {
        "memory"
    }

    fn describe(&self) -> String {
        format!("memory:{}", self.name)
    }

    async fn put(&self, key: &str, data: Bytes, content_type: &str) -> Result<(), StorageError> {
        check_key(key)?;
        self.gate(key, |f| f.fail_put.contains(key)).await?;

        let object = StoredObject {
            data,
            content_type: content_type.to_string(),
            modified: Utc::now(),
        };
        self.objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), object);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Bytes, StorageError> {
        check_key(key)?;
        self.gate(key, |f| f.fail_get.contains(key)).await?;

        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .map(|o| o.data.clone())
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        check_key(key)?;
        self.gate(key, |_| false).await?;
        Ok(self
            .objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key))
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        check_key(key)?;
        self.gate(key, |_| false).await?;
        self.objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        Ok(())
    }

    fn list(&self, prefix: &str) -> ObjectStream {
        if self.faults().unreachable {
            let err = StorageError::Unreachable(format!("{} is offline", self.name));
            return stream::iter(vec![Err(err)]).boxed();
        }

        let items: Vec<Result<ObjectInfo, StorageError>> = self
            .objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, object)| {
                Ok(ObjectInfo {
                    key: key.clone(),
                    size: object.data.len() as u64,
                    last_modified: Some(object.modified),
                })
            })
            .collect();

        stream::iter(items).boxed()
    }

    async fn stat(&self, key: &str) -> Result<ObjectStat, StorageError> {
        check_key(key)?;
        self.gate(key, |_| false).await?;

        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .map(|o| ObjectStat {
                size: o.data.len() as u64,
                last_modified: Some(o.modified),
            })
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn test_connection(&self) -> ConnectionReport {
        let details = json!({ "name": self.name, "objects": self.len() });
        if self.faults().unreachable {
            ConnectionReport::failed(format!("{} is offline", self.name), details)
        } else {
            ConnectionReport::ok("In-memory storage is available", details)
        }
    }
}
