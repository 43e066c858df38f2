//! Record Store
//!
//! Access to `DNSRecord` objects with optimistic concurrency: every write is
//! conditional on the resource version the caller read. The same trait
//! covers the local cluster and every peer cluster.

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use thiserror::Error;
use tracing::debug;

use crate::record::{DnsRecord, RecordStatus};

pub mod clusters;
pub mod kubernetes;

pub use clusters::{ClusterRegistry, PeerCluster};
pub use kubernetes::KubeRecordStore;

/// Namespace and name of a record
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordKey {
    pub namespace: String,
    pub name: String,
}

impl RecordKey {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record {0} not found")]
    NotFound(String),

    #[error("record {0} was modified concurrently")]
    Conflict(String),

    #[error("record {0} already exists")]
    AlreadyExists(String),

    #[error("record store request failed: {0}")]
    Api(String),

    #[error("record serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get(&self, key: &RecordKey) -> Result<DnsRecord, StoreError>;

    /// Records in `namespace`, or in every namespace
    async fn list(&self, namespace: Option<&str>) -> Result<Vec<DnsRecord>, StoreError>;

    async fn create(&self, record: &DnsRecord) -> Result<DnsRecord, StoreError>;

    /// Write metadata and spec. Status is ignored.
    async fn update(&self, record: &DnsRecord) -> Result<DnsRecord, StoreError>;

    /// Write status only
    async fn update_status(&self, record: &DnsRecord) -> Result<DnsRecord, StoreError>;

    /// Marks the record for deletion while finalizers remain
    async fn delete(&self, key: &RecordKey) -> Result<(), StoreError>;
}

/// Run `op` again while it fails with a conflict, up to `attempts` times.
/// No backoff: the retry re-reads and the conflict window is local.
pub async fn retry_on_conflict<F, Fut, T>(attempts: usize, mut op: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Err(e) if e.is_conflict() && attempt < attempts.max(1) => {
                debug!(attempt, error = %e, "Retrying after write conflict");
            }
            result => return result,
        }
    }
}

/// Re-read, mutate and write metadata/spec until it sticks. `mutate`
/// returns false when nothing needs writing.
pub async fn update_with<F>(
    store: &dyn RecordStore,
    key: &RecordKey,
    attempts: usize,
    mutate: F,
) -> Result<DnsRecord, StoreError>
where
    F: Fn(&mut DnsRecord) -> bool + Send + Sync,
{
    let mutate = &mutate;
    retry_on_conflict(attempts, || async move {
        let mut record = store.get(key).await?;
        if !mutate(&mut record) {
            return Ok(record);
        }
        store.update(&record).await
    })
    .await
}

/// Same as [`update_with`] for the status subresource
pub async fn update_status_with<F>(
    store: &dyn RecordStore,
    key: &RecordKey,
    attempts: usize,
    mutate: F,
) -> Result<DnsRecord, StoreError>
where
    F: Fn(&mut DnsRecord) -> bool + Send + Sync,
{
    let mutate = &mutate;
    retry_on_conflict(attempts, || async move {
        let mut record = store.get(key).await?;
        if !mutate(&mut record) {
            return Ok(record);
        }
        store.update_status(&record).await
    })
    .await
}

/// Write a record's own status. Remote status slots on the fresh copy are
/// kept, they belong to other clusters.
pub async fn write_status(
    store: &dyn RecordStore,
    key: &RecordKey,
    status: &RecordStatus,
    attempts: usize,
) -> Result<DnsRecord, StoreError> {
    update_status_with(store, key, attempts, |record| {
        let mut next = status.clone();
        next.remote_record_statuses = record
            .status
            .as_ref()
            .map(|s| s.remote_record_statuses.clone())
            .unwrap_or_default();

        if !record.status_or_default().differs_from(&next) {
            return false;
        }
        record.status = Some(next);
        true
    })
    .await
}

/// Process-local store with API-server-like versioning
pub struct InMemoryRecordStore {
    records: Mutex<BTreeMap<RecordKey, DnsRecord>>,
    version: AtomicU64,
}

impl Default for InMemoryRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(BTreeMap::new()),
            version: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<RecordKey, DnsRecord>> {
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn next_version(&self) -> Option<String> {
        Some((self.version.fetch_add(1, Ordering::SeqCst) + 1).to_string())
    }

    fn check_version(stored: &DnsRecord, incoming: &DnsRecord) -> Result<(), StoreError> {
        match &incoming.metadata.resource_version {
            Some(version) if Some(version) != stored.metadata.resource_version.as_ref() => {
                Err(StoreError::Conflict(incoming.key().to_string()))
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn get(&self, key: &RecordKey) -> Result<DnsRecord, StoreError> {
        self.lock()
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn list(&self, namespace: Option<&str>) -> Result<Vec<DnsRecord>, StoreError> {
        Ok(self
            .lock()
            .values()
            .filter(|r| namespace.map_or(true, |ns| r.metadata.namespace.as_deref() == Some(ns)))
            .cloned()
            .collect())
    }

    async fn create(&self, record: &DnsRecord) -> Result<DnsRecord, StoreError> {
        let key = record.key();
        let mut records = self.lock();
        if records.contains_key(&key) {
            return Err(StoreError::AlreadyExists(key.to_string()));
        }

        let mut created = record.clone();
        created.metadata.generation = Some(1);
        created.metadata.resource_version = self.next_version();
        created.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
        created.metadata.deletion_timestamp = None;
        created.status = None;

        records.insert(key, created.clone());
        Ok(created)
    }

    async fn update(&self, record: &DnsRecord) -> Result<DnsRecord, StoreError> {
        let key = record.key();
        let mut records = self.lock();
        let stored = records
            .get(&key)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        Self::check_version(stored, record)?;

        let mut updated = record.clone();
        updated.status = stored.status.clone();
        updated.metadata.deletion_timestamp = stored.metadata.deletion_timestamp.clone();
        updated.metadata.uid = stored.metadata.uid.clone();
        updated.metadata.generation = if updated.spec != stored.spec {
            Some(stored.generation() + 1)
        } else {
            stored.metadata.generation
        };
        updated.metadata.resource_version = self.next_version();

        let finalized = updated.is_deleting()
            && updated
                .metadata
                .finalizers
                .as_ref()
                .map_or(true, |f| f.is_empty());
        if finalized {
            records.remove(&key);
        } else {
            records.insert(key, updated.clone());
        }
        Ok(updated)
    }

    async fn update_status(&self, record: &DnsRecord) -> Result<DnsRecord, StoreError> {
        let key = record.key();
        let mut records = self.lock();
        let stored = records
            .get_mut(&key)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        Self::check_version(stored, record)?;

        stored.status = record.status.clone();
        stored.metadata.resource_version = self.next_version();
        Ok(stored.clone())
    }

    async fn delete(&self, key: &RecordKey) -> Result<(), StoreError> {
        let mut records = self.lock();
        let stored = records
            .get_mut(key)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;

        if stored.metadata.finalizers.as_ref().map_or(true, |f| f.is_empty()) {
            records.remove(key);
            return Ok(());
        }

        if stored.metadata.deletion_timestamp.is_none() {
            stored.metadata.deletion_timestamp = Some(Time(Utc::now()));
            stored.metadata.resource_version = self.next_version();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::DnsRecordSpec;
    use std::sync::atomic::AtomicUsize;

    fn record(name: &str) -> DnsRecord {
        DnsRecord::new(
            "default",
            name,
            DnsRecordSpec {
                root_host: "foo.example.com".to_string(),
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_generation_bumps_only_on_spec_change() {
        let store = InMemoryRecordStore::new();
        let mut created = store.create(&record("foo")).await.unwrap();
        assert_eq!(created.generation(), 1);

        created.add_finalizer();
        let mut updated = store.update(&created).await.unwrap();
        assert_eq!(updated.generation(), 1);

        updated.spec.root_host = "bar.example.com".to_string();
        let updated = store.update(&updated).await.unwrap();
        assert_eq!(updated.generation(), 2);
    }

    #[tokio::test]
    async fn test_stale_write_conflicts() {
        let store = InMemoryRecordStore::new();
        let created = store.create(&record("foo")).await.unwrap();

        let mut first = created.clone();
        first.status = Some(RecordStatus {
            write_counter: 1,
            ..Default::default()
        });
        store.update_status(&first).await.unwrap();

        let err = tokio_test::assert_err!(store.update_status(&created).await);
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_delete_waits_for_finalizers() {
        let store = InMemoryRecordStore::new();
        let mut created = store.create(&record("foo")).await.unwrap();
        created.add_finalizer();
        store.update(&created).await.unwrap();

        store.delete(&created.key()).await.unwrap();
        let mut deleting = store.get(&created.key()).await.unwrap();
        assert!(deleting.is_deleting());

        deleting.remove_finalizer();
        store.update(&deleting).await.unwrap();
        assert!(store.get(&created.key()).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_retry_on_conflict_is_bounded() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), StoreError> = retry_on_conflict(3, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(StoreError::Conflict("x".to_string())) }
        })
        .await;

        assert!(result.unwrap_err().is_conflict());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_write_status_keeps_remote_slots() {
        let store = InMemoryRecordStore::new();
        let created = store.create(&record("foo")).await.unwrap();

        update_status_with(&store, &created.key(), 3, |record| {
            record
                .status
                .get_or_insert_with(RecordStatus::default)
                .remote_record_statuses
                .insert("cluster-b".to_string(), Default::default());
            true
        })
        .await
        .unwrap();

        let own = RecordStatus {
            write_counter: 2,
            ..Default::default()
        };
        let written = write_status(&store, &created.key(), &own, 3).await.unwrap();
        let status = written.status.unwrap();

        assert_eq!(status.write_counter, 2);
        assert!(status.remote_record_statuses.contains_key("cluster-b"));
    }
}
