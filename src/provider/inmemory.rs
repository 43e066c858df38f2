//! In-memory DNS provider
//!
//! Keeps zones in process memory. Used by tests and by `--dry-run`.
//! Supports failure injection so partially-applied batches can be exercised.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tracing::debug;

use super::{best_zone_for_host, Provider, ProviderError};
use crate::endpoint::{Changes, Endpoint, EndpointKey, Zone};

#[derive(Default)]
struct ZoneState {
    zone: Option<Zone>,
    records: BTreeMap<EndpointKey, Endpoint>,
}

/// In-memory provider
pub struct InMemoryProvider {
    zones: Mutex<BTreeMap<String, ZoneState>>,
    records_calls: AtomicUsize,
    apply_calls: AtomicUsize,
    /// Fail the next apply after this many operations succeeded (usize::MAX = off)
    fail_after: AtomicUsize,
}

impl Default for InMemoryProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryProvider {
    pub fn new() -> Self {
        Self {
            zones: Mutex::new(BTreeMap::new()),
            records_calls: AtomicUsize::new(0),
            apply_calls: AtomicUsize::new(0),
            fail_after: AtomicUsize::new(usize::MAX),
        }
    }

    pub fn with_zone(self, zone: Zone) -> Self {
        self.add_zone(zone);
        self
    }

    pub fn add_zone(&self, zone: Zone) {
        let id = zone.id.clone();
        let mut zones = self.lock();
        zones.entry(id).or_default().zone = Some(zone);
    }

    /// Snapshot of every endpoint stored in a zone
    pub fn snapshot(&self, zone_id: &str) -> Vec<Endpoint> {
        self.lock()
            .get(zone_id)
            .map(|state| state.records.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Write an endpoint directly, bypassing any registry (simulates another tool)
    pub fn put(&self, zone_id: &str, endpoint: Endpoint) {
        let mut zones = self.lock();
        let state = zones.entry(zone_id.to_string()).or_default();
        state.records.insert(endpoint.key(), endpoint);
    }

    /// Remove an endpoint directly, bypassing any registry
    pub fn remove(&self, zone_id: &str, key: &EndpointKey) -> Option<Endpoint> {
        self.lock().get_mut(zone_id).and_then(|state| state.records.remove(key))
    }

    /// Make the next `apply_changes` fail after `ops` operations were applied
    pub fn fail_next_apply_after(&self, ops: usize) {
        self.fail_after.store(ops, Ordering::SeqCst);
    }

    pub fn records_calls(&self) -> usize {
        self.records_calls.load(Ordering::SeqCst)
    }

    pub fn apply_calls(&self) -> usize {
        self.apply_calls.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, ZoneState>> {
        self.zones.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl Provider for InMemoryProvider {
    fn name(&self) -> &str {
        "inmemory"
    }

    async fn records(&self, zone: &Zone) -> Result<Vec<Endpoint>, ProviderError> {
        self.records_calls.fetch_add(1, Ordering::SeqCst);

        let zones = self.lock();
        let state = zones
            .get(&zone.id)
            .ok_or_else(|| ProviderError::ZoneNotFound(zone.dns_name.clone()))?;

        Ok(state.records.values().cloned().collect())
    }

    async fn apply_changes(&self, zone: &Zone, changes: &Changes) -> Result<(), ProviderError> {
        self.apply_calls.fetch_add(1, Ordering::SeqCst);
        let budget = self.fail_after.swap(usize::MAX, Ordering::SeqCst);

        let mut zones = self.lock();
        let state = zones
            .get_mut(&zone.id)
            .ok_or_else(|| ProviderError::ZoneNotFound(zone.dns_name.clone()))?;

        let mut applied = 0usize;
        let step = |applied: &mut usize| -> Result<(), ProviderError> {
            if *applied >= budget {
                return Err(ProviderError::Api(format!(
                    "injected failure after {} operations",
                    applied
                )));
            }
            *applied += 1;
            Ok(())
        };

        for endpoint in &changes.delete {
            step(&mut applied)?;
            if state.records.remove(&endpoint.key()).is_none() {
                return Err(ProviderError::Api(format!("record {} not found", endpoint.key())));
            }
        }

        for (old, new) in changes.update_old.iter().zip(&changes.update_new) {
            step(&mut applied)?;
            if old.key() != new.key() {
                state.records.remove(&old.key());
            }
            state.records.insert(new.key(), new.clone());
        }

        for endpoint in &changes.create {
            step(&mut applied)?;
            if state.records.contains_key(&endpoint.key()) {
                return Err(ProviderError::Api(format!(
                    "record {} already exists",
                    endpoint.key()
                )));
            }
            state.records.insert(endpoint.key(), endpoint.clone());
        }

        debug!(zone = %zone.id, operations = applied, "Applied in-memory changes");
        Ok(())
    }

    async fn zone_for_host(&self, host: &str) -> Result<Zone, ProviderError> {
        let zones = self.lock();
        let known: Vec<Zone> = zones.values().filter_map(|state| state.zone.clone()).collect();

        best_zone_for_host(&known, host).ok_or_else(|| ProviderError::ZoneNotFound(host.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::RecordType;

    fn zone() -> Zone {
        Zone::new("zone-1", "example.com")
    }

    #[tokio::test]
    async fn test_apply_and_list() {
        let provider = InMemoryProvider::new().with_zone(zone());
        let changes = Changes {
            create: vec![Endpoint::new("foo.example.com", RecordType::A, ["127.0.0.1"])],
            ..Default::default()
        };

        provider.apply_changes(&zone(), &changes).await.unwrap();

        let records = provider.records(&zone()).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].targets, vec!["127.0.0.1"]);
    }

    #[tokio::test]
    async fn test_injected_failure_leaves_partial_batch() {
        let provider = InMemoryProvider::new().with_zone(zone());
        let changes = Changes {
            create: vec![
                Endpoint::new("a.example.com", RecordType::A, ["1.1.1.1"]),
                Endpoint::new("b.example.com", RecordType::A, ["2.2.2.2"]),
            ],
            ..Default::default()
        };

        provider.fail_next_apply_after(1);
        assert!(provider.apply_changes(&zone(), &changes).await.is_err());
        assert_eq!(provider.snapshot("zone-1").len(), 1);
    }

    #[tokio::test]
    async fn test_delete_missing_record_reports_not_found() {
        let provider = InMemoryProvider::new().with_zone(zone());
        let changes = Changes {
            delete: vec![Endpoint::new("gone.example.com", RecordType::A, ["1.1.1.1"])],
            ..Default::default()
        };

        let err = provider.apply_changes(&zone(), &changes).await.unwrap_err();
        assert!(err.is_benign_absence());
    }

    #[tokio::test]
    async fn test_zone_for_host() {
        let provider = InMemoryProvider::new()
            .with_zone(zone())
            .with_zone(Zone::new("zone-2", "eu.example.com"));

        assert_eq!(provider.zone_for_host("api.eu.example.com").await.unwrap().id, "zone-2");
        assert!(provider.zone_for_host("example.org").await.is_err());
    }

    #[tokio::test]
    async fn test_add_zone_keeps_records_written_before() {
        let provider = InMemoryProvider::new();
        provider.put("zone-1", Endpoint::new("foo.example.com", RecordType::A, ["1.1.1.1"]));
        provider.add_zone(zone());

        assert_eq!(provider.zone_for_host("foo.example.com").await.unwrap().id, "zone-1");
        assert_eq!(provider.records(&zone()).await.unwrap().len(), 1);
    }
}
