//! Ownership view derived from provenance markers
//!
//! Rebuilt from provider state on every reconcile and never persisted.

use std::collections::{BTreeMap, BTreeSet};

use super::mapper::TxtNameMapper;
use super::provenance::Provenance;
use crate::endpoint::{is_subdomain, Endpoint, EndpointKey, RecordType};

/// Who owns one (name, type, set identifier)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OwnershipEntry {
    pub owners: BTreeSet<String>,
    pub grouped_owners: BTreeMap<String, BTreeSet<String>>,
    pub ungrouped_owners: BTreeSet<String>,
    /// `None` for markers without a `targets` attribute: such an owner is
    /// taken to own every target of the record.
    pub per_owner_targets: BTreeMap<String, Option<BTreeSet<String>>>,
}

impl OwnershipEntry {
    fn add(&mut self, marker: &Provenance) {
        self.owners.insert(marker.owner.clone());
        match &marker.group {
            Some(group) => {
                self.grouped_owners
                    .entry(group.clone())
                    .or_default()
                    .insert(marker.owner.clone());
            }
            None => {
                self.ungrouped_owners.insert(marker.owner.clone());
            }
        }

        let targets = marker
            .targets
            .as_ref()
            .map(|t| t.iter().cloned().collect::<BTreeSet<_>>());
        let merged = match (self.per_owner_targets.remove(&marker.owner), targets) {
            (None, targets) => targets,
            (Some(Some(mut existing)), Some(targets)) => {
                existing.extend(targets);
                Some(existing)
            }
            (Some(_), _) => None,
        };
        self.per_owner_targets.insert(marker.owner.clone(), merged);
    }

    /// At least one owner other than `owner`
    pub fn has_other_owner(&self, owner: &str) -> bool {
        self.owners.iter().any(|o| o != owner)
    }

    /// Targets of `current` attributed to `owner`
    pub fn targets_of(&self, owner: &str, current: &BTreeSet<String>) -> BTreeSet<String> {
        match self.per_owner_targets.get(owner) {
            Some(Some(declared)) => declared.intersection(current).cloned().collect(),
            Some(None) => current.clone(),
            None => BTreeSet::new(),
        }
    }

    /// Targets of `current` attributed to any owner except `owner`
    pub fn foreign_targets(&self, owner: &str, current: &BTreeSet<String>) -> BTreeSet<String> {
        self.owners
            .iter()
            .filter(|o| o.as_str() != owner)
            .flat_map(|o| self.targets_of(o, current))
            .collect()
    }

    /// Owners with at least one target still present in `current`
    pub fn surviving_owners(&self, current: &BTreeSet<String>) -> BTreeSet<String> {
        self.owners
            .iter()
            .filter(|o| !self.targets_of(o, current).is_empty())
            .cloned()
            .collect()
    }
}

/// Ownership of every record described by a provenance marker in a snapshot
#[derive(Debug, Clone, Default)]
pub struct OwnershipIndex {
    entries: BTreeMap<EndpointKey, OwnershipEntry>,
}

impl OwnershipIndex {
    /// Build from endpoints whose provenance targets are already decoded
    pub fn build(endpoints: &[Endpoint], mapper: &TxtNameMapper) -> Self {
        let mut entries: BTreeMap<EndpointKey, OwnershipEntry> = BTreeMap::new();

        for endpoint in endpoints {
            if endpoint.record_type != RecordType::TXT {
                continue;
            }
            let Some((record_type, dns_name)) = mapper.to_endpoint_name(&endpoint.dns_name) else {
                continue;
            };
            let key = EndpointKey {
                dns_name,
                record_type,
                set_identifier: endpoint.set_identifier.clone(),
            };

            let entry = entries.entry(key).or_default();
            for marker in markers(endpoint) {
                entry.add(&marker);
            }
        }

        Self { entries }
    }

    pub fn entry(&self, key: &EndpointKey) -> Option<&OwnershipEntry> {
        self.entries.get(key)
    }

    /// Owners with a surviving target on any record under `root`
    pub fn surviving_owners_under(&self, endpoints: &[Endpoint], root: &str) -> BTreeSet<String> {
        endpoints
            .iter()
            .filter(|e| is_subdomain(&e.dns_name, root))
            .filter_map(|e| self.entry(&e.key()).map(|entry| entry.surviving_owners(&e.target_set())))
            .flatten()
            .collect()
    }
}

/// Decoded markers of a provenance endpoint. Undecodable targets are skipped.
pub fn markers(endpoint: &Endpoint) -> Vec<Provenance> {
    endpoint
        .targets
        .iter()
        .filter_map(|target| Provenance::parse(target).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provenance_endpoint(mapper: &TxtNameMapper, name: &str, markers: &[Provenance]) -> Endpoint {
        Endpoint::new(
            &mapper.to_txt_name(RecordType::A, name),
            RecordType::TXT,
            markers.iter().map(Provenance::encode),
        )
    }

    #[test]
    fn test_index_groups_owners_per_key() {
        let mapper = TxtNameMapper::default();
        let endpoints = vec![
            Endpoint::new("foo.example.com", RecordType::A, ["1.1.1.1", "2.2.2.2"]),
            provenance_endpoint(
                &mapper,
                "foo.example.com",
                &[
                    Provenance::new("o1").with_targets(["1.1.1.1"]),
                    Provenance::new("o2").with_group(Some("eu")).with_targets(["2.2.2.2"]),
                ],
            ),
        ];

        let index = OwnershipIndex::build(&endpoints, &mapper);
        let entry = index.entry(&endpoints[0].key()).unwrap();

        assert_eq!(entry.owners.len(), 2);
        assert!(entry.ungrouped_owners.contains("o1"));
        assert!(entry.grouped_owners["eu"].contains("o2"));

        let current = endpoints[0].target_set();
        assert_eq!(entry.foreign_targets("o1", &current), BTreeSet::from(["2.2.2.2".to_string()]));
        assert!(entry.has_other_owner("o1"));
    }

    #[test]
    fn test_marker_without_targets_owns_everything() {
        let mapper = TxtNameMapper::default();
        let endpoints = vec![
            Endpoint::new("foo.example.com", RecordType::A, ["1.1.1.1"]),
            provenance_endpoint(&mapper, "foo.example.com", &[Provenance::new("legacy")]),
        ];

        let index = OwnershipIndex::build(&endpoints, &mapper);
        let entry = index.entry(&endpoints[0].key()).unwrap();

        assert_eq!(entry.targets_of("legacy", &endpoints[0].target_set()).len(), 1);
    }

    #[test]
    fn test_surviving_owners_drop_owners_without_targets() {
        let mapper = TxtNameMapper::default();
        let endpoints = vec![
            Endpoint::new("foo.example.com", RecordType::A, ["1.1.1.1"]),
            provenance_endpoint(
                &mapper,
                "foo.example.com",
                &[
                    Provenance::new("o1").with_targets(["1.1.1.1"]),
                    Provenance::new("o2").with_targets(["9.9.9.9"]),
                ],
            ),
        ];

        let index = OwnershipIndex::build(&endpoints, &mapper);
        let owners = index.surviving_owners_under(&endpoints, "example.com");

        assert_eq!(owners, BTreeSet::from(["o1".to_string()]));
        assert_eq!(index.entry(&endpoints[0].key()).unwrap().owners.len(), 2);
    }
}
