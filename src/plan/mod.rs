//! Plan Engine
//!
//! Pure diff of (current, previous, desired) endpoints for one owner under
//! one root host. Current state is shared with other owners: their targets
//! are merged back into every update and never deleted.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::debug;

use crate::endpoint::{
    is_subdomain, merge_by_key, normalize_name, strip_wildcard, Changes, Endpoint, EndpointKey, RecordType,
};
use crate::registry::ownership::markers;
use crate::registry::{OwnershipIndex, TxtNameMapper};

/// Which operations a plan may emit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Policy {
    #[default]
    Sync,
    UpsertOnly,
    CreateOnly,
}

impl Policy {
    pub fn as_str(self) -> &'static str {
        match self {
            Policy::Sync => "sync",
            Policy::UpsertOnly => "upsert-only",
            Policy::CreateOnly => "create-only",
        }
    }

    fn apply(self, changes: &mut Changes) {
        match self {
            Policy::Sync => {}
            Policy::UpsertOnly => changes.delete.clear(),
            Policy::CreateOnly => {
                changes.update_old.clear();
                changes.update_new.clear();
                changes.delete.clear();
            }
        }
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Policy {
    type Err = PlanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sync" => Ok(Policy::Sync),
            "upsert-only" => Ok(Policy::UpsertOnly),
            "create-only" => Ok(Policy::CreateOnly),
            other => Err(PlanError::UnknownPolicy(other.to_string())),
        }
    }
}

/// Domains a plan may touch. An empty filter matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DomainFilter {
    domains: Vec<String>,
}

impl DomainFilter {
    pub fn new<I, S>(domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            domains: domains
                .into_iter()
                .map(|d| normalize_name(d.as_ref()))
                .filter(|d| !d.is_empty())
                .collect(),
        }
    }

    pub fn matches(&self, name: &str) -> bool {
        self.domains.is_empty() || self.domains.iter().any(|d| is_subdomain(name, d))
    }

    /// `name` is exactly one of the filter's domains
    pub fn is_apex(&self, name: &str) -> bool {
        let name = normalize_name(name);
        self.domains.iter().any(|d| *d == name)
    }

    pub fn describe(&self) -> String {
        self.domains.join(",")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    #[error("root host {root_host} is the apex of zone {zone}")]
    ApexDomain { root_host: String, zone: String },

    #[error("{name} is not part of zone {zone}")]
    ZoneMismatch { name: String, zone: String },

    #[error("record type conflict: cannot publish {requested} {name}, {existing} {name} is owned by {owners}")]
    RecordTypeConflict {
        name: String,
        requested: RecordType,
        existing: RecordType,
        owners: String,
    },

    #[error("target conflict: CNAME {name} wants {ours} but is published as {theirs} by another owner")]
    TargetConflict { name: String, ours: String, theirs: String },

    #[error("dangling target: {name} points to {target} which has no endpoint")]
    DanglingTarget { name: String, target: String },

    #[error("unknown policy {0}")]
    UnknownPolicy(String),
}

/// Changes to apply and the owners left under the root host afterwards
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlanResult {
    pub changes: Changes,
    pub owners: Vec<String>,
}

/// Inputs of one plan calculation
#[derive(Debug, Clone)]
pub struct Plan {
    pub current: Vec<Endpoint>,
    pub previous: Vec<Endpoint>,
    pub desired: Vec<Endpoint>,
    pub policy: Policy,
    pub domain_filter: DomainFilter,
    pub managed_types: Vec<RecordType>,
    pub excluded_types: Vec<RecordType>,
    pub owner_id: String,
    pub root_host: String,
    pub mapper: TxtNameMapper,
}

impl Plan {
    pub fn new(owner_id: &str, root_host: &str) -> Self {
        Self {
            current: Vec::new(),
            previous: Vec::new(),
            desired: Vec::new(),
            policy: Policy::default(),
            domain_filter: DomainFilter::default(),
            managed_types: vec![RecordType::A, RecordType::AAAA, RecordType::CNAME],
            excluded_types: Vec::new(),
            owner_id: owner_id.to_string(),
            root_host: normalize_name(root_host),
            mapper: TxtNameMapper::default(),
        }
    }

    pub fn with_current(mut self, current: Vec<Endpoint>) -> Self {
        self.current = current;
        self
    }

    pub fn with_previous(mut self, previous: Vec<Endpoint>) -> Self {
        self.previous = previous;
        self
    }

    pub fn with_desired(mut self, desired: Vec<Endpoint>) -> Self {
        self.desired = desired;
        self
    }

    pub fn with_policy(mut self, policy: Policy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_domain_filter(mut self, domain_filter: DomainFilter) -> Self {
        self.domain_filter = domain_filter;
        self
    }

    pub fn with_types(mut self, managed: &[RecordType], excluded: &[RecordType]) -> Self {
        self.managed_types = managed.to_vec();
        self.excluded_types = excluded.to_vec();
        self
    }

    pub fn with_mapper(mut self, mapper: TxtNameMapper) -> Self {
        self.mapper = mapper;
        self
    }

    fn is_provenance(&self, endpoint: &Endpoint) -> bool {
        endpoint.record_type == RecordType::TXT && self.mapper.is_provenance_name(&endpoint.dns_name)
    }

    fn is_managed(&self, endpoint: &Endpoint) -> bool {
        self.is_provenance(endpoint)
            || (self.managed_types.contains(&endpoint.record_type)
                && !self.excluded_types.contains(&endpoint.record_type))
    }

    fn in_scope(&self, endpoint: &Endpoint) -> bool {
        self.is_managed(endpoint) && self.domain_filter.matches(&endpoint.dns_name)
    }

    pub fn calculate(&self) -> Result<PlanResult, PlanError> {
        self.validate_root_host()?;

        let current: BTreeMap<EndpointKey, Endpoint> = self
            .current
            .iter()
            .filter(|e| self.in_scope(e))
            .map(|e| (e.key(), e.clone()))
            .collect();
        let desired: BTreeMap<EndpointKey, Endpoint> = merge_by_key(self.desired.clone())
            .into_iter()
            .filter(|e| self.is_managed(e))
            .map(|e| (e.key(), e))
            .collect();
        let previous: BTreeSet<EndpointKey> = self
            .previous
            .iter()
            .filter(|e| self.in_scope(e))
            .map(Endpoint::key)
            .collect();

        let snapshot: Vec<Endpoint> = current.values().cloned().collect();
        let index = OwnershipIndex::build(&snapshot, &self.mapper);

        let mut changes = Changes::default();

        for (key, wanted) in &desired {
            self.check_type_conflict(key, &current, &index)?;

            let Some(existing) = current.get(key) else {
                changes.create.push(wanted.clone());
                continue;
            };

            let foreign = self.foreign_targets(key, existing, &index);
            if key.record_type == RecordType::CNAME && !foreign.is_empty() && foreign != wanted.target_set() {
                return Err(PlanError::TargetConflict {
                    name: key.dns_name.clone(),
                    ours: wanted.targets.join(","),
                    theirs: foreign.into_iter().collect::<Vec<_>>().join(","),
                });
            }

            let merged = merge(existing, Some(wanted), &foreign);
            if !merged.same_values(existing) {
                changes.update_old.push(existing.clone());
                changes.update_new.push(merged);
            }
        }

        for key in previous.iter().filter(|k| !desired.contains_key(*k)) {
            let Some(existing) = current.get(key) else {
                continue;
            };

            let foreign = self.foreign_targets(key, existing, &index);
            if foreign.is_empty() {
                changes.delete.push(existing.clone());
                continue;
            }

            let merged = merge(existing, None, &foreign);
            if !merged.same_values(existing) {
                changes.update_old.push(existing.clone());
                changes.update_new.push(merged);
            }
        }

        self.policy.apply(&mut changes);

        let mut after: BTreeMap<EndpointKey, Endpoint> = current;
        for endpoint in &changes.delete {
            after.remove(&endpoint.key());
        }
        for endpoint in changes.update_new.iter().chain(&changes.create) {
            after.insert(endpoint.key(), endpoint.clone());
        }

        if !desired.is_empty() {
            self.check_dangling(&desired, &after)?;
        }

        let after: Vec<Endpoint> = after.into_values().collect();
        let owners = OwnershipIndex::build(&after, &self.mapper)
            .surviving_owners_under(&after, strip_wildcard(&self.root_host))
            .into_iter()
            .collect();

        debug!(
            owner = %self.owner_id,
            root_host = %self.root_host,
            create = changes.create.len(),
            update = changes.update_new.len(),
            delete = changes.delete.len(),
            "Calculated plan"
        );

        Ok(PlanResult { changes, owners })
    }

    fn validate_root_host(&self) -> Result<(), PlanError> {
        let zone = self.domain_filter.describe();

        if self.domain_filter.is_apex(&self.root_host) {
            return Err(PlanError::ApexDomain {
                root_host: self.root_host.clone(),
                zone,
            });
        }
        if !self.domain_filter.matches(&self.root_host) {
            return Err(PlanError::ZoneMismatch {
                name: self.root_host.clone(),
                zone,
            });
        }
        if let Some(stray) = self.desired.iter().find(|e| !self.domain_filter.matches(&e.dns_name)) {
            return Err(PlanError::ZoneMismatch {
                name: stray.dns_name.clone(),
                zone,
            });
        }

        Ok(())
    }

    /// Targets other owners hold on `existing`
    fn foreign_targets(&self, key: &EndpointKey, existing: &Endpoint, index: &OwnershipIndex) -> BTreeSet<String> {
        if self.is_provenance(existing) {
            return markers(existing)
                .into_iter()
                .filter(|m| m.owner != self.owner_id)
                .map(|m| m.encode())
                .collect();
        }

        index
            .entry(key)
            .map(|entry| entry.foreign_targets(&self.owner_id, &existing.target_set()))
            .unwrap_or_default()
    }

    fn check_type_conflict(
        &self,
        key: &EndpointKey,
        current: &BTreeMap<EndpointKey, Endpoint>,
        index: &OwnershipIndex,
    ) -> Result<(), PlanError> {
        if key.record_type == RecordType::TXT {
            return Ok(());
        }

        for other in current.keys() {
            if other.dns_name != key.dns_name
                || other.set_identifier != key.set_identifier
                || other.record_type == key.record_type
                || other.record_type == RecordType::TXT
                || (other.record_type.is_address() && key.record_type.is_address())
            {
                continue;
            }

            if let Some(entry) = index.entry(other) {
                if entry.has_other_owner(&self.owner_id) {
                    return Err(PlanError::RecordTypeConflict {
                        name: key.dns_name.clone(),
                        requested: key.record_type,
                        existing: other.record_type,
                        owners: entry.owners.iter().cloned().collect::<Vec<_>>().join(","),
                    });
                }
            }
        }

        Ok(())
    }

    /// Every CNAME target under the root host must still resolve to an endpoint
    fn check_dangling(
        &self,
        desired: &BTreeMap<EndpointKey, Endpoint>,
        after: &BTreeMap<EndpointKey, Endpoint>,
    ) -> Result<(), PlanError> {
        let base = strip_wildcard(&self.root_host);
        let names: BTreeSet<&str> = after
            .values()
            .filter(|e| e.record_type != RecordType::TXT)
            .map(|e| e.dns_name.as_str())
            .collect();

        for key in desired.keys().filter(|k| k.record_type == RecordType::CNAME) {
            let Some(endpoint) = after.get(key) else {
                continue;
            };

            for target in &endpoint.targets {
                let target = normalize_name(target);
                if !is_subdomain(&target, base) {
                    continue;
                }
                let wildcard = target
                    .split_once('.')
                    .map(|(_, parent)| format!("*.{}", parent))
                    .unwrap_or_default();
                if !names.contains(target.as_str()) && !names.contains(wildcard.as_str()) {
                    return Err(PlanError::DanglingTarget {
                        name: endpoint.dns_name.clone(),
                        target,
                    });
                }
            }
        }

        Ok(())
    }
}

/// Combine this owner's wanted endpoint with the targets others hold.
/// While foreign targets exist the live TTL and properties are kept so
/// owners with different settings do not flip the record back and forth.
fn merge(existing: &Endpoint, wanted: Option<&Endpoint>, foreign: &BTreeSet<String>) -> Endpoint {
    let mut targets = foreign.clone();
    if let Some(wanted) = wanted {
        targets.extend(wanted.targets.iter().cloned());
    }

    let mut merged = wanted.cloned().unwrap_or_else(|| existing.clone());
    merged.targets = targets.into_iter().collect();
    if !foreign.is_empty() {
        merged.record_ttl = existing.record_ttl;
        merged.provider_specific = existing.provider_specific.clone();
    }
    merged
}
