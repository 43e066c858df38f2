//! DNSRecord resource
//!
//! Schema of the `dns.lornu.ai/v1alpha1` `DNSRecord` object: the desired
//! endpoints for one root host and the status that carries the controller's
//! only memory between reconciles.

use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

use crate::endpoint::Endpoint;
use crate::plan::Policy;
use crate::store::RecordKey;

pub mod view;

pub use view::{
    GroupFilteredView, HealthFilteredView, LocalView, NoProbes, ProbeResults, ProbeSource, RecordView,
    RemoteStatusView,
};

pub const API_GROUP: &str = "dns.lornu.ai";
pub const API_VERSION: &str = "v1alpha1";
pub const KIND: &str = "DNSRecord";
pub const PLURAL: &str = "dnsrecords";

pub const FINALIZER: &str = "dns.lornu.ai/finalizer";
pub const AUTHORITATIVE_LABEL: &str = "dns.lornu.ai/authoritative";
pub const DELEGATION_KEY_LABEL: &str = "dns.lornu.ai/delegation-key";

pub const READY_CONDITION: &str = "Ready";

fn default_api_version() -> String {
    format!("{}/{}", API_GROUP, API_VERSION)
}

fn default_kind() -> String {
    KIND.to_string()
}

/// Named DNS provider a record publishes through
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderRef {
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DnsRecordSpec {
    /// Top-level host this record is responsible for, may start with `*.`
    pub root_host: String,
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_ref: Option<ProviderRef>,
    /// Contribute to an authoritative record instead of publishing directly
    #[serde(default)]
    pub delegate: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
    /// Controller default when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<Policy>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DnsRecord {
    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(default = "default_kind")]
    pub kind: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    pub spec: DnsRecordSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<RecordStatus>,
}

impl DnsRecord {
    pub fn new(namespace: &str, name: &str, spec: DnsRecordSpec) -> Self {
        Self {
            api_version: default_api_version(),
            kind: default_kind(),
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            spec,
            status: None,
        }
    }

    pub fn key(&self) -> RecordKey {
        RecordKey::new(
            self.metadata.namespace.as_deref().unwrap_or_default(),
            self.metadata.name.as_deref().unwrap_or_default(),
        )
    }

    pub fn generation(&self) -> i64 {
        self.metadata.generation.unwrap_or(0)
    }

    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    pub fn has_finalizer(&self) -> bool {
        self.metadata
            .finalizers
            .as_ref()
            .is_some_and(|f| f.iter().any(|f| f == FINALIZER))
    }

    /// Returns false when the finalizer was already present
    pub fn add_finalizer(&mut self) -> bool {
        if self.has_finalizer() {
            return false;
        }
        self.metadata
            .finalizers
            .get_or_insert_with(Vec::new)
            .push(FINALIZER.to_string());
        true
    }

    /// Returns false when the finalizer was not present
    pub fn remove_finalizer(&mut self) -> bool {
        let Some(finalizers) = self.metadata.finalizers.as_mut() else {
            return false;
        };
        let before = finalizers.len();
        finalizers.retain(|f| f != FINALIZER);
        before != finalizers.len()
    }

    pub fn label(&self, name: &str) -> Option<&str> {
        self.metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(name))
            .map(String::as_str)
    }

    pub fn set_label(&mut self, name: &str, value: &str) {
        self.metadata
            .labels
            .get_or_insert_with(BTreeMap::new)
            .insert(name.to_string(), value.to_string());
    }

    pub fn is_authoritative(&self) -> bool {
        self.label(AUTHORITATIVE_LABEL) == Some("true")
    }

    pub fn is_delegating(&self) -> bool {
        self.spec.delegate && !self.is_authoritative()
    }

    pub fn status_or_default(&self) -> RecordStatus {
        self.status.clone().unwrap_or_default()
    }

    /// Explicit owner id, or a stable hash of cluster, namespace and name
    pub fn owner_id(&self, cluster_id: &str) -> String {
        if let Some(owner) = self.spec.owner_id.as_ref().filter(|o| !o.is_empty()) {
            return owner.clone();
        }

        let key = self.key();
        let digest = Sha256::digest(format!("{}/{}/{}", cluster_id, key.namespace, key.name).as_bytes());
        hex::encode(digest)[..8].to_string()
    }

    /// Where the record stands at `now`
    pub fn phase(&self, now: DateTime<Utc>) -> RecordPhase {
        if self.is_deleting() {
            return RecordPhase::Deleting;
        }

        let status = match &self.status {
            Some(status) if !status.zone_id.is_empty() => status,
            _ => return RecordPhase::Pending,
        };

        if status.observed_generation != self.generation() || status.window_expired(now) {
            RecordPhase::Validating
        } else {
            RecordPhase::Ready
        }
    }
}

/// Controller view of a record's lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordPhase {
    Pending,
    Validating,
    Ready,
    Deleting,
}

impl fmt::Display for RecordPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let phase = match self {
            RecordPhase::Pending => "Pending",
            RecordPhase::Validating => "Validating",
            RecordPhase::Ready => "Ready",
            RecordPhase::Deleting => "Deleting",
        };
        f.write_str(phase)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

/// Reasons surfaced on the Ready condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionReason {
    ProviderSuccess,
    AwaitingValidation,
    ProviderError,
    ZoneNotFound,
    ApexDomain,
    ZoneMismatch,
    MissingProvider,
    RecordTypeConflict,
    TargetConflict,
    DanglingTarget,
    ActiveGroupsLookupFailed,
    Delegated,
    Terminating,
}

impl fmt::Display for ConditionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    pub reason: ConditionReason,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub observed_generation: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

impl Condition {
    pub fn ready(status: ConditionStatus, reason: ConditionReason, message: impl Into<String>, generation: i64) -> Self {
        Self {
            type_: READY_CONDITION.to_string(),
            status,
            reason,
            message: message.into(),
            observed_generation: generation,
            last_transition_time: None,
        }
    }

    fn same_state(&self, other: &Condition) -> bool {
        self.type_ == other.type_
            && self.status == other.status
            && self.reason == other.reason
            && self.message == other.message
            && self.observed_generation == other.observed_generation
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordStatus {
    #[serde(default)]
    pub observed_generation: i64,
    /// Endpoints this owner published last, provenance markers included
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub endpoints: Vec<Endpoint>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub domain_owners: Vec<String>,
    #[serde(default)]
    pub write_counter: i64,
    #[serde(default, rename = "validForSeconds", with = "crate::config::duration_secs")]
    pub valid_for: Duration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queued_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub zone_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub zone_domain_name: String,
    /// Whether the record's group was active when last validated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_active: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub remote_record_statuses: BTreeMap<String, RemoteRecordStatus>,
}

impl RecordStatus {
    pub fn ready_condition(&self) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == READY_CONDITION)
    }

    pub fn is_ready(&self) -> bool {
        self.ready_condition()
            .is_some_and(|c| c.status == ConditionStatus::True)
    }

    pub fn reason(&self) -> Option<ConditionReason> {
        self.ready_condition().map(|c| c.reason)
    }

    /// Replace a condition, keeping its transition time when the status holds
    pub fn set_condition(&mut self, mut condition: Condition, now: DateTime<Utc>) {
        match self.conditions.iter_mut().find(|c| c.type_ == condition.type_) {
            Some(existing) => {
                condition.last_transition_time = if existing.status == condition.status {
                    existing.last_transition_time.or(Some(now))
                } else {
                    Some(now)
                };
                *existing = condition;
            }
            None => {
                condition.last_transition_time = Some(now);
                self.conditions.push(condition);
            }
        }
    }

    pub fn valid_until(&self) -> Option<DateTime<Utc>> {
        let valid_for = chrono::Duration::from_std(self.valid_for).ok()?;
        self.queued_at.map(|queued| queued + valid_for)
    }

    pub fn window_expired(&self, now: DateTime<Utc>) -> bool {
        self.valid_until().map_or(true, |until| now >= until)
    }

    /// Field-by-field comparison. Transition times and target order are
    /// not significant.
    pub fn differs_from(&self, other: &RecordStatus) -> bool {
        let owners = |s: &RecordStatus| s.domain_owners.iter().cloned().collect::<BTreeSet<_>>();
        let endpoints_differ = self.endpoints.len() != other.endpoints.len()
            || self
                .endpoints
                .iter()
                .zip(&other.endpoints)
                .any(|(a, b)| a.key() != b.key() || !a.same_values(b));
        let conditions_differ = self.conditions.len() != other.conditions.len()
            || self
                .conditions
                .iter()
                .zip(&other.conditions)
                .any(|(a, b)| !a.same_state(b));

        self.observed_generation != other.observed_generation
            || self.write_counter != other.write_counter
            || self.valid_for != other.valid_for
            || self.queued_at != other.queued_at
            || self.zone_id != other.zone_id
            || self.zone_domain_name != other.zone_domain_name
            || self.group_active != other.group_active
            || owners(self) != owners(other)
            || endpoints_differ
            || conditions_differ
            || self.slots_differ(other)
    }

    fn slots_differ(&self, other: &RecordStatus) -> bool {
        self.remote_record_statuses.len() != other.remote_record_statuses.len()
            || self.remote_record_statuses.iter().any(|(cluster, slot)| {
                other.remote_record_statuses.get(cluster).map_or(true, |theirs| {
                    slot.deletion_acknowledged != theirs.deletion_acknowledged || slot.status.differs_from(&theirs.status)
                })
            })
    }
}

/// Status slot one cluster writes into a delegating record it aggregated
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteRecordStatus {
    #[serde(flatten)]
    pub status: RecordStatus,
    /// Set once the writing cluster republished without this record
    #[serde(default)]
    pub deletion_acknowledged: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::RecordType;
    use chrono::TimeZone;

    fn record() -> DnsRecord {
        DnsRecord::new(
            "default",
            "foo",
            DnsRecordSpec {
                root_host: "foo.example.com".to_string(),
                endpoints: vec![Endpoint::new("foo.example.com", RecordType::A, ["127.0.0.1"])],
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_record_json_shape() {
        let json = serde_json::to_value(record()).unwrap();

        assert_eq!(json["apiVersion"], "dns.lornu.ai/v1alpha1");
        assert_eq!(json["kind"], "DNSRecord");
        assert_eq!(json["spec"]["rootHost"], "foo.example.com");
        assert!(json["spec"].get("policy").is_none());

        let back: DnsRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record());
    }

    #[test]
    fn test_finalizer_helpers() {
        let mut record = record();

        assert!(record.add_finalizer());
        assert!(!record.add_finalizer());
        assert!(record.has_finalizer());
        assert!(record.remove_finalizer());
        assert!(!record.has_finalizer());
    }

    #[test]
    fn test_owner_id_is_stable_and_overridable() {
        let mut record = record();
        let derived = record.owner_id("cluster-a");

        assert_eq!(derived.len(), 8);
        assert_eq!(derived, record.owner_id("cluster-a"));
        assert_ne!(derived, record.owner_id("cluster-b"));

        record.spec.owner_id = Some("explicit".to_string());
        assert_eq!(record.owner_id("cluster-a"), "explicit");
    }

    #[test]
    fn test_phase_follows_window_and_generation() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut record = record();
        record.metadata.generation = Some(1);
        assert_eq!(record.phase(now), RecordPhase::Pending);

        record.status = Some(RecordStatus {
            observed_generation: 1,
            zone_id: "zone-1".to_string(),
            queued_at: Some(now),
            valid_for: Duration::from_secs(60),
            ..Default::default()
        });
        assert_eq!(record.phase(now), RecordPhase::Ready);
        assert_eq!(record.phase(now + chrono::Duration::seconds(61)), RecordPhase::Validating);

        record.metadata.generation = Some(2);
        assert_eq!(record.phase(now), RecordPhase::Validating);
    }

    #[test]
    fn test_set_condition_keeps_transition_time() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let t1 = t0 + chrono::Duration::minutes(5);
        let mut status = RecordStatus::default();

        status.set_condition(Condition::ready(ConditionStatus::False, ConditionReason::AwaitingValidation, "", 1), t0);
        status.set_condition(Condition::ready(ConditionStatus::False, ConditionReason::ProviderError, "boom", 1), t1);
        assert_eq!(status.conditions[0].last_transition_time, Some(t0));

        status.set_condition(Condition::ready(ConditionStatus::True, ConditionReason::ProviderSuccess, "", 1), t1);
        assert_eq!(status.conditions[0].last_transition_time, Some(t1));
        assert!(status.is_ready());
    }

    #[test]
    fn test_differs_from_ignores_order_and_transition_time() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut a = RecordStatus {
            domain_owners: vec!["a".to_string(), "b".to_string()],
            endpoints: vec![Endpoint::new("foo.example.com", RecordType::A, ["1.1.1.1", "2.2.2.2"])],
            ..Default::default()
        };
        a.set_condition(Condition::ready(ConditionStatus::True, ConditionReason::ProviderSuccess, "", 1), now);

        let mut b = a.clone();
        b.domain_owners.reverse();
        b.endpoints[0].targets.reverse();
        b.conditions[0].last_transition_time = None;
        assert!(!a.differs_from(&b));

        b.write_counter = 1;
        assert!(a.differs_from(&b));
    }

    #[test]
    fn test_differs_from_compares_slots_by_field() {
        let mut a = RecordStatus::default();
        a.remote_record_statuses.insert(
            "away".to_string(),
            RemoteRecordStatus {
                status: RecordStatus {
                    domain_owners: vec!["a".to_string(), "b".to_string()],
                    ..Default::default()
                },
                deletion_acknowledged: false,
            },
        );

        let mut b = a.clone();
        if let Some(slot) = b.remote_record_statuses.get_mut("away") {
            slot.status.domain_owners.reverse();
        }
        assert!(!a.differs_from(&b));

        if let Some(slot) = b.remote_record_statuses.get_mut("away") {
            slot.deletion_acknowledged = true;
        }
        assert!(a.differs_from(&b));
    }

    #[test]
    fn test_remote_status_flattens() {
        let remote = RemoteRecordStatus {
            status: RecordStatus {
                zone_id: "zone-1".to_string(),
                ..Default::default()
            },
            deletion_acknowledged: true,
        };

        let json = serde_json::to_value(&remote).unwrap();
        assert_eq!(json["zoneId"], "zone-1");
        assert_eq!(json["deletionAcknowledged"], true);
    }
}
