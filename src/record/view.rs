//! Record views
//!
//! A view decides which endpoints a record contributes and where its status
//! lives. Decorators narrow the endpoints of an inner view and pass status
//! through untouched.

use std::collections::BTreeSet;

use super::{DnsRecord, RecordStatus, RemoteRecordStatus};
use crate::delegation::groups::ActiveGroups;
use crate::endpoint::Endpoint;

pub trait RecordView: Send + Sync {
    fn record(&self) -> &DnsRecord;

    /// Endpoints this record wants published
    fn endpoints(&self) -> Vec<Endpoint>;

    fn status(&self) -> RecordStatus;

    fn set_status(&mut self, status: RecordStatus);

    fn into_record(self) -> DnsRecord
    where
        Self: Sized;
}

/// The record as stored on this cluster
#[derive(Debug, Clone)]
pub struct LocalView {
    record: DnsRecord,
}

impl LocalView {
    pub fn new(record: DnsRecord) -> Self {
        Self { record }
    }
}

impl RecordView for LocalView {
    fn record(&self) -> &DnsRecord {
        &self.record
    }

    fn endpoints(&self) -> Vec<Endpoint> {
        self.record.spec.endpoints.clone()
    }

    fn status(&self) -> RecordStatus {
        self.record.status_or_default()
    }

    fn set_status(&mut self, status: RecordStatus) {
        self.record.status = Some(status);
    }

    fn into_record(self) -> DnsRecord {
        self.record
    }
}

/// A delegating record seen through the status slot of one cluster
#[derive(Debug, Clone)]
pub struct RemoteStatusView {
    record: DnsRecord,
    cluster_id: String,
}

impl RemoteStatusView {
    pub fn new(record: DnsRecord, cluster_id: &str) -> Self {
        Self {
            record,
            cluster_id: cluster_id.to_string(),
        }
    }

    fn slot(&self) -> Option<&RemoteRecordStatus> {
        self.record
            .status
            .as_ref()
            .and_then(|s| s.remote_record_statuses.get(&self.cluster_id))
    }

    fn slot_mut(&mut self) -> &mut RemoteRecordStatus {
        self.record
            .status
            .get_or_insert_with(RecordStatus::default)
            .remote_record_statuses
            .entry(self.cluster_id.clone())
            .or_default()
    }

    pub fn deletion_acknowledged(&self) -> bool {
        self.slot().is_some_and(|s| s.deletion_acknowledged)
    }

    pub fn set_deletion_acknowledged(&mut self, acknowledged: bool) {
        self.slot_mut().deletion_acknowledged = acknowledged;
    }
}

impl RecordView for RemoteStatusView {
    fn record(&self) -> &DnsRecord {
        &self.record
    }

    fn endpoints(&self) -> Vec<Endpoint> {
        self.record.spec.endpoints.clone()
    }

    fn status(&self) -> RecordStatus {
        self.slot().map(|s| s.status.clone()).unwrap_or_default()
    }

    fn set_status(&mut self, mut status: RecordStatus) {
        status.remote_record_statuses.clear();
        self.slot_mut().status = status;
    }

    fn into_record(self) -> DnsRecord {
        self.record
    }
}

/// Withholds every endpoint while the record's group is inactive, so the
/// plan removes what the group published before.
#[derive(Debug, Clone)]
pub struct GroupFilteredView<V> {
    inner: V,
    active: bool,
}

impl<V: RecordView> GroupFilteredView<V> {
    pub fn new(inner: V, groups: &ActiveGroups) -> Self {
        let active = groups.is_active(inner.record().spec.group.as_deref());
        Self { inner, active }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }
}

impl<V: RecordView> RecordView for GroupFilteredView<V> {
    fn record(&self) -> &DnsRecord {
        self.inner.record()
    }

    fn endpoints(&self) -> Vec<Endpoint> {
        if self.active {
            self.inner.endpoints()
        } else {
            Vec::new()
        }
    }

    fn status(&self) -> RecordStatus {
        self.inner.status()
    }

    fn set_status(&mut self, status: RecordStatus) {
        self.inner.set_status(status);
    }

    fn into_record(self) -> DnsRecord {
        self.inner.into_record()
    }
}

/// Health probe outcome for a record's targets
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeResults {
    unhealthy: BTreeSet<String>,
}

impl ProbeResults {
    pub fn new<I, S>(unhealthy: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            unhealthy: unhealthy.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_healthy(&self, target: &str) -> bool {
        !self.unhealthy.contains(target)
    }
}

/// Source of probe results; probing itself happens elsewhere
pub trait ProbeSource: Send + Sync {
    fn results(&self, record: &DnsRecord) -> ProbeResults;
}

/// Every target healthy
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProbes;

impl ProbeSource for NoProbes {
    fn results(&self, _record: &DnsRecord) -> ProbeResults {
        ProbeResults::default()
    }
}

/// Drops unhealthy targets. An endpoint whose targets are all unhealthy is
/// published unchanged.
#[derive(Debug, Clone)]
pub struct HealthFilteredView<V> {
    inner: V,
    probes: ProbeResults,
}

impl<V: RecordView> HealthFilteredView<V> {
    pub fn new(inner: V, probes: ProbeResults) -> Self {
        Self { inner, probes }
    }
}

impl<V: RecordView> RecordView for HealthFilteredView<V> {
    fn record(&self) -> &DnsRecord {
        self.inner.record()
    }

    fn endpoints(&self) -> Vec<Endpoint> {
        self.inner
            .endpoints()
            .into_iter()
            .map(|mut endpoint| {
                let healthy: Vec<String> = endpoint
                    .targets
                    .iter()
                    .filter(|t| self.probes.is_healthy(t))
                    .cloned()
                    .collect();
                if !healthy.is_empty() {
                    endpoint.targets = healthy;
                }
                endpoint
            })
            .collect()
    }

    fn status(&self) -> RecordStatus {
        self.inner.status()
    }

    fn set_status(&mut self, status: RecordStatus) {
        self.inner.set_status(status);
    }

    fn into_record(self) -> DnsRecord {
        self.inner.into_record()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::RecordType;
    use crate::record::DnsRecordSpec;

    fn record(group: Option<&str>) -> DnsRecord {
        DnsRecord::new(
            "default",
            "foo",
            DnsRecordSpec {
                root_host: "foo.example.com".to_string(),
                endpoints: vec![Endpoint::new("foo.example.com", RecordType::A, ["1.1.1.1", "2.2.2.2"])],
                group: group.map(str::to_string),
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_group_filter_hides_inactive_groups() {
        let groups = ActiveGroups::new(["group1"]);

        let active = GroupFilteredView::new(LocalView::new(record(Some("group1"))), &groups);
        let inactive = GroupFilteredView::new(LocalView::new(record(Some("group2"))), &groups);
        let ungrouped = GroupFilteredView::new(LocalView::new(record(None)), &groups);

        assert_eq!(active.endpoints().len(), 1);
        assert!(inactive.endpoints().is_empty());
        assert_eq!(ungrouped.endpoints().len(), 1);
    }

    #[test]
    fn test_health_filter_fails_open() {
        let view = HealthFilteredView::new(LocalView::new(record(None)), ProbeResults::new(["1.1.1.1"]));
        assert_eq!(view.endpoints()[0].targets, vec!["2.2.2.2"]);

        let view = HealthFilteredView::new(
            LocalView::new(record(None)),
            ProbeResults::new(["1.1.1.1", "2.2.2.2"]),
        );
        assert_eq!(view.endpoints()[0].targets.len(), 2);
    }

    #[test]
    fn test_decorators_pass_status_through() {
        let mut view = HealthFilteredView::new(
            GroupFilteredView::new(LocalView::new(record(None)), &ActiveGroups::default()),
            ProbeResults::default(),
        );

        view.set_status(RecordStatus {
            write_counter: 3,
            ..Default::default()
        });
        assert_eq!(view.status().write_counter, 3);
        assert_eq!(view.into_record().status.unwrap().write_counter, 3);
    }

    #[test]
    fn test_remote_status_view_writes_only_its_slot() {
        let mut view = RemoteStatusView::new(record(None), "cluster-b");
        view.set_status(RecordStatus {
            zone_id: "zone-1".to_string(),
            ..Default::default()
        });
        view.set_deletion_acknowledged(true);

        assert!(view.deletion_acknowledged());
        assert_eq!(view.status().zone_id, "zone-1");

        let record = view.into_record();
        let status = record.status.unwrap();
        assert!(status.zone_id.is_empty());
        assert!(status.remote_record_statuses["cluster-b"].deletion_acknowledged);
    }
}
