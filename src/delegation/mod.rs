//! Delegation & Aggregation
//!
//! Delegating records do not publish themselves. Every delegating record
//! for a root host, on this cluster and on every connected peer, feeds one
//! authoritative record whose spec is the union of their endpoints. The
//! authoritative pass then mirrors its status back into a slot on each
//! contributing record.

use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::ControllerConfig;
use crate::endpoint::{merge_by_key, normalize_name, strip_wildcard, Endpoint};
use crate::record::{
    DnsRecord, DnsRecordSpec, GroupFilteredView, LocalView, RecordStatus, RecordView, RemoteStatusView,
    AUTHORITATIVE_LABEL, DELEGATION_KEY_LABEL,
};
use crate::store::{update_status_with, update_with, ClusterRegistry, RecordKey, RecordStore, StoreError};

pub mod groups;

pub use groups::{ActiveGroups, ActiveGroupsResolver, DohTxtLookup, LookupError, StaticTxtLookup, TxtLookup};

const AUTHORITATIVE_PREFIX: &str = "authoritative-record-";

/// Stable key of a root host; `*.foo.example.com` and `foo.example.com` share it
pub fn delegation_key(root_host: &str) -> String {
    let host = normalize_name(root_host);
    let digest = Sha256::digest(strip_wildcard(&host).as_bytes());
    hex::encode(digest)[..16].to_string()
}

pub fn authoritative_name(root_host: &str) -> String {
    format!("{}{}", AUTHORITATIVE_PREFIX, delegation_key(root_host))
}

/// A delegating record and the cluster it lives on
#[derive(Debug, Clone)]
pub struct Contribution {
    pub cluster_id: String,
    pub record: DnsRecord,
}

/// Result of recomputing an authoritative record
#[derive(Debug, Clone, Default)]
pub struct Refresh {
    pub contributions: Vec<Contribution>,
    /// Spec was rewritten, so the generation moved
    pub updated: bool,
    /// Some peer could not be read; endpoints were left alone
    pub stale: bool,
}

impl Refresh {
    /// Nothing delegates to this root host any more
    pub fn is_orphaned(&self) -> bool {
        !self.stale && self.contributions.is_empty()
    }
}

pub struct Aggregator {
    local: Arc<dyn RecordStore>,
    clusters: Arc<ClusterRegistry>,
    namespace: String,
    retries: usize,
}

impl Aggregator {
    pub fn new(local: Arc<dyn RecordStore>, clusters: Arc<ClusterRegistry>, config: &ControllerConfig) -> Self {
        Self {
            local,
            clusters,
            namespace: config.authoritative_namespace.clone(),
            retries: config.status_retries,
        }
    }

    pub fn authoritative_key(&self, root_host: &str) -> RecordKey {
        RecordKey::new(&self.namespace, &authoritative_name(root_host))
    }

    /// Look up or create the authoritative record for `delegating`
    pub async fn ensure_authoritative(&self, delegating: &DnsRecord) -> Result<RecordKey, StoreError> {
        let key = self.authoritative_key(&delegating.spec.root_host);

        match self.local.get(&key).await {
            Ok(_) => return Ok(key),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        let mut record = DnsRecord::new(
            &key.namespace,
            &key.name,
            DnsRecordSpec {
                root_host: normalize_name(&delegating.spec.root_host),
                provider_ref: delegating.spec.provider_ref.clone(),
                delegate: false,
                ..Default::default()
            },
        );
        record.set_label(AUTHORITATIVE_LABEL, "true");
        record.set_label(DELEGATION_KEY_LABEL, &delegation_key(&delegating.spec.root_host));

        match self.local.create(&record).await {
            Ok(_) => {
                info!(record = %key, root_host = %delegating.spec.root_host, "Created authoritative record");
                Ok(key)
            }
            Err(StoreError::AlreadyExists(_)) => Ok(key),
            Err(e) => Err(e),
        }
    }

    /// Every delegating record for `root_host`, deleting ones included
    pub async fn contributions(&self, root_host: &str) -> (Vec<Contribution>, bool) {
        let key = delegation_key(root_host);
        let matches = |record: &DnsRecord| record.is_delegating() && delegation_key(&record.spec.root_host) == key;

        let mut contributions = Vec::new();
        let mut stale = false;

        match self.local.list(None).await {
            Ok(records) => contributions.extend(records.into_iter().filter(|r| matches(r)).map(|record| Contribution {
                cluster_id: self.clusters.local_id().to_string(),
                record,
            })),
            Err(e) => {
                warn!(error = %e, "Failed to list local delegating records");
                stale = true;
            }
        }

        for peer in self.clusters.peers() {
            if !peer.is_connected() {
                debug!(cluster = %peer.id, "Peer disconnected, contributions unknown");
                stale = true;
                continue;
            }
            match peer.store.list(None).await {
                Ok(records) => contributions.extend(records.into_iter().filter(|r| matches(r)).map(|record| {
                    Contribution {
                        cluster_id: peer.id.clone(),
                        record,
                    }
                })),
                Err(e) => {
                    warn!(cluster = %peer.id, error = %e, "Failed to list peer delegating records");
                    stale = true;
                }
            }
        }

        (contributions, stale)
    }

    /// Union of live contributions whose group is active
    pub fn union(contributions: &[Contribution], groups: &ActiveGroups) -> Vec<Endpoint> {
        let endpoints = contributions
            .iter()
            .filter(|c| !c.record.is_deleting())
            .flat_map(|c| GroupFilteredView::new(LocalView::new(c.record.clone()), groups).endpoints())
            .collect();
        merge_by_key(endpoints)
    }

    /// Rewrite the authoritative spec to the current union
    pub async fn refresh(&self, authoritative: &RecordKey, groups: &ActiveGroups) -> Result<Refresh, StoreError> {
        let record = self.local.get(authoritative).await?;
        let (contributions, stale) = self.contributions(&record.spec.root_host).await;

        if stale {
            warn!(record = %authoritative, "Contributions incomplete, keeping authoritative endpoints");
            return Ok(Refresh {
                contributions,
                updated: false,
                stale,
            });
        }

        let union = Self::union(&contributions, groups);
        let before = record.generation();
        let written = update_with(self.local.as_ref(), authoritative, self.retries, |record| {
            if same_endpoints(&record.spec.endpoints, &union) {
                return false;
            }
            record.spec.endpoints = union.clone();
            true
        })
        .await?;

        let updated = written.generation() != before;
        if updated {
            info!(
                record = %authoritative,
                contributions = contributions.len(),
                endpoints = written.spec.endpoints.len(),
                "Recomputed authoritative endpoints"
            );
        }

        Ok(Refresh {
            contributions,
            updated,
            stale,
        })
    }

    /// Write the authoritative status into each contribution's slot for
    /// this cluster. Deleting contributions are acknowledged once a publish
    /// without them succeeded.
    pub async fn reflect(&self, contributions: &[Contribution], status: &RecordStatus, published: bool) {
        let local_id = self.clusters.local_id().to_string();
        let peers = self.clusters.peers();

        for contribution in contributions {
            let store: Arc<dyn RecordStore> = if contribution.cluster_id == local_id {
                Arc::clone(&self.local)
            } else {
                match peers.iter().find(|p| p.id == contribution.cluster_id && p.is_connected()) {
                    Some(peer) => Arc::clone(&peer.store),
                    None => continue,
                }
            };

            let key = contribution.record.key();
            let result = update_status_with(store.as_ref(), &key, self.retries, |record| {
                let acknowledged = record.is_deleting() && published;
                let mut view = RemoteStatusView::new(record.clone(), &local_id);
                view.set_status(status.clone());
                view.set_deletion_acknowledged(acknowledged);

                let next = view.into_record();
                if !record.status_or_default().differs_from(&next.status_or_default()) {
                    return false;
                }
                *record = next;
                true
            })
            .await;

            match result {
                Ok(_) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => warn!(record = %key, cluster = %contribution.cluster_id, error = %e, "Failed to reflect status"),
            }
        }
    }
}

fn same_endpoints(a: &[Endpoint], b: &[Endpoint]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.key() == y.key() && x.same_values(y))
}
