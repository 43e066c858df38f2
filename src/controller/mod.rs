//! Convergence Controller
//!
//! Drives each `DNSRecord` towards its desired endpoints. A record that just
//! wrote is revisited after the short validation window so racing writers
//! settle; a record that found nothing to change is left alone for the long
//! window. Errors land on the Ready condition and requeue by category.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ControllerConfig;
use crate::delegation::{ActiveGroups, ActiveGroupsResolver, Aggregator, TxtLookup};
use crate::endpoint::{normalize_name, strip_wildcard, Endpoint, Zone};
use crate::plan::{DomainFilter, Plan, PlanResult};
use crate::provider::{Provider, ProviderFactory};
use crate::record::{
    Condition, ConditionReason, ConditionStatus, DnsRecord, GroupFilteredView, HealthFilteredView, LocalView,
    NoProbes, ProbeSource, RecordPhase, RecordStatus, RecordView,
};
use crate::registry::TxtRegistry;
use crate::store::{update_with, write_status, ClusterRegistry, RecordKey, RecordStore, StoreError};

pub mod clock;
pub mod error;
pub mod queue;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{ErrorCategory, ReconcileError};
pub use queue::WorkQueue;

/// What to do with a key after a reconcile
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Requeue(Duration),
    AwaitChange,
}

impl Action {
    pub fn requeue(after: Duration) -> Self {
        Action::Requeue(after)
    }

    pub fn await_change() -> Self {
        Action::AwaitChange
    }

    pub fn requeue_after(&self) -> Option<Duration> {
        match self {
            Action::Requeue(after) => Some(*after),
            Action::AwaitChange => None,
        }
    }
}

/// Status to write after a pass and when to look again
struct Outcome {
    status: RecordStatus,
    requeue: Duration,
    published: bool,
}

pub struct Reconciler {
    store: Arc<dyn RecordStore>,
    providers: Arc<dyn ProviderFactory>,
    aggregator: Aggregator,
    groups: ActiveGroupsResolver,
    probes: Arc<dyn ProbeSource>,
    clock: Arc<dyn Clock>,
    queue: Option<Arc<WorkQueue>>,
    config: ControllerConfig,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn RecordStore>,
        providers: Arc<dyn ProviderFactory>,
        clusters: Arc<ClusterRegistry>,
        lookup: Arc<dyn TxtLookup>,
        config: ControllerConfig,
    ) -> Self {
        let aggregator = Aggregator::new(Arc::clone(&store), clusters, &config);
        let groups = ActiveGroupsResolver::new(
            lookup,
            config.registry.mapper(),
            config.active_groups_nameservers.clone(),
        );

        Self {
            store,
            providers,
            aggregator,
            groups,
            probes: Arc::new(NoProbes),
            clock: Arc::new(SystemClock),
            queue: None,
            config,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_probes(mut self, probes: Arc<dyn ProbeSource>) -> Self {
        self.probes = probes;
        self
    }

    /// Queue used to wake authoritative records
    pub fn with_queue(mut self, queue: Arc<WorkQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn authoritative_key(&self, root_host: &str) -> RecordKey {
        self.aggregator.authoritative_key(root_host)
    }

    fn enqueue(&self, key: RecordKey) {
        if let Some(queue) = &self.queue {
            queue.push(key);
        }
    }

    pub async fn reconcile(&self, key: &RecordKey) -> Result<Action, ReconcileError> {
        let record = match self.store.get(key).await {
            Ok(record) => record,
            Err(e) if e.is_not_found() => {
                debug!(record = %key, "Record no longer exists");
                return Ok(Action::await_change());
            }
            Err(e) => return Err(e.into()),
        };

        debug!(record = %key, phase = %record.phase(self.clock.now()), "Reconciling");
        if record.is_deleting() {
            return self.finalize(record).await;
        }

        let record = self.ensure_finalizer(record).await?;

        if record.is_delegating() {
            self.reconcile_delegating(record).await
        } else if record.is_authoritative() {
            self.reconcile_authoritative(record).await
        } else {
            self.reconcile_direct(record).await
        }
    }

    async fn ensure_finalizer(&self, record: DnsRecord) -> Result<DnsRecord, ReconcileError> {
        if record.has_finalizer() {
            return Ok(record);
        }
        Ok(update_with(self.store.as_ref(), &record.key(), self.config.status_retries, |r| r.add_finalizer()).await?)
    }

    async fn remove_finalizer(&self, record: &DnsRecord) -> Result<Action, ReconcileError> {
        let key = record.key();
        match update_with(self.store.as_ref(), &key, self.config.status_retries, |r| r.remove_finalizer()).await {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }

        info!(record = %key, "Removed finalizer");
        Ok(Action::await_change())
    }

    /// Generation observed and validity window still open. Delegating
    /// records never get a zone, so their phase never reaches Ready.
    fn is_settled(&self, record: &DnsRecord, status: &RecordStatus, now: DateTime<Utc>) -> bool {
        if record.is_delegating() {
            return status.observed_generation == record.generation() && !status.window_expired(now);
        }
        record.phase(now) == RecordPhase::Ready
    }

    fn remaining(&self, status: &RecordStatus, now: DateTime<Utc>) -> Duration {
        status
            .valid_until()
            .and_then(|until| (until - now).to_std().ok())
            .unwrap_or(self.config.validation_requeue)
    }

    async fn write(&self, record: &DnsRecord, outcome: &Outcome) -> Result<(), StoreError> {
        write_status(self.store.as_ref(), &record.key(), &outcome.status, self.config.status_retries).await?;
        Ok(())
    }

    async fn resolve_zone(
        &self,
        provider: &dyn Provider,
        record: &DnsRecord,
        status: &RecordStatus,
    ) -> Result<Zone, ReconcileError> {
        if !status.zone_id.is_empty() && status.observed_generation == record.generation() {
            return Ok(Zone::new(status.zone_id.clone(), &status.zone_domain_name));
        }

        let host = normalize_name(&record.spec.root_host);
        let zone = provider.zone_for_host(strip_wildcard(&host)).await?;
        debug!(record = %record.key(), zone = %zone.id, domain = %zone.dns_name, "Resolved zone");
        Ok(zone)
    }

    /// Zone holding the endpoints of the last successful publish, and a
    /// host inside it to scope the plan with
    fn published(&self, status: &RecordStatus) -> Option<(Zone, String)> {
        if status.zone_id.is_empty() {
            return None;
        }
        let first = status.endpoints.first()?;
        let host = normalize_name(&first.dns_name);
        Some((
            Zone::new(status.zone_id.clone(), &status.zone_domain_name),
            strip_wildcard(&host).to_string(),
        ))
    }

    /// Remove what was published into a zone the record no longer resolves to
    async fn retire(
        &self,
        record: &DnsRecord,
        status: &RecordStatus,
        provider: &Arc<dyn Provider>,
        zone: &Zone,
    ) -> Result<(), ReconcileError> {
        let Some((previous, host)) = self.published(status).filter(|(previous, _)| previous.id != zone.id) else {
            return Ok(());
        };

        info!(record = %record.key(), from = %previous.id, to = %zone.id, "Zone changed, removing previous endpoints");
        self.plan(record, &host, Arc::clone(provider), &previous, Vec::new(), status.endpoints.clone())
            .await?;
        Ok(())
    }

    /// Run the plan for `desired` against the zone and apply it
    #[allow(clippy::too_many_arguments)]
    async fn plan(
        &self,
        record: &DnsRecord,
        root_host: &str,
        provider: Arc<dyn Provider>,
        zone: &Zone,
        desired: Vec<Endpoint>,
        previous: Vec<Endpoint>,
    ) -> Result<(PlanResult, Vec<Endpoint>), ReconcileError> {
        let owner = record.owner_id(&self.config.cluster_id);
        let registry = TxtRegistry::new(provider, zone.clone(), &owner, &self.config.registry)
            .with_group(record.spec.group.as_deref());

        let desired = registry.adjust_endpoints(desired)?;
        let current = registry.records().await?;

        let result = Plan::new(&owner, root_host)
            .with_current(current)
            .with_previous(previous)
            .with_desired(desired.clone())
            .with_policy(record.spec.policy.unwrap_or(self.config.default_policy))
            .with_domain_filter(DomainFilter::new([zone.dns_name.as_str()]))
            .with_types(&self.config.registry.managed_types, &self.config.registry.excluded_types)
            .with_mapper(registry.mapper().clone())
            .calculate()?;

        if !result.changes.is_empty() {
            registry.apply_changes(&result.changes).await?;
            info!(
                record = %record.key(),
                zone = %zone.id,
                owner = %owner,
                create = result.changes.create.len(),
                update = result.changes.update_new.len(),
                delete = result.changes.delete.len(),
                "Applied changes"
            );
        }

        Ok((result, desired))
    }

    #[allow(clippy::too_many_arguments)]
    async fn publish(
        &self,
        record: &DnsRecord,
        status: &RecordStatus,
        provider: Arc<dyn Provider>,
        zone: &Zone,
        desired: Vec<Endpoint>,
        group_active: Option<bool>,
        now: DateTime<Utc>,
    ) -> Result<Outcome, ReconcileError> {
        self.retire(record, status, &provider, zone).await?;
        let (result, desired) = self
            .plan(record, &record.spec.root_host, provider, zone, desired, status.endpoints.clone())
            .await?;
        let generation = record.generation();
        let generation_changed = status.observed_generation != generation;

        let mut next = status.clone();
        next.observed_generation = generation;
        next.endpoints = desired;
        next.domain_owners = result.owners;
        next.zone_id = zone.id.clone();
        next.zone_domain_name = zone.dns_name.clone();
        next.group_active = group_active;
        next.queued_at = Some(now);
        if generation_changed {
            next.write_counter = 0;
        }

        let requeue = if result.changes.is_empty() {
            debug!(record = %record.key(), "Nothing to change, record converged");
            next.valid_for = self.config.valid_for;
            next.set_condition(
                Condition::ready(
                    ConditionStatus::True,
                    ConditionReason::ProviderSuccess,
                    "Provider ensured the DNS records",
                    generation,
                ),
                now,
            );
            self.config.valid_for
        } else {
            if !generation_changed {
                next.write_counter += 1;
            }
            next.valid_for = self.config.validation_requeue;
            next.set_condition(
                Condition::ready(
                    ConditionStatus::False,
                    ConditionReason::AwaitingValidation,
                    format!("Applied {} changes, awaiting validation", result.changes.len()),
                    generation,
                ),
                now,
            );
            self.config.validation_requeue
        };

        Ok(Outcome {
            status: next,
            requeue,
            published: true,
        })
    }

    /// Error status. The observed generation, zone and endpoints stay those
    /// of the last successful publish.
    fn failure(&self, record: &DnsRecord, status: &RecordStatus, err: &ReconcileError, now: DateTime<Utc>) -> Outcome {
        let generation = record.generation();
        let requeue = err.requeue_after(&self.config);

        let mut next = status.clone();
        next.valid_for = requeue;
        next.queued_at = Some(now);
        next.set_condition(
            Condition::ready(ConditionStatus::False, err.reason(), err.to_string(), generation),
            now,
        );

        warn!(
            record = %record.key(),
            reason = %err.reason(),
            error = %err,
            requeue_after = ?requeue,
            "Reconcile failed"
        );

        Outcome {
            status: next,
            requeue,
            published: false,
        }
    }

    async fn reconcile_direct(&self, record: DnsRecord) -> Result<Action, ReconcileError> {
        let now = self.clock.now();
        let status = record.status_or_default();

        let outcome = match self.converge_direct(&record, &status, now).await {
            Ok(Some(outcome)) => outcome,
            Ok(None) => {
                let after = self.remaining(&status, now);
                debug!(record = %record.key(), requeue_after = ?after, "Record settled, skipping");
                return Ok(Action::requeue(after));
            }
            Err(e) => self.failure(&record, &status, &e, now),
        };

        self.write(&record, &outcome).await?;
        Ok(Action::requeue(outcome.requeue))
    }

    /// `None` when the record is settled and nothing needs checking
    async fn converge_direct(
        &self,
        record: &DnsRecord,
        status: &RecordStatus,
        now: DateTime<Utc>,
    ) -> Result<Option<Outcome>, ReconcileError> {
        let group = record.spec.group.as_deref().filter(|g| !g.is_empty());
        let mut groups = None;

        if self.is_settled(record, status, now) {
            match group {
                None => return Ok(None),
                Some(group) if !status.zone_domain_name.is_empty() => {
                    let active = self.groups.resolve(&status.zone_domain_name).await?;
                    if Some(active.is_active(Some(group))) == status.group_active {
                        return Ok(None);
                    }
                    info!(record = %record.key(), group, "Active groups changed, revalidating");
                    groups = Some(active);
                }
                Some(_) => {}
            }
        }

        let provider = self.providers.provider_for(record.spec.provider_ref.as_ref())?;
        let zone = self.resolve_zone(provider.as_ref(), record, status).await?;

        let groups = match (groups, group) {
            (Some(groups), _) => groups,
            (None, Some(_)) => self.groups.resolve(&zone.dns_name).await?,
            (None, None) => ActiveGroups::default(),
        };
        let group_active = group.map(|g| groups.is_active(Some(g)));

        let view = HealthFilteredView::new(
            GroupFilteredView::new(LocalView::new(record.clone()), &groups),
            self.probes.results(record),
        );

        self.publish(record, status, provider, &zone, view.endpoints(), group_active, now)
            .await
            .map(Some)
    }

    async fn reconcile_delegating(&self, record: DnsRecord) -> Result<Action, ReconcileError> {
        let now = self.clock.now();
        let status = record.status_or_default();

        if self.is_settled(&record, &status, now) {
            return Ok(Action::requeue(self.remaining(&status, now)));
        }

        let authoritative = self.aggregator.ensure_authoritative(&record).await?;
        self.enqueue(authoritative.clone());

        let generation = record.generation();
        let mut next = status.clone();
        if status.observed_generation != generation {
            next.write_counter = 0;
        }
        next.observed_generation = generation;
        next.valid_for = self.config.valid_for;
        next.queued_at = Some(now);
        next.set_condition(
            Condition::ready(
                ConditionStatus::True,
                ConditionReason::Delegated,
                format!("Endpoints delegated to {}", authoritative),
                generation,
            ),
            now,
        );

        debug!(record = %record.key(), authoritative = %authoritative, "Delegated endpoints");
        let outcome = Outcome {
            status: next,
            requeue: self.config.valid_for,
            published: false,
        };
        self.write(&record, &outcome).await?;
        Ok(Action::requeue(outcome.requeue))
    }

    async fn prepare_authoritative(
        &self,
        record: &DnsRecord,
        status: &RecordStatus,
    ) -> Result<(Arc<dyn Provider>, Zone, ActiveGroups), ReconcileError> {
        let provider = self.providers.provider_for(record.spec.provider_ref.as_ref())?;
        let zone = self.resolve_zone(provider.as_ref(), record, status).await?;
        let groups = self.groups.resolve(&zone.dns_name).await?;
        Ok((provider, zone, groups))
    }

    async fn reconcile_authoritative(&self, record: DnsRecord) -> Result<Action, ReconcileError> {
        let now = self.clock.now();
        let key = record.key();
        let status = record.status_or_default();

        let (provider, zone, groups) = match self.prepare_authoritative(&record, &status).await {
            Ok(prepared) => prepared,
            Err(e) => {
                let outcome = self.failure(&record, &status, &e, now);
                self.write(&record, &outcome).await?;
                return Ok(Action::requeue(outcome.requeue));
            }
        };

        let refresh = self.aggregator.refresh(&key, &groups).await?;
        if refresh.is_orphaned() {
            info!(record = %key, "No delegating records left, removing authoritative record");
            self.store.delete(&key).await?;
            return match self.store.get(&key).await {
                Ok(record) => self.finalize(record).await,
                Err(e) if e.is_not_found() => Ok(Action::await_change()),
                Err(e) => Err(e.into()),
            };
        }

        let record = if refresh.updated { self.store.get(&key).await? } else { record };
        let status = record.status_or_default();

        if record.phase(now) == RecordPhase::Ready {
            let published = matches!(
                status.reason(),
                Some(ConditionReason::ProviderSuccess | ConditionReason::AwaitingValidation)
            );
            self.aggregator
                .reflect(&refresh.contributions, &status, published && !refresh.stale)
                .await;
            return Ok(Action::requeue(self.remaining(&status, now)));
        }

        let desired = HealthFilteredView::new(LocalView::new(record.clone()), self.probes.results(&record)).endpoints();
        let outcome = match self.publish(&record, &status, provider, &zone, desired, None, now).await {
            Ok(outcome) => outcome,
            Err(e) => self.failure(&record, &status, &e, now),
        };

        self.write(&record, &outcome).await?;
        self.aggregator
            .reflect(&refresh.contributions, &outcome.status, outcome.published && !refresh.stale)
            .await;
        Ok(Action::requeue(outcome.requeue))
    }

    /// Remove this owner's endpoints; `true` once nothing is left to remove
    async fn unpublish(&self, record: &DnsRecord, status: &RecordStatus) -> Result<bool, ReconcileError> {
        let provider = self.providers.provider_for(record.spec.provider_ref.as_ref())?;
        let (zone, host) = match self.published(status) {
            Some(published) => published,
            None => (
                self.resolve_zone(provider.as_ref(), record, status).await?,
                record.spec.root_host.clone(),
            ),
        };
        let (result, _) = self
            .plan(record, &host, provider, &zone, Vec::new(), status.endpoints.clone())
            .await?;
        Ok(result.changes.is_empty())
    }

    async fn finalize(&self, record: DnsRecord) -> Result<Action, ReconcileError> {
        if !record.has_finalizer() {
            return Ok(Action::await_change());
        }
        if record.is_delegating() {
            return self.finalize_delegating(record).await;
        }

        let now = self.clock.now();
        let status = record.status_or_default();

        match self.unpublish(&record, &status).await {
            Ok(true) => self.remove_finalizer(&record).await,
            Ok(false) => {
                let mut next = status.clone();
                next.valid_for = self.config.validation_requeue;
                next.queued_at = Some(now);
                next.set_condition(
                    Condition::ready(
                        ConditionStatus::False,
                        ConditionReason::Terminating,
                        "Removing published endpoints",
                        record.generation(),
                    ),
                    now,
                );
                let outcome = Outcome {
                    status: next,
                    requeue: self.config.validation_requeue,
                    published: true,
                };
                self.write(&record, &outcome).await?;
                Ok(Action::requeue(outcome.requeue))
            }
            Err(e) if e.is_benign_absence() || (e.category() == ErrorCategory::Config && status.endpoints.is_empty()) => {
                debug!(record = %record.key(), error = %e, "Nothing left to remove");
                self.remove_finalizer(&record).await
            }
            Err(e) => {
                let outcome = self.failure(&record, &status, &e, now);
                self.write(&record, &outcome).await?;
                Ok(Action::requeue(outcome.requeue))
            }
        }
    }

    /// Wait until every cluster that aggregated the record acknowledged
    async fn finalize_delegating(&self, record: DnsRecord) -> Result<Action, ReconcileError> {
        self.enqueue(self.aggregator.authoritative_key(&record.spec.root_host));

        let pending: Vec<String> = record
            .status
            .as_ref()
            .map(|s| {
                s.remote_record_statuses
                    .iter()
                    .filter(|(_, slot)| !slot.deletion_acknowledged)
                    .map(|(cluster, _)| cluster.clone())
                    .collect()
            })
            .unwrap_or_default();

        if pending.is_empty() {
            return self.remove_finalizer(&record).await;
        }

        debug!(record = %record.key(), waiting_for = ?pending, "Waiting for deletion acknowledgements");
        Ok(Action::requeue(self.config.validation_requeue))
    }
}

/// Worker pool over a deduplicating queue
pub struct Controller {
    reconciler: Arc<Reconciler>,
    store: Arc<dyn RecordStore>,
    queue: Arc<WorkQueue>,
    config: ControllerConfig,
}

impl Controller {
    pub fn new(reconciler: Reconciler) -> Self {
        let queue = Arc::new(WorkQueue::new());
        let config = reconciler.config.clone();
        let store = Arc::clone(&reconciler.store);

        Self {
            reconciler: Arc::new(reconciler.with_queue(Arc::clone(&queue))),
            store,
            queue,
            config,
        }
    }

    pub fn queue(&self) -> Arc<WorkQueue> {
        Arc::clone(&self.queue)
    }

    /// Queue every known record
    pub async fn resync(&self) -> Result<usize, StoreError> {
        let records = self.store.list(None).await?;
        let count = records.len();
        for record in records {
            self.queue.push(record.key());
        }
        Ok(count)
    }

    pub async fn run(self, cancel: CancellationToken) {
        let workers = self.config.workers.max(1);
        info!(workers, resync = ?self.config.resync, "Starting DNS controller");

        let handles: Vec<_> = (0..workers)
            .map(|id| {
                tokio::spawn(worker(
                    id,
                    Arc::clone(&self.reconciler),
                    Arc::clone(&self.queue),
                    self.config.clone(),
                    cancel.clone(),
                ))
            })
            .collect();

        let mut ticker = tokio::time::interval(self.config.resync);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => match self.resync().await {
                    Ok(count) => debug!(count, "Resynced records"),
                    Err(e) => error!(error = %e, "Failed to list records for resync"),
                },
            }
        }

        futures::future::join_all(handles).await;
        info!("DNS controller stopped");
    }
}

async fn worker(
    id: usize,
    reconciler: Arc<Reconciler>,
    queue: Arc<WorkQueue>,
    config: ControllerConfig,
    cancel: CancellationToken,
) {
    loop {
        let key = tokio::select! {
            _ = cancel.cancelled() => break,
            key = queue.pop() => key,
        };

        let result = tokio::select! {
            _ = cancel.cancelled() => {
                queue.done(&key);
                break;
            }
            result = tokio::time::timeout(config.reconcile_timeout, reconciler.reconcile(&key)) => result,
        };

        let action = match result {
            Ok(Ok(action)) => action,
            Ok(Err(e)) => {
                if e.is_transient() {
                    warn!(worker = id, record = %key, error = %e, "Reconcile error, retrying");
                } else {
                    error!(worker = id, record = %key, error = %e, "Reconcile error");
                }
                Action::requeue(e.requeue_after(&config))
            }
            Err(_) => {
                let e = ReconcileError::Timeout(config.reconcile_timeout);
                warn!(worker = id, record = %key, error = %e, "Reconcile timed out");
                Action::requeue(config.error_requeue)
            }
        };

        queue.done(&key);
        if let Some(after) = action.requeue_after() {
            queue.push_after(key, after);
        }
    }

    debug!(worker = id, "Worker stopped");
}
