//! End-to-end convergence scenarios against the in-memory provider and store

use chrono::{TimeZone, Utc};
use std::sync::Arc;
use std::time::Duration;

use lornu_dns_controller::controller::ManualClock;
use lornu_dns_controller::delegation::StaticTxtLookup;
use lornu_dns_controller::provider::{InMemoryProvider, StaticProviderFactory};
use lornu_dns_controller::record::{ConditionReason, DnsRecordSpec};
use lornu_dns_controller::store::{ClusterRegistry, InMemoryRecordStore};
use lornu_dns_controller::{
    ControllerConfig, DnsRecord, Endpoint, RecordKey, RecordStore, RecordType, Reconciler, Zone,
};

const ZONE_ID: &str = "zone-1";

struct World {
    provider: Arc<InMemoryProvider>,
    lookup: Arc<StaticTxtLookup>,
    clock: Arc<ManualClock>,
}

impl World {
    fn new() -> Self {
        Self {
            provider: Arc::new(InMemoryProvider::new().with_zone(Zone::new(ZONE_ID, "example.com"))),
            lookup: Arc::new(StaticTxtLookup::new()),
            clock: Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())),
        }
    }

    fn reconciler(&self, store: Arc<InMemoryRecordStore>, clusters: Arc<ClusterRegistry>) -> Reconciler {
        let factory = StaticProviderFactory::new()
            .with_provider("inmemory", self.provider.clone())
            .with_default("inmemory");
        let config = ControllerConfig {
            cluster_id: clusters.local_id().to_string(),
            ..Default::default()
        };

        Reconciler::new(store, Arc::new(factory), clusters, self.lookup.clone(), config).with_clock(self.clock.clone())
    }

    fn endpoint(&self, name: &str, record_type: RecordType) -> Option<Endpoint> {
        self.provider
            .snapshot(ZONE_ID)
            .into_iter()
            .find(|e| e.dns_name == name && e.record_type == record_type)
    }

    fn targets(&self, name: &str) -> Vec<String> {
        self.endpoint(name, RecordType::A).map(|e| e.targets).unwrap_or_default()
    }

    fn markers(&self, name: &str) -> Vec<String> {
        self.endpoint(&format!("kuadrant-a-{}", name), RecordType::TXT)
            .map(|e| e.targets)
            .unwrap_or_default()
    }

    fn settle(&self) {
        self.clock.advance(Duration::from_secs(5));
    }
}

fn spec(owner: &str, host: &str, target: &str) -> DnsRecordSpec {
    DnsRecordSpec {
        root_host: host.to_string(),
        endpoints: vec![Endpoint::new(host, RecordType::A, [target])],
        owner_id: Some(owner.to_string()),
        ..Default::default()
    }
}

async fn create(store: &InMemoryRecordStore, name: &str, spec: DnsRecordSpec) -> RecordKey {
    store.create(&DnsRecord::new("default", name, spec)).await.unwrap().key()
}

async fn reason(store: &InMemoryRecordStore, key: &RecordKey) -> Option<ConditionReason> {
    store.get(key).await.unwrap().status.and_then(|s| s.reason())
}

#[tokio::test]
async fn test_two_owners_share_a_hostname() {
    let world = World::new();
    let store = Arc::new(InMemoryRecordStore::new());
    let reconciler = world.reconciler(store.clone(), Arc::new(ClusterRegistry::new("home")));

    let first = create(&store, "owner1", spec("owner1", "foo.example.com", "1.1.1.1")).await;
    let second = create(&store, "owner2", spec("owner2", "foo.example.com", "2.2.2.2")).await;

    reconciler.reconcile(&first).await.unwrap();
    reconciler.reconcile(&second).await.unwrap();
    assert_eq!(reason(&store, &second).await, Some(ConditionReason::AwaitingValidation));

    world.settle();
    reconciler.reconcile(&first).await.unwrap();
    reconciler.reconcile(&second).await.unwrap();

    for key in [&first, &second] {
        let status = store.get(key).await.unwrap().status.unwrap();
        assert!(status.is_ready(), "{} not ready: {:?}", key, status.reason());

        let mut owners = status.domain_owners.clone();
        owners.sort();
        assert_eq!(owners, vec!["owner1", "owner2"]);
    }

    assert_eq!(world.targets("foo.example.com"), vec!["1.1.1.1", "2.2.2.2"]);
    assert_eq!(world.markers("foo.example.com").len(), 2);
}

#[tokio::test]
async fn test_converged_records_stay_idle() {
    let world = World::new();
    let store = Arc::new(InMemoryRecordStore::new());
    let reconciler = world.reconciler(store.clone(), Arc::new(ClusterRegistry::new("home")));
    let key = create(&store, "owner1", spec("owner1", "foo.example.com", "1.1.1.1")).await;

    reconciler.reconcile(&key).await.unwrap();
    world.settle();
    reconciler.reconcile(&key).await.unwrap();
    let applies = world.provider.apply_calls();

    world.clock.advance(Duration::from_secs(900));
    reconciler.reconcile(&key).await.unwrap();

    assert_eq!(world.provider.apply_calls(), applies);
    assert_eq!(reason(&store, &key).await, Some(ConditionReason::ProviderSuccess));
}

#[tokio::test]
async fn test_write_counter_counts_interference_and_resets() {
    let world = World::new();
    let store = Arc::new(InMemoryRecordStore::new());
    let reconciler = world.reconciler(store.clone(), Arc::new(ClusterRegistry::new("home")));
    let key = create(&store, "owner1", spec("owner1", "foo.example.com", "1.1.1.1")).await;
    let a_record = Endpoint::new("foo.example.com", RecordType::A, ["1.1.1.1"]).key();

    reconciler.reconcile(&key).await.unwrap();
    let mut counters = vec![store.get(&key).await.unwrap().status.unwrap().write_counter];

    for _ in 0..3 {
        world.provider.remove(ZONE_ID, &a_record);
        world.settle();
        reconciler.reconcile(&key).await.unwrap();
        counters.push(store.get(&key).await.unwrap().status.unwrap().write_counter);
    }
    assert_eq!(counters, vec![0, 1, 2, 3]);

    let mut record = store.get(&key).await.unwrap();
    record.spec.endpoints[0].targets = vec!["3.3.3.3".to_string()];
    store.update(&record).await.unwrap();

    reconciler.reconcile(&key).await.unwrap();
    let status = store.get(&key).await.unwrap().status.unwrap();
    assert_eq!(status.write_counter, 0);
    assert_eq!(status.observed_generation, 2);
    assert_eq!(world.targets("foo.example.com"), vec!["3.3.3.3"]);
}

#[tokio::test]
async fn test_delegated_contributions_merge_and_unmerge() {
    let world = World::new();
    let home = Arc::new(InMemoryRecordStore::new());
    let away = Arc::new(InMemoryRecordStore::new());

    let home_clusters = Arc::new(ClusterRegistry::new("home"));
    home_clusters.add_peer("away", away.clone());
    let reconciler = world.reconciler(home.clone(), home_clusters);
    let away_reconciler = world.reconciler(away.clone(), Arc::new(ClusterRegistry::new("away")));

    let delegated = |owner: &str, target: &str| DnsRecordSpec {
        delegate: true,
        ..spec(owner, "app.example.com", target)
    };
    let d1 = create(&home, "d1", delegated("d1", "1.1.1.1")).await;
    let mut d2_record = away
        .create(&DnsRecord::new("default", "d2", delegated("d2", "2.2.2.2")))
        .await
        .unwrap();
    d2_record.add_finalizer();
    let d2 = away.update(&d2_record).await.unwrap().key();

    reconciler.reconcile(&d1).await.unwrap();
    assert_eq!(reason(&home, &d1).await, Some(ConditionReason::Delegated));

    let authoritative = reconciler.authoritative_key("app.example.com");
    reconciler.reconcile(&authoritative).await.unwrap();
    assert_eq!(world.targets("app.example.com"), vec!["1.1.1.1", "2.2.2.2"]);

    let slots = away.get(&d2).await.unwrap().status.unwrap().remote_record_statuses;
    assert_eq!(slots["home"].status.zone_id, ZONE_ID);
    assert!(!slots["home"].deletion_acknowledged);

    away.delete(&d2).await.unwrap();
    away_reconciler.reconcile(&d2).await.unwrap();
    assert!(away.get(&d2).await.unwrap().is_deleting());

    reconciler.reconcile(&authoritative).await.unwrap();
    assert_eq!(world.targets("app.example.com"), vec!["1.1.1.1"]);

    away_reconciler.reconcile(&d2).await.unwrap();
    assert!(away.get(&d2).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_disconnected_peer_freezes_aggregate() {
    let world = World::new();
    let home = Arc::new(InMemoryRecordStore::new());
    let away = Arc::new(InMemoryRecordStore::new());
    let clusters = Arc::new(ClusterRegistry::new("home"));
    clusters.add_peer("away", away.clone());
    let reconciler = world.reconciler(home.clone(), clusters.clone());

    let delegated = |owner: &str, target: &str| DnsRecordSpec {
        delegate: true,
        ..spec(owner, "app.example.com", target)
    };
    let d1 = create(&home, "d1", delegated("d1", "1.1.1.1")).await;
    create(&away, "d2", delegated("d2", "2.2.2.2")).await;

    reconciler.reconcile(&d1).await.unwrap();
    let authoritative = reconciler.authoritative_key("app.example.com");
    reconciler.reconcile(&authoritative).await.unwrap();

    clusters.set_connected("away", false);
    world.settle();
    reconciler.reconcile(&authoritative).await.unwrap();

    assert_eq!(world.targets("app.example.com"), vec!["1.1.1.1", "2.2.2.2"]);
}

#[tokio::test]
async fn test_active_group_flip() {
    let world = World::new();
    let store = Arc::new(InMemoryRecordStore::new());
    let reconciler = world.reconciler(store.clone(), Arc::new(ClusterRegistry::new("home")));
    world
        .lookup
        .set("kuadrant-active-groups.example.com", vec!["\"groups=blue;version=1\"".to_string()]);

    let grouped = |owner: &str, target: &str, group: &str| DnsRecordSpec {
        group: Some(group.to_string()),
        ..spec(owner, "foo.example.com", target)
    };
    let blue = create(&store, "blue", grouped("blue", "1.1.1.1", "blue")).await;
    let green = create(&store, "green", grouped("green", "2.2.2.2", "green")).await;
    let plain = create(&store, "plain", spec("plain", "bar.example.com", "3.3.3.3")).await;

    for key in [&blue, &green, &plain] {
        reconciler.reconcile(key).await.unwrap();
    }
    world.settle();
    for key in [&blue, &green, &plain] {
        reconciler.reconcile(key).await.unwrap();
    }

    assert_eq!(world.targets("foo.example.com"), vec!["1.1.1.1"]);
    assert_eq!(world.targets("bar.example.com"), vec!["3.3.3.3"]);
    assert_eq!(store.get(&green).await.unwrap().status.unwrap().group_active, Some(false));

    world
        .lookup
        .set("kuadrant-active-groups.example.com", vec!["\"groups=green;version=1\"".to_string()]);
    reconciler.reconcile(&blue).await.unwrap();
    reconciler.reconcile(&green).await.unwrap();

    assert_eq!(world.targets("foo.example.com"), vec!["2.2.2.2"]);
    let markers = world.markers("foo.example.com");
    assert_eq!(markers.len(), 1);
    assert!(markers[0].contains("owner=green"));

    let applies = world.provider.apply_calls();
    reconciler.reconcile(&plain).await.unwrap();
    assert_eq!(world.provider.apply_calls(), applies);
    assert_eq!(world.targets("bar.example.com"), vec!["3.3.3.3"]);
}
