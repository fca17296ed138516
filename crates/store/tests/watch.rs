#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use flotilla_core::{BundleDeployment, BundleDeploymentSpec, LabelSelector, RequestContext};
use flotilla_persist::{codec, RecordStore, SqliteStore};
use flotilla_store::{BrokerConfig, Event, SubState, WatchBroker, WatchOptions, WatchStream};
use kube::ResourceExt;

fn fast() -> BrokerConfig {
    BrokerConfig { poll_interval: Duration::from_millis(20), ..BrokerConfig::default() }
}

fn bd(name: &str, labels: &[(&str, &str)]) -> BundleDeployment {
    let mut bd = BundleDeployment::new(name, BundleDeploymentSpec { deployment_id: "d1".into(), ..Default::default() });
    bd.metadata.namespace = Some("ns1".into());
    bd.metadata.uid = Some(format!("uid-{name}"));
    bd.metadata.generation = Some(1);
    bd.metadata.creation_timestamp = Some(codec::now());
    bd.metadata.labels =
        Some(labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect::<BTreeMap<_, _>>());
    bd
}

fn create(store: &SqliteStore, obj: &BundleDeployment) -> i64 {
    store.create(codec::encode(obj).unwrap()).unwrap().resource_version
}

fn update(store: &SqliteStore, obj: &BundleDeployment) -> i64 {
    store.update(codec::encode(obj).unwrap(), None).unwrap().resource_version
}

async fn next(stream: &mut WatchStream) -> Event {
    tokio::time::timeout(Duration::from_secs(2), stream.recv())
        .await
        .expect("timed out waiting for watch event")
        .expect("watch closed")
}

async fn quiet(stream: &mut WatchStream, wait: Duration) -> bool {
    tokio::time::timeout(wait, stream.recv()).await.is_err()
}

fn name_of(ev: &Event) -> (&'static str, String) {
    match ev {
        Event::Added(o) => ("added", o.name_any()),
        Event::Modified(o) => ("modified", o.name_any()),
        Event::Deleted(o) => ("deleted", o.name_any()),
        _ => ("other", String::new()),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn replay_then_live() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    for n in ["a", "b", "c"] {
        create(&store, &bd(n, &[]));
    }
    let broker = WatchBroker::start(Arc::clone(&store), fast());
    let mut stream = broker.watch(&RequestContext::new(), WatchOptions::default());

    let mut replayed = Vec::new();
    for _ in 0..3 {
        let ev = next(&mut stream).await;
        let (kind, name) = name_of(&ev);
        assert_eq!(kind, "added");
        replayed.push(name);
    }
    replayed.sort();
    assert_eq!(replayed, vec!["a", "b", "c"]);

    let mut b = bd("b", &[]);
    b.spec.deployment_id = "d2".into();
    let rv = update(&store, &b);
    match next(&mut stream).await {
        Event::Modified(o) => {
            assert_eq!(o.name_any(), "b");
            assert_eq!(o.spec.deployment_id, "d2");
            assert_eq!(o.resource_version(), Some(rv.to_string()));
        }
        other => panic!("expected Modified, got {:?}", name_of(&other)),
    }
    assert_eq!(broker.subscription_state(stream.id()), Some(SubState::Polling));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn label_filter_applies_to_replay_and_live_but_not_deletes() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    create(&store, &bd("prod-1", &[("env", "prod")]));
    create(&store, &bd("dev-1", &[("env", "dev")]));
    create(&store, &bd("bare", &[]));
    let broker = WatchBroker::start(Arc::clone(&store), fast());
    let opts = WatchOptions { selector: LabelSelector::parse("env=prod").unwrap(), ..Default::default() };
    let mut stream = broker.watch(&RequestContext::new(), opts);

    assert_eq!(name_of(&next(&mut stream).await), ("added", "prod-1".to_string()));

    update(&store, &bd("dev-1", &[("env", "dev"), ("x", "y")]));
    assert!(quiet(&mut stream, Duration::from_millis(150)).await);

    // Leaving the selector produces no event at all.
    update(&store, &bd("prod-1", &[("env", "dev")]));
    assert!(quiet(&mut stream, Duration::from_millis(150)).await);

    store.delete("ns1", "dev-1").unwrap();
    match next(&mut stream).await {
        Event::Deleted(o) => {
            assert_eq!(o.name_any(), "dev-1");
            assert_eq!(o.namespace().as_deref(), Some("ns1"));
            assert!(o.labels().is_empty());
        }
        other => panic!("expected Deleted, got {:?}", name_of(&other)),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn start_version_skips_older_events() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    create(&store, &bd("old", &[]));
    let since = create(&store, &bd("older", &[]));
    let broker = WatchBroker::start(Arc::clone(&store), fast());
    let opts = WatchOptions { resource_version: since, ..Default::default() };
    let mut stream = broker.watch(&RequestContext::new(), opts);

    create(&store, &bd("new", &[]));
    assert_eq!(name_of(&next(&mut stream).await), ("added", "new".to_string()));
    assert!(quiet(&mut stream, Duration::from_millis(100)).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn full_channel_drops_instead_of_blocking() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let since = create(&store, &bd("seed", &[]));
    let cfg = BrokerConfig { channel_capacity: 1, ..fast() };
    let broker = WatchBroker::start(Arc::clone(&store), cfg);
    let mut stream = broker.watch(&RequestContext::new(), WatchOptions { resource_version: since, ..Default::default() });

    for i in 0..5 {
        create(&store, &bd(&format!("o{i}"), &[]));
    }
    tokio::time::sleep(Duration::from_millis(200)).await;
    let _first = next(&mut stream).await;
    assert!(quiet(&mut stream, Duration::from_millis(100)).await);

    // Dropped events are not redelivered; later writes still arrive.
    create(&store, &bd("after", &[]));
    assert_eq!(name_of(&next(&mut stream).await), ("added", "after".to_string()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn trimmed_events_are_skipped() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap().with_retention(2));
    for i in 0..5 {
        create(&store, &bd(&format!("o{i}"), &[]));
    }
    let broker = WatchBroker::start(Arc::clone(&store), fast());
    let mut stream = broker.watch(&RequestContext::new(), WatchOptions { resource_version: 1, ..Default::default() });

    assert_eq!(name_of(&next(&mut stream).await), ("added", "o3".to_string()));
    assert_eq!(name_of(&next(&mut stream).await), ("added", "o4".to_string()));
    assert!(quiet(&mut stream, Duration::from_millis(100)).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancelling_context_removes_subscription() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let broker = WatchBroker::start(Arc::clone(&store), fast());
    let ctx = RequestContext::namespaced("ns1");
    let mut stream = broker.watch(&ctx, WatchOptions { resource_version: 1, ..Default::default() });
    let _other = broker.watch(&RequestContext::new(), WatchOptions { resource_version: 1, ..Default::default() });
    assert_eq!(broker.subscriber_count(), 2);

    ctx.cancel.cancel();
    let closed = tokio::time::timeout(Duration::from_secs(2), stream.recv()).await.unwrap();
    assert!(closed.is_none());
    assert_eq!(broker.subscriber_count(), 1);
    assert_eq!(broker.subscription_state(stream.id()), None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_closes_every_stream() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    create(&store, &bd("a", &[]));
    let broker = WatchBroker::start(Arc::clone(&store), fast());
    let mut s1 = broker.watch(&RequestContext::new(), WatchOptions { resource_version: 1, ..Default::default() });
    let mut s2 = broker.watch(&RequestContext::new(), WatchOptions { resource_version: 1, ..Default::default() });

    broker.stop();
    broker.stop();
    assert_eq!(broker.subscriber_count(), 0);
    for s in [&mut s1, &mut s2] {
        let end = tokio::time::timeout(Duration::from_secs(2), s.recv()).await.unwrap();
        assert!(end.is_none());
    }
    let mut late = broker.watch(&RequestContext::new(), WatchOptions::default());
    assert!(late.recv().await.is_none());
}
