#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};

use kwatch_core::{Delta, Handler, Object, ObjectKey, ResourceKind};
use kwatch_store::{DeltaQueue, Dispatcher, IndexedStore, StoreReader};
use tokio_util::sync::CancellationToken;

fn obj(ns: &str, name: &str, rv: &str) -> Object {
    Object::new(ResourceKind::Pod, ObjectKey::namespaced(ns, name), rv, serde_json::json!({ "rv": rv }))
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Seen {
    Create(String, String),
    Update(String, String, String),
    Delete(String, String),
}

/// Records every call; optionally fails or panics on a given key, and captures what the
/// store held for the key while the handler ran.
#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<Seen>>,
    fail_on: Option<String>,
    panic_on: Option<String>,
    store: Mutex<Option<StoreReader>>,
    observed_in_store: Mutex<Vec<Option<String>>>,
}

impl Recorder {
    fn seen(&self) -> Vec<Seen> { self.seen.lock().unwrap().clone() }

    fn check(&self, key: &ObjectKey) -> anyhow::Result<()> {
        if let Some(store) = self.store.lock().unwrap().as_ref() {
            let rv = store.get(key).map(|o| o.resource_version.to_string());
            self.observed_in_store.lock().unwrap().push(rv);
        }
        let k = key.to_string();
        if self.panic_on.as_deref() == Some(k.as_str()) {
            panic!("handler blew up on {}", k);
        }
        if self.fail_on.as_deref() == Some(k.as_str()) {
            anyhow::bail!("refusing {}", k);
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Handler for Recorder {
    async fn on_create(&self, obj: &Object) -> anyhow::Result<()> {
        self.seen.lock().unwrap().push(Seen::Create(obj.key.to_string(), obj.resource_version.to_string()));
        self.check(&obj.key)
    }

    async fn on_update(&self, old: &Object, new: &Object) -> anyhow::Result<()> {
        self.seen.lock().unwrap().push(Seen::Update(
            new.key.to_string(),
            old.resource_version.to_string(),
            new.resource_version.to_string(),
        ));
        self.check(&new.key)
    }

    async fn on_delete(&self, obj: &Object) -> anyhow::Result<()> {
        self.seen.lock().unwrap().push(Seen::Delete(obj.key.to_string(), obj.resource_version.to_string()));
        self.check(&obj.key)
    }
}

/// Push everything, close the queue and drain it to completion.
async fn drain(store: IndexedStore, handler: Arc<Recorder>, deltas: Vec<Delta>) -> StoreReader {
    let queue = DeltaQueue::new();
    for d in deltas {
        queue.push(d);
    }
    queue.close();
    let dispatcher = Dispatcher::new(ResourceKind::Pod, queue, store, handler);
    let reader = dispatcher.reader();
    dispatcher.run(CancellationToken::new()).await;
    reader
}

#[tokio::test]
async fn coalesced_batch_delivers_only_terminal_state() {
    let rec = Arc::new(Recorder::default());
    let reader = drain(
        IndexedStore::new(),
        rec.clone(),
        vec![
            Delta::added(obj("ns", "k", "1")),
            Delta::modified(obj("ns", "k", "2")),
            Delta::modified(obj("ns", "k", "3")),
        ],
    )
    .await;
    assert_eq!(rec.seen(), vec![Seen::Create("ns/k".into(), "3".into())]);
    assert_eq!(reader.get(&ObjectKey::namespaced("ns", "k")).unwrap().resource_version.as_str(), "3");
}

#[tokio::test]
async fn coalesced_batch_over_prior_entry_is_one_update() {
    let mut store = IndexedStore::new();
    let prior = obj("ns", "k", "0");
    let key = prior.key.clone();
    store.apply(&key, Some(Arc::new(prior)));
    let rec = Arc::new(Recorder::default());
    drain(
        store,
        rec.clone(),
        vec![
            Delta::added(obj("ns", "k", "1")),
            Delta::modified(obj("ns", "k", "2")),
            Delta::modified(obj("ns", "k", "3")),
        ],
    )
    .await;
    assert_eq!(rec.seen(), vec![Seen::Update("ns/k".into(), "0".into(), "3".into())]);
}

#[tokio::test]
async fn watch_delete_reports_last_known_value() {
    let mut store = IndexedStore::new();
    let v1 = obj("ns", "b", "1");
    let key = v1.key.clone();
    store.apply(&key, Some(Arc::new(v1)));
    let rec = Arc::new(Recorder::default());
    // the deletion payload carries a newer version than the stored one
    let reader = drain(store, rec.clone(), vec![Delta::deleted(obj("ns", "b", "7"))]).await;
    assert_eq!(rec.seen(), vec![Seen::Delete("ns/b".into(), "1".into())]);
    assert!(reader.get(&ObjectKey::namespaced("ns", "b")).is_none());
}

#[tokio::test]
async fn delete_of_unknown_key_is_a_no_op() {
    let rec = Arc::new(Recorder::default());
    let reader = drain(
        IndexedStore::new(),
        rec.clone(),
        vec![Delta::added(obj("ns", "x", "1")), Delta::deleted(obj("ns", "x", "1")), Delta::deleted(obj("ns", "y", "4"))],
    )
    .await;
    assert!(rec.seen().is_empty());
    assert!(reader.is_empty());
}

#[tokio::test]
async fn per_key_order_is_preserved_across_drains() {
    let queue = DeltaQueue::new();
    let rec = Arc::new(Recorder::default());
    let mut dispatcher = Dispatcher::new(ResourceKind::Pod, queue.clone(), IndexedStore::new(), rec.clone());

    queue.push(Delta::added(obj("ns", "a", "1")));
    queue.push(Delta::added(obj("ns", "b", "1")));
    for _ in 0..2 {
        let batch = queue.try_pop().unwrap();
        let key = batch.key.clone();
        dispatcher.process(batch).await;
        queue.done(&key);
    }
    queue.push(Delta::modified(obj("ns", "a", "2")));
    queue.push(Delta::deleted(obj("ns", "b", "1")));
    queue.push(Delta::modified(obj("ns", "a", "3")));
    while let Some(batch) = queue.try_pop() {
        let key = batch.key.clone();
        dispatcher.process(batch).await;
        queue.done(&key);
    }

    let for_a: Vec<Seen> = rec.seen().into_iter().filter(|s| matches!(s, Seen::Create(k, _) | Seen::Update(k, _, _) | Seen::Delete(k, _) if k == "ns/a")).collect();
    assert_eq!(for_a, vec![Seen::Create("ns/a".into(), "1".into()), Seen::Update("ns/a".into(), "1".into(), "3".into())]);
    assert!(rec.seen().contains(&Seen::Delete("ns/b".into(), "1".into())));
}

#[tokio::test]
async fn failing_or_panicking_handler_does_not_block_other_keys() {
    let rec = Arc::new(Recorder {
        fail_on: Some("ns/bad".into()),
        panic_on: Some("ns/worse".into()),
        ..Default::default()
    });
    let reader = drain(
        IndexedStore::new(),
        rec.clone(),
        vec![
            Delta::added(obj("ns", "bad", "1")),
            Delta::added(obj("ns", "worse", "1")),
            Delta::added(obj("ns", "good", "1")),
        ],
    )
    .await;
    let seen = rec.seen();
    assert_eq!(seen.len(), 3);
    assert_eq!(seen[2], Seen::Create("ns/good".into(), "1".into()));
    // failures are not retried, and the store still advances
    assert_eq!(reader.len(), 3);
}

#[tokio::test]
async fn handler_observes_pre_transition_state() {
    let mut store = IndexedStore::new();
    let v1 = obj("ns", "a", "1");
    let key = v1.key.clone();
    store.apply(&key, Some(Arc::new(v1)));
    let rec = Arc::new(Recorder::default());
    *rec.store.lock().unwrap() = Some(store.reader());

    drain(
        store,
        rec.clone(),
        vec![Delta::added(obj("ns", "new", "1")), Delta::modified(obj("ns", "a", "2"))],
    )
    .await;
    let observed = rec.observed_in_store.lock().unwrap().clone();
    assert_eq!(observed, vec![None, Some("1".to_string())]);
}

#[tokio::test]
async fn cancelled_loop_stops_while_waiting() {
    let queue = DeltaQueue::new();
    let rec = Arc::new(Recorder::default());
    let dispatcher = Dispatcher::new(ResourceKind::Pod, queue.clone(), IndexedStore::new(), rec);
    let token = CancellationToken::new();
    let task = tokio::spawn(dispatcher.run(token.clone()));
    tokio::task::yield_now().await;
    token.cancel();
    tokio::time::timeout(std::time::Duration::from_secs(1), task).await.unwrap().unwrap();
}
