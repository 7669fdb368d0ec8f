//! Shared map behaviour: last writer wins per key, key change sets.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tandem::Any;
use tandem::ArrayRef;
use tandem::Doc;
use tandem::EntryChange;
use tandem::Error;
use tandem::MapRef;
use tandem::Out;
use tandem::PathSegment;
use tracing_subscriber::EnvFilter;

#[ctor::ctor]
fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("tandem=info".parse().unwrap()))
        .with_test_writer()
        .try_init();
}

// =============================================================================
// Helpers
// =============================================================================

fn sync(from: &Doc, to: &Doc) {
    let remote = to.transact().unwrap().state_vector();
    let update = from.transact().unwrap().encode_state_as_update_v1(&remote);
    to.transact().unwrap().apply_update_v1(&update).unwrap();
}

fn json(doc: &Doc, map: &MapRef) -> String {
    let txn = doc.transact().unwrap();
    return map.to_json(&txn).to_string();
}

fn text(value: &str) -> Out {
    return Out::Any(Any::from(value));
}

// =============================================================================
// Local edits
// =============================================================================

#[test]
fn set_and_overwrite() {
    let doc = Doc::with_client_id(1);
    let map = doc.get_map("map").unwrap();

    map.insert(&mut doc.transact().unwrap(), "k1", "v1").unwrap();
    map.insert(&mut doc.transact().unwrap(), "k1", "v2").unwrap();
    map.insert(&mut doc.transact().unwrap(), "k2", 2).unwrap();

    let txn = doc.transact().unwrap();
    assert_eq!(map.get(&txn, "k1"), Some(text("v2")));
    assert_eq!(map.get(&txn, "missing"), None);
    assert!(map.contains_key(&txn, "k2"));
    assert_eq!(map.len(&txn), 2);
    let keys: Vec<String> = map.keys(&txn).iter().map(|k| k.to_string()).collect();
    assert_eq!(keys, vec!["k1", "k2"]);
}

#[test]
fn clear_removes_every_key() {
    let doc = Doc::with_client_id(1);
    let map = doc.get_map("map").unwrap();
    let mut txn = doc.transact().unwrap();
    map.insert(&mut txn, "a", 1).unwrap();
    map.insert(&mut txn, "b", ArrayRef::with_values([1])).unwrap();
    map.clear(&mut txn).unwrap();
    assert!(map.is_empty(&txn));
    assert_eq!(map.to_json(&txn).to_string(), "{}");
}

#[test]
fn observing_a_prelim_fails() {
    let map = MapRef::new();
    let err = map.observe(|_, _| {}).unwrap_err();
    assert!(matches!(err, Error::NotIntegrated));
}

// =============================================================================
// Sync
// =============================================================================

#[test]
fn map_syncs_between_replicas() {
    let d1 = Doc::with_client_id(1);
    let d2 = Doc::with_client_id(2);
    let m1 = d1.get_map("map").unwrap();
    let m2 = d2.get_map("map").unwrap();

    {
        let mut txn = d1.transact().unwrap();
        m1.insert(&mut txn, "name", "tandem").unwrap();
        m1.insert(&mut txn, "nested", MapRef::with_entries([("depth", 1)])).unwrap();
        m1.insert(&mut txn, "list", ArrayRef::with_values(["a", "b"])).unwrap();
    }
    sync(&d1, &d2);

    let expected = r#"{"list":["a","b"],"name":"tandem","nested":{"depth":1}}"#;
    assert_eq!(json(&d1, &m1), expected);
    assert_eq!(json(&d2, &m2), expected);

    m2.remove(&mut d2.transact().unwrap(), "name").unwrap();
    sync(&d2, &d1);
    assert_eq!(json(&d1, &m1), r#"{"list":["a","b"],"nested":{"depth":1}}"#);
}

#[test]
fn concurrent_sets_resolve_to_higher_client() {
    let d1 = Doc::with_client_id(1);
    let d2 = Doc::with_client_id(2);
    let m1 = d1.get_map("map").unwrap();
    let m2 = d2.get_map("map").unwrap();

    m1.insert(&mut d1.transact().unwrap(), "key", "from 1").unwrap();
    m2.insert(&mut d2.transact().unwrap(), "key", "from 2").unwrap();
    sync(&d1, &d2);
    sync(&d2, &d1);

    let t1 = d1.transact().unwrap();
    assert_eq!(m1.get(&t1, "key"), Some(text("from 2")));
    drop(t1);
    let t2 = d2.transact().unwrap();
    assert_eq!(m2.get(&t2, "key"), Some(text("from 2")));
}

#[test]
fn concurrent_set_and_remove() {
    let d1 = Doc::with_client_id(1);
    let d2 = Doc::with_client_id(2);
    let m1 = d1.get_map("map").unwrap();
    let m2 = d2.get_map("map").unwrap();

    m1.insert(&mut d1.transact().unwrap(), "key", 1).unwrap();
    sync(&d1, &d2);

    // The removal only covers the entry it saw; the concurrent set survives.
    m1.remove(&mut d1.transact().unwrap(), "key").unwrap();
    m2.insert(&mut d2.transact().unwrap(), "key", 2).unwrap();
    sync(&d1, &d2);
    sync(&d2, &d1);

    assert_eq!(json(&d1, &m1), r#"{"key":2}"#);
    assert_eq!(json(&d2, &m2), r#"{"key":2}"#);
}

// =============================================================================
// Events
// =============================================================================

#[test]
fn key_changes() {
    let doc = Doc::with_client_id(1);
    let map = doc.get_map("map").unwrap();
    let keys: Arc<Mutex<HashMap<Arc<str>, EntryChange>>> = Arc::new(Mutex::new(HashMap::new()));
    let sink = keys.clone();
    let _subscription = map
        .observe(move |_, event| {
            *sink.lock() = event.keys().clone();
        })
        .unwrap();

    {
        let mut txn = doc.transact().unwrap();
        map.insert(&mut txn, "a", "x").unwrap();
        map.insert(&mut txn, "b", "y").unwrap();
    }
    {
        let changes = keys.lock();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes.get("a"), Some(&EntryChange::Inserted(text("x"))));
    }

    {
        let mut txn = doc.transact().unwrap();
        map.insert(&mut txn, "a", "z").unwrap();
        map.remove(&mut txn, "b").unwrap();
    }
    {
        let changes = keys.lock();
        assert_eq!(changes.get("a"), Some(&EntryChange::Updated(text("x"), text("z"))));
        assert_eq!(changes.get("b"), Some(&EntryChange::Removed(text("y"))));
    }

    // Set and removed within one transaction: no net change for the key.
    {
        let mut txn = doc.transact().unwrap();
        map.insert(&mut txn, "c", 1).unwrap();
        map.remove(&mut txn, "c").unwrap();
        map.insert(&mut txn, "a", "w").unwrap();
    }
    let changes = keys.lock();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes.get("a"), Some(&EntryChange::Updated(text("z"), text("w"))));
}

#[test]
fn deep_paths_use_keys() {
    let doc = Doc::with_client_id(1);
    let root = doc.get_map("root").unwrap();
    let inner = MapRef::new();
    let list = ArrayRef::new();
    {
        let mut txn = doc.transact().unwrap();
        root.insert(&mut txn, "inner", inner.clone()).unwrap();
        inner.insert(&mut txn, "list", list.clone()).unwrap();
    }

    let paths = Arc::new(Mutex::new(Vec::new()));
    let sink = paths.clone();
    let _subscription = root
        .observe_deep(move |_, events| {
            sink.lock().extend(events.iter().map(|event| event.path().to_vec()));
        })
        .unwrap();

    list.push(&mut doc.transact().unwrap(), 1).unwrap();
    assert_eq!(
        *paths.lock(),
        vec![vec![PathSegment::Key("inner".into()), PathSegment::Key("list".into())]]
    );
}

#[test]
fn remote_changes_fire_events() {
    let d1 = Doc::with_client_id(1);
    let d2 = Doc::with_client_id(2);
    let m1 = d1.get_map("map").unwrap();
    let m2 = d2.get_map("map").unwrap();

    let fired = Arc::new(Mutex::new(0));
    let sink = fired.clone();
    let _subscription = m2
        .observe(move |_, event| {
            assert!(event.keys().contains_key("k"));
            *sink.lock() += 1;
        })
        .unwrap();

    m1.insert(&mut d1.transact().unwrap(), "k", true).unwrap();
    sync(&d1, &d2);
    // Applying the same update again changes nothing.
    sync(&d1, &d2);
    assert_eq!(*fired.lock(), 1);
}
