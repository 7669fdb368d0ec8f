//! Shared array behaviour: local edits, sync between replicas, deltas.

use std::sync::Arc;

use parking_lot::Mutex;
use tandem::Any;
use tandem::ArrayRef;
use tandem::Change;
use tandem::Doc;
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

/// Bring every document up to date with every other one.
fn exchange_updates(docs: &[&Doc]) {
    for a in docs {
        for b in docs {
            if std::ptr::eq(*a, *b) {
                continue;
            }
            let remote = b.transact().unwrap().state_vector();
            let update = a.transact().unwrap().encode_state_as_update_v1(&remote);
            b.transact().unwrap().apply_update_v1(&update).unwrap();
        }
    }
}

fn json(doc: &Doc, array: &ArrayRef) -> String {
    let txn = doc.transact().unwrap();
    return array.to_json(&txn).to_string();
}

fn num(value: f64) -> Out {
    return Out::Any(Any::Number(value));
}

// =============================================================================
// Inserts
// =============================================================================

#[test]
fn inserts() {
    let d1 = Doc::with_client_id(1);
    assert_eq!(d1.client_id(), 1);
    let x = d1.get_array("test").unwrap();

    {
        let mut txn = d1.transact().unwrap();
        let values: Vec<tandem::In> = vec![
            1.into(),
            2.5.into(),
            "hello".into(),
            vec!["world"].into(),
            true.into(),
        ];
        x.insert_range(&mut txn, 0, values).unwrap();
    }
    {
        let mut txn = d1.transact().unwrap();
        let object: std::collections::BTreeMap<String, Any> = [("key".to_string(), Any::from("value"))].into();
        x.push(&mut txn, Any::from(object)).unwrap();
    }

    let expected = r#"[1,2.5,"hello",["world"],true,{"key":"value"}]"#;
    assert_eq!(json(&d1, &x), expected);

    let d2 = Doc::with_client_id(2);
    let y = d2.get_array("test").unwrap();
    exchange_updates(&[&d1, &d2]);
    assert_eq!(json(&d2, &y), expected);
}

#[test]
fn inserts_nested() {
    let d1 = Doc::with_client_id(1);
    let x = d1.get_array("test").unwrap();

    let nested = ArrayRef::new();
    {
        let mut txn = d1.transact().unwrap();
        nested.push(&mut txn, "world").unwrap();
    }
    {
        let mut txn = d1.transact().unwrap();
        let values: Vec<tandem::In> = vec![1.into(), 2.into(), nested.clone().into(), 3.into(), 4.into()];
        x.insert_range(&mut txn, 0, values).unwrap();
    }
    {
        let mut txn = d1.transact().unwrap();
        nested.insert(&mut txn, 0, "hello").unwrap();
    }

    let expected = r#"[1,2,["hello","world"],3,4]"#;
    assert_eq!(json(&d1, &x), expected);

    let d2 = Doc::with_client_id(2);
    let y = d2.get_array("test").unwrap();
    exchange_updates(&[&d1, &d2]);
    assert_eq!(json(&d2, &y), expected);
}

#[test]
fn delete() {
    let d1 = Doc::with_client_id(1);
    let x = d1.get_array("test").unwrap();

    {
        let mut txn = d1.transact().unwrap();
        let values: Vec<tandem::In> = vec![1.into(), 2.into(), vec!["hello", "world"].into(), true.into()];
        x.insert_range(&mut txn, 0, values).unwrap();
    }
    {
        let mut txn = d1.transact().unwrap();
        x.remove_range(&mut txn, 1, 2).unwrap();
    }

    assert_eq!(json(&d1, &x), "[1,true]");

    let d2 = Doc::with_client_id(2);
    let y = d2.get_array("test").unwrap();
    exchange_updates(&[&d1, &d2]);
    assert_eq!(json(&d2, &y), "[1,true]");
}

#[test]
fn get() {
    let d1 = Doc::with_client_id(1);
    let x = d1.get_array("test").unwrap();

    {
        let mut txn = d1.transact().unwrap();
        let values: Vec<tandem::In> = vec![1.into(), 2.into(), true.into()];
        x.insert_range(&mut txn, 0, values).unwrap();
    }
    {
        let mut txn = d1.transact().unwrap();
        x.insert_range(&mut txn, 1, ["hello", "world"]).unwrap();
    }

    let txn = d1.transact().unwrap();
    assert_eq!(x.get(&txn, 0).unwrap(), num(1.0));
    assert_eq!(x.get(&txn, 1).unwrap(), Out::Any(Any::from("hello")));
    assert_eq!(x.get(&txn, 2).unwrap(), Out::Any(Any::from("world")));
    assert_eq!(x.get(&txn, 3).unwrap(), num(2.0));
    assert_eq!(x.get(&txn, 4).unwrap(), Out::Any(Any::Bool(true)));

    let err = x.get(&txn, 5).unwrap_err();
    assert!(matches!(err, Error::OutOfRange { index: 5, len: 5 }));
}

#[test]
fn iterator() {
    let d1 = Doc::with_client_id(1);
    let x = d1.get_array("test").unwrap();

    let mut txn = d1.transact().unwrap();
    x.insert_range(&mut txn, 0, [1, 2, 3]).unwrap();
    assert_eq!(x.len(&txn), 3);

    for (i, value) in x.iter(&txn).enumerate() {
        assert_eq!(value, num((i + 1) as f64));
    }
}

#[test]
fn insert_out_of_range() {
    let doc = Doc::with_client_id(1);
    let x = doc.get_array("test").unwrap();
    let mut txn = doc.transact().unwrap();
    x.push_range(&mut txn, [1, 2]).unwrap();

    let err = x.insert(&mut txn, 3, 0).unwrap_err();
    assert!(matches!(err, Error::OutOfRange { index: 3, len: 2 }));
    assert_eq!(x.to_json(&txn).to_string(), "[1,2]");
}

#[test]
fn writes_after_commit_fail() {
    let doc = Doc::with_client_id(1);
    let x = doc.get_array("test").unwrap();
    let mut txn = doc.transact().unwrap();
    x.push(&mut txn, 1).unwrap();
    txn.commit();

    assert!(txn.is_committed());
    let err = x.push(&mut txn, 2).unwrap_err();
    assert!(matches!(err, Error::NoActiveTransaction));
    let err = x.remove(&mut txn, 0).unwrap_err();
    assert!(matches!(err, Error::NoActiveTransaction));
}

#[test]
fn foreign_document_is_rejected() {
    let d1 = Doc::with_client_id(1);
    let d2 = Doc::with_client_id(2);
    let x = d1.get_array("test").unwrap();

    let mut txn = d2.transact().unwrap();
    let err = x.push(&mut txn, 1).unwrap_err();
    assert!(matches!(err, Error::ForeignDocument));
}

// =============================================================================
// Concurrency
// =============================================================================

#[test]
fn concurrent_inserts_at_same_index_converge() {
    let d1 = Doc::with_client_id(1);
    let d2 = Doc::with_client_id(2);
    let a = d1.get_array("test").unwrap();
    let b = d2.get_array("test").unwrap();

    a.push_range(&mut d1.transact().unwrap(), ["x", "y"]).unwrap();
    exchange_updates(&[&d1, &d2]);

    a.insert_range(&mut d1.transact().unwrap(), 1, ["a1", "a2"]).unwrap();
    b.insert_range(&mut d2.transact().unwrap(), 1, ["b1", "b2"]).unwrap();
    exchange_updates(&[&d1, &d2]);

    // Lower client ids go first; runs never interleave.
    let expected = r#"["x","a1","a2","b1","b2","y"]"#;
    assert_eq!(json(&d1, &a), expected);
    assert_eq!(json(&d2, &b), expected);
}

#[test]
fn concurrent_delete_and_insert() {
    let d1 = Doc::with_client_id(1);
    let d2 = Doc::with_client_id(2);
    let a = d1.get_array("test").unwrap();
    let b = d2.get_array("test").unwrap();

    a.push_range(&mut d1.transact().unwrap(), [1, 2, 3]).unwrap();
    exchange_updates(&[&d1, &d2]);

    a.remove_range(&mut d1.transact().unwrap(), 0, 3).unwrap();
    b.insert(&mut d2.transact().unwrap(), 2, 9).unwrap();
    b.remove(&mut d2.transact().unwrap(), 0).unwrap();
    exchange_updates(&[&d1, &d2]);

    assert_eq!(json(&d1, &a), "[9]");
    assert_eq!(json(&d2, &b), "[9]");
}

// =============================================================================
// Observers
// =============================================================================

#[test]
fn observer() {
    let d1 = Doc::with_client_id(1);
    let x = d1.get_array("test").unwrap();

    let seen: Arc<Mutex<Option<(String, Vec<Change>)>>> = Arc::new(Mutex::new(None));
    let sink = seen.clone();
    let subscription = x
        .observe(move |txn, event| {
            let target = event.target().to_json(txn).to_string();
            *sink.lock() = Some((target, event.delta().to_vec()));
        })
        .unwrap();

    // Insert into an empty array.
    x.insert_range(&mut d1.transact().unwrap(), 0, [1, 2, 3, 4]).unwrap();
    let (target, delta) = seen.lock().take().unwrap();
    assert_eq!(target, json(&d1, &x));
    assert_eq!(delta, vec![Change::Added(vec![num(1.0), num(2.0), num(3.0), num(4.0)])]);

    // Remove two items from the middle.
    x.remove_range(&mut d1.transact().unwrap(), 1, 2).unwrap();
    let (target, delta) = seen.lock().take().unwrap();
    assert_eq!(target, json(&d1, &x));
    assert_eq!(delta, vec![Change::Retain(1), Change::Removed(2)]);

    // Insert in the middle.
    x.insert(&mut d1.transact().unwrap(), 1, 5).unwrap();
    let (target, delta) = seen.lock().take().unwrap();
    assert_eq!(target, json(&d1, &x));
    assert_eq!(delta, vec![Change::Retain(1), Change::Added(vec![num(5.0)])]);

    // A freed observer is not called anymore.
    subscription.free().unwrap();
    x.insert(&mut d1.transact().unwrap(), 1, 6).unwrap();
    assert!(seen.lock().is_none());
}

#[test]
fn observe_deep_event_order() {
    let d1 = Doc::with_client_id(1);
    let arr = d1.get_array("array").unwrap();

    let paths: Arc<Mutex<Vec<Vec<PathSegment>>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = paths.clone();
    let subscription = arr
        .observe_deep(move |_, events| {
            *sink.lock() = events.iter().map(|event| event.path().to_vec()).collect();
        })
        .unwrap();

    arr.insert(&mut d1.transact().unwrap(), 0, MapRef::new()).unwrap();
    {
        let mut txn = d1.transact().unwrap();
        let Out::Map(map) = arr.get(&txn, 0).unwrap() else {
            panic!("expected a map at index 0");
        };
        map.insert(&mut txn, "a", "a").unwrap();
        arr.insert(&mut txn, 0, 0).unwrap();
    }

    assert_eq!(*paths.lock(), vec![vec![], vec![PathSegment::Index(1)]]);
    subscription.free().unwrap();
}

#[test]
fn events_of_created_types_are_reported_on_the_parent() {
    let doc = Doc::with_client_id(1);
    let arr = doc.get_array("array").unwrap();
    let calls = Arc::new(Mutex::new(Vec::new()));
    let sink = calls.clone();
    let _subscription = arr
        .observe_deep(move |_, events| {
            sink.lock().push(events.len());
        })
        .unwrap();

    let nested = ArrayRef::with_values([MapRef::with_entries([("k", 1)])]);
    arr.push(&mut doc.transact().unwrap(), nested).unwrap();
    assert_eq!(*calls.lock(), vec![1]);
}
