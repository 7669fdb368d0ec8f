//! Update exchange: diff sync, out-of-order delivery, idempotence,
//! atomic rejection and compaction.

use std::sync::Arc;

use parking_lot::Mutex;
use tandem::Decode;
use tandem::Doc;
use tandem::Encode;
use tandem::Error;
use tandem::MapRef;
use tandem::Options;
use tandem::StateVector;
use tandem::Update;
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

/// Record the update of every commit on `doc`.
fn record_updates(doc: &Doc) -> (Arc<Mutex<Vec<Vec<u8>>>>, tandem::Subscription) {
    let updates = Arc::new(Mutex::new(Vec::new()));
    let sink = updates.clone();
    let subscription = doc.observe_update_v1(move |_, event| {
        sink.lock().push(event.update.clone());
    });
    return (updates, subscription);
}

fn array_json(doc: &Doc, name: &str) -> String {
    let mut txn = doc.transact().unwrap();
    let array = txn.get_array(name).unwrap();
    return array.to_json(&txn).to_string();
}

fn apply(doc: &Doc, update: &[u8]) {
    doc.transact().unwrap().apply_update_v1(update).unwrap();
}

// =============================================================================
// Diff sync
// =============================================================================

#[test]
fn state_vector_diff_only_sends_missing_blocks() {
    let d1 = Doc::with_client_id(1);
    let d2 = Doc::with_client_id(2);
    let a = d1.get_array("list").unwrap();

    a.push_range(&mut d1.transact().unwrap(), [1, 2, 3]).unwrap();
    let full = d1.transact().unwrap().encode_state_as_update_v1(&StateVector::new());
    apply(&d2, &full);

    a.push(&mut d1.transact().unwrap(), 4).unwrap();
    let sv = StateVector::decode_v1(&d2.transact().unwrap().encode_state_vector_v1()).unwrap();
    assert_eq!(sv.get(1), 3);

    let diff = d1.transact().unwrap().encode_state_as_update_v1(&sv);
    let decoded = Update::decode_v1(&diff).unwrap();
    assert_eq!(decoded.block_count(), 1);
    assert_eq!(decoded.state_vector().get(1), 4);

    apply(&d2, &diff);
    assert_eq!(array_json(&d2, "list"), "[1,2,3,4]");
}

#[test]
fn applying_twice_is_idempotent() {
    let d1 = Doc::with_client_id(1);
    let d2 = Doc::with_client_id(2);
    let a = d1.get_array("list").unwrap();
    {
        let mut txn = d1.transact().unwrap();
        a.push_range(&mut txn, ["a", "b", "c"]).unwrap();
        a.remove(&mut txn, 1).unwrap();
    }
    let update = d1.transact().unwrap().encode_state_as_update_v1(&StateVector::new());

    apply(&d2, &update);
    let once = array_json(&d2, "list");
    let sv_once = d2.transact().unwrap().state_vector();
    apply(&d2, &update);
    assert_eq!(array_json(&d2, "list"), once);
    assert_eq!(d2.transact().unwrap().state_vector(), sv_once);
    assert_eq!(once, r#"["a","c"]"#);
}

#[test]
fn transaction_update_contains_only_its_changes() {
    let d1 = Doc::with_client_id(1);
    let (updates, _subscription) = record_updates(&d1);
    let a = d1.get_array("list").unwrap();

    a.push(&mut d1.transact().unwrap(), 1).unwrap();
    a.push(&mut d1.transact().unwrap(), 2).unwrap();
    a.remove(&mut d1.transact().unwrap(), 0).unwrap();
    // A transaction without changes publishes nothing.
    drop(d1.transact().unwrap());

    let updates = updates.lock();
    assert_eq!(updates.len(), 3);
    let second = Update::decode_v1(&updates[1]).unwrap();
    assert_eq!(second.block_count(), 1);
    assert!(second.delete_set().is_empty());
    let third = Update::decode_v1(&updates[2]).unwrap();
    assert_eq!(third.block_count(), 0);
    assert_eq!(third.delete_set().len(), 1);
}

// =============================================================================
// Out-of-order delivery
// =============================================================================

#[test]
fn updates_in_reverse_order_converge() {
    let d1 = Doc::with_client_id(1);
    let (updates, _subscription) = record_updates(&d1);
    let a = d1.get_array("list").unwrap();
    let m = d1.get_map("meta").unwrap();

    a.push(&mut d1.transact().unwrap(), "first").unwrap();
    a.insert(&mut d1.transact().unwrap(), 0, "zeroth").unwrap();
    m.insert(&mut d1.transact().unwrap(), "nested", MapRef::with_entries([("k", 1)])).unwrap();
    a.remove(&mut d1.transact().unwrap(), 1).unwrap();

    let d2 = Doc::with_client_id(2);
    let updates = updates.lock().clone();
    for update in updates.iter().rev() {
        apply(&d2, update);
    }

    let txn = d2.transact().unwrap();
    assert!(!txn.has_pending());
    drop(txn);
    assert_eq!(array_json(&d2, "list"), r#"["zeroth"]"#);
    assert_eq!(array_json(&d1, "list"), r#"["zeroth"]"#);
}

#[test]
fn missing_dependency_stays_pending() {
    let d1 = Doc::with_client_id(1);
    let (updates, _subscription) = record_updates(&d1);
    let a = d1.get_array("list").unwrap();
    a.push(&mut d1.transact().unwrap(), 1).unwrap();
    a.push(&mut d1.transact().unwrap(), 2).unwrap();
    let updates = updates.lock().clone();

    let d2 = Doc::with_client_id(2);
    apply(&d2, &updates[1]);
    {
        let txn = d2.transact().unwrap();
        assert!(txn.has_pending());
        assert_eq!(txn.missing_dependencies().map(|sv| sv.get(1)), Some(0));
        assert_eq!(txn.state_vector().get(1), 0);
    }
    apply(&d2, &updates[0]);
    assert!(!d2.transact().unwrap().has_pending());
    assert_eq!(array_json(&d2, "list"), "[1,2]");
}

#[test]
fn deletion_of_unknown_block_waits() {
    let d1 = Doc::with_client_id(1);
    let (updates, _subscription) = record_updates(&d1);
    let a = d1.get_array("list").unwrap();
    a.push(&mut d1.transact().unwrap(), "x").unwrap();
    a.remove(&mut d1.transact().unwrap(), 0).unwrap();
    let updates = updates.lock().clone();

    let d2 = Doc::with_client_id(2);
    apply(&d2, &updates[1]);
    assert!(d2.transact().unwrap().pending_delete_set().is_some());
    apply(&d2, &updates[0]);
    assert!(d2.transact().unwrap().pending_delete_set().is_none());
    assert_eq!(array_json(&d2, "list"), "[]");
}

#[test]
fn pending_limit_is_enforced() {
    let d1 = Doc::with_client_id(1);
    let (updates, _subscription) = record_updates(&d1);
    let a = d1.get_array("list").unwrap();
    for i in 0..4 {
        a.push(&mut d1.transact().unwrap(), i).unwrap();
    }
    let updates = updates.lock().clone();

    let d2 = Doc::with_options(Options::default().with_client_id(2).with_max_pending_blocks(1));
    d2.transact().unwrap().apply_update_v1(&updates[3]).unwrap();
    // Two blocks now wait for clock 0 of client 1.
    let err = d2.transact().unwrap().apply_update_v1(&updates[2]).unwrap_err();
    match err {
        Error::UnresolvedDependency { missing } => assert_eq!(missing.get(1), 0),
        other => panic!("unexpected error {other:?}"),
    }
}

// =============================================================================
// Malformed input
// =============================================================================

#[test]
fn malformed_update_leaves_document_untouched() {
    let d1 = Doc::with_client_id(1);
    let a = d1.get_array("list").unwrap();
    a.push_range(&mut d1.transact().unwrap(), [1, 2, 3]).unwrap();
    let update = d1.transact().unwrap().encode_state_as_update_v1(&StateVector::new());

    let d2 = Doc::with_client_id(2);
    for cut in 1..update.len() {
        let err = d2.transact().unwrap().apply_update_v1(&update[..cut]).unwrap_err();
        assert!(err.is_decode_error(), "prefix of {cut} bytes: {err}");
        assert_eq!(d2.transact().unwrap().state_vector(), StateVector::new());
    }
    apply(&d2, &update);
    assert_eq!(array_json(&d2, "list"), "[1,2,3]");
}

#[test]
fn merged_updates_apply_like_their_parts() {
    let d1 = Doc::with_client_id(1);
    let (updates, _subscription) = record_updates(&d1);
    let a = d1.get_array("list").unwrap();
    a.push_range(&mut d1.transact().unwrap(), ["a", "b"]).unwrap();
    a.insert(&mut d1.transact().unwrap(), 1, "c").unwrap();
    a.remove(&mut d1.transact().unwrap(), 0).unwrap();

    let mut merged = Update::new();
    for bytes in updates.lock().iter() {
        merged.merge(Update::decode_v1(bytes).unwrap());
    }
    let encoded = merged.encode_v1();

    let d2 = Doc::with_client_id(2);
    apply(&d2, &encoded);
    assert_eq!(array_json(&d2, "list"), array_json(&d1, "list"));
}

// =============================================================================
// Compaction
// =============================================================================

#[test]
fn compaction_keeps_documents_in_sync() {
    let d1 = Doc::with_client_id(1);
    let d2 = Doc::with_client_id(2);
    let a = d1.get_array("list").unwrap();
    {
        let mut txn = d1.transact().unwrap();
        a.push_range(&mut txn, ["a", "b", "c", "d"]).unwrap();
        a.push(&mut txn, MapRef::with_entries([("k", "v")])).unwrap();
    }
    {
        let mut txn = d1.transact().unwrap();
        a.remove_range(&mut txn, 1, 2).unwrap();
        a.remove(&mut txn, 2).unwrap();
    }

    let acknowledged = d1.transact().unwrap().state_vector();
    let reclaimed = d1.transact().unwrap().compact(&acknowledged).unwrap();
    assert!(reclaimed >= 2);
    assert_eq!(array_json(&d1, "list"), r#"["a","d"]"#);

    let update = d1.transact().unwrap().encode_state_as_update_v1(&StateVector::new());
    apply(&d2, &update);
    assert_eq!(array_json(&d2, "list"), r#"["a","d"]"#);

    // Edits next to reclaimed content still converge.
    let b = d2.get_array("list").unwrap();
    b.insert(&mut d2.transact().unwrap(), 1, "x").unwrap();
    let sv = d1.transact().unwrap().state_vector();
    let diff = d2.transact().unwrap().encode_state_as_update_v1(&sv);
    apply(&d1, &diff);
    assert_eq!(array_json(&d1, "list"), r#"["a","x","d"]"#);
    assert_eq!(array_json(&d2, "list"), r#"["a","x","d"]"#);
}
