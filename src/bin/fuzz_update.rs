//! AFL fuzz harness for update decoding and integration.
//!
//! Arbitrary bytes are decoded as a v1 update and applied to a document
//! that already holds some content. Properties checked:
//! 1. Decoding and applying never panic.
//! 2. A rejected update leaves the document untouched.
//! 3. An accepted update re-encodes to something that decodes again, and
//!    applying the same bytes twice is a no-op.

use afl::fuzz;
use tandem::Decode;
use tandem::Doc;
use tandem::Encode;
use tandem::StateVector;
use tandem::Update;

fn seeded_doc() -> Doc {
    let doc = Doc::with_client_id(1);
    let list = doc.get_array("list").unwrap();
    let meta = doc.get_map("meta").unwrap();
    let mut txn = doc.transact().unwrap();
    list.push_range(&mut txn, [1, 2, 3]).unwrap();
    meta.insert(&mut txn, "k", "v").unwrap();
    return doc;
}

fn snapshot(doc: &Doc) -> (StateVector, String, String) {
    let mut txn = doc.transact().unwrap();
    let list = txn.get_array("list").unwrap().to_json(&txn).to_string();
    let meta = txn.get_map("meta").unwrap().to_json(&txn).to_string();
    return (txn.state_vector(), list, meta);
}

fn main() {
    fuzz!(|data: &[u8]| {
        if let Ok(update) = Update::decode_v1(data) {
            let reencoded = update.encode_v1();
            assert!(Update::decode_v1(&reencoded).is_ok(), "re-encoded update does not decode");
        }

        let doc = seeded_doc();
        let before = snapshot(&doc);
        let result = doc.transact().unwrap().apply_update_v1(data);
        match result {
            Err(_) => {
                assert_eq!(snapshot(&doc), before, "rejected update modified the document");
            }
            Ok(()) => {
                let once = snapshot(&doc);
                let again = doc.transact().unwrap().apply_update_v1(data);
                assert!(again.is_ok(), "second application failed: {again:?}");
                assert_eq!(snapshot(&doc), once, "applying twice is not idempotent");
            }
        }
    });
}
