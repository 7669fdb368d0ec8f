//! Tandem - a conflict-free replicated document engine.
//!
//! A [`Doc`] holds named shared arrays and maps that can nest inside each
//! other. Replicas edit their own copy inside transactions and exchange
//! binary updates; every replica that has seen the same updates converges
//! to the same content, whatever order the updates arrived in.
//!
//! # Quick Start
//!
//! ```
//! use tandem::{Doc, MapRef};
//!
//! let alice = Doc::with_client_id(1);
//! let list = alice.get_array("list").unwrap();
//!
//! let update = {
//!     let mut txn = alice.transact().unwrap();
//!     list.insert_range(&mut txn, 0, [1, 2, 3]).unwrap();
//!     list.push(&mut txn, MapRef::with_entries([("done", false)])).unwrap();
//!     txn.encode_update_v1()
//! };
//!
//! let bob = Doc::with_client_id(2);
//! let mut txn = bob.transact().unwrap();
//! txn.apply_update_v1(&update).unwrap();
//! let list = txn.get_array("list").unwrap();
//! assert_eq!(list.to_json(&txn).to_string(), r#"[1,2,3,{"done":false}]"#);
//! ```
//!
//! # Wire format
//!
//! Updates and state vectors use the lib0 v1 encoding, so payloads can be
//! exchanged with other engines speaking it, as long as they only use
//! arrays, maps and plain values.

pub mod crdt;
pub mod doc;
pub mod encoding;
pub mod error;
pub mod event;
pub mod transaction;
pub mod types;
pub mod update;

pub use crate::crdt::any::Any;
pub use crate::crdt::primitives::ClientId;
pub use crate::crdt::primitives::DeleteSet;
pub use crate::crdt::primitives::Id;
pub use crate::crdt::primitives::StateVector;
pub use crate::doc::Doc;
pub use crate::doc::Options;
pub use crate::encoding::Decode;
pub use crate::encoding::Encode;
pub use crate::error::Error;
pub use crate::error::Result;
pub use crate::event::ArrayEvent;
pub use crate::event::Change;
pub use crate::event::EntryChange;
pub use crate::event::Event;
pub use crate::event::MapEvent;
pub use crate::event::PathSegment;
pub use crate::event::Subscription;
pub use crate::event::UpdateEvent;
pub use crate::transaction::Transaction;
pub use crate::types::ArrayRef;
pub use crate::types::In;
pub use crate::types::MapRef;
pub use crate::types::Out;
pub use crate::update::Update;
