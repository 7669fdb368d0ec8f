//! Transactions: the atomicity and visibility boundary of a document.
//!
//! A transaction holds the document's store lock for its whole lifetime,
//! so at most one is open per document. It records what it changed: the
//! state vector before it started, the ranges it deleted and the shared
//! types it touched. On commit those records drive delta computation,
//! observer dispatch, run squashing and the per-transaction update.

use std::sync::Arc;
use std::sync::Weak;

use indexmap::IndexMap;
use parking_lot::MutexGuard;
use rustc_hash::FxBuildHasher;
use rustc_hash::FxHashSet;
use tracing::debug;

use crate::crdt::block::BranchId;
use crate::crdt::branch::TypeKind;
use crate::crdt::branch::TypePtr;
use crate::crdt::primitives::ClientId;
use crate::crdt::primitives::DeleteSet;
use crate::crdt::primitives::Id;
use crate::crdt::primitives::StateVector;
use crate::crdt::store::Store;
use crate::doc::DocInner;
use crate::encoding::Decode;
use crate::encoding::Encode;
use crate::error::Error;
use crate::error::Result;
use crate::event;
use crate::update;
use crate::types::ArrayRef;
use crate::types::MapRef;
use crate::update::Update;

/// Changed shared types in discovery order, with the map keys changed on
/// each (`None` for sequence changes).
pub(crate) type Changed = IndexMap<BranchId, FxHashSet<Option<Arc<str>>>, FxBuildHasher>;

/// What a transaction did, as needed by integration and commit.
#[derive(Debug)]
pub(crate) struct TxnState {
    pub(crate) before_state: StateVector,
    pub(crate) delete_set: DeleteSet,
    pub(crate) changed: Changed,
}

impl TxnState {
    pub(crate) fn new(before_state: StateVector) -> TxnState {
        return TxnState {
            before_state,
            delete_set: DeleteSet::new(),
            changed: Changed::default(),
        };
    }

    /// Whether the unit at `id` was created in this transaction.
    #[inline]
    pub(crate) fn adds(&self, id: &Id) -> bool {
        return id.clock >= self.before_state.get(id.client);
    }

    /// Whether the unit at `id` was deleted in this transaction.
    #[inline]
    pub(crate) fn deletes(&self, id: &Id) -> bool {
        return self.delete_set.contains(id);
    }

    /// Record a change on `branch`. Types created in this transaction are
    /// not tracked; their creation is reported on their parent.
    pub(crate) fn add_changed(&mut self, store: &Store, branch: BranchId, sub: Option<Arc<str>>) {
        let track = match store.branch(branch).item {
            None => true,
            Some(ptr) => {
                let block = store.block(ptr);
                !self.adds(&block.id()) && !block.is_deleted()
            }
        };
        if track {
            self.changed.entry(branch).or_default().insert(sub);
        }
    }
}

// =============================================================================
// Transaction
// =============================================================================

/// An open transaction on a [`Doc`](crate::Doc).
///
/// Mutations take `&mut Transaction`; reads take `&Transaction`. Dropping
/// the transaction commits it.
pub struct Transaction<'doc> {
    doc: &'doc Arc<DocInner>,
    store: MutexGuard<'doc, Store>,
    state: TxnState,
    committed: bool,
}

impl std::fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        return f.debug_struct("Transaction").field("committed", &self.committed).finish_non_exhaustive();
    }
}

impl<'doc> Transaction<'doc> {
    pub(crate) fn new(doc: &'doc Arc<DocInner>, store: MutexGuard<'doc, Store>) -> Transaction<'doc> {
        let before_state = store.state_vector();
        return Transaction {
            doc,
            store,
            state: TxnState::new(before_state),
            committed: false,
        };
    }

    #[inline]
    pub(crate) fn store(&self) -> &Store {
        return &self.store;
    }

    pub(crate) fn doc_weak(&self) -> Weak<DocInner> {
        return Arc::downgrade(self.doc);
    }

    /// Check that a handle bound to `doc` may be used with this transaction.
    pub(crate) fn check_doc(&self, doc: &Weak<DocInner>) -> Result<()> {
        if std::ptr::eq(doc.as_ptr(), Arc::as_ptr(self.doc)) {
            return Ok(());
        }
        if doc.strong_count() == 0 {
            return Err(Error::UseAfterFree("document has been destroyed"));
        }
        return Err(Error::ForeignDocument);
    }

    /// Mutable access for writes; fails once committed.
    pub(crate) fn parts_mut(&mut self) -> Result<(&mut Store, &mut TxnState)> {
        if self.committed {
            return Err(Error::NoActiveTransaction);
        }
        return Ok((&mut self.store, &mut self.state));
    }

    /// Whether [`commit`](Self::commit) has run.
    pub fn is_committed(&self) -> bool {
        return self.committed;
    }

    /// Client id of the document.
    pub fn client_id(&self) -> ClientId {
        return self.store.client_id();
    }

    /// Current state vector of the document.
    pub fn state_vector(&self) -> StateVector {
        return self.store.state_vector();
    }

    /// State vector at the start of this transaction.
    pub fn before_state(&self) -> &StateVector {
        return &self.state.before_state;
    }

    /// Ranges deleted by this transaction.
    pub fn delete_set(&self) -> &DeleteSet {
        return &self.state.delete_set;
    }

    /// The root array called `name`, created on first access.
    pub fn get_array(&mut self, name: &str) -> Result<ArrayRef> {
        let name: Arc<str> = name.into();
        self.store.get_or_create_root(&name, TypeKind::Array)?;
        return Ok(ArrayRef::bound(self.doc_weak(), TypePtr::Root(name)));
    }

    /// The root map called `name`, created on first access.
    pub fn get_map(&mut self, name: &str) -> Result<MapRef> {
        let name: Arc<str> = name.into();
        self.store.get_or_create_root(&name, TypeKind::Map)?;
        return Ok(MapRef::bound(self.doc_weak(), TypePtr::Root(name)));
    }

    pub fn encode_state_vector_v1(&self) -> Vec<u8> {
        return self.store.state_vector().encode_v1();
    }

    /// Encode the blocks created and the deletions made by this transaction.
    pub fn encode_update_v1(&self) -> Vec<u8> {
        return update::encode_diff(&self.store, &self.state.before_state, &self.state.delete_set);
    }

    /// Encode everything a replica at `remote` is missing, together with
    /// every known deletion.
    pub fn encode_state_as_update_v1(&self, remote: &StateVector) -> Vec<u8> {
        return update::encode_diff(&self.store, remote, &self.store.delete_set());
    }

    /// Decode and apply a v1 update. A malformed payload leaves the
    /// document unchanged.
    pub fn apply_update_v1(&mut self, bytes: &[u8]) -> Result<()> {
        if self.committed {
            return Err(Error::NoActiveTransaction);
        }
        let update = Update::decode_v1(bytes)?;
        return self.apply_update(update);
    }

    /// Apply a decoded update. Blocks with missing dependencies are kept
    /// pending and retried by later updates.
    pub fn apply_update(&mut self, update: Update) -> Result<()> {
        let max_pending = self.doc.options.max_pending_blocks;
        let (store, state) = self.parts_mut()?;
        return update::apply(store, state, update, max_pending);
    }

    /// Whether blocks or deletions are waiting for missing dependencies.
    pub fn has_pending(&self) -> bool {
        return self.store.pending.is_some() || self.store.pending_ds.is_some();
    }

    /// Blocks waiting for missing dependencies.
    pub fn pending_update(&self) -> Option<&Update> {
        return self.store.pending.as_ref().map(|pending| &pending.update);
    }

    /// Earliest clock still needed per blocked client.
    pub fn missing_dependencies(&self) -> Option<&StateVector> {
        return self.store.pending.as_ref().map(|pending| &pending.missing);
    }

    /// Deletions referring to clocks not integrated yet.
    pub fn pending_delete_set(&self) -> Option<&DeleteSet> {
        return self.store.pending_ds.as_ref();
    }

    /// Reclaim tombstones every replica has acknowledged.
    ///
    /// `acknowledged` must be a state vector every peer has reached (for
    /// example the pointwise minimum of their state vectors). Deleted
    /// content within it is dropped, keeping only its clock range, and the
    /// content of deleted shared types becomes gc ranges. Returns the number
    /// of blocks reclaimed.
    pub fn compact(&mut self, acknowledged: &StateVector) -> Result<usize> {
        let merge = self.doc.options.merge_blocks;
        let (store, _) = self.parts_mut()?;
        let reclaimed = store.compact(acknowledged);
        if merge {
            for client in store.client_ids() {
                let end = store.get_state(client);
                store.squash_range(client, 0, end);
            }
        }
        debug!(reclaimed, blocks = store.block_count(), "compacted store");
        return Ok(reclaimed);
    }

    /// Commit: compute events, notify observers, squash runs and publish
    /// the update. Later mutations through this transaction fail with
    /// [`Error::NoActiveTransaction`].
    pub fn commit(&mut self) {
        if self.committed {
            return;
        }
        self.committed = true;

        let changed_types = self.state.changed.len();
        let has_changes = !self.state.delete_set.is_empty()
            || self.store.state_vector() != self.state.before_state;

        let events = event::build_events(&self.store, &self.state, &self.doc_weak());
        event::dispatch(self, &events);

        if self.doc.options.merge_blocks {
            self.squash();
        } else {
            self.store.splits.clear();
        }

        if has_changes {
            event::dispatch_update(self);
        }

        debug!(
            changed_types,
            deleted = self.state.delete_set.len(),
            "committed transaction"
        );
    }

    /// Merge runs created, deleted or split by this transaction.
    fn squash(&mut self) {
        let store = &mut *self.store;
        let after_state = store.state_vector();
        for (client, after) in after_state.iter() {
            let before = self.state.before_state.get(client);
            if after > before {
                store.squash_range(client, before, after);
            }
        }
        for (client, ranges) in self.state.delete_set.iter() {
            for range in ranges.iter().rev() {
                store.squash_range(client, range.start, range.end);
            }
        }
        store.squash_splits();
    }

    pub(crate) fn observers(&self) -> &Arc<parking_lot::Mutex<event::Observers>> {
        return &self.doc.observers;
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        self.commit();
    }
}
