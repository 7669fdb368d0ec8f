//! The document: owner of the store, the root types and the observers.

use std::sync::Arc;

use parking_lot::Mutex;
use rand_core::OsRng;
use rand_core::RngCore;
use tracing::debug;

use crate::crdt::branch::TypeKind;
use crate::crdt::branch::TypePtr;
use crate::crdt::primitives::ClientId;
use crate::crdt::store::Store;
use crate::error::Error;
use crate::error::Result;
use crate::event;
use crate::event::Observers;
use crate::event::Subscription;
use crate::event::UpdateEvent;
use crate::transaction::Transaction;
use crate::types::ArrayRef;
use crate::types::MapRef;

/// Document configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Options {
    /// Client id of this replica; random when `None`.
    pub client_id: Option<ClientId>,
    /// Maximum number of remote blocks kept waiting for missing
    /// dependencies. Unlimited when `None`.
    pub max_pending_blocks: Option<usize>,
    /// Squash adjacent runs of the same client on commit.
    pub merge_blocks: bool,
}

impl Default for Options {
    fn default() -> Self {
        return Options {
            client_id: None,
            max_pending_blocks: None,
            merge_blocks: true,
        };
    }
}

impl Options {
    pub fn with_client_id(mut self, client_id: ClientId) -> Self {
        self.client_id = Some(client_id);
        return self;
    }

    pub fn with_max_pending_blocks(mut self, limit: usize) -> Self {
        self.max_pending_blocks = Some(limit);
        return self;
    }

    pub fn with_merge_blocks(mut self, merge: bool) -> Self {
        self.merge_blocks = merge;
        return self;
    }
}

pub(crate) struct DocInner {
    pub(crate) client_id: ClientId,
    pub(crate) options: Options,
    pub(crate) store: Mutex<Store>,
    pub(crate) observers: Arc<Mutex<Observers>>,
}

/// A replicated document holding named shared arrays and maps.
///
/// All reads and writes go through a [`Transaction`]; one may be open at a
/// time. Shared type handles keep only a weak link to the document, so
/// dropping (or [`destroy`](Doc::destroy)ing) the document releases its
/// content even while handles are still around.
pub struct Doc {
    inner: Arc<DocInner>,
}

impl Doc {
    pub fn new() -> Doc {
        return Doc::with_options(Options::default());
    }

    pub fn with_client_id(client_id: ClientId) -> Doc {
        return Doc::with_options(Options::default().with_client_id(client_id));
    }

    pub fn with_options(options: Options) -> Doc {
        // Random ids stay in the 32-bit range other replicas expect.
        let client_id = options.client_id.unwrap_or_else(|| OsRng.next_u32() as ClientId);
        let options = Options {
            client_id: Some(client_id),
            ..options
        };
        debug!(client_id, "created document");
        return Doc {
            inner: Arc::new(DocInner {
                client_id,
                options,
                store: Mutex::new(Store::new(client_id)),
                observers: Arc::new(Mutex::new(Observers::default())),
            }),
        };
    }

    pub fn client_id(&self) -> ClientId {
        return self.inner.client_id;
    }

    pub fn options(&self) -> &Options {
        return &self.inner.options;
    }

    /// The root array called `name`, created on first access.
    pub fn get_array(&self, name: &str) -> Result<ArrayRef> {
        let ptr = self.get_root(name, TypeKind::Array)?;
        return Ok(ArrayRef::bound(Arc::downgrade(&self.inner), ptr));
    }

    /// The root map called `name`, created on first access.
    pub fn get_map(&self, name: &str) -> Result<MapRef> {
        let ptr = self.get_root(name, TypeKind::Map)?;
        return Ok(MapRef::bound(Arc::downgrade(&self.inner), ptr));
    }

    fn get_root(&self, name: &str, kind: TypeKind) -> Result<TypePtr> {
        let mut store = self.inner.store.try_lock().ok_or(Error::Busy)?;
        let name: Arc<str> = name.into();
        store.get_or_create_root(&name, kind)?;
        return Ok(TypePtr::Root(name));
    }

    /// Open a transaction. Fails with [`Error::Busy`] instead of waiting if
    /// another one is open, including from an observer callback.
    pub fn transact(&self) -> Result<Transaction<'_>> {
        let store = self.inner.store.try_lock().ok_or(Error::Busy)?;
        return Ok(Transaction::new(&self.inner, store));
    }

    /// Call `f` with the binary update of every commit that changed the
    /// document.
    pub fn observe_update_v1<F>(&self, f: F) -> Subscription
    where
        F: Fn(&Transaction<'_>, &UpdateEvent) + Send + Sync + 'static,
    {
        return event::subscribe_update(&self.inner.observers, Arc::new(f));
    }

    /// Drop every subscription and release the document. Handles bound to
    /// it fail with [`Error::UseAfterFree`] afterwards.
    pub fn destroy(self) {
        self.inner.observers.lock().clear();
        debug!("destroyed document");
    }
}

impl Default for Doc {
    fn default() -> Self {
        return Doc::new();
    }
}

impl std::fmt::Debug for Doc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        return f
            .debug_struct("Doc")
            .field("client_id", &self.inner.client_id)
            .finish_non_exhaustive();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_transaction_is_busy() {
        let doc = Doc::with_client_id(7);
        let txn = doc.transact().unwrap();
        assert!(doc.transact().unwrap_err().is_busy());
        assert!(doc.get_array("a").unwrap_err().is_busy());
        drop(txn);
        assert!(doc.transact().is_ok());
    }

    #[test]
    fn roots_are_idempotent_and_typed() {
        let doc = Doc::with_client_id(7);
        let a = doc.get_array("a").unwrap();
        assert_eq!(a, doc.get_array("a").unwrap());
        let err = doc.get_map("a").unwrap_err();
        assert!(matches!(err, Error::TypeMismatch { expected: "array" }));
    }

    #[test]
    fn random_client_id_fits_u32() {
        let doc = Doc::new();
        assert!(doc.client_id() <= u32::MAX as ClientId);
        assert_eq!(doc.options().client_id, Some(doc.client_id()));
    }

    #[test]
    fn destroyed_document_handles() {
        let doc = Doc::with_client_id(1);
        let array = doc.get_array("a").unwrap();
        let sub = array.observe(|_, _| {}).unwrap();
        doc.destroy();
        assert!(matches!(sub.free(), Err(Error::UseAfterFree(_))));

        let other = Doc::with_client_id(2);
        let mut txn = other.transact().unwrap();
        let err = array.push(&mut txn, 1).unwrap_err();
        assert!(matches!(err, Error::UseAfterFree(_)));
    }
}
