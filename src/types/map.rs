//! The shared map: string keys to values and nested types.
//!
//! Each key owns a chain of entries; the rightmost one is the current value
//! and every entry it replaced is a tombstone. Iteration is in key order so
//! that replicas render identical output.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Weak;

use indexmap::IndexMap;
use parking_lot::Mutex;

use super::Binding;
use super::Bound;
use super::In;
use super::Out;
use super::check_prelims;
use super::last_value;
use super::read_branch;
use super::registry_of;
use super::same_binding;
use super::write_branch;
use crate::crdt::any::Any;
use crate::crdt::block::BlockPtr;
use crate::crdt::block::BranchId;
use crate::crdt::branch::TypeKind;
use crate::crdt::branch::TypePtr;
use crate::crdt::store::Store;
use crate::crdt::yata;
use crate::doc::DocInner;
use crate::error::Error;
use crate::error::Result;
use crate::event;
use crate::event::Event;
use crate::event::MapEvent;
use crate::event::Subscription;
use crate::transaction::Transaction;
use crate::transaction::TxnState;

type Entries = IndexMap<Arc<str>, In>;

/// Handle to a shared map.
#[derive(Clone)]
pub struct MapRef {
    inner: Arc<Mutex<Binding<Entries>>>,
}

impl MapRef {
    /// A preliminary, empty map.
    pub fn new() -> MapRef {
        return MapRef {
            inner: Arc::new(Mutex::new(Binding::Prelim(Entries::new()))),
        };
    }

    /// A preliminary map holding `entries`.
    pub fn with_entries<K, V>(entries: impl IntoIterator<Item = (K, V)>) -> MapRef
    where
        K: Into<Arc<str>>,
        V: Into<In>,
    {
        let entries = entries
            .into_iter()
            .map(|(key, value)| (key.into(), value.into()))
            .collect();
        return MapRef {
            inner: Arc::new(Mutex::new(Binding::Prelim(entries))),
        };
    }

    pub(crate) fn bound(doc: Weak<DocInner>, ptr: TypePtr) -> MapRef {
        return MapRef {
            inner: Arc::new(Mutex::new(Binding::Integrated(Bound { doc, ptr }))),
        };
    }

    /// Whether the map is part of a document.
    pub fn is_integrated(&self) -> bool {
        return matches!(&*self.inner.lock(), Binding::Integrated(_));
    }

    pub(crate) fn addr(&self) -> usize {
        return Arc::as_ptr(&self.inner) as *const () as usize;
    }

    pub(crate) fn prelim_children(&self) -> Option<Vec<In>> {
        match &*self.inner.lock() {
            Binding::Prelim(entries) => return Some(entries.values().cloned().collect()),
            Binding::Integrated(_) => return None,
        }
    }

    pub(crate) fn bind(&self, doc: Weak<DocInner>, ptr: TypePtr) -> Result<Entries> {
        let mut guard = self.inner.lock();
        if let Binding::Integrated(_) = &*guard {
            return Err(Error::AlreadyIntegrated);
        }
        match std::mem::replace(&mut *guard, Binding::Integrated(Bound { doc, ptr })) {
            Binding::Prelim(entries) => return Ok(entries),
            Binding::Integrated(_) => return Err(Error::AlreadyIntegrated),
        }
    }

    fn with_prelim<R>(&self, f: impl FnOnce(&mut Entries) -> R) -> std::result::Result<R, Bound> {
        let mut guard = self.inner.lock();
        match &mut *guard {
            Binding::Prelim(entries) => return Ok(f(entries)),
            Binding::Integrated(bound) => return Err(bound.clone()),
        }
    }

    /// Live entries of the bound map, sorted by key.
    fn entries(&self, txn: &Transaction<'_>, bound: &Bound) -> BTreeMap<Arc<str>, Out> {
        let Ok(Some(branch)) = read_branch(txn, bound, TypeKind::Map) else {
            return BTreeMap::new();
        };
        let store = txn.store();
        return store
            .branch(branch)
            .map
            .iter()
            .filter(|(_, ptr)| !store.item(**ptr).deleted)
            .map(|(key, ptr)| (key.clone(), last_value(store, &bound.doc, *ptr)))
            .collect();
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Number of keys with a value.
    pub fn len(&self, txn: &Transaction<'_>) -> u32 {
        let bound = match self.with_prelim(|entries| entries.len() as u32) {
            Ok(len) => return len,
            Err(bound) => bound,
        };
        let Ok(Some(branch)) = read_branch(txn, &bound, TypeKind::Map) else {
            return 0;
        };
        let store = txn.store();
        let live = store.branch(branch).map.values().filter(|ptr| !store.item(**ptr).deleted);
        return live.count() as u32;
    }

    pub fn is_empty(&self, txn: &Transaction<'_>) -> bool {
        return self.len(txn) == 0;
    }

    /// The current value of `key`.
    pub fn get(&self, txn: &Transaction<'_>, key: &str) -> Option<Out> {
        let bound = match self.with_prelim(|entries| entries.get(key).cloned().map(Out::from)) {
            Ok(value) => return value,
            Err(bound) => bound,
        };
        let branch = read_branch(txn, &bound, TypeKind::Map).ok()??;
        let store = txn.store();
        let ptr = *store.branch(branch).map.get(key)?;
        if store.item(ptr).deleted {
            return None;
        }
        return Some(last_value(store, &bound.doc, ptr));
    }

    pub fn contains_key(&self, txn: &Transaction<'_>, key: &str) -> bool {
        return self.get(txn, key).is_some();
    }

    /// Keys with a value, in key order.
    pub fn keys(&self, txn: &Transaction<'_>) -> Vec<Arc<str>> {
        return self.iter(txn).into_iter().map(|(key, _)| key).collect();
    }

    /// Entries in key order.
    pub fn iter(&self, txn: &Transaction<'_>) -> Vec<(Arc<str>, Out)> {
        let bound = match self.with_prelim(|entries| {
            let mut out: Vec<(Arc<str>, Out)> = entries
                .iter()
                .map(|(key, value)| (key.clone(), Out::from(value.clone())))
                .collect();
            out.sort_by(|a, b| a.0.cmp(&b.0));
            return out;
        }) {
            Ok(entries) => return entries,
            Err(bound) => bound,
        };
        return self.entries(txn, &bound).into_iter().collect();
    }

    /// Materialize the map, expanding nested types.
    pub fn to_json(&self, txn: &Transaction<'_>) -> Any {
        let map: BTreeMap<String, Any> = self
            .iter(txn)
            .into_iter()
            .map(|(key, value)| (key.to_string(), value.to_json(txn)))
            .collect();
        return Any::Map(Arc::new(map));
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Set `key` to `value`, replacing the previous value.
    pub fn insert(&self, txn: &mut Transaction<'_>, key: impl Into<Arc<str>>, value: impl Into<In>) -> Result<()> {
        if txn.is_committed() {
            return Err(Error::NoActiveTransaction);
        }
        let key = key.into();
        let value = value.into();
        check_prelims([&value], &[self.addr()])?;

        let bound = match self.with_prelim(|entries| {
            entries.insert(key.clone(), value.clone());
        }) {
            Ok(()) => return Ok(()),
            Err(bound) => bound,
        };
        let (branch, mut writer) = write_branch(txn, &bound, TypeKind::Map)?;
        return writer.map_set(branch, key, value);
    }

    /// Remove `key`, returning its previous value.
    pub fn remove(&self, txn: &mut Transaction<'_>, key: &str) -> Result<Option<Out>> {
        if txn.is_committed() {
            return Err(Error::NoActiveTransaction);
        }
        let bound = match self.with_prelim(|entries| entries.shift_remove(key).map(Out::from)) {
            Ok(previous) => return Ok(previous),
            Err(bound) => bound,
        };
        let (branch, writer) = write_branch(txn, &bound, TypeKind::Map)?;
        let Some(ptr) = writer.store.branch(branch).map.get(key).copied() else {
            return Ok(None);
        };
        if writer.store.item(ptr).deleted {
            return Ok(None);
        }
        let previous = last_value(writer.store, &writer.doc, ptr);
        yata::delete(writer.store, writer.state, ptr);
        return Ok(Some(previous));
    }

    /// Remove every key.
    pub fn clear(&self, txn: &mut Transaction<'_>) -> Result<()> {
        if txn.is_committed() {
            return Err(Error::NoActiveTransaction);
        }
        let bound = match self.with_prelim(|entries| entries.clear()) {
            Ok(()) => return Ok(()),
            Err(bound) => bound,
        };
        let (branch, writer) = write_branch(txn, &bound, TypeKind::Map)?;
        clear_branch(writer.store, writer.state, branch);
        return Ok(());
    }

    // =========================================================================
    // Observers
    // =========================================================================

    /// Call `f` after every commit that changed this map.
    pub fn observe<F>(&self, f: F) -> Result<Subscription>
    where
        F: Fn(&Transaction<'_>, &MapEvent) + Send + Sync + 'static,
    {
        let (registry, ptr) = registry_of(self.inner.lock().bound())?;
        let callback = Arc::new(move |txn: &Transaction<'_>, event: &Event| {
            if let Event::Map(event) = event {
                f(txn, event);
            }
        });
        return Ok(event::subscribe_shallow(&registry, ptr, callback));
    }

    /// Call `f` after every commit that changed this map or any type
    /// nested in it.
    pub fn observe_deep<F>(&self, f: F) -> Result<Subscription>
    where
        F: Fn(&Transaction<'_>, &[Event]) + Send + Sync + 'static,
    {
        let (registry, ptr) = registry_of(self.inner.lock().bound())?;
        return Ok(event::subscribe_deep(&registry, ptr, Arc::new(f)));
    }
}

fn clear_branch(store: &mut Store, state: &mut TxnState, branch: BranchId) {
    let live: Vec<BlockPtr> = store
        .branch(branch)
        .map
        .iter()
        .filter(|(_, ptr)| !store.item(**ptr).deleted)
        .map(|(_, ptr)| *ptr)
        .collect();
    for ptr in live {
        yata::delete(store, state, ptr);
    }
}

impl Default for MapRef {
    fn default() -> Self {
        return MapRef::new();
    }
}

impl PartialEq for MapRef {
    fn eq(&self, other: &Self) -> bool {
        if Arc::ptr_eq(&self.inner, &other.inner) {
            return true;
        }
        return same_binding(&*self.inner.lock(), &*other.inner.lock());
    }
}

impl std::fmt::Debug for MapRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &*self.inner.lock() {
            Binding::Prelim(entries) => return f.debug_tuple("MapRef::Prelim").field(entries).finish(),
            Binding::Integrated(bound) => return f.debug_tuple("MapRef").field(&bound.ptr).finish(),
        }
    }
}
