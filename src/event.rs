//! Change events and the observer registry.
//!
//! Events are computed once per commit from what the transaction recorded:
//! a delta for each changed sequence and a key change set for each changed
//! map. Shallow observers of a type receive its own event; deep observers
//! receive the events of the type and of every type nested below it, each
//! carrying the path from the observed type to the changed one.
//!
//! Listeners live in a registry outside the store lock. Dispatch iterates a
//! snapshot of the registry and checks an activity flag before every call,
//! so callbacks may subscribe or unsubscribe freely, and a listener freed
//! mid-dispatch is not called again.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use indexmap::IndexMap;
use parking_lot::Mutex;
use rustc_hash::FxBuildHasher;
use rustc_hash::FxHashMap;
use tracing::trace;

use crate::crdt::block::BlockPtr;
use crate::crdt::block::BranchId;
use crate::crdt::branch::TypeKind;
use crate::crdt::branch::TypePtr;
use crate::crdt::store::Store;
use crate::doc::DocInner;
use crate::error::Error;
use crate::error::Result;
use crate::transaction::Transaction;
use crate::transaction::TxnState;
use crate::types::ArrayRef;
use crate::types::MapRef;
use crate::types::Out;
use crate::types::content_values;
use crate::types::last_value;

// =============================================================================
// Events
// =============================================================================

/// One step of a path from an observed type to a nested one.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum PathSegment {
    Key(Arc<str>),
    Index(u32),
}

/// One operation of a sequence delta.
#[derive(Clone, Debug, PartialEq)]
pub enum Change {
    Added(Vec<Out>),
    Removed(u32),
    Retain(u32),
}

/// How one map key changed.
#[derive(Clone, Debug, PartialEq)]
pub enum EntryChange {
    Inserted(Out),
    Updated(Out, Out),
    Removed(Out),
}

/// A change to a shared array.
#[derive(Clone, Debug)]
pub struct ArrayEvent {
    target: ArrayRef,
    delta: Vec<Change>,
    path: Vec<PathSegment>,
}

impl ArrayEvent {
    pub fn target(&self) -> &ArrayRef {
        return &self.target;
    }

    /// Retain/insert/delete operations turning the old value into the new.
    pub fn delta(&self) -> &[Change] {
        return &self.delta;
    }

    pub fn path(&self) -> &[PathSegment] {
        return &self.path;
    }
}

/// A change to a shared map.
#[derive(Clone, Debug)]
pub struct MapEvent {
    target: MapRef,
    keys: HashMap<Arc<str>, EntryChange>,
    path: Vec<PathSegment>,
}

impl MapEvent {
    pub fn target(&self) -> &MapRef {
        return &self.target;
    }

    pub fn keys(&self) -> &HashMap<Arc<str>, EntryChange> {
        return &self.keys;
    }

    pub fn path(&self) -> &[PathSegment] {
        return &self.path;
    }
}

/// An event delivered to deep observers.
#[derive(Clone, Debug)]
pub enum Event {
    Array(ArrayEvent),
    Map(MapEvent),
}

impl Event {
    /// Path from the observed type to the changed type.
    pub fn path(&self) -> &[PathSegment] {
        match self {
            Event::Array(event) => return &event.path,
            Event::Map(event) => return &event.path,
        }
    }

    /// The changed type.
    pub fn target(&self) -> Out {
        match self {
            Event::Array(event) => return Out::Array(event.target.clone()),
            Event::Map(event) => return Out::Map(event.target.clone()),
        }
    }

    pub fn as_array(&self) -> Option<&ArrayEvent> {
        match self {
            Event::Array(event) => return Some(event),
            Event::Map(_) => return None,
        }
    }

    pub fn as_map(&self) -> Option<&MapEvent> {
        match self {
            Event::Map(event) => return Some(event),
            Event::Array(_) => return None,
        }
    }

    fn with_path(&self, path: Vec<PathSegment>) -> Event {
        let mut event = self.clone();
        match &mut event {
            Event::Array(e) => e.path = path,
            Event::Map(e) => e.path = path,
        }
        return event;
    }
}

/// The binary update produced by a commit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpdateEvent {
    pub update: Vec<u8>,
}

// =============================================================================
// Event construction
// =============================================================================

/// Build the event of every changed type that still exists, in the order
/// the types were first changed.
pub(crate) fn build_events(store: &Store, state: &TxnState, doc: &Weak<DocInner>) -> Vec<(BranchId, Event)> {
    let mut events = Vec::with_capacity(state.changed.len());
    for (branch, subs) in &state.changed {
        if store.is_branch_deleted(*branch) {
            continue;
        }
        let Some(ptr) = store.type_ptr(*branch) else {
            continue;
        };
        let is_map = match store.branch(*branch).kind {
            TypeKind::Map => true,
            TypeKind::Array => false,
            TypeKind::Undefined => subs.iter().all(|sub| sub.is_some()),
        };
        let event = if is_map {
            Event::Map(MapEvent {
                target: MapRef::bound(doc.clone(), ptr),
                keys: map_keys(store, state, doc, *branch, subs.iter().flatten()),
                path: Vec::new(),
            })
        } else {
            Event::Array(ArrayEvent {
                target: ArrayRef::bound(doc.clone(), ptr),
                delta: array_delta(store, state, doc, *branch),
                path: Vec::new(),
            })
        };
        events.push((*branch, event));
    }
    return events;
}

/// Walk the sequence and describe this transaction's effect on it.
fn array_delta(store: &Store, state: &TxnState, doc: &Weak<DocInner>, branch: BranchId) -> Vec<Change> {
    let mut delta = Vec::new();
    let mut current: Option<Change> = None;

    let mut cursor = store.branch(branch).start;
    while let Some(ptr) = cursor {
        let item = store.item(ptr);
        cursor = item.right;
        if item.deleted {
            if state.deletes(&item.id) && !state.adds(&item.id) {
                match &mut current {
                    Some(Change::Removed(len)) => *len += item.len,
                    _ => {
                        delta.extend(current.take());
                        current = Some(Change::Removed(item.len));
                    }
                }
            }
        } else if state.adds(&item.id) {
            let values = content_values(store, doc, &item.content);
            match &mut current {
                Some(Change::Added(inserted)) => inserted.extend(values),
                _ => {
                    delta.extend(current.take());
                    current = Some(Change::Added(values));
                }
            }
        } else {
            match &mut current {
                Some(Change::Retain(len)) => *len += item.len,
                _ => {
                    delta.extend(current.take());
                    current = Some(Change::Retain(item.len));
                }
            }
        }
    }
    // A trailing retain carries no information.
    if !matches!(current, Some(Change::Retain(_))) {
        delta.extend(current);
    }
    return delta;
}

fn map_keys<'a>(
    store: &Store,
    state: &TxnState,
    doc: &Weak<DocInner>,
    branch: BranchId,
    subs: impl Iterator<Item = &'a Arc<str>>,
) -> HashMap<Arc<str>, EntryChange> {
    let mut keys = HashMap::new();
    for key in subs {
        let Some(ptr) = store.branch(branch).map.get(key).copied() else {
            continue;
        };
        let item = store.item(ptr);
        let change = if state.adds(&item.id) {
            // The value this transaction replaced, if any.
            let mut prev = item.left;
            while let Some(p) = prev {
                if !state.adds(&store.item(p).id) {
                    break;
                }
                prev = store.item(p).left;
            }
            let prev = prev.filter(|p| state.deletes(&store.item(*p).id));
            let old = prev.map(|p| last_value(store, doc, p));
            match (state.deletes(&item.id), old) {
                (true, Some(old)) => EntryChange::Removed(old),
                (true, None) => continue,
                (false, Some(old)) => EntryChange::Updated(old, last_value(store, doc, ptr)),
                (false, None) => EntryChange::Inserted(last_value(store, doc, ptr)),
            }
        } else if state.deletes(&item.id) {
            EntryChange::Removed(last_value(store, doc, ptr))
        } else {
            continue;
        };
        keys.insert(key.clone(), change);
    }
    return keys;
}

/// Keys and indices leading from `ancestor` down to `child`.
pub(crate) fn path_to(store: &Store, ancestor: BranchId, mut child: BranchId) -> Vec<PathSegment> {
    let mut path = Vec::new();
    while child != ancestor {
        let Some(ptr) = store.branch(child).item else {
            break;
        };
        let item = store.item(ptr);
        match &item.parent_sub {
            Some(key) => path.push(PathSegment::Key(key.clone())),
            None => path.push(PathSegment::Index(index_of(store, item.parent, ptr))),
        }
        child = item.parent;
    }
    path.reverse();
    return path;
}

/// Visible position of `target` in the sequence of `branch`.
fn index_of(store: &Store, branch: BranchId, target: BlockPtr) -> u32 {
    let mut index = 0;
    let mut cursor = store.branch(branch).start;
    while let Some(ptr) = cursor {
        if ptr == target {
            break;
        }
        let item = store.item(ptr);
        index += item.visible_len();
        cursor = item.right;
    }
    return index;
}

// =============================================================================
// Dispatch
// =============================================================================

/// Call shallow observers in change order, then deep observers of every
/// affected ancestor.
pub(crate) fn dispatch(txn: &Transaction<'_>, events: &[(BranchId, Event)]) {
    if events.is_empty() {
        return;
    }
    let store = txn.store();
    let registry = txn.observers();

    let mut ancestors: IndexMap<BranchId, Vec<usize>, FxBuildHasher> = IndexMap::default();
    for (i, (branch, event)) in events.iter().enumerate() {
        let mut current = Some(*branch);
        while let Some(b) = current {
            ancestors.entry(b).or_default().push(i);
            current = store.parent_of(b);
        }

        let Some(ptr) = store.type_ptr(*branch) else {
            continue;
        };
        let listeners = registry.lock().shallow_snapshot(&ptr);
        for listener in listeners {
            listener.call(txn, event);
        }
    }

    for (branch, indices) in ancestors {
        if store.is_branch_deleted(branch) {
            continue;
        }
        let Some(ptr) = store.type_ptr(branch) else {
            continue;
        };
        let listeners = registry.lock().deep_snapshot(&ptr);
        if listeners.is_empty() {
            continue;
        }
        let mut batch: Vec<Event> = indices
            .into_iter()
            .filter(|i| !store.is_branch_deleted(events[*i].0))
            .map(|i| events[i].1.with_path(path_to(store, branch, events[i].0)))
            .collect();
        // Stable: events at the same depth keep their change order.
        batch.sort_by_key(|event| event.path().len());
        trace!(?ptr, events = batch.len(), "dispatching deep events");
        for listener in listeners {
            listener.call(txn, batch.as_slice());
        }
    }
}

/// Deliver the committed transaction's update to update observers.
pub(crate) fn dispatch_update(txn: &Transaction<'_>) {
    let listeners = txn.observers().lock().update.snapshot();
    if listeners.is_empty() {
        return;
    }
    let event = UpdateEvent {
        update: txn.encode_update_v1(),
    };
    for listener in listeners {
        listener.call(txn, &event);
    }
}

// =============================================================================
// Registry
// =============================================================================

type Callback<E> = Arc<dyn Fn(&Transaction<'_>, &E) + Send + Sync + 'static>;

pub(crate) struct Listener<E: ?Sized> {
    id: u64,
    active: Arc<AtomicBool>,
    callback: Callback<E>,
}

impl<E: ?Sized> Clone for Listener<E> {
    fn clone(&self) -> Self {
        return Listener {
            id: self.id,
            active: self.active.clone(),
            callback: self.callback.clone(),
        };
    }
}

impl<E: ?Sized> Listener<E> {
    fn call(&self, txn: &Transaction<'_>, event: &E) {
        if self.active.load(Ordering::Acquire) {
            (self.callback)(txn, event);
        }
    }
}

pub(crate) struct Listeners<E: ?Sized> {
    entries: Vec<Listener<E>>,
}

impl<E: ?Sized> Default for Listeners<E> {
    fn default() -> Self {
        return Listeners { entries: Vec::new() };
    }
}

impl<E: ?Sized> Listeners<E> {
    fn remove(&mut self, id: u64) -> bool {
        let Some(pos) = self.entries.iter().position(|l| l.id == id) else {
            return false;
        };
        let listener = self.entries.remove(pos);
        listener.active.store(false, Ordering::Release);
        return true;
    }

    fn snapshot(&self) -> Vec<Listener<E>> {
        return self.entries.clone();
    }

    fn deactivate_all(&mut self) {
        for listener in self.entries.drain(..) {
            listener.active.store(false, Ordering::Release);
        }
    }
}

#[derive(Clone, Debug)]
enum ListenerKey {
    Shallow(TypePtr, u64),
    Deep(TypePtr, u64),
    Update(u64),
}

/// Every listener registered on a document.
#[derive(Default)]
pub(crate) struct Observers {
    next_id: u64,
    shallow: FxHashMap<TypePtr, Listeners<Event>>,
    deep: FxHashMap<TypePtr, Listeners<[Event]>>,
    update: Listeners<UpdateEvent>,
}

impl Observers {
    fn shallow_snapshot(&self, ptr: &TypePtr) -> Vec<Listener<Event>> {
        return self.shallow.get(ptr).map(|l| l.snapshot()).unwrap_or_default();
    }

    fn deep_snapshot(&self, ptr: &TypePtr) -> Vec<Listener<[Event]>> {
        return self.deep.get(ptr).map(|l| l.snapshot()).unwrap_or_default();
    }

    fn next_listener<E: ?Sized>(&mut self, callback: Callback<E>) -> Listener<E> {
        self.next_id += 1;
        return Listener {
            id: self.next_id,
            active: Arc::new(AtomicBool::new(true)),
            callback,
        };
    }

    fn remove(&mut self, key: &ListenerKey) -> bool {
        match key {
            ListenerKey::Shallow(ptr, id) => {
                return self.shallow.get_mut(ptr).is_some_and(|l| l.remove(*id));
            }
            ListenerKey::Deep(ptr, id) => {
                return self.deep.get_mut(ptr).is_some_and(|l| l.remove(*id));
            }
            ListenerKey::Update(id) => return self.update.remove(*id),
        }
    }

    /// Drop every listener; outstanding subscriptions become inert.
    pub(crate) fn clear(&mut self) {
        for listeners in self.shallow.values_mut() {
            listeners.deactivate_all();
        }
        for listeners in self.deep.values_mut() {
            listeners.deactivate_all();
        }
        self.update.deactivate_all();
        self.shallow.clear();
        self.deep.clear();
    }
}

pub(crate) fn subscribe_shallow(
    registry: &Arc<Mutex<Observers>>,
    ptr: TypePtr,
    callback: Callback<Event>,
) -> Subscription {
    let mut observers = registry.lock();
    let listener = observers.next_listener(callback);
    let (id, active) = (listener.id, listener.active.clone());
    observers.shallow.entry(ptr.clone()).or_default().entries.push(listener);
    return Subscription::new(registry, ListenerKey::Shallow(ptr, id), active);
}

pub(crate) fn subscribe_deep(
    registry: &Arc<Mutex<Observers>>,
    ptr: TypePtr,
    callback: Callback<[Event]>,
) -> Subscription {
    let mut observers = registry.lock();
    let listener = observers.next_listener(callback);
    let (id, active) = (listener.id, listener.active.clone());
    observers.deep.entry(ptr.clone()).or_default().entries.push(listener);
    return Subscription::new(registry, ListenerKey::Deep(ptr, id), active);
}

pub(crate) fn subscribe_update(registry: &Arc<Mutex<Observers>>, callback: Callback<UpdateEvent>) -> Subscription {
    let mut observers = registry.lock();
    let listener = observers.next_listener(callback);
    let (id, active) = (listener.id, listener.active.clone());
    observers.update.entries.push(listener);
    return Subscription::new(registry, ListenerKey::Update(id), active);
}

// =============================================================================
// Subscription
// =============================================================================

/// A registered observer. Dropping it unsubscribes.
pub struct Subscription {
    registry: Weak<Mutex<Observers>>,
    key: ListenerKey,
    active: Arc<AtomicBool>,
    released: bool,
}

impl Subscription {
    fn new(registry: &Arc<Mutex<Observers>>, key: ListenerKey, active: Arc<AtomicBool>) -> Subscription {
        return Subscription {
            registry: Arc::downgrade(registry),
            key,
            active,
            released: false,
        };
    }

    /// Whether the listener will still be called.
    pub fn is_active(&self) -> bool {
        return !self.released && self.active.load(Ordering::Acquire);
    }

    /// Unsubscribe. Fails with [`Error::UseAfterFree`] if the listener was
    /// already dropped by its document.
    pub fn free(mut self) -> Result<()> {
        return self.release();
    }

    fn release(&mut self) -> Result<()> {
        if self.released {
            return Err(Error::UseAfterFree("subscription already freed"));
        }
        self.released = true;
        self.active.store(false, Ordering::Release);
        let Some(registry) = self.registry.upgrade() else {
            return Err(Error::UseAfterFree("document has been destroyed"));
        };
        if !registry.lock().remove(&self.key) {
            return Err(Error::UseAfterFree("subscription is no longer registered"));
        }
        return Ok(());
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        return f
            .debug_struct("Subscription")
            .field("key", &self.key)
            .field("active", &self.is_active())
            .finish();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if !self.released {
            let _ = self.release();
        }
    }
}
