//! Shared type handles and the values they hold.
//!
//! An [`ArrayRef`] or [`MapRef`] is a cheap, cloneable handle. A handle
//! bound to a document only stores the replica-independent address of its
//! type and resolves it against the store on every access. A handle created
//! with `new` is preliminary: it buffers its content until it is inserted
//! into a document, at which point the content is integrated and the handle
//! (and every clone of it) becomes bound to the integrated type.

pub mod array;
pub mod map;

use std::sync::Arc;
use std::sync::Weak;

use rustc_hash::FxHashSet;
use smallvec::SmallVec;

pub use self::array::ArrayRef;
pub use self::map::MapRef;
use crate::crdt::any::Any;
use crate::crdt::block::BlockPtr;
use crate::crdt::block::BranchId;
use crate::crdt::block::Item;
use crate::crdt::block::ItemContent;
use crate::crdt::branch::TypeKind;
use crate::crdt::branch::TypePtr;
use crate::crdt::store::Store;
use crate::crdt::yata;
use crate::doc::DocInner;
use crate::error::Error;
use crate::error::Result;
use crate::event::Observers;
use crate::transaction::Transaction;
use crate::transaction::TxnState;

// =============================================================================
// Values
// =============================================================================

/// A value to be written into a shared type.
#[derive(Clone, Debug)]
pub enum In {
    Any(Any),
    Array(ArrayRef),
    Map(MapRef),
}

/// A value read from a shared type.
#[derive(Clone, Debug, PartialEq)]
pub enum Out {
    Any(Any),
    Array(ArrayRef),
    Map(MapRef),
}

impl Out {
    pub fn as_any(&self) -> Option<&Any> {
        match self {
            Out::Any(any) => return Some(any),
            _ => return None,
        }
    }

    pub fn as_array(&self) -> Option<&ArrayRef> {
        match self {
            Out::Array(array) => return Some(array),
            _ => return None,
        }
    }

    pub fn as_map(&self) -> Option<&MapRef> {
        match self {
            Out::Map(map) => return Some(map),
            _ => return None,
        }
    }

    /// Materialize the value, expanding nested shared types.
    pub fn to_json(&self, txn: &Transaction<'_>) -> Any {
        match self {
            Out::Any(any) => return any.clone(),
            Out::Array(array) => return array.to_json(txn),
            Out::Map(map) => return map.to_json(txn),
        }
    }
}

impl From<In> for Out {
    fn from(value: In) -> Out {
        match value {
            In::Any(any) => return Out::Any(any),
            In::Array(array) => return Out::Array(array),
            In::Map(map) => return Out::Map(map),
        }
    }
}

impl From<Any> for In {
    fn from(value: Any) -> In {
        return In::Any(value);
    }
}

impl From<ArrayRef> for In {
    fn from(value: ArrayRef) -> In {
        return In::Array(value);
    }
}

impl From<MapRef> for In {
    fn from(value: MapRef) -> In {
        return In::Map(value);
    }
}

impl<T: Into<Any>> From<Vec<T>> for In {
    fn from(value: Vec<T>) -> In {
        return In::Any(value.into());
    }
}

macro_rules! impl_in_from_scalar {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for In {
                fn from(value: $ty) -> In {
                    return In::Any(Any::from(value));
                }
            }
        )*
    };
}

impl_in_from_scalar!(bool, f64, f32, i32, u32, i64, &str, String);

// =============================================================================
// Bindings
// =============================================================================

/// Where a bound handle points.
#[derive(Clone, Debug)]
pub(crate) struct Bound {
    pub(crate) doc: Weak<DocInner>,
    pub(crate) ptr: TypePtr,
}

impl Bound {
    fn same_as(&self, other: &Bound) -> bool {
        return Weak::ptr_eq(&self.doc, &other.doc) && self.ptr == other.ptr;
    }
}

/// State behind a handle: buffered content, or a bound address.
#[derive(Debug)]
pub(crate) enum Binding<P> {
    Prelim(P),
    Integrated(Bound),
}

impl<P> Binding<P> {
    pub(crate) fn bound(&self) -> Option<Bound> {
        match self {
            Binding::Integrated(bound) => return Some(bound.clone()),
            Binding::Prelim(_) => return None,
        }
    }
}

pub(crate) fn same_binding<P>(a: &Binding<P>, b: &Binding<P>) -> bool {
    match (a, b) {
        (Binding::Integrated(a), Binding::Integrated(b)) => return a.same_as(b),
        _ => return false,
    }
}

/// Branch of a bound handle for reading. `None` if the type has been
/// reclaimed.
pub(crate) fn read_branch(txn: &Transaction<'_>, bound: &Bound, kind: TypeKind) -> Result<Option<BranchId>> {
    txn.check_doc(&bound.doc)?;
    let store = txn.store();
    let Some(branch) = store.resolve(&bound.ptr) else {
        return Ok(None);
    };
    if !store.branch(branch).accepts(kind) {
        return Err(Error::TypeMismatch {
            expected: store.branch(branch).kind.name(),
        });
    }
    return Ok(Some(branch));
}

/// Branch of a bound handle for writing, together with a writer over the
/// transaction.
pub(crate) fn write_branch<'t>(
    txn: &'t mut Transaction<'_>,
    bound: &Bound,
    kind: TypeKind,
) -> Result<(BranchId, Writer<'t>)> {
    if txn.is_committed() {
        return Err(Error::NoActiveTransaction);
    }
    txn.check_doc(&bound.doc)?;
    let doc = txn.doc_weak();
    let (store, state) = txn.parts_mut()?;
    let Some(branch) = store.resolve(&bound.ptr) else {
        return Err(Error::UseAfterFree("shared type has been reclaimed"));
    };
    if !store.branch(branch).accepts(kind) {
        return Err(Error::TypeMismatch {
            expected: store.branch(branch).kind.name(),
        });
    }
    return Ok((branch, Writer { store, state, doc }));
}

/// Check that every shared type among `values` (recursively) is
/// preliminary and appears only once. `exclude` are handles the values must
/// not contain, such as the preliminary type being written into.
pub(crate) fn check_prelims<'a>(values: impl IntoIterator<Item = &'a In>, exclude: &[usize]) -> Result<()> {
    let mut visited: FxHashSet<usize> = exclude.iter().copied().collect();
    let mut stack: Vec<In> = values.into_iter().cloned().collect();
    while let Some(value) = stack.pop() {
        let addr = match &value {
            In::Any(_) => continue,
            In::Array(array) => array.addr(),
            In::Map(map) => map.addr(),
        };
        if !visited.insert(addr) {
            return Err(Error::AlreadyIntegrated);
        }
        let children = match &value {
            In::Array(array) => array.prelim_children(),
            In::Map(map) => map.prelim_children(),
            In::Any(_) => continue,
        };
        match children {
            Some(children) => stack.extend(children),
            None => return Err(Error::AlreadyIntegrated),
        }
    }
    return Ok(());
}

// =============================================================================
// Reading
// =============================================================================

/// Handle for the shared type stored in `branch`.
fn type_value(store: &Store, doc: &Weak<DocInner>, branch: BranchId) -> Out {
    let Some(ptr) = store.type_ptr(branch) else {
        return Out::Any(Any::Undefined);
    };
    match store.branch(branch).kind {
        TypeKind::Map => return Out::Map(MapRef::bound(doc.clone(), ptr)),
        TypeKind::Array | TypeKind::Undefined => return Out::Array(ArrayRef::bound(doc.clone(), ptr)),
    }
}

/// Every value of a content run.
pub(crate) fn content_values(store: &Store, doc: &Weak<DocInner>, content: &ItemContent) -> Vec<Out> {
    match content {
        ItemContent::Any(values) => return values.iter().cloned().map(Out::Any).collect(),
        ItemContent::Binary(bytes) => return vec![Out::Any(Any::Buffer(bytes.clone()))],
        ItemContent::Deleted(_) => return Vec::new(),
        ItemContent::Type(branch) => return vec![type_value(store, doc, *branch)],
    }
}

/// The value at `offset` within a content run.
pub(crate) fn content_value(store: &Store, doc: &Weak<DocInner>, content: &ItemContent, offset: u32) -> Out {
    match content {
        ItemContent::Any(values) => {
            return values
                .get(offset as usize)
                .cloned()
                .map(Out::Any)
                .unwrap_or(Out::Any(Any::Undefined));
        }
        ItemContent::Binary(bytes) => return Out::Any(Any::Buffer(bytes.clone())),
        ItemContent::Deleted(_) => return Out::Any(Any::Undefined),
        ItemContent::Type(branch) => return type_value(store, doc, *branch),
    }
}

/// The value a map entry holds: the last unit of its run.
pub(crate) fn last_value(store: &Store, doc: &Weak<DocInner>, ptr: BlockPtr) -> Out {
    let item = store.item(ptr);
    return content_value(store, doc, &item.content, item.len.saturating_sub(1));
}

// =============================================================================
// Writing
// =============================================================================

/// Local edits on the store of an open transaction.
pub(crate) struct Writer<'t> {
    pub(crate) store: &'t mut Store,
    pub(crate) state: &'t mut TxnState,
    pub(crate) doc: Weak<DocInner>,
}

impl Writer<'_> {
    fn new_item(&self, parent: BranchId, left: Option<BlockPtr>, right: Option<BlockPtr>, content: ItemContent) -> Item {
        let origin = left.map(|left| self.store.item(left).last_id());
        let right_origin = right.map(|right| self.store.item(right).id);
        return Item {
            id: yata::next_id(self.store),
            len: content.len(),
            left,
            right,
            origin,
            right_origin,
            parent,
            parent_sub: None,
            content,
            deleted: false,
        };
    }

    /// Insert `values` into the sequence of `parent` between `left` and
    /// `right`. Consecutive plain values share one run; every shared type
    /// gets its own item and its buffered content is integrated into it.
    pub(crate) fn insert_after(
        &mut self,
        parent: BranchId,
        mut left: Option<BlockPtr>,
        right: Option<BlockPtr>,
        values: Vec<In>,
    ) -> Result<()> {
        let mut run: SmallVec<[Any; 1]> = SmallVec::new();
        for value in values {
            match value {
                In::Any(any) => run.push(any),
                In::Array(array) => {
                    left = self.flush_run(parent, left, right, &mut run);
                    left = Some(self.insert_array(parent, left, right, None, &array)?);
                }
                In::Map(map) => {
                    left = self.flush_run(parent, left, right, &mut run);
                    left = Some(self.insert_map(parent, left, right, None, &map)?);
                }
            }
        }
        self.flush_run(parent, left, right, &mut run);
        return Ok(());
    }

    fn flush_run(
        &mut self,
        parent: BranchId,
        left: Option<BlockPtr>,
        right: Option<BlockPtr>,
        run: &mut SmallVec<[Any; 1]>,
    ) -> Option<BlockPtr> {
        if run.is_empty() {
            return left;
        }
        let content = ItemContent::Any(std::mem::take(run));
        let item = self.new_item(parent, left, right, content);
        return Some(yata::integrate(self.store, self.state, item));
    }

    /// Set `key` of the map `parent` to `value`.
    pub(crate) fn map_set(&mut self, parent: BranchId, key: Arc<str>, value: In) -> Result<()> {
        let left = self.store.branch(parent).map.get(&key).copied();
        match value {
            In::Any(any) => {
                let mut item = self.new_item(parent, left, None, ItemContent::Any(SmallVec::from_elem(any, 1)));
                item.parent_sub = Some(key);
                yata::integrate(self.store, self.state, item);
            }
            In::Array(array) => {
                self.insert_array(parent, left, None, Some(key), &array)?;
            }
            In::Map(map) => {
                self.insert_map(parent, left, None, Some(key), &map)?;
            }
        }
        return Ok(());
    }

    /// Integrate an item holding a new branch of `kind`. The item takes the
    /// next local id, the one `TypePtr::Nested` of a prior `bind` names.
    fn insert_type(
        &mut self,
        parent: BranchId,
        left: Option<BlockPtr>,
        right: Option<BlockPtr>,
        key: Option<Arc<str>>,
        kind: TypeKind,
    ) -> (BlockPtr, BranchId) {
        let branch = self.store.new_branch(kind);
        let mut item = self.new_item(parent, left, right, ItemContent::Type(branch));
        item.parent_sub = key;
        let ptr = yata::integrate(self.store, self.state, item);
        return (ptr, branch);
    }

    fn insert_array(
        &mut self,
        parent: BranchId,
        left: Option<BlockPtr>,
        right: Option<BlockPtr>,
        key: Option<Arc<str>>,
        array: &ArrayRef,
    ) -> Result<BlockPtr> {
        // Bind before integrating: a failed claim must leave the store untouched.
        let content = array.bind(self.doc.clone(), TypePtr::Nested(yata::next_id(self.store)))?;
        let (ptr, branch) = self.insert_type(parent, left, right, key, TypeKind::Array);
        self.insert_after(branch, None, None, content)?;
        return Ok(ptr);
    }

    fn insert_map(
        &mut self,
        parent: BranchId,
        left: Option<BlockPtr>,
        right: Option<BlockPtr>,
        key: Option<Arc<str>>,
        map: &MapRef,
    ) -> Result<BlockPtr> {
        let entries = map.bind(self.doc.clone(), TypePtr::Nested(yata::next_id(self.store)))?;
        let (ptr, branch) = self.insert_type(parent, left, right, key, TypeKind::Map);
        for (key, value) in entries {
            self.map_set(branch, key, value)?;
        }
        return Ok(ptr);
    }
}

// =============================================================================
// Observation
// =============================================================================

/// Listener registry and address of a bound handle.
pub(crate) fn registry_of(bound: Option<Bound>) -> Result<(Arc<parking_lot::Mutex<Observers>>, TypePtr)> {
    let Some(bound) = bound else {
        return Err(Error::NotIntegrated);
    };
    let Some(doc) = bound.doc.upgrade() else {
        return Err(Error::UseAfterFree("document has been destroyed"));
    };
    return Ok((doc.observers.clone(), bound.ptr));
}
