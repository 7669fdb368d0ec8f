//! The shared array: an ordered sequence of values and nested types.

use std::sync::Arc;
use std::sync::Weak;

use parking_lot::Mutex;

use super::Binding;
use super::Bound;
use super::In;
use super::Out;
use super::check_prelims;
use super::content_value;
use super::content_values;
use super::read_branch;
use super::registry_of;
use super::same_binding;
use super::write_branch;
use crate::crdt::any::Any;
use crate::crdt::branch::TypeKind;
use crate::crdt::branch::TypePtr;
use crate::crdt::yata;
use crate::doc::DocInner;
use crate::error::Error;
use crate::error::Result;
use crate::event;
use crate::event::ArrayEvent;
use crate::event::Event;
use crate::event::Subscription;
use crate::transaction::Transaction;

/// Handle to a shared array.
///
/// Clones share identity: inserting a preliminary array binds every clone
/// of it.
#[derive(Clone)]
pub struct ArrayRef {
    inner: Arc<Mutex<Binding<Vec<In>>>>,
}

impl ArrayRef {
    /// A preliminary, empty array.
    pub fn new() -> ArrayRef {
        return ArrayRef::with_values(Vec::<In>::new());
    }

    /// A preliminary array holding `values`.
    pub fn with_values<V: Into<In>>(values: impl IntoIterator<Item = V>) -> ArrayRef {
        let values = values.into_iter().map(Into::into).collect();
        return ArrayRef {
            inner: Arc::new(Mutex::new(Binding::Prelim(values))),
        };
    }

    pub(crate) fn bound(doc: Weak<DocInner>, ptr: TypePtr) -> ArrayRef {
        return ArrayRef {
            inner: Arc::new(Mutex::new(Binding::Integrated(Bound { doc, ptr }))),
        };
    }

    /// Whether the array is part of a document.
    pub fn is_integrated(&self) -> bool {
        return matches!(&*self.inner.lock(), Binding::Integrated(_));
    }

    pub(crate) fn addr(&self) -> usize {
        return Arc::as_ptr(&self.inner) as *const () as usize;
    }

    pub(crate) fn prelim_children(&self) -> Option<Vec<In>> {
        match &*self.inner.lock() {
            Binding::Prelim(values) => return Some(values.clone()),
            Binding::Integrated(_) => return None,
        }
    }

    /// Bind to the integrated type at `ptr`, returning the buffered values.
    pub(crate) fn bind(&self, doc: Weak<DocInner>, ptr: TypePtr) -> Result<Vec<In>> {
        let mut guard = self.inner.lock();
        if let Binding::Integrated(_) = &*guard {
            return Err(Error::AlreadyIntegrated);
        }
        match std::mem::replace(&mut *guard, Binding::Integrated(Bound { doc, ptr })) {
            Binding::Prelim(values) => return Ok(values),
            Binding::Integrated(_) => return Err(Error::AlreadyIntegrated),
        }
    }

    /// Run `f` on the buffered values, or return the bound address.
    fn with_prelim<R>(&self, f: impl FnOnce(&mut Vec<In>) -> R) -> std::result::Result<R, Bound> {
        let mut guard = self.inner.lock();
        match &mut *guard {
            Binding::Prelim(values) => return Ok(f(values)),
            Binding::Integrated(bound) => return Err(bound.clone()),
        }
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Number of visible elements. A handle that cannot be resolved through
    /// `txn` reads as empty.
    pub fn len(&self, txn: &Transaction<'_>) -> u32 {
        let bound = match self.with_prelim(|values| values.len() as u32) {
            Ok(len) => return len,
            Err(bound) => bound,
        };
        match read_branch(txn, &bound, TypeKind::Array) {
            Ok(Some(branch)) => return txn.store().branch(branch).len,
            _ => return 0,
        }
    }

    pub fn is_empty(&self, txn: &Transaction<'_>) -> bool {
        return self.len(txn) == 0;
    }

    /// The element at `index`.
    pub fn get(&self, txn: &Transaction<'_>, index: u32) -> Result<Out> {
        let bound = match self.with_prelim(|values| {
            let len = values.len() as u32;
            return values
                .get(index as usize)
                .cloned()
                .map(Out::from)
                .ok_or(Error::OutOfRange { index, len });
        }) {
            Ok(result) => return result,
            Err(bound) => bound,
        };
        let Some(branch) = read_branch(txn, &bound, TypeKind::Array)? else {
            return Err(Error::OutOfRange { index, len: 0 });
        };

        let store = txn.store();
        let mut remaining = index;
        let mut cursor = store.branch(branch).start;
        while let Some(ptr) = cursor {
            let item = store.item(ptr);
            let visible = item.visible_len();
            if remaining < visible {
                return Ok(content_value(store, &bound.doc, &item.content, remaining));
            }
            remaining -= visible;
            cursor = item.right;
        }
        return Err(Error::OutOfRange {
            index,
            len: store.branch(branch).len,
        });
    }

    /// The visible elements in order.
    pub fn iter(&self, txn: &Transaction<'_>) -> std::vec::IntoIter<Out> {
        let bound = match self.with_prelim(|values| values.iter().cloned().map(Out::from).collect::<Vec<_>>()) {
            Ok(values) => return values.into_iter(),
            Err(bound) => bound,
        };
        let Ok(Some(branch)) = read_branch(txn, &bound, TypeKind::Array) else {
            return Vec::new().into_iter();
        };

        let store = txn.store();
        let mut out = Vec::with_capacity(store.branch(branch).len as usize);
        let mut cursor = store.branch(branch).start;
        while let Some(ptr) = cursor {
            let item = store.item(ptr);
            if item.visible_len() > 0 {
                out.extend(content_values(store, &bound.doc, &item.content));
            }
            cursor = item.right;
        }
        return out.into_iter();
    }

    /// Materialize the array, expanding nested types.
    pub fn to_json(&self, txn: &Transaction<'_>) -> Any {
        let values: Vec<Any> = self.iter(txn).map(|value| value.to_json(txn)).collect();
        return Any::Array(values.into());
    }

    // =========================================================================
    // Writes
    // =========================================================================

    pub fn insert(&self, txn: &mut Transaction<'_>, index: u32, value: impl Into<In>) -> Result<()> {
        return self.insert_range(txn, index, [value]);
    }

    /// Insert `values` starting at `index`. Shared types among them must be
    /// preliminary and are integrated along with their content.
    pub fn insert_range<V: Into<In>>(
        &self,
        txn: &mut Transaction<'_>,
        index: u32,
        values: impl IntoIterator<Item = V>,
    ) -> Result<()> {
        if txn.is_committed() {
            return Err(Error::NoActiveTransaction);
        }
        let values: Vec<In> = values.into_iter().map(Into::into).collect();
        check_prelims(&values, &[self.addr()])?;

        let bound = match self.with_prelim(|buffer| {
            let len = buffer.len() as u32;
            if index > len {
                return Err(Error::OutOfRange { index, len });
            }
            let at = index as usize;
            buffer.splice(at..at, values.iter().cloned());
            return Ok(());
        }) {
            Ok(result) => return result,
            Err(bound) => bound,
        };

        let (branch, mut writer) = write_branch(txn, &bound, TypeKind::Array)?;
        let (left, right) = yata::position(writer.store, branch, index)?;
        return writer.insert_after(branch, left, right, values);
    }

    /// Append `value` after the last element.
    pub fn push(&self, txn: &mut Transaction<'_>, value: impl Into<In>) -> Result<()> {
        return self.push_range(txn, [value]);
    }

    pub fn push_range<V: Into<In>>(&self, txn: &mut Transaction<'_>, values: impl IntoIterator<Item = V>) -> Result<()> {
        if txn.is_committed() {
            return Err(Error::NoActiveTransaction);
        }
        let values: Vec<In> = values.into_iter().map(Into::into).collect();
        check_prelims(&values, &[self.addr()])?;

        let bound = match self.with_prelim(|buffer| buffer.extend(values.iter().cloned())) {
            Ok(()) => return Ok(()),
            Err(bound) => bound,
        };

        let (branch, mut writer) = write_branch(txn, &bound, TypeKind::Array)?;
        let left = yata::last_item(writer.store, branch);
        return writer.insert_after(branch, left, None, values);
    }

    pub fn remove(&self, txn: &mut Transaction<'_>, index: u32) -> Result<()> {
        return self.remove_range(txn, index, 1);
    }

    /// Delete `len` elements starting at `index`.
    pub fn remove_range(&self, txn: &mut Transaction<'_>, index: u32, len: u32) -> Result<()> {
        if txn.is_committed() {
            return Err(Error::NoActiveTransaction);
        }
        let bound = match self.with_prelim(|buffer| {
            let total = buffer.len() as u32;
            let end = index.saturating_add(len);
            if end > total {
                return Err(Error::OutOfRange { index: end, len: total });
            }
            buffer.drain(index as usize..end as usize);
            return Ok(());
        }) {
            Ok(result) => return result,
            Err(bound) => bound,
        };

        let (branch, writer) = write_branch(txn, &bound, TypeKind::Array)?;
        return yata::remove_range(writer.store, writer.state, branch, index, len);
    }

    // =========================================================================
    // Observers
    // =========================================================================

    /// Call `f` after every commit that changed this array.
    pub fn observe<F>(&self, f: F) -> Result<Subscription>
    where
        F: Fn(&Transaction<'_>, &ArrayEvent) + Send + Sync + 'static,
    {
        let (registry, ptr) = registry_of(self.inner.lock().bound())?;
        let callback = Arc::new(move |txn: &Transaction<'_>, event: &Event| {
            if let Event::Array(event) = event {
                f(txn, event);
            }
        });
        return Ok(event::subscribe_shallow(&registry, ptr, callback));
    }

    /// Call `f` after every commit that changed this array or any type
    /// nested in it.
    pub fn observe_deep<F>(&self, f: F) -> Result<Subscription>
    where
        F: Fn(&Transaction<'_>, &[Event]) + Send + Sync + 'static,
    {
        let (registry, ptr) = registry_of(self.inner.lock().bound())?;
        return Ok(event::subscribe_deep(&registry, ptr, Arc::new(f)));
    }
}

impl Default for ArrayRef {
    fn default() -> Self {
        return ArrayRef::new();
    }
}

impl PartialEq for ArrayRef {
    fn eq(&self, other: &Self) -> bool {
        if Arc::ptr_eq(&self.inner, &other.inner) {
            return true;
        }
        return same_binding(&*self.inner.lock(), &*other.inner.lock());
    }
}

impl std::fmt::Debug for ArrayRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &*self.inner.lock() {
            Binding::Prelim(values) => return f.debug_tuple("ArrayRef::Prelim").field(values).finish(),
            Binding::Integrated(bound) => return f.debug_tuple("ArrayRef").field(&bound.ptr).finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc::Doc;
    use crate::types::MapRef;

    #[test]
    fn prelim_buffers_until_inserted() {
        let doc = Doc::with_client_id(1);
        let root = doc.get_array("root").unwrap();
        let nested = ArrayRef::with_values([1, 2]);
        assert!(!nested.is_integrated());

        let mut txn = doc.transact().unwrap();
        nested.push(&mut txn, 3).unwrap();
        root.push(&mut txn, nested.clone()).unwrap();
        assert!(nested.is_integrated());
        nested.insert(&mut txn, 0, 0).unwrap();

        let json = root.to_json(&txn);
        assert_eq!(json.to_string(), "[[0,1,2,3]]");
    }

    #[test]
    fn inserting_twice_fails() {
        let doc = Doc::with_client_id(1);
        let root = doc.get_array("root").unwrap();
        let nested = ArrayRef::new();

        let mut txn = doc.transact().unwrap();
        root.push(&mut txn, nested.clone()).unwrap();
        let err = root.push(&mut txn, nested.clone()).unwrap_err();
        assert!(matches!(err, Error::AlreadyIntegrated));
        root.push_range(&mut txn, [ArrayRef::new(), ArrayRef::new()]).unwrap();
        assert_eq!(root.len(&txn), 3);
    }

    #[test]
    fn failed_claim_leaves_store_untouched() {
        let doc = Doc::with_client_id(1);
        let root = doc.get_array("root").unwrap();
        let nested_array = ArrayRef::new();
        let nested_map = MapRef::new();

        let mut txn = doc.transact().unwrap();
        root.push_range(&mut txn, [In::from(nested_array.clone()), In::from(nested_map.clone())]).unwrap();
        let before = txn.state_vector();

        // Skip the up-front prelim check and write the bound handles again.
        let Err(bound) = root.with_prelim(|_| ()) else {
            panic!("root is integrated");
        };
        let (branch, mut writer) = write_branch(&mut txn, &bound, TypeKind::Array).unwrap();
        let err = writer.insert_after(branch, None, None, vec![nested_array.into()]).unwrap_err();
        assert!(matches!(err, Error::AlreadyIntegrated));
        let err = writer.insert_after(branch, None, None, vec![nested_map.into()]).unwrap_err();
        assert!(matches!(err, Error::AlreadyIntegrated));
        drop(writer);

        assert_eq!(txn.state_vector(), before);
        assert_eq!(root.len(&txn), 2);
    }

    #[test]
    fn prelim_cannot_contain_itself() {
        let doc = Doc::with_client_id(1);
        let array = ArrayRef::new();
        let mut txn = doc.transact().unwrap();
        let err = array.push(&mut txn, array.clone()).unwrap_err();
        assert!(matches!(err, Error::AlreadyIntegrated));
    }

    #[test]
    fn push_appends_after_tombstones() {
        let doc = Doc::with_client_id(1);
        let root = doc.get_array("root").unwrap();
        let mut txn = doc.transact().unwrap();
        root.push_range(&mut txn, [1, 2, 3]).unwrap();
        root.remove_range(&mut txn, 1, 2).unwrap();
        root.push(&mut txn, 4).unwrap();
        assert_eq!(root.to_json(&txn).to_string(), "[1,4]");
        assert!(matches!(
            root.remove_range(&mut txn, 1, 2),
            Err(Error::OutOfRange { index: 3, len: 2 })
        ));
    }
}
