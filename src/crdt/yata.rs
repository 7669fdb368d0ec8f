//! The YATA integration procedure.
//!
//! YATA (Yet Another Transformation Approach) places every new item, local
//! or remote, by the same rule. The key insight is dual origins: each item
//! stores both its left origin (what it was inserted after) and its right
//! origin (what was to its right when it was inserted). Concurrent inserts
//! between the same pair of origins are ordered by client id, and items
//! inserted into the "subtree" of an earlier sibling stay attached to it.
//! This prevents interleaving of concurrent runs.
//!
//! Local and remote operations share this one code path, which is what
//! guarantees convergence.

use std::sync::Arc;

use rustc_hash::FxHashSet;

use super::block::Block;
use super::block::BlockPtr;
use super::block::BranchId;
use super::block::Item;
use super::block::ItemContent;
use super::primitives::Id;
use super::store::Store;
use crate::error::Error;
use crate::error::Result;
use crate::transaction::TxnState;

// =============================================================================
// Integration
// =============================================================================

/// Integrate `item` between its `left` and `right` neighbours.
///
/// `left` and `right` are where the item was inserted from the point of
/// view of its creator: the blocks ending at `origin` and starting at
/// `right_origin`. Other items may have been integrated between them in
/// the meantime; the scan below decides where among those the new item
/// goes.
pub(crate) fn integrate(store: &mut Store, txn: &mut TxnState, mut item: Item) -> BlockPtr {
    let parent = item.parent;

    // Only scan if the neighbours are no longer adjacent.
    let needs_scan = match (item.left, item.right) {
        (None, None) => true,
        (None, Some(right)) => store.item(right).left.is_some(),
        (Some(left), right) => store.item(left).right != right,
    };

    if needs_scan {
        let mut left = item.left;
        let mut cursor = match left {
            Some(left) => store.item(left).right,
            None => first_entry(store, parent, item.parent_sub.as_ref()),
        };

        // Items scanned so far, and those among them whose order relative
        // to the new item is not decided yet.
        let mut before_origin: FxHashSet<BlockPtr> = FxHashSet::default();
        let mut conflicting: FxHashSet<BlockPtr> = FxHashSet::default();

        while let Some(other_ptr) = cursor {
            if Some(other_ptr) == item.right {
                break;
            }
            before_origin.insert(other_ptr);
            conflicting.insert(other_ptr);

            let other = store.item(other_ptr);
            if other.origin == item.origin {
                // Case 1: a sibling with the same left origin.
                // Lower client ids go first.
                if other.id.client < item.id.client {
                    left = Some(other_ptr);
                    conflicting.clear();
                } else if other.right_origin == item.right_origin {
                    // Same origins on both sides and the sibling wins the
                    // tie-break: the new item goes right before it.
                    break;
                }
                // Otherwise the sibling's right origin lies further right;
                // keep scanning, it may still be positioned before us.
            } else {
                // Case 2: the scanned item hangs off an item we already
                // passed. If that item is settled as preceding us, so is
                // its whole subtree.
                let origin_ptr = other.origin.and_then(|id| store.find(&id));
                match origin_ptr {
                    Some(origin_ptr) if before_origin.contains(&origin_ptr) => {
                        if !conflicting.contains(&origin_ptr) {
                            left = Some(other_ptr);
                            conflicting.clear();
                        }
                    }
                    // Its origin is to our right: we go first.
                    _ => break,
                }
            }
            cursor = other.right;
        }
        item.left = left;
    }

    let id = item.id;
    let len = item.len;
    let left = item.left;
    let parent_sub = item.parent_sub.clone();
    let visible = item.visible_len();
    let deleted_content = matches!(item.content, ItemContent::Deleted(_));
    let nested = match item.content {
        ItemContent::Type(branch) => Some(branch),
        _ => None,
    };

    let ptr = store.alloc(Block::Item(item));

    // Splice into the chain.
    let right = match left {
        Some(left) => {
            let right = store.item(left).right;
            store.item_mut(left).right = Some(ptr);
            right
        }
        None => match &parent_sub {
            Some(_) => first_entry(store, parent, parent_sub.as_ref()),
            None => {
                let right = store.branch(parent).start;
                store.branch_mut(parent).start = Some(ptr);
                right
            }
        },
    };
    store.item_mut(ptr).right = right;

    match right {
        Some(right) => store.item_mut(right).left = Some(ptr),
        None => {
            // The rightmost entry of a key is its current value.
            if let Some(sub) = &parent_sub {
                store.branch_mut(parent).map.insert(sub.clone(), ptr);
                if let Some(left) = left {
                    delete(store, txn, left);
                }
            }
        }
    }

    store.branch_mut(parent).len += visible;
    store.push_block(ptr);

    if deleted_content {
        txn.delete_set.insert(id, len);
    }
    if let Some(branch) = nested {
        store.branch_mut(branch).item = Some(ptr);
    }

    txn.add_changed(store, parent, parent_sub.clone());

    // Entries that are not the rightmost of their key, and anything inserted
    // into a deleted type, are tombstones from the start.
    let parent_deleted = store.is_branch_deleted(parent);
    if parent_deleted || (parent_sub.is_some() && right.is_some()) {
        delete(store, txn, ptr);
    }

    tracing::trace!(%id, len, "integrated item");
    return ptr;
}

/// First item to scan when there is no left neighbour.
fn first_entry(store: &Store, parent: BranchId, parent_sub: Option<&Arc<str>>) -> Option<BlockPtr> {
    match parent_sub {
        Some(sub) => {
            let last = store.branch(parent).map.get(sub)?;
            return Some(store.leftmost(*last));
        }
        None => return store.branch(parent).start,
    }
}

// =============================================================================
// Deletion
// =============================================================================

/// Turn the item at `ptr` into a tombstone. Deleting a shared type deletes
/// everything inside it. Returns false if it was already deleted.
pub(crate) fn delete(store: &mut Store, txn: &mut TxnState, ptr: BlockPtr) -> bool {
    let item = store.item_mut(ptr);
    if item.deleted {
        return false;
    }
    let visible = item.visible_len();
    item.deleted = true;

    let id = item.id;
    let len = item.len;
    let parent = item.parent;
    let parent_sub = item.parent_sub.clone();
    let nested = match item.content {
        ItemContent::Type(branch) => Some(branch),
        _ => None,
    };

    let branch = store.branch_mut(parent);
    branch.len = branch.len.saturating_sub(visible);
    txn.delete_set.insert(id, len);
    txn.add_changed(store, parent, parent_sub);

    if let Some(nested) = nested {
        for child in store.chain(nested) {
            if !store.item(child).deleted {
                delete(store, txn, child);
            }
        }
        let entries: Vec<BlockPtr> = store.branch(nested).map.values().copied().collect();
        for entry in entries {
            if !store.item(entry).deleted {
                delete(store, txn, entry);
            }
        }
        txn.changed.shift_remove(&nested);
    }
    return true;
}

// =============================================================================
// Sequence positions
// =============================================================================

/// Id for the next locally created unit.
pub(crate) fn next_id(store: &Store) -> Id {
    let client = store.client_id();
    return Id::new(client, store.get_state(client));
}

/// Translate a visible index into the neighbours a new item goes between,
/// splitting a run if the index falls inside it.
pub(crate) fn position(
    store: &mut Store,
    branch: BranchId,
    index: u32,
) -> Result<(Option<BlockPtr>, Option<BlockPtr>)> {
    let len = store.branch(branch).len;
    if index > len {
        return Err(Error::OutOfRange { index, len });
    }
    if index == 0 {
        return Ok((None, store.branch(branch).start));
    }

    let mut remaining = index;
    let mut cursor = store.branch(branch).start;
    while let Some(ptr) = cursor {
        let item = store.item(ptr);
        if item.visible_len() > 0 {
            let (id, item_len) = (item.id, item.len);
            if remaining <= item_len {
                if remaining < item_len {
                    store.clean_start(&id.offset(remaining))?;
                }
                return Ok((Some(ptr), store.item(ptr).right));
            }
            remaining -= item_len;
        }
        cursor = store.item(ptr).right;
    }
    return Err(Error::OutOfRange { index, len });
}

/// The last item of the sequence, tombstones included.
pub(crate) fn last_item(store: &Store, branch: BranchId) -> Option<BlockPtr> {
    let mut cursor = store.branch(branch).start?;
    while let Some(right) = store.item(cursor).right {
        cursor = right;
    }
    return Some(cursor);
}

/// Delete `len` visible units starting at `index`.
pub(crate) fn remove_range(
    store: &mut Store,
    txn: &mut TxnState,
    branch: BranchId,
    index: u32,
    len: u32,
) -> Result<()> {
    let total = store.branch(branch).len;
    let end = index.checked_add(len).ok_or(Error::OutOfRange { index, len: total })?;
    if end > total {
        return Err(Error::OutOfRange { index: end, len: total });
    }
    if len == 0 {
        return Ok(());
    }

    // Find the first item to delete, splitting the run it starts in.
    let mut skip = index;
    let mut cursor = store.branch(branch).start;
    while let Some(ptr) = cursor {
        if skip == 0 {
            break;
        }
        let item = store.item(ptr);
        if item.visible_len() > 0 {
            let (id, item_len) = (item.id, item.len);
            if skip < item_len {
                store.clean_start(&id.offset(skip))?;
            }
            skip -= store.item(ptr).len;
        }
        cursor = store.item(ptr).right;
    }

    // Delete until done, splitting the last run.
    let mut remaining = len;
    while remaining > 0 {
        let Some(ptr) = cursor else {
            break;
        };
        let item = store.item(ptr);
        if !item.deleted {
            let (id, item_len) = (item.id, item.len);
            if remaining < item_len {
                store.clean_start(&id.offset(remaining))?;
            }
            let visible = store.item(ptr).visible_len();
            delete(store, txn, ptr);
            remaining -= visible.min(remaining);
        }
        cursor = store.item(ptr).right;
    }
    return Ok(());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::any::Any;
    use crate::crdt::branch::TypeKind;
    use crate::crdt::primitives::StateVector;
    use smallvec::SmallVec;

    fn values(store: &Store, branch: BranchId) -> Vec<Any> {
        let mut out = Vec::new();
        for ptr in store.chain(branch) {
            let item = store.item(ptr);
            if item.deleted {
                continue;
            }
            if let ItemContent::Any(values) = &item.content {
                out.extend(values.iter().cloned());
            }
        }
        return out;
    }

    fn local_insert(store: &mut Store, txn: &mut TxnState, branch: BranchId, index: u32, vals: &[i32]) {
        let (left, right) = position(store, branch, index).unwrap();
        let content: SmallVec<[Any; 1]> = vals.iter().map(|v| Any::from(*v)).collect();
        let item = Item {
            id: next_id(store),
            len: vals.len() as u32,
            left,
            right,
            origin: left.map(|l| store.item(l).last_id()),
            right_origin: right.map(|r| store.item(r).id),
            parent: branch,
            parent_sub: None,
            content: ItemContent::Any(content),
            deleted: false,
        };
        integrate(store, txn, item);
    }

    fn setup(client: u64) -> (Store, TxnState, BranchId) {
        let mut store = Store::new(client);
        let root = store.get_or_create_root(&"list".into(), TypeKind::Array).unwrap();
        let txn = TxnState::new(StateVector::new());
        return (store, txn, root);
    }

    #[test]
    fn insert_in_order() {
        let (mut store, mut txn, root) = setup(1);
        local_insert(&mut store, &mut txn, root, 0, &[1, 2, 3]);
        local_insert(&mut store, &mut txn, root, 3, &[4]);
        local_insert(&mut store, &mut txn, root, 0, &[0]);
        local_insert(&mut store, &mut txn, root, 2, &[9]);

        let expected: Vec<Any> = [0, 1, 9, 2, 3, 4].iter().map(|v| Any::from(*v)).collect();
        assert_eq!(values(&store, root), expected);
        assert_eq!(store.branch(root).len, 6);
    }

    #[test]
    fn out_of_range_insert() {
        let (mut store, _txn, root) = setup(1);
        let err = position(&mut store, root, 1).unwrap_err();
        assert!(matches!(err, Error::OutOfRange { index: 1, len: 0 }));
    }

    #[test]
    fn remove_middle() {
        let (mut store, mut txn, root) = setup(1);
        local_insert(&mut store, &mut txn, root, 0, &[1, 2, 3, 4]);
        remove_range(&mut store, &mut txn, root, 1, 2).unwrap();

        let expected: Vec<Any> = [1, 4].iter().map(|v| Any::from(*v)).collect();
        assert_eq!(values(&store, root), expected);
        assert_eq!(store.branch(root).len, 2);
        assert!(txn.delete_set.contains(&Id::new(1, 1)));
        assert!(txn.delete_set.contains(&Id::new(1, 2)));
        assert!(!txn.delete_set.contains(&Id::new(1, 3)));
    }

    #[test]
    fn remove_is_bounds_checked() {
        let (mut store, mut txn, root) = setup(1);
        local_insert(&mut store, &mut txn, root, 0, &[1, 2]);
        assert!(remove_range(&mut store, &mut txn, root, 1, 2).is_err());
        assert_eq!(store.branch(root).len, 2);
    }

    #[test]
    fn delete_twice_is_noop() {
        let (mut store, mut txn, root) = setup(1);
        local_insert(&mut store, &mut txn, root, 0, &[1]);
        let ptr = store.branch(root).start.unwrap();
        assert!(delete(&mut store, &mut txn, ptr));
        assert!(!delete(&mut store, &mut txn, ptr));
        assert_eq!(store.branch(root).len, 0);
    }

    #[test]
    fn concurrent_siblings_order_by_client() {
        // Two items with no origins at all, integrated in both orders.
        for order in [[1u64, 2u64], [2, 1]] {
            let (mut store, mut txn, root) = setup(9);
            for client in order {
                let item = Item {
                    id: Id::new(client, 0),
                    len: 1,
                    left: None,
                    right: None,
                    origin: None,
                    right_origin: None,
                    parent: root,
                    parent_sub: None,
                    content: ItemContent::Any(SmallVec::from_elem(Any::from(client as i32), 1)),
                    deleted: false,
                };
                integrate(&mut store, &mut txn, item);
            }
            assert_eq!(values(&store, root), vec![Any::from(1), Any::from(2)]);
        }
    }
}
