//! Blocks: the units stored in the document arena.
//!
//! An `Item` is a run of content inserted by one client with consecutive
//! clocks. Items of the same parent form a doubly-linked list in document
//! order. Deletion only flips the `deleted` flag; the item keeps its place
//! in the list so that concurrent inserts referring to it can still be
//! positioned.
//!
//! Each item stores two immutable origins:
//! - `origin`: the last unit to its left when it was inserted
//! - `right_origin`: the unit to its right when it was inserted
//!
//! A `Gc` block is a reclaimed clock range with no content and no position.

use std::sync::Arc;

use smallvec::SmallVec;

use super::any::Any;
use super::primitives::Id;

/// Index of a block in the store arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct BlockPtr(pub(crate) u32);

/// Index of a shared type in the store arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct BranchId(pub(crate) u32);

/// Content reference numbers used on the wire.
pub(crate) const REF_GC: u8 = 0;
pub(crate) const REF_DELETED: u8 = 1;
pub(crate) const REF_BINARY: u8 = 3;
pub(crate) const REF_TYPE: u8 = 7;
pub(crate) const REF_ANY: u8 = 8;
pub(crate) const REF_SKIP: u8 = 10;

// =============================================================================
// Item content
// =============================================================================

/// What an item holds.
#[derive(Clone, Debug)]
pub(crate) enum ItemContent {
    /// A run of plain values; one clock unit per value.
    Any(SmallVec<[Any; 1]>),
    /// An opaque byte buffer; one clock unit.
    Binary(Arc<[u8]>),
    /// A reclaimed or remotely-deleted run; counts clocks but not positions.
    Deleted(u32),
    /// A nested shared type; one clock unit.
    Type(BranchId),
}

impl ItemContent {
    /// Number of clock units covered.
    pub(crate) fn len(&self) -> u32 {
        match self {
            ItemContent::Any(values) => return values.len() as u32,
            ItemContent::Binary(_) => return 1,
            ItemContent::Deleted(len) => return *len,
            ItemContent::Type(_) => return 1,
        }
    }

    /// Whether the content occupies positions in a sequence.
    pub(crate) fn is_countable(&self) -> bool {
        return !matches!(self, ItemContent::Deleted(_));
    }

    pub(crate) fn ref_number(&self) -> u8 {
        match self {
            ItemContent::Any(_) => return REF_ANY,
            ItemContent::Binary(_) => return REF_BINARY,
            ItemContent::Deleted(_) => return REF_DELETED,
            ItemContent::Type(_) => return REF_TYPE,
        }
    }

    /// Split off the content from `offset` onwards, keeping `[0, offset)`.
    /// Returns `None`, leaving the content untouched, when `offset` is not
    /// strictly inside it.
    pub(crate) fn splice(&mut self, offset: u32) -> Option<ItemContent> {
        if offset == 0 || offset >= self.len() {
            return None;
        }
        match self {
            ItemContent::Any(values) => {
                let right: SmallVec<[Any; 1]> = values.drain(offset as usize..).collect();
                return Some(ItemContent::Any(right));
            }
            ItemContent::Deleted(len) => {
                let right = *len - offset;
                *len = offset;
                return Some(ItemContent::Deleted(right));
            }
            ItemContent::Binary(_) | ItemContent::Type(_) => return None,
        }
    }

    /// Append `other` to this content if both are the same mergeable kind.
    pub(crate) fn try_squash(&mut self, other: &ItemContent) -> bool {
        match (self, other) {
            (ItemContent::Any(left), ItemContent::Any(right)) => {
                left.extend(right.iter().cloned());
                return true;
            }
            (ItemContent::Deleted(left), ItemContent::Deleted(right)) => {
                *left += *right;
                return true;
            }
            _ => return false,
        }
    }
}

// =============================================================================
// Item
// =============================================================================

/// An integrated run of content.
#[derive(Clone, Debug)]
pub(crate) struct Item {
    /// Id of the first unit.
    pub(crate) id: Id,
    /// Number of clock units.
    pub(crate) len: u32,

    /// Neighbours in document order (tombstones included).
    pub(crate) left: Option<BlockPtr>,
    pub(crate) right: Option<BlockPtr>,

    /// Left origin: the unit that was to the left at insertion time.
    /// None means inserted at the beginning.
    pub(crate) origin: Option<Id>,
    /// Right origin: the unit that was to the right at insertion time.
    /// None means inserted at the end.
    pub(crate) right_origin: Option<Id>,

    /// Owning shared type.
    pub(crate) parent: BranchId,
    /// Map key, when the parent is used as a map.
    pub(crate) parent_sub: Option<Arc<str>>,

    pub(crate) content: ItemContent,
    /// Tombstone flag.
    pub(crate) deleted: bool,
}

impl Item {
    /// Id of the last unit covered by this item.
    #[inline]
    pub(crate) fn last_id(&self) -> Id {
        return self.id.offset(self.len - 1);
    }

    #[inline]
    pub(crate) fn is_countable(&self) -> bool {
        return self.content.is_countable();
    }

    /// Number of positions this item occupies in its parent sequence.
    #[inline]
    pub(crate) fn visible_len(&self) -> u32 {
        if self.deleted || !self.is_countable() || self.parent_sub.is_some() {
            return 0;
        }
        return self.len;
    }

    /// Check if this item covers the given id.
    #[inline]
    pub(crate) fn contains(&self, id: &Id) -> bool {
        return self.id.client == id.client
            && id.clock >= self.id.clock
            && id.clock < self.id.clock + self.len;
    }
}

// =============================================================================
// Block
// =============================================================================

/// A slot in a client's block list.
#[derive(Clone, Debug)]
pub(crate) enum Block {
    Item(Item),
    Gc { id: Id, len: u32 },
}

impl Block {
    #[inline]
    pub(crate) fn id(&self) -> Id {
        match self {
            Block::Item(item) => return item.id,
            Block::Gc { id, .. } => return *id,
        }
    }

    #[inline]
    pub(crate) fn len(&self) -> u32 {
        match self {
            Block::Item(item) => return item.len,
            Block::Gc { len, .. } => return *len,
        }
    }

    /// Gc blocks count as deleted.
    #[inline]
    pub(crate) fn is_deleted(&self) -> bool {
        match self {
            Block::Item(item) => return item.deleted,
            Block::Gc { .. } => return true,
        }
    }

    #[inline]
    pub(crate) fn as_item(&self) -> Option<&Item> {
        match self {
            Block::Item(item) => return Some(item),
            Block::Gc { .. } => return None,
        }
    }

    #[inline]
    pub(crate) fn as_item_mut(&mut self) -> Option<&mut Item> {
        match self {
            Block::Item(item) => return Some(item),
            Block::Gc { .. } => return None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    fn any_content(values: &[i32]) -> ItemContent {
        return ItemContent::Any(values.iter().map(|v| Any::from(*v)).collect());
    }

    #[test]
    fn splice_any() {
        let mut content = any_content(&[1, 2, 3, 4]);
        let right = content.splice(1).unwrap();
        assert_eq!(content.len(), 1);
        assert_eq!(right.len(), 3);
        match right {
            ItemContent::Any(values) => assert_eq!(values[0], Any::from(2)),
            other => panic!("expected Any, got {other:?}"),
        }
    }

    #[test]
    fn splice_deleted() {
        let mut content = ItemContent::Deleted(5);
        let right = content.splice(2).unwrap();
        assert_eq!(content.len(), 2);
        assert_eq!(right.len(), 3);
        assert!(!right.is_countable());
    }

    #[test]
    fn splice_outside_content_is_refused() {
        let mut ty = ItemContent::Type(BranchId(0));
        assert!(ty.splice(1).is_none());
        let mut binary = ItemContent::Binary(Arc::from(&[1u8, 2][..]));
        assert!(binary.splice(1).is_none());

        let mut content = any_content(&[1, 2]);
        assert!(content.splice(0).is_none());
        assert!(content.splice(2).is_none());
        assert_eq!(content.len(), 2);
    }

    #[test]
    fn squash_same_kind_only() {
        let mut left = any_content(&[1]);
        assert!(left.try_squash(&any_content(&[2, 3])));
        assert_eq!(left.len(), 3);

        let mut deleted = ItemContent::Deleted(2);
        assert!(!deleted.try_squash(&any_content(&[1])));
        assert!(deleted.try_squash(&ItemContent::Deleted(1)));
        assert_eq!(deleted.len(), 3);

        let mut ty = ItemContent::Type(BranchId(0));
        assert!(!ty.try_squash(&ItemContent::Type(BranchId(1))));
    }

    #[test]
    fn item_ranges() {
        let item = Item {
            id: Id::new(1, 10),
            len: 3,
            left: None,
            right: None,
            origin: None,
            right_origin: None,
            parent: BranchId(0),
            parent_sub: None,
            content: ItemContent::Any(smallvec![Any::Null, Any::Null, Any::Null]),
            deleted: false,
        };
        assert_eq!(item.last_id(), Id::new(1, 12));
        assert!(item.contains(&Id::new(1, 11)));
        assert!(!item.contains(&Id::new(1, 13)));
        assert!(!item.contains(&Id::new(2, 11)));
        assert_eq!(item.visible_len(), 3);
    }
}
