//! The item store: an arena of blocks indexed per client.
//!
//! Every block lives in one arena slot addressed by a `BlockPtr`. Links
//! between items (left/right neighbours, branch heads, map entries) are
//! arena indices, never references, so the origin graph can grow
//! arbitrarily without ownership cycles.
//!
//! Per client, block pointers are kept in clock order. Lists are dense:
//! block `i + 1` starts exactly where block `i` ends, starting at clock
//! zero, so the next expected clock is the end of the last block.
//!
//! Complexity:
//! - find by id: O(log n) binary search over the client's list
//! - split: O(n) for the list insertion, O(1) for relinking
//! - squash: O(n) per removed block

use std::sync::Arc;

use rustc_hash::FxHashMap;

use super::block::Block;
use super::block::BlockPtr;
use super::block::BranchId;
use super::block::Item;
use super::block::ItemContent;
use super::branch::Branch;
use super::branch::TypeKind;
use super::branch::TypePtr;
use super::primitives::ClientId;
use super::primitives::DeleteSet;
use super::primitives::Id;
use super::primitives::StateVector;
use crate::error::Error;
use crate::error::Result;
use crate::update::Pending;

/// All blocks and shared types of one document.
#[derive(Debug)]
pub(crate) struct Store {
    client_id: ClientId,

    blocks: Vec<Option<Block>>,
    free: Vec<u32>,
    clients: FxHashMap<ClientId, Vec<BlockPtr>>,

    branches: Vec<Branch>,
    roots: FxHashMap<Arc<str>, BranchId>,

    /// Remote blocks waiting for missing dependencies.
    pub(crate) pending: Option<Pending>,
    /// Remote deletions referring to clocks not yet integrated.
    pub(crate) pending_ds: Option<DeleteSet>,
    /// Ids at which blocks were split since the last squash.
    pub(crate) splits: Vec<Id>,
}

impl Store {
    pub(crate) fn new(client_id: ClientId) -> Store {
        return Store {
            client_id,
            blocks: Vec::new(),
            free: Vec::new(),
            clients: FxHashMap::default(),
            branches: Vec::new(),
            roots: FxHashMap::default(),
            pending: None,
            pending_ds: None,
            splits: Vec::new(),
        };
    }

    #[inline]
    pub(crate) fn client_id(&self) -> ClientId {
        return self.client_id;
    }

    // =========================================================================
    // Arena
    // =========================================================================

    pub(crate) fn alloc(&mut self, block: Block) -> BlockPtr {
        if let Some(slot) = self.free.pop() {
            self.blocks[slot as usize] = Some(block);
            return BlockPtr(slot);
        }
        self.blocks.push(Some(block));
        return BlockPtr(self.blocks.len() as u32 - 1);
    }

    fn take(&mut self, ptr: BlockPtr) -> Option<Block> {
        let block = self.blocks[ptr.0 as usize].take();
        if block.is_some() {
            self.free.push(ptr.0);
        }
        return block;
    }

    #[inline]
    pub(crate) fn block(&self, ptr: BlockPtr) -> &Block {
        match &self.blocks[ptr.0 as usize] {
            Some(block) => return block,
            None => panic!("dangling block pointer {ptr:?}"),
        }
    }

    #[inline]
    pub(crate) fn block_mut(&mut self, ptr: BlockPtr) -> &mut Block {
        match &mut self.blocks[ptr.0 as usize] {
            Some(block) => return block,
            None => panic!("dangling block pointer {ptr:?}"),
        }
    }

    /// The item at `ptr`. Only linked pointers are passed here, and linked
    /// blocks are always items.
    #[inline]
    pub(crate) fn item(&self, ptr: BlockPtr) -> &Item {
        match self.block(ptr) {
            Block::Item(item) => return item,
            Block::Gc { id, .. } => panic!("expected item at {id}, found gc"),
        }
    }

    #[inline]
    pub(crate) fn item_mut(&mut self, ptr: BlockPtr) -> &mut Item {
        match self.block_mut(ptr) {
            Block::Item(item) => return item,
            Block::Gc { id, .. } => panic!("expected item at {id}, found gc"),
        }
    }

    /// Number of live blocks.
    pub(crate) fn block_count(&self) -> usize {
        return self.blocks.len() - self.free.len();
    }

    // =========================================================================
    // Client lists
    // =========================================================================

    /// Next expected clock of `client`.
    pub(crate) fn get_state(&self, client: ClientId) -> u32 {
        let Some(list) = self.clients.get(&client) else {
            return 0;
        };
        let Some(last) = list.last() else {
            return 0;
        };
        let block = self.block(*last);
        return block.id().clock + block.len();
    }

    pub(crate) fn state_vector(&self) -> StateVector {
        return self
            .clients
            .keys()
            .map(|client| (*client, self.get_state(*client)))
            .collect();
    }

    pub(crate) fn client_blocks(&self, client: ClientId) -> &[BlockPtr] {
        return self
            .clients
            .get(&client)
            .map(|list| list.as_slice())
            .unwrap_or(&[]);
    }

    pub(crate) fn client_ids(&self) -> Vec<ClientId> {
        return self.clients.keys().copied().collect();
    }

    /// Append a freshly integrated block to its client's list.
    pub(crate) fn push_block(&mut self, ptr: BlockPtr) {
        let id = self.block(ptr).id();
        debug_assert_eq!(id.clock, self.get_state(id.client));
        self.clients.entry(id.client).or_default().push(ptr);
    }

    /// Index of the block covering `clock` in `client`'s list.
    pub(crate) fn find_index(&self, client: ClientId, clock: u32) -> Option<usize> {
        let list = self.clients.get(&client)?;
        let idx = list.partition_point(|ptr| {
            let block = self.block(*ptr);
            block.id().clock + block.len() <= clock
        });
        if idx < list.len() && self.block(list[idx]).id().clock <= clock {
            return Some(idx);
        }
        return None;
    }

    /// The block covering `id`.
    pub(crate) fn find(&self, id: &Id) -> Option<BlockPtr> {
        let idx = self.find_index(id.client, id.clock)?;
        return Some(self.clients[&id.client][idx]);
    }

    /// Split the block at `ptr` so that a new block starts `offset` units in.
    /// Returns the right half. Fails without touching the store when
    /// `offset` is not strictly inside a splittable block.
    pub(crate) fn split_block(&mut self, ptr: BlockPtr, offset: u32) -> Result<BlockPtr> {
        let right = match self.block_mut(ptr) {
            Block::Item(item) => {
                let split_id = item.id.offset(offset);
                let content = if offset > 0 && item.contains(&split_id) {
                    item.content.splice(offset)
                } else {
                    None
                };
                let Some(content) = content else {
                    return Err(Error::malformed(format!("cannot split {} at offset {offset}", item.id)));
                };
                let right = Item {
                    id: item.id.offset(offset),
                    len: item.len - offset,
                    left: Some(ptr),
                    right: item.right,
                    origin: Some(item.id.offset(offset - 1)),
                    right_origin: item.right_origin,
                    parent: item.parent,
                    parent_sub: item.parent_sub.clone(),
                    content,
                    deleted: item.deleted,
                };
                item.len = offset;
                Block::Item(right)
            }
            Block::Gc { id, len } => {
                if offset == 0 || offset >= *len {
                    return Err(Error::malformed(format!("cannot split gc {id} at offset {offset}")));
                }
                let right = Block::Gc {
                    id: id.offset(offset),
                    len: *len - offset,
                };
                *len = offset;
                right
            }
        };
        let right_id = right.id();
        let right_ptr = self.alloc(right);

        let is_item = matches!(self.block(ptr), Block::Item(_));
        if is_item {
            let old_right = self.item(ptr).right;
            self.item_mut(ptr).right = Some(right_ptr);
            match old_right {
                Some(next) => self.item_mut(next).left = Some(right_ptr),
                None => {
                    let item = self.item(ptr);
                    if let Some(sub) = item.parent_sub.clone() {
                        let parent = item.parent;
                        let map = &mut self.branch_mut(parent).map;
                        if map.get(&sub) == Some(&ptr) {
                            map.insert(sub, right_ptr);
                        }
                    }
                }
            }
        }

        if let Some(idx) = self.find_index(right_id.client, right_id.clock - 1) {
            if let Some(list) = self.clients.get_mut(&right_id.client) {
                list.insert(idx + 1, right_ptr);
            }
        }
        self.splits.push(right_id);
        return Ok(right_ptr);
    }

    /// The block starting exactly at `id`, splitting if needed. `Ok(None)`
    /// when `id` is unknown.
    pub(crate) fn clean_start(&mut self, id: &Id) -> Result<Option<BlockPtr>> {
        let Some(ptr) = self.find(id) else {
            return Ok(None);
        };
        let block = self.block(ptr);
        if let Block::Item(item) = block {
            if item.id.clock < id.clock {
                let offset = id.clock - item.id.clock;
                return self.split_block(ptr, offset).map(Some);
            }
        }
        return Ok(Some(ptr));
    }

    /// The block ending exactly at `id`, splitting if needed. `Ok(None)`
    /// when `id` is unknown.
    pub(crate) fn clean_end(&mut self, id: &Id) -> Result<Option<BlockPtr>> {
        let Some(ptr) = self.find(id) else {
            return Ok(None);
        };
        let block = self.block(ptr);
        if let Block::Item(item) = block {
            if id.clock != item.last_id().clock {
                let offset = id.clock - item.id.clock + 1;
                self.split_block(ptr, offset)?;
            }
        }
        return Ok(Some(ptr));
    }

    /// Every deleted range currently in the store, gc blocks included.
    pub(crate) fn delete_set(&self) -> DeleteSet {
        let mut ds = DeleteSet::new();
        for list in self.clients.values() {
            for ptr in list {
                let block = self.block(*ptr);
                if block.is_deleted() {
                    ds.insert(block.id(), block.len());
                }
            }
        }
        return ds;
    }

    // =========================================================================
    // Branches
    // =========================================================================

    #[inline]
    pub(crate) fn branch(&self, id: BranchId) -> &Branch {
        return &self.branches[id.0 as usize];
    }

    #[inline]
    pub(crate) fn branch_mut(&mut self, id: BranchId) -> &mut Branch {
        return &mut self.branches[id.0 as usize];
    }

    /// Allocate a nested branch; the caller links it to its item.
    pub(crate) fn new_branch(&mut self, kind: TypeKind) -> BranchId {
        self.branches.push(Branch::new(kind, None));
        return BranchId(self.branches.len() as u32 - 1);
    }

    pub(crate) fn root(&self, name: &str) -> Option<BranchId> {
        return self.roots.get(name).copied();
    }

    /// Get the root called `name`, creating it when absent. A root first
    /// created by a remote update has no kind yet and takes `kind`.
    pub(crate) fn get_or_create_root(&mut self, name: &Arc<str>, kind: TypeKind) -> Result<BranchId> {
        if let Some(id) = self.roots.get(name).copied() {
            let branch = self.branch_mut(id);
            if branch.kind == TypeKind::Undefined {
                branch.kind = kind;
            } else if kind != TypeKind::Undefined && branch.kind != kind {
                return Err(Error::TypeMismatch {
                    expected: branch.kind.name(),
                });
            }
            return Ok(id);
        }
        self.branches.push(Branch::new(kind, Some(name.clone())));
        let id = BranchId(self.branches.len() as u32 - 1);
        self.roots.insert(name.clone(), id);
        return Ok(id);
    }

    /// Resolve a replica-independent address to a live branch.
    pub(crate) fn resolve(&self, ptr: &TypePtr) -> Option<BranchId> {
        let id = match ptr {
            TypePtr::Root(name) => self.root(name)?,
            TypePtr::Nested(id) => {
                let block = self.block(self.find(id)?);
                match block.as_item()?.content {
                    ItemContent::Type(branch) => branch,
                    _ => return None,
                }
            }
        };
        if self.branch(id).collected {
            return None;
        }
        return Some(id);
    }

    pub(crate) fn type_ptr(&self, branch: BranchId) -> Option<TypePtr> {
        let b = self.branch(branch);
        if let Some(item) = b.item {
            return Some(TypePtr::Nested(self.block(item).id()));
        }
        return b.name.clone().map(TypePtr::Root);
    }

    /// Whether the branch itself (not its content) has been deleted.
    pub(crate) fn is_branch_deleted(&self, branch: BranchId) -> bool {
        let b = self.branch(branch);
        return b.collected || b.item.is_some_and(|item| self.block(item).is_deleted());
    }

    /// The parent of a nested branch.
    pub(crate) fn parent_of(&self, branch: BranchId) -> Option<BranchId> {
        let item = self.branch(branch).item?;
        return Some(self.item(item).parent);
    }

    /// Leftmost entry of the chain `ptr` belongs to.
    pub(crate) fn leftmost(&self, mut ptr: BlockPtr) -> BlockPtr {
        while let Some(left) = self.item(ptr).left {
            ptr = left;
        }
        return ptr;
    }

    /// The sequence items of `branch` in document order, tombstones included.
    pub(crate) fn chain(&self, branch: BranchId) -> Vec<BlockPtr> {
        let mut out = Vec::new();
        let mut next = self.branch(branch).start;
        while let Some(ptr) = next {
            out.push(ptr);
            next = self.item(ptr).right;
        }
        return out;
    }

    // =========================================================================
    // Squashing
    // =========================================================================

    /// Merge `right` into `left` if they form one contiguous run.
    fn try_squash(&mut self, left: BlockPtr, right: BlockPtr) -> bool {
        let mergeable = match (self.block(left), self.block(right)) {
            (Block::Gc { .. }, Block::Gc { .. }) => true,
            (Block::Item(l), Block::Item(r)) => {
                l.deleted == r.deleted
                    && r.origin == Some(l.last_id())
                    && l.right == Some(right)
                    && l.right_origin == r.right_origin
                    && l.parent == r.parent
                    && l.parent_sub == r.parent_sub
                    && matches!(
                        (&l.content, &r.content),
                        (ItemContent::Any(_), ItemContent::Any(_))
                            | (ItemContent::Deleted(_), ItemContent::Deleted(_))
                    )
            }
            _ => false,
        };
        if !mergeable {
            return false;
        }
        let Some(absorbed) = self.take(right) else {
            return false;
        };
        match absorbed {
            Block::Gc { len, .. } => {
                if let Block::Gc { len: left_len, .. } = self.block_mut(left) {
                    *left_len += len;
                }
            }
            Block::Item(r) => {
                let Some(item) = self.block_mut(left).as_item_mut() else {
                    return true;
                };
                item.content.try_squash(&r.content);
                item.len += r.len;
                item.right = r.right;
                let parent = item.parent;
                match r.right {
                    Some(next) => {
                        if let Some(next) = self.block_mut(next).as_item_mut() {
                            next.left = Some(left);
                        }
                    }
                    None => {
                        if let Some(sub) = r.parent_sub {
                            let map = &mut self.branch_mut(parent).map;
                            if map.get(&sub) == Some(&right) {
                                map.insert(sub, left);
                            }
                        }
                    }
                }
            }
        }
        return true;
    }

    /// Repeatedly merge the block at `pos` into its left neighbour.
    /// Returns the number of blocks removed.
    fn try_merge_with_lefts(&mut self, client: ClientId, pos: usize) -> usize {
        let mut i = pos;
        while i > 0 {
            let (left, right) = {
                let list = &self.clients[&client];
                (list[i - 1], list[i])
            };
            if !self.try_squash(left, right) {
                break;
            }
            if let Some(list) = self.clients.get_mut(&client) {
                list.remove(i);
            }
            i -= 1;
        }
        return pos - i;
    }

    /// Squash runs of `client` touching the clock range `[start, end)`.
    pub(crate) fn squash_range(&mut self, client: ClientId, start: u32, end: u32) {
        let len = self.client_blocks(client).len();
        if len < 2 || end <= start {
            return;
        }
        let Some(first) = self.find_index(client, start) else {
            return;
        };
        let first = first.max(1);
        let last = match self.find_index(client, end - 1) {
            Some(idx) => (idx + 1).min(len - 1),
            None => len - 1,
        };
        let mut i = last;
        while i >= first {
            let merged = self.try_merge_with_lefts(client, i);
            if i < first + 1 + merged {
                break;
            }
            i -= 1 + merged;
        }
    }

    /// Squash the blocks around every recorded split point.
    pub(crate) fn squash_splits(&mut self) {
        let splits = std::mem::take(&mut self.splits);
        for id in splits.into_iter().rev() {
            self.squash_range(id.client, id.clock.saturating_sub(1), id.clock + 1);
        }
    }

    // =========================================================================
    // Compaction
    // =========================================================================

    /// Drop the payload of tombstones acknowledged by `acknowledged` and turn
    /// the content of deleted shared types into gc ranges. Returns the number
    /// of blocks reclaimed.
    pub(crate) fn compact(&mut self, acknowledged: &StateVector) -> usize {
        let mut reclaimed = 0;
        let ptrs: Vec<BlockPtr> = self.clients.values().flatten().copied().collect();
        for ptr in ptrs {
            let collect = match self.block(ptr) {
                Block::Item(item)
                    if item.deleted
                        && item.id.clock + item.len <= acknowledged.get(item.id.client) =>
                {
                    match item.content {
                        ItemContent::Deleted(_) => continue,
                        ItemContent::Type(branch) => Some(branch),
                        ItemContent::Any(_) | ItemContent::Binary(_) => None,
                    }
                }
                _ => continue,
            };
            if let Some(branch) = collect {
                reclaimed += self.collect_branch(branch);
            }
            let item = self.item_mut(ptr);
            item.content = ItemContent::Deleted(item.len);
            reclaimed += 1;
        }
        return reclaimed;
    }

    /// Replace every block below `branch` with a gc range.
    fn collect_branch(&mut self, branch: BranchId) -> usize {
        let mut ptrs = self.chain(branch);
        let entries: Vec<BlockPtr> = self.branch(branch).map.values().copied().collect();
        for last in entries {
            let mut next = Some(last);
            while let Some(ptr) = next {
                ptrs.push(ptr);
                next = self.item(ptr).left;
            }
        }

        let mut reclaimed = 0;
        for ptr in ptrs {
            let (id, len, nested) = match self.block(ptr) {
                Block::Item(item) => {
                    let nested = match item.content {
                        ItemContent::Type(nested) => Some(nested),
                        _ => None,
                    };
                    (item.id, item.len, nested)
                }
                Block::Gc { .. } => continue,
            };
            if let Some(nested) = nested {
                reclaimed += self.collect_branch(nested);
            }
            *self.block_mut(ptr) = Block::Gc { id, len };
            reclaimed += 1;
        }

        let b = self.branch_mut(branch);
        b.start = None;
        b.map.clear();
        b.len = 0;
        b.collected = true;
        return reclaimed;
    }
}
