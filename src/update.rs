//! Updates: the unit of state exchange between replicas.
//!
//! An update carries blocks grouped per client (each group a contiguous
//! clock range, gaps marked by skip blocks) followed by a delete set. It is
//! self-contained and replica-independent: positions are expressed through
//! origins, never indices.
//!
//! Decoding validates the whole payload before anything touches a
//! document, so a malformed update is rejected atomically. Integration is
//! dependency-driven: a block is applied once its clock range continues the
//! local state of its client and every id it refers to is known. Blocks
//! that are not ready yet wait in the store's pending queue and are retried
//! on every later update. Blocks already known are skipped, which makes
//! applying an update idempotent.

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use crate::crdt::any::Any;
use crate::crdt::block::Block;
use crate::crdt::block::BranchId;
use crate::crdt::block::Item;
use crate::crdt::block::ItemContent;
use crate::crdt::block::REF_ANY;
use crate::crdt::block::REF_BINARY;
use crate::crdt::block::REF_DELETED;
use crate::crdt::block::REF_GC;
use crate::crdt::block::REF_SKIP;
use crate::crdt::block::REF_TYPE;
use crate::crdt::branch::TypeKind;
use crate::crdt::branch::TypePtr;
use crate::crdt::primitives::ClientId;
use crate::crdt::primitives::DeleteSet;
use crate::crdt::primitives::Id;
use crate::crdt::primitives::StateVector;
use crate::crdt::store::Store;
use crate::crdt::yata;
use crate::encoding::Decode;
use crate::encoding::Decoder;
use crate::encoding::Encode;
use crate::encoding::Encoder;
use crate::error::Error;
use crate::error::Result;
use crate::transaction::TxnState;

const HAS_ORIGIN: u8 = 0b1000_0000;
const HAS_RIGHT_ORIGIN: u8 = 0b0100_0000;
const HAS_PARENT_SUB: u8 = 0b0010_0000;
const REF_MASK: u8 = 0b0001_1111;

/// Content kinds of the format this engine does not model: JSON, string,
/// embed, format and sub-document.
const UNSUPPORTED_REFS: [u8; 5] = [2, 4, 5, 6, 9];

// =============================================================================
// Decoded blocks
// =============================================================================

/// Where a block without origins lives.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum ParentRef {
    Root(Arc<str>),
    Nested(Id),
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum RemoteContent {
    Any(SmallVec<[Any; 1]>),
    Binary(Arc<[u8]>),
    Deleted(u32),
    Type(TypeKind),
}

impl RemoteContent {
    fn len(&self) -> u32 {
        match self {
            RemoteContent::Any(values) => return values.len() as u32,
            RemoteContent::Deleted(len) => return *len,
            RemoteContent::Binary(_) | RemoteContent::Type(_) => return 1,
        }
    }

    fn ref_number(&self) -> u8 {
        match self {
            RemoteContent::Any(_) => return REF_ANY,
            RemoteContent::Binary(_) => return REF_BINARY,
            RemoteContent::Deleted(_) => return REF_DELETED,
            RemoteContent::Type(_) => return REF_TYPE,
        }
    }
}

/// An item as it appears on the wire, not yet placed in a document.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct RemoteItem {
    pub(crate) id: Id,
    pub(crate) origin: Option<Id>,
    pub(crate) right_origin: Option<Id>,
    /// Only present when neither origin is.
    pub(crate) parent: Option<ParentRef>,
    pub(crate) parent_sub: Option<Arc<str>>,
    pub(crate) content: RemoteContent,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum RemoteBlock {
    Item(RemoteItem),
    Gc { id: Id, len: u32 },
}

impl RemoteBlock {
    fn id(&self) -> Id {
        match self {
            RemoteBlock::Item(item) => return item.id,
            RemoteBlock::Gc { id, .. } => return *id,
        }
    }

    fn len(&self) -> u32 {
        match self {
            RemoteBlock::Item(item) => return item.content.len(),
            RemoteBlock::Gc { len, .. } => return *len,
        }
    }

    fn end(&self) -> u32 {
        return self.id().clock + self.len();
    }

    /// Drop the first `offset` units. The remainder continues the dropped
    /// part, so its left origin becomes the last dropped unit.
    fn trim_front(&mut self, offset: u32) {
        if offset == 0 {
            return;
        }
        match self {
            RemoteBlock::Gc { id, len } => {
                *id = id.offset(offset);
                *len -= offset;
            }
            RemoteBlock::Item(item) => {
                item.origin = Some(item.id.offset(offset - 1));
                item.id = item.id.offset(offset);
                item.parent = None;
                item.parent_sub = None;
                match &mut item.content {
                    RemoteContent::Any(values) => {
                        values.drain(..offset as usize);
                    }
                    RemoteContent::Deleted(len) => *len -= offset,
                    // Unit-length content is never trimmed by a non-zero offset.
                    RemoteContent::Binary(_) | RemoteContent::Type(_) => {}
                }
            }
        }
    }

    /// The first id this block needs that `store` does not have yet.
    fn missing_dependency(&self, store: &Store) -> Option<Id> {
        let RemoteBlock::Item(item) = self else {
            return None;
        };
        let refs = [
            item.origin,
            item.right_origin,
            match &item.parent {
                Some(ParentRef::Nested(id)) => Some(*id),
                _ => None,
            },
        ];
        return refs
            .into_iter()
            .flatten()
            .find(|id| id.clock >= store.get_state(id.client));
    }
}

// =============================================================================
// Update
// =============================================================================

/// A decoded update: blocks per client plus deleted ranges.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Update {
    blocks: BTreeMap<ClientId, VecDeque<RemoteBlock>>,
    delete_set: DeleteSet,
}

impl Update {
    pub fn new() -> Update {
        return Update::default();
    }

    /// Whether the update carries neither blocks nor deletions.
    pub fn is_empty(&self) -> bool {
        return self.blocks.values().all(|blocks| blocks.is_empty()) && self.delete_set.is_empty();
    }

    pub fn delete_set(&self) -> &DeleteSet {
        return &self.delete_set;
    }

    /// The end clock of each client's blocks.
    pub fn state_vector(&self) -> StateVector {
        let mut sv = StateVector::new();
        for (client, blocks) in &self.blocks {
            for block in blocks {
                sv.set_max(*client, block.end());
            }
        }
        return sv;
    }

    /// Number of blocks carried.
    pub fn block_count(&self) -> usize {
        return self.blocks.values().map(|blocks| blocks.len()).sum();
    }

    /// Combine two updates. Overlapping blocks are kept; integration skips
    /// whatever is already known.
    pub fn merge(&mut self, other: Update) {
        for (client, blocks) in other.blocks {
            self.blocks.entry(client).or_default().extend(blocks);
        }
        for blocks in self.blocks.values_mut() {
            blocks.make_contiguous().sort_by_key(|block| block.id().clock);
        }
        self.delete_set.merge(&other.delete_set);
    }

    fn decode_item(decoder: &mut Decoder<'_>, id: Id, info: u8) -> Result<RemoteItem> {
        let origin = if info & HAS_ORIGIN != 0 {
            Some(read_id(decoder)?)
        } else {
            None
        };
        let right_origin = if info & HAS_RIGHT_ORIGIN != 0 {
            Some(read_id(decoder)?)
        } else {
            None
        };
        for reference in [origin, right_origin].into_iter().flatten() {
            if reference.client == id.client && reference.clock >= id.clock {
                return Err(Error::malformed(format!("{id} refers to a later unit of its own client")));
            }
        }

        let has_parent_info = origin.is_none() && right_origin.is_none();
        let parent = if has_parent_info {
            match decoder.read_var_u32()? {
                1 => Some(ParentRef::Root(decoder.read_string()?.into())),
                0 => Some(ParentRef::Nested(read_id(decoder)?)),
                other => {
                    return Err(Error::malformed(format!("unknown parent kind {other}")));
                }
            }
        } else {
            None
        };
        let parent_sub = if has_parent_info && info & HAS_PARENT_SUB != 0 {
            Some(decoder.read_string()?.into())
        } else {
            None
        };

        let content = match info & REF_MASK {
            REF_DELETED => RemoteContent::Deleted(decoder.read_var_u32()?),
            REF_BINARY => RemoteContent::Binary(decoder.read_bytes()?.into()),
            REF_TYPE => match decoder.read_var_u32()? {
                0 => RemoteContent::Type(TypeKind::Array),
                1 => RemoteContent::Type(TypeKind::Map),
                _ => return Err(Error::UnsupportedContent { tag: REF_TYPE }),
            },
            REF_ANY => {
                let len = decoder.read_len()?;
                let mut values = SmallVec::with_capacity(len);
                for _ in 0..len {
                    values.push(Any::decode(decoder)?);
                }
                RemoteContent::Any(values)
            }
            tag if UNSUPPORTED_REFS.contains(&tag) => {
                return Err(Error::UnsupportedContent { tag });
            }
            tag => return Err(Error::malformed(format!("unknown content ref {tag}"))),
        };
        if content.len() == 0 {
            return Err(Error::malformed(format!("empty block at {id}")));
        }

        return Ok(RemoteItem {
            id,
            origin,
            right_origin,
            parent,
            parent_sub,
            content,
        });
    }
}

fn read_id(decoder: &mut Decoder<'_>) -> Result<Id> {
    let client = decoder.read_var_u64()?;
    let clock = decoder.read_var_u32()?;
    return Ok(Id::new(client, clock));
}

fn write_id(encoder: &mut Encoder, id: &Id) {
    encoder.write_var_u64(id.client);
    encoder.write_var_u32(id.clock);
}

impl Decode for Update {
    fn decode(decoder: &mut Decoder<'_>) -> Result<Update> {
        let mut blocks: BTreeMap<ClientId, VecDeque<RemoteBlock>> = BTreeMap::new();
        let num_clients = decoder.read_len()?;
        for _ in 0..num_clients {
            let num_blocks = decoder.read_len()?;
            let client = decoder.read_var_u64()?;
            let mut clock = decoder.read_var_u32()?;
            let list = blocks.entry(client).or_default();
            for _ in 0..num_blocks {
                let info = decoder.read_u8()?;
                let id = Id::new(client, clock);
                let (block, len) = match info & REF_MASK {
                    REF_GC => {
                        let len = decoder.read_var_u32()?;
                        (Some(RemoteBlock::Gc { id, len }), len)
                    }
                    REF_SKIP => (None, decoder.read_var_u32()?),
                    _ => {
                        let item = Update::decode_item(decoder, id, info)?;
                        let len = item.content.len();
                        (Some(RemoteBlock::Item(item)), len)
                    }
                };
                if len == 0 {
                    return Err(Error::malformed(format!("empty block at {id}")));
                }
                clock = clock
                    .checked_add(len)
                    .ok_or_else(|| Error::malformed("block overflows clock space"))?;
                if let Some(block) = block {
                    list.push_back(block);
                }
            }
        }
        blocks.retain(|_, list| !list.is_empty());
        for list in blocks.values_mut() {
            list.make_contiguous().sort_by_key(|block| block.id().clock);
        }

        let delete_set = DeleteSet::decode(decoder)?;
        return Ok(Update { blocks, delete_set });
    }
}

impl Encode for Update {
    fn encode(&self, encoder: &mut Encoder) {
        let clients: Vec<(&ClientId, &VecDeque<RemoteBlock>)> =
            self.blocks.iter().rev().filter(|(_, blocks)| !blocks.is_empty()).collect();
        encoder.write_var_u64(clients.len() as u64);
        for (client, blocks) in clients {
            // Drop duplicates, trim overlaps and fill gaps with skips.
            let mut runs: Vec<(Option<RemoteBlock>, u32)> = Vec::new();
            let mut clock = blocks.front().map(|block| block.id().clock).unwrap_or(0);
            let start = clock;
            for block in blocks {
                if block.end() <= clock {
                    continue;
                }
                if block.id().clock > clock {
                    runs.push((None, block.id().clock - clock));
                    clock = block.id().clock;
                }
                let mut block = block.clone();
                block.trim_front(clock - block.id().clock);
                clock = block.end();
                let len = block.len();
                runs.push((Some(block), len));
            }

            encoder.write_var_u64(runs.len() as u64);
            encoder.write_var_u64(*client);
            encoder.write_var_u32(start);
            for (block, len) in runs {
                match block {
                    None => {
                        encoder.write_u8(REF_SKIP);
                        encoder.write_var_u32(len);
                    }
                    Some(RemoteBlock::Gc { len, .. }) => {
                        encoder.write_u8(REF_GC);
                        encoder.write_var_u32(len);
                    }
                    Some(RemoteBlock::Item(item)) => write_remote_item(encoder, &item),
                }
            }
        }
        self.delete_set.encode(encoder);
    }
}

fn write_header(
    encoder: &mut Encoder,
    content_ref: u8,
    origin: Option<Id>,
    right_origin: Option<Id>,
    parent: Option<&ParentRef>,
    parent_sub: Option<&str>,
) {
    let mut info = content_ref;
    if origin.is_some() {
        info |= HAS_ORIGIN;
    }
    if right_origin.is_some() {
        info |= HAS_RIGHT_ORIGIN;
    }
    if parent_sub.is_some() {
        info |= HAS_PARENT_SUB;
    }
    encoder.write_u8(info);
    if let Some(origin) = &origin {
        write_id(encoder, origin);
    }
    if let Some(right_origin) = &right_origin {
        write_id(encoder, right_origin);
    }
    if origin.is_none() && right_origin.is_none() {
        match parent {
            Some(ParentRef::Root(name)) => {
                encoder.write_var_u32(1);
                encoder.write_string(name);
            }
            Some(ParentRef::Nested(id)) => {
                encoder.write_var_u32(0);
                write_id(encoder, id);
            }
            None => {
                encoder.write_var_u32(1);
                encoder.write_string("");
            }
        }
        if let Some(sub) = parent_sub {
            encoder.write_string(sub);
        }
    }
}

fn write_remote_item(encoder: &mut Encoder, item: &RemoteItem) {
    write_header(
        encoder,
        item.content.ref_number(),
        item.origin,
        item.right_origin,
        item.parent.as_ref(),
        item.parent_sub.as_deref(),
    );
    match &item.content {
        RemoteContent::Any(values) => {
            encoder.write_var_u32(values.len() as u32);
            for value in values {
                value.encode(encoder);
            }
        }
        RemoteContent::Binary(bytes) => encoder.write_bytes(bytes),
        RemoteContent::Deleted(len) => encoder.write_var_u32(*len),
        RemoteContent::Type(kind) => encoder.write_var_u32(kind.ref_number() as u32),
    }
}

// =============================================================================
// Encoding from a store
// =============================================================================

/// Write the parent reference of an integrated item.
fn parent_ref(store: &Store, parent: BranchId) -> Option<ParentRef> {
    match store.type_ptr(parent)? {
        TypePtr::Root(name) => return Some(ParentRef::Root(name)),
        TypePtr::Nested(id) => return Some(ParentRef::Nested(id)),
    }
}

fn write_block(store: &Store, encoder: &mut Encoder, block: &Block, offset: u32) {
    match block {
        Block::Gc { len, .. } => {
            encoder.write_u8(REF_GC);
            encoder.write_var_u32(len - offset);
        }
        Block::Item(item) => write_item(store, encoder, item, offset),
    }
}

fn write_item(store: &Store, encoder: &mut Encoder, item: &Item, offset: u32) {
    let origin = if offset > 0 {
        Some(item.id.offset(offset - 1))
    } else {
        item.origin
    };
    let parent = parent_ref(store, item.parent);
    write_header(
        encoder,
        item.content.ref_number(),
        origin,
        item.right_origin,
        parent.as_ref(),
        item.parent_sub.as_deref(),
    );
    match &item.content {
        ItemContent::Any(values) => {
            encoder.write_var_u32(item.len - offset);
            for value in &values[offset as usize..] {
                value.encode(encoder);
            }
        }
        ItemContent::Binary(bytes) => encoder.write_bytes(bytes),
        ItemContent::Deleted(len) => encoder.write_var_u32(len - offset),
        ItemContent::Type(branch) => {
            encoder.write_var_u32(store.branch(*branch).kind.ref_number() as u32);
        }
    }
}

/// Encode every block the remote side (described by `remote`) is missing,
/// followed by `delete_set`.
pub(crate) fn encode_diff(store: &Store, remote: &StateVector, delete_set: &DeleteSet) -> Vec<u8> {
    let mut encoder = Encoder::new();
    let mut clients: Vec<(ClientId, u32)> = store
        .client_ids()
        .into_iter()
        .filter(|client| store.get_state(*client) > remote.get(*client))
        .map(|client| (client, remote.get(client)))
        .collect();
    clients.sort_by(|a, b| b.0.cmp(&a.0));

    encoder.write_var_u64(clients.len() as u64);
    for (client, clock) in clients {
        let blocks = store.client_blocks(client);
        let first_clock = blocks.first().map(|ptr| store.block(*ptr).id().clock).unwrap_or(0);
        let clock = clock.max(first_clock);
        let start = store.find_index(client, clock).unwrap_or(blocks.len());

        encoder.write_var_u64((blocks.len() - start) as u64);
        encoder.write_var_u64(client);
        encoder.write_var_u32(clock);
        for (i, ptr) in blocks[start..].iter().enumerate() {
            let block = store.block(*ptr);
            let offset = if i == 0 { clock - block.id().clock } else { 0 };
            write_block(store, &mut encoder, block, offset);
        }
    }
    delete_set.encode(&mut encoder);
    return encoder.into_bytes();
}

// =============================================================================
// Integration
// =============================================================================

/// Blocks waiting for dependencies, and the earliest clock each blocked
/// client still needs.
#[derive(Clone, Debug)]
pub(crate) struct Pending {
    pub(crate) update: Update,
    pub(crate) missing: StateVector,
}

/// Apply a decoded update, retrying previously pending blocks and deletions.
pub(crate) fn apply(
    store: &mut Store,
    txn: &mut TxnState,
    update: Update,
    max_pending: Option<usize>,
) -> Result<()> {
    let Update {
        mut blocks,
        delete_set,
    } = update;
    if let Some(pending) = store.pending.take() {
        trace!(blocks = pending.update.block_count(), "retrying pending blocks");
        for (client, list) in pending.update.blocks {
            let queue = blocks.entry(client).or_default();
            queue.extend(list);
            queue.make_contiguous().sort_by_key(|block| block.id().clock);
        }
    }

    let integrated = integrate_blocks(store, txn, &mut blocks)?;

    let mut result = Ok(());
    let left_over: usize = blocks.values().map(|list| list.len()).sum();
    if left_over > 0 {
        let missing = missing_state(store, &blocks);
        if max_pending.is_some_and(|limit| left_over > limit) {
            warn!(left_over, ?missing, "pending queue limit exceeded, dropping blocks");
            result = Err(Error::UnresolvedDependency { missing });
        } else {
            store.pending = Some(Pending {
                update: Update {
                    blocks,
                    delete_set: DeleteSet::new(),
                },
                missing,
            });
        }
    }

    let mut delete_set = delete_set;
    if let Some(pending_ds) = store.pending_ds.take() {
        delete_set.merge(&pending_ds);
    }
    let unapplied = apply_delete_set(store, txn, &delete_set)?;
    if !unapplied.is_empty() {
        store.pending_ds = Some(unapplied);
    }

    debug!(
        integrated,
        pending = left_over,
        pending_deletes = store.pending_ds.as_ref().map(|ds| ds.len()).unwrap_or(0),
        "applied update"
    );
    return result;
}

/// Integrate every block whose dependencies are met, until no progress is
/// made. Returns the number of blocks integrated; the rest stay in `blocks`.
fn integrate_blocks(
    store: &mut Store,
    txn: &mut TxnState,
    blocks: &mut BTreeMap<ClientId, VecDeque<RemoteBlock>>,
) -> Result<usize> {
    let mut integrated = 0;
    loop {
        let mut progress = false;
        for (client, queue) in blocks.iter_mut() {
            while let Some(front) = queue.front() {
                let local = store.get_state(*client);
                if front.end() <= local {
                    // Already known.
                    queue.pop_front();
                    continue;
                }
                let start = front.id().clock;
                if start > local {
                    break;
                }
                let offset = local - start;
                if offset == 0 && front.missing_dependency(store).is_some() {
                    break;
                }
                if offset > 0 {
                    // The origin becomes our own known predecessor; only the
                    // other references can be missing.
                    let mut trimmed = front.clone();
                    trimmed.trim_front(offset);
                    if trimmed.missing_dependency(store).is_some() {
                        break;
                    }
                }
                let Some(mut block) = queue.pop_front() else {
                    break;
                };
                block.trim_front(offset);
                integrate_block(store, txn, block)?;
                integrated += 1;
                progress = true;
            }
        }
        blocks.retain(|_, queue| !queue.is_empty());
        if !progress {
            break;
        }
    }
    return Ok(integrated);
}

fn missing_state(store: &Store, blocks: &BTreeMap<ClientId, VecDeque<RemoteBlock>>) -> StateVector {
    let mut missing: FxHashMap<ClientId, u32> = FxHashMap::default();
    let mut need = |id: Id| {
        let entry = missing.entry(id.client).or_insert(id.clock);
        *entry = (*entry).min(id.clock);
    };
    for (client, queue) in blocks {
        let Some(front) = queue.front() else {
            continue;
        };
        let local = store.get_state(*client);
        if front.id().clock > local {
            need(Id::new(*client, local));
        } else if let Some(id) = front.missing_dependency(store) {
            need(Id::new(id.client, store.get_state(id.client)));
        }
    }
    return missing.into_iter().collect();
}

/// Place one remote block whose dependencies are all known.
fn integrate_block(store: &mut Store, txn: &mut TxnState, block: RemoteBlock) -> Result<()> {
    let item = match block {
        RemoteBlock::Gc { id, len } => {
            let ptr = store.alloc(Block::Gc { id, len });
            store.push_block(ptr);
            return Ok(());
        }
        RemoteBlock::Item(item) => item,
    };
    let id = item.id;
    let len = item.content.len();

    let left = match item.origin {
        Some(origin) => store.clean_end(&origin)?,
        None => None,
    };
    let right = match item.right_origin {
        Some(right) => store.clean_start(&right)?,
        None => None,
    };
    let left_gc = left.is_some_and(|ptr| matches!(store.block(ptr), Block::Gc { .. }));
    let right_gc = right.is_some_and(|ptr| matches!(store.block(ptr), Block::Gc { .. }));

    // A block next to reclaimed content, or in a reclaimed type, is
    // reclaimed as well.
    let parent = if left_gc || right_gc {
        None
    } else {
        match &item.parent {
            Some(ParentRef::Root(name)) => store
                .get_or_create_root(name, TypeKind::Undefined)
                .ok()
                .map(|branch| (branch, item.parent_sub.clone())),
            Some(ParentRef::Nested(parent_id)) => store
                .resolve(&TypePtr::Nested(*parent_id))
                .map(|branch| (branch, item.parent_sub.clone())),
            None => match (left, right) {
                (Some(left), _) => {
                    let left = store.item(left);
                    Some((left.parent, left.parent_sub.clone()))
                }
                (None, Some(right)) => {
                    let right = store.item(right);
                    Some((right.parent, right.parent_sub.clone()))
                }
                (None, None) => None,
            },
        }
    };

    let Some((parent, parent_sub)) = parent else {
        trace!(%id, len, "integrating remote block as gc");
        let ptr = store.alloc(Block::Gc { id, len });
        store.push_block(ptr);
        return Ok(());
    };

    let content = match item.content {
        RemoteContent::Any(values) => ItemContent::Any(values),
        RemoteContent::Binary(bytes) => ItemContent::Binary(bytes),
        RemoteContent::Deleted(len) => ItemContent::Deleted(len),
        RemoteContent::Type(kind) => ItemContent::Type(store.new_branch(kind)),
    };
    let deleted = matches!(content, ItemContent::Deleted(_));
    let origin = left.map(|left| store.item(left).last_id());

    let item = Item {
        id,
        len,
        left,
        right,
        origin,
        right_origin: item.right_origin,
        parent,
        parent_sub,
        content,
        deleted,
    };
    yata::integrate(store, txn, item);
    return Ok(());
}

/// Delete every known range of `delete_set`; return the ranges that refer
/// to clocks not integrated yet.
fn apply_delete_set(store: &mut Store, txn: &mut TxnState, delete_set: &DeleteSet) -> Result<DeleteSet> {
    let mut unapplied = DeleteSet::new();
    for (client, ranges) in delete_set.iter() {
        let state = store.get_state(client);
        for range in ranges {
            if range.start >= state {
                unapplied.insert(Id::new(client, range.start), range.len());
                continue;
            }
            if range.end > state {
                unapplied.insert(Id::new(client, state), range.end - state);
            }
            let end = range.end.min(state);

            let Some(mut idx) = store.find_index(client, range.start) else {
                continue;
            };
            let first = store.client_blocks(client)[idx];
            let block = store.block(first);
            if !block.is_deleted() && block.id().clock < range.start {
                let offset = range.start - block.id().clock;
                store.split_block(first, offset)?;
                idx += 1;
            }

            while idx < store.client_blocks(client).len() {
                let ptr = store.client_blocks(client)[idx];
                let block = store.block(ptr);
                let clock = block.id().clock;
                if clock >= end {
                    break;
                }
                if !block.is_deleted() {
                    if clock + block.len() > end {
                        store.split_block(ptr, end - clock)?;
                    }
                    yata::delete(store, txn, ptr);
                }
                idx += 1;
            }
        }
    }
    return Ok(unapplied);
}

#[cfg(test)]
mod tests {
    use super::*;

    const ARRAY_INSERT: [u8; 23] = [
        1, 1, 208, 180, 170, 180, 9, 0, 8, 1, 4, 116, 101, 115, 116, 2, 119, 1, 97, 119, 1, 98, 0,
    ];

    #[test]
    fn decode_array_insert() {
        let update = Update::decode_v1(&ARRAY_INSERT).unwrap();
        assert_eq!(update.block_count(), 1);
        assert_eq!(update.state_vector().get(2525665872), 2);
        assert!(update.delete_set().is_empty());
    }

    #[test]
    fn reencode_is_identical() {
        let update = Update::decode_v1(&ARRAY_INSERT).unwrap();
        assert_eq!(update.encode_v1(), ARRAY_INSERT.to_vec());
    }

    #[test]
    fn truncated_payload_is_malformed() {
        for len in 0..ARRAY_INSERT.len() {
            let err = Update::decode_v1(&ARRAY_INSERT[..len]).unwrap_err();
            assert!(err.is_decode_error(), "prefix of {len} bytes: {err}");
        }
    }

    #[test]
    fn string_content_is_unsupported() {
        // One client, one block: info 4 (string) with a root parent "t".
        let bytes = [1, 1, 1, 0, 4, 1, 1, 116, 1, 97, 0];
        let err = Update::decode_v1(&bytes).unwrap_err();
        assert!(matches!(err, Error::UnsupportedContent { tag: 4 }));
    }

    #[test]
    fn self_reference_is_malformed() {
        // Item at <1#0> claiming origin <1#0>.
        let bytes = [1, 1, 1, 0, 0x88, 1, 0, 1, 125, 1, 0];
        let err = Update::decode_v1(&bytes).unwrap_err();
        assert!(matches!(err, Error::MalformedUpdate { .. }));
    }

    #[test]
    fn gaps_are_encoded_as_skips() {
        let gc = |clock, len| RemoteBlock::Gc {
            id: Id::new(7, clock),
            len,
        };
        let mut update = Update::new();
        update.blocks.insert(7, VecDeque::from([gc(0, 2), gc(5, 1)]));

        let bytes = update.encode_v1();
        assert_eq!(bytes, vec![1, 3, 7, 0, REF_GC, 2, REF_SKIP, 3, REF_GC, 1, 0]);

        let decoded = Update::decode_v1(&bytes).unwrap();
        assert_eq!(decoded, update);
    }

    #[test]
    fn merge_overlapping_updates() {
        let gc = |clock, len| RemoteBlock::Gc {
            id: Id::new(7, clock),
            len,
        };
        let mut a = Update::new();
        a.blocks.insert(7, VecDeque::from([gc(0, 3)]));
        let mut b = Update::new();
        b.blocks.insert(7, VecDeque::from([gc(2, 3)]));

        a.merge(b);
        assert_eq!(a.state_vector().get(7), 5);

        // The overlap is trimmed when encoding.
        let decoded = Update::decode_v1(&a.encode_v1()).unwrap();
        assert_eq!(decoded.blocks[&7], VecDeque::from([gc(0, 3), gc(3, 2)]));
    }
}
