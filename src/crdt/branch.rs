//! Shared types as seen by the store.
//!
//! A branch is the container behind an array or map: the head of its item
//! list, the current entry per map key, and a cached visible length. Root
//! branches are addressed by name; nested branches by the id of the item
//! that holds them. Handles only keep the replica-independent `TypePtr`
//! and resolve it against the store on every access.

use std::sync::Arc;

use rustc_hash::FxHashMap;

use super::block::BlockPtr;
use super::primitives::Id;

/// The kind of a shared type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TypeKind {
    Array,
    Map,
    /// A root that was referenced by a remote update before being accessed
    /// locally.
    Undefined,
}

impl TypeKind {
    /// Wire reference number of the type.
    pub(crate) fn ref_number(self) -> u8 {
        match self {
            TypeKind::Array | TypeKind::Undefined => return 0,
            TypeKind::Map => return 1,
        }
    }

    pub(crate) fn name(self) -> &'static str {
        match self {
            TypeKind::Array => return "array",
            TypeKind::Map => return "map",
            TypeKind::Undefined => return "undefined",
        }
    }
}

/// A stable, replica-independent address of a shared type.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) enum TypePtr {
    Root(Arc<str>),
    Nested(Id),
}

/// A shared type's container state.
#[derive(Clone, Debug)]
pub(crate) struct Branch {
    pub(crate) kind: TypeKind,
    /// First item of the sequence, tombstones included.
    pub(crate) start: Option<BlockPtr>,
    /// Rightmost item per map key.
    pub(crate) map: FxHashMap<Arc<str>, BlockPtr>,
    /// Number of visible sequence positions.
    pub(crate) len: u32,
    /// The item holding this type; None for roots.
    pub(crate) item: Option<BlockPtr>,
    /// Root name; None for nested types.
    pub(crate) name: Option<Arc<str>>,
    /// Set once the subtree has been reclaimed.
    pub(crate) collected: bool,
}

impl Branch {
    pub(crate) fn new(kind: TypeKind, name: Option<Arc<str>>) -> Branch {
        return Branch {
            kind,
            start: None,
            map: FxHashMap::default(),
            len: 0,
            item: None,
            name,
            collected: false,
        };
    }

    /// Whether a handle of `kind` may read this branch.
    pub(crate) fn accepts(&self, kind: TypeKind) -> bool {
        return self.kind == kind || self.kind == TypeKind::Undefined;
    }
}
