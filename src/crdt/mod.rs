//! The CRDT core: identifiers, the item store and the integration procedure.

pub mod any;
pub(crate) mod block;
pub(crate) mod branch;
pub mod primitives;
pub(crate) mod store;
pub(crate) mod yata;
