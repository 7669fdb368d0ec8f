//! Shared primitives for the document store.
//!
//! # Primitives
//!
//! ## IDs
//! - `ClientId`: replica identifier
//! - `Id`: one clock unit of content (client, clock)
//! - `ClockRange`: a half-open clock range of one client
//!
//! ## Clocks
//! - `StateVector`: per-client next expected clock
//!
//! ## Sets
//! - `DeleteSet`: coalesced deleted ranges per client

pub mod clock;
pub mod id;
pub mod id_set;

// Re-exports for convenience
pub use clock::StateVector;
pub use id::ClientId;
pub use id::ClockRange;
pub use id::Id;
pub use id_set::DeleteSet;
