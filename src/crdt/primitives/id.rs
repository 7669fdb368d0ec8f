//! Identifier types for blocks in the document store.
//!
//! # Identifier Hierarchy
//!
//! - `ClientId`: identifies a replica (one per document instance)
//! - `Id`: identifies one clock unit of content (client, clock)
//!
//! A block that spans `n` clock units is identified by the `Id` of its
//! first unit; the units after it are addressed as `(client, clock + i)`.
//!
//! IDs are designed to be:
//! - Globally unique: (client, clock) pairs are never reused
//! - Totally ordered: can be compared deterministically
//! - Compact: two integers, `Copy`
//! - Hashable: can be used as map keys

use std::cmp::Ordering;
use std::fmt;

/// A replica identifier.
///
/// Chosen by the caller or generated randomly when a document is created.
/// Concurrent inserts at the same position are ordered by this value.
pub type ClientId = u64;

/// An item identifier.
///
/// The (client, clock) pair is globally unique assuming client ids are
/// unique and clocks only increase.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Id {
    /// The replica that created this unit of content.
    pub client: ClientId,
    /// Position in the creating replica's clock.
    pub clock: u32,
}

impl Id {
    /// Create a new item ID.
    #[inline]
    pub fn new(client: ClientId, clock: u32) -> Id {
        return Id { client, clock };
    }

    /// The ID `offset` clock units after this one.
    #[inline]
    pub(crate) fn offset(&self, offset: u32) -> Id {
        return Id::new(self.client, self.clock + offset);
    }
}

impl PartialOrd for Id {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        return Some(self.cmp(other));
    }
}

impl Ord for Id {
    fn cmp(&self, other: &Self) -> Ordering {
        // Client first so that ids sort into per-client runs.
        match self.client.cmp(&other.client) {
            Ordering::Equal => self.clock.cmp(&other.clock),
            other => other,
        }
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        return write!(f, "<{}#{}>", self.client, self.clock);
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        return write!(f, "<{}#{}>", self.client, self.clock);
    }
}

/// A half-open clock range `[start, end)` owned by a single client.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ClockRange {
    pub start: u32,
    pub end: u32,
}

impl ClockRange {
    /// Create a new range. `start` must not exceed `end`.
    #[inline]
    pub fn new(start: u32, end: u32) -> ClockRange {
        debug_assert!(start <= end);
        return ClockRange { start, end };
    }

    #[inline]
    pub fn len(&self) -> u32 {
        return self.end - self.start;
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        return self.start == self.end;
    }

    #[inline]
    pub fn contains(&self, clock: u32) -> bool {
        return clock >= self.start && clock < self.end;
    }

    /// Whether the two ranges overlap or touch.
    #[inline]
    pub fn touches(&self, other: &ClockRange) -> bool {
        return self.start <= other.end && other.start <= self.end;
    }
}
