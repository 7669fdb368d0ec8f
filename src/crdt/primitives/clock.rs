//! State vectors: per-client knowledge of the document history.
//!
//! A state vector maps each client to the next clock value it expects
//! from that client, i.e. every unit with `clock < sv[client]` is known.
//! Two replicas exchange state vectors to compute the minimal update that
//! brings the other side up to date.
//!
//! Complexity:
//! - get: O(1)
//! - merge: O(n) where n is number of clients
//! - encode: O(n log n) (entries are written in descending client order)

use std::fmt;

use rustc_hash::FxHashMap;

use super::id::ClientId;
use super::id::Id;
use crate::encoding::Decode;
use crate::encoding::Decoder;
use crate::encoding::Encode;
use crate::encoding::Encoder;
use crate::error::Result;

/// A mapping `client -> next expected clock`.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct StateVector {
    entries: FxHashMap<ClientId, u32>,
}

impl StateVector {
    /// Create an empty state vector (knows nothing).
    pub fn new() -> StateVector {
        return StateVector {
            entries: FxHashMap::default(),
        };
    }

    /// Next expected clock for `client`; zero when unknown.
    #[inline]
    pub fn get(&self, client: ClientId) -> u32 {
        return self.entries.get(&client).copied().unwrap_or(0);
    }

    /// Whether the unit identified by `id` is covered.
    #[inline]
    pub fn contains(&self, id: &Id) -> bool {
        return id.clock < self.get(id.client);
    }

    /// Advance the entry for `client` by `delta` clock units.
    pub fn inc_by(&mut self, client: ClientId, delta: u32) {
        if delta > 0 {
            *self.entries.entry(client).or_insert(0) += delta;
        }
    }

    /// Raise the entry for `client` to at least `clock`.
    pub fn set_max(&mut self, client: ClientId, clock: u32) {
        let entry = self.entries.entry(client).or_insert(0);
        *entry = (*entry).max(clock);
    }

    /// Lower the entry for `client` to at most `clock`.
    pub fn set_min(&mut self, client: ClientId, clock: u32) {
        if let Some(entry) = self.entries.get_mut(&client) {
            *entry = (*entry).min(clock);
        }
    }

    /// Pointwise maximum.
    pub fn merge(&mut self, other: &StateVector) {
        for (client, clock) in other.iter() {
            self.set_max(client, clock);
        }
    }

    /// Whether every unit known to `other` is also known here.
    pub fn dominates(&self, other: &StateVector) -> bool {
        return other.iter().all(|(client, clock)| self.get(client) >= clock);
    }

    pub fn len(&self) -> usize {
        return self.entries.len();
    }

    pub fn is_empty(&self) -> bool {
        return self.entries.is_empty();
    }

    /// Iterate over `(client, clock)` pairs in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = (ClientId, u32)> + '_ {
        return self.entries.iter().map(|(client, clock)| (*client, *clock));
    }

    /// Entries sorted by descending client id, the order used on the wire.
    pub(crate) fn sorted_desc(&self) -> Vec<(ClientId, u32)> {
        let mut entries: Vec<_> = self.iter().collect();
        entries.sort_by(|a, b| b.0.cmp(&a.0));
        return entries;
    }
}

impl fmt::Debug for StateVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut entries: Vec<_> = self.iter().collect();
        entries.sort();
        return f.debug_map().entries(entries).finish();
    }
}

impl FromIterator<(ClientId, u32)> for StateVector {
    fn from_iter<I: IntoIterator<Item = (ClientId, u32)>>(iter: I) -> Self {
        let mut sv = StateVector::new();
        for (client, clock) in iter {
            sv.set_max(client, clock);
        }
        return sv;
    }
}

impl Encode for StateVector {
    fn encode(&self, encoder: &mut Encoder) {
        let entries = self.sorted_desc();
        encoder.write_var_u64(entries.len() as u64);
        for (client, clock) in entries {
            encoder.write_var_u64(client);
            encoder.write_var_u32(clock);
        }
    }
}

impl Decode for StateVector {
    fn decode(decoder: &mut Decoder<'_>) -> Result<StateVector> {
        let len = decoder.read_len()?;
        let mut sv = StateVector::new();
        for _ in 0..len {
            let client = decoder.read_var_u64()?;
            let clock = decoder.read_var_u32()?;
            sv.set_max(client, clock);
        }
        return Ok(sv);
    }
}
