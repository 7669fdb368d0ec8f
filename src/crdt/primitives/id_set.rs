//! Sets of clock ranges, used to describe deletions.
//!
//! Deletions never carry content: a delete set only says "every unit in
//! these ranges is a tombstone". Ranges are kept sorted and coalesced per
//! client, so inserting overlapping or adjacent ranges is idempotent.
//!
//! Complexity:
//! - insert: O(log r + k) where r is ranges for the client, k merged ranges
//! - contains: O(log r)

use std::fmt;

use rustc_hash::FxHashMap;

use super::id::ClientId;
use super::id::ClockRange;
use super::id::Id;
use crate::encoding::Decode;
use crate::encoding::Decoder;
use crate::encoding::Encode;
use crate::encoding::Encoder;
use crate::error::Error;
use crate::error::Result;

/// Deleted clock ranges, grouped by client.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct DeleteSet {
    clients: FxHashMap<ClientId, Vec<ClockRange>>,
}

impl DeleteSet {
    pub fn new() -> DeleteSet {
        return DeleteSet {
            clients: FxHashMap::default(),
        };
    }

    /// Mark `len` units starting at `id` as deleted.
    pub fn insert(&mut self, id: Id, len: u32) {
        if len == 0 {
            return;
        }
        let ranges = self.clients.entry(id.client).or_default();
        let mut merged = ClockRange::new(id.clock, id.clock + len);
        let lo = ranges.partition_point(|r| r.end < merged.start);
        let mut hi = lo;
        while hi < ranges.len() && ranges[hi].touches(&merged) {
            merged.start = merged.start.min(ranges[hi].start);
            merged.end = merged.end.max(ranges[hi].end);
            hi += 1;
        }
        ranges.splice(lo..hi, [merged]);
    }

    /// Whether the unit identified by `id` is deleted.
    pub fn contains(&self, id: &Id) -> bool {
        let Some(ranges) = self.clients.get(&id.client) else {
            return false;
        };
        let idx = ranges.partition_point(|r| r.end <= id.clock);
        return ranges.get(idx).is_some_and(|r| r.contains(id.clock));
    }

    /// Merge every range of `other` into this set.
    pub fn merge(&mut self, other: &DeleteSet) {
        for (client, ranges) in &other.clients {
            for range in ranges {
                self.insert(Id::new(*client, range.start), range.len());
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        return self.clients.values().all(|ranges| ranges.is_empty());
    }

    /// Total number of deleted units.
    pub fn len(&self) -> u64 {
        return self
            .clients
            .values()
            .flat_map(|ranges| ranges.iter())
            .map(|r| r.len() as u64)
            .sum();
    }

    /// Ranges for one client, sorted by clock.
    pub fn ranges(&self, client: ClientId) -> &[ClockRange] {
        return self
            .clients
            .get(&client)
            .map(|ranges| ranges.as_slice())
            .unwrap_or(&[]);
    }

    /// Iterate over `(client, ranges)` in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = (ClientId, &[ClockRange])> + '_ {
        return self
            .clients
            .iter()
            .map(|(client, ranges)| (*client, ranges.as_slice()));
    }

    fn sorted_clients(&self) -> Vec<ClientId> {
        let mut clients: Vec<ClientId> = self
            .clients
            .iter()
            .filter(|(_, ranges)| !ranges.is_empty())
            .map(|(client, _)| *client)
            .collect();
        clients.sort_by(|a, b| b.cmp(a));
        return clients;
    }
}

impl fmt::Debug for DeleteSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for client in self.sorted_clients().into_iter().rev() {
            let ranges: Vec<_> = self
                .ranges(client)
                .iter()
                .map(|r| r.start..r.end)
                .collect();
            map.entry(&client, &ranges);
        }
        return map.finish();
    }
}

impl Encode for DeleteSet {
    fn encode(&self, encoder: &mut Encoder) {
        let clients = self.sorted_clients();
        encoder.write_var_u64(clients.len() as u64);
        for client in clients {
            let ranges = self.ranges(client);
            encoder.write_var_u64(client);
            encoder.write_var_u64(ranges.len() as u64);
            for range in ranges {
                encoder.write_var_u32(range.start);
                encoder.write_var_u32(range.len());
            }
        }
    }
}

impl Decode for DeleteSet {
    fn decode(decoder: &mut Decoder<'_>) -> Result<DeleteSet> {
        let mut ds = DeleteSet::new();
        let clients = decoder.read_len()?;
        for _ in 0..clients {
            let client = decoder.read_var_u64()?;
            let count = decoder.read_len()?;
            for _ in 0..count {
                let clock = decoder.read_var_u32()?;
                let len = decoder.read_var_u32()?;
                if clock.checked_add(len).is_none() {
                    return Err(Error::malformed("delete range overflows clock space"));
                }
                ds.insert(Id::new(client, clock), len);
            }
        }
        return Ok(ds);
    }
}
