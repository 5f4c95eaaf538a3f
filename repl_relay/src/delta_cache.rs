//! Shared delta-bit cache.
//!
//! Many viewers of one relay acknowledge the same basis tick, so the delta
//! body computed for the first viewer is byte-for-byte what every later
//! viewer at that basis needs. The cache memoizes bodies keyed by (entity
//! index, basis tick). A zero-bit entry records "no change" so repeated
//! PreserveEnt decisions skip recomputation too.
//!
//! Single-writer, single-current-tick semantics: the cache only ever holds
//! entries for one serving tick and is flushed whenever the tick moves on.
//! Entries are plain owned buffers; nothing here is reference counted.

use repl_shared::ents_write::{CachedDelta, DeltaBitsCache};

#[derive(Debug)]
struct DeltaEntry {
    delta_tick: i32,
    bits: u32,
    data: Vec<u8>,
}

#[derive(Debug, Default)]
pub struct DeltaEntityCache {
    tick: u32,
    max_bytes: usize,
    used_bytes: usize,
    entries: Vec<Vec<DeltaEntry>>,
}

impl DeltaEntityCache {
    /// `max_bytes == 0` disables caching entirely.
    pub fn new(max_bytes: usize) -> Self {
        Self {
            tick: 0,
            max_bytes,
            used_bytes: 0,
            entries: Vec::new(),
        }
    }

    pub fn flush(&mut self) {
        self.entries.clear();
        self.used_bytes = 0;
    }

    /// Moves the cache to a new serving tick, flushing stale entries. A
    /// repeated call with the current tick is a no-op so multiple viewers
    /// within one tick keep their hits.
    pub fn set_tick(&mut self, tick: u32, max_entities: usize) {
        if tick == self.tick && !self.entries.is_empty() {
            return;
        }
        self.flush();
        self.tick = tick;
        if self.max_bytes > 0 {
            self.entries.resize_with(max_entities, Vec::new);
        }
    }

    pub fn used_bytes(&self) -> usize {
        self.used_bytes
    }

    fn slot(&self, entity_index: u32) -> Option<&Vec<DeltaEntry>> {
        self.entries.get(entity_index as usize)
    }
}

impl DeltaBitsCache for DeltaEntityCache {
    fn find(&self, entity_index: u32, delta_tick: i32) -> Option<CachedDelta<'_>> {
        let entry = self
            .slot(entity_index)?
            .iter()
            .find(|e| e.delta_tick == delta_tick)?;
        if entry.bits == 0 {
            Some(CachedDelta::Unchanged)
        } else {
            Some(CachedDelta::Bits {
                data: &entry.data,
                bits: entry.bits,
            })
        }
    }

    fn add_unchanged(&mut self, entity_index: u32, delta_tick: i32) {
        let Some(slot) = self.entries.get_mut(entity_index as usize) else {
            return;
        };
        slot.push(DeltaEntry {
            delta_tick,
            bits: 0,
            data: Vec::new(),
        });
    }

    fn add_bits(&mut self, entity_index: u32, delta_tick: i32, data: &[u8], bits: u32) {
        if self.used_bytes + data.len() > self.max_bytes {
            return; // full; later viewers just recompute
        }
        let Some(slot) = self.entries.get_mut(entity_index as usize) else {
            return;
        };
        self.used_bytes += data.len();
        slot.push(DeltaEntry {
            delta_tick,
            bits,
            data: data.to_vec(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hits_are_idempotent_per_basis() {
        let mut cache = DeltaEntityCache::new(1024);
        cache.set_tick(101, 16);
        cache.add_bits(5, 100, &[0xAB, 0x03], 10);

        for _ in 0..3 {
            match cache.find(5, 100) {
                Some(CachedDelta::Bits { data, bits }) => {
                    assert_eq!(data, &[0xAB, 0x03]);
                    assert_eq!(bits, 10);
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert!(cache.find(5, 99).is_none(), "different basis misses");
        assert!(cache.find(6, 100).is_none());
    }

    #[test]
    fn zero_bit_entry_means_no_change() {
        let mut cache = DeltaEntityCache::new(1024);
        cache.set_tick(7, 16);
        cache.add_unchanged(2, 6);
        assert!(matches!(cache.find(2, 6), Some(CachedDelta::Unchanged)));
    }

    #[test]
    fn tick_change_flushes_everything() {
        let mut cache = DeltaEntityCache::new(1024);
        cache.set_tick(7, 16);
        cache.add_bits(1, 6, &[0xFF], 8);
        assert!(cache.find(1, 6).is_some());

        cache.set_tick(7, 16); // same tick: keep
        assert!(cache.find(1, 6).is_some());

        cache.set_tick(8, 16);
        assert!(cache.find(1, 6).is_none());
        assert_eq!(cache.used_bytes(), 0);
    }

    #[test]
    fn byte_budget_is_respected() {
        let mut cache = DeltaEntityCache::new(4);
        cache.set_tick(1, 8);
        cache.add_bits(0, 0, &[1, 2, 3], 24);
        cache.add_bits(1, 0, &[4, 5, 6], 24); // over budget, dropped
        assert!(cache.find(0, 0).is_some());
        assert!(cache.find(1, 0).is_none());
    }

    #[test]
    fn zero_budget_disables_the_cache() {
        let mut cache = DeltaEntityCache::new(0);
        cache.set_tick(1, 8);
        cache.add_bits(0, 0, &[1], 8);
        assert!(cache.find(0, 0).is_none());
    }
}
