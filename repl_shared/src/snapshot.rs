//! Snapshots and the snapshot manager.
//!
//! A snapshot is the immutable record of every entity identity (class +
//! serial) and its packed blob at one tick. The manager is the only
//! component that creates blobs and snapshots: it owns the bounded blob
//! pool, the most-recently-sent cache used to detect unchanged entities
//! from tick to tick, and the live counters that make freeing observable.
//!
//! Ownership is an acyclic DAG: a snapshot exclusively owns its record
//! array; each record holds a shared handle to a pooled blob; each blob
//! exclusively owns its change frame list. Dropping the last handle to a
//! snapshot releases every blob reference it held — there is no background
//! collection and no back-references.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Context;
use tracing::trace;

use crate::bitbuf::{BitReader, BitWriter};
use crate::config::ReplConfig;
use crate::error::ReplError;
use crate::packed_entity::{ChangeFrameList, PackedEntity, PoolSlot};
use crate::props::ClassTable;
use crate::world::{SlotView, WorldView};

/// One entity's identity and blob handle within a snapshot.
#[derive(Debug, Clone)]
pub struct EntityRecord {
    pub serial: i32,
    pub class_id: u16,
    pub blob: Arc<PackedEntity>,
}

/// Immutable picture of all live entities at one tick.
#[derive(Debug)]
pub struct Snapshot {
    pub tick: u32,
    records: Vec<Option<EntityRecord>>,
    valid: Vec<u32>,
    _live: PoolSlot,
}

impl Snapshot {
    pub fn max_entities(&self) -> usize {
        self.records.len()
    }

    /// Ascending indices of slots that hold a live entity this tick.
    pub fn valid_entities(&self) -> &[u32] {
        &self.valid
    }

    pub fn record(&self, entity_index: u32) -> Option<&EntityRecord> {
        self.records.get(entity_index as usize)?.as_ref()
    }

    pub fn packed_entity(&self, entity_index: u32) -> Option<Arc<PackedEntity>> {
        Some(self.record(entity_index)?.blob.clone())
    }

    /// A slot that held an entity in an older snapshot but has no record
    /// here was truly destroyed (as opposed to merely out of a recipient's
    /// visibility set).
    pub fn is_gone(&self, entity_index: u32) -> bool {
        self.record(entity_index).is_none()
    }
}

/// Creates and owns snapshots and packed entity blobs.
pub struct SnapshotManager {
    classes: Arc<ClassTable>,
    pool_capacity: usize,
    store_compressed: bool,
    tick_base_interval: u32,
    live_blobs: Arc<AtomicUsize>,
    live_snapshots: Arc<AtomicUsize>,
    /// Most-recently-sent blob per entity slot. Holds one reference so an
    /// unchanged entity next tick reuses the encoding instead of repacking.
    mrs: Vec<Option<Arc<PackedEntity>>>,
}

impl SnapshotManager {
    pub fn new(classes: Arc<ClassTable>, cfg: &ReplConfig) -> Self {
        Self {
            classes,
            pool_capacity: cfg.pool_capacity,
            store_compressed: cfg.store_compressed,
            tick_base_interval: cfg.tick_base_interval,
            live_blobs: Arc::new(AtomicUsize::new(0)),
            live_snapshots: Arc::new(AtomicUsize::new(0)),
            mrs: vec![None; cfg.max_entities],
        }
    }

    pub fn classes(&self) -> &Arc<ClassTable> {
        &self.classes
    }

    /// Counting allocator: blobs currently alive (pool + snapshots + any
    /// out-of-band holder).
    pub fn live_blobs(&self) -> usize {
        self.live_blobs.load(Ordering::Relaxed)
    }

    /// Counting allocator: snapshots currently alive.
    pub fn live_snapshots(&self) -> usize {
        self.live_snapshots.load(Ordering::Relaxed)
    }

    /// An all-empty snapshot of the given capacity.
    pub fn create_empty_snapshot(&self, tick: u32, max_entities: usize) -> Arc<Snapshot> {
        Arc::new(Snapshot {
            tick,
            records: vec![None; max_entities],
            valid: Vec::new(),
            _live: PoolSlot::new(self.live_snapshots.clone()),
        })
    }

    /// Scans the world once, in slot order, packing every live entity.
    /// Unallocated, freed, and inactive player slots are skipped by the
    /// view, so the valid-entity list is order-stable across ticks.
    pub fn take_tick_snapshot(
        &mut self,
        tick: u32,
        world: &dyn WorldView,
    ) -> anyhow::Result<Arc<Snapshot>> {
        let num_slots = world.num_slots().min(self.mrs.len());
        let mut records: Vec<Option<EntityRecord>> = vec![None; self.mrs.len()];
        let mut valid = Vec::new();

        for index in 0..num_slots {
            let Some(slot) = world.slot(index) else {
                continue;
            };
            let blob = self.pack_entity(tick, index as u32, slot)?;
            records[index] = Some(EntityRecord {
                serial: slot.serial,
                class_id: slot.class_id,
                blob,
            });
            valid.push(index as u32);
        }

        trace!(tick, entities = valid.len(), "took tick snapshot");
        Ok(Arc::new(Snapshot {
            tick,
            records,
            valid,
            _live: PoolSlot::new(self.live_snapshots.clone()),
        }))
    }

    /// Packs one entity for `tick`, reusing the most-recently-sent blob when
    /// the encoding is unchanged and reuse would not cross an encoding-base
    /// boundary. A new blob starts from the previous blob's change frame
    /// history so the per-property last-changed ticks survive re-encoding.
    fn pack_entity(
        &mut self,
        tick: u32,
        entity_index: u32,
        slot: SlotView<'_>,
    ) -> anyhow::Result<Arc<PackedEntity>> {
        let layout = self.classes.layout(slot.class_id).ok_or_else(|| {
            ReplError::ProtocolInvariant(format!("unknown class id {}", slot.class_id))
        })?;

        let mut w = BitWriter::new();
        layout.pack(slot.values, &mut w);
        let (bytes, bit_len) = w.into_bytes();

        let prev = self.mrs[entity_index as usize]
            .as_ref()
            .filter(|p| p.class_id == slot.class_id)
            .cloned();

        if let Some(prev_blob) = &prev {
            if !self.should_force_repack(prev_blob, tick)
                && prev_blob.same_bits(&bytes, bit_len)?
            {
                // Unchanged: the snapshot shares the cached encoding.
                return Ok(prev_blob.clone());
            }
        }

        if self.live_blobs() >= self.pool_capacity {
            return Err(ReplError::PoolExhausted {
                capacity: self.pool_capacity,
            }
            .into());
        }

        let change_frames = match &prev {
            Some(prev_blob) => {
                let mut cfl = prev_blob.change_frames.clone();
                let prev_bytes = prev_blob.bytes()?;
                let changed = layout
                    .compute_changed_props(
                        &mut BitReader::new(&prev_bytes, prev_blob.bit_len()),
                        &mut BitReader::new(&bytes, bit_len),
                        None,
                    )
                    .context("diff against most-recently-sent blob")?;
                cfl.set_changed(&changed, tick);
                cfl
            }
            None => ChangeFrameList::new(layout.num_props(), tick),
        };

        let blob = Arc::new(PackedEntity::new(
            tick,
            entity_index,
            slot.class_id,
            bytes,
            bit_len,
            change_frames,
            self.store_compressed,
            Some(PoolSlot::new(self.live_blobs.clone())),
        )?);

        // Install in the most-recently-sent cache; the previous occupant's
        // reference is released here.
        self.mrs[entity_index as usize] = Some(blob.clone());
        Ok(blob)
    }

    /// Tick-relative properties encode against the current tick count, so a
    /// blob reused across an encoding-base window boundary would carry
    /// silently wrong values. Discard and rebuild instead.
    pub fn should_force_repack(&self, blob: &PackedEntity, tick: u32) -> bool {
        let layout = match self.classes.layout(blob.class_id) {
            Some(l) => l,
            None => return true,
        };
        if !layout.has_tick_relative_props() {
            return false;
        }
        blob.tick / self.tick_base_interval != tick / self.tick_base_interval
    }

    /// Drops all cached blobs; used at level teardown so the counting
    /// allocator can verify nothing leaked.
    pub fn clear_cache(&mut self) {
        for slot in &mut self.mrs {
            *slot = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::props::{ClassLayout, PropField};
    use crate::world::WorldTable;

    fn classes() -> Arc<ClassTable> {
        Arc::new(ClassTable::new(vec![
            ClassLayout::new(
                "thing",
                vec![PropField::new("a", 8), PropField::new("b", 16)],
            ),
            ClassLayout::new(
                "timer",
                vec![PropField::new("t", 16).tick_relative()],
            ),
        ]))
    }

    fn manager() -> SnapshotManager {
        SnapshotManager::new(classes(), &ReplConfig::default())
    }

    #[test]
    fn scan_skips_dead_and_inactive_slots() {
        let mut world = WorldTable::new(8);
        world.spawn(1, 0, vec![1, 2]);
        world.spawn(3, 0, vec![3, 4]);
        world.spawn(5, 0, vec![5, 6]);
        world.free(3);
        world.spawn(6, 0, vec![7, 8]);
        world.set_player_slot(6, false);

        let mut mgr = manager();
        let snap = mgr.take_tick_snapshot(100, &world).unwrap();
        assert_eq!(snap.valid_entities(), &[1, 5]);
        assert!(snap.is_gone(3));
        assert!(snap.is_gone(6));
    }

    #[test]
    fn unchanged_entity_reuses_the_cached_blob() {
        let mut world = WorldTable::new(4);
        world.spawn(0, 0, vec![10, 20]);

        let mut mgr = manager();
        let s1 = mgr.take_tick_snapshot(1, &world).unwrap();
        let s2 = mgr.take_tick_snapshot(2, &world).unwrap();
        let b1 = s1.packed_entity(0).unwrap();
        let b2 = s2.packed_entity(0).unwrap();
        assert!(Arc::ptr_eq(&b1, &b2));
        assert_eq!(mgr.live_blobs(), 1);
    }

    #[test]
    fn changed_entity_gets_a_new_blob_with_updated_change_frames() {
        let mut world = WorldTable::new(4);
        world.spawn(0, 0, vec![10, 20]);

        let mut mgr = manager();
        let s1 = mgr.take_tick_snapshot(1, &world).unwrap();
        world.set_value(0, 1, 21);
        let s2 = mgr.take_tick_snapshot(2, &world).unwrap();

        let b1 = s1.packed_entity(0).unwrap();
        let b2 = s2.packed_entity(0).unwrap();
        assert!(!Arc::ptr_eq(&b1, &b2));
        assert_eq!(b2.change_frames.changed_since(2), vec![1]);
    }

    #[test]
    fn pool_exhaustion_is_fatal() {
        let mut world = WorldTable::new(4);
        world.spawn(0, 0, vec![1, 1]);
        world.spawn(1, 0, vec![2, 2]);

        let cfg = ReplConfig {
            pool_capacity: 1,
            ..Default::default()
        };
        let mut mgr = SnapshotManager::new(classes(), &cfg);
        let err = mgr.take_tick_snapshot(1, &world).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ReplError>(),
            Some(ReplError::PoolExhausted { capacity: 1 })
        ));
    }

    #[test]
    fn tick_relative_classes_repack_across_base_windows() {
        let mut world = WorldTable::new(4);
        world.spawn(0, 1, vec![7]);

        let mut mgr = manager(); // tick_base_interval = 100
        let s1 = mgr.take_tick_snapshot(99, &world).unwrap();
        let s2 = mgr.take_tick_snapshot(100, &world).unwrap();
        let b1 = s1.packed_entity(0).unwrap();
        let b2 = s2.packed_entity(0).unwrap();
        assert!(!Arc::ptr_eq(&b1, &b2), "crossing 99->100 must repack");

        let s3 = mgr.take_tick_snapshot(150, &world).unwrap();
        let b3 = s3.packed_entity(0).unwrap();
        assert!(Arc::ptr_eq(&b2, &b3), "same window reuses");
    }

    #[test]
    fn dropping_snapshots_and_cache_frees_everything_once() {
        let mut world = WorldTable::new(4);
        world.spawn(0, 0, vec![1, 2]);

        let mut mgr = manager();
        let s1 = mgr.take_tick_snapshot(1, &world).unwrap();
        let s1b = s1.clone();
        assert_eq!(mgr.live_snapshots(), 1);
        assert_eq!(mgr.live_blobs(), 1);

        drop(s1);
        assert_eq!(mgr.live_snapshots(), 1, "second handle still pins it");
        drop(s1b);
        assert_eq!(mgr.live_snapshots(), 0);
        assert_eq!(mgr.live_blobs(), 1, "MRS cache still pins the blob");

        mgr.clear_cache();
        assert_eq!(mgr.live_blobs(), 0);
    }
}
