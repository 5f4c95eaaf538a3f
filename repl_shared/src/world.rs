//! Live world-object table.
//!
//! The slot table the snapshot manager scans once per tick: per slot an
//! allocated flag, class id, serial number, an active flag for connected
//! player slots, and the flat property values of the class layout.
//! Iteration order is the slot order, so downstream diffing is order-stable.
//!
//! [`WorldView`] is the narrow read contract the snapshot manager consumes;
//! the relay's reconstructed entity table implements it too, which is what
//! lets the relay replay the same snapshot machinery over received state.

use serde::{Deserialize, Serialize};

/// Read-only view of one live slot.
#[derive(Debug, Clone, Copy)]
pub struct SlotView<'a> {
    pub class_id: u16,
    pub serial: i32,
    pub values: &'a [u32],
}

/// What the snapshot manager needs from the world: ordered slots, each
/// either live (allocated and, for player slots, active) or skippable.
pub trait WorldView {
    fn num_slots(&self) -> usize;

    /// `None` for unallocated, freed, or inactive player slots; those are
    /// skipped deterministically by the per-tick scan.
    fn slot(&self, index: usize) -> Option<SlotView<'_>>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct WorldSlot {
    allocated: bool,
    class_id: u16,
    serial: i32,
    next_serial: i32,
    player_slot: bool,
    active: bool,
    values: Vec<u32>,
}

/// Mutable world-object table owned by the simulation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorldTable {
    slots: Vec<WorldSlot>,
}

impl WorldTable {
    pub fn new(num_slots: usize) -> Self {
        Self {
            slots: vec![WorldSlot::default(); num_slots],
        }
    }

    /// Allocates the slot, assigning the next serial number for that slot.
    /// Respawning into a previously used slot yields a fresh serial.
    pub fn spawn(&mut self, index: usize, class_id: u16, values: Vec<u32>) -> i32 {
        let slot = &mut self.slots[index];
        let serial = slot.next_serial;
        slot.next_serial += 1;
        slot.allocated = true;
        slot.class_id = class_id;
        slot.serial = serial;
        slot.player_slot = false;
        slot.active = true;
        slot.values = values;
        serial
    }

    /// Marks the slot as a connected-player slot; inactive player slots are
    /// skipped by the snapshot scan even while allocated.
    pub fn set_player_slot(&mut self, index: usize, active: bool) {
        let slot = &mut self.slots[index];
        slot.player_slot = true;
        slot.active = active;
    }

    pub fn free(&mut self, index: usize) {
        let slot = &mut self.slots[index];
        slot.allocated = false;
        slot.values.clear();
    }

    pub fn is_allocated(&self, index: usize) -> bool {
        self.slots[index].allocated
    }

    pub fn serial(&self, index: usize) -> i32 {
        self.slots[index].serial
    }

    pub fn set_value(&mut self, index: usize, prop: usize, value: u32) {
        self.slots[index].values[prop] = value;
    }

    pub fn value(&self, index: usize, prop: usize) -> u32 {
        self.slots[index].values[prop]
    }
}

impl WorldView for WorldTable {
    fn num_slots(&self) -> usize {
        self.slots.len()
    }

    fn slot(&self, index: usize) -> Option<SlotView<'_>> {
        let slot = self.slots.get(index)?;
        if !slot.allocated || (slot.player_slot && !slot.active) {
            return None;
        }
        Some(SlotView {
            class_id: slot.class_id,
            serial: slot.serial,
            values: &slot.values,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn respawn_bumps_serial() {
        let mut world = WorldTable::new(8);
        let s0 = world.spawn(3, 1, vec![0, 0]);
        world.free(3);
        let s1 = world.spawn(3, 1, vec![0, 0]);
        assert!(s1 > s0);
    }

    #[test]
    fn inactive_player_slots_are_skipped() {
        let mut world = WorldTable::new(8);
        world.spawn(1, 0, vec![5]);
        world.set_player_slot(1, false);
        assert!(world.is_allocated(1));
        assert!(world.slot(1).is_none());
        world.set_player_slot(1, true);
        assert!(world.slot(1).is_some());
    }

    #[test]
    fn freed_slots_vanish_from_the_view() {
        let mut world = WorldTable::new(4);
        world.spawn(2, 0, vec![1]);
        assert!(world.slot(2).is_some());
        world.free(2);
        assert!(world.slot(2).is_none());
    }
}
