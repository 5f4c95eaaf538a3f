//! Entity update reader.
//!
//! The receiving half of the update wire format: parses the per-entity
//! headers, applies EnterPvs bodies over the applicable baseline and
//! DeltaEnt bodies over current state, processes leave/delete markers and
//! the trailing deletion list. Used by direct clients, by relays to rebuild
//! their own snapshot state, and by round-trip tests.

use std::collections::BTreeMap;

use crate::baseline::BaselineTables;
use crate::bitbuf::BitReader;
use crate::client_frame::EntitySet;
use crate::error::ReplError;
use crate::net::PacketEntitiesMsg;
use crate::props::ClassTable;
use crate::world::{SlotView, WorldView};
use crate::{MAX_EDICT_BITS, SERIAL_NUM_BITS};

/// One reconstructed entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityState {
    pub class_id: u16,
    pub serial: i32,
    pub values: Vec<u32>,
}

/// Client-side entity state, rebuilt update by update. Implements
/// [`WorldView`] so a relay can feed it straight back into its own snapshot
/// manager.
#[derive(Debug)]
pub struct EntityStateTable {
    slots: Vec<Option<EntityState>>,
    visible: EntitySet,
    /// Tick of the last applied update.
    pub tick: u32,
}

impl EntityStateTable {
    pub fn new(max_entities: usize) -> Self {
        Self {
            slots: vec![None; max_entities],
            visible: EntitySet::new(max_entities),
            tick: 0,
        }
    }

    pub fn entity(&self, index: u32) -> Option<&EntityState> {
        self.slots.get(index as usize)?.as_ref()
    }

    pub fn is_visible(&self, index: u32) -> bool {
        self.visible.contains(index)
    }

    pub fn visible_entities(&self) -> impl Iterator<Item = u32> + '_ {
        self.visible.iter()
    }
}

impl WorldView for EntityStateTable {
    fn num_slots(&self) -> usize {
        self.slots.len()
    }

    fn slot(&self, index: usize) -> Option<SlotView<'_>> {
        if !self.visible.contains(index as u32) {
            return None;
        }
        let state = self.slots.get(index)?.as_ref()?;
        Some(SlotView {
            class_id: state.class_id,
            serial: state.serial,
            values: &state.values,
        })
    }
}

/// Summary of one applied update.
#[derive(Debug, Default)]
pub struct ReadSummary {
    pub entered: Vec<u32>,
    pub deltas: u32,
    pub left: Vec<u32>,
    pub deleted: Vec<u32>,
}

/// Applies one entity update message to the table.
pub fn read_packet_entities(
    msg: &PacketEntitiesMsg,
    classes: &ClassTable,
    baselines: &mut BaselineTables,
    table: &mut EntityStateTable,
) -> anyhow::Result<ReadSummary> {
    let mut r = BitReader::new(&msg.data, msg.bits as usize);
    let mut summary = ReadSummary::default();
    let mut last = -1i64;
    let mut named = EntitySet::new(table.slots.len());

    for _ in 0..msg.num_entries {
        let idx = (last + 1 + r.read_ubitvar()? as i64) as u32;
        last = idx as i64;
        if idx as usize >= table.slots.len() {
            return Err(
                ReplError::ProtocolInvariant(format!("entity index {idx} out of range")).into(),
            );
        }
        named.set(idx);

        let leaving = r.read_bit()?;
        if leaving {
            let delete = r.read_bit()?;
            table.visible.clear(idx);
            if delete {
                table.slots[idx as usize] = None;
                summary.deleted.push(idx);
            } else {
                summary.left.push(idx);
            }
            continue;
        }

        let enter = r.read_bit()?;
        if enter {
            let class_id = r.read_ubits(classes.class_bits())? as u16;
            let serial = r.read_ubits(SERIAL_NUM_BITS)? as i32;
            let layout = classes.layout(class_id).ok_or_else(|| {
                ReplError::ProtocolInvariant(format!("unknown class id {class_id}"))
            })?;
            let mut values = baselines.values_at(msg.baseline_index, class_id);
            values.resize(layout.num_props(), 0);
            layout.read_prop_list(&mut r, &mut values)?;
            table.slots[idx as usize] = Some(EntityState {
                class_id,
                serial,
                values,
            });
            table.visible.set(idx);
            summary.entered.push(idx);
        } else {
            let state = table.slots[idx as usize].as_mut().ok_or_else(|| {
                ReplError::ProtocolInvariant(format!("delta for unknown entity {idx}"))
            })?;
            let layout = classes.layout(state.class_id).ok_or_else(|| {
                ReplError::ProtocolInvariant(format!("unknown class id {}", state.class_id))
            })?;
            layout.read_prop_list(&mut r, &mut state.values)?;
            summary.deltas += 1;
        }
    }

    // Trailing deletion list.
    while r.read_bit()? {
        let idx = r.read_ubits(MAX_EDICT_BITS)?;
        if let Some(slot) = table.slots.get_mut(idx as usize) {
            *slot = None;
            table.visible.clear(idx);
            named.set(idx);
        }
        summary.deleted.push(idx);
    }

    if r.remaining_bits() != 0 {
        return Err(ReplError::ProtocolInvariant(format!(
            "{} trailing bits after update for tick {}",
            r.remaining_bits(),
            msg.tick
        ))
        .into());
    }

    // A full update enumerates everything the sender transmits, so any
    // retained slot it does not name was destroyed (or left range) while
    // this recipient had no usable basis. Drop it.
    if msg.delta_tick < 0 {
        for idx in 0..table.slots.len() as u32 {
            if named.contains(idx) || table.slots[idx as usize].is_none() {
                continue;
            }
            table.slots[idx as usize] = None;
            table.visible.clear(idx);
            summary.deleted.push(idx);
        }
    }

    // The sender asked us to adopt this full state as the next baseline.
    if msg.update_baseline {
        let mut per_class: BTreeMap<u16, Vec<u32>> = BTreeMap::new();
        for idx in table.visible.iter() {
            if let Some(state) = table.entity(idx) {
                per_class
                    .entry(state.class_id)
                    .or_insert_with(|| state.values.clone());
            }
        }
        for (class_id, values) in per_class {
            baselines.stage(class_id, values);
        }
        baselines.swap();
    }

    table.tick = msg.tick;
    Ok(summary)
}
