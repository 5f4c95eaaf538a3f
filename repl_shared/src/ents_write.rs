//! Entity update writer.
//!
//! Turns two client frames (the recipient's acknowledged old frame and the
//! new frame being sent) into wire bits. The writer merges the two
//! monotonically increasing entity-index streams, advancing whichever
//! cursor is behind, with [`ENTITY_SENTINEL`](crate::ENTITY_SENTINEL)
//! standing in for an exhausted stream.
//!
//! Per update the wire carries: a UBitVar offset from the previously
//! written entity index, one bit for leaving-vs-present, and a second bit
//! whose meaning depends on the first (delete-vs-leave, enter-vs-delta).
//! Preserved entities cost nothing; cursor advancement on the reader side
//! encodes "still here". The stream ends with the explicit-deletion list:
//! (1 bit, fixed-width index) pairs closed by a single 0 bit.

use tracing::trace;

use crate::baseline::BaselineTables;
use crate::bitbuf::{BitReader, BitWriter};
use crate::client_frame::{ClientFrame, EntitySet};
use crate::error::ReplError;
use crate::props::ClassTable;
use crate::snapshot::EntityRecord;
use crate::{ENTITY_SENTINEL, MAX_EDICT_BITS, SERIAL_NUM_BITS};

/// Per-entity decision of the writer state machine.
#[derive(Debug)]
pub enum UpdateType {
    EnterPvs,
    LeavePvs,
    /// Carries the old record the delta is computed against.
    DeltaEnt(EntityRecord),
    PreserveEnt,
}

/// A cached per-entity delta body, shared across recipients with the same
/// basis tick (relay fan-out).
#[derive(Debug, Clone, Copy)]
pub enum CachedDelta<'a> {
    /// Zero changed properties: the entity is preserved, no body needed.
    Unchanged,
    Bits { data: &'a [u8], bits: u32 },
}

/// Memoizes computed delta bodies keyed by (entity index, basis tick).
/// Implemented by the relay's delta-bit cache; the game server writes
/// per-recipient (culled) output and passes no cache.
pub trait DeltaBitsCache {
    fn find(&self, entity_index: u32, delta_tick: i32) -> Option<CachedDelta<'_>>;
    fn add_unchanged(&mut self, entity_index: u32, delta_tick: i32);
    fn add_bits(&mut self, entity_index: u32, delta_tick: i32, data: &[u8], bits: u32);
}

/// Inputs that are constant across one write pass.
pub struct WriteParams<'a> {
    pub classes: &'a ClassTable,
    pub baselines: &'a BaselineTables,
    /// Entity index owned by the recipient, for owner-only culling.
    pub owned_entity: Option<u32>,
    /// Apply per-recipient property culling. Must be off when output is
    /// shared through a delta-bit cache.
    pub cull: bool,
}

/// Outcome of one write pass.
#[derive(Debug)]
pub struct WriteResult {
    /// Updates encoded (enter + leave + delta; preserves are implicit).
    pub num_entries: u32,
}

struct Cursor<'a> {
    iter: Box<dyn Iterator<Item = u32> + 'a>,
    current: u32,
}

impl<'a> Cursor<'a> {
    fn new(set: Option<&'a EntitySet>) -> Self {
        let mut iter: Box<dyn Iterator<Item = u32> + 'a> = match set {
            Some(s) => Box::new(s.iter()),
            None => Box::new(std::iter::empty()),
        };
        let current = iter.next().unwrap_or(ENTITY_SENTINEL);
        Self { iter, current }
    }

    fn advance(&mut self) {
        self.current = self.iter.next().unwrap_or(ENTITY_SENTINEL);
    }
}

/// Writes the entity update for one recipient into `out`.
///
/// `old_frame == None` means a full update: every visible entity enters
/// from baseline. Fills `new_frame.from_baseline` with the entities that
/// were sent as full (EnterPvs) updates.
pub fn write_delta_entities(
    params: &WriteParams<'_>,
    new_frame: &mut ClientFrame,
    old_frame: Option<&ClientFrame>,
    mut cache: Option<&mut dyn DeltaBitsCache>,
    out: &mut BitWriter,
) -> anyhow::Result<WriteResult> {
    if let Some(old) = old_frame {
        if old.tick == new_frame.tick {
            return Err(ReplError::ProtocolInvariant(format!(
                "delta update against the frame's own tick {}",
                new_frame.tick
            ))
            .into());
        }
    }
    let delta_tick: i32 = old_frame.map(|f| f.tick as i32).unwrap_or(-1);
    let new_snap = new_frame.snapshot.clone();
    let old_snap = old_frame.map(|f| f.snapshot.clone());

    let mut old_cursor = Cursor::new(old_frame.map(|f| &f.transmit));
    let mut new_cursor = Cursor::new(Some(&new_frame.transmit));

    let mut from_baseline = EntitySet::new(new_frame.transmit.capacity());
    let mut leave_handled = EntitySet::new(new_snap.max_entities());
    let mut last_emitted: i64 = -1;
    let mut num_entries = 0u32;

    while old_cursor.current != ENTITY_SENTINEL || new_cursor.current != ENTITY_SENTINEL {
        let old_idx = old_cursor.current;
        let new_idx = new_cursor.current;

        if new_idx < old_idx {
            // Newly visible.
            let rec = record_for(&new_snap, new_idx)?;
            write_enter_pvs(params, out, &mut last_emitted, new_idx, rec)?;
            from_baseline.set(new_idx);
            num_entries += 1;
            new_cursor.advance();
        } else if new_idx > old_idx {
            // Left visibility; the delete bit rides along when the object
            // is truly gone from the new snapshot, not merely out of range.
            write_header(out, &mut last_emitted, old_idx);
            out.write_bit(true);
            out.write_bit(new_snap.is_gone(old_idx));
            leave_handled.set(old_idx);
            num_entries += 1;
            old_cursor.advance();
        } else {
            let new_rec = record_for(&new_snap, new_idx)?;
            let old_rec = old_snap.as_ref().and_then(|s| s.record(old_idx)).cloned();

            match determine_pair_update(old_rec, new_rec) {
                UpdateType::EnterPvs => {
                    // Serial changed in place, or the old frame never had
                    // this entity: forced recreate, never a delta.
                    write_enter_pvs(params, out, &mut last_emitted, new_idx, new_rec)?;
                    from_baseline.set(new_idx);
                    num_entries += 1;
                }
                UpdateType::PreserveEnt => {
                    // Same blob reused unchanged; nothing on the wire.
                }
                UpdateType::DeltaEnt(old_rec) => {
                    if old_rec.class_id != new_rec.class_id {
                        return Err(ReplError::ProtocolInvariant(format!(
                            "entity {new_idx} changed class {} -> {} without a recreate",
                            old_rec.class_id, new_rec.class_id
                        ))
                        .into());
                    }
                    if write_delta_ent(
                        params,
                        out,
                        &mut last_emitted,
                        new_idx,
                        delta_tick,
                        &old_rec,
                        new_rec,
                        cache.as_mut().map(|c| &mut **c),
                    )? {
                        num_entries += 1;
                    }
                }
                UpdateType::LeavePvs => unreachable!("paired cursors never produce LeavePvs"),
            }
            old_cursor.advance();
            new_cursor.advance();
        }
    }

    // Trailing deletion pass: old-snapshot entities that vanished without a
    // LeavePvs on this recipient's stream.
    if let Some(old_snap) = &old_snap {
        for &idx in old_snap.valid_entities() {
            if leave_handled.contains(idx) || !new_snap.is_gone(idx) {
                continue;
            }
            out.write_bit(true);
            out.write_ubits(idx, MAX_EDICT_BITS);
        }
    }
    out.write_bit(false);

    new_frame.from_baseline = Some(from_baseline);
    trace!(
        tick = new_frame.tick,
        delta_tick,
        num_entries,
        bits = out.bit_len(),
        "wrote entity update"
    );
    Ok(WriteResult { num_entries })
}

fn record_for<'a>(
    snap: &'a crate::snapshot::Snapshot,
    index: u32,
) -> anyhow::Result<&'a EntityRecord> {
    snap.record(index).ok_or_else(|| {
        ReplError::ProtocolInvariant(format!(
            "transmit set names entity {index} with no record at tick {}",
            snap.tick
        ))
        .into()
    })
}

/// Transition rule for paired indices. Recreate (serial mismatch) always
/// wins over delta; an entity is never both deleted and delta-encoded.
fn determine_pair_update(old_rec: Option<EntityRecord>, new_rec: &EntityRecord) -> UpdateType {
    match old_rec {
        None => UpdateType::EnterPvs,
        Some(old) if old.serial != new_rec.serial => UpdateType::EnterPvs,
        Some(old) if std::sync::Arc::ptr_eq(&old.blob, &new_rec.blob) => UpdateType::PreserveEnt,
        Some(old) => UpdateType::DeltaEnt(old),
    }
}

fn write_header(out: &mut BitWriter, last_emitted: &mut i64, index: u32) {
    out.write_ubitvar((index as i64 - *last_emitted - 1) as u32);
    *last_emitted = index as i64;
}

fn write_enter_pvs(
    params: &WriteParams<'_>,
    out: &mut BitWriter,
    last_emitted: &mut i64,
    index: u32,
    rec: &EntityRecord,
) -> anyhow::Result<()> {
    let layout = params.classes.layout(rec.class_id).ok_or_else(|| {
        ReplError::ProtocolInvariant(format!("unknown class id {}", rec.class_id))
    })?;

    write_header(out, last_emitted, index);
    out.write_bit(false); // present
    out.write_bit(true); // enter
    out.write_ubits(rec.class_id as u32, params.classes.class_bits());
    out.write_ubits(
        rec.serial as u32 & ((1 << SERIAL_NUM_BITS) - 1),
        SERIAL_NUM_BITS,
    );

    // Full property set, encoded as everything that differs from the
    // applicable baseline.
    let bytes = rec.blob.bytes()?;
    let values = layout.unpack(&mut BitReader::new(&bytes, rec.blob.bit_len()))?;
    let baseline = params.baselines.values(rec.class_id);
    let mut changed: Vec<u32> = (0..layout.num_props() as u32)
        .filter(|&i| values[i as usize] != baseline.get(i as usize).copied().unwrap_or(0))
        .collect();
    if params.cull {
        changed = layout.cull_props(&changed, params.owned_entity == Some(index));
    }
    layout.write_prop_list(&values, &changed, out);
    Ok(())
}

/// Writes a DeltaEnt update, or nothing when the changed set culls to
/// empty (PreserveEnt). Returns whether an entry was emitted.
#[allow(clippy::too_many_arguments)]
fn write_delta_ent(
    params: &WriteParams<'_>,
    out: &mut BitWriter,
    last_emitted: &mut i64,
    index: u32,
    delta_tick: i32,
    old_rec: &EntityRecord,
    new_rec: &EntityRecord,
    cache: Option<&mut (dyn DeltaBitsCache + '_)>,
) -> anyhow::Result<bool> {
    // Cached body from another viewer at the same basis?
    if let Some(cache) = &cache {
        match cache.find(index, delta_tick) {
            Some(CachedDelta::Unchanged) => return Ok(false),
            Some(CachedDelta::Bits { data, bits }) => {
                write_header(out, last_emitted, index);
                out.write_bit(false);
                out.write_bit(false);
                out.write_raw_bits(data, bits as usize);
                return Ok(true);
            }
            None => {}
        }
    }

    let layout = params.classes.layout(new_rec.class_id).ok_or_else(|| {
        ReplError::ProtocolInvariant(format!("unknown class id {}", new_rec.class_id))
    })?;

    let old_bytes = old_rec.blob.bytes()?;
    let new_bytes = new_rec.blob.bytes()?;

    // Narrow with the change frame list when the basis tick is known.
    let candidates = (delta_tick >= 0)
        .then(|| new_rec.blob.change_frames.changed_since(delta_tick as u32));
    let mut changed = layout.compute_changed_props(
        &mut BitReader::new(&old_bytes, old_rec.blob.bit_len()),
        &mut BitReader::new(&new_bytes, new_rec.blob.bit_len()),
        candidates.as_deref(),
    )?;
    if params.cull {
        changed = layout.cull_props(&changed, params.owned_entity == Some(index));
    }

    if changed.is_empty() {
        if let Some(cache) = cache {
            cache.add_unchanged(index, delta_tick);
        }
        return Ok(false);
    }

    let values = layout.unpack(&mut BitReader::new(&new_bytes, new_rec.blob.bit_len()))?;
    let mut body = BitWriter::new();
    layout.write_prop_list(&values, &changed, &mut body);

    write_header(out, last_emitted, index);
    out.write_bit(false);
    out.write_bit(false);
    out.write_raw_bits(body.as_bytes(), body.bit_len());

    if let Some(cache) = cache {
        cache.add_bits(index, delta_tick, body.as_bytes(), body.bit_len() as u32);
    }
    Ok(true)
}
