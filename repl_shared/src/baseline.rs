//! Baseline tables.
//!
//! The reference point for an entity's first encoding after entering a
//! recipient's visibility. Per class: the static (compiled-in) baseline from
//! the class layout defaults, plus two rotating instance baselines indexed
//! 0/1 — one active and implicitly referenced by EnterPvs encodings, the
//! other being staged for the next swap. Which index is active travels in
//! the update message header, so both ends agree on the basis.

use std::collections::HashMap;
use std::sync::Arc;

use crate::bitbuf::BitReader;
use crate::net::{BaselineEntry, BaselineSyncMsg};
use crate::props::ClassTable;
use crate::snapshot::Snapshot;

#[derive(Debug)]
pub struct BaselineTables {
    classes: Arc<ClassTable>,
    active: usize,
    instance: [HashMap<u16, Vec<u32>>; 2],
}

impl BaselineTables {
    pub fn new(classes: Arc<ClassTable>) -> Self {
        Self {
            classes,
            active: 0,
            instance: [HashMap::new(), HashMap::new()],
        }
    }

    pub fn active_index(&self) -> u8 {
        self.active as u8
    }

    /// The values an EnterPvs body is encoded against: the active instance
    /// baseline when one exists for the class, the static defaults
    /// otherwise.
    pub fn values(&self, class_id: u16) -> Vec<u32> {
        if let Some(v) = self.instance[self.active].get(&class_id) {
            return v.clone();
        }
        self.classes
            .layout(class_id)
            .map(|l| l.defaults.clone())
            .unwrap_or_default()
    }

    /// As seen from an explicit index (a received header may reference the
    /// index that was active when the message was written).
    pub fn values_at(&self, index: u8, class_id: u16) -> Vec<u32> {
        if let Some(v) = self.instance[(index as usize) & 1].get(&class_id) {
            return v.clone();
        }
        self.classes
            .layout(class_id)
            .map(|l| l.defaults.clone())
            .unwrap_or_default()
    }

    /// Stages a new instance baseline into the inactive slot. Takes effect
    /// for recipients only after [`swap`](Self::swap).
    pub fn stage(&mut self, class_id: u16, values: Vec<u32>) {
        self.instance[self.active ^ 1].insert(class_id, values);
    }

    /// Makes the staged table active. The previously active table becomes
    /// the next staging area.
    pub fn swap(&mut self) {
        self.active ^= 1;
    }

    /// Stages the full state of the lowest-index entity of each class found
    /// in the snapshot, then swaps. Returns how many classes were staged.
    /// Senders rotate after the update carrying the `update_baseline` flag;
    /// recipients do the equivalent from their reconstructed state.
    pub fn rotate_from_snapshot(&mut self, snap: &Snapshot) -> usize {
        let mut staged: Vec<u16> = Vec::new();
        for &idx in snap.valid_entities() {
            let Some(rec) = snap.record(idx) else { continue };
            if staged.contains(&rec.class_id) {
                continue;
            }
            let Some(layout) = self.classes.layout(rec.class_id) else {
                continue;
            };
            let Ok(bytes) = rec.blob.bytes() else { continue };
            let mut reader = BitReader::new(&bytes, rec.blob.bit_len());
            if let Ok(values) = layout.unpack(&mut reader) {
                self.stage(rec.class_id, values);
                staged.push(rec.class_id);
            }
        }
        self.swap();
        staged.len()
    }

    /// Clears both instance tables back to static defaults, e.g. at a level
    /// change.
    pub fn reset(&mut self) {
        self.active = 0;
        self.instance = [HashMap::new(), HashMap::new()];
    }

    /// Snapshot of both tables for a signon sync to a late joiner.
    pub fn export(&self) -> BaselineSyncMsg {
        let mut class_ids: Vec<u16> = self
            .instance
            .iter()
            .flat_map(|t| t.keys().copied())
            .collect();
        class_ids.sort_unstable();
        class_ids.dedup();
        BaselineSyncMsg {
            active: self.active as u8,
            entries: class_ids
                .into_iter()
                .map(|class_id| BaselineEntry {
                    class_id,
                    slots: [
                        self.instance[0].get(&class_id).cloned().unwrap_or_default(),
                        self.instance[1].get(&class_id).cloned().unwrap_or_default(),
                    ],
                })
                .collect(),
        }
    }

    /// Adopts a sender's tables wholesale. Empty slots stay unset so the
    /// static baseline keeps applying for them.
    pub fn import(&mut self, msg: &BaselineSyncMsg) {
        self.active = (msg.active as usize) & 1;
        self.instance = [HashMap::new(), HashMap::new()];
        for entry in &msg.entries {
            for (slot, values) in entry.slots.iter().enumerate() {
                if !values.is_empty() {
                    self.instance[slot].insert(entry.class_id, values.clone());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::props::{ClassLayout, PropField};

    fn tables() -> BaselineTables {
        let mut layout = ClassLayout::new("c", vec![PropField::new("a", 8), PropField::new("b", 8)]);
        layout.defaults = vec![7, 9];
        BaselineTables::new(Arc::new(ClassTable::new(vec![layout])))
    }

    #[test]
    fn static_baseline_until_instance_is_active() {
        let mut t = tables();
        assert_eq!(t.values(0), vec![7, 9]);

        t.stage(0, vec![1, 2]);
        // Staged but not swapped: still the static baseline.
        assert_eq!(t.values(0), vec![7, 9]);

        t.swap();
        assert_eq!(t.active_index(), 1);
        assert_eq!(t.values(0), vec![1, 2]);
        // The old index still resolves for in-flight messages.
        assert_eq!(t.values_at(0, 0), vec![7, 9]);
    }

    #[test]
    fn export_import_preserves_both_slots_and_active() {
        let mut a = tables();
        a.stage(0, vec![3, 4]);
        a.swap();
        a.stage(0, vec![5, 6]);

        let mut b = tables();
        b.import(&a.export());
        assert_eq!(b.active_index(), a.active_index());
        assert_eq!(b.values(0), vec![3, 4]);
        // The staged-but-unswapped slot travels too.
        b.swap();
        assert_eq!(b.values(0), vec![5, 6]);
    }
}
