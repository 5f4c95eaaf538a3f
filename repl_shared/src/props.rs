//! Property layouts and the property codec.
//!
//! A class layout flattens an entity class into an ordered list of fixed
//! width fields. The codec packs a full value set into bits, diffs two
//! packed sets down to a changed-property index list, applies per-recipient
//! culling, and reads/writes the changed-property list wire form (ascending
//! indices, delta coded, each followed by its value bits, list terminated by
//! a 0 flag bit).

use serde::{Deserialize, Serialize};

use crate::bitbuf::{BitReader, BitWriter};
use crate::error::ReplError;

/// One flattened property of a class.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PropField {
    pub name: String,
    /// Encoded width, 1..=32 bits.
    pub bits: u32,
    /// Only sent to the recipient that owns the entity.
    #[serde(default)]
    pub owner_only: bool,
    /// Encoded relative to the tick count; stale across encoding-base
    /// windows, forcing a repack instead of blob reuse.
    #[serde(default)]
    pub tick_relative: bool,
}

impl PropField {
    pub fn new(name: &str, bits: u32) -> Self {
        Self {
            name: name.to_string(),
            bits,
            owner_only: false,
            tick_relative: false,
        }
    }

    pub fn owner_only(mut self) -> Self {
        self.owner_only = true;
        self
    }

    pub fn tick_relative(mut self) -> Self {
        self.tick_relative = true;
        self
    }
}

/// Flattened send layout of one entity class.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClassLayout {
    pub name: String,
    pub fields: Vec<PropField>,
    /// Static baseline: the compiled-in default value per field.
    pub defaults: Vec<u32>,
}

impl ClassLayout {
    pub fn new(name: &str, fields: Vec<PropField>) -> Self {
        let defaults = vec![0; fields.len()];
        Self {
            name: name.to_string(),
            fields,
            defaults,
        }
    }

    pub fn num_props(&self) -> usize {
        self.fields.len()
    }

    pub fn has_tick_relative_props(&self) -> bool {
        self.fields.iter().any(|f| f.tick_relative)
    }

    /// Packs a full value set in field order.
    pub fn pack(&self, values: &[u32], out: &mut BitWriter) {
        debug_assert_eq!(values.len(), self.fields.len());
        for (field, &val) in self.fields.iter().zip(values) {
            out.write_ubits(mask(val, field.bits), field.bits);
        }
    }

    /// Unpacks a full value set in field order.
    pub fn unpack(&self, reader: &mut BitReader) -> Result<Vec<u32>, ReplError> {
        let mut values = Vec::with_capacity(self.fields.len());
        for field in &self.fields {
            values.push(reader.read_ubits(field.bits)?);
        }
        Ok(values)
    }

    /// Compares two packed value sets field by field and returns the indices
    /// of properties whose encoded value differs. `candidates` narrows the
    /// comparison (from a change frame list); `None` scans every field.
    pub fn compute_changed_props(
        &self,
        basis: &mut BitReader,
        target: &mut BitReader,
        candidates: Option<&[u32]>,
    ) -> Result<Vec<u32>, ReplError> {
        let basis_values = self.unpack(basis)?;
        let target_values = self.unpack(target)?;
        let mut changed = Vec::new();
        match candidates {
            Some(idx) => {
                for &i in idx {
                    let i = i as usize;
                    if basis_values[i] != target_values[i] {
                        changed.push(i as u32);
                    }
                }
            }
            None => {
                for i in 0..self.fields.len() {
                    if basis_values[i] != target_values[i] {
                        changed.push(i as u32);
                    }
                }
            }
        }
        Ok(changed)
    }

    /// Removes properties the recipient is not allowed to see. Owner-only
    /// fields are dropped unless the recipient owns the entity.
    pub fn cull_props(&self, indices: &[u32], recipient_owns_entity: bool) -> Vec<u32> {
        indices
            .iter()
            .copied()
            .filter(|&i| recipient_owns_entity || !self.fields[i as usize].owner_only)
            .collect()
    }

    /// Writes the changed-property list: per entry a 1 flag bit, the index
    /// delta from the previous entry (UBitVar), and the value bits; a final
    /// 0 bit terminates the list. `indices` must be ascending.
    pub fn write_prop_list(&self, values: &[u32], indices: &[u32], out: &mut BitWriter) {
        debug_assert!(indices.windows(2).all(|w| w[0] < w[1]));
        let mut last = -1i64;
        for &i in indices {
            let field = &self.fields[i as usize];
            out.write_bit(true);
            out.write_ubitvar((i as i64 - last - 1) as u32);
            out.write_ubits(mask(values[i as usize], field.bits), field.bits);
            last = i as i64;
        }
        out.write_bit(false);
    }

    /// Reads a changed-property list and applies it over `values` in place.
    /// Returns the indices that were present.
    pub fn read_prop_list(
        &self,
        reader: &mut BitReader,
        values: &mut [u32],
    ) -> Result<Vec<u32>, ReplError> {
        let mut indices = Vec::new();
        let mut last = -1i64;
        while reader.read_bit()? {
            let idx = (last + 1 + reader.read_ubitvar()? as i64) as usize;
            if idx >= self.fields.len() {
                return Err(ReplError::ProtocolInvariant(format!(
                    "prop index {idx} out of range for class {}",
                    self.name
                )));
            }
            values[idx] = reader.read_ubits(self.fields[idx].bits)?;
            indices.push(idx as u32);
            last = idx as i64;
        }
        Ok(indices)
    }
}

/// All classes in use, indexed by class id. The wire width of a class id
/// follows the table size.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClassTable {
    pub classes: Vec<ClassLayout>,
}

impl ClassTable {
    pub fn new(classes: Vec<ClassLayout>) -> Self {
        Self { classes }
    }

    pub fn layout(&self, class_id: u16) -> Option<&ClassLayout> {
        self.classes.get(class_id as usize)
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// Bits needed for a class id field, sized to the number of classes.
    pub fn class_bits(&self) -> u32 {
        let n = self.classes.len().max(2) as u32;
        32 - (n - 1).leading_zeros()
    }
}

fn mask(val: u32, bits: u32) -> u32 {
    if bits >= 32 {
        val
    } else {
        val & ((1 << bits) - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> ClassLayout {
        ClassLayout::new(
            "player",
            vec![
                PropField::new("health", 8),
                PropField::new("origin_x", 16),
                PropField::new("ammo", 8).owner_only(),
                PropField::new("sim_time", 12).tick_relative(),
            ],
        )
    }

    #[test]
    fn pack_unpack_roundtrip() {
        let l = layout();
        let values = vec![100, 4242, 30, 900];
        let mut w = BitWriter::new();
        l.pack(&values, &mut w);
        let (bytes, bits) = w.into_bytes();
        let got = l.unpack(&mut BitReader::new(&bytes, bits)).unwrap();
        assert_eq!(got, values);
    }

    #[test]
    fn changed_props_narrowed_by_candidates() {
        let l = layout();
        let a = vec![100, 4242, 30, 900];
        let b = vec![90, 4242, 31, 900];
        let (mut wa, mut wb) = (BitWriter::new(), BitWriter::new());
        l.pack(&a, &mut wa);
        l.pack(&b, &mut wb);
        let (ba, na) = (wa.as_bytes().to_vec(), wa.bit_len());
        let (bb, nb) = (wb.as_bytes().to_vec(), wb.bit_len());

        let full = l
            .compute_changed_props(
                &mut BitReader::new(&ba, na),
                &mut BitReader::new(&bb, nb),
                None,
            )
            .unwrap();
        assert_eq!(full, vec![0, 2]);

        // Candidate narrowing drops false positives but never invents one.
        let narrowed = l
            .compute_changed_props(
                &mut BitReader::new(&ba, na),
                &mut BitReader::new(&bb, nb),
                Some(&[0, 1]),
            )
            .unwrap();
        assert_eq!(narrowed, vec![0]);
    }

    #[test]
    fn culling_strips_owner_only_for_strangers() {
        let l = layout();
        assert_eq!(l.cull_props(&[0, 2, 3], false), vec![0, 3]);
        assert_eq!(l.cull_props(&[0, 2, 3], true), vec![0, 2, 3]);
    }

    #[test]
    fn prop_list_roundtrip() {
        let l = layout();
        let target = vec![90, 4242, 31, 901];
        let mut w = BitWriter::new();
        l.write_prop_list(&target, &[0, 2, 3], &mut w);
        let (bytes, bits) = w.into_bytes();

        let mut values = vec![100, 4242, 30, 900];
        let mut r = BitReader::new(&bytes, bits);
        let got = l.read_prop_list(&mut r, &mut values).unwrap();
        assert_eq!(got, vec![0, 2, 3]);
        assert_eq!(values, target);
        assert_eq!(r.remaining_bits(), 0);
    }

    #[test]
    fn class_bits_follow_table_size() {
        let one = ClassTable::new(vec![layout()]);
        assert_eq!(one.class_bits(), 1);
        let five = ClassTable::new(vec![layout(); 5]);
        assert_eq!(five.class_bits(), 3);
    }
}
