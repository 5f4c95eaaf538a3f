//! Packed entity blobs.
//!
//! A packed entity is one entity's encoded property set for one snapshot,
//! immutable once built and shared (`Arc`) by every snapshot record and
//! recipient that needs that exact encoding. Each blob owns its change
//! frame list: the last-changed tick per flattened property, which lets the
//! delta step skip full comparisons when the basis tick is known.
//!
//! Storage is raw or zstd-compressed, selected by configuration; the wire
//! output is identical either way.

use std::borrow::Cow;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Context;

const ZSTD_LEVEL: i32 = 3;

/// Per flattened property, the tick it last changed. Owned one-to-one by a
/// blob; cloned (never shared) when a later snapshot adopts an unchanged
/// blob's history as its own starting point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeFrameList {
    ticks: Vec<u32>,
}

impl ChangeFrameList {
    /// A fresh list: every property counts as changed at `tick`.
    pub fn new(num_props: usize, tick: u32) -> Self {
        Self {
            ticks: vec![tick; num_props],
        }
    }

    pub fn num_props(&self) -> usize {
        self.ticks.len()
    }

    pub fn set_changed(&mut self, indices: &[u32], tick: u32) {
        for &i in indices {
            self.ticks[i as usize] = tick;
        }
    }

    /// Indices of properties whose last change is at or after `basis_tick`.
    /// A superset of the truly-changed set; callers still compare values.
    pub fn changed_since(&self, basis_tick: u32) -> Vec<u32> {
        self.ticks
            .iter()
            .enumerate()
            .filter(|(_, &t)| t >= basis_tick)
            .map(|(i, _)| i as u32)
            .collect()
    }
}

/// Decrements the manager's live-blob count when the blob is freed. This is
/// the counting allocator the leak checks observe.
#[derive(Debug)]
pub struct PoolSlot(Arc<AtomicUsize>);

impl PoolSlot {
    pub fn new(live: Arc<AtomicUsize>) -> Self {
        live.fetch_add(1, Ordering::Relaxed);
        Self(live)
    }
}

impl Drop for PoolSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone)]
enum BlobStorage {
    Raw(Vec<u8>),
    Compressed { data: Vec<u8>, raw_len: usize },
}

/// One entity's serialized property set for one snapshot.
#[derive(Debug)]
pub struct PackedEntity {
    /// Tick of the snapshot this blob was built for.
    pub tick: u32,
    pub entity_index: u32,
    pub class_id: u16,
    storage: BlobStorage,
    bit_len: usize,
    pub change_frames: ChangeFrameList,
    _pool: Option<PoolSlot>,
}

impl PackedEntity {
    pub fn new(
        tick: u32,
        entity_index: u32,
        class_id: u16,
        bytes: Vec<u8>,
        bit_len: usize,
        change_frames: ChangeFrameList,
        compress: bool,
        pool: Option<PoolSlot>,
    ) -> anyhow::Result<Self> {
        let storage = if compress {
            let raw_len = bytes.len();
            let data = zstd::bulk::compress(&bytes, ZSTD_LEVEL).context("compress blob")?;
            BlobStorage::Compressed { data, raw_len }
        } else {
            BlobStorage::Raw(bytes)
        };
        Ok(Self {
            tick,
            entity_index,
            class_id,
            storage,
            bit_len,
            change_frames,
            _pool: pool,
        })
    }

    pub fn is_compressed(&self) -> bool {
        matches!(self.storage, BlobStorage::Compressed { .. })
    }

    pub fn bit_len(&self) -> usize {
        self.bit_len
    }

    /// The packed property bits, decompressing on demand.
    pub fn bytes(&self) -> anyhow::Result<Cow<'_, [u8]>> {
        match &self.storage {
            BlobStorage::Raw(b) => Ok(Cow::Borrowed(b)),
            BlobStorage::Compressed { data, raw_len } => {
                let raw = zstd::bulk::decompress(data, *raw_len).context("decompress blob")?;
                Ok(Cow::Owned(raw))
            }
        }
    }

    /// Whether this blob encodes exactly the given bits.
    pub fn same_bits(&self, bytes: &[u8], bit_len: usize) -> anyhow::Result<bool> {
        if self.bit_len != bit_len {
            return Ok(false);
        }
        Ok(self.bytes()?.as_ref() == bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob(compress: bool) -> PackedEntity {
        PackedEntity::new(
            10,
            3,
            0,
            vec![0xAB, 0xCD, 0x0E],
            20,
            ChangeFrameList::new(4, 10),
            compress,
            None,
        )
        .unwrap()
    }

    #[test]
    fn raw_and_compressed_expose_identical_bits() {
        let raw = blob(false);
        let comp = blob(true);
        assert!(!raw.is_compressed());
        assert!(comp.is_compressed());
        assert_eq!(raw.bytes().unwrap(), comp.bytes().unwrap());
        assert!(comp.same_bits(&[0xAB, 0xCD, 0x0E], 20).unwrap());
        assert!(!comp.same_bits(&[0xAB, 0xCD, 0x0E], 19).unwrap());
    }

    #[test]
    fn change_frames_track_last_changed_tick() {
        let mut cfl = ChangeFrameList::new(4, 100);
        cfl.set_changed(&[1, 3], 105);
        assert_eq!(cfl.changed_since(101), vec![1, 3]);
        assert_eq!(cfl.changed_since(100), vec![0, 1, 2, 3]);
        assert_eq!(cfl.changed_since(106), Vec::<u32>::new());
    }

    #[test]
    fn pool_slot_counts_lives() {
        let live = Arc::new(AtomicUsize::new(0));
        let a = PoolSlot::new(live.clone());
        let b = PoolSlot::new(live.clone());
        assert_eq!(live.load(Ordering::Relaxed), 2);
        drop(a);
        assert_eq!(live.load(Ordering::Relaxed), 1);
        drop(b);
        assert_eq!(live.load(Ordering::Relaxed), 0);
    }
}
