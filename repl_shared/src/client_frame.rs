//! Client frames and per-recipient frame history.
//!
//! A client frame records, for one recipient and one tick, which snapshot
//! was the basis and which entity indices were actually transmitted. The
//! history is an ordered, bounded list per recipient: O(1) tail append,
//! oldest-first trim, and a forward scan for lookup-by-tick that stays cheap
//! because the retention window is small.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::snapshot::Snapshot;

/// Fixed-capacity bit set over entity indices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntitySet {
    words: Vec<u64>,
    capacity: usize,
}

impl EntitySet {
    pub fn new(capacity: usize) -> Self {
        Self {
            words: vec![0; capacity.div_ceil(64)],
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn set(&mut self, index: u32) {
        debug_assert!((index as usize) < self.capacity);
        self.words[index as usize / 64] |= 1 << (index % 64);
    }

    pub fn clear(&mut self, index: u32) {
        self.words[index as usize / 64] &= !(1 << (index % 64));
    }

    pub fn contains(&self, index: u32) -> bool {
        (index as usize) < self.capacity
            && self.words[index as usize / 64] & (1 << (index % 64)) != 0
    }

    pub fn len(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|&w| w == 0)
    }

    /// Ascending set indices.
    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.capacity as u32).filter(move |&i| self.contains(i))
    }
}

/// Extra payload carried by a frame, chosen once at construction. Relay
/// frames buffer the per-channel messages that arrived during their tick so
/// they can be replayed to late viewers and demos.
#[derive(Debug, Clone, Default)]
pub enum FrameData {
    #[default]
    Standard,
    RelayBuffered {
        reliable: Vec<Vec<u8>>,
        unreliable: Vec<Vec<u8>>,
    },
}

/// Which snapshot and which entities were sent to one recipient at one tick.
#[derive(Debug, Clone)]
pub struct ClientFrame {
    pub tick: u32,
    pub snapshot: Arc<Snapshot>,
    /// Entity indices actually transmitted to this recipient.
    pub transmit: EntitySet,
    /// Entities that were sent as a full update from baseline this tick.
    pub from_baseline: Option<EntitySet>,
    pub data: FrameData,
}

impl ClientFrame {
    pub fn new(snapshot: Arc<Snapshot>, transmit: EntitySet) -> Self {
        Self {
            tick: snapshot.tick,
            snapshot,
            transmit,
            from_baseline: None,
            data: FrameData::Standard,
        }
    }

    pub fn relay_buffered(snapshot: Arc<Snapshot>, transmit: EntitySet) -> Self {
        Self {
            tick: snapshot.tick,
            snapshot,
            transmit,
            from_baseline: None,
            data: FrameData::RelayBuffered {
                reliable: Vec::new(),
                unreliable: Vec::new(),
            },
        }
    }
}

/// Bounded, tick-ordered frame list for one recipient.
#[derive(Debug, Default)]
pub struct ClientFrameHistory {
    frames: VecDeque<ClientFrame>,
    max_frames: usize,
}

impl ClientFrameHistory {
    pub fn new(max_frames: usize) -> Self {
        Self {
            frames: VecDeque::new(),
            max_frames,
        }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Appends a frame (ticks must be monotonically increasing) and trims
    /// the oldest frames beyond the retention window. Returns the count
    /// after the append.
    pub fn add_frame(&mut self, frame: ClientFrame) -> usize {
        debug_assert!(self
            .frames
            .back()
            .map(|f| f.tick < frame.tick)
            .unwrap_or(true));
        self.frames.push_back(frame);
        while self.max_frames > 0 && self.frames.len() > self.max_frames {
            self.frames.pop_front();
        }
        self.frames.len()
    }

    /// Exact lookup, or with `exact == false` the latest frame not newer
    /// than `tick` — the degradation path when an acknowledgement references
    /// a tick between retained frames.
    pub fn get_frame(&self, tick: u32, exact: bool) -> Option<&ClientFrame> {
        if exact {
            return self.frames.iter().find(|f| f.tick == tick);
        }
        self.frames.iter().rev().find(|f| f.tick <= tick)
    }

    pub fn latest(&self) -> Option<&ClientFrame> {
        self.frames.back()
    }

    /// Trims all frames older than `tick` from the head; a negative tick
    /// deletes everything (disconnect path). Each trimmed frame releases
    /// its snapshot reference.
    pub fn delete_frames(&mut self, tick: i64) {
        if tick < 0 {
            self.frames.clear();
            return;
        }
        while self
            .frames
            .front()
            .map(|f| (f.tick as i64) < tick)
            .unwrap_or(false)
        {
            self.frames.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReplConfig;
    use crate::props::{ClassLayout, ClassTable, PropField};
    use crate::snapshot::SnapshotManager;

    fn empty_snapshot(tick: u32) -> (SnapshotManager, Arc<Snapshot>) {
        let classes = Arc::new(ClassTable::new(vec![ClassLayout::new(
            "c",
            vec![PropField::new("a", 8)],
        )]));
        let mgr = SnapshotManager::new(classes, &ReplConfig::default());
        let snap = mgr.create_empty_snapshot(tick, 16);
        (mgr, snap)
    }

    #[test]
    fn entity_set_iterates_ascending() {
        let mut set = EntitySet::new(100);
        set.set(70);
        set.set(3);
        set.set(64);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![3, 64, 70]);
        set.clear(64);
        assert_eq!(set.len(), 2);
        assert!(!set.contains(64));
    }

    #[test]
    fn inexact_lookup_returns_latest_not_newer() {
        let (mgr, _snap) = empty_snapshot(0);
        let mut hist = ClientFrameHistory::new(16);
        for tick in [10, 12, 14] {
            let snap = mgr.create_empty_snapshot(tick, 16);
            hist.add_frame(ClientFrame::new(snap, EntitySet::new(16)));
        }
        assert_eq!(hist.get_frame(12, true).unwrap().tick, 12);
        assert!(hist.get_frame(13, true).is_none());
        assert_eq!(hist.get_frame(13, false).unwrap().tick, 12);
        assert!(hist.get_frame(9, false).is_none());
    }

    #[test]
    fn trim_and_delete_release_snapshots() {
        let (mgr, _snap) = empty_snapshot(0);
        let mut hist = ClientFrameHistory::new(2);
        for tick in 1..=3 {
            let snap = mgr.create_empty_snapshot(tick, 16);
            hist.add_frame(ClientFrame::new(snap, EntitySet::new(16)));
        }
        // Window of 2: tick 1 was trimmed on the third append.
        assert_eq!(hist.len(), 2);
        assert!(hist.get_frame(1, true).is_none());

        hist.delete_frames(3);
        assert_eq!(hist.len(), 1);
        assert_eq!(hist.latest().unwrap().tick, 3);

        hist.delete_frames(-1);
        assert!(hist.is_empty());
    }

    #[test]
    fn shared_snapshot_freed_exactly_when_last_frame_drops() {
        let (mgr, snap) = empty_snapshot(5);
        // N frames share one snapshot.
        let mut frames = Vec::new();
        for _ in 0..4 {
            frames.push(ClientFrame::new(snap.clone(), EntitySet::new(16)));
        }
        drop(snap);
        assert_eq!(mgr.live_snapshots(), 1);
        while let Some(f) = frames.pop() {
            drop(f);
        }
        assert_eq!(mgr.live_snapshots(), 0);
    }
}
