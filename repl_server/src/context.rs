//! Replication context.
//!
//! An explicit value owning everything the replication core needs for one
//! loaded level: the class table, the snapshot manager, and the baseline
//! tables. Constructed at level load, torn down at level unload; the server
//! and every relay receive one at construction instead of reaching for a
//! process-wide singleton.

use std::sync::Arc;

use tracing::{info, warn};

use repl_shared::baseline::BaselineTables;
use repl_shared::config::ReplConfig;
use repl_shared::props::ClassTable;
use repl_shared::snapshot::SnapshotManager;

pub struct ReplicationContext {
    pub classes: Arc<ClassTable>,
    pub manager: SnapshotManager,
    pub baselines: BaselineTables,
    /// Increments on every level load; acknowledgements from a previous
    /// level are rejected by comparing this.
    pub spawn_count: u32,
}

impl ReplicationContext {
    pub fn new(cfg: &ReplConfig, classes: Arc<ClassTable>) -> Self {
        info!(
            classes = classes.classes.len(),
            max_entities = cfg.max_entities,
            "replication context created"
        );
        Self {
            manager: SnapshotManager::new(classes.clone(), cfg),
            baselines: BaselineTables::new(classes.clone()),
            classes,
            spawn_count: 1,
        }
    }

    /// Level unload: drops the most-recently-sent cache, resets the instance
    /// baselines, and verifies the counting allocator. A nonzero live count
    /// after callers have dropped their frames means a leaked handle.
    pub fn level_shutdown(&mut self) {
        self.manager.clear_cache();
        self.baselines.reset();
        let blobs = self.manager.live_blobs();
        let snapshots = self.manager.live_snapshots();
        if blobs != 0 || snapshots != 0 {
            warn!(blobs, snapshots, "live replication objects at level shutdown");
        }
        self.spawn_count += 1;
    }
}
