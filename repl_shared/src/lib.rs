//! `repl_shared`
//!
//! Shared replication core used by both the game server and the relay proxy.
//!
//! Design goals:
//! - Deterministic and modular where practical.
//! - Clear separation of concerns (bit coding, packing, snapshots, frames,
//!   the update writer, net transport).
//! - Snapshots and packed entities are immutable once built; only shared
//!   ownership (`Arc`) mutates after creation.
//! - No `unsafe`.

pub mod baseline;
pub mod bitbuf;
pub mod client_frame;
pub mod config;
pub mod ents_read;
pub mod ents_write;
pub mod error;
pub mod net;
pub mod packed_entity;
pub mod props;
pub mod snapshot;
pub mod world;

/// Number of bits used to encode an absolute entity index on the wire.
pub const MAX_EDICT_BITS: u32 = 11;

/// Maximum entity slots addressable with [`MAX_EDICT_BITS`].
pub const MAX_EDICTS: usize = 1 << MAX_EDICT_BITS;

/// Fixed width of a serial number field in an EnterPvs body.
pub const SERIAL_NUM_BITS: u32 = 10;

/// End-of-stream marker for the paired entity-index cursors in the update
/// writer. Larger than any valid entity index.
pub const ENTITY_SENTINEL: u32 = 9999;

pub mod prelude {
    //! Commonly used exports.

    pub use crate::bitbuf::{BitReader, BitWriter};
    pub use crate::client_frame::{ClientFrame, ClientFrameHistory, EntitySet, FrameData};
    pub use crate::config::ReplConfig;
    pub use crate::error::ReplError;
    pub use crate::net::*;
    pub use crate::packed_entity::PackedEntity;
    pub use crate::props::{ClassLayout, ClassTable, PropField};
    pub use crate::snapshot::{Snapshot, SnapshotManager};
    pub use crate::world::{WorldTable, WorldView};
    pub use crate::{ENTITY_SENTINEL, MAX_EDICTS, MAX_EDICT_BITS, SERIAL_NUM_BITS};
}
