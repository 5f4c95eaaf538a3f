//! Replication error taxonomy.
//!
//! Three classes of failure, checked explicitly at component boundaries:
//! - Protocol invariant violations are fatal for the connection that hit
//!   them; they indicate a bookkeeping bug upstream, not a network issue.
//! - A basis tick that has aged out of the frame history is recoverable;
//!   callers degrade to a full resync.
//! - Packed entity pool exhaustion is fatal; it signals a leaked handle.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReplError {
    /// A bookkeeping invariant was violated (e.g. delta against the frame's
    /// own tick, or a class change without a recreate). Aborts the
    /// connection.
    #[error("protocol invariant violated: {0}")]
    ProtocolInvariant(String),

    /// An acknowledgement referenced a tick no longer retained. Recoverable:
    /// the caller falls back to a full update from baseline.
    #[error("no client frame retained for tick {tick}")]
    FrameNotFound { tick: i32 },

    /// The packed entity pool is out of capacity. Fatal: live blobs are only
    /// pinned by snapshots and the most-recently-sent cache, so hitting the
    /// cap means a handle leaked.
    #[error("packed entity pool exhausted (capacity {capacity})")]
    PoolExhausted { capacity: usize },

    /// A bit buffer ran out of data mid-read. Treated like a protocol
    /// invariant violation by callers.
    #[error("bit buffer underflow reading {wanted} bit(s)")]
    Underflow { wanted: u32 },
}

impl ReplError {
    /// Whether the error permits the connection to continue (after a full
    /// resync) rather than aborting.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ReplError::FrameNotFound { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_missing_frames_are_recoverable() {
        assert!(ReplError::FrameNotFound { tick: 7 }.is_recoverable());
        assert!(!ReplError::ProtocolInvariant("x".into()).is_recoverable());
        assert!(!ReplError::PoolExhausted { capacity: 4 }.is_recoverable());
        assert!(!ReplError::Underflow { wanted: 3 }.is_recoverable());
    }
}
