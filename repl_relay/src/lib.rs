//! `repl_relay`
//!
//! A relay is simultaneously a replication client of the primary server and
//! a replication server to its own audience: it rebuilds snapshot state
//! from received entity updates and replays the same client-frame /
//! update-writer machinery downward, with a shared delta-bit cache so many
//! viewers at the same basis tick don't pay for the same encoding twice.

pub mod delta_cache;
pub mod demo;
pub mod relay;
pub mod upstream;

pub use delta_cache::DeltaEntityCache;
pub use relay::RelayServer;
pub use upstream::UpstreamClient;
