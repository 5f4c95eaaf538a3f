//! `repl_server`
//!
//! The authoritative game server: owns the world table, drives the
//! replication context once per tick, and fans snapshot deltas out to
//! connected recipients.

pub mod context;
pub mod server;

pub use context::ReplicationContext;
pub use server::GameServer;
