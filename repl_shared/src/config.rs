//! Configuration system.
//!
//! Loads replication configuration from JSON strings/files (file IO left to
//! the app). All tunables of the replication core live here so that servers
//! and relays are constructed from explicit values rather than globals.

use serde::{Deserialize, Serialize};

/// Root configuration shared by server and relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplConfig {
    /// Listen address, e.g. `127.0.0.1:40000`.
    pub listen_addr: String,
    /// Fixed simulation tick rate.
    pub tick_hz: u32,
    /// Entity slot capacity of a snapshot.
    #[serde(default = "default_max_entities")]
    pub max_entities: usize,
    /// How many client frames are retained per recipient before the oldest
    /// is trimmed.
    #[serde(default = "default_frame_window")]
    pub frame_window: usize,
    /// Capacity of the packed entity pool. Exceeding it is fatal.
    #[serde(default = "default_pool_capacity")]
    pub pool_capacity: usize,
    /// Store packed entity payloads compressed instead of raw. Trades CPU
    /// for memory; both paths are wire-identical.
    #[serde(default)]
    pub store_compressed: bool,
    /// Width of the encoding-base window for tick-relative properties. A
    /// cached blob is force-repacked when reuse would cross a window
    /// boundary.
    #[serde(default = "default_tick_base_interval")]
    pub tick_base_interval: u32,
    /// Relay delta-bit cache size in KiB. Zero disables the cache.
    #[serde(default = "default_delta_cache_kib")]
    pub delta_cache_kib: usize,
    /// Relay: automatically record received frames as a demo.
    #[serde(default)]
    pub autorecord: bool,
}

fn default_max_entities() -> usize {
    256
}

fn default_frame_window() -> usize {
    128
}

fn default_pool_capacity() -> usize {
    4096
}

fn default_tick_base_interval() -> u32 {
    100
}

fn default_delta_cache_kib() -> usize {
    64
}

impl Default for ReplConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:40000".to_string(),
            tick_hz: 64,
            max_entities: default_max_entities(),
            frame_window: default_frame_window(),
            pool_capacity: default_pool_capacity(),
            store_compressed: false,
            tick_base_interval: default_tick_base_interval(),
            delta_cache_kib: default_delta_cache_kib(),
            autorecord: false,
        }
    }
}

impl ReplConfig {
    /// Parses config from JSON.
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }
}
