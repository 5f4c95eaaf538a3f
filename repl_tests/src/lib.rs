//! Shared harness for the integration tests and the chain runner: a thin
//! receiving client built from the same pieces a relay uses upstream.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use repl_relay::UpstreamClient;
use repl_shared::{
    baseline::BaselineTables,
    ents_read::{read_packet_entities, EntityStateTable},
    props::{ClassLayout, ClassTable, PropField},
};

/// A minimal entity-update consumer: connects, signs on, applies updates,
/// acknowledges ticks.
pub struct TestClient {
    pub conn: UpstreamClient,
    pub classes: Arc<ClassTable>,
    pub baselines: BaselineTables,
    pub table: EntityStateTable,
    /// Updates applied with a usable delta basis (as opposed to full).
    pub deltas_applied: u32,
    pub updates_applied: u32,
}

impl TestClient {
    pub async fn connect(addr: SocketAddr) -> anyhow::Result<Self> {
        let conn = UpstreamClient::connect(addr).await?;
        let classes = Arc::new(conn.server_info.classes.clone());
        let table = EntityStateTable::new(conn.server_info.max_entities);
        let baselines = BaselineTables::new(classes.clone());
        Ok(Self {
            conn,
            classes,
            baselines,
            table,
            deltas_applied: 0,
            updates_applied: 0,
        })
    }

    /// Drives signon to completion and announces readiness.
    pub async fn complete_signon(&mut self, deadline: Duration) -> anyhow::Result<()> {
        let start = tokio::time::Instant::now();
        while self.conn.signon() < repl_shared::net::SignonState::New {
            if start.elapsed() > deadline {
                anyhow::bail!("signon timed out at {:?}", self.conn.signon());
            }
            self.conn.poll_reliable(Duration::from_millis(20)).await?;
        }
        if let Some(sync) = self.conn.take_baselines() {
            self.baselines.import(&sync);
        }
        self.conn.send_ready().await?;
        Ok(())
    }

    /// Applies at most one pending update, acknowledging it. Returns the
    /// applied tick.
    pub async fn pump(&mut self, timeout: Duration) -> anyhow::Result<Option<u32>> {
        self.conn.poll_reliable(Duration::from_millis(1)).await?;
        if let Some(sync) = self.conn.take_baselines() {
            self.baselines.import(&sync);
        }
        let Some(msg) = self.conn.recv_update(timeout).await? else {
            return Ok(None);
        };
        if msg.delta_tick >= 0 {
            self.deltas_applied += 1;
        }
        read_packet_entities(&msg, &self.classes, &mut self.baselines, &mut self.table)?;
        self.updates_applied += 1;
        self.conn.ack(msg.tick).await?;
        Ok(Some(msg.tick))
    }

    /// Pumps until a tick at or past `tick` has been applied.
    pub async fn pump_until_tick(&mut self, tick: u32, deadline: Duration) -> anyhow::Result<u32> {
        let start = tokio::time::Instant::now();
        loop {
            if let Some(applied) = self.pump(Duration::from_millis(20)).await? {
                if applied >= tick {
                    return Ok(applied);
                }
            }
            if start.elapsed() > deadline {
                anyhow::bail!("no update reached tick {tick} in time");
            }
        }
    }
}

/// The class set used by the integration tests: one two-prop class and one
/// single-prop class, enough to exercise distinct layouts and class-id
/// encoding.
pub fn test_classes() -> Arc<ClassTable> {
    Arc::new(ClassTable::new(vec![
        ClassLayout::new(
            "avatar",
            vec![
                PropField::new("pos", 16),
                PropField::new("health", 8),
            ],
        ),
        ClassLayout::new("barrel", vec![PropField::new("pos", 16)]),
    ]))
}
