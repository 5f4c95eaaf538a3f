//! Relay server.
//!
//! One upstream connection in, many viewers out. The relay rebuilds entity
//! state from received updates, snapshots that state with its own manager,
//! and serves viewers with the same frame/update-writer machinery the
//! primary server uses — with two differences:
//! - no per-viewer property culling, so every viewer at the same basis
//!   tick gets an identical body and the delta-bit cache can be shared;
//! - the frame history is global, not per viewer, because all viewers see
//!   the same transmit set.
//!
//! Two baseline pairings are kept apart: `up_baselines` stays in lockstep
//! with the upstream sender, `down_baselines` with our viewers. Rotation
//! requests from upstream are re-announced downstream on our own schedule.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use repl_shared::{
    baseline::BaselineTables,
    bitbuf::BitWriter,
    client_frame::{ClientFrame, ClientFrameHistory, EntitySet, FrameData},
    config::ReplConfig,
    ents_read::{read_packet_entities, EntityStateTable},
    ents_write::{write_delta_entities, WriteParams},
    net::{
        encode_to_bytes, ClientId, NetMsg, PacketEntitiesMsg, ReliableConn, ReliableListener,
        ServerInfo, SignonState, PROTOCOL_VERSION,
    },
    props::ClassTable,
    snapshot::SnapshotManager,
};
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use crate::delta_cache::DeltaEntityCache;
use crate::demo::DemoRecorder;
use crate::upstream::UpstreamClient;

/// A connected viewer.
struct ViewerState {
    id: ClientId,
    reliable: ReliableConn,
    udp_peer: SocketAddr,
    signon: SignonState,
    /// Newest relay tick this viewer acknowledged; -1 forces full updates.
    delta_tick: i32,
}

pub struct RelayServer {
    pub cfg: ReplConfig,
    pub upstream: UpstreamClient,

    classes: Arc<ClassTable>,
    manager: SnapshotManager,
    up_baselines: BaselineTables,
    down_baselines: BaselineTables,
    table: EntityStateTable,
    history: ClientFrameHistory,
    delta_cache: DeltaEntityCache,
    demo: Option<DemoRecorder>,

    viewers: HashMap<ClientId, ViewerState>,
    tcp: ReliableListener,
    udp: UdpSocket,

    /// Set once the first frame lands; viewers get updates only after.
    active: bool,
    /// Upstream connection failed; the relay keeps serving its last state.
    upstream_lost: bool,
    first_tick: Option<u32>,
    spawn_count_seen: u32,
    /// Re-announce a baseline rotation to viewers with the next update.
    update_baseline_next: bool,
}

impl RelayServer {
    /// Connects upstream and binds the viewer-facing sockets. The entity
    /// capacity and class table come from the upstream server info, not
    /// local configuration.
    pub async fn connect(mut cfg: ReplConfig, upstream_addr: SocketAddr) -> anyhow::Result<Self> {
        let addr: SocketAddr = cfg.listen_addr.parse().context("parse listen_addr")?;
        let tcp = ReliableListener::bind(addr).await?;
        let bound = tcp.local_addr()?;
        let udp = UdpSocket::bind(SocketAddr::new(bound.ip(), bound.port()))
            .await
            .context("udp bind")?;
        cfg.listen_addr = bound.to_string();

        let upstream = UpstreamClient::connect(upstream_addr).await?;
        cfg.max_entities = upstream.server_info.max_entities;
        let classes = Arc::new(upstream.server_info.classes.clone());
        let spawn_count_seen = upstream.spawn_count();

        info!(
            listen = %bound,
            upstream = %upstream_addr,
            classes = classes.len(),
            max_entities = cfg.max_entities,
            "relay up"
        );

        Ok(Self {
            manager: SnapshotManager::new(classes.clone(), &cfg),
            up_baselines: BaselineTables::new(classes.clone()),
            down_baselines: BaselineTables::new(classes.clone()),
            table: EntityStateTable::new(cfg.max_entities),
            history: ClientFrameHistory::new(cfg.frame_window),
            delta_cache: DeltaEntityCache::new(cfg.delta_cache_kib * 1024),
            demo: None,
            viewers: HashMap::new(),
            tcp,
            udp,
            active: false,
            upstream_lost: false,
            first_tick: None,
            spawn_count_seen,
            update_baseline_next: false,
            classes,
            upstream,
            cfg,
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        self.tcp.local_addr()
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn tick(&self) -> u32 {
        self.table.tick
    }

    pub fn viewer_count(&self) -> usize {
        self.viewers.len()
    }

    /// Drives the upstream signon to completion, with a deadline.
    pub async fn complete_signon(&mut self, deadline: Duration) -> anyhow::Result<()> {
        let start = tokio::time::Instant::now();
        while self.upstream.signon() < SignonState::New {
            if start.elapsed() > deadline {
                anyhow::bail!("upstream signon timed out at {:?}", self.upstream.signon());
            }
            self.upstream.poll_reliable(Duration::from_millis(50)).await?;
        }
        if let Some(sync) = self.upstream.take_baselines() {
            self.up_baselines.import(&sync);
        }
        self.upstream.send_ready().await?;
        info!("upstream signon complete");
        Ok(())
    }

    fn server_info(&self) -> ServerInfo {
        ServerInfo {
            tick_hz: self.upstream.server_info.tick_hz,
            max_entities: self.cfg.max_entities,
            classes: (*self.classes).clone(),
            spawn_count: self.upstream.spawn_count(),
            is_relay: true,
        }
    }

    /// Accepts exactly one viewer.
    pub async fn accept_one(&mut self) -> anyhow::Result<ClientId> {
        let (conn, peer) = self.tcp.accept().await?;
        self.handle_new_viewer(conn, peer).await
    }

    /// Accepts a viewer with a timeout.
    pub async fn try_accept(&mut self, timeout: Duration) -> anyhow::Result<Option<ClientId>> {
        match tokio::time::timeout(timeout, self.tcp.accept()).await {
            Ok(Ok((conn, peer))) => self.handle_new_viewer(conn, peer).await.map(Some),
            Ok(Err(e)) => Err(e),
            Err(_) => Ok(None),
        }
    }

    async fn handle_new_viewer(
        &mut self,
        mut conn: ReliableConn,
        peer: SocketAddr,
    ) -> anyhow::Result<ClientId> {
        let msg = conn.recv().await?;
        match msg {
            NetMsg::Hello { protocol } if protocol == PROTOCOL_VERSION => {
                let udp_hello = conn.recv().await?;
                let viewer_udp_port = match udp_hello {
                    NetMsg::UdpHello { client_udp_port } => client_udp_port,
                    other => anyhow::bail!("expected UdpHello, got {other:?}"),
                };

                let id = ClientId::new_unique();
                conn.send(&NetMsg::Welcome {
                    client_id: id,
                    server_info: self.server_info(),
                })
                .await?;
                conn.send(&NetMsg::BaselineSync(self.down_baselines.export()))
                    .await?;
                conn.send(&NetMsg::SignonState {
                    state: SignonState::New,
                    spawn_count: self.upstream.spawn_count(),
                })
                .await?;

                let udp_peer = SocketAddr::new(peer.ip(), viewer_udp_port);
                self.viewers.insert(
                    id,
                    ViewerState {
                        id,
                        reliable: conn,
                        udp_peer,
                        signon: SignonState::New,
                        delta_tick: -1,
                    },
                );
                info!(viewer_id = ?id, %udp_peer, "viewer connected");
                Ok(id)
            }
            other => anyhow::bail!("unexpected handshake msg: {other:?}"),
        }
    }

    /// One relay iteration: service the upstream connection, apply any
    /// arrived updates (fanning each out to viewers as it lands), and drain
    /// viewer datagrams. The relay has no simulation tick of its own; it
    /// moves at whatever cadence the upstream delivers. Losing the upstream
    /// is not fatal: the relay keeps its viewers and its last state.
    pub async fn step(&mut self) -> anyhow::Result<()> {
        if !self.upstream_lost {
            if let Err(e) = self.service_upstream().await {
                warn!(error = %e, "upstream connection lost");
                self.upstream_lost = true;
            }
        }
        self.recv_viewer_datagrams().await?;
        Ok(())
    }

    pub fn upstream_lost(&self) -> bool {
        self.upstream_lost
    }

    async fn service_upstream(&mut self) -> anyhow::Result<()> {
        self.upstream.poll_reliable(Duration::from_millis(1)).await?;
        // Handle a level change before adopting any baseline sync; a sync
        // sent for the new level must land in the reset tables.
        if self.upstream.spawn_count() != self.spawn_count_seen {
            self.on_changelevel().await?;
        }
        if let Some(sync) = self.upstream.take_baselines() {
            self.up_baselines.import(&sync);
        }
        if self.upstream.signon() == SignonState::New {
            self.upstream.send_ready().await?;
        }

        while let Some(msg) = self
            .upstream
            .recv_update(Duration::from_millis(2))
            .await?
        {
            self.apply_upstream_update(msg).await?;
        }
        Ok(())
    }

    /// Rebuilds state from one upstream update, snapshots it, appends the
    /// relay frame, and fans the tick out to viewers.
    pub async fn apply_upstream_update(&mut self, msg: PacketEntitiesMsg) -> anyhow::Result<()> {
        let summary =
            read_packet_entities(&msg, &self.classes, &mut self.up_baselines, &mut self.table)
                .context("apply upstream update")?;
        if msg.update_baseline {
            // Upstream rotated; schedule the same rotation downstream.
            self.update_baseline_next = true;
        }

        let snap = self
            .manager
            .take_tick_snapshot(msg.tick, &self.table)
            .context("snapshot rebuilt state")?;
        let mut transmit = EntitySet::new(snap.max_entities());
        for &i in snap.valid_entities() {
            transmit.set(i);
        }
        let mut frame = ClientFrame::relay_buffered(snap, transmit);

        // Buffer broadcasts into the frame and replay them to viewers.
        let broadcasts = self.upstream.take_broadcasts();
        if let FrameData::RelayBuffered { reliable, .. } = &mut frame.data {
            for b in &broadcasts {
                reliable.push(encode_to_bytes(b)?.to_vec());
            }
        }
        for b in &broadcasts {
            for viewer in self.viewers.values_mut() {
                let _ = viewer.reliable.send(b).await;
            }
        }

        self.history.add_frame(frame);

        if !self.active {
            self.active = true;
            self.first_tick = Some(msg.tick);
            info!(
                tick = msg.tick,
                entities = summary.entered.len(),
                "broadcast active"
            );
            if self.cfg.autorecord && self.demo.is_none() {
                let path = format!("relay_{}.dem", msg.tick);
                self.demo = Some(DemoRecorder::start(
                    path,
                    &self.upstream.server_info,
                    msg.tick,
                )?);
            }
        }
        if let Some(demo) = &mut self.demo {
            demo.record(&msg)?;
        }

        self.upstream.ack(msg.tick).await?;
        self.send_viewer_updates().await
    }

    async fn send_viewer_updates(&mut self) -> anyhow::Result<()> {
        let Some(base) = self.history.latest().cloned() else {
            return Ok(());
        };
        if !self.viewers.values().any(|v| v.signon == SignonState::Full) {
            return Ok(());
        }
        let update_baseline = std::mem::take(&mut self.update_baseline_next);
        self.delta_cache.set_tick(base.tick, self.cfg.max_entities);

        let mut to_drop = Vec::new();
        for viewer in self.viewers.values_mut() {
            if viewer.signon != SignonState::Full {
                continue;
            }
            let old_frame = if viewer.delta_tick >= 0 {
                let found = self.history.get_frame(viewer.delta_tick as u32, true);
                if found.is_none() {
                    warn!(
                        viewer_id = ?viewer.id,
                        tick = viewer.delta_tick,
                        "acknowledged frame no longer retained, full resync"
                    );
                }
                found
            } else {
                None
            };

            let params = WriteParams {
                classes: &self.classes,
                baselines: &self.down_baselines,
                owned_entity: None,
                // Shared output: culling would leak one viewer's tailored
                // bits to every other viewer at the same basis.
                cull: false,
            };
            let mut frame = base.clone();
            let mut out = BitWriter::new();
            let res = match write_delta_entities(
                &params,
                &mut frame,
                old_frame,
                Some(&mut self.delta_cache),
                &mut out,
            ) {
                Ok(res) => res,
                Err(e) => {
                    warn!(viewer_id = ?viewer.id, error = %e, "dropping viewer");
                    to_drop.push(viewer.id);
                    continue;
                }
            };
            let delta_tick = old_frame.map(|f| f.tick as i32).unwrap_or(-1);
            let (data, bits) = out.into_bytes();

            let msg = NetMsg::PacketEntities(PacketEntitiesMsg {
                tick: frame.tick,
                delta_tick,
                baseline_index: self.down_baselines.active_index(),
                update_baseline,
                max_entries: self.cfg.max_entities as u32,
                num_entries: res.num_entries,
                bits: bits as u32,
                data,
            });
            let payload = serde_json::to_vec(&msg).context("serialize viewer update")?;
            let _ = self.udp.send_to(&payload, viewer.udp_peer).await;
        }
        for id in to_drop {
            self.viewers.remove(&id);
        }

        if update_baseline {
            let staged = self.down_baselines.rotate_from_snapshot(&base.snapshot);
            debug!(classes = staged, "viewer baselines rotated");
        }
        Ok(())
    }

    async fn recv_viewer_datagrams(&mut self) -> anyhow::Result<()> {
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            match self.udp.try_recv_from(&mut buf) {
                Ok((n, from)) => {
                    if let Ok(msg) = serde_json::from_slice::<NetMsg>(&buf[..n]) {
                        self.handle_viewer_message(from, msg);
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e).context("viewer udp recv"),
            }
        }
        Ok(())
    }

    fn handle_viewer_message(&mut self, from: SocketAddr, msg: NetMsg) {
        match msg {
            NetMsg::ClientReady { client_id } => {
                if let Some(viewer) = self.viewers.get_mut(&client_id) {
                    viewer.udp_peer = from;
                    viewer.signon = SignonState::Full;
                    info!(viewer_id = ?client_id, "viewer signon complete");
                }
            }
            NetMsg::Tick {
                client_id,
                delta_tick,
            } => {
                if let Some(viewer) = self.viewers.get_mut(&client_id) {
                    // History is shared across viewers; an ack only moves
                    // this viewer's basis, it never trims frames.
                    viewer.delta_tick = delta_tick.max(-1);
                }
            }
            NetMsg::Disconnect { reason } => {
                let id = self
                    .viewers
                    .iter()
                    .find(|(_, v)| v.udp_peer == from)
                    .map(|(id, _)| *id);
                if let Some(id) = id {
                    info!(viewer_id = ?id, reason = %reason, "viewer disconnected");
                    self.viewers.remove(&id);
                }
            }
            other => {
                debug!(?other, "unexpected viewer datagram");
            }
        }
    }

    /// Upstream changed level: reset every piece of replication state and
    /// push the change-level signon down to viewers.
    async fn on_changelevel(&mut self) -> anyhow::Result<()> {
        info!(
            old = self.spawn_count_seen,
            new = self.upstream.spawn_count(),
            "relaying level change"
        );
        self.spawn_count_seen = self.upstream.spawn_count();

        self.history.delete_frames(-1);
        self.table = EntityStateTable::new(self.cfg.max_entities);
        self.up_baselines = BaselineTables::new(self.classes.clone());
        self.down_baselines = BaselineTables::new(self.classes.clone());
        self.delta_cache.flush();
        self.manager.clear_cache();
        self.active = false;
        self.first_tick = None;
        if let Some(demo) = self.demo.take() {
            demo.stop()?;
        }

        // Viewers restart signon under the new spawn count and re-announce
        // readiness before receiving updates again.
        for viewer in self.viewers.values_mut() {
            viewer.signon = SignonState::New;
            viewer.delta_tick = -1;
            let _ = viewer
                .reliable
                .send(&NetMsg::SignonState {
                    state: SignonState::ChangeLevel,
                    spawn_count: self.spawn_count_seen,
                })
                .await;
            let _ = viewer
                .reliable
                .send(&NetMsg::BaselineSync(self.down_baselines.export()))
                .await;
            let _ = viewer
                .reliable
                .send(&NetMsg::SignonState {
                    state: SignonState::New,
                    spawn_count: self.spawn_count_seen,
                })
                .await;
        }
        Ok(())
    }

    pub fn start_recording(&mut self, path: &str) -> anyhow::Result<()> {
        if self.demo.is_some() {
            anyhow::bail!("already recording");
        }
        self.demo = Some(DemoRecorder::start(
            path,
            &self.upstream.server_info,
            self.table.tick,
        )?);
        Ok(())
    }

    pub fn stop_recording(&mut self) -> anyhow::Result<u64> {
        match self.demo.take() {
            Some(demo) => {
                let frames = demo.frames();
                demo.stop()?;
                Ok(frames)
            }
            None => anyhow::bail!("not recording"),
        }
    }

    /// Console status lines.
    pub fn status_lines(&self) -> Vec<String> {
        let mut out = Vec::new();
        out.push(format!(
            "Broadcast: {} (tick {}, first {:?})",
            if self.active { "active" } else { "waiting" },
            self.table.tick,
            self.first_tick
        ));
        out.push(format!(
            "Live: {} blobs, {} snapshots, cache {} bytes",
            self.manager.live_blobs(),
            self.manager.live_snapshots(),
            self.delta_cache.used_bytes()
        ));
        out.push(format!("Viewers: {}", self.viewers.len()));
        for (id, viewer) in &self.viewers {
            out.push(format!(
                "  {:?}: udp={} signon={:?} delta_tick={}",
                id, viewer.udp_peer, viewer.signon, viewer.delta_tick
            ));
        }
        if let Some(demo) = &self.demo {
            out.push(format!("Recording: {} frames", demo.frames()));
        }
        out
    }
}
