//! Server implementation.
//!
//! An authoritative tick-based server loop. Each tick it:
//! - drains console and network input,
//! - takes one immutable snapshot of the world table,
//! - writes a per-recipient delta update against each client's
//!   acknowledged frame (or a full update from baseline when no usable
//!   basis exists),
//! - appends the sent frame to that client's bounded history.
//!
//! Determinism notes:
//! - Keep simulation in a fixed timestep.
//! - The snapshot scan iterates slots in order, so diffing downstream is
//!   order-stable.

use anyhow::Context;
use repl_shared::{
    bitbuf::BitWriter,
    client_frame::{ClientFrame, ClientFrameHistory, EntitySet},
    config::ReplConfig,
    ents_write::{write_delta_entities, WriteParams},
    error::ReplError,
    net::{
        ClientId, NetMsg, PacketEntitiesMsg, ReliableConn, ReliableListener, ServerInfo,
        SignonState, PROTOCOL_VERSION,
    },
    props::ClassTable,
    snapshot::Snapshot,
    world::WorldTable,
};
use std::{
    collections::HashMap,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};
use tokio::{net::UdpSocket, sync::mpsc, time::Instant};
use tracing::{debug, info, warn};

use crate::context::ReplicationContext;

/// Connected client state.
struct ClientState {
    id: ClientId,
    reliable: ReliableConn,
    udp_peer: SocketAddr,
    signon: SignonState,
    /// Newest tick the client acknowledged; -1 until the first ack, which
    /// forces full updates.
    delta_tick: i32,
    history: ClientFrameHistory,
    /// Entity whose owner-only properties this client may see.
    owned_entity: Option<u32>,
    /// Restricted visibility set; `None` means everything is in range.
    visibility: Option<EntitySet>,
}

/// Game server.
pub struct GameServer {
    pub cfg: ReplConfig,
    pub ctx: ReplicationContext,
    pub world: WorldTable,
    clients: HashMap<ClientId, ClientState>,

    tcp: ReliableListener,
    udp: UdpSocket,

    tick: u32,
    update_baseline_next: bool,

    /// Channel for console commands from stdin.
    console_rx: Option<mpsc::Receiver<String>>,
}

impl GameServer {
    /// Binds sockets and builds the replication context for this level.
    pub async fn new(cfg: ReplConfig, classes: Arc<ClassTable>) -> anyhow::Result<Self> {
        let addr: SocketAddr = cfg.listen_addr.parse().context("parse listen_addr")?;
        let tcp = ReliableListener::bind(addr).await?;
        let udp = UdpSocket::bind(addr).await.context("udp bind")?;

        let ctx = ReplicationContext::new(&cfg, classes);
        let world = WorldTable::new(cfg.max_entities);

        Ok(Self {
            cfg,
            ctx,
            world,
            clients: HashMap::new(),
            tcp,
            udp,
            tick: 0,
            update_baseline_next: false,
            console_rx: None,
        })
    }

    /// Sets the console input receiver.
    pub fn set_console_input(&mut self, rx: mpsc::Receiver<String>) {
        self.console_rx = Some(rx);
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        self.tcp.local_addr()
    }

    pub fn tick(&self) -> u32 {
        self.tick
    }

    fn server_info(&self) -> ServerInfo {
        ServerInfo {
            tick_hz: self.cfg.tick_hz,
            max_entities: self.cfg.max_entities,
            classes: (*self.ctx.classes).clone(),
            spawn_count: self.ctx.spawn_count,
            is_relay: false,
        }
    }

    /// Accepts exactly one client (handshake + server info).
    pub async fn accept_one(&mut self) -> anyhow::Result<ClientId> {
        let (conn, peer) = self.tcp.accept().await?;
        self.handle_new_connection(conn, peer).await
    }

    /// Accepts a client with timeout (non-blocking).
    pub async fn try_accept(&mut self, timeout: Duration) -> anyhow::Result<Option<ClientId>> {
        match tokio::time::timeout(timeout, self.tcp.accept()).await {
            Ok(Ok((conn, peer))) => self.handle_new_connection(conn, peer).await.map(Some),
            Ok(Err(e)) => Err(e),
            Err(_) => Ok(None), // Timeout
        }
    }

    async fn handle_new_connection(
        &mut self,
        mut conn: ReliableConn,
        peer: SocketAddr,
    ) -> anyhow::Result<ClientId> {
        let msg = conn.recv().await?;
        match msg {
            NetMsg::Hello { protocol } if protocol == PROTOCOL_VERSION => {
                let udp_hello = conn.recv().await?;
                let client_udp_port = match udp_hello {
                    NetMsg::UdpHello { client_udp_port } => client_udp_port,
                    other => anyhow::bail!("expected UdpHello, got {other:?}"),
                };

                let id = ClientId::new_unique();
                conn.send(&NetMsg::Welcome {
                    client_id: id,
                    server_info: self.server_info(),
                })
                .await?;
                // Instance baselines first, so the client decodes its very
                // first full update against our exact basis.
                conn.send(&NetMsg::BaselineSync(self.ctx.baselines.export()))
                    .await?;
                conn.send(&NetMsg::SignonState {
                    state: SignonState::New,
                    spawn_count: self.ctx.spawn_count,
                })
                .await?;

                let udp_peer = SocketAddr::new(peer.ip(), client_udp_port);
                self.clients.insert(
                    id,
                    ClientState {
                        id,
                        reliable: conn,
                        udp_peer,
                        signon: SignonState::New,
                        delta_tick: -1,
                        history: ClientFrameHistory::new(self.cfg.frame_window),
                        owned_entity: None,
                        visibility: None,
                    },
                );

                info!(client_id = ?id, %udp_peer, "client connected");
                Ok(id)
            }
            other => anyhow::bail!("unexpected handshake msg: {other:?}"),
        }
    }

    /// Marks a client fully signed on; it starts receiving entity updates.
    pub fn client_ready(&mut self, client_id: ClientId) {
        if let Some(client) = self.clients.get_mut(&client_id) {
            client.signon = SignonState::Full;
            info!(client_id = ?client_id, "client signon complete");
        }
    }

    /// Binds the entity whose owner-only properties the client may see.
    pub fn set_owned_entity(&mut self, client_id: ClientId, entity: Option<u32>) {
        if let Some(client) = self.clients.get_mut(&client_id) {
            client.owned_entity = entity;
        }
    }

    /// Restricts a client's visibility set (`None` = everything in range).
    pub fn set_visibility(&mut self, client_id: ClientId, visibility: Option<EntitySet>) {
        if let Some(client) = self.clients.get_mut(&client_id) {
            client.visibility = visibility;
        }
    }

    /// Requests an instance-baseline rotation with the next update.
    pub fn request_baseline_update(&mut self) {
        self.update_baseline_next = true;
    }

    /// Runs the server for a number of ticks.
    pub async fn run_for_ticks(&mut self, ticks: u32) -> anyhow::Result<()> {
        let dt = Duration::from_secs_f32(1.0 / self.cfg.tick_hz as f32);
        let mut next = Instant::now();

        for _ in 0..ticks {
            next += dt;
            self.step().await?;
            tokio::time::sleep_until(next).await;
        }
        Ok(())
    }

    /// Executes one fixed simulation step. All snapshot and frame work for
    /// the tick completes here before the next tick begins.
    pub async fn step(&mut self) -> anyhow::Result<()> {
        self.process_console_commands().await?;
        self.recv_datagrams().await?;
        self.send_snapshots().await?;
        self.tick += 1;
        Ok(())
    }

    async fn process_console_commands(&mut self) -> anyhow::Result<()> {
        // Collect lines first to avoid borrow conflict
        let lines: Vec<String> = if let Some(ref mut rx) = self.console_rx {
            let mut collected = Vec::new();
            while let Ok(line) = rx.try_recv() {
                collected.push(line);
            }
            collected
        } else {
            Vec::new()
        };

        for line in lines {
            for out in self.exec_console(&line)? {
                info!(message = %out, "console");
            }
        }
        Ok(())
    }

    /// Executes a console command.
    pub fn exec_console(&mut self, line: &str) -> anyhow::Result<Vec<String>> {
        let tokens: Vec<&str> = line.trim().split_whitespace().collect();
        if tokens.is_empty() {
            return Ok(Vec::new());
        }

        match tokens[0] {
            "status" => {
                let mut out = Vec::new();
                out.push(format!("Tick: {}", self.tick));
                out.push(format!(
                    "Live: {} blobs, {} snapshots",
                    self.ctx.manager.live_blobs(),
                    self.ctx.manager.live_snapshots()
                ));
                out.push(format!("Clients: {}", self.clients.len()));
                for (id, client) in &self.clients {
                    out.push(format!(
                        "  {:?}: udp={} signon={:?} delta_tick={} frames={}",
                        id,
                        client.udp_peer,
                        client.signon,
                        client.delta_tick,
                        client.history.len()
                    ));
                }
                Ok(out)
            }
            "quit" | "exit" => {
                info!("server shutting down");
                std::process::exit(0);
            }
            other => Ok(vec![format!("Unknown command: {other}")]),
        }
    }

    async fn recv_datagrams(&mut self) -> anyhow::Result<()> {
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            match self.udp.try_recv_from(&mut buf) {
                Ok((n, from)) => {
                    if let Ok(msg) = serde_json::from_slice::<NetMsg>(&buf[..n]) {
                        self.handle_udp_message(from, msg);
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e).context("udp recv"),
            }
        }
        Ok(())
    }

    fn handle_udp_message(&mut self, from: SocketAddr, msg: NetMsg) {
        match msg {
            NetMsg::ClientReady { client_id } => {
                if let Some(client) = self.clients.get_mut(&client_id) {
                    client.udp_peer = from;
                }
                self.client_ready(client_id);
            }
            NetMsg::Tick {
                client_id,
                delta_tick,
            } => {
                self.on_ack(client_id, delta_tick);
            }
            NetMsg::Disconnect { reason } => {
                let id = self
                    .clients
                    .iter()
                    .find(|(_, c)| c.udp_peer == from)
                    .map(|(id, _)| *id);
                if let Some(id) = id {
                    info!(client_id = ?id, reason = %reason, "client disconnected");
                    self.clients.remove(&id);
                }
            }
            _ => {
                debug!(?msg, "unexpected UDP message");
            }
        }
    }

    /// An acknowledged tick becomes the delta basis; frames older than the
    /// basis will never be referenced again and are trimmed.
    fn on_ack(&mut self, client_id: ClientId, delta_tick: i32) {
        if let Some(client) = self.clients.get_mut(&client_id) {
            if delta_tick >= 0 {
                client.delta_tick = delta_tick;
                client.history.delete_frames(delta_tick as i64);
            } else {
                // Client requested a full resync.
                client.delta_tick = -1;
                client.history.delete_frames(-1);
            }
        }
    }

    async fn send_snapshots(&mut self) -> anyhow::Result<()> {
        if !self
            .clients
            .values()
            .any(|c| c.signon == SignonState::Full)
        {
            return Ok(());
        }

        let snap = self
            .ctx
            .manager
            .take_tick_snapshot(self.tick, &self.world)
            .context("take tick snapshot")?;
        let update_baseline = std::mem::take(&mut self.update_baseline_next);

        let mut to_drop = Vec::new();
        for client in self.clients.values_mut() {
            if client.signon != SignonState::Full {
                continue;
            }
            match Self::send_client_update(
                &self.ctx,
                &self.udp,
                self.cfg.max_entities,
                &snap,
                client,
                update_baseline,
            )
            .await
            {
                Ok(()) => {}
                Err(e) => {
                    // Fatal protocol invariants abort the connection; a
                    // missing basis frame was already degraded inside.
                    warn!(client_id = ?client.id, error = %e, "dropping client");
                    to_drop.push(client.id);
                }
            }
        }
        for id in to_drop {
            self.clients.remove(&id);
        }

        if update_baseline {
            Self::rotate_baselines(&mut self.ctx, &snap);
        }
        Ok(())
    }

    async fn send_client_update(
        ctx: &ReplicationContext,
        udp: &UdpSocket,
        max_entities: usize,
        snap: &Arc<Snapshot>,
        client: &mut ClientState,
        update_baseline: bool,
    ) -> anyhow::Result<()> {
        let mut transmit = EntitySet::new(max_entities);
        for &i in snap.valid_entities() {
            if client.visibility.as_ref().map(|v| v.contains(i)).unwrap_or(true) {
                transmit.set(i);
            }
        }
        let mut frame = ClientFrame::new(snap.clone(), transmit);

        // Resolve the delta basis; a trimmed ack degrades to a full resync.
        let old_frame = if client.delta_tick >= 0 {
            match client.history.get_frame(client.delta_tick as u32, true) {
                Some(f) => Some(f),
                None => {
                    warn!(
                        client_id = ?client.id,
                        tick = client.delta_tick,
                        "{}",
                        ReplError::FrameNotFound {
                            tick: client.delta_tick
                        }
                    );
                    None
                }
            }
        } else {
            None
        };

        let params = WriteParams {
            classes: &ctx.classes,
            baselines: &ctx.baselines,
            owned_entity: client.owned_entity,
            cull: true,
        };
        let mut out = BitWriter::new();
        let res = write_delta_entities(&params, &mut frame, old_frame, None, &mut out)?;
        let delta_tick = old_frame.map(|f| f.tick as i32).unwrap_or(-1);
        let (data, bits) = out.into_bytes();

        let msg = NetMsg::PacketEntities(PacketEntitiesMsg {
            tick: frame.tick,
            delta_tick,
            baseline_index: ctx.baselines.active_index(),
            update_baseline,
            max_entries: max_entities as u32,
            num_entries: res.num_entries,
            bits: bits as u32,
            data,
        });
        let payload = serde_json::to_vec(&msg).context("serialize update")?;
        let _ = udp.send_to(&payload, client.udp_peer).await;

        client.history.add_frame(frame);
        Ok(())
    }

    /// Stages the current full state of one entity per class and swaps the
    /// rotating instance baselines. Recipients do the same on receipt of the
    /// update_baseline flag, keeping both ends on the same basis.
    fn rotate_baselines(ctx: &mut ReplicationContext, snap: &Arc<Snapshot>) {
        let staged = ctx.baselines.rotate_from_snapshot(snap);
        debug!(classes = staged, "instance baselines rotated");
    }

    /// Level change: tell everyone, tear the context down, and reset the
    /// per-client replication state.
    pub async fn changelevel(&mut self) -> anyhow::Result<()> {
        for client in self.clients.values_mut() {
            client.signon = SignonState::ChangeLevel;
            client.delta_tick = -1;
            client.history.delete_frames(-1);
            let _ = client
                .reliable
                .send(&NetMsg::SignonState {
                    state: SignonState::ChangeLevel,
                    spawn_count: self.ctx.spawn_count,
                })
                .await;
        }
        self.ctx.level_shutdown();
        self.tick = 0;

        // Restart signon under the new spawn count; clients re-announce
        // readiness before receiving updates again.
        for client in self.clients.values_mut() {
            client.signon = SignonState::New;
            let _ = client
                .reliable
                .send(&NetMsg::BaselineSync(self.ctx.baselines.export()))
                .await;
            let _ = client
                .reliable
                .send(&NetMsg::SignonState {
                    state: SignonState::New,
                    spawn_count: self.ctx.spawn_count,
                })
                .await;
        }
        Ok(())
    }
}

/// Helper for tests: bind to an ephemeral port.
pub async fn bind_ephemeral(
    tick_hz: u32,
    classes: Arc<ClassTable>,
) -> anyhow::Result<(GameServer, ReplConfig)> {
    let cfg = ReplConfig {
        listen_addr: format!("{}:{}", IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
        tick_hz,
        ..Default::default()
    };

    // Bind TCP first to get an ephemeral port, then bind UDP to that same port.
    let tcp = ReliableListener::bind(cfg.listen_addr.parse()?).await?;
    let addr = tcp.local_addr()?;
    let mut cfg = cfg;
    cfg.listen_addr = addr.to_string();

    let udp_bind = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), addr.port());
    let udp = UdpSocket::bind(udp_bind).await?;

    let ctx = ReplicationContext::new(&cfg, classes);
    let world = WorldTable::new(cfg.max_entities);

    Ok((
        GameServer {
            cfg: cfg.clone(),
            ctx,
            world,
            clients: HashMap::new(),
            tcp,
            udp,
            tick: 0,
            update_baseline_next: false,
            console_rx: None,
        },
        cfg,
    ))
}
