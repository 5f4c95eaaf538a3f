//! Upstream connection: the relay as a client of the primary server.
//!
//! Mirrors a normal client handshake (reliable hello, UDP port
//! announcement, welcome with server info), then tracks the signon
//! sequence. Past `Connected`, the state may only move forward within one
//! spawn count; a `ChangeLevel` with a new spawn count restarts the
//! sequence at `New`.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use anyhow::Context;
use repl_shared::net::{
    BaselineSyncMsg, ClientId, NetMsg, PacketEntitiesMsg, ReliableConn, ServerInfo, SignonState,
    UnreliableConn, PROTOCOL_VERSION,
};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

pub struct UpstreamClient {
    pub client_id: ClientId,
    pub server_info: ServerInfo,
    reliable: ReliableConn,
    unreliable: UnreliableConn,
    signon: SignonState,
    spawn_count: u32,
    /// Baseline sync received during signon, waiting to be adopted.
    pending_baselines: Option<BaselineSyncMsg>,
    /// Broadcast messages received since the last drain.
    pending_broadcasts: Vec<NetMsg>,
}

impl UpstreamClient {
    /// Connects and performs the handshake up to `SignonState::New`.
    pub async fn connect(server_addr: SocketAddr) -> anyhow::Result<Self> {
        info!(server = %server_addr, "connecting upstream");

        // Bind UDP first so the server knows where to send updates.
        let bind = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        let unreliable = UnreliableConn::connect(bind, server_addr).await?;
        let client_udp_port = unreliable.local_addr().context("udp local_addr")?.port();

        let stream = TcpStream::connect(server_addr)
            .await
            .context("tcp connect")?;
        let mut reliable = ReliableConn::new(stream);

        reliable
            .send(&NetMsg::Hello {
                protocol: PROTOCOL_VERSION,
            })
            .await?;
        reliable.send(&NetMsg::UdpHello { client_udp_port }).await?;

        let welcome = reliable.recv().await?;
        let (client_id, server_info) = match welcome {
            NetMsg::Welcome {
                client_id,
                server_info,
            } => (client_id, server_info),
            other => anyhow::bail!("expected Welcome, got {other:?}"),
        };

        info!(
            client_id = ?client_id,
            classes = server_info.classes.len(),
            upstream_is_relay = server_info.is_relay,
            "upstream welcome"
        );

        let spawn_count = server_info.spawn_count;
        Ok(Self {
            client_id,
            server_info,
            reliable,
            unreliable,
            signon: SignonState::Connected,
            spawn_count,
            pending_baselines: None,
            pending_broadcasts: Vec::new(),
        })
    }

    pub fn signon(&self) -> SignonState {
        self.signon
    }

    pub fn spawn_count(&self) -> u32 {
        self.spawn_count
    }

    /// Applies a signon transition from the server. Returns `true` when the
    /// transition landed on `Full` (the stream is about to start).
    pub fn set_signon_state(
        &mut self,
        state: SignonState,
        spawn_count: u32,
    ) -> anyhow::Result<bool> {
        if state == SignonState::ChangeLevel {
            info!(spawn_count, "upstream changing level");
            self.signon = SignonState::Connected;
            self.spawn_count = spawn_count;
            return Ok(false);
        }
        if spawn_count != self.spawn_count && state == SignonState::New {
            // New level; the sequence restarts.
            self.spawn_count = spawn_count;
            self.signon = state;
            return Ok(false);
        }
        if self.signon > SignonState::Connected && state <= self.signon {
            anyhow::bail!(
                "signon regression {:?} -> {:?} within spawn count {}",
                self.signon,
                state,
                self.spawn_count
            );
        }
        self.signon = state;
        debug!(state = ?state, "upstream signon");
        Ok(state == SignonState::Full)
    }

    /// Tells the server this end is ready for entity updates. Sent over UDP
    /// so the server learns our datagram return address.
    pub async fn send_ready(&mut self) -> anyhow::Result<()> {
        self.unreliable
            .send(&NetMsg::ClientReady {
                client_id: self.client_id,
            })
            .await?;
        self.signon = SignonState::Full;
        Ok(())
    }

    /// Polls the reliable channel, applying signon transitions inline.
    /// Returns `true` when the poll moved us to `Full`.
    pub async fn poll_reliable(&mut self, timeout: Duration) -> anyhow::Result<bool> {
        match tokio::time::timeout(timeout, self.reliable.recv()).await {
            Ok(Ok(NetMsg::SignonState { state, spawn_count })) => {
                self.set_signon_state(state, spawn_count)
            }
            Ok(Ok(NetMsg::BaselineSync(sync))) => {
                self.pending_baselines = Some(sync);
                Ok(false)
            }
            Ok(Ok(msg @ NetMsg::ServerPrint { .. })) => {
                self.pending_broadcasts.push(msg);
                Ok(false)
            }
            Ok(Ok(NetMsg::Disconnect { reason })) => {
                anyhow::bail!("upstream disconnected: {reason}")
            }
            Ok(Ok(other)) => {
                debug!(?other, "unhandled upstream reliable message");
                Ok(false)
            }
            Ok(Err(e)) => Err(e).context("upstream reliable recv"),
            Err(_) => Ok(false),
        }
    }

    /// Receives the next entity update datagram, if one arrives in time.
    pub async fn recv_update(
        &mut self,
        timeout: Duration,
    ) -> anyhow::Result<Option<PacketEntitiesMsg>> {
        match self.unreliable.recv_timeout(timeout).await? {
            Some(NetMsg::PacketEntities(msg)) => Ok(Some(msg)),
            Some(other) => {
                warn!(?other, "unexpected upstream datagram");
                Ok(None)
            }
            None => Ok(None),
        }
    }

    /// The baseline sync from signon, if one arrived since the last take.
    pub fn take_baselines(&mut self) -> Option<BaselineSyncMsg> {
        self.pending_baselines.take()
    }

    /// Broadcast messages to replay to viewers and buffer into the frame.
    pub fn take_broadcasts(&mut self) -> Vec<NetMsg> {
        std::mem::take(&mut self.pending_broadcasts)
    }

    /// Acknowledges the newest applied tick; it becomes our delta basis.
    pub async fn ack(&mut self, tick: u32) -> anyhow::Result<()> {
        self.unreliable
            .send(&NetMsg::Tick {
                client_id: self.client_id,
                delta_tick: tick as i32,
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use repl_shared::props::ClassTable;

    // The transition rules need a live socket only for construction, so
    // exercise them through a loopback pair.
    #[tokio::test(flavor = "multi_thread")]
    async fn signon_regression_is_rejected() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });
        let stream = TcpStream::connect(addr).await.unwrap();
        let _server_side = accept.await.unwrap();

        let bind = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        let unreliable = UnreliableConn::connect(bind, addr).await.unwrap();
        let mut up = UpstreamClient {
            client_id: ClientId(1),
            server_info: ServerInfo {
                tick_hz: 64,
                max_entities: 16,
                classes: ClassTable::new(vec![]),
                spawn_count: 1,
                is_relay: false,
            },
            reliable: ReliableConn::new(stream),
            unreliable,
            signon: SignonState::Connected,
            spawn_count: 1,
            pending_baselines: None,
            pending_broadcasts: Vec::new(),
        };

        assert!(!up.set_signon_state(SignonState::New, 1).unwrap());
        assert!(!up.set_signon_state(SignonState::Spawn, 1).unwrap());
        assert!(up.set_signon_state(SignonState::Full, 1).unwrap());
        // Regression within the same spawn count is a protocol error.
        assert!(up.set_signon_state(SignonState::New, 1).is_err());
        // ChangeLevel resets; a New with the new spawn count restarts.
        assert!(!up.set_signon_state(SignonState::ChangeLevel, 2).unwrap());
        assert!(!up.set_signon_state(SignonState::New, 2).unwrap());
        assert_eq!(up.spawn_count(), 2);
    }
}
