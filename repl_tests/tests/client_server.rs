//! Full socket-based integration tests for client ↔ server replication.

use std::time::Duration;

use repl_shared::net::{
    decode_from_bytes, encode_to_bytes, ClientId, NetMsg, PacketEntitiesMsg, PROTOCOL_VERSION,
};
use repl_server::server::bind_ephemeral;
use repl_tests::{test_classes, TestClient};

/// Unit-style test: protocol messages roundtrip correctly.
#[test]
fn protocol_messages_roundtrip() -> anyhow::Result<()> {
    let hello = NetMsg::Hello {
        protocol: PROTOCOL_VERSION,
    };
    assert_eq!(decode_from_bytes(&encode_to_bytes(&hello)?)?, hello);

    let udp_hello = NetMsg::UdpHello {
        client_udp_port: 50000,
    };
    assert_eq!(decode_from_bytes(&encode_to_bytes(&udp_hello)?)?, udp_hello);

    let update = NetMsg::PacketEntities(PacketEntitiesMsg {
        tick: 7,
        delta_tick: 6,
        baseline_index: 1,
        update_baseline: true,
        max_entries: 256,
        num_entries: 3,
        bits: 17,
        data: vec![0x5A, 0xA5, 0x01],
    });
    assert_eq!(decode_from_bytes(&encode_to_bytes(&update)?)?, update);

    let tick = NetMsg::Tick {
        client_id: ClientId(9),
        delta_tick: 100,
    };
    assert_eq!(decode_from_bytes(&encode_to_bytes(&tick)?)?, tick);

    Ok(())
}

/// Full integration: spawn server, connect a client, verify the client
/// reconstructs server state through full and delta updates.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn client_server_full_roundtrip() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_test_writer()
        .try_init();

    let (mut server, cfg) = bind_ephemeral(64, test_classes()).await?;
    let server_addr: std::net::SocketAddr = cfg.listen_addr.parse()?;

    server.world.spawn(3, 0, vec![1000, 100]);
    server.world.spawn(7, 1, vec![2000]);

    // Server task: accept the client, then run ticks with a moving world.
    // Entity 3's first prop tracks the tick number, so any applied update
    // at tick T must decode to exactly 1000 + T.
    let server_handle = tokio::spawn(async move {
        let _cid = server.accept_one().await?;
        for _ in 0..40 {
            let t = server.tick();
            server.world.set_value(3, 0, 1000 + t);
            server.step().await?;
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        Ok::<_, anyhow::Error>(server)
    });

    tokio::time::sleep(Duration::from_millis(10)).await;

    let mut client = TestClient::connect(server_addr).await?;
    client.complete_signon(Duration::from_secs(5)).await?;

    let applied = client.pump_until_tick(20, Duration::from_secs(5)).await?;
    let server = server_handle.await??;

    let avatar = client.table.entity(3).expect("avatar replicated");
    assert_eq!(avatar.class_id, 0);
    assert_eq!(avatar.values, vec![1000 + applied, 100]);

    let barrel = client.table.entity(7).expect("barrel replicated");
    assert_eq!(barrel.values, vec![2000]);

    assert!(
        client.deltas_applied > 0,
        "acknowledgements should switch the stream to delta updates"
    );

    // The server kept its live accounting balanced while streaming.
    assert!(server.ctx.manager.live_snapshots() >= 1);
    Ok(())
}

/// A recipient that acknowledges nothing keeps receiving full updates and
/// still converges.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn silent_client_receives_full_updates() -> anyhow::Result<()> {
    let (mut server, cfg) = bind_ephemeral(64, test_classes()).await?;
    let server_addr: std::net::SocketAddr = cfg.listen_addr.parse()?;

    server.world.spawn(1, 0, vec![42, 7]);

    let server_handle = tokio::spawn(async move {
        let _cid = server.accept_one().await?;
        for _ in 0..20 {
            server.step().await?;
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        Ok::<_, anyhow::Error>(())
    });

    tokio::time::sleep(Duration::from_millis(10)).await;

    let mut client = TestClient::connect(server_addr).await?;
    client.complete_signon(Duration::from_secs(5)).await?;

    // Receive updates without acknowledging: every one must be a full
    // update (delta_tick == -1) and still decode cleanly.
    let mut seen = 0;
    let start = tokio::time::Instant::now();
    while seen < 3 && start.elapsed() < Duration::from_secs(5) {
        if let Some(msg) = client.conn.recv_update(Duration::from_millis(20)).await? {
            assert_eq!(msg.delta_tick, -1, "no ack given, expected full update");
            repl_shared::ents_read::read_packet_entities(
                &msg,
                &client.classes,
                &mut client.baselines,
                &mut client.table,
            )?;
            seen += 1;
        }
    }
    server_handle.await??;

    assert_eq!(seen, 3);
    assert_eq!(client.table.entity(1).unwrap().values, vec![42, 7]);
    Ok(())
}

/// A client that joins after an instance-baseline rotation must receive the
/// rotated tables during signon and decode its first full update correctly.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn late_joiner_decodes_after_baseline_rotation() -> anyhow::Result<()> {
    let (mut server, cfg) = bind_ephemeral(64, test_classes()).await?;
    let server_addr: std::net::SocketAddr = cfg.listen_addr.parse()?;

    server.world.spawn(2, 0, vec![500, 50]);

    let server_handle = tokio::spawn(async move {
        // First client keeps the stream alive so a rotation can happen.
        let _first = server.accept_one().await?;
        for i in 0..60u32 {
            if i == 10 {
                server.request_baseline_update();
            }
            // Accept the late joiner whenever it shows up.
            let _ = server.try_accept(Duration::from_millis(1)).await;
            server.step().await?;
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        Ok::<_, anyhow::Error>(())
    });

    tokio::time::sleep(Duration::from_millis(10)).await;

    let mut first = TestClient::connect(server_addr).await?;
    first.complete_signon(Duration::from_secs(5)).await?;
    first.pump_until_tick(15, Duration::from_secs(5)).await?;

    // Rotation has happened by tick 15; now join late.
    let mut late = TestClient::connect(server_addr).await?;
    late.complete_signon(Duration::from_secs(5)).await?;
    assert_eq!(
        late.baselines.active_index(),
        1,
        "rotated tables should arrive in the signon sync"
    );
    late.pump_until_tick(20, Duration::from_secs(5)).await?;

    assert_eq!(late.table.entity(2).unwrap().values, vec![500, 50]);
    server_handle.await??;
    Ok(())
}
