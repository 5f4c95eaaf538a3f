//! Server → relay → viewer chain tests over real sockets.

use std::time::Duration;

use repl_relay::RelayServer;
use repl_server::server::bind_ephemeral;
use repl_shared::config::ReplConfig;
use repl_tests::{test_classes, TestClient};

fn relay_cfg() -> ReplConfig {
    ReplConfig {
        listen_addr: "127.0.0.1:0".to_string(),
        ..Default::default()
    }
}

/// A viewer behind a relay reconstructs the same entity state a direct
/// client would, with the relay re-encoding deltas from its own rebuilt
/// snapshots.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn viewer_converges_through_relay() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_test_writer()
        .try_init();

    let (mut server, cfg) = bind_ephemeral(64, test_classes()).await?;
    let server_addr: std::net::SocketAddr = cfg.listen_addr.parse()?;

    server.world.spawn(4, 0, vec![100, 80]);
    server.world.spawn(9, 1, vec![7777]);

    let server_handle = tokio::spawn(async move {
        let _relay_conn = server.accept_one().await?;
        for _ in 0..80 {
            let t = server.tick();
            server.world.set_value(4, 0, 100 + t);
            server.step().await?;
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        Ok::<_, anyhow::Error>(())
    });

    tokio::time::sleep(Duration::from_millis(10)).await;

    let mut relay = RelayServer::connect(relay_cfg(), server_addr).await?;
    relay.complete_signon(Duration::from_secs(5)).await?;
    let relay_addr = relay.local_addr()?;

    let relay_handle = tokio::spawn(async move {
        for _ in 0..400 {
            let _ = relay.try_accept(Duration::from_millis(1)).await;
            relay.step().await?;
        }
        Ok::<_, anyhow::Error>(relay)
    });

    tokio::time::sleep(Duration::from_millis(20)).await;

    let mut viewer = TestClient::connect(relay_addr).await?;
    assert!(
        viewer.conn.server_info.is_relay,
        "relay must announce itself"
    );
    viewer.complete_signon(Duration::from_secs(5)).await?;

    let applied = viewer.pump_until_tick(30, Duration::from_secs(10)).await?;

    let avatar = viewer.table.entity(4).expect("avatar via relay");
    assert_eq!(avatar.values, vec![100 + applied, 80]);
    assert_eq!(viewer.table.entity(9).unwrap().values, vec![7777]);
    assert!(
        viewer.deltas_applied > 0,
        "viewer acks should switch the relay stream to deltas"
    );

    let relay = relay_handle.await??;
    assert!(relay.is_active());
    assert!(relay.tick() >= applied);

    server_handle.await??;
    Ok(())
}

/// Two viewers at the same basis tick exercise the shared delta-bit cache;
/// both must converge to identical state.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_viewers_share_one_relay() -> anyhow::Result<()> {
    let (mut server, cfg) = bind_ephemeral(64, test_classes()).await?;
    let server_addr: std::net::SocketAddr = cfg.listen_addr.parse()?;

    server.world.spawn(1, 0, vec![10, 20]);

    let server_handle = tokio::spawn(async move {
        let _relay_conn = server.accept_one().await?;
        for _ in 0..80 {
            let t = server.tick();
            server.world.set_value(1, 1, 20 + (t % 50));
            server.step().await?;
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        Ok::<_, anyhow::Error>(())
    });

    tokio::time::sleep(Duration::from_millis(10)).await;

    let mut relay = RelayServer::connect(relay_cfg(), server_addr).await?;
    relay.complete_signon(Duration::from_secs(5)).await?;
    let relay_addr = relay.local_addr()?;

    let relay_handle = tokio::spawn(async move {
        for _ in 0..400 {
            let _ = relay.try_accept(Duration::from_millis(1)).await;
            relay.step().await?;
        }
        Ok::<_, anyhow::Error>(relay)
    });

    tokio::time::sleep(Duration::from_millis(20)).await;

    let mut a = TestClient::connect(relay_addr).await?;
    a.complete_signon(Duration::from_secs(5)).await?;
    let mut b = TestClient::connect(relay_addr).await?;
    b.complete_signon(Duration::from_secs(5)).await?;

    let tick_a = a.pump_until_tick(25, Duration::from_secs(10)).await?;
    let tick_b = b.pump_until_tick(tick_a, Duration::from_secs(10)).await?;

    // Each viewer's state must be exactly the world state of its last
    // applied tick; the second prop follows the tick formula.
    let va = a.table.entity(1).unwrap();
    let vb = b.table.entity(1).unwrap();
    assert_eq!(va.class_id, vb.class_id);
    assert_eq!(va.serial, vb.serial);
    assert_eq!(va.values, vec![10, 20 + (tick_a % 50)]);
    assert_eq!(vb.values, vec![10, 20 + (tick_b % 50)]);

    let relay = relay_handle.await??;
    assert_eq!(relay.viewer_count(), 2);

    server_handle.await??;
    Ok(())
}
