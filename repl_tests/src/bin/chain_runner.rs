//! End-to-end chain runner.
//!
//! Spins up a full server → relay → viewer chain over loopback, runs it for
//! a couple of seconds, and prints a summary. Exits nonzero if the viewer
//! failed to converge on the server's state. Useful as a quick manual
//! check that the whole pipeline holds together outside the test harness.

use std::time::Duration;

use repl_relay::RelayServer;
use repl_server::server::bind_ephemeral;
use repl_shared::config::ReplConfig;
use repl_tests::{test_classes, TestClient};
use tracing::info;

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let (mut server, cfg) = bind_ephemeral(128, test_classes()).await?;
    let server_addr: std::net::SocketAddr = cfg.listen_addr.parse()?;
    info!(%server_addr, "chain: server up");

    server.world.spawn(1, 0, vec![0, 100]);
    server.world.spawn(2, 1, vec![5000]);

    let server_handle = tokio::spawn(async move {
        let _relay_conn = server.accept_one().await?;
        for _ in 0..256u32 {
            let t = server.tick();
            server.world.set_value(1, 0, t);
            server.step().await?;
            tokio::time::sleep(Duration::from_millis(4)).await;
        }
        Ok::<_, anyhow::Error>(server)
    });

    tokio::time::sleep(Duration::from_millis(10)).await;

    let relay_cfg = ReplConfig {
        listen_addr: "127.0.0.1:0".to_string(),
        ..Default::default()
    };
    let mut relay = RelayServer::connect(relay_cfg, server_addr).await?;
    relay.complete_signon(Duration::from_secs(5)).await?;
    let relay_addr = relay.local_addr()?;
    info!(%relay_addr, "chain: relay up");

    let relay_handle = tokio::spawn(async move {
        for _ in 0..1024 {
            let _ = relay.try_accept(Duration::from_millis(1)).await;
            relay.step().await?;
        }
        Ok::<_, anyhow::Error>(relay)
    });

    tokio::time::sleep(Duration::from_millis(20)).await;

    let mut viewer = TestClient::connect(relay_addr).await?;
    viewer.complete_signon(Duration::from_secs(5)).await?;
    let applied = viewer.pump_until_tick(200, Duration::from_secs(20)).await?;

    let relay = relay_handle.await??;
    let server = server_handle.await??;

    println!();
    println!("chain summary");
    println!("=============");
    println!("server ticks:     {}", server.tick());
    println!("relay last tick:  {}", relay.tick());
    println!("viewer last tick: {applied}");
    println!("viewer updates:   {}", viewer.updates_applied);
    println!("viewer deltas:    {}", viewer.deltas_applied);
    for line in relay.status_lines() {
        println!("relay | {line}");
    }

    let avatar = viewer
        .table
        .entity(1)
        .ok_or_else(|| anyhow::anyhow!("viewer never saw entity 1"))?;
    if avatar.values != vec![applied, 100] {
        eprintln!(
            "MISMATCH: viewer has {:?} at tick {applied}, expected {:?}",
            avatar.values,
            vec![applied, 100]
        );
        std::process::exit(1);
    }
    println!("viewer state matches tick {applied}");
    Ok(())
}
