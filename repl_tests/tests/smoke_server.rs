use repl_server::server::bind_ephemeral;
use repl_tests::test_classes;

/// Smoke test: the server runs a few ticks with no clients attached.
#[tokio::test]
async fn server_runs_few_ticks() -> anyhow::Result<()> {
    let (mut server, _cfg) = bind_ephemeral(64, test_classes()).await?;
    server.world.spawn(0, 0, vec![1, 2]);
    server.run_for_ticks(3).await?;
    assert_eq!(server.tick(), 3);
    Ok(())
}

/// A level change resets the replication context without leaking blobs.
#[tokio::test]
async fn changelevel_resets_cleanly() -> anyhow::Result<()> {
    let (mut server, _cfg) = bind_ephemeral(64, test_classes()).await?;
    server.world.spawn(0, 0, vec![1, 2]);
    server.run_for_ticks(2).await?;

    // Pack something so the shutdown has cached blobs to release.
    let snap = server.ctx.manager.take_tick_snapshot(2, &server.world)?;
    assert_eq!(server.ctx.manager.live_blobs(), 1);
    drop(snap);

    server.changelevel().await?;
    assert_eq!(server.tick(), 0);
    assert_eq!(server.ctx.manager.live_snapshots(), 0);
    assert_eq!(server.ctx.manager.live_blobs(), 0);
    Ok(())
}
