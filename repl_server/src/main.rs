//! Standalone server binary.
//!
//! Usage:
//!   cargo run -p repl_server -- [--addr 127.0.0.1:40000] [--tick-hz 64]
//!
//! The server listens for client/relay connections, runs a fixed timestep
//! loop over a small demo world, and fans out per-recipient entity deltas.
//!
//! Console commands:
//!   status  - Show server status
//!   quit    - Shutdown server

use std::env;
use std::io::{BufRead, Write};
use std::sync::Arc;

use anyhow::Context;
use repl_server::GameServer;
use repl_shared::config::ReplConfig;
use repl_shared::props::{ClassLayout, ClassTable, PropField};
use tokio::sync::mpsc;
use tracing::info;

fn parse_args() -> ReplConfig {
    let mut cfg = ReplConfig::default();
    let args: Vec<String> = env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--addr" if i + 1 < args.len() => {
                cfg.listen_addr = args[i + 1].clone();
                i += 2;
            }
            "--tick-hz" if i + 1 < args.len() => {
                cfg.tick_hz = args[i + 1].parse().unwrap_or(64);
                i += 2;
            }
            "--compressed" => {
                cfg.store_compressed = true;
                i += 1;
            }
            _ => i += 1,
        }
    }
    cfg
}

/// Demo class set for the standalone binary.
fn demo_classes() -> Arc<ClassTable> {
    Arc::new(ClassTable::new(vec![
        ClassLayout::new(
            "player",
            vec![
                PropField::new("origin_x", 16),
                PropField::new("origin_y", 16),
                PropField::new("health", 8),
                PropField::new("ammo", 8).owner_only(),
                PropField::new("sim_time", 16).tick_relative(),
            ],
        ),
        ClassLayout::new(
            "projectile",
            vec![PropField::new("origin_x", 16), PropField::new("origin_y", 16)],
        ),
    ]))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cfg = parse_args();
    info!(addr = %cfg.listen_addr, tick_hz = cfg.tick_hz, "starting server");

    let mut server = GameServer::new(cfg.clone(), demo_classes())
        .await
        .context("create server")?;
    let local = server.local_addr()?;
    info!(%local, "server listening");

    // A couple of demo entities so updates carry something.
    server.world.spawn(1, 0, vec![100, 100, 100, 30, 0]);
    server.world.spawn(2, 1, vec![500, 500]);

    // Set up console input channel.
    let (console_tx, console_rx) = mpsc::channel::<String>(32);
    server.set_console_input(console_rx);

    // Spawn stdin reader thread.
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut stdout = std::io::stdout();
        loop {
            print!("] ");
            let _ = stdout.flush();
            let mut line = String::new();
            if stdin.lock().read_line(&mut line).is_err() {
                break;
            }
            let line = line.trim().to_string();
            if !line.is_empty() && console_tx.blocking_send(line).is_err() {
                break;
            }
        }
    });

    println!("Server ready. Type 'status' for info, 'quit' to exit.");
    println!();

    // Main server loop.
    let tick_interval = std::time::Duration::from_secs_f32(1.0 / cfg.tick_hz as f32);
    let mut next_tick = tokio::time::Instant::now();

    loop {
        // Accept new clients (non-blocking).
        if let Ok(Some(cid)) = server.try_accept(std::time::Duration::from_millis(1)).await {
            info!(client_id = ?cid, "new client accepted");
        }

        // Wiggle the demo world so deltas are non-trivial.
        let t = server.tick();
        server.world.set_value(1, 0, 100 + (t % 64));
        server.world.set_value(1, 4, t & 0xFFFF);

        server.step().await?;

        next_tick += tick_interval;
        tokio::time::sleep_until(next_tick).await;
    }
}
