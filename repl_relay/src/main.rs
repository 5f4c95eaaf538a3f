//! Standalone relay binary.
//!
//! Usage:
//!   cargo run -p repl_relay -- --upstream 127.0.0.1:40000 [--addr 127.0.0.1:40100]
//!
//! Connects to the primary server as a client, rebuilds the entity stream,
//! and re-serves it to any number of viewers.
//!
//! Console commands:
//!   status            - Show relay status
//!   record <file>     - Start demo recording
//!   stoprecord        - Stop demo recording
//!   quit              - Shutdown relay

use std::env;
use std::io::{BufRead, Write};
use std::net::SocketAddr;

use anyhow::Context;
use repl_relay::RelayServer;
use repl_shared::config::ReplConfig;
use tokio::sync::mpsc;
use tracing::info;

struct Args {
    cfg: ReplConfig,
    upstream: SocketAddr,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut cfg = ReplConfig {
        listen_addr: "127.0.0.1:40100".to_string(),
        ..Default::default()
    };
    let mut upstream: Option<SocketAddr> = None;

    let args: Vec<String> = env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--addr" if i + 1 < args.len() => {
                cfg.listen_addr = args[i + 1].clone();
                i += 2;
            }
            "--upstream" if i + 1 < args.len() => {
                upstream = Some(args[i + 1].parse().context("parse --upstream")?);
                i += 2;
            }
            "--autorecord" => {
                cfg.autorecord = true;
                i += 1;
            }
            "--cache-kib" if i + 1 < args.len() => {
                cfg.delta_cache_kib = args[i + 1].parse().unwrap_or(64);
                i += 2;
            }
            _ => i += 1,
        }
    }

    let upstream = upstream.context("--upstream <host:port> is required")?;
    Ok(Args { cfg, upstream })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = parse_args()?;
    let mut relay = RelayServer::connect(args.cfg, args.upstream)
        .await
        .context("connect relay")?;
    relay
        .complete_signon(std::time::Duration::from_secs(10))
        .await?;
    let local = relay.local_addr()?;
    info!(%local, "relay serving viewers");

    // Console input channel fed by a stdin reader thread.
    let (console_tx, mut console_rx) = mpsc::channel::<String>(32);
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

    println!("Relay ready. Type 'status' for info, 'quit' to exit.");
    println!();

    loop {
        if let Ok(Some(id)) = relay.try_accept(std::time::Duration::from_millis(1)).await {
            info!(viewer_id = ?id, "new viewer accepted");
        }

        relay.step().await?;

        while let Ok(line) = console_rx.try_recv() {
            for out in exec_console(&mut relay, &line) {
                info!(message = %out, "console");
            }
        }

        tokio::time::sleep(std::time::Duration::from_millis(1)).await;
    }
}

fn exec_console(relay: &mut RelayServer, line: &str) -> Vec<String> {
    let tokens: Vec<&str> = line.trim().split_whitespace().collect();
    if tokens.is_empty() {
        return Vec::new();
    }
    match tokens[0] {
        "status" => relay.status_lines(),
        "record" => {
            if tokens.len() < 2 {
                return vec!["Usage: record <file>".to_string()];
            }
            match relay.start_recording(tokens[1]) {
                Ok(()) => vec![format!("Recording to {}", tokens[1])],
                Err(e) => vec![format!("Failed to record: {e}")],
            }
        }
        "stoprecord" => match relay.stop_recording() {
            Ok(frames) => vec![format!("Stopped after {frames} frames")],
            Err(e) => vec![format!("{e}")],
        },
        "quit" | "exit" => {
            info!("relay shutting down");
            std::process::exit(0);
        }
        other => vec![format!("Unknown command: {other}")],
    }
}
