//! Demo recording.
//!
//! Captures the upstream entity-update stream to a file so a broadcast can
//! be replayed later. One JSON document per line: a header first, then one
//! record per applied update. Text keeps the format debuggable with
//! ordinary tools; the entity payload inside each record stays bit-exact.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use repl_shared::net::{PacketEntitiesMsg, ServerInfo};
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Serialize, Deserialize)]
pub struct DemoHeader {
    pub server_info: ServerInfo,
    pub start_tick: u32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DemoRecord {
    pub tick: u32,
    pub update: PacketEntitiesMsg,
}

pub struct DemoRecorder {
    path: PathBuf,
    out: BufWriter<File>,
    frames: u64,
}

impl DemoRecorder {
    pub fn start(
        path: impl AsRef<Path>,
        server_info: &ServerInfo,
        start_tick: u32,
    ) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path)
            .with_context(|| format!("create demo file {}", path.display()))?;
        let mut out = BufWriter::new(file);
        let header = DemoHeader {
            server_info: server_info.clone(),
            start_tick,
        };
        serde_json::to_writer(&mut out, &header).context("write demo header")?;
        out.write_all(b"\n")?;
        info!(path = %path.display(), start_tick, "demo recording started");
        Ok(Self {
            path,
            out,
            frames: 0,
        })
    }

    pub fn record(&mut self, update: &PacketEntitiesMsg) -> anyhow::Result<()> {
        let record = DemoRecord {
            tick: update.tick,
            update: update.clone(),
        };
        serde_json::to_writer(&mut self.out, &record).context("write demo record")?;
        self.out.write_all(b"\n")?;
        self.frames += 1;
        Ok(())
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn stop(mut self) -> anyhow::Result<()> {
        self.out.flush().context("flush demo file")?;
        info!(path = %self.path.display(), frames = self.frames, "demo recording stopped");
        Ok(())
    }
}

/// Reads a recorded demo back: header plus all records.
pub fn read_demo(path: impl AsRef<Path>) -> anyhow::Result<(DemoHeader, Vec<DemoRecord>)> {
    let file = File::open(path.as_ref())
        .with_context(|| format!("open demo file {}", path.as_ref().display()))?;
    let mut lines = BufReader::new(file).lines();
    let header_line = lines
        .next()
        .context("demo file is empty")?
        .context("read demo header")?;
    let header: DemoHeader = serde_json::from_str(&header_line).context("parse demo header")?;
    let mut records = Vec::new();
    for line in lines {
        let line = line.context("read demo record")?;
        if line.is_empty() {
            continue;
        }
        records.push(serde_json::from_str(&line).context("parse demo record")?);
    }
    Ok((header, records))
}
