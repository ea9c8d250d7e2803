use anyhow::{Context, Result};
use serde::Serialize;
use std::{
    fs::File,
    io::{BufWriter, Write},
    path::Path,
};

#[derive(Serialize)]
pub struct SessionLog {
    pub event: &'static str,
    pub timestamp: String,
    pub source: String,
    pub mode: String,
    pub priority: String,
    pub frame_skip: u64,
    pub min_area: f64,
    pub mirror: bool,
    pub static_lower: [u8; 3],
    pub static_upper: [u8; 3],
}

#[derive(Serialize)]
pub struct FrameLog {
    pub event: &'static str,
    pub timestamp: String,
    pub frame_index: u64,
    pub fps: f64,
    pub enemies: usize,
    pub allies: usize,
    pub dynamic_lower: [u8; 3],
    pub dynamic_upper: [u8; 3],
}

#[derive(Serialize)]
pub struct SummaryLog {
    pub event: &'static str,
    pub timestamp: String,
    pub captured: u64,
    pub processed: u64,
    pub outcome: String,
}

/// JSON-lines event log, one object per line.
pub struct EventJournal {
    writer: BufWriter<File>,
}

impl EventJournal {
    pub fn create(path: &Path) -> Result<Self> {
        let file =
            File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }

    pub fn write_event<T: Serialize>(&mut self, event: &T) -> Result<()> {
        serde_json::to_writer(&mut self.writer, event)?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

pub fn timestamp_now() -> String {
    chrono::Utc::now().to_rfc3339()
}
