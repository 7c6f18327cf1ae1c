use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventAction {
    CapturedFrame,
}

/// Durable record of one accepted detection. One JSON object per line.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DetectionEvent {
    pub frame_id: u64,
    pub timestamp: DateTime<Utc>,
    pub label: String,
    /// `[x1, y1, x2, y2]` in frame pixels.
    pub bbox: [u32; 4],
    pub action: EventAction,
    #[serde(default)]
    pub confidence: f32,
    /// File name of the crop this event refers to.
    #[serde(default)]
    pub artifact: String,
}

/// Append-only NDJSON event log.
///
/// Timestamps are clamped so they never go backwards, including across
/// restarts against an existing log.
pub struct EventLog {
    path: PathBuf,
    file: File,
    last_timestamp: Option<DateTime<Utc>>,
    appended: u64,
}

impl EventLog {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create event log directory {}", parent.display()))?;
        }
        let last_timestamp = if path.exists() {
            let dropped = truncate_torn_tail(&path)?;
            if dropped > 0 {
                log::warn!(
                    "event log {}: dropped {} bytes of an interrupted write",
                    path.display(),
                    dropped
                );
            }
            latest_event(&path)?.map(|event| event.timestamp)
        } else {
            None
        };
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open event log {}", path.display()))?;
        Ok(Self {
            path,
            file,
            last_timestamp,
            appended: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn appended(&self) -> u64 {
        self.appended
    }

    /// Next timestamp: now, or the previous one if the clock stepped back.
    pub fn next_timestamp(&self) -> DateTime<Utc> {
        let now = Utc::now();
        match self.last_timestamp {
            Some(last) if last > now => last,
            _ => now,
        }
    }

    /// Write one event as a single line and flush it to disk.
    pub fn append(&mut self, event: &DetectionEvent) -> std::io::Result<()> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');
        self.file.write_all(&line)?;
        self.file.sync_data()?;
        self.last_timestamp = Some(event.timestamp);
        self.appended += 1;
        Ok(())
    }
}

/// Cut the file back to its last newline so the next append starts on a
/// fresh line. Returns the number of bytes removed.
fn truncate_torn_tail(path: &Path) -> Result<u64> {
    let raw = std::fs::read(path).with_context(|| format!("read event log {}", path.display()))?;
    let keep = match raw.iter().rposition(|b| *b == b'\n') {
        Some(idx) => idx + 1,
        None => 0,
    };
    if keep == raw.len() {
        return Ok(0);
    }
    let file = OpenOptions::new()
        .write(true)
        .open(path)
        .with_context(|| format!("open event log {}", path.display()))?;
    file.set_len(keep as u64)
        .with_context(|| format!("truncate event log {}", path.display()))?;
    file.sync_data()?;
    Ok((raw.len() - keep) as u64)
}

/// All complete events in `path`, in append order.
///
/// A trailing line without a newline is a write in progress and is skipped.
/// Lines that do not parse are logged and skipped.
pub fn read_events(path: &Path) -> Result<Vec<DetectionEvent>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read event log {}", path.display()))?;
    let complete = match raw.rfind('\n') {
        Some(idx) => &raw[..idx],
        None => "",
    };
    let mut events = Vec::new();
    for (idx, line) in complete.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(line) {
            Ok(event) => events.push(event),
            Err(err) => log::warn!(
                "{}:{}: skipping invalid event: {}",
                path.display(),
                idx + 1,
                err
            ),
        }
    }
    Ok(events)
}

/// Last complete event, if any.
pub fn latest_event(path: &Path) -> Result<Option<DetectionEvent>> {
    if !path.exists() {
        return Ok(None);
    }
    Ok(read_events(path)?.pop())
}
