//! Durable event log and state snapshots
//!
//! The log (`events.jsonl`) is the source of truth: one serialized loggable
//! event per line, append-only. The snapshot (`state.json`) is a cache of the
//! current tree, rewritten after each finished round.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::bus::Listener;
use crate::error::SessionError;
use crate::event::Event;
use crate::state::SessionSnapshot;

pub const EVENTS_FILE: &str = "events.jsonl";
pub const STATE_FILE: &str = "state.json";

#[derive(Default)]
struct LogFile {
    file: Option<File>,
    /// Whether counts have been rebuilt from a pre-existing log
    counted: bool,
}

/// Appends loggable events to `{log_dir}/events.jsonl` and writes snapshots
/// to `{log_dir}/state.json`.
///
/// Nothing touches the filesystem until the first event is logged or the
/// first snapshot is written.
pub struct EventLogger {
    log_dir: PathBuf,
    clear_existing: bool,
    log: tokio::sync::Mutex<LogFile>,
    counts: Mutex<HashMap<String, u64>>,
    logged_any: AtomicBool,
    save_lock: tokio::sync::Mutex<()>,
    last_modified: Mutex<f64>,
}

impl EventLogger {
    pub fn new(log_dir: impl Into<PathBuf>, clear_existing: bool) -> Self {
        Self {
            log_dir: log_dir.into(),
            clear_existing,
            log: tokio::sync::Mutex::new(LogFile::default()),
            counts: Mutex::new(HashMap::new()),
            logged_any: AtomicBool::new(false),
            save_lock: tokio::sync::Mutex::new(()),
            last_modified: Mutex::new(crate::event::now_timestamp()),
        }
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    pub fn event_path(&self) -> PathBuf {
        self.log_dir.join(EVENTS_FILE)
    }

    pub fn state_path(&self) -> PathBuf {
        self.log_dir.join(STATE_FILE)
    }

    pub fn last_modified(&self) -> f64 {
        *self.last_modified.lock()
    }

    /// Events of one type logged so far, including those already on disk
    pub fn count_of(&self, event_type: &str) -> u64 {
        self.counts.lock().get(event_type).copied().unwrap_or(0)
    }

    /// Total events logged, including those already on disk.
    ///
    /// Counts of a pre-existing log are rebuilt on first use.
    pub async fn event_count(&self) -> u64 {
        let mut log = self.log.lock().await;
        if let Err(e) = self.ensure_counted(&mut log).await {
            warn!(log_dir = %self.log_dir.display(), error = %e, "Could not count existing events");
        }
        drop(log);
        self.total()
    }

    fn total(&self) -> u64 {
        self.counts.lock().values().sum()
    }

    async fn ensure_counted(&self, log: &mut LogFile) -> io::Result<()> {
        if log.counted {
            return Ok(());
        }
        log.counted = true;
        if self.clear_existing {
            return Ok(());
        }
        let path = self.event_path();
        if !fs::try_exists(&path).await? {
            return Ok(());
        }
        let existing: Vec<serde_json::Value> = read_jsonl(&path).await?;
        let mut counts = self.counts.lock();
        for record in existing {
            if let Some(kind) = record.get("type").and_then(|t| t.as_str()) {
                *counts.entry(kind.to_string()).or_insert(0) += 1;
            }
        }
        debug!(path = %path.display(), events = counts.values().sum::<u64>(), "Counted existing events");
        Ok(())
    }

    /// Append `event` to the log; non-loggable events are ignored
    pub async fn log_event(&self, event: &Event) -> io::Result<()> {
        if !event.is_loggable() {
            return Ok(());
        }
        let mut line = serde_json::to_vec(event).map_err(io::Error::other)?;
        line.push(b'\n');

        let mut log = self.log.lock().await;
        if log.file.is_none() {
            self.ensure_counted(&mut log).await?;
            fs::create_dir_all(&self.log_dir).await?;
            let mut options = OpenOptions::new();
            options.create(true);
            if self.clear_existing {
                options.write(true).truncate(true);
            } else {
                trim_partial_tail(&self.event_path()).await?;
                options.append(true);
            }
            log.file = Some(options.open(self.event_path()).await?);
            info!(path = %self.event_path().display(), "Opened event log");
        }
        if let Some(file) = log.file.as_mut() {
            file.write_all(&line).await?;
            file.flush().await?;
        }
        drop(log);

        *self.counts.lock().entry(event.event_type().to_string()).or_insert(0) += 1;
        *self.last_modified.lock() = event.timestamp;
        self.logged_any.store(true, Ordering::Release);
        Ok(())
    }

    /// Write `snapshot` to the state file, atomically replacing any old one
    pub async fn write_snapshot(&self, snapshot: &SessionSnapshot) -> io::Result<()> {
        let data = serde_json::to_vec_pretty(snapshot).map_err(io::Error::other)?;
        let _guard = self.save_lock.lock().await;
        fs::create_dir_all(&self.log_dir).await?;
        let tmp = self.log_dir.join(format!("{}.tmp", STATE_FILE));
        fs::write(&tmp, &data).await?;
        fs::rename(&tmp, self.state_path()).await?;
        *self.last_modified.lock() = snapshot.meta.last_modified;
        debug!(path = %self.state_path().display(), agents = snapshot.state.len(), "Wrote snapshot");
        Ok(())
    }

    /// Whether this logger has written at least one event
    pub fn has_logged(&self) -> bool {
        self.logged_any.load(Ordering::Acquire)
    }

    /// Write a final snapshot and release the log file.
    ///
    /// Does nothing if no event was ever logged, so throwaway sessions leave
    /// no directory behind.
    pub async fn close(&self, snapshot: &SessionSnapshot) -> io::Result<()> {
        if !self.has_logged() {
            debug!(log_dir = %self.log_dir.display(), "Nothing logged; skipping final snapshot");
            return Ok(());
        }
        self.write_snapshot(snapshot).await?;
        let mut log = self.log.lock().await;
        if let Some(mut file) = log.file.take() {
            file.flush().await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Listener for EventLogger {
    async fn on_event(&self, event: &Event) -> anyhow::Result<()> {
        self.log_event(event).await?;
        Ok(())
    }
}

/// Cut a log back to its last complete line.
///
/// A write cut short leaves a partial record at the end; appending after it
/// would bury the bad line mid-file where readers no longer tolerate it.
async fn trim_partial_tail(path: &Path) -> io::Result<()> {
    let data = match fs::read(path).await {
        Ok(data) => data,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    if data.last().map_or(true, |b| *b == b'\n') {
        return Ok(());
    }
    let keep = data.iter().rposition(|b| *b == b'\n').map_or(0, |i| i + 1);
    warn!(
        path = %path.display(),
        dropped_bytes = data.len() - keep,
        "Dropping partial record at end of log"
    );
    let file = OpenOptions::new().write(true).open(path).await?;
    file.set_len(keep as u64).await?;
    file.sync_all().await?;
    Ok(())
}

/// Parse a JSON-lines file.
///
/// A final line that fails to parse is treated as a write cut short and
/// dropped; a bad line anywhere else is an error.
pub async fn read_jsonl<T: DeserializeOwned>(path: &Path) -> io::Result<Vec<T>> {
    let text = fs::read_to_string(path).await?;
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let mut records = Vec::with_capacity(lines.len());
    for (index, line) in lines.iter().enumerate() {
        match serde_json::from_str(line) {
            Ok(record) => records.push(record),
            Err(e) if index + 1 == lines.len() => {
                warn!(path = %path.display(), error = %e, "Ignoring truncated last line");
            }
            Err(e) => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("{}:{}: {}", path.display(), index + 1, e),
                ))
            }
        }
    }
    Ok(records)
}

/// Every event in a log file, in order
pub async fn read_event_log(path: &Path) -> Result<Vec<Event>, SessionError> {
    Ok(read_jsonl(path).await?)
}

/// The snapshot stored in `path`
pub async fn read_snapshot(path: &Path) -> Result<SessionSnapshot, SessionError> {
    let data = fs::read(path).await?;
    Ok(serde_json::from_slice(&data)?)
}
