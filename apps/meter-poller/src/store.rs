//! File-backed persistence for restored sensor state and the historical log.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::model::{HistoricalLogEntry, RestoredState};

pub trait StateStore: Send + Sync {
    fn load(&self, sensor_id: &str) -> Result<Option<RestoredState>>;
    fn save(&self, sensor_id: &str, state: &RestoredState) -> Result<()>;
}

/// Append-only log keyed by `period_start`. Already recorded periods are ignored.
pub trait HistoricalLog: Send + Sync {
    /// Returns how many entries were newly recorded.
    fn append(&self, entries: &[HistoricalLogEntry]) -> Result<usize>;
    fn latest(&self) -> Option<HistoricalLogEntry>;
    fn entries_since(&self, since: Option<DateTime<Utc>>) -> Vec<HistoricalLogEntry>;
}

/// Loads persisted state, treating an unreadable file as absent so the sensor refreshes.
pub fn load_or_absent(store: &dyn StateStore, sensor_id: &str) -> Option<RestoredState> {
    match store.load(sensor_id) {
        Ok(state) => state,
        Err(err) => {
            tracing::warn!(sensor = %sensor_id, error = %err, "ignoring unreadable persisted state");
            None
        }
    }
}

#[derive(Debug, Clone)]
pub struct FileStateStore {
    dir: PathBuf,
}

impl FileStateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("create state dir {}", dir.display()))?;
        Ok(Self { dir })
    }

    fn path_for(&self, sensor_id: &str) -> PathBuf {
        let safe: String = sensor_id
            .chars()
            .map(|ch| {
                if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                    ch
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{safe}.state.json"))
    }
}

impl StateStore for FileStateStore {
    fn load(&self, sensor_id: &str) -> Result<Option<RestoredState>> {
        let path = self.path_for(sensor_id);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path).context("read sensor state")?;
        let parsed: RestoredState = serde_json::from_str(&raw).context("parse sensor state")?;
        Ok(Some(parsed))
    }

    fn save(&self, sensor_id: &str, state: &RestoredState) -> Result<()> {
        let path = self.path_for(sensor_id);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(state)?).context("write sensor state tmp")?;
        fs::rename(&tmp, &path).context("rename sensor state")?;
        Ok(())
    }
}

#[derive(Debug)]
pub struct JsonlHistoricalLog {
    path: PathBuf,
    entries: Mutex<BTreeMap<DateTime<Utc>, HistoricalLogEntry>>,
}

impl JsonlHistoricalLog {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create log dir {}", parent.display()))?;
        }
        recover_torn_tail(&path)?;
        let entries = load_entries(&path)?;
        tracing::debug!(path = %path.display(), entries = entries.len(), "historical log opened");
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

}

/// Drops a partially written final line so later appends start on a fresh line.
fn recover_torn_tail(path: &Path) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }
    let raw = fs::read(path).context("read historical log")?;
    if raw.is_empty() || raw.ends_with(b"\n") {
        return Ok(());
    }
    let keep = raw
        .iter()
        .rposition(|byte| *byte == b'\n')
        .map(|pos| pos + 1)
        .unwrap_or(0);
    let mut file = fs::OpenOptions::new()
        .write(true)
        .append(true)
        .open(path)
        .context("open historical log")?;
    if serde_json::from_slice::<HistoricalLogEntry>(&raw[keep..]).is_ok() {
        file.write_all(b"\n").context("terminate historical log")?;
    } else {
        tracing::warn!(
            path = %path.display(),
            dropped_bytes = raw.len() - keep,
            "truncating torn historical log tail"
        );
        file.set_len(keep as u64).context("truncate historical log")?;
    }
    Ok(())
}

fn load_entries(path: &Path) -> Result<BTreeMap<DateTime<Utc>, HistoricalLogEntry>> {
    let mut entries = BTreeMap::new();
    if !path.exists() {
        return Ok(entries);
    }
    let raw = fs::read_to_string(path).context("read historical log")?;
    for (idx, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<HistoricalLogEntry>(line) {
            Ok(entry) => {
                entries.entry(entry.period_start).or_insert(entry);
            }
            Err(err) => {
                tracing::warn!(line = idx + 1, error = %err, "skipping unreadable historical log line");
            }
        }
    }
    Ok(entries)
}

impl HistoricalLog for JsonlHistoricalLog {
    fn append(&self, entries: &[HistoricalLogEntry]) -> Result<usize> {
        let mut recorded = self
            .entries
            .lock()
            .map_err(|_| anyhow!("historical log lock poisoned"))?;

        let mut fresh: Vec<&HistoricalLogEntry> = Vec::new();
        for entry in entries {
            if recorded.contains_key(&entry.period_start)
                || fresh.iter().any(|seen| seen.period_start == entry.period_start)
            {
                continue;
            }
            fresh.push(entry);
        }
        if fresh.is_empty() {
            return Ok(0);
        }

        let mut buf = String::new();
        for entry in &fresh {
            buf.push_str(&serde_json::to_string(entry)?);
            buf.push('\n');
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .context("open historical log")?;
        file.write_all(buf.as_bytes())
            .context("append historical log")?;
        file.sync_data().context("sync historical log")?;

        for entry in &fresh {
            recorded.insert(entry.period_start, **entry);
        }
        Ok(fresh.len())
    }

    fn latest(&self) -> Option<HistoricalLogEntry> {
        let recorded = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        recorded.values().next_back().copied()
    }

    fn entries_since(&self, since: Option<DateTime<Utc>>) -> Vec<HistoricalLogEntry> {
        let recorded = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        match since {
            Some(since) => recorded.range(since..).map(|(_, entry)| *entry).collect(),
            None => recorded.values().copied().collect(),
        }
    }
}
