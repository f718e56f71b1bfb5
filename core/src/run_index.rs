//! Durable record of processes that may still be alive, used only to recover
//! after the manager restarts.
//!
//! On disk this is a single JSON object keyed by script id:
//!
//! ```json
//! { "build": { "processIdentifier": 4242, "startedAtEpochSeconds": 1718000000.25 } }
//! ```
//!
//! The layout is read on every startup, so it must stay stable.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;
use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

use crate::script::ScriptId;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedRunEntry {
    pub process_identifier: u32,
    pub started_at_epoch_seconds: f64,
}

impl PersistedRunEntry {
    pub fn new(pid: u32, started_at: DateTime<Utc>) -> Self {
        Self {
            process_identifier: pid,
            started_at_epoch_seconds: started_at.timestamp_micros() as f64 / 1_000_000.0,
        }
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        let micros = (self.started_at_epoch_seconds * 1_000_000.0).round();
        if !micros.is_finite() {
            return None;
        }
        DateTime::from_timestamp_micros(micros as i64)
    }
}

#[derive(Debug, Default)]
pub struct PersistentRunIndex {
    /// `None` keeps the index in memory only.
    path: Option<PathBuf>,
    entries: BTreeMap<ScriptId, PersistedRunEntry>,
}

impl PersistentRunIndex {
    /// Opens the index at `path`. A missing or empty file is an empty index.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = if path.exists() {
            let data = fs::read(&path)
                .with_context(|| format!("Failed to read run index: {}", path.display()))?;
            if data.iter().all(u8::is_ascii_whitespace) {
                BTreeMap::new()
            } else {
                serde_json::from_slice::<BTreeMap<ScriptId, PersistedRunEntry>>(&data)
                    .with_context(|| format!("Invalid run index format: {}", path.display()))?
            }
        } else {
            if let Some(dir) = path.parent()
                && !dir.as_os_str().is_empty()
            {
                fs::create_dir_all(dir).with_context(|| {
                    format!("Failed to create run index directory: {}", dir.display())
                })?;
            }
            BTreeMap::new()
        };
        Ok(Self {
            path: Some(path),
            entries,
        })
    }

    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn entries(&self) -> &BTreeMap<ScriptId, PersistedRunEntry> {
        &self.entries
    }

    pub fn get(&self, id: &ScriptId) -> Option<PersistedRunEntry> {
        self.entries.get(id).copied()
    }

    /// Updates memory first, then the file. On a write error the in-memory
    /// view still reflects the change.
    pub fn record(&mut self, id: &ScriptId, entry: PersistedRunEntry) -> Result<()> {
        self.entries.insert(id.clone(), entry);
        self.save()
    }

    /// Returns whether an entry was present. Absent entries cause no write.
    pub fn remove(&mut self, id: &ScriptId) -> Result<bool> {
        if self.entries.remove(id).is_none() {
            return Ok(false);
        }
        self.save()?;
        Ok(true)
    }

    /// Keeps entries matching `keep` and returns the ids that were dropped.
    pub fn retain<F>(&mut self, mut keep: F) -> Result<Vec<ScriptId>>
    where
        F: FnMut(&ScriptId, &PersistedRunEntry) -> bool,
    {
        let mut removed = Vec::new();
        self.entries.retain(|id, entry| {
            if keep(id, entry) {
                true
            } else {
                removed.push(id.clone());
                false
            }
        });
        if !removed.is_empty() {
            self.save()?;
        }
        Ok(removed)
    }

    fn save(&self) -> Result<()> {
        let Some(path) = self.path.as_deref() else {
            return Ok(());
        };
        let data =
            serde_json::to_vec_pretty(&self.entries).context("Failed to serialise run index")?;

        // Write next to the target and rename so readers never see a torn file.
        let dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .with_context(|| format!("Failed to create temp file in {}", dir.display()))?;
        tmp.write_all(&data)
            .and_then(|()| tmp.as_file().sync_all())
            .with_context(|| format!("Failed to write run index: {}", path.display()))?;
        tmp.persist(path)
            .with_context(|| format!("Failed to replace run index: {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    fn entry(pid: u32, secs: f64) -> PersistedRunEntry {
        PersistedRunEntry {
            process_identifier: pid,
            started_at_epoch_seconds: secs,
        }
    }

    #[test]
    fn written_entries_read_back_identically() {
        let dir = tempdir().expect("tmp");
        let path = dir.path().join("index.json");
        let mut index = PersistentRunIndex::open(&path).expect("open");
        index
            .record(&ScriptId::new("a"), entry(100, 1_700_000_000.5))
            .expect("record a");
        index
            .record(&ScriptId::new("b"), entry(200, 1_700_000_123.0))
            .expect("record b");

        let reopened = PersistentRunIndex::open(&path).expect("reopen");
        assert_eq!(reopened.entries(), index.entries());
    }

    #[test]
    fn uses_stable_field_names() {
        let dir = tempdir().expect("tmp");
        let path = dir.path().join("index.json");
        let mut index = PersistentRunIndex::open(&path).expect("open");
        index
            .record(&ScriptId::new("x"), entry(4242, 12.0))
            .expect("record");

        let raw: serde_json::Value =
            serde_json::from_slice(&fs::read(&path).expect("read")).expect("json");
        assert_eq!(
            raw,
            serde_json::json!({
                "x": { "processIdentifier": 4242, "startedAtEpochSeconds": 12.0 }
            })
        );
    }

    #[test]
    fn empty_and_missing_files_are_empty_indexes() {
        let dir = tempdir().expect("tmp");
        let missing = PersistentRunIndex::open(dir.path().join("nested/index.json"))
            .expect("open missing");
        assert!(missing.entries().is_empty());
        assert!(dir.path().join("nested").is_dir());

        let blank = dir.path().join("blank.json");
        fs::write(&blank, "  \n").expect("write");
        assert!(
            PersistentRunIndex::open(&blank)
                .expect("open blank")
                .entries()
                .is_empty()
        );
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let dir = tempdir().expect("tmp");
        let path = dir.path().join("index.json");
        fs::write(&path, "{not json").expect("write");
        assert!(PersistentRunIndex::open(&path).is_err());
    }

    #[test]
    fn remove_and_retain_persist() {
        let dir = tempdir().expect("tmp");
        let path = dir.path().join("index.json");
        let mut index = PersistentRunIndex::open(&path).expect("open");
        for (id, pid) in [("a", 1), ("b", 2), ("c", 3)] {
            index
                .record(&ScriptId::new(id), entry(pid, 0.0))
                .expect("record");
        }

        assert!(index.remove(&ScriptId::new("a")).expect("remove"));
        assert!(!index.remove(&ScriptId::new("a")).expect("remove again"));

        let dropped = index
            .retain(|_, entry| entry.process_identifier != 3)
            .expect("retain");
        assert_eq!(dropped, vec![ScriptId::new("c")]);

        let reopened = PersistentRunIndex::open(&path).expect("reopen");
        let ids: Vec<_> = reopened.entries().keys().cloned().collect();
        assert_eq!(ids, vec![ScriptId::new("b")]);
    }

    #[test]
    fn in_memory_index_never_touches_disk() {
        let mut index = PersistentRunIndex::in_memory();
        index
            .record(&ScriptId::new("a"), entry(1, 0.0))
            .expect("record");
        assert!(index.path().is_none());
        assert_eq!(index.get(&ScriptId::new("a")), Some(entry(1, 0.0)));
    }

    #[test]
    fn start_time_converts_to_datetime() {
        let started = DateTime::from_timestamp(1_700_000_000, 250_000_000).expect("ts");
        let entry = PersistedRunEntry::new(7, started);
        assert_eq!(entry.started_at_epoch_seconds, 1_700_000_000.25);
        assert_eq!(entry.started_at(), Some(started));
    }
}
