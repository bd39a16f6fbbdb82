//! Durable experiment records (`.em/state/<name>.json`).
//!
//! One file per experiment keeps each mutation a single atomic rename. The
//! store assumes one writer at a time: there is no cross-process locking, and
//! two invocations racing on the same name can lose an update.

use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

use crate::core::error::EmError;
use crate::core::selector::select_by_pattern;
use crate::core::types::ExperimentRecord;

const RECORD_EXT: &str = "json";

/// Handle to a project's experiment records.
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    /// Open the store in `dir`, which must already exist.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        if !dir.is_dir() {
            return Err(EmError::NotAProject(dir).into());
        }
        Ok(Self { dir })
    }

    /// Release the handle. Every mutation is already on disk when it returns,
    /// so there is nothing to flush.
    pub fn close(self) {}

    fn record_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.{RECORD_EXT}"))
    }

    pub fn get(&self, name: &str) -> Result<Option<ExperimentRecord>> {
        let path = self.record_path(name);
        if !path.exists() {
            return Ok(None);
        }
        load_record(&path).map(Some)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.record_path(name).exists()
    }

    /// Replace the record for `name`.
    pub fn put(&self, name: &str, record: &ExperimentRecord) -> Result<()> {
        debug!(name, status = %record.status, pid = ?record.pid, "writing record");
        let mut buf = serde_json::to_string_pretty(record).context("serialize record")?;
        buf.push('\n');
        write_durable(&self.record_path(name), &buf)
    }

    /// Read-modify-write: apply `update` to the existing record (or a fresh
    /// `starting` one) and persist the result before returning it.
    pub fn upsert<F>(&self, name: &str, update: F) -> Result<ExperimentRecord>
    where
        F: FnOnce(&mut ExperimentRecord),
    {
        let mut record = self.get(name)?.unwrap_or_default();
        update(&mut record);
        self.put(name, &record)?;
        Ok(record)
    }

    /// Delete the record; absent records are ignored.
    pub fn remove(&self, name: &str) -> Result<()> {
        let path = self.record_path(name);
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(name, "record removed");
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("remove record {}", path.display())),
        }
    }

    /// Move a record to a new key.
    pub fn rename(&self, from: &str, to: &str) -> Result<()> {
        let src = self.record_path(from);
        let dst = self.record_path(to);
        fs::rename(&src, &dst)
            .with_context(|| format!("move record {} -> {}", src.display(), dst.display()))
    }

    /// Lazily iterate over `(name, record)` pairs. Each call re-reads the
    /// directory; order is unspecified.
    pub fn list(&self) -> Result<impl Iterator<Item = Result<(String, ExperimentRecord)>> + '_> {
        let entries = fs::read_dir(&self.dir)
            .with_context(|| format!("read state dir {}", self.dir.display()))?;
        Ok(entries.filter_map(|entry| {
            let path = match entry {
                Ok(entry) => entry.path(),
                Err(err) => return Some(Err(anyhow::Error::new(err).context("read state entry"))),
            };
            let name = record_name(&path)?;
            Some(load_record(&path).map(|record| (name, record)))
        }))
    }

    /// All experiment names in lexicographic order.
    pub fn names(&self) -> Result<BTreeSet<String>> {
        let entries = fs::read_dir(&self.dir)
            .with_context(|| format!("read state dir {}", self.dir.display()))?;
        let mut names = BTreeSet::new();
        for entry in entries {
            let entry = entry.context("read state entry")?;
            if let Some(name) = record_name(&entry.path()) {
                names.insert(name);
            }
        }
        Ok(names)
    }

    /// Names matching any `include` glob and no `exclude` glob.
    pub fn select_by_pattern(&self, include: &[String], exclude: &[String]) -> Result<BTreeSet<String>> {
        select_by_pattern(self.names()?, include, exclude)
    }
}

fn record_name(path: &Path) -> Option<String> {
    if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXT) {
        return None;
    }
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .map(str::to_string)
}

fn load_record(path: &Path) -> Result<ExperimentRecord> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read record {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse record {}", path.display()))
}

/// Write to a temp file, fsync it, then rename over `path`.
fn write_durable(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("record path missing parent {}", path.display()))?;
    let tmp_path = path.with_extension("json.tmp");
    let mut file = File::create(&tmp_path)
        .with_context(|| format!("create temp record {}", tmp_path.display()))?;
    file.write_all(contents.as_bytes())
        .with_context(|| format!("write temp record {}", tmp_path.display()))?;
    file.sync_all()
        .with_context(|| format!("sync temp record {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace record {}", path.display()))?;
    if let Ok(dir) = File::open(parent) {
        let _ = dir.sync_all();
    }
    Ok(())
}
