//! Record write items.
//!
//! Each record key maps to one file, `<dir>/<key>.json`.  Writes go through a
//! temporary file in the same directory and are renamed into place, so a
//! reader never sees a half-written record.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use lazywrite_queue::{MergeableItem, WriteItem};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::debug;

/// Check that `key` can be used as a file stem inside the output directory.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        anyhow::bail!("record key is empty");
    }
    if key.contains(['/', '\\', '\0']) {
        anyhow::bail!("record key `{key}` contains a path separator");
    }
    if key.starts_with('.') {
        anyhow::bail!("record key `{key}` starts with a dot");
    }
    Ok(())
}

pub fn record_path(dir: &Path, key: &str) -> PathBuf {
    dir.join(format!("{key}.json"))
}

// ---------------------------------------------------------------------------
// Put
// ---------------------------------------------------------------------------

/// Persist the latest value of one record.
#[derive(Debug)]
pub struct RecordWrite {
    key: String,
    dir: PathBuf,
    value: Mutex<Value>,
    /// Intent log line that created this item.
    origin_line: usize,
}

impl RecordWrite {
    pub fn new(dir: &Path, key: impl Into<String>, value: Value, origin_line: usize) -> Self {
        Self {
            key: key.into(),
            dir: dir.to_path_buf(),
            value: Mutex::new(value),
            origin_line,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn origin_line(&self) -> usize {
        self.origin_line
    }

    pub fn value(&self) -> Value {
        self.value.lock().clone()
    }
}

impl WriteItem for RecordWrite {
    fn process(&self) -> Result<()> {
        let value = self.value();
        let path = record_path(&self.dir, &self.key);

        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)
            .with_context(|| format!("failed to create temp file in {}", self.dir.display()))?;
        serde_json::to_writer_pretty(&mut tmp, &value)
            .with_context(|| format!("failed to serialize record `{}`", self.key))?;
        tmp.write_all(b"\n")?;
        tmp.as_file()
            .sync_all()
            .with_context(|| format!("failed to sync record `{}`", self.key))?;
        tmp.persist(&path)
            .map_err(|e| e.error)
            .with_context(|| format!("failed to move record into {}", path.display()))?;

        debug!(key = %self.key, path = %path.display(), "record written");
        Ok(())
    }
}

impl MergeableItem for RecordWrite {
    fn matches(&self, other: &Self) -> bool {
        self.key == other.key && self.dir == other.dir
    }

    fn update_from(&self, other: &Self) {
        *self.value.lock() = other.value();
    }
}

// ---------------------------------------------------------------------------
// Delete
// ---------------------------------------------------------------------------

/// Remove one record file.  A record that was never written is not an error.
#[derive(Debug)]
pub struct RecordDelete {
    key: String,
    dir: PathBuf,
}

impl RecordDelete {
    pub fn new(dir: &Path, key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            dir: dir.to_path_buf(),
        }
    }
}

impl WriteItem for RecordDelete {
    fn process(&self) -> Result<()> {
        let path = record_path(&self.dir, &self.key);
        match std::fs::remove_file(&path) {
            Ok(()) => {
                debug!(key = %self.key, "record deleted");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(key = %self.key, "record already absent");
                Ok(())
            }
            Err(e) => {
                Err(e).with_context(|| format!("failed to delete {}", path.display()))
            }
        }
    }
}
