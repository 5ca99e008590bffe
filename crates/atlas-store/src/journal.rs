//! JSON Lines change journal.
//!
//! Every committed change is appended as one JSON object per line to a
//! daily file (`changes_YYYY-MM-DD.jsonl`). Lines are independent, so an
//! interrupted write only loses the last line; unreadable lines are
//! skipped on replay.

use crate::error::StoreResult;
use crate::store::Change;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

struct ActiveFile {
    writer: BufWriter<File>,
    date: String,
    records_written: usize,
}

/// Append-only change journal.
pub struct JournalWriter {
    base_dir: PathBuf,
    active: Option<ActiveFile>,
}

impl JournalWriter {
    /// Open a journal rooted at `base_dir`, creating the directory.
    pub fn new(base_dir: impl AsRef<Path>) -> StoreResult<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&base_dir)?;
        Ok(Self {
            base_dir,
            active: None,
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn file_for(&self, date: &str) -> PathBuf {
        self.base_dir.join(format!("changes_{date}.jsonl"))
    }

    fn close_active(&mut self) {
        if let Some(mut active) = self.active.take() {
            if let Err(e) = active.writer.flush() {
                warn!(?e, "Failed to flush journal on close");
            }
            info!(
                date = %active.date,
                records = active.records_written,
                "Closed journal file"
            );
        }
    }

    fn open(&mut self, date: &str) -> StoreResult<()> {
        let path = self.file_for(date);
        info!(path = %path.display(), "Opening journal file (append mode)");
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        self.active = Some(ActiveFile {
            writer: BufWriter::new(file),
            date: date.to_string(),
            records_written: 0,
        });
        Ok(())
    }

    /// Append one change, rotating on the change's UTC date.
    pub fn append(&mut self, change: &Change) -> StoreResult<()> {
        let date = change.at.format("%Y-%m-%d").to_string();
        if self.active.as_ref().is_some_and(|a| a.date != date) {
            self.close_active();
        }
        if self.active.is_none() {
            self.open(&date)?;
        }
        let line = serde_json::to_string(change)?;
        if let Some(active) = self.active.as_mut() {
            writeln!(active.writer, "{line}")?;
            active.writer.flush()?;
            active.records_written += 1;
        }
        debug!(table = %change.table, key = %change.key, "Journaled change");
        Ok(())
    }
}

impl Drop for JournalWriter {
    fn drop(&mut self) {
        self.close_active();
    }
}

/// Read every journaled change under `base_dir`, oldest file first.
pub fn read_journal(base_dir: impl AsRef<Path>) -> StoreResult<Vec<Change>> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(base_dir.as_ref())?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("changes_") && n.ends_with(".jsonl"))
        })
        .collect();
    files.sort();

    let mut changes = Vec::new();
    for path in files {
        let reader = BufReader::new(File::open(&path)?);
        for (line_no, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Change>(&line) {
                Ok(change) => changes.push(change),
                Err(e) => warn!(
                    path = %path.display(),
                    line = line_no + 1,
                    error = %e,
                    "Skipping unreadable journal line"
                ),
            }
        }
    }
    Ok(changes)
}
