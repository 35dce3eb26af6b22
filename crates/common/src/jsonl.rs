//! Append-only JSONL file writer shared by the audit log and the LLM
//! interaction log.

use std::{
    fs::OpenOptions,
    io::Write,
    path::{Path, PathBuf},
};

use {serde::Serialize, tracing::warn};

/// Appends serialized records to a file, one JSON object per line.
///
/// Each append opens the file with `O_APPEND` semantics and writes a single
/// `\n`-terminated line, so concurrent writers from one process never
/// interleave partial lines.
pub struct JsonlWriter {
    path: PathBuf,
}

impl JsonlWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record. Errors are returned so callers can decide whether
    /// the write is best-effort (audit log) or fatal (artifacts).
    pub fn append<T: Serialize>(&self, record: &T) -> std::io::Result<()> {
        let mut line = serde_json::to_string(record)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        line.push('\n');

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())
    }

    /// Append one record, logging failures instead of propagating them.
    pub fn append_best_effort<T: Serialize>(&self, record: &T) {
        if let Err(e) = self.append(record) {
            warn!(path = %self.path.display(), error = %e, "JSONL append failed");
        }
    }
}
