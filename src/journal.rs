//! Append-only journal used to rebuild in-memory state after a restart.
//!
//! Each line is one JSON object tagged by `op`: `create` carries the full
//! record, `tombstone` marks a code deleted. Entries are replayed in file order.
//! The file is never rewritten or compacted. A line left unterminated by a
//! crash or a failed write is closed off before anything else is appended, so
//! the fragment stays a corrupt line of its own.

use crate::models::Redirect;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufReader};
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("failed to open journal {}: {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write journal {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read journal {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode journal entry: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum JournalEntry {
    Create(Redirect),
    Tombstone { code: String, at: DateTime<Utc> },
}

/// Writable handle on a journal file, opened in append mode.
#[derive(Debug)]
pub struct Journal {
    path: PathBuf,
    file: File,
    /// The file may end mid-line; the next append starts a fresh one.
    needs_newline: bool,
}

impl Journal {
    /// Open `path` for appending, creating it if missing.
    ///
    /// A torn last line is terminated right away.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, JournalError> {
        let path = path.as_ref().to_path_buf();
        let torn = has_torn_tail(&path)
            .await
            .map_err(|source| JournalError::Open {
                path: path.clone(),
                source,
            })?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|source| JournalError::Open {
                path: path.clone(),
                source,
            })?;

        let mut journal = Self {
            path,
            file,
            needs_newline: torn,
        };
        if torn {
            warn!(
                path = %journal.path.display(),
                "journal ends with a partial line, terminating it"
            );
            journal.write(Vec::new()).await?;
        }

        debug!(path = %journal.path.display(), "journal opened for append");
        Ok(journal)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append entries as one write. Returns once the bytes reach the OS.
    pub async fn append(&mut self, entries: &[JournalEntry]) -> Result<(), JournalError> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut buf = Vec::with_capacity(entries.len() * 256);
        for entry in entries {
            serde_json::to_writer(&mut buf, entry)?;
            buf.push(b'\n');
        }
        self.write(buf).await
    }

    async fn write(&mut self, mut buf: Vec<u8>) -> Result<(), JournalError> {
        if self.needs_newline {
            buf.insert(0, b'\n');
        }

        // Part of the buffer may have landed before a failure
        self.needs_newline = true;
        self.file
            .write_all(&buf)
            .await
            .map_err(|source| self.write_error(source))?;
        self.file
            .flush()
            .await
            .map_err(|source| self.write_error(source))?;
        self.needs_newline = false;
        Ok(())
    }

    /// Flush file contents to disk.
    pub async fn sync(&mut self) -> Result<(), JournalError> {
        self.file
            .sync_all()
            .await
            .map_err(|source| self.write_error(source))
    }

    fn write_error(&self, source: std::io::Error) -> JournalError {
        JournalError::Write {
            path: self.path.clone(),
            source,
        }
    }
}

/// Whether the file at `path` is non-empty and does not end in a newline.
async fn has_torn_tail(path: &Path) -> std::io::Result<bool> {
    let mut file = match File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };
    if file.metadata().await?.len() == 0 {
        return Ok(false);
    }

    file.seek(SeekFrom::End(-1)).await?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last).await?;
    Ok(last[0] != b'\n')
}

/// Result of reading a journal back.
#[derive(Debug, Default)]
pub struct Replay {
    pub entries: Vec<JournalEntry>,
    /// Lines that could not be decoded and were skipped.
    pub corrupt_lines: usize,
}

/// Read every entry of the journal at `path`.
///
/// A missing file is an empty journal. Undecodable lines are logged and
/// skipped; only I/O failures abort the replay.
pub async fn replay(path: impl AsRef<Path>) -> Result<Replay, JournalError> {
    let path = path.as_ref();
    let file = match File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Replay::default()),
        Err(source) => {
            return Err(JournalError::Open {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    let mut reader = BufReader::new(file);
    let mut replay = Replay::default();
    let mut line = Vec::new();
    let mut line_no = 0usize;

    loop {
        line.clear();
        let read = reader
            .read_until(b'\n', &mut line)
            .await
            .map_err(|source| JournalError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        if read == 0 {
            break;
        }
        line_no += 1;

        let trimmed = line.trim_ascii();
        if trimmed.is_empty() {
            continue;
        }

        match serde_json::from_slice::<JournalEntry>(trimmed) {
            Ok(entry) => replay.entries.push(entry),
            Err(err) => {
                warn!(
                    path = %path.display(),
                    line = line_no,
                    error = %err,
                    "skipping corrupt journal entry"
                );
                replay.corrupt_lines += 1;
            }
        }
    }

    Ok(replay)
}
