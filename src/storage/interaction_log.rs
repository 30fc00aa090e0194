//! Interaction log
//!
//! Append-only JSON-lines file holding every completed interaction. It is the
//! only record of history: there is no index, and every read replays the
//! whole file. That keeps writes trivially durable but makes reads O(file),
//! which is fine for a single-user vault and nothing more.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, SecondsFormat, Utc};

use crate::storage::{ensure_parent_dir, LogWriteError, StorageError};
use crate::types::record::{Conversation, LogRecord};

/// Default location, relative to the working directory
pub const DEFAULT_LOG_PATH: &str = "logs/log.jsonl";

/// Single-writer append-only log of interactions.
#[derive(Debug)]
pub struct InteractionLog {
    path: PathBuf,
    /// Serializes appends and remembers the last timestamp handed out.
    writer: Mutex<Option<DateTime<Utc>>>,
}

impl InteractionLog {
    /// Opens the log at `path`, creating the directory and the file if absent.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        ensure_parent_dir(&path)?;
        OpenOptions::new().create(true).append(true).open(&path)?;

        tracing::info!("Interaction log at: {}", path.display());

        Ok(Self {
            path,
            writer: Mutex::new(None),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stamps and appends a new record.
    ///
    /// Timestamps never go backwards, even if the wall clock does.
    pub fn record(
        &self,
        prompt: &str,
        response: &str,
        model: Option<&str>,
    ) -> Result<LogRecord, LogWriteError> {
        let mut last = self.writer.lock().unwrap_or_else(PoisonError::into_inner);

        let now = Utc::now();
        let stamp = match *last {
            Some(previous) if previous > now => previous,
            _ => now,
        };

        let record = LogRecord {
            timestamp: stamp.to_rfc3339_opts(SecondsFormat::Micros, true),
            prompt: prompt.to_string(),
            response: response.to_string(),
            model: model.map(str::to_string),
        };

        self.write_line(&record)?;
        *last = Some(stamp);
        Ok(record)
    }

    /// Appends a pre-built record verbatim.
    pub fn append(&self, record: &LogRecord) -> Result<(), LogWriteError> {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        self.write_line(record)
    }

    /// Caller must hold the writer lock.
    fn write_line(&self, record: &LogRecord) -> Result<(), LogWriteError> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        ensure_parent_dir(&self.path)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        // One write per record so a line is never split between appenders.
        file.write_all(line.as_bytes())?;
        file.sync_data()?;

        tracing::debug!("Logged interaction ({} bytes)", line.len());
        Ok(())
    }

    /// Every readable record, most recent first.
    ///
    /// Malformed lines are skipped with a warning. Ids are line positions and
    /// shift if the file is ever rewritten.
    pub fn list_all(&self) -> Result<Vec<Conversation>, StorageError> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(e.into()),
        };

        let mut conversations = vec![];

        for (index, line) in BufReader::new(file).split(b'\n').enumerate() {
            let line = line?;
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }

            match serde_json::from_slice::<LogRecord>(&line) {
                Ok(record) => conversations.push(Conversation::from_record(index, record)),
                Err(e) => {
                    tracing::warn!(
                        "Skipping malformed line {} in {}: {}",
                        index,
                        self.path.display(),
                        e
                    );
                }
            }
        }

        conversations.reverse();
        Ok(conversations)
    }
}
