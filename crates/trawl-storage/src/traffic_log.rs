//! Incrementally-read traffic log.
//!
//! The capture agent appends one JSON record per line to `traffic.jsonl`
//! while this store reads it. Reads pick up where the previous one stopped:
//!
//! - Only newline-terminated lines advance the read cursor.
//! - A trailing fragment is taken only if it already parses as a record,
//!   otherwise it is left for the next read.
//! - A file smaller than the cursor has been truncated by someone else and
//!   is re-read from the start.
//! - Lines that fail to parse are logged and skipped.
//!
//! The original text of every accepted line is kept alongside the parsed
//! record so that [`TrafficLogStore::clear`] writes survivors back verbatim.

use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};

use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use trawl_core::query::now_ms;
use trawl_core::{TrafficQuery, TrafficRecord, TrafficStats, TrafficSummary};

use crate::error::Result;

/// A page of query results.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryPage {
    /// Number of records matching the filters, before paging.
    pub total_matches: usize,
    /// Records on the requested page, newest first.
    pub entries: Vec<TrafficSummary>,
}

/// Result of a [`TrafficLogStore::clear`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClearOutcome {
    pub removed: usize,
    pub remaining: usize,
}

#[derive(Debug)]
struct StoredRecord {
    record: TrafficRecord,
    raw: String,
}

#[derive(Debug, Default)]
struct LogState {
    entries: Vec<StoredRecord>,
    read_position: u64,
}

impl LogState {
    fn reset(&mut self) {
        self.entries.clear();
        self.read_position = 0;
    }

    fn find(&self, id: &str) -> Option<&TrafficRecord> {
        self.entries
            .iter()
            .map(|e| &e.record)
            .find(|record| record.id == id)
    }
}

/// Cached view of one session's traffic log.
#[derive(Debug)]
pub struct TrafficLogStore {
    path: PathBuf,
    state: Mutex<LogState>,
}

impl TrafficLogStore {
    /// Creates a store for the log at `path`. Nothing is read yet.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            state: Mutex::new(LogState::default()),
        }
    }

    /// Returns the log file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Creates an empty log file if none exists.
    pub async fn initialize(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        Ok(())
    }

    /// Returns a page of matching records, newest first.
    pub async fn query(&self, query: &TrafficQuery) -> Result<QueryPage> {
        let mut state = self.state.lock().await;
        self.reload(&mut state).await?;

        let matcher = query.matcher();
        let mut matches: Vec<&TrafficRecord> = state
            .entries
            .iter()
            .map(|e| &e.record)
            .filter(|record| matcher(*record))
            .collect();
        matches.sort_by(|a, b| b.timestamp_ms.cmp(&a.timestamp_ms));

        let total_matches = matches.len();
        let entries = matches
            .into_iter()
            .skip(query.offset)
            .take(query.limit)
            .map(|record| {
                if query.include_body {
                    state
                        .find(&record.id)
                        .map(TrafficRecord::summary_with_bodies)
                        .unwrap_or_else(|| record.summary())
                } else {
                    record.summary()
                }
            })
            .collect();

        Ok(QueryPage {
            total_matches,
            entries,
        })
    }

    /// Looks up a record by id.
    pub async fn get_by_id(&self, id: &str) -> Result<Option<TrafficRecord>> {
        let mut state = self.state.lock().await;
        self.reload(&mut state).await?;
        Ok(state.find(id).cloned())
    }

    /// Removes records older than `before_ms`, or every record when `None`.
    ///
    /// The file is truncated and rewritten in place so that a writer holding
    /// it open in append mode keeps appending to the same file.
    pub async fn clear(&self, before_ms: Option<i64>) -> Result<ClearOutcome> {
        let mut state = self.state.lock().await;
        self.reload(&mut state).await?;

        let before = state.entries.len();
        match before_ms {
            Some(cutoff) => state.entries.retain(|e| e.record.timestamp_ms >= cutoff),
            None => state.entries.clear(),
        }
        let remaining = state.entries.len();

        let mut contents = state
            .entries
            .iter()
            .map(|e| e.raw.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        if !contents.is_empty() {
            contents.push('\n');
        }
        tokio::fs::write(&self.path, contents).await?;
        state.read_position = tokio::fs::metadata(&self.path).await?.len();

        let outcome = ClearOutcome {
            removed: before - remaining,
            remaining,
        };
        debug!(
            path = %self.path.display(),
            removed = outcome.removed,
            remaining = outcome.remaining,
            "Cleared traffic log"
        );
        Ok(outcome)
    }

    /// Aggregate numbers over the whole log.
    pub async fn stats(&self) -> Result<TrafficStats> {
        let mut state = self.state.lock().await;
        self.reload(&mut state).await?;
        Ok(TrafficStats::compute(
            state.entries.iter().map(|e| &e.record),
            now_ms(),
        ))
    }

    /// Number of records in the log.
    pub async fn count(&self) -> Result<usize> {
        let mut state = self.state.lock().await;
        self.reload(&mut state).await?;
        Ok(state.entries.len())
    }

    /// Drops the cache. A later read starts from the beginning of the file.
    pub async fn close(&self) {
        self.state.lock().await.reset();
    }

    async fn reload(&self, state: &mut LogState) -> Result<()> {
        let size = match tokio::fs::metadata(&self.path).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };

        if size == state.read_position {
            return Ok(());
        }
        if size < state.read_position {
            debug!(
                path = %self.path.display(),
                size,
                position = state.read_position,
                "Traffic log shrank, re-reading from start"
            );
            state.reset();
            if size == 0 {
                return Ok(());
            }
        }

        let mut file = tokio::fs::File::open(&self.path).await?;
        file.seek(SeekFrom::Start(state.read_position)).await?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).await?;

        let base = state.read_position;
        let complete = buf.iter().rposition(|b| *b == b'\n').map_or(0, |i| i + 1);

        let mut offset = 0;
        for line in buf[..complete].split(|b| *b == b'\n') {
            let line_offset = base + offset as u64;
            offset += line.len() + 1;
            if let Some(entry) = parse_line(line, line_offset, &self.path) {
                state.entries.push(entry);
            }
        }
        let mut consumed = complete;

        let tail = &buf[complete..];
        if !tail.is_empty() {
            if let Some(entry) = parse_fragment(tail) {
                state.entries.push(entry);
                consumed = buf.len();
            }
        }

        state.read_position = base + consumed as u64;
        Ok(())
    }
}

fn trim_line(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn parse_line(line: &[u8], offset: u64, path: &Path) -> Option<StoredRecord> {
    let line = trim_line(line);
    if line.iter().all(u8::is_ascii_whitespace) {
        return None;
    }
    let raw = match std::str::from_utf8(line) {
        Ok(raw) => raw,
        Err(e) => {
            warn!(path = %path.display(), offset, error = %e, "Skipping non-UTF-8 traffic line");
            return None;
        }
    };
    match serde_json::from_str::<TrafficRecord>(raw) {
        Ok(record) => Some(StoredRecord {
            record,
            raw: raw.to_string(),
        }),
        Err(e) => {
            warn!(path = %path.display(), offset, error = %e, "Skipping malformed traffic line");
            None
        }
    }
}

fn parse_fragment(tail: &[u8]) -> Option<StoredRecord> {
    let raw = std::str::from_utf8(trim_line(tail)).ok()?;
    let record = serde_json::from_str::<TrafficRecord>(raw).ok()?;
    Some(StoredRecord {
        record,
        raw: raw.to_string(),
    })
}
