//! Append-only, hash-chained log of instance teardowns.
//!
//! Stored at `<state_dir>/cleanup.jsonl`. Every attempt to remove an
//! isolated instance, whether from the request path or the reaper, appends
//! exactly one record. Records are never rewritten.
//!
//! # Format
//!
//! One JSON object per line (JSONL):
//!
//! | Field | Description |
//! |-------|-------------|
//! | `ts` | RFC 3339 timestamp of the attempt |
//! | `handle` | Instance name, plus request id and creation time when known |
//! | `outcome` | `removed`, `already_gone` or `failed` |
//! | `source` | `request` or `reaper` |
//! | `detail` | Error text for failed attempts |
//! | `prev_entry_sha256` | SHA-256 of the previous raw line (chain link) |
//!
//! The first entry links to 64 zeros. Appends hold an exclusive `flock`
//! on the log file for the read-last-line/write sequence, so concurrent
//! writers in different threads or processes cannot fork the chain. Only
//! the tail of the file is read on append.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::digest::sha256_hex;

mod teardown;
pub use teardown::remove_and_record;

pub const CLEANUP_LOG_FILENAME: &str = "cleanup.jsonl";

/// Chain link of the first entry.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CleanupOutcome {
    Removed,
    /// The instance no longer existed when removal was attempted.
    AlreadyGone,
    Failed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CleanupSource {
    Request,
    Reaper,
}

/// Identifies the instance a record refers to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HandleRef {
    pub instance: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CleanupRecord {
    pub ts: DateTime<Utc>,
    pub handle: HandleRef,
    pub outcome: CleanupOutcome,
    pub source: CleanupSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl CleanupRecord {
    pub fn new(
        handle: HandleRef,
        outcome: CleanupOutcome,
        source: CleanupSource,
        detail: Option<String>,
    ) -> Self {
        Self {
            ts: Utc::now(),
            handle,
            outcome,
            source,
            detail,
        }
    }
}

/// A record as stored, with its chain link.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogEntry {
    pub prev_entry_sha256: String,
    #[serde(flatten)]
    pub record: CleanupRecord,
}

#[derive(Debug, Clone)]
pub struct CleanupLog {
    path: PathBuf,
}

impl CleanupLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Log at the standard location inside `state_dir`.
    pub fn in_state_dir(state_dir: &Path) -> Self {
        Self::new(state_dir.join(CLEANUP_LOG_FILENAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record, linking it to the current last line.
    pub fn append(&self, record: &CleanupRecord) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open cleanup log {}", self.path.display()))?;
        file.lock_exclusive()
            .context("Failed to lock cleanup log")?;

        let result = append_locked(&mut file, record);
        let _ = file.unlock();
        result
    }

    /// All parseable entries. Corrupted lines are skipped.
    pub fn read_all(&self) -> Result<Vec<LogEntry>> {
        let Some(content) = self.read_content()? else {
            return Ok(Vec::new());
        };
        Ok(content
            .lines()
            .filter(|line| !line.is_empty())
            .filter_map(|line| serde_json::from_str::<LogEntry>(line).ok())
            .collect())
    }

    /// Indices of entries whose chain link does not match the previous
    /// line. Corrupted lines are reported as broken. Empty means intact.
    pub fn verify_chain(&self) -> Result<Vec<usize>> {
        let Some(content) = self.read_content()? else {
            return Ok(Vec::new());
        };
        let lines: Vec<&str> = content.lines().filter(|l| !l.is_empty()).collect();

        let mut broken = Vec::new();
        for (i, line) in lines.iter().enumerate() {
            let expected = if i == 0 {
                GENESIS_HASH.to_string()
            } else {
                sha256_hex(lines[i - 1].as_bytes())
            };
            match serde_json::from_str::<LogEntry>(line) {
                Ok(entry) if entry.prev_entry_sha256 == expected => {}
                _ => broken.push(i),
            }
        }
        Ok(broken)
    }

    fn read_content(&self) -> Result<Option<String>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&self.path).context("Failed to read cleanup log")?;
        Ok(Some(content))
    }
}

const TAIL_CHUNK: u64 = 4096;

/// Raw bytes of the last non-empty line, read backwards from the end.
fn last_line(file: &mut File) -> Result<Option<Vec<u8>>> {
    let mut end = file
        .seek(SeekFrom::End(0))
        .context("Failed to seek cleanup log")?;
    let mut buf = vec![0u8; TAIL_CHUNK as usize];
    // Collected back to front.
    let mut line = Vec::new();

    while end > 0 {
        let start = end.saturating_sub(TAIL_CHUNK);
        let chunk = &mut buf[..(end - start) as usize];
        file.seek(SeekFrom::Start(start))
            .context("Failed to seek cleanup log")?;
        file.read_exact(chunk)
            .context("Failed to read cleanup log")?;

        for &byte in chunk.iter().rev() {
            match byte {
                b'\n' | b'\r' if line.is_empty() => {}
                b'\n' => {
                    line.reverse();
                    return Ok(Some(line));
                }
                _ => line.push(byte),
            }
        }
        end = start;
    }

    if line.is_empty() {
        return Ok(None);
    }
    line.reverse();
    Ok(Some(line))
}

fn append_locked(file: &mut File, record: &CleanupRecord) -> Result<()> {
    // A corrupted tail still gets linked by its raw bytes; verify_chain
    // reports it.
    let prev_entry_sha256 = match last_line(file)? {
        Some(last) => sha256_hex(&last),
        None => GENESIS_HASH.to_string(),
    };

    let entry = LogEntry {
        prev_entry_sha256,
        record: record.clone(),
    };
    let json = serde_json::to_string(&entry).context("Failed to serialize cleanup record")?;
    writeln!(file, "{}", json).context("Failed to write cleanup record")?;
    file.flush().context("Failed to flush cleanup log")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};

    fn record(instance: &str, outcome: CleanupOutcome) -> CleanupRecord {
        CleanupRecord::new(
            HandleRef {
                instance: instance.to_string(),
                request_id: Some(Uuid::new_v4()),
                created_at: Some(Utc::now()),
            },
            outcome,
            CleanupSource::Request,
            None,
        )
    }

    #[test]
    fn chain_integrity() {
        let tmp = tempfile::tempdir().unwrap();
        let log = CleanupLog::in_state_dir(tmp.path());

        for i in 0..5 {
            log.append(&record(&format!("sbx-{}", i), CleanupOutcome::Removed))
                .unwrap();
        }

        let entries = log.read_all().unwrap();
        assert_eq!(entries.len(), 5);
        assert_eq!(entries[0].prev_entry_sha256, GENESIS_HASH);
        assert_eq!(entries[4].record.handle.instance, "sbx-4");
        assert!(log.verify_chain().unwrap().is_empty());
    }

    #[test]
    fn tampering_detected() {
        let tmp = tempfile::tempdir().unwrap();
        let log = CleanupLog::in_state_dir(tmp.path());
        for i in 0..3 {
            log.append(&record(&format!("sbx-{}", i), CleanupOutcome::Removed))
                .unwrap();
        }

        let content = fs::read_to_string(log.path()).unwrap();
        let mut lines: Vec<String> = content.lines().map(String::from).collect();
        lines[1] = lines[1].replace("\"removed\"", "\"failed\"");
        fs::write(log.path(), lines.join("\n") + "\n").unwrap();

        let broken = log.verify_chain().unwrap();
        assert_eq!(broken, vec![2]);
    }

    #[test]
    fn corrupted_line_skipped_and_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let log = CleanupLog::in_state_dir(tmp.path());
        log.append(&record("a", CleanupOutcome::Removed)).unwrap();

        let mut content = fs::read_to_string(log.path()).unwrap();
        content.push_str("not json\n");
        fs::write(log.path(), &content).unwrap();

        log.append(&record("b", CleanupOutcome::AlreadyGone)).unwrap();

        let entries = log.read_all().unwrap();
        assert_eq!(entries.len(), 2);
        // the corrupted line is broken, the entry after it links to it correctly
        assert_eq!(log.verify_chain().unwrap(), vec![1]);
    }

    #[test]
    fn links_to_long_last_line_and_skips_blank_tail() {
        let tmp = tempfile::tempdir().unwrap();
        let log = CleanupLog::in_state_dir(tmp.path());

        let mut long = record("sbx-long", CleanupOutcome::Failed);
        long.detail = Some("x".repeat(3 * TAIL_CHUNK as usize));
        log.append(&long).unwrap();
        log.append(&record("sbx-after-long", CleanupOutcome::Removed)).unwrap();
        log.append(&long).unwrap();

        let mut content = fs::read_to_string(log.path()).unwrap();
        content.push_str("\n\r\n\n");
        fs::write(log.path(), &content).unwrap();
        log.append(&record("sbx-last", CleanupOutcome::Removed)).unwrap();

        let entries = log.read_all().unwrap();
        assert_eq!(entries.len(), 4);
        assert_eq!(entries[3].record.handle.instance, "sbx-last");
        assert!(log.verify_chain().unwrap().is_empty());
    }

    #[test]
    fn last_line_of_small_files() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("tail");
        for (content, expected) in [
            ("", None),
            ("\n\n", None),
            ("one", Some("one")),
            ("one\ntwo\n", Some("two")),
            ("one\r\ntwo\r\n\n", Some("two")),
        ] {
            fs::write(&path, content).unwrap();
            let mut file = File::open(&path).unwrap();
            let last = last_line(&mut file).unwrap();
            assert_eq!(last.as_deref(), expected.map(str::as_bytes), "{content:?}");
        }
    }

    #[test]
    fn empty_log() {
        let tmp = tempfile::tempdir().unwrap();
        let log = CleanupLog::in_state_dir(tmp.path());
        assert!(log.read_all().unwrap().is_empty());
        assert!(log.verify_chain().unwrap().is_empty());
    }

    #[test]
    fn serialized_shape() {
        let mut rec = record("sbx-1", CleanupOutcome::AlreadyGone);
        rec.source = CleanupSource::Reaper;
        let entry = LogEntry {
            prev_entry_sha256: GENESIS_HASH.to_string(),
            record: rec,
        };
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"outcome\":\"already_gone\""));
        assert!(json.contains("\"source\":\"reaper\""));
        assert!(json.contains("\"prev_entry_sha256\""));
        assert!(!json.contains("\"detail\""));

        let parsed: LogEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, entry);
    }

    #[test]
    fn concurrent_appends_keep_chain() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(CLEANUP_LOG_FILENAME);
        let barrier = Arc::new(Barrier::new(4));

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let p = path.clone();
                let b = barrier.clone();
                std::thread::spawn(move || {
                    let log = CleanupLog::new(p);
                    b.wait();
                    for i in 0..10 {
                        log.append(&record(&format!("t{}-{}", t, i), CleanupOutcome::Removed))
                            .unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let log = CleanupLog::new(path);
        assert_eq!(log.read_all().unwrap().len(), 40);
        assert!(log.verify_chain().unwrap().is_empty());
    }
}
