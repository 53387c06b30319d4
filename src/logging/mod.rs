//! Append-only audit trail of exchange decisions.
//!
//! Every exchange yields exactly one [`AuditRecord`], written as one JSON
//! object per line by [`JsonlAuditLog`]. Appends are serialized behind a
//! mutex and issued as a single write, so concurrent exchanges never
//! interleave partial lines. Records hold rule names and counts only; matched
//! values never reach this file.
//!
//! The [`export`] submodule renders records as JSON or CSV.

pub mod export;

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::dlp::Finding;
use crate::error::Result;

/// One line of the audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// RFC 3339 UTC timestamp of when the record was written.
    pub timestamp: String,
    /// Normalized destination host.
    pub host: String,
    /// HTTP method (`CONNECT` for tunnels).
    pub method: String,
    /// Request URL with query secrets already redacted.
    pub url: String,
    /// Whether the destination was permitted.
    pub allowed: bool,
    /// Human-readable reason for the decision or outcome.
    pub reason: String,
    /// Request and response findings, one per rule per location.
    #[serde(default)]
    pub findings: Vec<Finding>,
}

/// Destination for audit records.
///
/// Implementations must make each append atomic with respect to other appends.
pub trait AuditSink: Send + Sync {
    fn append(&self, record: &AuditRecord) -> Result<()>;
}

/// JSONL file sink.
#[derive(Debug)]
pub struct JsonlAuditLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlAuditLog {
    /// Open (or create) the log for appending, creating parent directories.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AuditSink for JsonlAuditLog {
    fn append(&self, record: &AuditRecord) -> Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        file.write_all(&line)?;
        file.flush()?;
        Ok(())
    }
}

/// In-memory sink, for embedding and tests.
#[derive(Debug, Default)]
pub struct MemoryAuditLog {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the records written so far, in append order.
    pub fn records(&self) -> Vec<AuditRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl AuditSink for MemoryAuditLog {
    fn append(&self, record: &AuditRecord) -> Result<()> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record.clone());
        Ok(())
    }
}

/// Read every record from a JSONL audit file.
///
/// Lines that fail to parse are skipped with a warning; the file may be
/// shared with other session writers.
pub fn read_records(path: &Path) -> Result<Vec<AuditRecord>> {
    let reader = BufReader::new(File::open(path)?);
    let mut records = Vec::new();
    for (lineno, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<AuditRecord>(&line) {
            Ok(record) => records.push(record),
            Err(e) => warn!("Skipping audit line {}: {}", lineno + 1, e),
        }
    }
    Ok(records)
}

/// The most recent `limit` records, newest first.
pub fn query_recent(path: &Path, limit: usize) -> Result<Vec<AuditRecord>> {
    let mut records = read_records(path)?;
    records.reverse();
    records.truncate(limit);
    Ok(records)
}

/// Aggregated counts over an audit file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditStats {
    pub total: usize,
    pub allowed: usize,
    pub denied: usize,
    /// Exchanges with at least one redaction.
    pub scrubbed: usize,
    /// Exchanges with a "not scrubbed" marker.
    pub degraded: usize,
}

pub fn query_stats(path: &Path) -> Result<AuditStats> {
    let mut stats = AuditStats::default();
    for record in read_records(path)? {
        stats.total += 1;
        if record.allowed {
            stats.allowed += 1;
        } else {
            stats.denied += 1;
        }
        if record.findings.iter().any(|f| !f.is_degraded()) {
            stats.scrubbed += 1;
        }
        if record.findings.iter().any(Finding::is_degraded) {
            stats.degraded += 1;
        }
    }
    Ok(stats)
}
