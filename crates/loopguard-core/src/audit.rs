//! Hash-chained, append-only audit log.
//!
//! Grounded on `guardrails/audit.py`. Every record is canonicalized (keys
//! sorted, recursively) before hashing so two structurally-identical
//! records always hash identically regardless of field insertion order, then
//! chained to its predecessor via SHA-256 so any edit or reorder of a past
//! record is detectable by replaying the chain. On disk this is JSONL: one
//! canonical, sorted-key record per line, file handle opened fresh for each
//! append (no handle held open between ticks).

use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// The previous-hash value recorded by the first entry in a chain.
pub const GENESIS: &str = "GENESIS";

/// Field names that must never appear (at any nesting depth) in a record
/// handed to [`AuditLog::append`] — the raw LREG fields that `LEntry`
/// carries but `Derived` never does.
const BANNED_KEYS: &[&str] = &["l_loop", "l_ex", "ci_loop", "ci_ex"];

/// One committed audit record: `counter` is strictly increasing from 1,
/// `ts` is the wall-clock timestamp (Unix milliseconds) at append time,
/// `prev_hash` of the first record in a chain is the literal `"GENESIS"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub counter: u64,
    pub ts: u64,
    pub event: String,
    pub details: Value,
    pub prev_hash: String,
    pub hash: String,
}

impl AuditRecord {
    /// This record as a single JSON line with recursively sorted object
    /// keys — the exact bytes the audit file stores and the verifier reads.
    pub fn to_json_line(&self) -> String {
        let value = sort_keys(&serde_json::to_value(self).unwrap_or(Value::Null));
        serde_json::to_string(&value).unwrap_or_default()
    }
}

/// Current wall-clock time as Unix milliseconds.
pub fn now_unix_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// An append-only, hash-chained log of audit events. Optionally backed by a
/// JSONL file: when a path is configured, every accepted [`Self::append`]
/// opens the file, writes one line, and closes it.
#[derive(Debug, Default)]
pub struct AuditLog {
    path: Option<PathBuf>,
    records: Vec<AuditRecord>,
}

impl AuditLog {
    /// An in-memory-only log (tests, embedders that persist elsewhere).
    pub fn new() -> Self {
        Self::default()
    }

    /// A log that also appends every record to `path` as JSONL. Creates the
    /// parent directory if needed; does not truncate a pre-existing file —
    /// callers that want a fresh run should remove it first.
    pub fn with_path(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(Self {
            path: Some(path),
            records: Vec::new(),
        })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[AuditRecord] {
        &self.records
    }

    pub fn latest_hash(&self) -> &str {
        self.records.last().map_or(GENESIS, |r| r.hash.as_str())
    }

    /// Append `event` with `details`, stamped with the current wall-clock
    /// time.
    pub fn append(&mut self, event: impl Into<String>, details: Value) -> Result<AuditRecord> {
        self.append_at(event, details, now_unix_ms())
    }

    /// Append `event` with `details` at caller-supplied `ts` (Unix
    /// milliseconds) — useful for deterministic tests and replay. Recursively
    /// scans `details` for any banned raw-LREG key *before* mutating chain
    /// state: a rejected append must not consume a counter value, change
    /// `prev_hash`, or touch the backing file.
    pub fn append_at(&mut self, event: impl Into<String>, details: Value, ts: u64) -> Result<AuditRecord> {
        scan_for_banned_keys(&details)?;

        let event = event.into();
        let counter = self.records.len() as u64 + 1;
        let prev_hash = self.latest_hash().to_string();
        let hash = record_hash(counter, ts, &event, &details, &prev_hash);

        let record = AuditRecord {
            counter,
            ts,
            event,
            details,
            prev_hash,
            hash,
        };

        if let Some(path) = &self.path {
            append_line(path, &record)?;
        }

        self.records.push(record.clone());
        Ok(record)
    }

    /// Replay the in-memory chain, checking every record's counter
    /// continuity, `prev_hash` link, non-regressing timestamp, and own
    /// `hash` against a recomputation. Returns the counter of the first
    /// broken link, if any.
    pub fn verify_chain(&self) -> std::result::Result<(), u64> {
        verify_records(&self.records)
    }
}

fn append_line(path: &Path, record: &AuditRecord) -> Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{}", record.to_json_line())?;
    Ok(())
}

/// Read back every record from a JSONL audit file, in file order. Used by
/// both the independent verifier and the reporting/artifacts extraction,
/// neither of which holds the live [`AuditLog`] that produced the file.
pub fn read_jsonl(path: &Path) -> Result<Vec<AuditRecord>> {
    let content = std::fs::read_to_string(path)?;
    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).map_err(Error::from))
        .collect()
}

/// Replay an arbitrary slice of records — shared by [`AuditLog`] and the
/// independent verifier, which reconstructs records parsed back from disk
/// rather than from a live `AuditLog`.
pub fn verify_records(records: &[AuditRecord]) -> std::result::Result<(), u64> {
    let mut expected_prev = GENESIS.to_string();
    let mut expected_counter = 1u64;
    let mut last_ts = 0u64;
    for record in records {
        if record.counter != expected_counter {
            return Err(record.counter);
        }
        if record.prev_hash != expected_prev {
            return Err(record.counter);
        }
        if record.ts < last_ts {
            return Err(record.counter);
        }
        let recomputed = record_hash(record.counter, record.ts, &record.event, &record.details, &record.prev_hash);
        if recomputed != record.hash {
            return Err(record.counter);
        }
        expected_prev = record.hash.clone();
        expected_counter += 1;
        last_ts = record.ts;
    }
    Ok(())
}

fn record_hash(counter: u64, ts: u64, event: &str, details: &Value, prev_hash: &str) -> String {
    let envelope = serde_json::json!({
        "counter": counter,
        "ts": ts,
        "event": event,
        "details": details,
        "prev_hash": prev_hash,
    });
    let canonical = serde_json::to_string(&sort_keys(&envelope)).unwrap_or_default();
    hex::encode(Sha256::digest(canonical.as_bytes()))
}

fn scan_for_banned_keys(value: &Value) -> Result<()> {
    match value {
        Value::Object(map) => {
            for (k, v) in map {
                if BANNED_KEYS.iter().any(|banned| banned.eq_ignore_ascii_case(k)) {
                    return Err(Error::RawLregLeak(k.clone()));
                }
                scan_for_banned_keys(v)?;
            }
            Ok(())
        }
        Value::Array(items) => {
            for item in items {
                scan_for_banned_keys(item)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Render `value` with object keys sorted recursively, so hashing and
/// on-disk JSON are insensitive to field insertion order.
pub fn sort_keys(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut sorted: std::collections::BTreeMap<String, Value> = std::collections::BTreeMap::new();
            for (k, v) in map {
                sorted.insert(k.clone(), sort_keys(v));
            }
            Value::Object(sorted.into_iter().collect())
        }
        Value::Array(items) => Value::Array(items.iter().map(sort_keys).collect()),
        other => other.clone(),
    }
}
