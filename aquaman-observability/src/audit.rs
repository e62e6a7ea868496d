//! Append-only audit log file with chain verification and rotation.
//!
//! One serialized writer appends canonical JSON lines to `current.jsonl` in
//! the audit directory, flushing per record so a crash loses at most the
//! line being written. Partial trailing lines are detected and ignored by
//! recovery and verification. Rotation renames the current file to a
//! timestamped archive, records the final hash in a `.chain` sidecar for
//! cross-file verification, and starts a fresh chain from the zero hash.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use tracing::{error, info, warn};

use crate::chain::{AuditRecord, ZERO_HASH};

const CURRENT_FILE: &str = "current.jsonl";

pub struct AuditLog {
    dir: PathBuf,
    inner: Mutex<WriterState>,
    write_failures: AtomicU64,
}

struct WriterState {
    writer: BufWriter<File>,
    prev_hash: String,
}

impl AuditLog {
    /// Open (or create) the audit directory and resume the chain from the
    /// last complete record of `current.jsonl`.
    pub fn open(dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(CURRENT_FILE);

        let prev_hash = match last_complete_record(&path)? {
            Some(record) => record.hash,
            None => ZERO_HASH.to_string(),
        };

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        info!(path = %path.display(), "audit log opened");

        Ok(Self {
            dir,
            inner: Mutex::new(WriterState {
                writer: BufWriter::new(file),
                prev_hash,
            }),
            write_failures: AtomicU64::new(0),
        })
    }

    fn current_path(&self) -> PathBuf {
        self.dir.join(CURRENT_FILE)
    }

    /// Append one event to the chain. The write and the `prev_hash` advance
    /// happen under the same lock, so concurrent callers serialize in
    /// completion order.
    pub fn append(&self, event_type: &str, data: serde_json::Value) -> std::io::Result<AuditRecord> {
        let mut state = self
            .inner
            .lock()
            .map_err(|_| std::io::Error::other("audit writer lock poisoned"))?;

        let record = AuditRecord::next(&state.prev_hash, event_type, data);
        let line = record.to_json_line();

        state.writer.write_all(line.as_bytes())?;
        state.writer.write_all(b"\n")?;
        state.writer.flush()?;
        state.prev_hash = record.hash.clone();

        Ok(record)
    }

    /// Append a credential-access event, swallowing write failures: the HTTP
    /// response must not change because the audit disk is unhappy. Failures
    /// go to stderr and a counter.
    pub fn record_credential_access(
        &self,
        service: &str,
        operation: &str,
        success: bool,
        error: Option<&str>,
    ) {
        let mut data = serde_json::json!({
            "service": service,
            "operation": operation,
            "success": success,
        });
        if let Some(message) = error {
            data["error"] = serde_json::Value::String(message.to_string());
        }

        if let Err(e) = self.append("credential_access", data) {
            self.write_failures.fetch_add(1, Ordering::Relaxed);
            eprintln!("aquaman: audit write failed: {e}");
            error!(error = %e, "audit write failed");
        }
    }

    /// Number of appends that failed since startup.
    pub fn write_failure_count(&self) -> u64 {
        self.write_failures.load(Ordering::Relaxed)
    }

    /// Last `n` records of the current log.
    pub fn tail(&self, n: usize) -> std::io::Result<Vec<AuditRecord>> {
        let mut records = read_complete_records(&self.current_path())?
            .into_iter()
            .map(|(_, rec)| rec)
            .collect::<Vec<_>>();
        let skip = records.len().saturating_sub(n);
        Ok(records.split_off(skip))
    }

    /// Recompute every hash and check chain continuity.
    ///
    /// Returns 1-based line numbers that fail: unparseable lines, records
    /// whose stored hash does not match the recomputation, and records whose
    /// `prev_hash` breaks the chain. A partial trailing line (no newline) is
    /// not an error.
    pub fn verify_integrity(&self) -> std::io::Result<Vec<usize>> {
        verify_file(&self.current_path(), ZERO_HASH)
    }

    /// Archive the current file and start a fresh chain.
    ///
    /// The archive keeps its name timestamp; its final hash lands in a
    /// `.chain` sidecar so auditors can verify continuity across files.
    pub fn rotate(&self) -> std::io::Result<PathBuf> {
        let mut state = self
            .inner
            .lock()
            .map_err(|_| std::io::Error::other("audit writer lock poisoned"))?;

        state.writer.flush()?;

        let archive_name = format!("audit-{}.jsonl", Utc::now().format("%Y%m%dT%H%M%S%.3fZ"));
        let archive_path = self.dir.join(&archive_name);
        std::fs::rename(self.current_path(), &archive_path)?;

        let sidecar = archive_path.with_extension("jsonl.chain");
        std::fs::write(&sidecar, format!("{}\n", state.prev_hash))?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.current_path())?;
        state.writer = BufWriter::new(file);
        state.prev_hash = ZERO_HASH.to_string();

        info!(archive = %archive_path.display(), "audit log rotated");
        Ok(archive_path)
    }
}

/// Parse every complete line of `path` as `(line_number, record)`.
///
/// A final fragment without a terminating newline is a torn write, not part
/// of the log.
fn read_complete_records(path: &Path) -> std::io::Result<Vec<(usize, AuditRecord)>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let raw = std::fs::read_to_string(path)?;

    let complete = match raw.rfind('\n') {
        Some(last_newline) => &raw[..=last_newline],
        None => {
            if !raw.is_empty() {
                warn!(path = %path.display(), "ignoring partial first audit line");
            }
            return Ok(Vec::new());
        }
    };
    if complete.len() < raw.len() {
        warn!(path = %path.display(), "ignoring partial trailing audit line");
    }

    Ok(complete
        .lines()
        .enumerate()
        .filter_map(|(idx, line)| {
            serde_json::from_str::<AuditRecord>(line)
                .ok()
                .map(|rec| (idx + 1, rec))
        })
        .collect())
}

/// The last complete record of `path`, if any.
fn last_complete_record(path: &Path) -> std::io::Result<Option<AuditRecord>> {
    Ok(read_complete_records(path)?.pop().map(|(_, rec)| rec))
}

fn verify_file(path: &Path, genesis: &str) -> std::io::Result<Vec<usize>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let raw = std::fs::read_to_string(path)?;
    let complete = match raw.rfind('\n') {
        Some(last_newline) => &raw[..=last_newline],
        None => return Ok(Vec::new()),
    };

    let mut bad = Vec::new();
    let mut expected_prev = genesis.to_string();

    for (idx, line) in complete.lines().enumerate() {
        let line_no = idx + 1;
        let record: AuditRecord = match serde_json::from_str(line) {
            Ok(r) => r,
            Err(_) => {
                bad.push(line_no);
                continue;
            }
        };

        let mut ok = record.hash == record.expected_hash();
        if record.prev_hash != expected_prev {
            ok = false;
        }
        if !ok {
            bad.push(line_no);
        }

        // Continue from the stored hash either way so one bad line does not
        // condemn the rest of the file twice over.
        expected_prev = record.hash;
    }

    Ok(bad)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_in(dir: &tempfile::TempDir) -> AuditLog {
        AuditLog::open(dir.path()).unwrap()
    }

    fn access(log: &AuditLog, service: &str) -> AuditRecord {
        log.append(
            "credential_access",
            serde_json::json!({"service": service, "operation": "get", "success": true}),
        )
        .unwrap()
    }

    #[test]
    fn appended_chain_verifies_clean() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_in(&dir);
        for i in 0..20 {
            access(&log, &format!("svc{i}"));
        }
        assert!(log.verify_integrity().unwrap().is_empty());
    }

    #[test]
    fn first_record_starts_from_zero_hash() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_in(&dir);
        let rec = access(&log, "anthropic");
        assert_eq!(rec.prev_hash, ZERO_HASH);
    }

    #[test]
    fn tail_returns_last_n_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_in(&dir);
        for i in 0..5 {
            access(&log, &format!("svc{i}"));
        }
        let tail = log.tail(2).unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].data["service"], "svc3");
        assert_eq!(tail[1].data["service"], "svc4");
    }

    #[test]
    fn restart_resumes_the_chain() {
        let dir = tempfile::tempdir().unwrap();
        let last_hash = {
            let log = open_in(&dir);
            access(&log, "a");
            access(&log, "b").hash
        };

        let log = open_in(&dir);
        let rec = access(&log, "c");
        assert_eq!(rec.prev_hash, last_hash);
        assert!(log.verify_integrity().unwrap().is_empty());
    }

    #[test]
    fn tampered_line_is_flagged_with_its_number() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_in(&dir);
        for i in 0..4 {
            access(&log, &format!("svc{i}"));
        }
        drop(log);

        // Flip a data byte in line 2.
        let path = dir.path().join("current.jsonl");
        let content = std::fs::read_to_string(&path).unwrap();
        let mut lines: Vec<String> = content.lines().map(String::from).collect();
        lines[1] = lines[1].replace("svc1", "svcX");
        std::fs::write(&path, format!("{}\n", lines.join("\n"))).unwrap();

        let log = open_in(&dir);
        let bad = log.verify_integrity().unwrap();
        assert!(bad.contains(&2), "line 2 must be flagged, got {bad:?}");
    }

    #[test]
    fn deleted_line_breaks_continuity() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_in(&dir);
        for i in 0..4 {
            access(&log, &format!("svc{i}"));
        }
        drop(log);

        let path = dir.path().join("current.jsonl");
        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        let without_second: Vec<&str> = [&lines[..1], &lines[2..]].concat();
        std::fs::write(&path, format!("{}\n", without_second.join("\n"))).unwrap();

        let log = open_in(&dir);
        assert!(!log.verify_integrity().unwrap().is_empty());
    }

    #[test]
    fn partial_trailing_line_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_in(&dir);
        let keep = access(&log, "kept");
        drop(log);

        // Simulate a torn write: half a record, no newline.
        let path = dir.path().join("current.jsonl");
        use std::io::Write;
        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        write!(f, "{{\"timestamp\":\"2026-").unwrap();
        drop(f);

        let log = open_in(&dir);
        assert!(log.verify_integrity().unwrap().is_empty());

        // And the chain resumes from the last complete record.
        let rec = access(&log, "after-crash");
        assert_eq!(rec.prev_hash, keep.hash);
    }

    #[test]
    fn rotate_archives_and_restarts_chain() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_in(&dir);
        access(&log, "old");
        let final_hash = access(&log, "older").hash;

        let archive = log.rotate().unwrap();
        assert!(archive.exists());

        let sidecar = archive.with_extension("jsonl.chain");
        let recorded = std::fs::read_to_string(sidecar).unwrap();
        assert_eq!(recorded.trim(), final_hash);

        let rec = access(&log, "fresh");
        assert_eq!(rec.prev_hash, ZERO_HASH);
        assert!(log.verify_integrity().unwrap().is_empty());
    }

    #[test]
    fn record_credential_access_counts_failures_without_panicking() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_in(&dir);
        log.record_credential_access("svc", "get", false, Some("credential_missing"));
        assert_eq!(log.write_failure_count(), 0);
        let tail = log.tail(1).unwrap();
        assert_eq!(tail[0].data["success"], false);
        assert_eq!(tail[0].data["error"], "credential_missing");
    }
}
