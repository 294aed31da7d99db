//! Durable settlement trail.
//!
//! Append-only NDJSON at `<state_dir>/payments/settlement.log`, mode 0600,
//! parent directory created lazily on first write. Each entry is
//! `{ts, event, data}` with an RFC3339 nanosecond timestamp. The writer is
//! buffered and flushed per entry; a failed write recreates the writer once
//! and retries, after which the entry is the caller's to drop. Crash may
//! lose trailing entries; the in-memory outcome cache stays authoritative
//! within the process lifetime.

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

pub struct SettlementLog {
    path: PathBuf,
    writer: Mutex<Option<BufWriter<File>>>,
}

impl SettlementLog {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            path: state_dir.join("payments").join("settlement.log"),
            writer: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one entry. Retries once through a fresh writer on I/O
    /// failure; a second failure is returned for the caller to report.
    pub fn append(&self, event: &str, data: Value) -> Result<()> {
        let record = serde_json::json!({
            "ts": Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true),
            "event": event,
            "data": data,
        });
        let line = serde_json::to_string(&record).context("encode settlement entry")?;

        let mut writer = self.writer.lock();
        if self.write_line(&mut writer, &line).is_ok() {
            return Ok(());
        }
        // One recovery attempt with a recreated writer.
        *writer = None;
        self.write_line(&mut writer, &line)
            .context("settlement log write failed after reinit")
    }

    pub fn flush(&self) -> Result<()> {
        if let Some(writer) = self.writer.lock().as_mut() {
            writer.flush().context("flush settlement log")?;
        }
        Ok(())
    }

    fn write_line(
        &self,
        writer: &mut Option<BufWriter<File>>,
        line: &str,
    ) -> std::io::Result<()> {
        if writer.is_none() {
            *writer = Some(self.open()?);
        }
        let w = writer.as_mut().expect("writer just ensured");
        writeln!(w, "{line}")?;
        w.flush()
    }

    fn open(&self) -> std::io::Result<BufWriter<File>> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(BufWriter::new(file))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn appends_ndjson_entries() {
        let dir = TempDir::new().unwrap();
        let log = SettlementLog::new(dir.path());

        log.append("settle_succeeded", json!({"key_digest": "ab12"}))
            .unwrap();
        log.append("settle_failed", json!({"key_digest": "cd34"}))
            .unwrap();

        let contents = std::fs::read_to_string(log.path()).unwrap();
        let lines: Vec<Value> = contents
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["event"], "settle_succeeded");
        assert_eq!(lines[1]["data"]["key_digest"], "cd34");
        assert!(lines[0]["ts"].as_str().unwrap().ends_with('Z'));
    }

    #[test]
    fn creates_parent_directory_lazily() {
        let dir = TempDir::new().unwrap();
        let log = SettlementLog::new(dir.path());
        assert!(!dir.path().join("payments").exists());

        log.append("execute", json!({})).unwrap();
        assert!(dir.path().join("payments/settlement.log").exists());
    }

    #[cfg(unix)]
    #[test]
    fn log_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = TempDir::new().unwrap();
        let log = SettlementLog::new(dir.path());
        log.append("execute", json!({})).unwrap();

        let mode = std::fs::metadata(log.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn recovers_from_a_poisoned_writer() {
        let dir = TempDir::new().unwrap();
        let log = SettlementLog::new(dir.path());
        log.append("first", json!({})).unwrap();

        // Simulate a torn writer; the next append must reinit and succeed.
        *log.writer.lock() = None;
        log.append("second", json!({})).unwrap();

        let contents = std::fs::read_to_string(log.path()).unwrap();
        assert_eq!(contents.lines().count(), 2);
    }
}
