//! Audit trail of follower lifecycle and fault events.
//!
//! One JSON object per line, appended, so a trail survives restarts.

use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    SystemStart,
    SystemShutdown,
    /// Fault state changed between healthy, protection tripped and disconnected
    FaultStateChanged,
    /// Protection cleared and follower output re-enabled
    RecoveryAttempted,
    StopRequested,
    /// Run ended with an unrecoverable fault
    FollowerAborted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Monotonic microseconds since the run started
    pub timestamp_us: u64,
    pub unix_us: u64,
    pub event_type: AuditEventType,
    pub details: serde_json::Value,
}

/// Thread-safe JSONL writer.
pub struct AuditLogger {
    writer: Mutex<BufWriter<File>>,
}

impl AuditLogger {
    /// Opens `path` for appending, creating parent directories as needed.
    pub fn new(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;

        Ok(Self {
            writer: Mutex::new(BufWriter::with_capacity(8192, file)),
        })
    }

    pub fn log(&self, entry: &AuditEntry) -> std::io::Result<()> {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        serde_json::to_writer(&mut *writer, entry)?;
        writer.write_all(b"\n")?;
        writer.flush()
    }

    pub fn log_event(
        &self,
        timestamp_us: u64,
        unix_us: u64,
        event_type: AuditEventType,
        details: serde_json::Value,
    ) -> std::io::Result<()> {
        self.log(&AuditEntry {
            timestamp_us,
            unix_us,
            event_type,
            details,
        })
    }

    /// Like [`log_event`](Self::log_event), but a failed write is logged as a
    /// warning instead of returned. Returns whether the entry was written.
    pub fn record(
        &self,
        timestamp_us: u64,
        unix_us: u64,
        event_type: AuditEventType,
        details: serde_json::Value,
    ) -> bool {
        match self.log_event(timestamp_us, unix_us, event_type, details) {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, event = ?event_type, "Failed to write audit entry");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn appends_jsonl_entries() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("logs").join("audit.jsonl");

        let logger = AuditLogger::new(&path).unwrap();
        logger
            .log_event(
                1_000,
                1_704_067_200_000_000,
                AuditEventType::SystemStart,
                serde_json::json!({"instrument": "simulated"}),
            )
            .unwrap();
        logger
            .log_event(
                2_000,
                1_704_067_201_000_000,
                AuditEventType::FaultStateChanged,
                serde_json::json!({"from": "healthy", "to": "protection_tripped"}),
            )
            .unwrap();
        drop(logger);

        // Reopening must append, not truncate.
        AuditLogger::new(&path)
            .unwrap()
            .log_event(3_000, 0, AuditEventType::SystemShutdown, serde_json::json!({}))
            .unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let entries: Vec<AuditEntry> = content
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[1].event_type, AuditEventType::FaultStateChanged);
        assert_eq!(entries[1].details["to"], "protection_tripped");
        assert_eq!(entries[2].timestamp_us, 3_000);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn failed_write_is_reported_not_raised() {
        // Every write to /dev/full fails with ENOSPC.
        let logger = AuditLogger::new(Path::new("/dev/full")).unwrap();
        assert!(logger
            .log_event(1, 1, AuditEventType::SystemStart, serde_json::json!({}))
            .is_err());
        assert!(!logger.record(2, 2, AuditEventType::SystemStart, serde_json::json!({})));
    }

    #[test]
    fn record_reports_success() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let logger = AuditLogger::new(&path).unwrap();
        assert!(logger.record(1, 1, AuditEventType::StopRequested, serde_json::json!({"cycle": 4})));
        drop(logger);

        let entry: AuditEntry = serde_json::from_str(std::fs::read_to_string(&path).unwrap().trim()).unwrap();
        assert_eq!(entry.event_type, AuditEventType::StopRequested);
        assert_eq!(entry.details["cycle"], 4);
    }
}
