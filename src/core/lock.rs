//! Advisory lock for the scheduled push trigger.
//!
//! The lock file holds `{"pid": .., "ts": ..}` and is never visible without
//! it. A lock is stale when its process is gone or it is older than the
//! configured age; stale locks are removed by whoever observes them.

use crate::core::error::FleetError;
use crate::core::time;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::UNIX_EPOCH;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockRecord {
    pub pid: u32,
    pub ts: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Free,
    Held(LockRecord),
    /// A stale record was found and removed.
    Reclaimed(LockRecord),
}

/// Whether `pid` names a live process on this host.
pub fn process_exists(pid: u32) -> bool {
    if pid == std::process::id() {
        return true;
    }
    let proc_root = Path::new("/proc");
    if proc_root.is_dir() {
        return proc_root.join(pid.to_string()).exists();
    }
    Command::new("kill")
        .arg("-0")
        .arg(pid.to_string())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

fn read_record(path: &Path) -> Result<Option<LockRecord>, FleetError> {
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if let Ok(record) = serde_json::from_str(&content) {
        return Ok(Some(record));
    }
    // Unreadable record: owner unknown, aged by the file's mtime.
    let ts = fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0);
    Ok(Some(LockRecord { pid: 0, ts }))
}

/// A record without a known owner (pid 0) only goes stale by age.
fn is_stale(record: &LockRecord, max_age_secs: u64, now: u64) -> bool {
    if now.saturating_sub(record.ts) > max_age_secs {
        return true;
    }
    record.pid != 0 && !process_exists(record.pid)
}

/// Inspect the lock, removing it if stale.
pub fn inspect(path: &Path, max_age_secs: u64) -> Result<LockState, FleetError> {
    let Some(record) = read_record(path)? else {
        return Ok(LockState::Free);
    };
    if is_stale(&record, max_age_secs, time::epoch_secs()) {
        warn!(pid = record.pid, path = %path.display(), "removing stale push lock");
        match fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        return Ok(LockState::Reclaimed(record));
    }
    Ok(LockState::Held(record))
}

pub fn is_locked(path: &Path, max_age_secs: u64) -> Result<bool, FleetError> {
    Ok(matches!(inspect(path, max_age_secs)?, LockState::Held(_)))
}

/// Held lock; the file is removed on drop.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    record: LockRecord,
}

impl LockGuard {
    pub fn record(&self) -> LockRecord {
        self.record
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        // Only remove the file if it is still ours.
        if let Ok(Some(current)) = read_record(&self.path)
            && current == self.record
        {
            let _ = fs::remove_file(&self.path);
        }
    }
}

pub fn acquire(path: &Path, max_age_secs: u64) -> Result<LockGuard, FleetError> {
    if let LockState::Held(record) = inspect(path, max_age_secs)? {
        return Err(FleetError::LockContention {
            path: path.to_path_buf(),
            pid: record.pid,
        });
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let record = LockRecord {
        pid: std::process::id(),
        ts: time::epoch_secs(),
    };
    // The record is complete before it appears under `path`: write a private
    // file, then link it into place, which fails if the lock exists.
    let staged = path.with_file_name(format!(
        ".{}.{}.tmp",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("lock"),
        record.pid
    ));
    {
        let mut f = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&staged)?;
        f.write_all(serde_json::to_string(&record)?.as_bytes())?;
        f.sync_all()?;
    }
    let linked = fs::hard_link(&staged, path);
    let _ = fs::remove_file(&staged);
    match linked {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            let pid = read_record(path)?.map(|r| r.pid).unwrap_or(0);
            return Err(FleetError::LockContention {
                path: path.to_path_buf(),
                pid,
            });
        }
        Err(e) => return Err(e.into()),
    }
    debug!(pid = record.pid, path = %path.display(), "acquired push lock");
    Ok(LockGuard {
        path: path.to_path_buf(),
        record,
    })
}
