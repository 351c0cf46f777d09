//! Append-only run journal.
//!
//! Every state-changing step of a fleet run (credential minting, config
//! persists, negotiation transitions, push triggers) is appended as one JSON
//! line to `<root>/fleet.events.jsonl`, so an operator can reconstruct what a
//! partial run already converged before re-running it.

use crate::core::error::FleetError;
use crate::core::time;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

pub const JOURNAL_FILE: &str = "fleet.events.jsonl";

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct JournalEvent {
    pub ts: String,
    pub event_id: String,
    pub actor: String,
    pub op: String,
    pub subject: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub detail: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct Journal {
    path: PathBuf,
    actor: String,
}

impl Journal {
    pub fn new(root: &Path) -> Self {
        Self {
            path: root.join(JOURNAL_FILE),
            actor: "mispfleet".to_string(),
        }
    }

    pub fn with_actor(mut self, actor: &str) -> Self {
        self.actor = actor.to_string();
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(
        &self,
        op: &str,
        subject: &str,
        status: &str,
        detail: serde_json::Value,
    ) -> Result<(), FleetError> {
        let ev = JournalEvent {
            ts: time::stamp(),
            event_id: time::event_id(),
            actor: self.actor.clone(),
            op: op.to_string(),
            subject: subject.to_string(),
            status: status.to_string(),
            detail,
        };

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(f, "{}", serde_json::to_string(&ev)?)?;
        Ok(())
    }

    /// Run `f`, journaling its outcome under `op`.
    pub fn track<R, F>(&self, op: &str, subject: &str, f: F) -> Result<R, FleetError>
    where
        F: FnOnce() -> Result<R, FleetError>,
    {
        let result = f();
        let (status, detail) = match &result {
            Ok(_) => ("success", serde_json::Value::Null),
            Err(e) => ("error", serde_json::json!({ "error": e.to_string() })),
        };
        self.record(op, subject, status, detail)?;
        result
    }

    pub fn read_all(&self) -> Result<Vec<JournalEvent>, FleetError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&self.path)?;
        content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).map_err(FleetError::from))
            .collect()
    }
}
